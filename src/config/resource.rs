//! Template resource declarations: the `[template]`/`[backend]` TOML files
//! under `<confdir>/conf.d/*.toml` (spec §3, §6).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::config::backend::{BackendConfig, BackendSection};
use crate::errors::{ConfrError, Result};

/// An octal file permission, parsed once at load time so invalid strings are
/// a configuration error (spec §3 invariant) rather than a render-time one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(pub u32);

impl Default for FileMode {
    fn default() -> Self {
        FileMode(0o644)
    }
}

impl FileMode {
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim_start_matches("0o");
        u32::from_str_radix(trimmed, 8)
            .map(FileMode)
            .map_err(|_| ConfrError::ConfigError(format!("invalid file mode: {s:?}")))
    }
}

/// The on-disk shape of a resource file: `[template]` plus an optional
/// `[backend]` override (spec §6).
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceFile {
    pub template: TemplateSection,
    #[serde(default)]
    pub backend: BackendSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSection {
    pub src: String,
    pub dest: PathBuf,
    #[serde(default)]
    pub keys: Vec<String>,
    pub mode: Option<String>,
    pub prefix: Option<String>,
    pub check_cmd: Option<String>,
    pub reload_cmd: Option<String>,
    pub check_cmd_timeout: Option<String>,
    pub reload_cmd_timeout: Option<String>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// A fully-resolved, validated template resource (spec §3). Constructed once
/// per configuration scan; destroyed and reconstructed wholesale on SIGHUP,
/// never mutated in place.
#[derive(Debug, Clone)]
pub struct TemplateResource {
    pub name: String,
    pub src: PathBuf,
    pub dest: PathBuf,
    pub keys: Vec<String>,
    pub mode: FileMode,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub prefix: Option<String>,
    pub check_cmd: Option<String>,
    pub reload_cmd: Option<String>,
    pub check_cmd_timeout: Option<Duration>,
    pub reload_cmd_timeout: Option<Duration>,
    pub backend_override: Option<BackendConfig>,
}

impl TemplateResource {
    pub fn from_file(name: String, file: ResourceFile) -> Result<Self> {
        let t = file.template;
        if t.src.is_empty() {
            return Err(ConfrError::ConfigError(format!(
                "resource {name}: `src` must not be empty"
            )));
        }
        let dest = t.dest;
        if dest.as_os_str().is_empty() {
            return Err(ConfrError::ConfigError(format!(
                "resource {name}: `dest` must not be empty"
            )));
        }

        let mode = match t.mode {
            Some(m) => FileMode::parse(&m)?,
            None => FileMode::default(),
        };

        let check_cmd_timeout = t
            .check_cmd_timeout
            .as_deref()
            .map(crate::cli::parse_duration)
            .transpose()
            .map_err(ConfrError::ConfigError)?;
        let reload_cmd_timeout = t
            .reload_cmd_timeout
            .as_deref()
            .map(crate::cli::parse_duration)
            .transpose()
            .map_err(ConfrError::ConfigError)?;

        let backend_override = file.backend.resolve()?;

        Ok(TemplateResource {
            name,
            src: PathBuf::from(t.src),
            dest,
            keys: normalize_keys(t.keys),
            mode,
            uid: t.uid,
            gid: t.gid,
            prefix: t.prefix,
            check_cmd: t.check_cmd,
            reload_cmd: t.reload_cmd,
            check_cmd_timeout,
            reload_cmd_timeout,
            backend_override,
        })
    }

    /// The keys actually sent to the backend: each declared key with the
    /// resource's `prefix` prepended, if any (spec §3, §4.7 step 2).
    pub fn effective_keys(&self) -> Vec<String> {
        match &self.prefix {
            Some(prefix) => self
                .keys
                .iter()
                .map(|k| format!("{}{}", prefix.trim_end_matches('/'), k))
                .collect(),
            None => self.keys.clone(),
        }
    }
}

/// Drop a trailing `/*` or `/` from a key prefix for matching purposes
/// (spec §4.7 step 2, §4.2 file-backend normalisation rule).
pub fn normalize_key(key: &str) -> String {
    if let Some(stripped) = key.strip_suffix("/*") {
        stripped.to_string()
    } else if key.len() > 1 {
        key.trim_end_matches('/').to_string()
    } else {
        key.to_string()
    }
}

fn normalize_keys(keys: Vec<String>) -> Vec<String> {
    keys.iter().map(|k| normalize_key(k)).collect()
}

/// Scan `<confdir>/conf.d/*.toml`, returning resources in lexical order of
/// configuration file name (spec §4.8, "Onetime": "lexical order of
/// configuration file name").
pub fn scan_resources(confdir: &Path) -> Result<Vec<TemplateResource>> {
    let conf_d = confdir.join("conf.d");
    if !conf_d.exists() {
        return Ok(Vec::new());
    }

    let mut paths: Vec<PathBuf> = walkdir::WalkDir::new(&conf_d)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("toml"))
        .map(|e| e.path().to_path_buf())
        .collect();
    paths.sort();

    let mut resources = Vec::with_capacity(paths.len());
    for path in paths {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        let contents = std::fs::read_to_string(&path)?;
        let file: ResourceFile = toml::from_str(&contents)?;
        resources.push(TemplateResource::from_file(name, file)?);
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_file_mode_parse() {
        assert_eq!(FileMode::parse("0644").unwrap().0, 0o644);
        assert_eq!(FileMode::parse("0600").unwrap().0, 0o600);
    }

    #[test]
    fn test_file_mode_invalid() {
        assert!(FileMode::parse("not-octal").is_err());
    }

    #[test]
    fn test_normalize_key_star_suffix() {
        assert_eq!(normalize_key("/app/*"), "/app");
    }

    #[test]
    fn test_normalize_key_trailing_slash() {
        assert_eq!(normalize_key("/app/"), "/app");
    }

    #[test]
    fn test_normalize_key_root() {
        assert_eq!(normalize_key("/"), "/");
    }

    #[test]
    fn test_resource_requires_src() {
        let file = ResourceFile {
            template: TemplateSection {
                src: "".into(),
                dest: PathBuf::from("/etc/out.conf"),
                keys: vec![],
                mode: None,
                prefix: None,
                check_cmd: None,
                reload_cmd: None,
                check_cmd_timeout: None,
                reload_cmd_timeout: None,
                uid: None,
                gid: None,
            },
            backend: BackendSection::default(),
        };
        assert!(TemplateResource::from_file("r".into(), file).is_err());
    }

    #[test]
    fn test_effective_keys_with_prefix() {
        let file = ResourceFile {
            template: TemplateSection {
                src: "a.tmpl".into(),
                dest: PathBuf::from("/etc/out.conf"),
                keys: vec!["/name".into()],
                mode: None,
                prefix: Some("/app".into()),
                check_cmd: None,
                reload_cmd: None,
                check_cmd_timeout: None,
                reload_cmd_timeout: None,
                uid: None,
                gid: None,
            },
            backend: BackendSection::default(),
        };
        let res = TemplateResource::from_file("r".into(), file).unwrap();
        assert_eq!(res.effective_keys(), vec!["/app/name".to_string()]);
    }

    #[test]
    fn test_scan_resources_lexical_order() {
        let dir = TempDir::new().unwrap();
        let conf_d = dir.path().join("conf.d");
        fs::create_dir(&conf_d).unwrap();
        fs::write(
            conf_d.join("b.toml"),
            r#"[template]
src = "b.tmpl"
dest = "/etc/b.conf"
"#,
        )
        .unwrap();
        fs::write(
            conf_d.join("a.toml"),
            r#"[template]
src = "a.tmpl"
dest = "/etc/a.conf"
"#,
        )
        .unwrap();

        let resources = scan_resources(dir.path()).unwrap();
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].name, "a");
        assert_eq!(resources[1].name, "b");
    }

    #[test]
    fn test_scan_resources_missing_confdir_is_empty() {
        let dir = TempDir::new().unwrap();
        let resources = scan_resources(dir.path()).unwrap();
        assert!(resources.is_empty());
    }
}
