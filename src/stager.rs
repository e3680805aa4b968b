//! The stager (spec §4.6): stages a render's output buffer into a temp
//! file beside `dest`, validates it with an optional check command,
//! atomically commits it, then runs an optional reload command. No direct
//! teacher analogue exists (the teacher writes to a warehouse, not a
//! filesystem path); built from spec §4.6's explicit six-step algorithm
//! using the teacher's existing `tempfile` dependency for the scoped temp
//! file and `tokio::process::Command` (already pulled in via `tokio`'s
//! `full` feature) for check/reload command execution.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::TemplateResource;
use crate::errors::{ConfrError, Result};

/// The outcome of staging one render (spec §4.7: `{Unchanged | Updated |
/// Failed(kind, cause)}`, staging half of the pair).
#[derive(Debug)]
pub enum StageOutcome {
    /// The rendered bytes were byte-identical to the current `dest`; no
    /// check/reload command ran (spec §4.6 step 2, §8 idempotence).
    Unchanged,
    /// `dest` was replaced with the rendered bytes. `reload_failed` carries
    /// a reload-command error that does not roll back the commit (spec §7,
    /// "Reload-cmd failure... does not roll back").
    Updated { reload_failed: Option<ConfrError> },
}

/// Owns a temp file's cleanup on every exit path (spec §9, "Temp-file
/// ownership"): a failing check command or an early return still unlinks
/// it unless [`StagedTemp::commit`] has taken the path out.
struct StagedTemp {
    path: Option<PathBuf>,
}

impl StagedTemp {
    fn new(path: PathBuf) -> Self {
        StagedTemp { path: Some(path) }
    }

    fn path(&self) -> &Path {
        self.path.as_deref().expect("StagedTemp used after commit")
    }

    /// Takes ownership of the path so `Drop` no longer unlinks it (used
    /// right before the atomic rename, spec §4.6 step 5).
    fn commit(mut self) -> PathBuf {
        self.path.take().expect("StagedTemp used after commit")
    }
}

impl Drop for StagedTemp {
    fn drop(&mut self) {
        if let Some(path) = &self.path {
            if let Err(err) = std::fs::remove_file(path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to clean up staged temp file");
                }
            }
        }
    }
}

/// Stages `output` for `resource`, running check/reload commands as
/// configured and committing via atomic rename (spec §4.6).
pub async fn stage(
    resource: &TemplateResource,
    output: &[u8],
    check_timeout: Option<Duration>,
    reload_timeout: Option<Duration>,
) -> Result<StageOutcome> {
    let dest_dir = resource.dest.parent().ok_or_else(|| {
        ConfrError::ConfigError(format!("resource {}: dest has no parent directory", resource.name))
    })?;
    std::fs::create_dir_all(dest_dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".confr-")
        .tempfile_in(dest_dir)?;
    tmp.write_all(output)?;
    tmp.flush()?;
    let tmp_path = tmp
        .into_temp_path()
        .keep()
        .map_err(|e| ConfrError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    let staged = StagedTemp::new(tmp_path);

    if bytes_identical_to_dest(&resource.dest, output) {
        debug!(resource = %resource.name, dest = %resource.dest.display(), "staged output unchanged, skipping commit");
        return Ok(StageOutcome::Unchanged);
    }

    apply_mode_and_ownership(staged.path(), resource)?;

    if let Some(check_cmd) = &resource.check_cmd {
        let substituted = check_cmd.replace("{{.src}}", &staged.path().to_string_lossy());
        run_command(&substituted, check_timeout).await.map_err(|cause| ConfrError::CheckError {
            resource: resource.name.clone(),
            cause: cause.to_string(),
        })?;
    }

    let tmp_path = staged.commit();
    std::fs::rename(&tmp_path, &resource.dest)?;
    debug!(resource = %resource.name, dest = %resource.dest.display(), "committed staged file");

    let reload_failed = if let Some(reload_cmd) = &resource.reload_cmd {
        match run_command(reload_cmd, reload_timeout).await {
            Ok(()) => None,
            Err(cause) => {
                let err = ConfrError::ReloadError { resource: resource.name.clone(), cause: cause.to_string() };
                warn!(resource = %resource.name, error = %err, "reload command failed, dest already committed");
                Some(err)
            }
        }
    } else {
        None
    };

    Ok(StageOutcome::Updated { reload_failed })
}

fn bytes_identical_to_dest(dest: &Path, candidate: &[u8]) -> bool {
    match std::fs::read(dest) {
        Ok(existing) => existing == candidate,
        Err(_) => false,
    }
}

fn apply_mode_and_ownership(path: &Path, resource: &TemplateResource) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(resource.mode.0))?;

    if resource.uid.is_some() || resource.gid.is_some() {
        let uid = resource.uid.map(nix::unistd::Uid::from_raw);
        let gid = resource.gid.map(nix::unistd::Gid::from_raw);
        nix::unistd::chown(path, uid, gid)
            .map_err(|e| ConfrError::ConfigError(format!("chown {}: {e}", path.display())))?;
    }
    Ok(())
}

/// Runs `cmd` under a shell with the effective timeout, killing the
/// subprocess on expiry (spec §4.6 steps 4/6, §5 "Cancellation & timeouts").
async fn run_command(cmd: &str, timeout: Option<Duration>) -> Result<()> {
    let mut command = tokio::process::Command::new("sh");
    command.arg("-c").arg(cmd);
    command.kill_on_drop(true);

    let run = command.status();
    let status = match timeout {
        Some(duration) => tokio::time::timeout(duration, run)
            .await
            .map_err(|_| ConfrError::Timeout(duration))??,
        None => run.await?,
    };

    if status.success() {
        Ok(())
    } else {
        Err(ConfrError::ConfigError(format!(
            "command exited with status {status}: {cmd}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::resource::FileMode;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn resource(dir: &TempDir) -> TemplateResource {
        TemplateResource {
            name: "r".into(),
            src: PathBuf::from("r.tmpl"),
            dest: dir.path().join("out.conf"),
            keys: vec![],
            mode: FileMode::default(),
            uid: None,
            gid: None,
            prefix: None,
            check_cmd: None,
            reload_cmd: None,
            check_cmd_timeout: None,
            reload_cmd_timeout: None,
            backend_override: None,
        }
    }

    #[tokio::test]
    async fn test_stage_writes_new_dest() {
        let dir = TempDir::new().unwrap();
        let res = resource(&dir);
        let outcome = stage(&res, b"hello\n", None, None).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Updated { reload_failed: None }));
        assert_eq!(std::fs::read(&res.dest).unwrap(), b"hello\n");
    }

    #[tokio::test]
    async fn test_stage_unchanged_skips_commit() {
        let dir = TempDir::new().unwrap();
        let res = resource(&dir);
        std::fs::write(&res.dest, b"hello\n").unwrap();
        let outcome = stage(&res, b"hello\n", None, None).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Unchanged));
    }

    #[tokio::test]
    async fn test_stage_applies_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let mut res = resource(&dir);
        res.mode = FileMode::parse("0600").unwrap();
        stage(&res, b"x", None, None).await.unwrap();
        let perms = std::fs::metadata(&res.dest).unwrap().permissions();
        assert_eq!(perms.mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_failing_check_cmd_leaves_dest_untouched() {
        let dir = TempDir::new().unwrap();
        let mut res = resource(&dir);
        res.check_cmd = Some("exit 1".to_string());
        let result = stage(&res, b"x", None, None).await;
        assert!(result.is_err());
        assert!(!res.dest.exists());
    }

    #[tokio::test]
    async fn test_check_cmd_timeout_kills_command() {
        let dir = TempDir::new().unwrap();
        let mut res = resource(&dir);
        res.check_cmd = Some("sleep 10".to_string());
        let start = std::time::Instant::now();
        let result = stage(&res, b"x", Some(Duration::from_millis(200)), None).await;
        assert!(result.is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!res.dest.exists());
    }

    #[tokio::test]
    async fn test_reload_failure_does_not_roll_back_dest() {
        let dir = TempDir::new().unwrap();
        let mut res = resource(&dir);
        res.reload_cmd = Some("exit 1".to_string());
        let outcome = stage(&res, b"committed\n", None, None).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Updated { reload_failed: Some(_) }));
        assert_eq!(std::fs::read(&res.dest).unwrap(), b"committed\n");
    }

    #[tokio::test]
    async fn test_check_cmd_substitutes_src_placeholder() {
        let dir = TempDir::new().unwrap();
        let mut res = resource(&dir);
        res.check_cmd = Some("test -f {{.src}}".to_string());
        let outcome = stage(&res, b"x", None, None).await.unwrap();
        assert!(matches!(outcome, StageOutcome::Updated { .. }));
    }
}
