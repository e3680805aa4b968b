//! The renderer (spec §4.5): parses a resource's template, evaluates it
//! against a [`KeyStore`] with the full context-function table, and
//! enforces the include-graph's cycle and depth bounds. Grounded on the
//! teacher's two-step `build_env_with_captures` / `render_one` render
//! (`config/templating.rs`), generalized from a fixed `sink`/`use_source`
//! pair to confd's full function table and a real include mechanism the
//! teacher's templates never needed.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use minijinja::value::Value;
use minijinja::{Environment, Error, ErrorKind, State};

use crate::backend::KeyStore;
use crate::config::TemplateResource;
use crate::errors::{ConfrError, Result};
use crate::template::context::{self, StoreObject};

/// Maximum include depth, counting `include()` frames rather than function
/// calls (spec §4.5, "Maximum depth = 10").
const MAX_INCLUDE_DEPTH: usize = 10;

struct CachedSource {
    mtime: SystemTime,
    source: String,
}

/// Caches template source text keyed by `(path, mtime)` (spec §4.5); a
/// SIGHUP clears it wholesale so edits take effect without a restart
/// (spec §9, "SIGHUP vs. config reload").
#[derive(Default)]
pub struct TemplateCache {
    entries: Mutex<HashMap<PathBuf, CachedSource>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        TemplateCache::default()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    /// Returns the template source plus whether it was served from cache
    /// (spec §4.8, `confd_template_cache_hits_total`).
    fn load(&self, path: &Path) -> std::io::Result<(String, bool)> {
        let mtime = fs::metadata(path)?.modified()?;

        let mut entries = self.entries.lock().unwrap();
        if let Some(cached) = entries.get(path) {
            if cached.mtime == mtime {
                return Ok((cached.source.clone(), true));
            }
        }

        let source = fs::read_to_string(path)?;
        entries.insert(path.to_path_buf(), CachedSource { mtime, source: source.clone() });
        Ok((source, false))
    }
}

/// Pushes `path` onto the per-render include stack, failing on a cycle or
/// exceeded depth (spec §4.5 invariants). The caller must pop exactly once
/// for every `Ok` return, regardless of what happens afterwards.
fn enter_include(stack: &Mutex<Vec<PathBuf>>, path: PathBuf) -> std::result::Result<(), Error> {
    let mut guard = stack.lock().unwrap();
    if guard.contains(&path) {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("include cycle detected: {}", path.display()),
        ));
    }
    if guard.len() >= MAX_INCLUDE_DEPTH {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("include depth exceeded (max {MAX_INCLUDE_DEPTH}) at {}", path.display()),
        ));
    }
    guard.push(path);
    Ok(())
}

/// Translates a minijinja error from a render into the right [`ConfrError`]
/// variant, distinguishing include-cycle/include-depth failures from
/// ordinary render errors so the run loop's failure classification (spec
/// §7) doesn't need to string-match.
fn classify(template: &str, err: Error) -> ConfrError {
    let message = err.to_string();
    if message.contains("include cycle detected") {
        ConfrError::IncludeCycle(message)
    } else if message.contains("include depth exceeded") {
        ConfrError::IncludeDepth { path: template.to_string(), max: MAX_INCLUDE_DEPTH }
    } else {
        ConfrError::RenderError { template: template.to_string(), message }
    }
}

/// Renders templates against a [`KeyStore`] (spec §4.4, §4.5).
pub struct Renderer {
    templates_dir: PathBuf,
    cache: Arc<TemplateCache>,
    health: Option<crate::health::HealthState>,
}

impl Renderer {
    pub fn new(templates_dir: PathBuf) -> Self {
        Renderer { templates_dir, cache: Arc::new(TemplateCache::new()), health: None }
    }

    /// Attaches the shared health/metrics state so cache hits are reflected
    /// in `confd_template_cache_hits_total` (spec §4.8).
    pub fn with_health(mut self, health: crate::health::HealthState) -> Self {
        self.health = Some(health);
        self
    }

    /// Clears the template cache (spec §4.5, §9).
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Renders `resource.src` against `store`, producing the output buffer
    /// the stager writes to a temp file. Any render error aborts the
    /// resource: no staged file is produced (spec §4.5 step 5).
    pub fn render(&self, resource: &TemplateResource, store: KeyStore) -> Result<Vec<u8>> {
        let name = resource.src.to_string_lossy().into_owned();
        let stack = Arc::new(Mutex::new(Vec::new()));
        let mut env = self.build_env(stack.clone());
        // Bound as an environment global, not a per-render context entry, so
        // `include()`-d templates share it too: every store accessor resolves
        // it via `state.lookup("__store")`, and `State::lookup` walks globals
        // as well as the local render context.
        env.add_global("__store", Value::from_object(StoreObject(store)));

        enter_include(&stack, PathBuf::from(&name)).map_err(|e| classify(&name, e))?;
        let outcome = (|| -> std::result::Result<Vec<u8>, Error> {
            let tmpl = env.get_template(&name)?;
            Ok(tmpl.render(())?.into_bytes())
        })();
        stack.lock().unwrap().pop();

        outcome.map_err(|e| classify(&name, e))
    }

    /// Builds a fresh environment for one render: the full context-function
    /// table (spec §4.4) plus a loader backed by [`TemplateCache`] and an
    /// `include()` function that enforces the cycle/depth invariants.
    fn build_env(&self, stack: Arc<Mutex<Vec<PathBuf>>>) -> Environment<'static> {
        let mut env = Environment::new();

        env.add_function("getv", context::getv);
        env.add_function("gets", context::gets);
        env.add_function("getvs", context::getvs);
        env.add_function("exists", context::exists);
        env.add_function("getenv", context::getenv);
        env.add_function("base", context::base);
        env.add_function("dir", context::dir);
        env.add_function("split", context::split);
        env.add_function("join", context::join);
        env.add_function("toUpper", context::to_upper);
        env.add_function("toLower", context::to_lower);
        env.add_function("replace", context::replace);
        env.add_function("trimSuffix", context::trim_suffix);
        env.add_function("contains", context::contains);
        env.add_function("atoi", context::atoi);
        env.add_function("add", context::add);
        env.add_function("sub", context::sub);
        env.add_function("mul", context::mul);
        env.add_function("div", context::div);
        env.add_function("mod", context::mod_);
        env.add_function("seq", context::seq);
        env.add_function("base64Encode", context::base64_encode);
        env.add_function("base64Decode", context::base64_decode);
        env.add_function("json", context::json);
        env.add_function("jsonArray", context::json_array);
        env.add_function("lookupIP", context::lookup_ip);
        env.add_function("reverse", context::reverse);
        env.add_function("parseBool", context::parse_bool);
        env.add_function("map", context::map_fn);

        {
            let templates_dir = self.templates_dir.clone();
            let cache = self.cache.clone();
            let health = self.health.clone();
            env.set_loader(move |name| {
                let path = templates_dir.join(name);
                match cache.load(&path) {
                    Ok((source, hit)) => {
                        if hit {
                            if let Some(health) = &health {
                                health.record_cache_hit();
                            }
                        }
                        Ok(Some(source))
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(Error::new(ErrorKind::InvalidOperation, e.to_string())),
                }
            });
        }

        {
            let stack = stack.clone();
            env.add_function(
                "include",
                move |state: &State, name: String, data: Option<Value>| -> std::result::Result<Value, Error> {
                    enter_include(&stack, PathBuf::from(&name))?;
                    let outcome = (|| -> std::result::Result<Value, Error> {
                        let tmpl = state.env().get_template(&name)?;
                        let root = data.unwrap_or_else(|| {
                            Value::from_serialize(&serde_json::Value::Object(serde_json::Map::new()))
                        });
                        Ok(Value::from(tmpl.render(root)?))
                    })();
                    stack.lock().unwrap().pop();
                    outcome
                },
            );
        }

        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::resource::FileMode;
    use std::fs;
    use tempfile::TempDir;

    fn resource(src: &str) -> TemplateResource {
        TemplateResource {
            name: "r".into(),
            src: PathBuf::from(src),
            dest: PathBuf::from("/tmp/out"),
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

    #[test]
    fn test_render_simple_getv() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("app.tmpl"), "name: {{ getv(\"/app/name\") }}\n").unwrap();

        let mut store = KeyStore::new();
        store.insert("/app/name", "svc");

        let renderer = Renderer::new(dir.path().to_path_buf());
        let output = renderer.render(&resource("app.tmpl"), store).unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "name: svc\n");
    }

    #[test]
    fn test_render_missing_required_key_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("app.tmpl"), "{{ getv(\"/missing\") }}").unwrap();

        let renderer = Renderer::new(dir.path().to_path_buf());
        let result = renderer.render(&resource("app.tmpl"), KeyStore::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_render_getv_with_default() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("app.tmpl"), "{{ getv(\"/missing\", \"fallback\") }}").unwrap();

        let renderer = Renderer::new(dir.path().to_path_buf());
        let output = renderer.render(&resource("app.tmpl"), KeyStore::new()).unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "fallback");
    }

    #[test]
    fn test_include_renders_child_template() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("main.tmpl"), "{{ include(\"child.tmpl\") }}").unwrap();
        fs::write(dir.path().join("child.tmpl"), "hello").unwrap();

        let renderer = Renderer::new(dir.path().to_path_buf());
        let output = renderer.render(&resource("main.tmpl"), KeyStore::new()).unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "hello");
    }

    #[test]
    fn test_include_child_can_use_store_accessors() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("main.tmpl"), "{{ include(\"child.tmpl\") }}").unwrap();
        fs::write(dir.path().join("child.tmpl"), "name={{ getv(\"/app/name\") }}").unwrap();

        let mut store = KeyStore::new();
        store.insert("/app/name", "svc");

        let renderer = Renderer::new(dir.path().to_path_buf());
        let output = renderer.render(&resource("main.tmpl"), store).unwrap();
        assert_eq!(String::from_utf8(output).unwrap(), "name=svc");
    }

    #[test]
    fn test_include_cycle_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.tmpl"), "{{ include(\"b.tmpl\") }}").unwrap();
        fs::write(dir.path().join("b.tmpl"), "{{ include(\"a.tmpl\") }}").unwrap();
        fs::write(dir.path().join("main.tmpl"), "{{ include(\"a.tmpl\") }}").unwrap();

        let renderer = Renderer::new(dir.path().to_path_buf());
        let result = renderer.render(&resource("main.tmpl"), KeyStore::new());
        match result {
            Err(ConfrError::IncludeCycle(_)) => {}
            other => panic!("expected IncludeCycle, got {other:?}"),
        }
    }

    #[test]
    fn test_include_depth_exceeded_is_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("main.tmpl"), "{{ include(\"l0.tmpl\") }}").unwrap();
        for i in 0..11 {
            fs::write(
                dir.path().join(format!("l{i}.tmpl")),
                format!("{{{{ include(\"l{}.tmpl\") }}}}", i + 1),
            )
            .unwrap();
        }
        fs::write(dir.path().join("l11.tmpl"), "leaf").unwrap();

        let renderer = Renderer::new(dir.path().to_path_buf());
        let result = renderer.render(&resource("main.tmpl"), KeyStore::new());
        match result {
            Err(ConfrError::IncludeDepth { .. }) => {}
            other => panic!("expected IncludeDepth, got {other:?}"),
        }
    }

    #[test]
    fn test_cache_clear_forces_reread() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.tmpl");
        fs::write(&path, "v1").unwrap();

        let renderer = Renderer::new(dir.path().to_path_buf());
        let first = renderer.render(&resource("app.tmpl"), KeyStore::new()).unwrap();
        assert_eq!(String::from_utf8(first).unwrap(), "v1");

        fs::write(&path, "v2").unwrap();
        renderer.clear_cache();
        let second = renderer.render(&resource("app.tmpl"), KeyStore::new()).unwrap();
        assert_eq!(String::from_utf8(second).unwrap(), "v2");
    }

    #[test]
    fn test_second_render_records_a_cache_hit() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("app.tmpl"), "hello").unwrap();

        let health = crate::health::HealthState::new();
        let renderer = Renderer::new(dir.path().to_path_buf()).with_health(health.clone());

        renderer.render(&resource("app.tmpl"), KeyStore::new()).unwrap();
        renderer.render(&resource("app.tmpl"), KeyStore::new()).unwrap();

        assert_eq!(health.cache_hits(), 1);
    }
}
