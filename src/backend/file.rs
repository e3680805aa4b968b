//! The `file` backend: flattens YAML/JSON files matching a glob under a
//! directory into a key-value store (spec §4.2, "File").

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use globset::Glob;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::backend::flatten::flatten_yaml;
use crate::backend::{Backend, KeyStore};
use crate::errors::{ConfrError, Result};

pub struct FileBackend {
    root: PathBuf,
    filter: String,
}

impl FileBackend {
    pub fn new(root: PathBuf, filter: String) -> Self {
        FileBackend { root, filter }
    }

    fn load_all(&self) -> Result<KeyStore> {
        let glob = Glob::new(&self.filter)
            .map_err(|e| ConfrError::ConfigError(format!("invalid file filter {:?}: {e}", self.filter)))?
            .compile_matcher();

        let mut store = KeyStore::new();
        for entry in walkdir::WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let rel = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            if !glob.is_match(rel) {
                continue;
            }
            let contents = std::fs::read_to_string(entry.path())?;
            if contents.trim().is_empty() {
                // An empty file contributes no keys rather than erroring
                // (spec §8 boundary case).
                continue;
            }
            let value: serde_yaml::Value = serde_yaml::from_str(&contents)?;
            let mut out = BTreeMap::new();
            flatten_yaml(&value, "", &mut out);
            for (k, v) in out {
                store.insert(k, v);
            }
        }
        Ok(store)
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn get_values(&self, _ctx: &CancellationToken, keys: &[String]) -> Result<KeyStore> {
        if keys.is_empty() {
            return Ok(KeyStore::new());
        }
        let mut store = self.load_all()?;
        store.retain_prefixes(keys);
        Ok(store)
    }

    async fn watch_prefix(
        &self,
        _ctx: &CancellationToken,
        _prefix: &str,
        _keys: &[String],
        wait_index: u64,
        stop: &Notify,
    ) -> Result<u64> {
        stop.notified().await;
        Ok(wait_index)
    }

    async fn health_check(&self, _ctx: &CancellationToken) -> Result<()> {
        if self.root.exists() {
            Ok(())
        } else {
            Err(ConfrError::ConfigError(format!(
                "file backend root does not exist: {}",
                self.root.display()
            )))
        }
    }

    fn supports_watch(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_get_values_flattens_nested_yaml() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("app.yaml"),
            "app:\n  name: svc\n  port: 8080\n",
        )
        .unwrap();

        let backend = FileBackend::new(dir.path().to_path_buf(), "*.yaml".to_string());
        let ctx = CancellationToken::new();
        let store = backend
            .get_values(&ctx, &["/app".to_string()])
            .await
            .unwrap();
        assert_eq!(store.get("/app/name"), Some("svc"));
        assert_eq!(store.get("/app/port"), Some("8080"));
    }

    #[tokio::test]
    async fn test_get_values_empty_keys_no_traffic() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::new(dir.path().to_path_buf(), "*.yaml".to_string());
        let ctx = CancellationToken::new();
        let store = backend.get_values(&ctx, &[]).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_empty_file_contributes_no_keys() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("empty.yaml"), "").unwrap();

        let backend = FileBackend::new(dir.path().to_path_buf(), "*.yaml".to_string());
        let ctx = CancellationToken::new();
        let store = backend
            .get_values(&ctx, &["/".to_string()])
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_filter_excludes_non_matching_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("app.yaml"), "app:\n  name: svc\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "app:\n  name: wrong\n").unwrap();

        let backend = FileBackend::new(dir.path().to_path_buf(), "*.yaml".to_string());
        let ctx = CancellationToken::new();
        let store = backend
            .get_values(&ctx, &["/app".to_string()])
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_array_values_use_numeric_segments() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("app.yaml"),
            "servers:\n  - a\n  - b\n",
        )
        .unwrap();

        let backend = FileBackend::new(dir.path().to_path_buf(), "*.yaml".to_string());
        let ctx = CancellationToken::new();
        let store = backend
            .get_values(&ctx, &["/servers".to_string()])
            .await
            .unwrap();
        assert_eq!(store.get("/servers/0"), Some("a"));
        assert_eq!(store.get("/servers/1"), Some("b"));
    }
}
