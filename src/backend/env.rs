//! The `env` backend: process environment variables as a key-value store
//! (spec §4.2, "Env": "convert each process environment variable by
//! replacing `_` with `/` and lower-casing, prepending `/`").

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, KeyStore};
use crate::errors::Result;

pub struct EnvBackend;

impl EnvBackend {
    pub fn new() -> Self {
        EnvBackend
    }

    /// `APP_NAME` -> `/app/name` (spec §4.2, §8 scenario 1).
    fn env_key(name: &str) -> String {
        format!("/{}", name.to_lowercase().replace('_', "/"))
    }

    fn load_all() -> KeyStore {
        let mut store = KeyStore::new();
        for (name, value) in std::env::vars() {
            store.insert(Self::env_key(&name), value);
        }
        store
    }
}

impl Default for EnvBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for EnvBackend {
    async fn get_values(&self, _ctx: &CancellationToken, keys: &[String]) -> Result<KeyStore> {
        if keys.is_empty() {
            return Ok(KeyStore::new());
        }
        let mut store = Self::load_all();
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
        // env has no native change notifications: block until the caller
        // signals stop, as spec §4.2 requires for poll-only backends.
        stop.notified().await;
        Ok(wait_index)
    }

    async fn health_check(&self, _ctx: &CancellationToken) -> Result<()> {
        Ok(())
    }

    fn supports_watch(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_env_key_transform() {
        assert_eq!(EnvBackend::env_key("APP_NAME"), "/app/name");
    }

    #[tokio::test]
    async fn test_get_values_empty_keys_no_traffic() {
        let backend = EnvBackend::new();
        let ctx = CancellationToken::new();
        let store = backend.get_values(&ctx, &[]).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_get_values_filters_by_prefix() {
        unsafe {
            std::env::set_var("CONFR_TEST_APP_NAME", "svc");
        }
        let backend = EnvBackend::new();
        let ctx = CancellationToken::new();
        let store = backend
            .get_values(&ctx, &["/confr/test/app".to_string()])
            .await
            .unwrap();
        assert_eq!(store.get("/confr/test/app/name"), Some("svc"));
        unsafe {
            std::env::remove_var("CONFR_TEST_APP_NAME");
        }
    }
}
