//! The backend contract (spec §4.2): a uniform key-value fetch/watch
//! interface implemented by every concrete backend, dispatched through a
//! closed variant (spec §9, "Variant over backends") the same way the
//! teacher dispatches writers through [`crate::config::backend::BackendConfig`]
//! and one trait.

pub mod acm;
pub mod consul;
pub mod env;
pub mod etcd;
pub mod etcd_watch;
pub mod file;
pub mod flatten;
pub mod mock;
pub mod secretsmanager;
pub mod ssm;
pub mod vault;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::backend::BackendConfig;
use crate::errors::Result;

/// The mapping from absolute string key to string value produced by a
/// backend's `GetValues` call (spec §3, "Key store").
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyStore(pub BTreeMap<String, String>);

impl KeyStore {
    pub fn new() -> Self {
        KeyStore(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn extend(&mut self, other: KeyStore) {
        self.0.extend(other.0);
    }

    /// Keeps only entries whose key has any of `prefixes` as a string
    /// prefix (spec §4.7 step 4 — mandatory even for backends that already
    /// filter, since range-scan backends like etcd may return adjacent keys).
    pub fn retain_prefixes(&mut self, prefixes: &[String]) {
        self.0
            .retain(|key, _| prefixes.iter().any(|p| key.starts_with(p.as_str())));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// Every backend exposes this capability set (spec §4.2).
#[async_trait]
pub trait Backend: Send + Sync {
    /// Returns the union of all key-value pairs whose key has any element
    /// of `keys` as a string prefix. Empty `keys` returns an empty mapping
    /// with no backend traffic (spec §4.2, §8 boundary case).
    async fn get_values(&self, ctx: &CancellationToken, keys: &[String]) -> Result<KeyStore>;

    /// Blocks until a change affecting any of `keys` is observed after
    /// `wait_index`, `stop` is notified, or `ctx` is cancelled (spec §4.2).
    /// Backends that don't natively support this return an error from
    /// [`Backend::supports_watch`] at configuration time instead of being
    /// called here.
    async fn watch_prefix(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
        keys: &[String],
        wait_index: u64,
        stop: &Notify,
    ) -> Result<u64>;

    /// Cheap connectivity probe (spec §4.2).
    async fn health_check(&self, ctx: &CancellationToken) -> Result<()>;

    /// Whether this backend natively supports [`Backend::watch_prefix`].
    fn supports_watch(&self) -> bool {
        false
    }

    /// Releases any held resources (spec §4.2: "backends without resources
    /// return nil"). Connection-pooling backends (etcd, Vault, Consul) can
    /// override this; the stateless ones inherit the no-op default.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Builds the concrete backend client for a resolved [`BackendConfig`].
pub async fn build(config: &BackendConfig) -> Result<Box<dyn Backend>> {
    let backend: Box<dyn Backend> = match config {
        BackendConfig::Env => Box::new(env::EnvBackend::new()),
        BackendConfig::File { path, filter } => {
            Box::new(file::FileBackend::new(path.clone(), filter.clone()))
        }
        BackendConfig::Etcd { nodes } => Box::new(etcd::EtcdBackend::connect(nodes).await?),
        BackendConfig::Consul { address } => Box::new(consul::ConsulBackend::new(address.clone())),
        BackendConfig::Vault {
            address,
            token,
            mount,
        } => Box::new(vault::VaultBackend::new(
            address.clone(),
            token.clone(),
            mount.clone(),
        )),
        BackendConfig::Ssm => Box::new(ssm::SsmBackend::new().await?),
        BackendConfig::SecretsManager => {
            Box::new(secretsmanager::SecretsManagerBackend::new().await?)
        }
        BackendConfig::Acm => Box::new(acm::AcmBackend::new().await?),
    };
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retain_prefixes_keeps_matching() {
        let mut store = KeyStore::new();
        store.insert("/app/name", "svc");
        store.insert("/app/port", "8080");
        store.insert("/other", "x");

        store.retain_prefixes(&["/app".to_string()]);

        assert_eq!(store.len(), 2);
        assert!(store.contains_key("/app/name"));
        assert!(!store.contains_key("/other"));
    }

    #[test]
    fn test_retain_prefixes_includes_exact_match() {
        let mut store = KeyStore::new();
        store.insert("/app", "root-value");
        store.retain_prefixes(&["/app".to_string()]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_empty_keystore_is_empty() {
        let store = KeyStore::new();
        assert!(store.is_empty());
    }
}
