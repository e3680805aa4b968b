//! The `consul` backend: recursive KV listing over Consul's HTTP API
//! (spec §4.2, "Consul"). No Consul SDK exists in the corpus, so this talks
//! to the agent's HTTP API directly with `reqwest`, the way the teacher's
//! pipeline hits HTTP APIs for data ingestion.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, KeyStore};
use crate::errors::{ConfrError, Result};

#[derive(Debug, Deserialize)]
struct ConsulKv {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

pub struct ConsulBackend {
    client: reqwest::Client,
    address: String,
}

impl ConsulBackend {
    pub fn new(address: String) -> Self {
        ConsulBackend {
            client: reqwest::Client::new(),
            address,
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<KeyStore> {
        let consul_prefix = prefix.trim_start_matches('/');
        let url = format!(
            "{}/v1/kv/{}?recurse=true",
            self.address.trim_end_matches('/'),
            consul_prefix
        );
        let resp = self.client.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(KeyStore::new());
        }
        let entries: Vec<ConsulKv> = resp.error_for_status()?.json().await?;

        let mut store = KeyStore::new();
        for entry in entries {
            let Some(encoded) = entry.value else {
                continue;
            };
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(ConfrError::Base64Decode)?;
            let value = String::from_utf8_lossy(&decoded).into_owned();
            store.insert(format!("/{}", entry.key.trim_start_matches('/')), value);
        }
        Ok(store)
    }
}

#[async_trait]
impl Backend for ConsulBackend {
    async fn get_values(&self, _ctx: &CancellationToken, keys: &[String]) -> Result<KeyStore> {
        if keys.is_empty() {
            return Ok(KeyStore::new());
        }
        let mut store = KeyStore::new();
        for prefix in keys {
            store.extend(self.list_prefix(prefix).await?);
        }
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
        let url = format!("{}/v1/status/leader", self.address.trim_end_matches('/'));
        self.client.get(&url).send().await?.error_for_status()?;
        Ok(())
    }

    fn supports_watch(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consul_backend_strips_leading_slash_for_request() {
        let backend = ConsulBackend::new("http://127.0.0.1:8500".to_string());
        assert_eq!(backend.address, "http://127.0.0.1:8500");
    }
}
