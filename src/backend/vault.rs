//! The `vault` backend: recursive KV listing over HashiCorp Vault's HTTP
//! API (spec §4.2, "Vault"), with v1/v2 KV engine auto-detection.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, KeyStore};
use crate::errors::Result;

#[derive(Debug, Deserialize)]
struct MountOptionsResponse {
    options: Option<MountOptions>,
}

#[derive(Debug, Deserialize)]
struct MountOptions {
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: ListData,
}

#[derive(Debug, Deserialize)]
struct ListData {
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ReadResponseV1 {
    data: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ReadResponseV2 {
    data: ReadDataV2,
}

#[derive(Debug, Deserialize)]
struct ReadDataV2 {
    data: BTreeMap<String, Value>,
}

pub struct VaultBackend {
    client: reqwest::Client,
    address: String,
    token: String,
    mount: String,
}

impl VaultBackend {
    pub fn new(address: String, token: String, mount: String) -> Self {
        VaultBackend {
            client: reqwest::Client::new(),
            address,
            token,
            mount,
        }
    }

    /// Detects whether `self.mount` is a KV v1 or v2 secrets engine by
    /// inspecting its mount options; defaults to v2 if undetermined, since
    /// that is Vault's current default engine version.
    async fn kv_version(&self) -> Result<u8> {
        let url = format!("{}/v1/sys/mounts/{}/tune", self.address.trim_end_matches('/'), self.mount);
        let resp = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(2);
        }
        let parsed: MountOptionsResponse = resp.json().await.unwrap_or(MountOptionsResponse { options: None });
        let version = parsed
            .options
            .and_then(|o| o.version)
            .unwrap_or_else(|| "2".to_string());
        Ok(if version == "1" { 1 } else { 2 })
    }

    fn list_url(&self, version: u8, path: &str) -> String {
        let base = self.address.trim_end_matches('/');
        let path = path.trim_matches('/');
        if version == 2 {
            format!("{base}/v1/{}/metadata/{path}", self.mount)
        } else {
            format!("{base}/v1/{}/{path}", self.mount)
        }
    }

    fn read_url(&self, version: u8, path: &str) -> String {
        let base = self.address.trim_end_matches('/');
        let path = path.trim_matches('/');
        if version == 2 {
            format!("{base}/v1/{}/data/{path}", self.mount)
        } else {
            format!("{base}/v1/{}/{path}", self.mount)
        }
    }

    async fn list(&self, version: u8, path: &str) -> Result<Vec<String>> {
        let url = self.list_url(version, path);
        let resp = self
            .client
            .request(reqwest::Method::from_bytes(b"LIST").unwrap(), &url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let parsed: ListResponse = resp.error_for_status()?.json().await?;
        Ok(parsed.data.keys)
    }

    async fn read_secret(&self, version: u8, path: &str) -> Result<BTreeMap<String, Value>> {
        let url = self.read_url(version, path);
        let resp = self
            .client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(BTreeMap::new());
        }
        let resp = resp.error_for_status()?;
        if version == 2 {
            let parsed: ReadResponseV2 = resp.json().await?;
            Ok(parsed.data.data)
        } else {
            let parsed: ReadResponseV1 = resp.json().await?;
            Ok(parsed.data)
        }
    }

    /// Recursively walks `path`, flattening every secret found beneath it
    /// into `/path/to/secret/field = value` entries. Vault's literal JSON
    /// `null` becomes the string `"null"` (spec §8 boundary case).
    async fn walk(&self, version: u8, path: &str, out: &mut KeyStore) -> Result<()> {
        let keys = self.list(version, path).await?;
        if keys.is_empty() {
            // leaf: try reading it as a secret directly
            let fields = self.read_secret(version, path).await?;
            for (field, value) in fields {
                let s = match value {
                    Value::Null => "null".to_string(),
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                out.insert(format!("/{}/{field}", path.trim_matches('/')), s);
            }
            return Ok(());
        }
        for key in keys {
            if let Some(dir) = key.strip_suffix('/') {
                let child = format!("{}/{}", path.trim_matches('/'), dir);
                Box::pin(self.walk(version, &child, out)).await?;
            } else {
                let child = format!("{}/{}", path.trim_matches('/'), key);
                let fields = self.read_secret(version, &child).await?;
                for (field, value) in fields {
                    let s = match value {
                        Value::Null => "null".to_string(),
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    out.insert(format!("/{}/{field}", child.trim_matches('/')), s);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for VaultBackend {
    async fn get_values(&self, _ctx: &CancellationToken, keys: &[String]) -> Result<KeyStore> {
        if keys.is_empty() {
            return Ok(KeyStore::new());
        }
        let version = self.kv_version().await?;
        let mut store = KeyStore::new();
        for prefix in keys {
            self.walk(version, prefix, &mut store).await?;
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
        let url = format!("{}/v1/sys/health", self.address.trim_end_matches('/'));
        self.client.get(&url).send().await?;
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
    fn test_list_url_v2_uses_metadata_segment() {
        let backend = VaultBackend::new("http://vault:8200".into(), "tok".into(), "secret".into());
        assert_eq!(
            backend.list_url(2, "/app"),
            "http://vault:8200/v1/secret/metadata/app"
        );
    }

    #[test]
    fn test_read_url_v1_has_no_data_segment() {
        let backend = VaultBackend::new("http://vault:8200".into(), "tok".into(), "secret".into());
        assert_eq!(backend.read_url(1, "/app"), "http://vault:8200/v1/secret/app");
    }
}
