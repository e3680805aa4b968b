//! The `secretsmanager` backend: AWS Secrets Manager (spec §4.2,
//! "SecretsManager"). JSON-object secrets are flattened under their secret
//! name; binary secrets are base64-encoded (spec §4.2).

use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::backend::flatten::flatten;
use crate::backend::{Backend, KeyStore};
use crate::errors::{ConfrError, Result};

pub struct SecretsManagerBackend {
    client: aws_sdk_secretsmanager::Client,
}

impl SecretsManagerBackend {
    pub async fn new() -> Result<Self> {
        let shared_config = aws_config::load_from_env().await;
        Ok(SecretsManagerBackend {
            client: aws_sdk_secretsmanager::Client::new(&shared_config),
        })
    }

    /// Fetches `key` by trying a direct secret-name match first; if that
    /// misses, walks up the path's parent segments looking for a secret
    /// whose value is a JSON object containing the residual path as a field
    /// (spec §4.2, "Secrets Manager": "If missing and flattening enabled,
    /// walk parent path segments ... extract the residual path component";
    /// spec §8 scenario 8). A plain string secret is stored as-is under the
    /// matched key; a JSON object secret has each field flattened beneath
    /// the matched key the same way the file backend flattens nested YAML;
    /// binary payloads are base64-encoded.
    async fn fetch_one(&self, key: &str) -> Result<KeyStore> {
        if let Some(store) = self.fetch_secret(key, key).await? {
            return Ok(store);
        }

        // Walk parent segments: /database/host -> try "/database" and
        // extract the residual "host" field from its JSON object value.
        let trimmed = key.trim_start_matches('/');
        let segments: Vec<&str> = trimmed.split('/').collect();
        for split_at in (1..segments.len()).rev() {
            let parent = format!("/{}", segments[..split_at].join("/"));
            let residual = segments[split_at..].join("/");
            if let Some(store) = self.fetch_residual(&parent, &residual, key).await? {
                return Ok(store);
            }
        }

        Ok(KeyStore::new())
    }

    /// Direct fetch of `secret_name`; stores the result under `store_key`.
    /// Returns `Ok(None)` on a clean "not found" so the caller can try a
    /// parent segment instead of treating it as a hard error.
    async fn fetch_secret(&self, secret_name: &str, store_key: &str) -> Result<Option<KeyStore>> {
        let resp = match self
            .client
            .get_secret_value()
            .secret_id(secret_name.trim_start_matches('/'))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                if is_not_found(&err) {
                    return Ok(None);
                }
                return Err(ConfrError::TransportError(format!(
                    "secretsmanager get_secret_value: {err}"
                )));
            }
        };

        let mut store = KeyStore::new();
        if let Some(secret_string) = resp.secret_string() {
            match serde_json::from_str::<Value>(secret_string) {
                Ok(value @ Value::Object(_)) => {
                    let mut out = std::collections::BTreeMap::new();
                    flatten(&value, store_key, &mut out);
                    for (k, v) in out {
                        store.insert(k, v);
                    }
                }
                _ => store.insert(store_key.to_string(), secret_string.to_string()),
            }
        } else if let Some(blob) = resp.secret_binary() {
            let encoded = base64::engine::general_purpose::STANDARD.encode(blob.as_ref());
            store.insert(store_key.to_string(), encoded);
        }
        Ok(Some(store))
    }

    /// Fetches `parent` and, if its value is a JSON object, extracts the
    /// `residual` field path (dot-free, single remaining segment or deeper)
    /// and stores it under `requested_key`. Returns `Ok(None)` if `parent`
    /// doesn't exist or isn't a JSON object, so the caller can keep walking
    /// up shorter parent prefixes.
    async fn fetch_residual(&self, parent: &str, residual: &str, requested_key: &str) -> Result<Option<KeyStore>> {
        let resp = match self
            .client
            .get_secret_value()
            .secret_id(parent.trim_start_matches('/'))
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(err) => {
                if is_not_found(&err) {
                    return Ok(None);
                }
                return Err(ConfrError::TransportError(format!(
                    "secretsmanager get_secret_value: {err}"
                )));
            }
        };

        let Some(secret_string) = resp.secret_string() else {
            return Ok(None);
        };
        let Ok(Value::Object(map)) = serde_json::from_str::<Value>(secret_string) else {
            return Ok(None);
        };

        let Some(field) = map.get(residual) else {
            return Ok(None);
        };
        let mut store = KeyStore::new();
        let s = match field {
            Value::Null => "null".to_string(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        store.insert(requested_key.to_string(), s);
        Ok(Some(store))
    }
}

fn is_not_found<E>(
    err: &aws_sdk_secretsmanager::error::SdkError<
        aws_sdk_secretsmanager::operation::get_secret_value::GetSecretValueError,
        E,
    >,
) -> bool {
    use aws_sdk_secretsmanager::operation::get_secret_value::GetSecretValueError;
    matches!(
        err.as_service_error(),
        Some(GetSecretValueError::ResourceNotFoundException(_))
    )
}

#[async_trait]
impl Backend for SecretsManagerBackend {
    async fn get_values(&self, _ctx: &CancellationToken, keys: &[String]) -> Result<KeyStore> {
        if keys.is_empty() {
            return Ok(KeyStore::new());
        }
        let mut store = KeyStore::new();
        for key in keys {
            store.extend(self.fetch_one(key).await?);
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
        self.client
            .list_secrets()
            .max_results(1)
            .send()
            .await
            .map_err(|e| ConfrError::TransportError(format!("secretsmanager health check: {e}")))?;
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
    fn test_flatten_json_secret_under_key() {
        let value: Value = serde_json::from_str(r#"{"user":"a","pass":"b"}"#).unwrap();
        let mut out = std::collections::BTreeMap::new();
        flatten(&value, "/db/creds", &mut out);
        assert_eq!(out.get("/db/creds/user"), Some(&"a".to_string()));
        assert_eq!(out.get("/db/creds/pass"), Some(&"b".to_string()));
    }
}
