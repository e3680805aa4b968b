//! The `ssm` backend: AWS Systems Manager Parameter Store (spec §4.2,
//! "SSM"). Uses the real `aws-sdk-ssm` client rather than hand-rolled
//! SigV4 signing (see DESIGN.md).

use async_trait::async_trait;
use aws_sdk_ssm::operation::get_parameter::GetParameterError;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, KeyStore};
use crate::errors::Result;

pub struct SsmBackend {
    client: aws_sdk_ssm::Client,
}

impl SsmBackend {
    pub async fn new() -> Result<Self> {
        let shared_config = aws_config::load_from_env().await;
        Ok(SsmBackend {
            client: aws_sdk_ssm::Client::new(&shared_config),
        })
    }

    /// Recursively fetches every parameter under `prefix`, falling back to a
    /// single `GetParameter` call for exact non-hierarchy lookups; a
    /// not-found error is suppressed to an empty result (spec §4.2).
    async fn get_path(&self, prefix: &str) -> Result<KeyStore> {
        let mut store = KeyStore::new();
        let mut next_token: Option<String> = None;
        loop {
            let mut req = self
                .client
                .get_parameters_by_path()
                .path(prefix)
                .recursive(true)
                .with_decryption(true);
            if let Some(token) = &next_token {
                req = req.next_token(token.clone());
            }
            let resp = req.send().await.map_err(|e| {
                crate::errors::ConfrError::TransportError(format!("ssm get_parameters_by_path: {e}"))
            })?;
            for param in resp.parameters() {
                if let (Some(name), Some(value)) = (param.name(), param.value()) {
                    store.insert(name.to_string(), value.to_string());
                }
            }
            next_token = resp.next_token().map(|s| s.to_string());
            if next_token.is_none() {
                break;
            }
        }

        if store.is_empty() {
            match self.client.get_parameter().name(prefix).with_decryption(true).send().await {
                Ok(resp) => {
                    if let Some(param) = resp.parameter() {
                        if let (Some(name), Some(value)) = (param.name(), param.value()) {
                            store.insert(name.to_string(), value.to_string());
                        }
                    }
                }
                Err(err) => {
                    if !is_not_found(&err) {
                        return Err(crate::errors::ConfrError::TransportError(format!(
                            "ssm get_parameter: {err}"
                        )));
                    }
                }
            }
        }

        Ok(store)
    }
}

fn is_not_found<E>(err: &aws_sdk_ssm::error::SdkError<GetParameterError, E>) -> bool {
    matches!(
        err.as_service_error(),
        Some(GetParameterError::ParameterNotFound(_))
    )
}

#[async_trait]
impl Backend for SsmBackend {
    async fn get_values(&self, _ctx: &CancellationToken, keys: &[String]) -> Result<KeyStore> {
        if keys.is_empty() {
            return Ok(KeyStore::new());
        }
        let mut store = KeyStore::new();
        for prefix in keys {
            store.extend(self.get_path(prefix).await?);
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
            .describe_parameters()
            .max_results(1)
            .send()
            .await
            .map_err(|e| crate::errors::ConfrError::TransportError(format!("ssm health check: {e}")))?;
        Ok(())
    }

    fn supports_watch(&self) -> bool {
        false
    }
}

