//! The `acm` backend: AWS Certificate Manager (spec §4.2, "Acm"). Exposes
//! a certificate's PEM body under its key and its certificate chain under
//! `<key>_chain` (spec §4.2).

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, KeyStore};
use crate::errors::{ConfrError, Result};

pub struct AcmBackend {
    client: aws_sdk_acm::Client,
}

impl AcmBackend {
    pub async fn new() -> Result<Self> {
        let shared_config = aws_config::load_from_env().await;
        Ok(AcmBackend {
            client: aws_sdk_acm::Client::new(&shared_config),
        })
    }

    async fn fetch_one(&self, key: &str) -> Result<KeyStore> {
        let arn = key.trim_start_matches('/');
        let resp = match self.client.get_certificate().certificate_arn(arn).send().await {
            Ok(resp) => resp,
            Err(err) => {
                if is_not_found(&err) {
                    return Ok(KeyStore::new());
                }
                return Err(ConfrError::TransportError(format!(
                    "acm get_certificate: {err}"
                )));
            }
        };

        let mut store = KeyStore::new();
        if let Some(cert) = resp.certificate() {
            store.insert(key.to_string(), cert.to_string());
        }
        if let Some(chain) = resp.certificate_chain() {
            store.insert(format!("{key}_chain"), chain.to_string());
        }
        Ok(store)
    }
}

fn is_not_found<E>(
    err: &aws_sdk_acm::error::SdkError<aws_sdk_acm::operation::get_certificate::GetCertificateError, E>,
) -> bool {
    use aws_sdk_acm::operation::get_certificate::GetCertificateError;
    matches!(
        err.as_service_error(),
        Some(GetCertificateError::ResourceNotFoundException(_))
    )
}

#[async_trait]
impl Backend for AcmBackend {
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
            .list_certificates()
            .max_items(1)
            .send()
            .await
            .map_err(|e| ConfrError::TransportError(format!("acm health check: {e}")))?;
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
    fn test_chain_key_suffix() {
        let key = "/certs/edge";
        assert_eq!(format!("{key}_chain"), "/certs/edge_chain");
    }
}
