//! The etcd backend (spec §4.2, "etcd"): transactional multi-get at a
//! pinned snapshot revision, plus the watch-stream wiring into the
//! multiplexer in [`crate::backend::etcd_watch`]. Talks to etcd over gRPC
//! via `etcd-client`, since etcd's watch API is fundamentally streaming
//! gRPC rather than request/response HTTP (see DESIGN.md).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, GetOptions, Txn, TxnOp, TxnOpResponse, WatchOptions};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::backend::etcd_watch::WatchRegistry;
use crate::backend::{Backend, KeyStore};
use crate::errors::{ConfrError, Result};

/// Max operations per transactional multi-get batch (spec §4.2, "etcd").
const MAX_BATCH: usize = 128;

/// Default per-batch timeout applied when the caller has no deadline of
/// its own (spec §4.2, "etcd": "per-batch 3 s default timeout").
const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(3);

/// One second reconnect back-off (spec §4.3, "wait one second and reopen").
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub struct EtcdBackend {
    client: Client,
    registry: Arc<WatchRegistry>,
}

impl EtcdBackend {
    pub async fn connect(nodes: &[String]) -> Result<Self> {
        let client = Client::connect(nodes, None)
            .await
            .map_err(ConfrError::Etcd)?;
        Ok(EtcdBackend {
            client,
            registry: Arc::new(WatchRegistry::new()),
        })
    }

    /// Fetches every key under `prefix`, batching at most [`MAX_BATCH`]
    /// transactional ops and pinning the revision observed in the first
    /// batch's response across subsequent batches (spec §4.2, "etcd").
    async fn get_prefixes(&self, prefixes: &[String]) -> Result<KeyStore> {
        let mut store = KeyStore::new();
        let mut pinned_revision: Option<i64> = None;

        for batch in prefixes.chunks(MAX_BATCH) {
            let mut txn = Txn::new();
            let mut ops = Vec::with_capacity(batch.len());
            for prefix in batch {
                let mut opts = GetOptions::new().with_prefix();
                if let Some(rev) = pinned_revision {
                    opts = opts.with_revision(rev);
                }
                ops.push(TxnOp::get(prefix.clone(), Some(opts)));
            }
            txn = txn.and_then(ops);

            let mut client = self.client.kv_client();
            let resp = tokio::time::timeout(DEFAULT_BATCH_TIMEOUT, client.txn(txn))
                .await
                .map_err(|_| ConfrError::Timeout(DEFAULT_BATCH_TIMEOUT))?
                .map_err(ConfrError::Etcd)?;

            if pinned_revision.is_none() {
                pinned_revision = resp.header().map(|h| h.revision());
            }

            for op_resp in resp.op_responses() {
                if let TxnOpResponse::Get(get_resp) = op_resp {
                    for kv in get_resp.kvs() {
                        let key = kv.key_str().unwrap_or_default().to_string();
                        let value = kv.value_str().unwrap_or_default().to_string();
                        store.insert(key, value);
                    }
                }
            }
        }

        Ok(store)
    }

    /// The long-lived watcher task for one prefix (spec §4.3, "Watcher
    /// goroutine"): consumes the stream, forwards revision advances into the
    /// shared [`crate::backend::etcd_watch::WatchHandle`], and reconnects
    /// with a fixed back-off on disconnect.
    async fn run_watcher(client: Client, prefix: String, handle: Arc<super::etcd_watch::WatchHandle>, ctx: CancellationToken) {
        let mut resume_revision: Option<i64> = None;

        loop {
            if ctx.is_cancelled() {
                return;
            }

            let mut opts = WatchOptions::new().with_prefix().with_progress_notify();
            if let Some(rev) = resume_revision {
                opts = opts.with_start_revision(rev);
            }

            let mut watch_client = client.watch_client();
            let stream_result = watch_client.watch(prefix.clone(), Some(opts)).await;
            let (_watcher, mut stream) = match stream_result {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(error = %err, prefix = %prefix, "etcd watch setup failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(RECONNECT_BACKOFF) => continue,
                        _ = ctx.cancelled() => return,
                    }
                }
            };

            loop {
                let next = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => return,
                    msg = stream.message() => msg,
                };

                match next {
                    Ok(Some(resp)) => {
                        let compact = resp.compact_revision();
                        if compact > 0 && (compact as u64) > handle.revision().await {
                            handle.update(compact as u64).await;
                            resume_revision = Some(compact + 1);
                        }
                        if let Some(header) = resp.header() {
                            let rev = header.revision();
                            if rev as u64 > handle.revision().await {
                                handle.update(rev as u64).await;
                                resume_revision = Some(rev + 1);
                            }
                        }
                        for event in resp.events() {
                            tracing::trace!(event_type = ?event.event_type(), prefix = %prefix, "etcd watch event");
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, prefix = %prefix, "etcd watch stream error");
                        break;
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                _ = ctx.cancelled() => return,
            }
        }
    }
}

#[async_trait]
impl Backend for EtcdBackend {
    async fn get_values(&self, _ctx: &CancellationToken, keys: &[String]) -> Result<KeyStore> {
        if keys.is_empty() {
            return Ok(KeyStore::new());
        }
        let mut store = self.get_prefixes(keys).await?;
        store.retain_prefixes(keys);
        Ok(store)
    }

    /// Ensures a watcher task exists for `prefix` (spawning one only the
    /// first time any resource subscribes to it, never once per subscriber),
    /// then waits on the shared handle (spec §4.3, "`WatchPrefix` for the
    /// etcd backend", "exactly one long-lived watcher" per unique prefix).
    async fn watch_prefix(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
        _keys: &[String],
        wait_index: u64,
        stop: &Notify,
    ) -> Result<u64> {
        let (handle, created) = self.registry.handle_for(prefix).await;

        if created {
            let client = self.client.clone();
            let watcher_ctx = ctx.clone();
            let watcher_handle = handle.clone();
            let watcher_prefix = prefix.to_string();
            tokio::spawn(async move {
                Self::run_watcher(client, watcher_prefix, watcher_handle, watcher_ctx).await;
            });
        }

        if wait_index == 0 {
            return Ok(handle.revision().await);
        }

        match handle.wait_next(ctx, wait_index, stop).await {
            Some(rev) => Ok(rev),
            None => Ok(wait_index),
        }
    }

    async fn health_check(&self, _ctx: &CancellationToken) -> Result<()> {
        let mut maintenance = self.client.maintenance_client();
        maintenance.status().await.map_err(ConfrError::Etcd)?;
        Ok(())
    }

    fn supports_watch(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_batch_matches_spec() {
        assert_eq!(MAX_BATCH, 128);
    }

    #[test]
    fn test_default_batch_timeout_is_three_seconds() {
        assert_eq!(DEFAULT_BATCH_TIMEOUT, Duration::from_secs(3));
    }

    #[test]
    fn test_reconnect_backoff_is_one_second() {
        assert_eq!(RECONNECT_BACKOFF, Duration::from_secs(1));
    }
}
