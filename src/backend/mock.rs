//! An in-memory backend for processor/run-loop tests, mirroring the test
//! doubles the teacher keeps alongside its pipeline sink implementations.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, KeyStore};
use crate::errors::Result;

pub struct MockBackend {
    store: Mutex<KeyStore>,
    watchable: bool,
}

impl MockBackend {
    pub fn new(store: KeyStore) -> Self {
        MockBackend {
            store: Mutex::new(store),
            watchable: true,
        }
    }

    pub fn without_watch(mut self) -> Self {
        self.watchable = false;
        self
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.store.lock().unwrap().insert(key, value);
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn get_values(&self, _ctx: &CancellationToken, keys: &[String]) -> Result<KeyStore> {
        if keys.is_empty() {
            return Ok(KeyStore::new());
        }
        let mut store = self.store.lock().unwrap().clone();
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
        Ok(wait_index + 1)
    }

    async fn health_check(&self, _ctx: &CancellationToken) -> Result<()> {
        Ok(())
    }

    fn supports_watch(&self) -> bool {
        self.watchable
    }
}
