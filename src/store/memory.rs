use crate::core::cache::KeyValueCollection;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// In-memory collection, used for tests and when no data directory exists.
#[derive(Default)]
pub struct MemoryCollection {
    inner: Mutex<HashMap<String, String>>,
}

impl MemoryCollection {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueCollection for MemoryCollection {
    async fn get(&self, key: &str) -> Option<String> {
        let cache = self.inner.lock().await;
        let value = cache.get(key).cloned();
        if value.is_some() {
            debug!("Cache HIT for key: {}", key);
        } else {
            debug!("Cache MISS for key: {}", key);
        }
        value
    }

    async fn put(&self, key: &str, value: String) {
        let mut cache = self.inner.lock().await;
        debug!("Cache PUT for key: {}", key);
        cache.insert(key.to_string(), value);
    }

    async fn remove(&self, key: &str) {
        let mut cache = self.inner.lock().await;
        cache.remove(key);
        debug!("Cache REMOVE for key: {}", key);
    }

    async fn clear(&self) {
        let mut cache = self.inner.lock().await;
        cache.clear();
        debug!("Cache CLEAR");
    }
}
