//! Durable client-side storage abstractions.
//!
//! Collections hold JSON documents under string keys. Readers go through
//! [`get_json`], which treats an unreadable document as a cache miss.

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};
use std::sync::Arc;
use tracing::{debug, warn};

pub const MARKET_COLLECTION: &str = "market";
pub const FX_COLLECTION: &str = "fx";
pub const HISTORY_COLLECTION: &str = "history";

#[async_trait]
pub trait KeyValueCollection: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn put(&self, key: &str, value: String);
    async fn remove(&self, key: &str);
    async fn clear(&self);
}

pub trait Store: Send + Sync {
    /// Named collection, created on first use.
    fn collection(&self, name: &str) -> Arc<dyn KeyValueCollection>;
}

pub async fn get_json<T: DeserializeOwned>(
    collection: &dyn KeyValueCollection,
    key: &str,
) -> Option<T> {
    let raw = collection.get(key).await?;
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "Ignoring unreadable cached value");
            None
        }
    }
}

pub async fn put_json<T: Serialize + ?Sized>(
    collection: &dyn KeyValueCollection,
    key: &str,
    value: &T,
) {
    match serde_json::to_string(value) {
        Ok(raw) => collection.put(key, raw).await,
        Err(e) => debug!(key, error = %e, "Failed to serialize value for cache"),
    }
}
