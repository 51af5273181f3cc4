use crate::core::resolver::TickerDirectory;
use async_trait::async_trait;
use std::collections::HashMap;

#[async_trait]
pub trait DirectoryProvider: Send + Sync {
    async fn fetch_directory(&self) -> anyhow::Result<TickerDirectory>;
}

/// Server-computed annualized returns keyed by asset id.
pub type ReturnTable = HashMap<String, f64>;

#[async_trait]
pub trait ReturnsProvider: Send + Sync {
    async fn fetch_returns(&self) -> anyhow::Result<ReturnTable>;
}
