//! Price abstractions: batched quotes and per-asset history.

use crate::core::asset::Ticker;
use crate::core::series::HistoricalSeries;
use crate::core::snapshot::QuoteBatch;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeSet;

#[async_trait]
pub trait QuoteProvider: Send + Sync {
    /// One batched request for the whole ticker set.
    async fn fetch_quotes(&self, tickers: &BTreeSet<Ticker>) -> Result<QuoteBatch>;
}

#[async_trait]
pub trait HistoryProvider: Send + Sync {
    /// Up to `days` days of history for one ticker. `fallback_currency` is
    /// used when the provider does not state one.
    async fn fetch_history(
        &self,
        ticker: &Ticker,
        days: u32,
        fallback_currency: &str,
    ) -> Result<HistoricalSeries>;
}
