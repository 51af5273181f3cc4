//! Currency conversion abstractions

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

#[async_trait]
pub trait CurrencyRateProvider: Send + Sync {
    /// Rates for `currencies` in the provider's convention: units of the
    /// currency per 1 EUR.
    async fn fetch_rates(&self, currencies: &BTreeSet<String>) -> Result<HashMap<String, f64>>;
}
