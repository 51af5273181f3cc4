use super::lock;
use crate::core::{
    asset::{AssetRecord, BASE_CURRENCY, MarketKind},
    cache::{KeyValueCollection, get_json, put_json},
    currency::CurrencyRateProvider,
    rates::ExchangeRateTable,
    snapshot::MarketSnapshot,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const RATES_KEY: &str = "rates";

#[derive(Debug, Clone, PartialEq)]
pub enum RateRefresh {
    /// No non-EUR currency in use.
    Skipped,
    Updated { stored: usize },
    /// The fetch failed; missing currencies were filled from storage.
    Fallback { filled: usize, warning: String },
    /// The fetch failed and nothing was persisted; the table is unchanged.
    Unavailable { warning: String },
}

impl RateRefresh {
    pub fn warning(&self) -> Option<&str> {
        match self {
            RateRefresh::Fallback { warning, .. } | RateRefresh::Unavailable { warning } => {
                Some(warning)
            }
            RateRefresh::Skipped | RateRefresh::Updated { .. } => None,
        }
    }
}

/// Currencies other than EUR used by any record.
pub fn required_currencies(records: &[AssetRecord]) -> BTreeSet<String> {
    records
        .iter()
        .map(AssetRecord::currency_code)
        .filter(|code| code != BASE_CURRENCY)
        .collect()
}

/// Maintains the exchange rate table from server rates and quote-derived
/// estimates.
pub struct CurrencyRateManager {
    provider: Arc<dyn CurrencyRateProvider>,
    collection: Arc<dyn KeyValueCollection>,
    currencies: Mutex<BTreeSet<String>>,
    table: watch::Sender<Arc<ExchangeRateTable>>,
    throttle: chrono::Duration,
    last_derived: Mutex<Option<DateTime<Utc>>>,
    interval: watch::Sender<Duration>,
}

impl CurrencyRateManager {
    pub fn new(
        provider: Arc<dyn CurrencyRateProvider>,
        collection: Arc<dyn KeyValueCollection>,
        refresh_interval: Duration,
        throttle: Duration,
    ) -> Self {
        Self {
            provider,
            collection,
            currencies: Mutex::new(BTreeSet::new()),
            table: watch::Sender::new(Arc::new(ExchangeRateTable::new())),
            throttle: chrono::Duration::from_std(throttle).unwrap_or(chrono::Duration::MAX),
            last_derived: Mutex::new(None),
            interval: watch::Sender::new(refresh_interval),
        }
    }

    pub fn table(&self) -> Arc<ExchangeRateTable> {
        self.table.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ExchangeRateTable>> {
        self.table.subscribe()
    }

    /// EUR per unit of `currency`.
    pub fn rate(&self, currency: &str) -> Option<f64> {
        self.table.borrow().rate(currency)
    }

    pub fn currencies(&self) -> BTreeSet<String> {
        lock(&self.currencies).clone()
    }

    /// Replaces the set refreshed on every cycle. Returns whether it changed.
    pub fn set_currencies(&self, currencies: BTreeSet<String>) -> bool {
        let mut current = lock(&self.currencies);
        if *current == currencies {
            return false;
        }
        *current = currencies;
        true
    }

    pub fn set_interval(&self, interval: Duration) {
        self.interval.send_replace(interval);
    }

    pub(crate) fn watch_interval(&self) -> watch::Receiver<Duration> {
        self.interval.subscribe()
    }

    /// Fetches server rates for the tracked currencies.
    pub async fn refresh(&self) -> RateRefresh {
        let currencies = self.currencies();
        self.refresh_for(&currencies).await
    }

    pub async fn refresh_for(&self, currencies: &BTreeSet<String>) -> RateRefresh {
        if currencies.is_empty() {
            return RateRefresh::Skipped;
        }

        match self.provider.fetch_rates(currencies).await {
            Ok(provider_rates) => {
                let now = Utc::now();
                let mut stored = 0;
                self.table.send_modify(|table| {
                    let mut next = ExchangeRateTable::clone(table);
                    stored = next.merge_provider_rates(&provider_rates, now);
                    *table = Arc::new(next);
                });
                let missing: Vec<&String> = currencies
                    .iter()
                    .filter(|code| !provider_rates.contains_key(*code))
                    .collect();
                if !missing.is_empty() {
                    warn!(?missing, "No server rate for some currencies");
                }
                info!(stored, "Refreshed exchange rates");
                let latest = self.table();
                put_json(self.collection.as_ref(), RATES_KEY, latest.as_ref()).await;
                RateRefresh::Updated { stored }
            }
            Err(e) => {
                warn!(error = %e, "Exchange rate refresh failed");
                let warning = format!("Exchange rate refresh failed: {e:#}");
                let persisted: Option<ExchangeRateTable> =
                    get_json(self.collection.as_ref(), RATES_KEY).await;
                match persisted {
                    Some(persisted) => {
                        let mut filled = 0;
                        self.table.send_if_modified(|table| {
                            let mut next = ExchangeRateTable::clone(table);
                            filled = next.fill_missing_from(&persisted);
                            if filled > 0 {
                                *table = Arc::new(next);
                            }
                            filled > 0
                        });
                        debug!(filled, "Filled exchange rates from storage");
                        RateRefresh::Fallback { filled, warning }
                    }
                    None => RateRefresh::Unavailable { warning },
                }
            }
        }
    }

    pub fn observe_snapshot(&self, snapshot: &MarketSnapshot) -> usize {
        self.observe_snapshot_at(snapshot, Utc::now())
    }

    /// Publishes rates estimated from fresh stock quotes (`priceEUR / rawPrice`),
    /// at most once per throttle interval. Returns how many rates changed.
    pub fn observe_snapshot_at(&self, snapshot: &MarketSnapshot, now: DateTime<Utc>) -> usize {
        let mut last_derived = lock(&self.last_derived);
        if let Some(last) = *last_derived {
            if now - last < self.throttle {
                return 0;
            }
        }

        let estimates = derive_rates(snapshot);
        if estimates.is_empty() {
            return 0;
        }

        let mut applied = 0;
        self.table.send_if_modified(|table| {
            let mut next = ExchangeRateTable::clone(table);
            for (currency, rate) in &estimates {
                if next.apply_derived(currency, *rate, now, self.throttle) {
                    applied += 1;
                }
            }
            if applied > 0 {
                *table = Arc::new(next);
            }
            applied > 0
        });

        if applied > 0 {
            *last_derived = Some(now);
            debug!(applied, "Published derived exchange rates");
        }
        applied
    }

    /// Drops every rate and the throttle state.
    pub fn reset(&self) {
        lock(&self.currencies).clear();
        *lock(&self.last_derived) = None;
        self.table.send_replace(Arc::new(ExchangeRateTable::new()));
    }
}

/// Latest fresh estimate per quote currency, from stock quotes only.
fn derive_rates(snapshot: &MarketSnapshot) -> BTreeMap<String, f64> {
    let mut latest: BTreeMap<String, (DateTime<Utc>, f64)> = BTreeMap::new();
    for (_, entry) in snapshot.entries() {
        if entry.kind != MarketKind::Stock || entry.stale || entry.currency == BASE_CURRENCY {
            continue;
        }
        if !(entry.raw_price > 0.0 && entry.price_eur > 0.0) {
            continue;
        }
        let rate = entry.price_eur / entry.raw_price;
        if !rate.is_finite() {
            continue;
        }
        let slot = latest
            .entry(entry.currency.clone())
            .or_insert((entry.updated_at, rate));
        if entry.updated_at > slot.0 {
            *slot = (entry.updated_at, rate);
        }
    }
    latest
        .into_iter()
        .map(|(currency, (_, rate))| (currency, rate))
        .collect()
}
