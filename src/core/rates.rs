//! Exchange rate table, always expressed as EUR per one unit of currency.

use crate::core::asset::{BASE_CURRENCY, normalize_currency};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateSource {
    Server,
    Derived,
    Persisted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateEntry {
    pub eur_per_unit: f64,
    pub source: RateSource,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRateTable {
    rates: BTreeMap<String, RateEntry>,
}

impl ExchangeRateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// EUR per one unit of `currency`. EUR itself is always 1.
    pub fn rate(&self, currency: &str) -> Option<f64> {
        let code = normalize_currency(currency);
        if code == BASE_CURRENCY {
            return Some(1.0);
        }
        self.rates.get(&code).map(|e| e.eur_per_unit)
    }

    pub fn entry(&self, currency: &str) -> Option<&RateEntry> {
        self.rates.get(&normalize_currency(currency))
    }

    pub fn to_eur(&self, amount: f64, currency: &str) -> Option<f64> {
        self.rate(currency).map(|rate| amount * rate)
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn currencies(&self) -> impl Iterator<Item = &String> {
        self.rates.keys()
    }

    /// Stores an already-inverted rate. Non-positive or non-finite values are ignored.
    pub fn set(
        &mut self,
        currency: &str,
        eur_per_unit: f64,
        source: RateSource,
        now: DateTime<Utc>,
    ) -> bool {
        let code = normalize_currency(currency);
        if code == BASE_CURRENCY || !eur_per_unit.is_finite() || eur_per_unit <= 0.0 {
            debug!(currency = %code, eur_per_unit, "Ignoring unusable rate");
            return false;
        }
        self.rates.insert(
            code,
            RateEntry {
                eur_per_unit,
                source,
                updated_at: now,
            },
        );
        true
    }

    /// Merges provider rates quoted as units of currency per 1 EUR.
    pub fn merge_provider_rates(
        &mut self,
        provider_rates: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut stored = 0;
        for (code, per_eur) in provider_rates {
            match invert_provider_rate(*per_eur) {
                Some(rate) if self.set(code, rate, RateSource::Server, now) => stored += 1,
                _ => debug!(currency = %code, per_eur, "Skipping provider rate"),
            }
        }
        stored
    }

    /// Fills currencies missing from this table from `other`.
    pub fn fill_missing_from(&mut self, other: &ExchangeRateTable) -> usize {
        let mut filled = 0;
        for (code, entry) in &other.rates {
            if !self.rates.contains_key(code) {
                self.rates.insert(
                    code.clone(),
                    RateEntry {
                        source: RateSource::Persisted,
                        ..entry.clone()
                    },
                );
                filled += 1;
            }
        }
        filled
    }

    /// Applies a locally derived estimate. A server rate younger than
    /// `protect_for` is kept.
    pub fn apply_derived(
        &mut self,
        currency: &str,
        eur_per_unit: f64,
        now: DateTime<Utc>,
        protect_for: Duration,
    ) -> bool {
        if let Some(existing) = self.entry(currency) {
            if existing.source == RateSource::Server && now - existing.updated_at < protect_for {
                return false;
            }
        }
        self.set(currency, eur_per_unit, RateSource::Derived, now)
    }
}

/// Inverts a "units per EUR" provider rate into "EUR per unit".
pub fn invert_provider_rate(units_per_eur: f64) -> Option<f64> {
    if units_per_eur.is_finite() && units_per_eur > 0.0 {
        Some(1.0 / units_per_eur)
    } else {
        None
    }
}
