//! The live price snapshot and the conservative merge that updates it.

use crate::core::asset::{MarketKind, Ticker};
use crate::core::resolver::IdRemap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    pub price_eur: f64,
    pub raw_price: f64,
    pub currency: String,
    pub kind: MarketKind,
    pub stale: bool,
    #[serde(default)]
    pub best_effort: bool,
    pub updated_at: DateTime<Utc>,
    pub sequence: u64,
}

/// Prices per market. The same id may be listed on both markets, so each
/// market keeps its own entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    #[serde(default)]
    pub cryptos: BTreeMap<String, SnapshotEntry>,
    #[serde(default)]
    pub stocks: BTreeMap<String, SnapshotEntry>,
    #[serde(default)]
    pub remap: IdRemap,
    pub last_sequence: u64,
}

impl MarketSnapshot {
    pub fn market(&self, kind: MarketKind) -> &BTreeMap<String, SnapshotEntry> {
        match kind {
            MarketKind::Crypto => &self.cryptos,
            MarketKind::Stock => &self.stocks,
        }
    }

    fn market_mut(&mut self, kind: MarketKind) -> &mut BTreeMap<String, SnapshotEntry> {
        match kind {
            MarketKind::Crypto => &mut self.cryptos,
            MarketKind::Stock => &mut self.stocks,
        }
    }

    /// Stores `entry` under `id` on the entry's own market.
    pub fn insert(&mut self, id: impl Into<String>, entry: SnapshotEntry) {
        self.market_mut(entry.kind).insert(id.into(), entry);
    }

    pub fn get_ticker(&self, ticker: &Ticker) -> Option<&SnapshotEntry> {
        self.market(ticker.kind).get(&ticker.id)
    }

    /// Entry for `id` on whichever market holds it, crypto first.
    pub fn get(&self, id: &str) -> Option<&SnapshotEntry> {
        self.cryptos.get(id).or_else(|| self.stocks.get(id))
    }

    /// Looks a ticker up directly, then through the remap table.
    pub fn lookup(&self, ticker: &Ticker) -> Option<&SnapshotEntry> {
        let market = self.market(ticker.kind);
        market
            .get(&ticker.id)
            .or_else(|| self.remap.get(&ticker.id).and_then(|c| market.get(c)))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &SnapshotEntry)> {
        self.cryptos
            .iter()
            .chain(self.stocks.iter())
            .map(|(id, entry)| (id.as_str(), entry))
    }

    pub fn is_empty(&self) -> bool {
        self.cryptos.is_empty() && self.stocks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cryptos.len() + self.stocks.len()
    }

    pub fn stale_ids(&self) -> Vec<&str> {
        self.entries()
            .filter(|(_, e)| e.stale)
            .map(|(id, _)| id)
            .collect()
    }

    /// Copy of this snapshot with every entry marked stale.
    pub fn as_stale(&self) -> Self {
        let mut snapshot = self.clone();
        for entry in snapshot
            .cryptos
            .values_mut()
            .chain(snapshot.stocks.values_mut())
        {
            entry.stale = true;
        }
        snapshot
    }
}

/// One fresh price from the market data service.
#[derive(Debug, Clone, PartialEq)]
pub struct Quote {
    pub price_eur: f64,
    pub raw_price: f64,
    pub currency: String,
}

/// Parsed batched response: quotes per market and id, plus remap metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuoteBatch {
    pub quotes: HashMap<Ticker, Quote>,
    pub remap: IdRemap,
}

impl QuoteBatch {
    /// Quote for a requested ticker, following the remap when the service
    /// answered under a different id.
    pub fn quote_for(&self, ticker: &Ticker, known: &IdRemap) -> Option<&Quote> {
        self.quotes.get(ticker).or_else(|| {
            self.remap
                .get(&ticker.id)
                .or_else(|| known.get(&ticker.id))
                .and_then(|id| self.quotes.get(&Ticker::new(id, ticker.kind)))
        })
    }
}

/// What a merge did to the requested ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub updated: Vec<String>,
    pub stale: Vec<String>,
    pub missing: Vec<String>,
}

impl MergeReport {
    pub fn is_partial(&self) -> bool {
        !self.stale.is_empty() || !self.missing.is_empty()
    }

    /// Single aggregate warning for ids that got no fresh price.
    pub fn warning(&self) -> Option<String> {
        if !self.is_partial() {
            return None;
        }
        let mut ids: Vec<&str> = self
            .stale
            .iter()
            .chain(self.missing.iter())
            .map(String::as_str)
            .collect();
        ids.sort_unstable();
        Some(format!(
            "No fresh price for {} of {} assets: {}",
            ids.len(),
            ids.len() + self.updated.len(),
            ids.join(", ")
        ))
    }
}

/// Merges a successful batch into `previous`.
///
/// Returns `None` when `sequence` is not newer than the last applied one. Only
/// ids in `requested` are touched: fresh quotes overwrite, absent ids keep
/// their last price and are flagged stale, ids never seen stay absent.
pub fn merge(
    previous: &MarketSnapshot,
    requested: &BTreeSet<Ticker>,
    best_effort: &BTreeSet<String>,
    batch: &QuoteBatch,
    sequence: u64,
    now: DateTime<Utc>,
) -> Option<(MarketSnapshot, MergeReport)> {
    if sequence <= previous.last_sequence {
        return None;
    }

    let mut next = previous.clone();
    next.remap.merge(&batch.remap);
    let mut report = MergeReport::default();

    for ticker in requested {
        match batch.quote_for(ticker, &previous.remap) {
            Some(quote) => {
                next.market_mut(ticker.kind).insert(
                    ticker.id.clone(),
                    SnapshotEntry {
                        price_eur: quote.price_eur,
                        raw_price: quote.raw_price,
                        currency: quote.currency.clone(),
                        kind: ticker.kind,
                        stale: false,
                        best_effort: best_effort.contains(&ticker.id),
                        updated_at: now,
                        sequence,
                    },
                );
                report.updated.push(ticker.id.clone());
            }
            None => match next.market_mut(ticker.kind).get_mut(&ticker.id) {
                Some(entry) => {
                    entry.stale = true;
                    report.stale.push(ticker.id.clone());
                }
                None => report.missing.push(ticker.id.clone()),
            },
        }
    }

    next.last_sequence = sequence;
    Some((next, report))
}
