//! Maps user-entered asset names and symbols to canonical market ids.
//!
//! Resolution is a pure lookup against the ticker directory loaded once per
//! session. The only state that changes afterwards is the remap table, which
//! records ids the market data service reported under a different canonical
//! id.

use crate::core::asset::{AssetRecord, MarketKind, Ticker};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub id: String,
    pub symbol: String,
    pub name: String,
}

/// Case-insensitive symbol and name indexes over one market's entries.
#[derive(Debug, Clone, Default)]
struct DirectoryIndex {
    by_symbol: HashMap<String, String>,
    by_name: HashMap<String, String>,
}

impl DirectoryIndex {
    fn build(entries: &[DirectoryEntry]) -> Self {
        let mut index = Self::default();
        // First entry wins so that the provider's ordering decides ties.
        for entry in entries {
            index
                .by_symbol
                .entry(normalize_symbol(&entry.symbol))
                .or_insert_with(|| entry.id.clone());
            index
                .by_name
                .entry(normalize_name(&entry.name))
                .or_insert_with(|| entry.id.clone());
        }
        index
    }
}

/// Reference set of known tickers, split by market.
#[derive(Debug, Clone, Default)]
pub struct TickerDirectory {
    cryptos: DirectoryIndex,
    stocks: DirectoryIndex,
    len: usize,
}

impl TickerDirectory {
    pub fn new(cryptos: &[DirectoryEntry], stocks: &[DirectoryEntry]) -> Self {
        Self {
            cryptos: DirectoryIndex::build(cryptos),
            stocks: DirectoryIndex::build(stocks),
            len: cryptos.len() + stocks.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn index(&self, market: MarketKind) -> &DirectoryIndex {
        match market {
            MarketKind::Crypto => &self.cryptos,
            MarketKind::Stock => &self.stocks,
        }
    }

    pub fn by_symbol(&self, market: MarketKind, symbol: &str) -> Option<&str> {
        self.index(market)
            .by_symbol
            .get(&normalize_symbol(symbol))
            .map(String::as_str)
    }

    pub fn by_name(&self, market: MarketKind, name: &str) -> Option<&str> {
        self.index(market)
            .by_name
            .get(&normalize_name(name))
            .map(String::as_str)
    }
}

/// Static overrides for symbols whose market id differs from the symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasTable {
    entries: HashMap<String, String>,
}

const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("BNB", "binancecoin"),
    ("MATIC", "matic-network"),
    ("POL", "polygon-ecosystem-token"),
    ("XBT", "bitcoin"),
    ("AVAX", "avalanche-2"),
];

impl AliasTable {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Built-in aliases with `overrides` layered on top.
    pub fn with_overrides<'a, I>(overrides: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut table = Self::default();
        for (symbol, id) in overrides {
            table.insert(symbol, id);
        }
        table
    }

    pub fn insert(&mut self, symbol: &str, canonical_id: &str) {
        self.entries
            .insert(normalize_symbol(symbol), canonical_id.to_string());
    }

    pub fn get(&self, symbol: &str) -> Option<&str> {
        self.entries
            .get(&normalize_symbol(symbol))
            .map(String::as_str)
    }
}

impl Default for AliasTable {
    fn default() -> Self {
        let mut table = Self::empty();
        for (symbol, id) in DEFAULT_ALIASES {
            table.insert(symbol, id);
        }
        table
    }
}

/// Additive `raw id -> canonical id` table. Entries are never removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRemap(BTreeMap<String, String>);

impl IdRemap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a discovery. Returns true if the table changed.
    pub fn record(&mut self, raw_id: &str, canonical_id: &str) -> bool {
        if raw_id == canonical_id {
            return false;
        }
        match self.0.insert(raw_id.to_string(), canonical_id.to_string()) {
            Some(previous) => previous != canonical_id,
            None => true,
        }
    }

    /// Merges `other` into self; newer discoveries overwrite older ones.
    pub fn merge(&mut self, other: &IdRemap) -> bool {
        let mut changed = false;
        for (raw, canonical) in &other.0 {
            changed |= self.record(raw, canonical);
        }
        changed
    }

    pub fn get(&self, raw_id: &str) -> Option<&str> {
        self.0.get(raw_id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// Which rule produced a resolution, in precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResolutionSource {
    Alias,
    Remap,
    Record,
    Symbol,
    Name,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub ticker: Ticker,
    pub source: ResolutionSource,
}

impl Resolution {
    /// An unresolved asset priced under its raw id.
    pub fn is_best_effort(&self) -> bool {
        self.source == ResolutionSource::Raw
    }
}

#[derive(Debug, Clone, Default)]
pub struct Resolver {
    directory: TickerDirectory,
    aliases: AliasTable,
    remap: IdRemap,
}

impl Resolver {
    pub fn new(directory: TickerDirectory, aliases: AliasTable) -> Self {
        Self {
            directory,
            aliases,
            remap: IdRemap::new(),
        }
    }

    pub fn directory(&self) -> &TickerDirectory {
        &self.directory
    }

    /// Swaps in a refreshed directory; observed remaps are kept.
    pub fn set_directory(&mut self, directory: TickerDirectory) {
        self.directory = directory;
    }

    pub fn remap(&self) -> &IdRemap {
        &self.remap
    }

    pub fn observe_remap(&mut self, remap: &IdRemap) -> bool {
        self.remap.merge(remap)
    }

    /// Resolves a market-priced record. Manual and real-estate records yield `None`.
    pub fn resolve(&self, record: &AssetRecord) -> Option<Resolution> {
        let market = record.kind.market()?;
        let (clean_name, name_symbol) = split_display_name(&record.name);
        let symbol = record
            .symbol
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(normalize_symbol)
            .or(name_symbol);

        if let Some(id) = symbol.as_deref().and_then(|s| self.aliases.get(s)) {
            return Some(resolution(id, market, ResolutionSource::Alias));
        }

        let raw = raw_id(record);
        let (candidate, source) = if let Some(id) = record
            .canonical_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
        {
            (id.to_string(), ResolutionSource::Record)
        } else if let Some(id) = symbol
            .as_deref()
            .and_then(|s| self.directory.by_symbol(market, s))
        {
            (id.to_string(), ResolutionSource::Symbol)
        } else if let Some(id) = self.directory.by_name(market, &clean_name) {
            (id.to_string(), ResolutionSource::Name)
        } else {
            (raw.clone(), ResolutionSource::Raw)
        };

        if let Some(mapped) = self
            .remap
            .get(&candidate)
            .or_else(|| self.remap.get(&raw))
            .filter(|mapped| *mapped != candidate)
        {
            return Some(resolution(mapped, market, ResolutionSource::Remap));
        }

        if source == ResolutionSource::Raw {
            debug!(asset = %record.id, raw = %raw, "Unresolved asset, using raw id");
        }
        Some(resolution(&candidate, market, source))
    }

    /// Canonical id for a record, `None` when it cannot be resolved.
    pub fn canonical_id(&self, record: &AssetRecord) -> Option<String> {
        self.resolve(record)
            .filter(|r| !r.is_best_effort())
            .map(|r| r.ticker.id)
    }

    /// De-duplicated request set for a whole asset list.
    pub fn ticker_set(&self, records: &[AssetRecord]) -> BTreeSet<Ticker> {
        records
            .iter()
            .filter_map(|record| self.resolve(record))
            .map(|r| r.ticker)
            .collect()
    }

    /// Ids of the ticker set that resolved only to raw ids.
    pub fn best_effort_ids(&self, records: &[AssetRecord]) -> BTreeSet<String> {
        records
            .iter()
            .filter_map(|record| self.resolve(record))
            .filter(Resolution::is_best_effort)
            .map(|r| r.ticker.id)
            .collect()
    }
}

fn resolution(id: &str, market: MarketKind, source: ResolutionSource) -> Resolution {
    Resolution {
        ticker: Ticker::new(id, market),
        source,
    }
}

/// Id sent verbatim when nothing matches: the symbol as entered, else the record id.
fn raw_id(record: &AssetRecord) -> String {
    record
        .symbol
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&record.id)
        .to_string()
}

pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Splits "Foo Corp (FOO)" into ("Foo Corp", Some("FOO")).
pub fn split_display_name(name: &str) -> (String, Option<String>) {
    let trimmed = name.trim();
    if let Some(stripped) = trimmed.strip_suffix(')') {
        if let Some(open) = stripped.rfind('(') {
            let inner = stripped[open + 1..].trim();
            let head = stripped[..open].trim();
            if !inner.is_empty() && !head.is_empty() {
                return (head.to_string(), Some(normalize_symbol(inner)));
            }
        }
    }
    (trimmed.to_string(), None)
}
