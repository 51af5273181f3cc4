//! Domain types, pure algorithms, and the seams to external services

pub mod asset;
pub mod cache;
pub mod config;
pub mod currency;
pub mod irr;
pub mod log;
pub mod metadata;
pub mod price;
pub mod rates;
pub mod resolver;
pub mod series;
pub mod snapshot;
pub mod valuation;

// Re-export main types for cleaner imports
pub use asset::{AssetKind, AssetRecord, MarketKind, Ticker};
pub use currency::CurrencyRateProvider;
pub use metadata::{DirectoryProvider, ReturnTable, ReturnsProvider};
pub use price::{HistoryProvider, QuoteProvider};
pub use rates::ExchangeRateTable;
pub use resolver::{Resolver, TickerDirectory};
pub use series::ReconciledSeries;
pub use snapshot::MarketSnapshot;
