pub mod market_service;
pub mod util;

pub use market_service::MarketDataService;
