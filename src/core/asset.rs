//! Asset records handed in by the portfolio store and the market tickers
//! derived from them.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

pub const BASE_CURRENCY: &str = "EUR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Stock,
    Crypto,
    Manual,
    RealEstate,
}

impl AssetKind {
    /// Market the asset is priced on, `None` for manually valued assets.
    pub fn market(&self) -> Option<MarketKind> {
        match self {
            AssetKind::Stock => Some(MarketKind::Stock),
            AssetKind::Crypto => Some(MarketKind::Crypto),
            AssetKind::Manual | AssetKind::RealEstate => None,
        }
    }
}

/// Market segment understood by the market data service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketKind {
    Crypto,
    Stock,
}

impl Display for MarketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                MarketKind::Crypto => "crypto",
                MarketKind::Stock => "stock",
            }
        )
    }
}

impl FromStr for MarketKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "crypto" | "cryptos" => Ok(MarketKind::Crypto),
            "stock" | "stocks" => Ok(MarketKind::Stock),
            _ => Err(anyhow::anyhow!("Invalid market kind: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub id: String,
    #[serde(default)]
    pub canonical_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub symbol: Option<String>,
    pub kind: AssetKind,
    pub quantity: f64,
    pub unit_cost: f64,
    pub currency: String,
    pub acquired_on: NaiveDate,
    #[serde(default)]
    pub group: Option<String>,
}

impl AssetRecord {
    /// Currency code in canonical upper case.
    pub fn currency_code(&self) -> String {
        normalize_currency(&self.currency)
    }

    pub fn initial_value(&self) -> f64 {
        self.unit_cost * self.quantity
    }
}

/// One entry of the batched price request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ticker {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MarketKind,
}

impl Ticker {
    pub fn new(id: impl Into<String>, kind: MarketKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

pub fn normalize_currency(code: &str) -> String {
    let code = code.trim();
    if code.is_empty() {
        BASE_CURRENCY.to_string()
    } else {
        code.to_uppercase()
    }
}
