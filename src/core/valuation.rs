//! Current EUR valuation of a portfolio from a price snapshot and rate table.
use crate::core::asset::{AssetKind, AssetRecord};
use crate::core::rates::ExchangeRateTable;
use crate::core::resolver::Resolver;
use crate::core::snapshot::MarketSnapshot;
use tracing::debug;

/// The calculated value and weight of a single holding.
#[derive(Debug, Clone, PartialEq)]
pub struct HoldingValue {
    pub asset_id: String,
    pub price_eur: Option<f64>,
    pub value_eur: Option<f64>,
    pub weight: Option<f64>,
    pub stale: bool,
    pub error: Option<String>,
}

/// Holdings normalized to EUR. `total_eur` only counts holdings with a value.
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioValue {
    pub holdings: Vec<HoldingValue>,
    pub total_eur: f64,
    pub complete: bool,
}

impl PortfolioValue {
    pub fn holding(&self, asset_id: &str) -> Option<&HoldingValue> {
        self.holdings.iter().find(|h| h.asset_id == asset_id)
    }
}

/// EUR price per unit for one record, if one can be determined.
pub fn unit_price_eur(
    record: &AssetRecord,
    resolver: &Resolver,
    snapshot: &MarketSnapshot,
    rates: &ExchangeRateTable,
) -> Result<(f64, bool), String> {
    match record.kind {
        AssetKind::Stock | AssetKind::Crypto => {
            let resolution = resolver
                .resolve(record)
                .ok_or_else(|| format!("No market id for {}", record.id))?;
            snapshot
                .lookup(&resolution.ticker)
                .map(|entry| (entry.price_eur, entry.stale))
                .ok_or_else(|| format!("Price data not available for {}", resolution.ticker.id))
        }
        AssetKind::Manual | AssetKind::RealEstate => rates
            .to_eur(record.unit_cost, &record.currency)
            .map(|price| (price, false))
            .ok_or_else(|| format!("No exchange rate for {}", record.currency_code())),
    }
}

/// Values every record and computes weights over the valued holdings.
pub fn value_portfolio(
    records: &[AssetRecord],
    resolver: &Resolver,
    snapshot: &MarketSnapshot,
    rates: &ExchangeRateTable,
) -> PortfolioValue {
    let mut holdings = Vec::with_capacity(records.len());
    let mut total = 0.0;
    let mut complete = true;

    for record in records {
        let mut holding = HoldingValue {
            asset_id: record.id.clone(),
            price_eur: None,
            value_eur: None,
            weight: None,
            stale: false,
            error: None,
        };
        match unit_price_eur(record, resolver, snapshot, rates) {
            Ok((price, stale)) => {
                let value = price * record.quantity;
                holding.price_eur = Some(price);
                holding.value_eur = Some(value);
                holding.stale = stale;
                total += value;
            }
            Err(e) => {
                debug!("Valuation error for {}: {}", record.id, e);
                complete = false;
                holding.error = Some(e);
            }
        }
        holdings.push(holding);
    }

    if total > 0.0 {
        for holding in &mut holdings {
            holding.weight = holding.value_eur.map(|v| v / total * 100.0);
        }
    }

    PortfolioValue {
        holdings,
        total_eur: total,
        complete,
    }
}
