//! Local annualized-return formula, used when no server-computed value exists.

use crate::core::asset::AssetRecord;
use crate::core::rates::ExchangeRateTable;
use chrono::{DateTime, Utc};
use tracing::debug;

const DAYS_PER_YEAR: f64 = 365.25;

/// Years between acquisition and `now`, measured in 365.25-day years.
pub fn years_held(record: &AssetRecord, now: DateTime<Utc>) -> f64 {
    let acquired = record.acquired_on.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    match acquired {
        Some(acquired) => (now - acquired).num_seconds() as f64 / (DAYS_PER_YEAR * 86_400.0),
        None => 0.0,
    }
}

/// `(current / initial) ^ (1 / years) - 1` as a decimal.
///
/// Returns 0 when the return is undefined: a non-positive initial value or
/// holding period, or non-finite inputs and results.
pub fn annualized_return(initial_value: f64, current_value: f64, years: f64) -> f64 {
    if !initial_value.is_finite() || !current_value.is_finite() || !years.is_finite() {
        return 0.0;
    }
    if initial_value <= 0.0 || years <= 0.0 || current_value < 0.0 {
        return 0.0;
    }
    let rate = (current_value / initial_value).powf(1.0 / years) - 1.0;
    if rate.is_finite() { rate } else { 0.0 }
}

/// Local fallback for one asset at a given EUR price per unit. The cost basis
/// is in the record currency and is converted with `rates` first.
pub fn fallback_return(
    record: &AssetRecord,
    current_price_eur: f64,
    rates: &ExchangeRateTable,
    now: DateTime<Utc>,
) -> f64 {
    let Some(initial_eur) = rates.to_eur(record.initial_value(), &record.currency) else {
        debug!(asset = %record.id, currency = %record.currency_code(), "No rate for cost basis");
        return 0.0;
    };
    annualized_return(
        initial_eur,
        record.quantity * current_price_eur,
        years_held(record, now),
    )
}
