//! Historical series and their alignment onto one forward-filled date axis.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const ALL_SERIES: &str = "ALL";
pub const UNGROUPED: &str = "Ungrouped";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPoint {
    pub date: NaiveDate,
    pub price: f64,
    pub currency: String,
}

/// Date-ascending points with no duplicate dates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoricalSeries {
    points: Vec<HistoricalPoint>,
}

impl HistoricalSeries {
    /// Sorts by date and keeps the last point given for any repeated date.
    pub fn from_points(points: Vec<HistoricalPoint>) -> Self {
        let mut by_date: BTreeMap<NaiveDate, HistoricalPoint> = BTreeMap::new();
        for point in points {
            by_date.insert(point.date, point);
        }
        Self {
            points: by_date.into_values().collect(),
        }
    }

    pub fn points(&self) -> &[HistoricalPoint] {
        &self.points
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.points.first().map(|p| p.date)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// One asset's EUR portfolio-value contributions by date.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetValues {
    pub asset_id: String,
    pub group: Option<String>,
    /// `None` when no rate was known for the cost basis.
    pub initial_cost_eur: Option<f64>,
    pub values: BTreeMap<NaiveDate, f64>,
}

impl AssetValues {
    fn group_label(&self) -> &str {
        self.group.as_deref().unwrap_or(UNGROUPED)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub date: NaiveDate,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciledSeries {
    pub dates: Vec<NaiveDate>,
    /// Forward-filled contribution per asset, aligned with `dates`.
    pub per_asset: BTreeMap<String, Vec<f64>>,
    /// Portfolio total per date, rounded to cents.
    pub totals: Vec<f64>,
    pub initial_costs: BTreeMap<String, f64>,
}

impl ReconciledSeries {
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// The unified "ALL" series.
    pub fn all(&self) -> Vec<SeriesPoint> {
        zip_points(&self.dates, &self.totals)
    }

    pub fn asset(&self, asset_id: &str) -> Option<Vec<SeriesPoint>> {
        self.per_asset
            .get(asset_id)
            .map(|values| zip_points(&self.dates, values))
    }

    /// Series by key, where `ALL` selects the total.
    pub fn series(&self, key: &str) -> Option<Vec<SeriesPoint>> {
        if key == ALL_SERIES {
            Some(self.all())
        } else {
            self.asset(key)
        }
    }

    pub fn total_initial_cost(&self) -> f64 {
        self.initial_costs.values().sum()
    }
}

fn zip_points(dates: &[NaiveDate], values: &[f64]) -> Vec<SeriesPoint> {
    dates
        .iter()
        .zip(values)
        .map(|(date, value)| SeriesPoint {
            date: *date,
            value: *value,
        })
        .collect()
}

pub fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Axis shared by all non-empty inputs: the union of their dates, starting
/// at the latest of their first dates.
fn common_axis(assets: &[&AssetValues]) -> Vec<NaiveDate> {
    let Some(start) = assets
        .iter()
        .filter_map(|a| a.values.keys().next().copied())
        .max()
    else {
        return Vec::new();
    };

    let union: BTreeSet<NaiveDate> = assets
        .iter()
        .flat_map(|a| a.values.keys().copied())
        .collect();
    union.range(start..).copied().collect()
}

/// Last known value at or before each axis date, 0 before the first observation.
fn forward_fill(values: &BTreeMap<NaiveDate, f64>, axis: &[NaiveDate]) -> Vec<f64> {
    axis.iter()
        .map(|date| {
            values
                .range(..=*date)
                .next_back()
                .map(|(_, v)| *v)
                .unwrap_or(0.0)
        })
        .collect()
}

/// Aligns per-asset contributions onto one axis. Assets without any value
/// are left out of the axis and the totals.
pub fn reconcile(assets: &[AssetValues]) -> ReconciledSeries {
    let included: Vec<&AssetValues> = assets.iter().filter(|a| !a.values.is_empty()).collect();
    let axis = common_axis(&included);

    let mut per_asset = BTreeMap::new();
    let mut totals = vec![0.0; axis.len()];
    for asset in &included {
        let filled = forward_fill(&asset.values, &axis);
        for (total, value) in totals.iter_mut().zip(&filled) {
            *total += value;
        }
        per_asset.insert(asset.asset_id.clone(), filled);
    }

    ReconciledSeries {
        totals: totals.into_iter().map(round_cents).collect(),
        dates: axis,
        per_asset,
        initial_costs: assets
            .iter()
            .filter_map(|a| Some((a.asset_id.clone(), a.initial_cost_eur?)))
            .collect(),
    }
}

/// Same alignment as [`reconcile`], summed per group label instead of per asset.
pub fn reconcile_by_group(assets: &[AssetValues]) -> BTreeMap<String, Vec<SeriesPoint>> {
    let included: Vec<&AssetValues> = assets.iter().filter(|a| !a.values.is_empty()).collect();
    let axis = common_axis(&included);

    let mut groups: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for asset in &included {
        let filled = forward_fill(&asset.values, &axis);
        let sums = groups
            .entry(asset.group_label().to_string())
            .or_insert_with(|| vec![0.0; axis.len()]);
        for (sum, value) in sums.iter_mut().zip(&filled) {
            *sum += value;
        }
    }

    groups
        .into_iter()
        .map(|(label, sums)| {
            let rounded: Vec<f64> = sums.into_iter().map(round_cents).collect();
            (label, zip_points(&axis, &rounded))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
    }

    fn asset(id: &str, group: Option<&str>, points: &[(u32, f64)]) -> AssetValues {
        AssetValues {
            asset_id: id.to_string(),
            group: group.map(str::to_string),
            initial_cost_eur: Some(0.0),
            values: points.iter().map(|(day, v)| (d(*day), *v)).collect(),
        }
    }

    #[test]
    fn forward_fills_from_latest_first_date() {
        let a = asset("A", None, &[(1, 10.0), (3, 30.0)]);
        let b = asset("B", None, &[(2, 5.0), (3, 15.0)]);

        let series = reconcile(&[a, b]);

        assert_eq!(series.dates, vec![d(2), d(3)]);
        assert_eq!(series.totals, vec![15.0, 45.0]);
        assert_eq!(series.per_asset["A"], vec![10.0, 30.0]);
        assert_eq!(series.per_asset["B"], vec![5.0, 15.0]);
    }

    #[test]
    fn gaps_carry_last_value() {
        let a = asset("A", None, &[(1, 10.0), (5, 50.0)]);
        let b = asset("B", None, &[(1, 1.0), (2, 2.0), (3, 3.0), (4, 4.0), (5, 5.0)]);

        let series = reconcile(&[a, b]);
        assert_eq!(series.len(), 5);
        assert_eq!(series.per_asset["A"], vec![10.0, 10.0, 10.0, 10.0, 50.0]);
        assert_eq!(series.totals, vec![11.0, 12.0, 13.0, 14.0, 55.0]);
    }

    #[test]
    fn totals_are_rounded_to_cents() {
        let a = asset("A", None, &[(1, 1.234)]);
        let b = asset("B", None, &[(1, 2.0)]);
        let series = reconcile(&[a, b]);
        assert_eq!(series.totals, vec![3.23]);
        assert_eq!(series.per_asset["A"], vec![1.234]);
    }

    #[test]
    fn empty_assets_do_not_move_the_axis() {
        let a = asset("A", None, &[(1, 10.0), (2, 20.0)]);
        let empty = asset("E", None, &[]);
        let series = reconcile(&[a, empty]);
        assert_eq!(series.dates, vec![d(1), d(2)]);
        assert!(series.asset("E").is_none());
        assert!(series.initial_costs.contains_key("E"));
    }

    #[test]
    fn no_input_gives_empty_series() {
        let series = reconcile(&[]);
        assert!(series.is_empty());
        assert!(series.all().is_empty());
    }

    #[test]
    fn series_selects_all_or_asset() {
        let a = asset("A", None, &[(1, 1.0)]);
        let series = reconcile(&[a]);
        assert_eq!(series.series(ALL_SERIES).unwrap()[0].value, 1.0);
        assert_eq!(series.series("A").unwrap()[0].date, d(1));
        assert!(series.series("missing").is_none());
    }

    #[test]
    fn groups_sum_their_members() {
        let a = asset("A", Some("Crypto"), &[(1, 10.0), (3, 30.0)]);
        let b = asset("B", Some("Stocks"), &[(2, 5.0), (3, 15.0)]);
        let c = asset("C", Some("Crypto"), &[(2, 1.0)]);
        let u = asset("U", None, &[(1, 2.0)]);

        let groups = reconcile_by_group(&[a, b, c, u]);

        let crypto: Vec<f64> = groups["Crypto"].iter().map(|p| p.value).collect();
        let stocks: Vec<f64> = groups["Stocks"].iter().map(|p| p.value).collect();
        let ungrouped: Vec<f64> = groups[UNGROUPED].iter().map(|p| p.value).collect();
        assert_eq!(crypto, vec![11.0, 31.0]);
        assert_eq!(stocks, vec![5.0, 15.0]);
        assert_eq!(ungrouped, vec![2.0, 2.0]);
    }

    #[test]
    fn series_normalizes_order_and_duplicates() {
        let point = |day: u32, price: f64| HistoricalPoint {
            date: d(day),
            price,
            currency: "EUR".to_string(),
        };
        let series = HistoricalSeries::from_points(vec![point(3, 3.0), point(1, 1.0), point(3, 4.0)]);
        let prices: Vec<f64> = series.points().iter().map(|p| p.price).collect();
        assert_eq!(prices, vec![1.0, 4.0]);
        assert_eq!(series.first_date(), Some(d(1)));
    }
}
