use super::lock;
use crate::core::{
    asset::{AssetRecord, Ticker},
    cache::{KeyValueCollection, get_json, put_json},
    price::HistoryProvider,
    rates::ExchangeRateTable,
    resolver::Resolver,
    series::{self, AssetValues, HistoricalSeries, ReconciledSeries, SeriesPoint},
};
use chrono::{DateTime, Utc};
use futures::future::{AbortHandle, Abortable, join_all};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Raw series as last fetched, with the rate of the asset currency at that
/// time if one was known.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedHistory {
    series: HistoricalSeries,
    #[serde(default)]
    fx_rate: Option<f64>,
    fetched_at: DateTime<Utc>,
}

/// Chart a reconciliation feeds. A new run only replaces a run of the same view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum HistoryView {
    Assets,
    Groups,
}

/// Fetches per-asset history and aligns it onto one date axis.
pub struct HistoricalReconciler {
    provider: Arc<dyn HistoryProvider>,
    collection: Arc<dyn KeyValueCollection>,
    days: u32,
    running: Mutex<HashMap<HistoryView, AbortHandle>>,
}

impl HistoricalReconciler {
    pub fn new(
        provider: Arc<dyn HistoryProvider>,
        collection: Arc<dyn KeyValueCollection>,
        days: u32,
    ) -> Self {
        Self {
            provider,
            collection,
            days,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Aligned "ALL" and per-asset series, or `None` if the run was aborted.
    pub async fn reconcile(
        &self,
        assets: &[AssetRecord],
        resolver: &Resolver,
        rates: &ExchangeRateTable,
    ) -> Option<ReconciledSeries> {
        let values = self.run(HistoryView::Assets, assets, resolver, rates).await?;
        let reconciled = series::reconcile(&values);
        info!(
            assets = reconciled.per_asset.len(),
            dates = reconciled.len(),
            "Reconciled history"
        );
        Some(reconciled)
    }

    /// Aligned series summed per group label.
    pub async fn reconcile_by_group(
        &self,
        assets: &[AssetRecord],
        resolver: &Resolver,
        rates: &ExchangeRateTable,
    ) -> Option<BTreeMap<String, Vec<SeriesPoint>>> {
        let values = self.run(HistoryView::Groups, assets, resolver, rates).await?;
        Some(series::reconcile_by_group(&values))
    }

    /// Aborts every reconciliation in progress.
    pub fn cancel(&self) {
        for (view, handle) in lock(&self.running).drain() {
            debug!(?view, "Cancelling history reconciliation");
            handle.abort();
        }
    }

    /// Starting a run aborts the previous run of the same view.
    async fn run(
        &self,
        view: HistoryView,
        assets: &[AssetRecord],
        resolver: &Resolver,
        rates: &ExchangeRateTable,
    ) -> Option<Vec<AssetValues>> {
        let (handle, registration) = AbortHandle::new_pair();
        if let Some(previous) = lock(&self.running).insert(view, handle) {
            previous.abort();
        }

        match Abortable::new(self.collect(assets, resolver, rates), registration).await {
            Ok(values) => Some(values),
            Err(_) => {
                debug!("History reconciliation aborted");
                None
            }
        }
    }

    /// Fetches every market-priced asset concurrently. Failures degrade per asset.
    async fn collect(
        &self,
        assets: &[AssetRecord],
        resolver: &Resolver,
        rates: &ExchangeRateTable,
    ) -> Vec<AssetValues> {
        let fetches = assets.iter().filter_map(|record| {
            let resolution = resolver.resolve(record)?;
            Some(self.asset_values(record, resolution.ticker, rates))
        });
        join_all(fetches).await
    }

    async fn asset_values(
        &self,
        record: &AssetRecord,
        ticker: Ticker,
        rates: &ExchangeRateTable,
    ) -> AssetValues {
        let currency = record.currency_code();
        match self
            .provider
            .fetch_history(&ticker, self.days, &currency)
            .await
        {
            Ok(series) => {
                let cached = CachedHistory {
                    fx_rate: rates.rate(&currency),
                    fetched_at: Utc::now(),
                    series,
                };
                put_json(self.collection.as_ref(), &record.id, &cached).await;
                contributions(record, &cached.series, rates, Some(record.initial_value()))
            }
            Err(e) => {
                warn!(asset = %record.id, error = %e, "History fetch failed");
                let cached: Option<CachedHistory> =
                    get_json(self.collection.as_ref(), &record.id).await;
                match cached {
                    Some(cached) => {
                        debug!(
                            asset = %record.id,
                            fetched_at = %cached.fetched_at,
                            "Using cached history"
                        );
                        let initial_cost = cached.fx_rate.map(|rate| record.initial_value() * rate);
                        if initial_cost.is_none() {
                            debug!(asset = %record.id, "No cached rate, initial cost left out");
                        }
                        contributions(record, &cached.series, rates, initial_cost)
                    }
                    None => contributions(
                        record,
                        &HistoricalSeries::default(),
                        rates,
                        Some(record.initial_value()),
                    ),
                }
            }
        }
    }
}

/// `price * fxRate(currency) * quantity` per date. Points in a currency
/// without a known rate are dropped.
fn contributions(
    record: &AssetRecord,
    series: &HistoricalSeries,
    rates: &ExchangeRateTable,
    initial_cost_eur: Option<f64>,
) -> AssetValues {
    let mut values = BTreeMap::new();
    let mut dropped = 0;
    for point in series.points() {
        match rates.rate(&point.currency) {
            Some(rate) => {
                values.insert(point.date, point.price * rate * record.quantity);
            }
            None => dropped += 1,
        }
    }
    if dropped > 0 {
        warn!(asset = %record.id, dropped, "Dropped history points without an exchange rate");
    }

    AssetValues {
        asset_id: record.id.clone(),
        group: record.group.clone(),
        initial_cost_eur,
        values,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::asset::AssetKind;
    use crate::core::rates::RateSource;
    use crate::core::series::HistoricalPoint;
    use crate::store::memory::MemoryCollection;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::time::Duration;

    /// Serves fixed series per ticker id after `delay`; unknown ids fail.
    struct FixedHistory {
        series: HashMap<String, Vec<(u32, f64, &'static str)>>,
        delay: Duration,
    }

    #[async_trait]
    impl HistoryProvider for FixedHistory {
        async fn fetch_history(
            &self,
            ticker: &Ticker,
            _days: u32,
            _fallback_currency: &str,
        ) -> Result<HistoricalSeries> {
            tokio::time::sleep(self.delay).await;
            let points = self
                .series
                .get(&ticker.id)
                .ok_or_else(|| anyhow!("no history for {}", ticker.id))?;
            Ok(HistoricalSeries::from_points(
                points
                    .iter()
                    .map(|(day, price, currency)| HistoricalPoint {
                        date: day_of(*day),
                        price: *price,
                        currency: currency.to_string(),
                    })
                    .collect(),
            ))
        }
    }

    fn day_of(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
    }

    fn record(id: &str, symbol: &str, kind: AssetKind, quantity: f64) -> AssetRecord {
        AssetRecord {
            id: id.to_string(),
            canonical_id: None,
            name: symbol.to_string(),
            symbol: Some(symbol.to_string()),
            kind,
            quantity,
            unit_cost: 10.0,
            currency: "EUR".to_string(),
            acquired_on: day_of(1),
            group: None,
        }
    }

    fn reconciler(
        series: Vec<(&str, Vec<(u32, f64, &'static str)>)>,
        delay: Duration,
        collection: Arc<MemoryCollection>,
    ) -> HistoricalReconciler {
        let provider = FixedHistory {
            series: series
                .into_iter()
                .map(|(id, points)| (id.to_string(), points))
                .collect(),
            delay,
        };
        HistoricalReconciler::new(Arc::new(provider), collection, 30)
    }

    #[tokio::test]
    async fn aligns_assets_with_forward_fill() {
        let history = reconciler(
            vec![
                ("A", vec![(1, 10.0, "EUR"), (3, 30.0, "EUR")]),
                ("B", vec![(2, 5.0, "EUR"), (3, 15.0, "EUR")]),
            ],
            Duration::ZERO,
            Arc::new(MemoryCollection::new()),
        );
        let assets = vec![
            record("a", "A", AssetKind::Stock, 1.0),
            record("b", "B", AssetKind::Stock, 1.0),
            record("house", "HOUSE", AssetKind::RealEstate, 1.0),
        ];

        let reconciled = history
            .reconcile(&assets, &Resolver::default(), &ExchangeRateTable::new())
            .await
            .unwrap();

        assert_eq!(reconciled.dates, vec![day_of(2), day_of(3)]);
        assert_eq!(reconciled.totals, vec![15.0, 45.0]);
        assert_eq!(reconciled.asset("a").unwrap()[0].value, 10.0);
        assert!(reconciled.asset("house").is_none());
    }

    #[tokio::test]
    async fn converts_points_and_drops_unknown_currencies() {
        let history = reconciler(
            vec![("A", vec![(1, 100.0, "USD"), (2, 100.0, "JPY"), (3, 110.0, "USD")])],
            Duration::ZERO,
            Arc::new(MemoryCollection::new()),
        );
        let mut rates = ExchangeRateTable::new();
        rates.set("USD", 0.9, RateSource::Server, Utc::now());

        let reconciled = history
            .reconcile(
                &[record("a", "A", AssetKind::Stock, 2.0)],
                &Resolver::default(),
                &rates,
            )
            .await
            .unwrap();

        assert_eq!(reconciled.dates, vec![day_of(1), day_of(3)]);
        assert_eq!(reconciled.totals, vec![180.0, 198.0]);
        assert_eq!(reconciled.initial_costs["a"], 20.0);
    }

    #[tokio::test]
    async fn failed_fetch_uses_cached_series() {
        let collection = Arc::new(MemoryCollection::new());
        let cached = CachedHistory {
            series: HistoricalSeries::from_points(vec![HistoricalPoint {
                date: day_of(5),
                price: 7.0,
                currency: "EUR".to_string(),
            }]),
            fx_rate: Some(0.5),
            fetched_at: Utc::now(),
        };
        put_json(collection.as_ref(), "gone", &cached).await;

        let history = reconciler(
            vec![("A", vec![(5, 10.0, "EUR")])],
            Duration::ZERO,
            collection,
        );
        let assets = vec![
            record("a", "A", AssetKind::Stock, 1.0),
            record("gone", "GONE", AssetKind::Stock, 1.0),
            record("never", "NEVER", AssetKind::Crypto, 1.0),
        ];

        let reconciled = history
            .reconcile(&assets, &Resolver::default(), &ExchangeRateTable::new())
            .await
            .unwrap();

        assert_eq!(reconciled.totals, vec![17.0]);
        // Cache path re-derives the initial cost with the stored rate
        assert_eq!(reconciled.initial_costs["gone"], 5.0);
        assert!(reconciled.asset("never").is_none());
        assert_eq!(reconciled.initial_costs["never"], 10.0);
    }

    #[tokio::test]
    async fn live_fetch_is_cached_by_asset_id() {
        let collection = Arc::new(MemoryCollection::new());
        let history = reconciler(
            vec![("A", vec![(1, 10.0, "EUR")])],
            Duration::ZERO,
            collection.clone(),
        );

        history
            .reconcile(
                &[record("a", "A", AssetKind::Stock, 1.0)],
                &Resolver::default(),
                &ExchangeRateTable::new(),
            )
            .await;

        let cached: CachedHistory = get_json(collection.as_ref(), "a").await.unwrap();
        assert_eq!(cached.series.len(), 1);
        assert_eq!(cached.fx_rate, Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn fetches_run_concurrently() {
        let history = reconciler(
            vec![
                ("A", vec![(1, 1.0, "EUR")]),
                ("B", vec![(1, 1.0, "EUR")]),
                ("C", vec![(1, 1.0, "EUR")]),
            ],
            Duration::from_millis(100),
            Arc::new(MemoryCollection::new()),
        );
        let assets = vec![
            record("a", "A", AssetKind::Stock, 1.0),
            record("b", "B", AssetKind::Stock, 1.0),
            record("c", "C", AssetKind::Crypto, 1.0),
        ];

        let started = tokio::time::Instant::now();
        let reconciled = history
            .reconcile(&assets, &Resolver::default(), &ExchangeRateTable::new())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(reconciled.totals, vec![3.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_aborts_the_running_reconciliation() {
        let history = reconciler(
            vec![("A", vec![(1, 1.0, "EUR")])],
            Duration::from_secs(5),
            Arc::new(MemoryCollection::new()),
        );
        let assets = vec![record("a", "A", AssetKind::Stock, 1.0)];
        let resolver = Resolver::default();
        let rates = ExchangeRateTable::new();

        let (result, _) = tokio::join!(history.reconcile(&assets, &resolver, &rates), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            history.cancel();
        });

        assert!(result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn asset_and_group_views_run_side_by_side() {
        let history = reconciler(
            vec![("A", vec![(1, 4.0, "EUR")])],
            Duration::from_millis(100),
            Arc::new(MemoryCollection::new()),
        );
        let assets = vec![record("a", "A", AssetKind::Stock, 1.0)];
        let resolver = Resolver::default();
        let rates = ExchangeRateTable::new();

        let (all, groups) = tokio::join!(
            history.reconcile(&assets, &resolver, &rates),
            history.reconcile_by_group(&assets, &resolver, &rates)
        );

        assert_eq!(all.unwrap().totals, vec![4.0]);
        assert_eq!(groups.unwrap()[series::UNGROUPED][0].value, 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn rerun_of_the_same_view_replaces_the_previous_one() {
        let history = reconciler(
            vec![("A", vec![(1, 4.0, "EUR")])],
            Duration::from_millis(100),
            Arc::new(MemoryCollection::new()),
        );
        let assets = vec![record("a", "A", AssetKind::Stock, 1.0)];
        let resolver = Resolver::default();
        let rates = ExchangeRateTable::new();

        let (first, second) = tokio::join!(history.reconcile(&assets, &resolver, &rates), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            history.reconcile(&assets, &resolver, &rates).await
        });

        assert!(first.is_none());
        assert_eq!(second.unwrap().totals, vec![4.0]);
    }

    #[tokio::test]
    async fn unknown_rate_is_not_cached_as_parity() {
        let collection = Arc::new(MemoryCollection::new());
        let mut yen = record("j", "J", AssetKind::Stock, 1.0);
        yen.currency = "JPY".to_string();

        let live = reconciler(
            vec![("J", vec![(1, 1000.0, "JPY")])],
            Duration::ZERO,
            collection.clone(),
        );
        live.reconcile(&[yen.clone()], &Resolver::default(), &ExchangeRateTable::new())
            .await
            .unwrap();
        let cached: CachedHistory = get_json(collection.as_ref(), "j").await.unwrap();
        assert_eq!(cached.fx_rate, None);

        // Backend gone: the cached series is used but its cost basis stays unknown
        let offline = reconciler(vec![], Duration::ZERO, collection);
        let reconciled = offline
            .reconcile(&[yen], &Resolver::default(), &ExchangeRateTable::new())
            .await
            .unwrap();
        assert!(!reconciled.initial_costs.contains_key("j"));
    }

    #[tokio::test]
    async fn groups_sum_per_label() {
        let history = reconciler(
            vec![
                ("A", vec![(1, 10.0, "EUR")]),
                ("B", vec![(1, 5.0, "EUR")]),
                ("C", vec![(1, 1.0, "EUR")]),
            ],
            Duration::ZERO,
            Arc::new(MemoryCollection::new()),
        );
        let mut a = record("a", "A", AssetKind::Stock, 1.0);
        a.group = Some("Tech".to_string());
        let mut b = record("b", "B", AssetKind::Stock, 1.0);
        b.group = Some("Tech".to_string());
        let c = record("c", "C", AssetKind::Crypto, 1.0);

        let groups = history
            .reconcile_by_group(&[a, b, c], &Resolver::default(), &ExchangeRateTable::new())
            .await
            .unwrap();

        assert_eq!(groups["Tech"][0].value, 15.0);
        assert_eq!(groups[series::UNGROUPED][0].value, 1.0);
        assert_eq!(groups.len(), 2);
    }
}
