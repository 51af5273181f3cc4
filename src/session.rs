//! One user session of market data: owns every synchronization service and
//! the asset list they work on.

use crate::core::{
    asset::AssetRecord,
    cache::{FX_COLLECTION, HISTORY_COLLECTION, MARKET_COLLECTION, Store},
    config::SyncConfig,
    currency::CurrencyRateProvider,
    metadata::{DirectoryProvider, ReturnTable, ReturnsProvider},
    price::{HistoryProvider, QuoteProvider},
    rates::ExchangeRateTable,
    resolver::{AliasTable, Resolver},
    series::{ReconciledSeries, SeriesPoint},
    snapshot::MarketSnapshot,
    valuation::{PortfolioValue, unit_price_eur, value_portfolio},
};
use crate::providers::MarketDataService;
use crate::store::KeyValueStore;
use crate::sync::{
    CurrencyRateManager, HistoricalReconciler, PriceSynchronizer, RateRefresh, ReturnEngine,
    SyncOutcome, fx::required_currencies, lock, spawn_polling,
};
use anyhow::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The external services a session talks to.
#[derive(Clone)]
pub struct Providers {
    pub directory: Arc<dyn DirectoryProvider>,
    pub quotes: Arc<dyn QuoteProvider>,
    pub history: Arc<dyn HistoryProvider>,
    pub rates: Arc<dyn CurrencyRateProvider>,
    pub returns: Arc<dyn ReturnsProvider>,
}

impl Providers {
    /// Every contract served by one market data client.
    pub fn from_service(service: Arc<MarketDataService>) -> Self {
        Self {
            directory: service.clone(),
            quotes: service.clone(),
            history: service.clone(),
            rates: service.clone(),
            returns: service,
        }
    }
}

pub struct MarketSession {
    store: Arc<KeyValueStore>,
    directory: Arc<dyn DirectoryProvider>,
    resolver: RwLock<Arc<Resolver>>,
    assets: RwLock<Arc<Vec<AssetRecord>>>,
    prices: PriceSynchronizer,
    rates: CurrencyRateManager,
    history: HistoricalReconciler,
    returns: ReturnEngine,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MarketSession {
    /// Session backed by the configured data directory and market data service.
    pub fn open(config: &SyncConfig) -> Result<Self> {
        let store = KeyValueStore::open(&config.default_data_path()?)?;
        let service = MarketDataService::from_config(&config.provider)?;
        Ok(Self::new(
            config,
            Arc::new(store),
            Providers::from_service(Arc::new(service)),
        ))
    }

    pub fn new(config: &SyncConfig, store: Arc<KeyValueStore>, providers: Providers) -> Self {
        let settings = &config.sync;
        let aliases = AliasTable::with_overrides(&config.aliases);
        Self {
            prices: PriceSynchronizer::new(
                providers.quotes,
                store.collection(MARKET_COLLECTION),
                settings.price_interval(),
            ),
            rates: CurrencyRateManager::new(
                providers.rates,
                store.collection(FX_COLLECTION),
                settings.fx_interval(),
                settings.fx_throttle(),
            ),
            history: HistoricalReconciler::new(
                providers.history,
                store.collection(HISTORY_COLLECTION),
                settings.history_days,
            ),
            returns: ReturnEngine::new(providers.returns),
            directory: providers.directory,
            resolver: RwLock::new(Arc::new(Resolver::new(Default::default(), aliases))),
            assets: RwLock::new(Arc::new(Vec::new())),
            store,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Loads the ticker directory. On failure resolution continues with what
    /// it has, so unresolved assets fall back to their raw ids.
    pub async fn load_directory(&self) -> usize {
        match self.directory.fetch_directory().await {
            Ok(directory) => {
                let count = directory.len();
                self.update_resolver(|resolver| resolver.set_directory(directory));
                info!(entries = count, "Loaded ticker directory");
                count
            }
            Err(e) => {
                warn!(error = %e, "Ticker directory unavailable");
                self.resolver().directory().len()
            }
        }
    }

    pub fn resolver(&self) -> Arc<Resolver> {
        read(&self.resolver).clone()
    }

    pub fn assets(&self) -> Arc<Vec<AssetRecord>> {
        read(&self.assets).clone()
    }

    /// Replaces the asset list. Refreshes rates when the set of currencies in
    /// use changed and syncs prices when the ticker set changed.
    pub async fn set_assets(&self, records: Vec<AssetRecord>) -> Option<SyncOutcome> {
        let currencies = required_currencies(&records);
        *write(&self.assets) = Arc::new(records);

        if self.rates.set_currencies(currencies) {
            self.rates.refresh().await;
        }
        let outcome = self.refresh_tickers().await;
        if outcome.is_some() {
            self.observe_snapshot().await;
        }
        outcome
    }

    /// One price sync cycle for the current asset list.
    pub async fn sync_prices(&self) -> SyncOutcome {
        let outcome = self.prices.sync().await;
        match self.observe_snapshot().await {
            Some(resynced) => resynced,
            None => outcome,
        }
    }

    pub async fn refresh_rates(&self) -> RateRefresh {
        self.rates.refresh().await
    }

    /// Feeds the latest snapshot to the resolver and the rate manager. When
    /// newly remapped ids change the ticker set, syncs once more.
    async fn observe_snapshot(&self) -> Option<SyncOutcome> {
        let snapshot = self.prices.snapshot();
        self.rates.observe_snapshot(&snapshot);
        if snapshot.remap.is_empty() {
            return None;
        }
        let remapped = self.update_resolver(|resolver| resolver.observe_remap(&snapshot.remap));
        if !remapped {
            return None;
        }
        debug!("Server remapped ids, refreshing ticker set");
        let outcome = self.refresh_tickers().await;
        if outcome.is_some() {
            self.rates.observe_snapshot(&self.prices.snapshot());
        }
        outcome
    }

    async fn refresh_tickers(&self) -> Option<SyncOutcome> {
        let resolver = self.resolver();
        let assets = self.assets();
        self.prices
            .update_tickers(
                resolver.ticker_set(&assets),
                resolver.best_effort_ids(&assets),
            )
            .await
    }

    fn update_resolver<T>(&self, update: impl FnOnce(&mut Resolver) -> T) -> T {
        let mut guard = write(&self.resolver);
        let mut resolver = Resolver::clone(&guard);
        let result = update(&mut resolver);
        *guard = Arc::new(resolver);
        result
    }

    pub fn snapshot(&self) -> Arc<MarketSnapshot> {
        self.prices.snapshot()
    }

    pub fn rates(&self) -> Arc<ExchangeRateTable> {
        self.rates.table()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<Arc<MarketSnapshot>> {
        self.prices.subscribe()
    }

    pub fn subscribe_rates(&self) -> watch::Receiver<Arc<ExchangeRateTable>> {
        self.rates.subscribe()
    }

    pub fn subscribe_returns(&self) -> watch::Receiver<Option<Arc<ReturnTable>>> {
        self.returns.subscribe()
    }

    pub fn set_price_interval(&self, interval: Duration) {
        self.prices.set_interval(interval);
    }

    pub fn set_fx_interval(&self, interval: Duration) {
        self.rates.set_interval(interval);
    }

    pub fn valuation(&self) -> PortfolioValue {
        value_portfolio(
            &self.assets(),
            &self.resolver(),
            &self.prices.snapshot(),
            &self.rates.table(),
        )
    }

    pub async fn reconcile(&self) -> Option<ReconciledSeries> {
        let (assets, resolver, rates) = (self.assets(), self.resolver(), self.rates.table());
        self.history.reconcile(&assets, &resolver, &rates).await
    }

    pub async fn reconcile_by_group(&self) -> Option<BTreeMap<String, Vec<SeriesPoint>>> {
        let (assets, resolver, rates) = (self.assets(), self.resolver(), self.rates.table());
        self.history
            .reconcile_by_group(&assets, &resolver, &rates)
            .await
    }

    pub fn cancel_reconcile(&self) {
        self.history.cancel();
    }

    /// Annualized return for one asset, `None` for unknown ids.
    pub async fn annualized_return(&self, asset_id: &str) -> Option<f64> {
        let assets = self.assets();
        let record = assets.iter().find(|r| r.id == asset_id)?;
        let rates = self.rates.table();
        let price = unit_price_eur(record, &self.resolver(), &self.prices.snapshot(), &rates)
            .ok()
            .map(|(price, _)| price);
        Some(
            self.returns
                .annualized_return(record, price, &rates, Utc::now())
                .await,
        )
    }

    pub async fn refetch_returns(&self) -> Option<Arc<ReturnTable>> {
        self.returns.refetch().await
    }

    /// Starts the price and rate polling loops and the first returns fetch.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = lock(&self.tasks);
        if !tasks.is_empty() {
            debug!("Session already started");
            return;
        }

        let session = Arc::downgrade(self);
        tasks.push(spawn_polling(
            "prices",
            self.prices.watch_interval(),
            move || {
                let session = Weak::clone(&session);
                async move {
                    if let Some(session) = session.upgrade() {
                        if let Some(warning) = session.sync_prices().await.warning() {
                            warn!("{}", warning);
                        }
                    }
                }
            },
        ));

        let session = Arc::downgrade(self);
        tasks.push(spawn_polling(
            "fx",
            self.rates.watch_interval(),
            move || {
                let session = Weak::clone(&session);
                async move {
                    if let Some(session) = session.upgrade() {
                        if let Some(warning) = session.refresh_rates().await.warning() {
                            warn!("{}", warning);
                        }
                    }
                }
            },
        ));

        let returns = self.returns.clone();
        tasks.push(tokio::spawn(async move {
            returns.init().await;
        }));
        info!("Market session started");
    }

    /// Stops background work and drops all in-memory state.
    pub fn end(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.history.cancel();
        self.prices.reset();
        self.rates.reset();
        self.returns.reset();
        *write(&self.assets) = Arc::new(Vec::new());
        info!("Market session ended");
    }

    /// Ends the session and clears everything persisted on this device.
    pub async fn logout(&self) {
        self.end();
        self.store.clear_all().await;
    }
}

impl Drop for MarketSession {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
