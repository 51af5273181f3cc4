use super::lock;
use crate::core::{
    asset::AssetRecord,
    irr::fallback_return,
    metadata::{ReturnTable, ReturnsProvider},
    rates::ExchangeRateTable,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

type SharedFetch = Shared<BoxFuture<'static, Option<Arc<ReturnTable>>>>;

#[derive(Default)]
struct EngineState {
    cache: Option<Arc<ReturnTable>>,
    in_flight: Option<SharedFetch>,
    /// Bumped on reset and refetch; results from older fetches are not cached.
    generation: u64,
}

struct Inner {
    provider: Arc<dyn ReturnsProvider>,
    state: Mutex<EngineState>,
    updates: watch::Sender<Option<Arc<ReturnTable>>>,
}

/// Server-computed annualized returns with one shared cache and at most one
/// request in flight.
#[derive(Clone)]
pub struct ReturnEngine {
    inner: Arc<Inner>,
}

impl ReturnEngine {
    pub fn new(provider: Arc<dyn ReturnsProvider>) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                state: Mutex::new(EngineState::default()),
                updates: watch::Sender::new(None),
            }),
        }
    }

    /// Eager first fetch. Returns whether server returns are available.
    pub async fn init(&self) -> bool {
        self.returns().await.is_some()
    }

    pub fn cached(&self) -> Option<Arc<ReturnTable>> {
        lock(&self.inner.state).cache.clone()
    }

    /// The cached table, or the result of the fetch every caller shares.
    pub async fn returns(&self) -> Option<Arc<ReturnTable>> {
        let fetch = {
            let mut state = lock(&self.inner.state);
            if let Some(cached) = &state.cache {
                return Some(Arc::clone(cached));
            }
            self.shared_fetch(&mut state)
        };
        fetch.await
    }

    /// Drops the cache and forces one new fetch, broadcast to subscribers.
    pub async fn refetch(&self) -> Option<Arc<ReturnTable>> {
        let fetch = {
            let mut state = lock(&self.inner.state);
            state.cache = None;
            state.in_flight = None;
            state.generation += 1;
            self.shared_fetch(&mut state)
        };
        fetch.await
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<ReturnTable>>> {
        self.inner.updates.subscribe()
    }

    /// Clears the cache; a fetch still in flight will not repopulate it.
    pub fn reset(&self) {
        {
            let mut state = lock(&self.inner.state);
            state.cache = None;
            state.in_flight = None;
            state.generation += 1;
        }
        self.inner.updates.send_replace(None);
    }

    pub async fn server_return(&self, asset_id: &str) -> Option<f64> {
        self.returns()
            .await
            .and_then(|table| table.get(asset_id).copied())
    }

    /// Server value for the asset when known, otherwise the local formula at
    /// `current_price` (EUR per unit) against the cost basis converted with
    /// `rates`. Without a price the return is 0.
    pub async fn annualized_return(
        &self,
        record: &AssetRecord,
        current_price: Option<f64>,
        rates: &ExchangeRateTable,
        now: DateTime<Utc>,
    ) -> f64 {
        if let Some(irr) = self.server_return(&record.id).await {
            return irr;
        }
        match current_price {
            Some(price) => fallback_return(record, price, rates, now),
            None => {
                debug!(asset = %record.id, "No price for local return");
                0.0
            }
        }
    }

    /// Joins the pending fetch or starts one.
    fn shared_fetch(&self, state: &mut EngineState) -> SharedFetch {
        if let Some(in_flight) = &state.in_flight {
            debug!("Joining in-flight returns fetch");
            return in_flight.clone();
        }

        let generation = state.generation;
        let inner = Arc::clone(&self.inner);
        let fetch = async move {
            let result = inner.provider.fetch_returns().await;
            let mut state = lock(&inner.state);
            let current = state.generation == generation;
            if current {
                state.in_flight = None;
            }
            match result {
                Ok(table) => {
                    let table = Arc::new(table);
                    if current {
                        state.cache = Some(Arc::clone(&table));
                        drop(state);
                        info!(assets = table.len(), "Fetched server returns");
                        inner.updates.send_replace(Some(Arc::clone(&table)));
                    }
                    Some(table)
                }
                Err(e) => {
                    warn!(error = %e, "Returns fetch failed");
                    None
                }
            }
        }
        .boxed()
        .shared();

        state.in_flight = Some(fetch.clone());
        fetch
    }
}
