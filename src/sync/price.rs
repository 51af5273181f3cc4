use super::lock;
use crate::core::{
    asset::Ticker,
    cache::{KeyValueCollection, get_json, put_json},
    price::QuoteProvider,
    snapshot::{MarketSnapshot, MergeReport, merge},
};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const SNAPSHOT_KEY: &str = "snapshot";

/// Result of one synchronization cycle. Never an error: failures degrade to
/// the persisted snapshot or to an explicit no-data state.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    /// Nothing to request.
    Skipped,
    Applied(MergeReport),
    /// A newer response was applied first.
    Discarded { sequence: u64 },
    /// The request failed and the last known prices are shown instead.
    Fallback { warning: String },
    /// The request failed and no prices are known.
    NoData { warning: String },
}

impl SyncOutcome {
    /// The one summarized warning for this cycle, if any.
    pub fn warning(&self) -> Option<String> {
        match self {
            SyncOutcome::Applied(report) => report.warning(),
            SyncOutcome::Fallback { warning } | SyncOutcome::NoData { warning } => {
                Some(warning.clone())
            }
            SyncOutcome::Skipped | SyncOutcome::Discarded { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
struct TrackedTickers {
    tickers: BTreeSet<Ticker>,
    best_effort: BTreeSet<String>,
}

/// Keeps the market snapshot current for the tracked ticker set.
pub struct PriceSynchronizer {
    provider: Arc<dyn QuoteProvider>,
    collection: Arc<dyn KeyValueCollection>,
    tracked: Mutex<TrackedTickers>,
    last_issued: AtomicU64,
    snapshot: watch::Sender<Arc<MarketSnapshot>>,
    interval: watch::Sender<Duration>,
}

impl PriceSynchronizer {
    pub fn new(
        provider: Arc<dyn QuoteProvider>,
        collection: Arc<dyn KeyValueCollection>,
        interval: Duration,
    ) -> Self {
        Self {
            provider,
            collection,
            tracked: Mutex::new(TrackedTickers::default()),
            last_issued: AtomicU64::new(0),
            snapshot: watch::Sender::new(Arc::new(MarketSnapshot::default())),
            interval: watch::Sender::new(interval),
        }
    }

    pub fn snapshot(&self) -> Arc<MarketSnapshot> {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MarketSnapshot>> {
        self.snapshot.subscribe()
    }

    pub fn tickers(&self) -> BTreeSet<Ticker> {
        lock(&self.tracked).tickers.clone()
    }

    pub fn interval(&self) -> Duration {
        *self.interval.borrow()
    }

    pub fn set_interval(&self, interval: Duration) {
        self.interval.send_replace(interval);
    }

    /// Replaces the tracked set. Syncs right away when its membership changed.
    pub async fn update_tickers(
        &self,
        tickers: BTreeSet<Ticker>,
        best_effort: BTreeSet<String>,
    ) -> Option<SyncOutcome> {
        let changed = {
            let mut tracked = lock(&self.tracked);
            tracked.best_effort = best_effort;
            let changed = tracked.tickers != tickers;
            tracked.tickers = tickers;
            changed
        };
        if changed {
            debug!("Ticker set changed, syncing now");
            Some(self.sync().await)
        } else {
            None
        }
    }

    /// One batched request for the whole tracked set.
    pub async fn sync(&self) -> SyncOutcome {
        let (tickers, best_effort) = {
            let tracked = lock(&self.tracked);
            (tracked.tickers.clone(), tracked.best_effort.clone())
        };
        if tickers.is_empty() {
            return SyncOutcome::Skipped;
        }

        let sequence = self.last_issued.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(sequence, count = tickers.len(), "Requesting quotes");

        let batch = match self.provider.fetch_quotes(&tickers).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(sequence, error = %e, "Price sync failed");
                return self.fall_back(format!("Price sync failed: {e:#}")).await;
            }
        };

        let now = Utc::now();
        let mut report = None;
        self.snapshot.send_if_modified(|current| {
            match merge(current, &tickers, &best_effort, &batch, sequence, now) {
                Some((next, merged)) => {
                    *current = Arc::new(next);
                    report = Some(merged);
                    true
                }
                None => false,
            }
        });

        match report {
            Some(report) => {
                info!(
                    sequence,
                    updated = report.updated.len(),
                    stale = report.stale.len(),
                    missing = report.missing.len(),
                    "Applied price snapshot"
                );
                let latest = self.snapshot();
                put_json(self.collection.as_ref(), SNAPSHOT_KEY, latest.as_ref()).await;
                SyncOutcome::Applied(report)
            }
            None => {
                debug!(sequence, "Discarding out-of-order response");
                SyncOutcome::Discarded { sequence }
            }
        }
    }

    async fn fall_back(&self, warning: String) -> SyncOutcome {
        if !self.snapshot.borrow().is_empty() {
            return SyncOutcome::Fallback { warning };
        }

        let persisted: Option<MarketSnapshot> =
            get_json(self.collection.as_ref(), SNAPSHOT_KEY).await;
        let Some(persisted) = persisted.filter(|s| !s.is_empty()) else {
            return SyncOutcome::NoData { warning };
        };

        let installed = self.snapshot.send_if_modified(|current| {
            if !current.is_empty() {
                return false;
            }
            let mut restored = persisted.as_stale();
            // Sequences from an earlier session mean nothing here.
            restored.last_sequence = current.last_sequence;
            *current = Arc::new(restored);
            true
        });
        if installed {
            info!(entries = persisted.len(), "Restored persisted price snapshot");
        }
        SyncOutcome::Fallback { warning }
    }

    /// Clears the snapshot and the tracked set. Responses to requests already
    /// in flight are discarded.
    pub fn reset(&self) {
        *lock(&self.tracked) = TrackedTickers::default();
        let issued = self.last_issued.load(Ordering::SeqCst);
        self.snapshot.send_replace(Arc::new(MarketSnapshot {
            last_sequence: issued,
            ..MarketSnapshot::default()
        }));
    }

    pub(crate) fn watch_interval(&self) -> watch::Receiver<Duration> {
        self.interval.subscribe()
    }
}
