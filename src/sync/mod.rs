//! Stateful synchronization services. Each one owns its entity and publishes
//! immutable `Arc` snapshots of it through a `tokio::sync::watch` channel.

pub mod fx;
pub mod history;
pub mod price;
pub mod returns;

pub use fx::{CurrencyRateManager, RateRefresh};
pub use history::HistoricalReconciler;
pub use price::{PriceSynchronizer, SyncOutcome};
pub use returns::ReturnEngine;

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Runs `tick` every period read from `interval`. A new period takes effect
/// immediately; the loop ends when the interval sender is dropped.
pub(crate) fn spawn_polling<F, Fut>(
    worker: &'static str,
    mut interval: watch::Receiver<Duration>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        loop {
            let period = *interval.borrow_and_update();
            tokio::select! {
                _ = tokio::time::sleep(period) => tick().await,
                changed = interval.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    debug!(worker, "Polling interval changed");
                }
            }
        }
        debug!(worker, "Polling loop stopped");
    })
}

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
