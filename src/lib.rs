pub mod core;
pub mod providers;
pub mod session;
pub mod store;
pub mod sync;

pub use session::{MarketSession, Providers};

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

/// Opens a session from the config file (or the default one), loads the
/// ticker directory and starts background polling. Must run inside a tokio
/// runtime.
pub async fn connect(config_path: Option<&str>) -> Result<Arc<MarketSession>> {
    info!("Market data session starting...");

    let config = match config_path {
        Some(path) => crate::core::config::SyncConfig::load_from_path(path)?,
        None => crate::core::config::SyncConfig::load()?,
    };
    debug!("Loaded config: {config:#?}");

    let session = Arc::new(MarketSession::open(&config)?);
    session.load_directory().await;
    session.start();
    Ok(session)
}
