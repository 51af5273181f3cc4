use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use std::{fs, path::PathBuf};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "http://localhost:3000/api";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub retries: usize,
    pub retry_delay_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        ProviderConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_secs: 15,
            retries: 2,
            retry_delay_ms: 500,
        }
    }
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SyncSettings {
    /// Cadence of the batched price sync.
    pub price_interval_secs: u64,
    /// Cadence of the authoritative FX refresh.
    pub fx_interval_secs: u64,
    /// Minimum gap between two publications of quote-derived rates.
    pub fx_throttle_secs: u64,
    /// Days of history requested per asset.
    pub history_days: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            price_interval_secs: 120,
            fx_interval_secs: 3600,
            fx_throttle_secs: 120,
            history_days: 30,
        }
    }
}

impl SyncSettings {
    pub fn price_interval(&self) -> Duration {
        Duration::from_secs(self.price_interval_secs.max(1))
    }

    pub fn fx_interval(&self) -> Duration {
        Duration::from_secs(self.fx_interval_secs.max(1))
    }

    pub fn fx_throttle(&self) -> Duration {
        Duration::from_secs(self.fx_throttle_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub provider: ProviderConfig,
    pub sync: SyncSettings,
    /// Extra `symbol -> canonical id` aliases, layered over the built-in ones.
    pub aliases: HashMap<String, String>,
    pub data_path: Option<String>,
}

impl SyncConfig {
    pub fn load() -> Result<Self> {
        debug!("Loading default config");
        let config_path = Self::default_config_path()?;
        if !config_path.exists() {
            debug!("No config at {}, using defaults", config_path.display());
            return Ok(Self::default());
        }
        Self::load_from_path(&config_path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("app", "foliosync", "foliosync")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn default_data_path(&self) -> Result<PathBuf> {
        if let Some(custom_path) = &self.data_path {
            return Ok(PathBuf::from(custom_path));
        }
        let proj_dirs = ProjectDirs::from("app", "foliosync", "foliosync")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.data_dir().to_path_buf())
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;
        debug!("Successfully loaded config");
        Ok(config)
    }
}
