//! CLI configuration loading

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tether::TetherConfig;
use tracing::debug;

/// Environment variable overriding the configured broker address
pub const BROKER_URL_ENV: &str = "TETHER_BROKER_URL";

/// Key-value store location when the config names none
pub const DEFAULT_STORE_PATH: &str = ".tether/state.json";

/// Load the config file if present, then apply environment overrides
pub fn load_config(path: &Path) -> Result<TetherConfig> {
    let config = if path.exists() {
        TetherConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?
    } else {
        debug!(path = %path.display(), "No config file, using defaults");
        TetherConfig::default()
    };

    let config = apply_overrides(config, std::env::var(BROKER_URL_ENV).ok());
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn apply_overrides(mut config: TetherConfig, broker_url: Option<String>) -> TetherConfig {
    if let Some(url) = broker_url.filter(|url| !url.trim().is_empty()) {
        debug!(broker = %url, "Broker address taken from {BROKER_URL_ENV}");
        config.broker_address = Some(url);
    }
    config
}

/// File backing the identity store
pub fn store_path(config: &TetherConfig) -> PathBuf {
    config
        .store_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH))
}
