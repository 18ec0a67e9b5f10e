//! Tether Configuration
//!
//! Broker address, registration timeout and store location. Loadable from
//! TOML; every field has a default so an empty file is valid.

use crate::error::{TetherError, TetherResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default bound on broker registration, in seconds
pub const DEFAULT_BROKER_TIMEOUT_SECS: u64 = 30;

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    /// Base URL of the rendezvous broker, e.g. `https://broker.example.org`
    pub broker_address: Option<String>,

    /// Upper bound on opening the broker link and registering the whitelist
    pub broker_timeout_secs: u64,

    /// File backing the key-value store
    pub store_path: Option<PathBuf>,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            broker_address: None,
            broker_timeout_secs: DEFAULT_BROKER_TIMEOUT_SECS,
            store_path: None,
        }
    }
}

impl TetherConfig {
    /// Configuration for tests against a local broker
    pub fn testing() -> Self {
        Self {
            broker_address: Some("http://localhost:9000".to_string()),
            broker_timeout_secs: 5,
            store_path: None,
        }
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> TetherResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TetherError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| TetherError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Registration timeout as a [`Duration`]
    pub fn broker_timeout(&self) -> Duration {
        Duration::from_secs(self.broker_timeout_secs)
    }

    /// Validate configuration settings
    pub fn validate(&self) -> TetherResult<()> {
        if self.broker_timeout_secs == 0 {
            return Err(TetherError::Config(
                "broker_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if let Some(address) = &self.broker_address {
            validate_broker_address(address)?;
        }

        Ok(())
    }
}

/// Check that a broker address is an absolute http(s) URL
pub fn validate_broker_address(address: &str) -> TetherResult<()> {
    let rest = address
        .strip_prefix("https://")
        .or_else(|| address.strip_prefix("http://"))
        .ok_or_else(|| {
            TetherError::Config(format!(
                "broker address must start with http:// or https://: {address}"
            ))
        })?;

    if rest.is_empty() {
        return Err(TetherError::Config(format!(
            "broker address has no host: {address}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TetherConfig::default();
        assert_eq!(config.broker_timeout(), Duration::from_secs(30));
        assert!(config.broker_address.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = TetherConfig::testing();
        assert!(config.validate().is_ok());

        config.broker_timeout_secs = 0;
        assert!(config.validate().is_err());

        config.broker_timeout_secs = 10;
        config.broker_address = Some("broker.example.org".to_string());
        assert!(config.validate().is_err());

        config.broker_address = Some("https://".to_string());
        assert!(config.validate().is_err());

        config.broker_address = Some("https://broker.example.org".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "broker_address = \"http://127.0.0.1:9000\"").unwrap();

        let config = TetherConfig::load(file.path()).unwrap();
        assert_eq!(
            config.broker_address.as_deref(),
            Some("http://127.0.0.1:9000")
        );
        assert_eq!(config.broker_timeout_secs, DEFAULT_BROKER_TIMEOUT_SECS);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "broker_timeout_secs = 0").unwrap();

        let err = TetherConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, TetherError::Config(_)));
    }
}
