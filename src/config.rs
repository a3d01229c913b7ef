use log::{debug, info};
use std::env;
use std::time::Duration;

use crate::error::ConfigError;

const DEFAULT_SCAN_TIMEOUT_SECS: u64 = 15;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_NEGOTIATION_TIMEOUT_SECS: u64 = 10;
const MAX_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Case-insensitive substring a peripheral's name must contain to be listed.
    pub name_filter: Option<String>,
    pub scan_timeout: Duration,
    pub connect_timeout: Duration,
    pub negotiation_timeout: Duration,
    /// Adapter such as `hci0`; the default adapter when unset.
    pub adapter: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            name_filter: None,
            scan_timeout: Duration::from_secs(DEFAULT_SCAN_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            negotiation_timeout: Duration::from_secs(DEFAULT_NEGOTIATION_TIMEOUT_SECS),
            adapter: None,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup (the process environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let secs = |key: &'static str, default: u64| -> Result<Duration, ConfigError> {
            let Some(raw) = non_empty(key) else {
                return Ok(Duration::from_secs(default));
            };
            let value: u64 = raw.parse().map_err(|_| ConfigError::NotANumber {
                name: key,
                value: raw.clone(),
            })?;
            if !(1..=MAX_TIMEOUT_SECS).contains(&value) {
                return Err(ConfigError::OutOfRange {
                    name: key,
                    value,
                    min: 1,
                    max: MAX_TIMEOUT_SECS,
                });
            }
            Ok(Duration::from_secs(value))
        };

        let config = SessionConfig {
            name_filter: non_empty("PROBE_NAME_FILTER"),
            scan_timeout: secs("SCAN_TIMEOUT_SECS", DEFAULT_SCAN_TIMEOUT_SECS)?,
            connect_timeout: secs("CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)?,
            negotiation_timeout: secs(
                "NEGOTIATION_TIMEOUT_SECS",
                DEFAULT_NEGOTIATION_TIMEOUT_SECS,
            )?,
            adapter: non_empty("BLUETOOTH_ADAPTER"),
        };

        match &config.name_filter {
            Some(filter) => info!("Listing only probes whose name contains '{}'", filter),
            None => info!("No probe name filter configured, listing every device"),
        }
        debug!("Session configuration: {:?}", config);

        Ok(config)
    }
}
