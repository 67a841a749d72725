//! Adapter configuration.
//!
//! Defaults work out of the box; `CRDT_MAP_DEBOUNCE_MS` overrides the
//! debounce delay when loading from the environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable overriding the debounce delay, in milliseconds.
pub const DEBOUNCE_ENV: &str = "CRDT_MAP_DEBOUNCE_MS";

/// Quiet period before a burst of changes is written.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Adapter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Delay after the last change before the map is persisted.
    #[serde(rename = "debounce_ms", with = "millis")]
    pub debounce: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

impl SyncConfig {
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// Optional environment variables:
    /// - `CRDT_MAP_DEBOUNCE_MS`: debounce delay in milliseconds (default 100)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(raw) = lookup(DEBOUNCE_ENV) {
            let millis: u64 = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidDebounce(raw.clone()))?;
            if millis == 0 {
                return Err(ConfigError::InvalidDebounce(raw));
            }
            config.debounce = Duration::from_millis(millis);
        }

        Ok(config)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer, ser};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).map_err(ser::Error::custom)?;
        s.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("CRDT_MAP_DEBOUNCE_MS must be a positive number of milliseconds, got {0:?}")]
    InvalidDebounce(String),
}
