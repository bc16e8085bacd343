//! Session configuration.

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::{DEFAULT_MAX_DECOMPRESSED_BYTES, MAX_QUALITY};
use crate::msg_store::DEFAULT_HISTORY_BYTES;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Tunables for a realtime session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Interval between keepalive pings, in milliseconds.
    pub keepalive_interval_ms: u64,
    /// Delay before buffered stream fragments are flushed, in milliseconds.
    pub flush_delay_ms: u64,
    /// Brotli quality for caller sends. `None` sends uncompressed.
    pub compression_quality: Option<u32>,
    /// Brotli quality for system sends. `None` sends uncompressed.
    pub system_compression_quality: Option<u32>,
    /// Cap on the size of a decompressed inbound frame.
    pub max_decompressed_bytes: usize,
    /// Timeout for opening the physical connection, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Bytes of event history kept for late subscribers.
    pub history_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: 5_000,
            flush_delay_ms: 50,
            compression_quality: Some(4),
            system_compression_quality: None,
            max_decompressed_bytes: DEFAULT_MAX_DECOMPRESSED_BYTES,
            connect_timeout_ms: 10_000,
            history_limit: DEFAULT_HISTORY_BYTES,
        }
    }
}

impl SessionConfig {
    /// Parse from a TOML string and validate.
    ///
    /// # Errors
    /// Returns error if the TOML is malformed or a value is out of range.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keepalive_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "keepalive_interval_ms",
                reason: "must be greater than zero".into(),
            });
        }
        for (field, quality) in [
            ("compression_quality", self.compression_quality),
            ("system_compression_quality", self.system_compression_quality),
        ] {
            if let Some(q) = quality.filter(|q| *q > MAX_QUALITY) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{q} exceeds {MAX_QUALITY}"),
                });
            }
        }
        if self.max_decompressed_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "max_decompressed_bytes",
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Keepalive interval.
    #[must_use]
    pub const fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Flush delay.
    #[must_use]
    pub const fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    /// Connect timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
