//! Engine configuration
//!
//! Per-operation timeouts, the initial encryption flag for new peripherals and
//! the default log filter. Stored as JSON in:
//! - macOS: ~/Library/Application Support/switchlink/engine.json
//! - Linux: ~/.config/switchlink/engine.json
//! - Windows: %APPDATA%\switchlink\engine.json
//!
//! Key material is never part of this file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur during config validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid timeout: {0} must be > 0")]
    ZeroTimeout(&'static str),

    #[error("Invalid error-disconnect timeout: {error_disconnect_ms}ms is shorter than disconnect timeout {disconnect_ms}ms")]
    ErrorDisconnectTooShort {
        disconnect_ms: u64,
        error_disconnect_ms: u64,
    },

    #[error("Invalid log filter: must not be empty")]
    EmptyLogFilter,
}

// ============================================================================
// TIMEOUTS
// ============================================================================

/// Timeout per operation kind, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub connect_ms: u64,
    pub disconnect_ms: u64,
    /// Longer than `disconnect_ms`: the stack may already be misbehaving
    pub error_disconnect_ms: u64,
    pub await_disconnect_ms: u64,
    pub get_services_ms: u64,
    pub get_characteristics_ms: u64,
    pub read_characteristic_ms: u64,
    pub write_characteristic_ms: u64,
    /// Delay after which an unacknowledged write counts as delivered
    pub write_without_response_delay_ms: u64,
    pub enable_notifications_ms: u64,
    pub disable_notifications_ms: u64,
    /// Fallback timer for read-once-via-notification
    pub notification_ms: u64,
    /// Default overall timeout for multi-step control streams
    pub stream_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            disconnect_ms: 3_000,
            error_disconnect_ms: 5_000,
            await_disconnect_ms: 5_000,
            get_services_ms: 3_000,
            get_characteristics_ms: 3_000,
            read_characteristic_ms: 3_000,
            write_characteristic_ms: 4_000,
            write_without_response_delay_ms: 200,
            enable_notifications_ms: 2_000,
            disable_notifications_ms: 2_000,
            notification_ms: 5_000,
            stream_ms: 15_000,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn disconnect(&self) -> Duration {
        Duration::from_millis(self.disconnect_ms)
    }

    pub fn error_disconnect(&self) -> Duration {
        Duration::from_millis(self.error_disconnect_ms)
    }

    pub fn await_disconnect(&self) -> Duration {
        Duration::from_millis(self.await_disconnect_ms)
    }

    pub fn get_services(&self) -> Duration {
        Duration::from_millis(self.get_services_ms)
    }

    pub fn get_characteristics(&self) -> Duration {
        Duration::from_millis(self.get_characteristics_ms)
    }

    pub fn read_characteristic(&self) -> Duration {
        Duration::from_millis(self.read_characteristic_ms)
    }

    pub fn write_characteristic(&self) -> Duration {
        Duration::from_millis(self.write_characteristic_ms)
    }

    pub fn write_without_response_delay(&self) -> Duration {
        Duration::from_millis(self.write_without_response_delay_ms)
    }

    pub fn enable_notifications(&self) -> Duration {
        Duration::from_millis(self.enable_notifications_ms)
    }

    pub fn disable_notifications(&self) -> Duration {
        Duration::from_millis(self.disable_notifications_ms)
    }

    pub fn notification(&self) -> Duration {
        Duration::from_millis(self.notification_ms)
    }

    pub fn stream(&self) -> Duration {
        Duration::from_millis(self.stream_ms)
    }

    /// Validate timeout values
    pub fn validate(&self) -> Result<(), ConfigError> {
        let named = [
            ("connect_ms", self.connect_ms),
            ("disconnect_ms", self.disconnect_ms),
            ("error_disconnect_ms", self.error_disconnect_ms),
            ("await_disconnect_ms", self.await_disconnect_ms),
            ("get_services_ms", self.get_services_ms),
            ("get_characteristics_ms", self.get_characteristics_ms),
            ("read_characteristic_ms", self.read_characteristic_ms),
            ("write_characteristic_ms", self.write_characteristic_ms),
            (
                "write_without_response_delay_ms",
                self.write_without_response_delay_ms,
            ),
            ("enable_notifications_ms", self.enable_notifications_ms),
            ("disable_notifications_ms", self.disable_notifications_ms),
            ("notification_ms", self.notification_ms),
            ("stream_ms", self.stream_ms),
        ];

        if let Some((name, _)) = named.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroTimeout(*name));
        }

        if self.error_disconnect_ms < self.disconnect_ms {
            return Err(ConfigError::ErrorDisconnectTooShort {
                disconnect_ms: self.disconnect_ms,
                error_disconnect_ms: self.error_disconnect_ms,
            });
        }

        Ok(())
    }
}

// ============================================================================
// ENCRYPTION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Initial encryption flag for every newly seen peripheral
    pub enabled: bool,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// ============================================================================
// ENGINE CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub timeouts: TimeoutConfig,
    pub encryption: EncryptionConfig,
    /// Fallback `tracing` filter when `RUST_LOG` is not set
    pub log_filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            encryption: EncryptionConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Validate the whole configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timeouts.validate()?;
        if self.log_filter.trim().is_empty() {
            return Err(ConfigError::EmptyLogFilter);
        }
        Ok(())
    }

    /// Default config file location (cross-platform)
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("switchlink");
        Ok(config_dir.join("engine.json"))
    }

    /// Load config from file, or fall back to defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: EngineConfig =
            serde_json::from_str(&contents).context("Failed to parse config file")?;
        config.validate().context("Config file failed validation")?;
        Ok(config)
    }

    /// Save config to file, creating parent directories as needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents =
            serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }
}
