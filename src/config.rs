//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::Deserialize;
use serde::de::Error;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{LoggerError, Result};

/// Baud rates the sensor firmware is built with
pub const SUPPORTED_BAUD_RATES: &[u32] = &[9600, 115200];

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub collection: CollectionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Upper bound on a single line poll
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

/// Connection monitor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Delay after a fresh connect before the first health probe
    #[serde(default = "default_stabilize_ms")]
    pub stabilize_ms: u64,

    /// Extra delay after a detected drop before the next open attempt
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Treat the link as lost if a run is active and nothing was received
    /// for this long. Zero disables the check.
    #[serde(default)]
    pub max_read_silence_ms: u64,
}

/// Collection run configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CollectionConfig {
    /// Number of `Loop: N` reports the firmware sends per run
    #[serde(default = "default_total_loops")]
    pub total_loops: u32,

    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,

    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,

    /// Pause between the final stop command and closing the port
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// Reading store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_recent_limit")]
    pub recent_limit: u32,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Directory for daily rolling log files. Empty logs to the console only.
    #[serde(default)]
    pub log_dir: String,
}

// Default value functions
fn default_serial_port() -> String { "/dev/ttyUSB0".to_string() }
fn default_baud_rate() -> u32 { 115200 }
fn default_read_timeout_ms() -> u64 { 100 }

fn default_poll_interval_ms() -> u64 { 1000 }
fn default_stabilize_ms() -> u64 { 2000 }
fn default_cooldown_ms() -> u64 { 2000 }

fn default_total_loops() -> u32 { 5 }
fn default_timeout_s() -> u64 { 30 }
fn default_idle_sleep_ms() -> u64 { 100 }
fn default_shutdown_grace_ms() -> u64 { 500 }

fn default_database_url() -> String { "sqlite://moistureDB.db".to_string() }
fn default_recent_limit() -> u32 { 50 }

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stabilize_ms: default_stabilize_ms(),
            cooldown_ms: default_cooldown_ms(),
            max_read_silence_ms: 0,
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            total_loops: default_total_loops(),
            timeout_s: default_timeout_s(),
            idle_sleep_ms: default_idle_sleep_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            recent_limit: default_recent_limit(),
        }
    }
}

impl SerialConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stabilize(&self) -> Duration {
        Duration::from_millis(self.stabilize_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Read-silence window, or `None` when the check is disabled
    pub fn max_read_silence(&self) -> Option<Duration> {
        (self.max_read_silence_ms > 0).then(|| Duration::from_millis(self.max_read_silence_ms))
    }
}

impl CollectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_s)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use moisture_logger::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if self.serial.port.is_empty() {
            return Err(invalid("serial port cannot be empty"));
        }

        if !SUPPORTED_BAUD_RATES.contains(&self.serial.baud_rate) {
            return Err(invalid("baud_rate must be one of: 9600, 115200"));
        }

        if self.serial.read_timeout_ms == 0 || self.serial.read_timeout_ms > 10000 {
            return Err(invalid("read_timeout_ms must be between 1 and 10000"));
        }

        if self.monitor.poll_interval_ms == 0 || self.monitor.poll_interval_ms > 60000 {
            return Err(invalid("poll_interval_ms must be between 1 and 60000"));
        }

        if self.monitor.stabilize_ms > 10000 {
            return Err(invalid("stabilize_ms must be at most 10000"));
        }

        if self.monitor.cooldown_ms > 60000 {
            return Err(invalid("cooldown_ms must be at most 60000"));
        }

        if self.collection.total_loops == 0 {
            return Err(invalid("total_loops must be greater than 0"));
        }

        if self.collection.timeout_s == 0 {
            return Err(invalid("timeout_s must be greater than 0"));
        }

        if self.collection.idle_sleep_ms == 0 || self.collection.idle_sleep_ms > 10000 {
            return Err(invalid("idle_sleep_ms must be between 1 and 10000"));
        }

        if self.collection.shutdown_grace_ms > 10000 {
            return Err(invalid("shutdown_grace_ms must be at most 10000"));
        }

        if self.storage.database_url.is_empty() {
            return Err(invalid("database_url cannot be empty"));
        }

        if self.storage.recent_limit == 0 {
            return Err(invalid("recent_limit must be greater than 0"));
        }

        Ok(())
    }
}

fn invalid(msg: &str) -> LoggerError {
    LoggerError::Config(toml::de::Error::custom(msg))
}
