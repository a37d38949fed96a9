//! # Error Types
//!
//! Custom error types for the moisture logger using `thiserror`.

use thiserror::Error;

/// Main error type for the moisture logger
#[derive(Debug, Error)]
pub enum LoggerError {
    /// Serial link failures (open, write, health probe, read)
    #[error("Connection error: {0}")]
    Connection(String),

    /// A command was issued while the sensor link is down
    #[error("Sensor link is not connected")]
    NotConnected,

    /// A collection run is already in progress
    #[error("A collection run is already active")]
    AlreadyRunning,

    /// Persistence errors
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// CSV export errors
    #[error("Export error: {0}")]
    Export(#[from] csv::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the moisture logger
pub type Result<T> = std::result::Result<T, LoggerError>;
