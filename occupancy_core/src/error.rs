//! Error types for the occupancy engine.
//!
//! Expected runtime conditions (empty windows, missing directions, future or
//! evicted history versions) are modeled as data and never reach this enum.
//! It only covers configuration loading.

use thiserror::Error;

/// Errors surfaced while building an engine.
#[derive(Debug, Error)]
pub enum OccupancyError {
    /// A configuration value is out of its valid range
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration document could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// The configuration file could not be read
    #[error("Config IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OccupancyError {
    /// Creates an invalid-config error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
