//! Error types for the simulation harness.

use occupancy_core::OccupancyError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Engine configuration error: {0}")]
    Config(#[from] OccupancyError),

    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    #[error("Export failed: {0}")]
    Export(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid simulation setting: {0}")]
    InvalidSetting(String),
}
