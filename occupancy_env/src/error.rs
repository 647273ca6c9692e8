//! Error types for the occupancy environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The telemetry producer hung up.
    #[error("Telemetry channel closed")]
    TelemetryClosed,
}
