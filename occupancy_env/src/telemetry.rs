//! Telemetry source abstraction for the occupancy engines.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::TelemetrySample;

/// Abstraction over the drone telemetry feed.
///
/// # Implementations
///
/// - **Production**: wraps the decoded stream metadata of the drone
/// - **Simulation**: channel-based with configurable dropouts and stalls
///
/// # Sample Flow
///
/// ```text
/// Drone                   Source                    Producer task
///   |                        |                           |
///   |-- metadata frame ----->|                           |
///   |                        |-- [dropout/stall] ------->|
///   |                        |                           |-- recv() -> sample
///   |                        |                           |-- sink.push(sample)
/// ```
///
/// The rate is arbitrary and possibly irregular; consumers must not assume
/// a fixed period.
#[async_trait]
pub trait TelemetrySource: Send + Sync + 'static {
    /// Receives the next telemetry sample.
    ///
    /// # Returns
    /// * `Ok(sample)` - A sample was received
    /// * `Err(EnvError::TelemetryClosed)` - The producer shut down
    ///
    /// # Blocking
    /// This method waits until a sample arrives or the channel closes.
    async fn recv(&self) -> Result<TelemetrySample, EnvError>;

    /// Returns the number of samples received so far.
    fn received_count(&self) -> u64;
}

/// Marker trait for telemetry controllers in simulation.
///
/// Allows injecting faults like stalls and dropouts.
pub trait TelemetryController: Send + Sync {
    /// Stops delivering samples until `resume` is called.
    fn stall(&self);

    /// Resumes delivery after a stall.
    fn resume(&self);

    /// Sets the probability of silently dropping a sample (0.0 - 1.0).
    fn set_dropout_rate(&self, rate: f64);

    /// Returns true while delivery is stalled.
    fn is_stalled(&self) -> bool;
}
