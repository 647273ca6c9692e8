//! Common types for the occupancy environment abstraction.

use serde::{Deserialize, Serialize};

/// Flight state reported by the drone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlyingState {
    /// On the ground, motors off
    Landed,
    /// Holding position
    Hovering,
    /// Moving
    Flying,
}

impl FlyingState {
    /// A hovering or landed drone is treated as stationary by the camera.
    pub fn is_stationary(&self) -> bool {
        matches!(self, FlyingState::Hovering | FlyingState::Landed)
    }
}

/// One decoded telemetry sample.
///
/// All vectors are in the drone's NED frame (north, east, down), meters
/// and radians.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Timestamp of the sample on the producer clock (milliseconds)
    pub timestamp_ms: u64,

    /// Position [north, east, down] in meters
    pub position_ned: [f64; 3],

    /// Linear velocity [north, east, down] in m/s
    pub velocity_ned: [f64; 3],

    /// Angular velocity [roll, pitch, yaw] rates in rad/s
    pub angular_velocity: [f64; 3],

    /// Attitude quaternion [w, x, y, z]
    pub attitude: [f64; 4],

    /// Flight state
    pub flying_state: FlyingState,
}

impl TelemetrySample {
    /// Creates a sample of a drone hovering at the given NED position.
    pub fn hovering(timestamp_ms: u64, position_ned: [f64; 3]) -> Self {
        Self {
            timestamp_ms,
            position_ned,
            velocity_ned: [0.0; 3],
            angular_velocity: [0.0; 3],
            attitude: [1.0, 0.0, 0.0, 0.0],
            flying_state: FlyingState::Hovering,
        }
    }

    /// Returns true if the drone reports itself as stationary.
    pub fn is_stationary(&self) -> bool {
        self.flying_state.is_stationary()
    }
}
