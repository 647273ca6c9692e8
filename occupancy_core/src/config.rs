//! Engine configuration.
//!
//! Every knob has a default matching the tuned values of the mobile app;
//! a JSON document only needs to name the fields it overrides.

use crate::error::OccupancyError;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::Path;

// ============================================================================
// CAMERA
// ============================================================================

/// Configuration for the following camera and its two angle state machines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Destination refresh rate in Hz (default: 10, independent of the render rate)
    pub refresh_rate_hz: f64,

    /// Number of discrete look angles per plane (default: 6)
    pub slices: u32,

    /// Minimum target speed to compute a look-ahead destination (default: 0.3)
    pub min_speed_target_trigger: f64,

    /// Minimum horizontal magnitude of the destination (default: 0.5)
    pub min_horizontal_trigger: f64,

    /// Minimum vertical magnitude of the destination (default: 1.0)
    pub min_vertical_trigger: f64,

    /// Number of rotate-and-accumulate prediction steps (default: 5)
    pub destination_steps: u32,

    /// Scale applied to speed and rotation per prediction step (default: 1.5)
    pub destination_expand: f64,

    /// Horizontal transition duration in seconds (default: 1.2)
    pub horizontal_transition_secs: f64,

    /// Vertical transition duration in seconds (default: 0.8)
    pub vertical_transition_secs: f64,

    /// Delay before a missing horizontal angle falls back to neutral (default: 2.0s)
    pub horizontal_override_delay_secs: f64,

    /// Delay before a missing vertical angle falls back to neutral (default: 1.0s)
    pub vertical_override_delay_secs: f64,

    /// Damping applied to vertical angles, must be in (0, 1] (default: 0.5)
    pub vertical_damping: f64,

    /// Neutral horizontal angle in radians (default: PI, looking north)
    pub horizontal_neutral_angle: f64,

    /// Neutral vertical angle in radians (default: 0, level)
    pub vertical_neutral_angle: f64,

    /// Camera height above the target (default: 0.6)
    pub height_above_target: f64,

    /// Camera distance behind the target (default: 3.5)
    pub distance_behind_target: f64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            refresh_rate_hz: 10.0,
            slices: 6,
            min_speed_target_trigger: 0.3,
            min_horizontal_trigger: 0.5,
            min_vertical_trigger: 1.0,
            destination_steps: 5,
            destination_expand: 1.5,
            horizontal_transition_secs: 1.2,
            vertical_transition_secs: 0.8,
            horizontal_override_delay_secs: 2.0,
            vertical_override_delay_secs: 1.0,
            vertical_damping: 0.5,
            horizontal_neutral_angle: PI,
            vertical_neutral_angle: 0.0,
            height_above_target: 0.6,
            distance_behind_target: 3.5,
        }
    }
}

// ============================================================================
// ESTIMATORS
// ============================================================================

/// Configuration for the speed and rotation estimators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Sliding window size (default: 5, values below 1 are coerced to 1)
    pub average_number: usize,

    /// Nominal producer frame period in seconds (default: 1/30)
    pub frame_period_secs: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            average_number: 5,
            frame_period_secs: 1.0 / 30.0,
        }
    }
}

// ============================================================================
// BEAM
// ============================================================================

/// Configuration for the trajectory beam.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamConfig {
    /// Beam refresh rate in Hz (default: 15)
    pub refresh_rate_hz: f64,

    /// Number of rings in the beam (default: 12)
    pub max_segments: usize,

    /// Fraction of the averaged move applied per ring (default: 0.25)
    pub spacing_coef: f64,

    /// Below this speed a dummy forward beam is shown (default: 0.3)
    pub min_display_speed: f64,

    /// Minimum travel distance between two visible rings (default: 1.0)
    pub min_distance_between_rings: f64,

    /// Opacity of the first visible ring (default: 0.8)
    pub global_opacity: f64,

    /// Opacity lost per visible ring (default: 0.01)
    pub opacity_decrement: f64,

    /// Opacity lost per update by an obstacle marker (default: 0.1)
    pub obstacle_fade: f64,

    /// Offset of the first ring relative to the target (default: [0, -0.5, 0])
    pub anchor: [f64; 3],

    /// Move vector used by the dummy beam (default: [0, 0, 2])
    pub dummy_move: [f64; 3],
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self {
            refresh_rate_hz: 15.0,
            max_segments: 12,
            spacing_coef: 0.25,
            min_display_speed: 0.3,
            min_distance_between_rings: 1.0,
            global_opacity: 0.8,
            opacity_decrement: 0.01,
            obstacle_fade: 0.1,
            anchor: [0.0, -0.5, 0.0],
            dummy_move: [0.0, 0.0, 2.0],
        }
    }
}

// ============================================================================
// STORAGE
// ============================================================================

/// Configuration for the voxel storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Edge length of a chunk in voxels (default: 16)
    pub chunk_size: i32,

    /// Number of change sets kept by the history (default: 30)
    pub history_capacity: usize,

    /// Edge length of a voxel in meters (default: 0.5)
    pub voxel_real_size: f64,

    /// Grid dimensions in voxels, used to place the scene center (default: 64³)
    pub grid_size: [i32; 3],

    /// Upper bound of the adaptive frame drop trigger (default: 5)
    pub max_drop_frame_for_update: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16,
            history_capacity: 30,
            voxel_real_size: 0.5,
            grid_size: [64, 64, 64],
            max_drop_frame_for_update: 5,
        }
    }
}

// ============================================================================
// ROOT
// ============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OccupancyConfig {
    pub camera: CameraConfig,
    pub estimator: EstimatorConfig,
    pub beam: BeamConfig,
    pub storage: StorageConfig,
}

impl OccupancyConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, OccupancyError> {
        let config: OccupancyConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, OccupancyError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Checks the values that cannot be coerced.
    ///
    /// Window sizes and capacities below 1 are not rejected here; the
    /// components coerce them to 1 on construction.
    pub fn validate(&self) -> Result<(), OccupancyError> {
        let c = &self.camera;
        positive("camera.refresh_rate_hz", c.refresh_rate_hz)?;
        positive("camera.horizontal_transition_secs", c.horizontal_transition_secs)?;
        positive("camera.vertical_transition_secs", c.vertical_transition_secs)?;
        non_negative("camera.horizontal_override_delay_secs", c.horizontal_override_delay_secs)?;
        non_negative("camera.vertical_override_delay_secs", c.vertical_override_delay_secs)?;
        non_negative("camera.min_speed_target_trigger", c.min_speed_target_trigger)?;
        non_negative("camera.min_horizontal_trigger", c.min_horizontal_trigger)?;
        non_negative("camera.min_vertical_trigger", c.min_vertical_trigger)?;
        positive("camera.destination_expand", c.destination_expand)?;
        if c.slices == 0 {
            return Err(OccupancyError::invalid("camera.slices must be at least 1"));
        }
        if !(c.vertical_damping > 0.0 && c.vertical_damping <= 1.0) {
            return Err(OccupancyError::invalid(format!(
                "camera.vertical_damping must be in (0, 1], got {}",
                c.vertical_damping
            )));
        }
        finite("camera.horizontal_neutral_angle", c.horizontal_neutral_angle)?;
        finite("camera.vertical_neutral_angle", c.vertical_neutral_angle)?;
        finite("camera.height_above_target", c.height_above_target)?;
        finite("camera.distance_behind_target", c.distance_behind_target)?;

        positive("estimator.frame_period_secs", self.estimator.frame_period_secs)?;

        let b = &self.beam;
        positive("beam.refresh_rate_hz", b.refresh_rate_hz)?;
        non_negative("beam.spacing_coef", b.spacing_coef)?;
        non_negative("beam.min_display_speed", b.min_display_speed)?;
        non_negative("beam.min_distance_between_rings", b.min_distance_between_rings)?;
        non_negative("beam.global_opacity", b.global_opacity)?;
        non_negative("beam.opacity_decrement", b.opacity_decrement)?;
        positive("beam.obstacle_fade", b.obstacle_fade)?;
        if b.max_segments < 2 {
            return Err(OccupancyError::invalid("beam.max_segments must be at least 2"));
        }

        let s = &self.storage;
        if s.chunk_size < 1 {
            return Err(OccupancyError::invalid("storage.chunk_size must be at least 1"));
        }
        positive("storage.voxel_real_size", s.voxel_real_size)?;
        if s.grid_size.iter().any(|&d| d < 1) {
            return Err(OccupancyError::invalid("storage.grid_size must be positive"));
        }

        Ok(())
    }
}

fn finite(name: &str, value: f64) -> Result<(), OccupancyError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(OccupancyError::invalid(format!("{name} must be finite")))
    }
}

fn positive(name: &str, value: f64) -> Result<(), OccupancyError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(OccupancyError::invalid(format!("{name} must be > 0, got {value}")))
    }
}

fn non_negative(name: &str, value: f64) -> Result<(), OccupancyError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(OccupancyError::invalid(format!("{name} must be >= 0, got {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OccupancyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.camera.slices, 6);
        assert_eq!(config.estimator.average_number, 5);
        assert_eq!(config.storage.history_capacity, 30);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json = r#"{ "camera": { "slices": 8 }, "storage": { "chunk_size": 8 } }"#;
        let config = OccupancyConfig::from_json_str(json).unwrap();

        assert_eq!(config.camera.slices, 8);
        assert_eq!(config.camera.refresh_rate_hz, 10.0);
        assert_eq!(config.storage.chunk_size, 8);
        assert_eq!(config.beam, BeamConfig::default());
    }

    #[test]
    fn test_invalid_damping_rejected() {
        let json = r#"{ "camera": { "vertical_damping": 1.5 } }"#;
        let err = OccupancyConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, OccupancyError::InvalidConfig(_)));
    }

    #[test]
    fn test_zero_window_is_accepted() {
        // Coerced by the estimators, not rejected
        let json = r#"{ "estimator": { "average_number": 0 } }"#;
        assert!(OccupancyConfig::from_json_str(json).is_ok());
    }

    #[test]
    fn test_malformed_json() {
        let err = OccupancyConfig::from_json_str("{ camera: }").unwrap_err();
        assert!(matches!(err, OccupancyError::ConfigParse(_)));
    }
}
