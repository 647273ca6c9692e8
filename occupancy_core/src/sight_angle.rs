//! The "SIGHT" Engine - Discrete Look-Angle Analysis
//!
//! Turns a look-ahead destination (relative to the target) into one of a
//! small number of discrete camera angles per plane. Quantizing keeps the
//! camera from chasing every wobble of the telemetry.
//!
//! Angles are expressed in the scene frame (x = west, y = up, z = north):
//!
//! - Horizontal: 0 rad places the camera north of the target (looking
//!   south), PI places it south (looking north). A destination straight
//!   ahead yields the angle that keeps the camera behind the motion.
//! - Vertical: within (-PI, PI], already damped.

use crate::math::wrap_two_pi;
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::f64::consts::{PI, TAU};

/// Plane an analyser works in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraPlane {
    Horizontal,
    Vertical,
}

/// Stateless analyser for one plane.
#[derive(Debug, Clone)]
pub struct SightAngleAnalyser {
    plane: CameraPlane,

    /// Number of discrete angles (>= 1)
    slices: u32,

    /// Projected magnitude below which no angle is produced
    min_trigger: f64,

    /// Vertical damping factor in (0, 1]; unused horizontally
    damping: f64,
}

impl SightAngleAnalyser {
    /// Creates a horizontal analyser.
    pub fn horizontal(slices: u32, min_trigger: f64) -> Self {
        Self {
            plane: CameraPlane::Horizontal,
            slices: slices.max(1),
            min_trigger,
            damping: 1.0,
        }
    }

    /// Creates a vertical analyser.
    pub fn vertical(slices: u32, min_trigger: f64, damping: f64) -> Self {
        Self {
            plane: CameraPlane::Vertical,
            slices: slices.max(1),
            min_trigger,
            damping,
        }
    }

    pub fn plane(&self) -> CameraPlane {
        self.plane
    }

    pub fn slices(&self) -> u32 {
        self.slices
    }

    /// Angle of one slice in radians.
    pub fn slice_angle(&self) -> f64 {
        TAU / self.slices as f64
    }

    /// Analyses a destination; `None` when it is missing, too small on the
    /// plane or not finite.
    pub fn analyze(&self, direction: Option<&Vector3<f64>>) -> Option<f64> {
        let direction = direction?;
        if !direction.iter().all(|c| c.is_finite()) {
            return None;
        }
        match self.plane {
            CameraPlane::Horizontal => self.analyze_horizontal(direction),
            CameraPlane::Vertical => self.analyze_vertical(direction),
        }
    }

    fn analyze_horizontal(&self, direction: &Vector3<f64>) -> Option<f64> {
        let on_plane = Vector2::new(direction.x, direction.z);
        let norm = on_plane.norm();
        if norm <= self.min_trigger || norm == 0.0 {
            return None;
        }
        let unit = on_plane / norm;

        // Angle from +z, measured clockwise when x is negative
        let mut angle = unit.y.clamp(-1.0, 1.0).acos();
        if unit.x < 0.0 {
            angle = TAU - angle;
        }
        angle += PI;

        Some(self.slice_of(angle) as f64 * self.slice_angle())
    }

    fn analyze_vertical(&self, direction: &Vector3<f64>) -> Option<f64> {
        // Distance away from the target on the ground, never signed: the
        // opposite side is the horizontal analyser's business
        let away = direction.x.abs().max(direction.z.abs());
        let on_plane = Vector2::new(away, direction.y);
        if on_plane.y.abs() <= self.min_trigger {
            return None;
        }
        let unit = on_plane / on_plane.norm();

        let mut angle = unit.x.clamp(-1.0, 1.0).acos();
        if on_plane.y < 0.0 {
            angle = TAU - angle;
        }

        let mut quantized = self.slice_of(angle) as f64 * self.slice_angle();
        if quantized > PI {
            quantized -= TAU;
        }
        Some(quantized * self.damping)
    }

    /// Index of the nearest slice; ties and the last half-slice round up
    /// (the last half-slice wraps to slice 0).
    pub fn slice_of(&self, angle: f64) -> u32 {
        let half_slices = self.slices as u64 * 2;
        let half_slice_angle = TAU / half_slices as f64;
        let angle = wrap_two_pi(angle);

        let half_index = ((angle / half_slice_angle).floor() as u64) % half_slices;
        (((half_index + 1) % half_slices) / 2) as u32
    }
}
