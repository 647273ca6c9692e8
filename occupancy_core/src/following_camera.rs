//! The "FOLLOW" Engine - Following Camera Controller
//!
//! Places a virtual camera above and behind the drone, looking slightly over
//! it, and swings it around the drone according to where the drone is
//! heading rather than where it points.

use crate::config::CameraConfig;
use crate::following_angle::FollowingAngleAnalyser;
use crate::sight_angle::SightAngleAnalyser;
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Position and orientation in scene coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
}

impl Pose {
    pub fn new(position: Vector3<f64>, orientation: UnitQuaternion<f64>) -> Self {
        Self {
            position,
            orientation,
        }
    }

    /// Pose at `position` with the identity orientation.
    pub fn at(position: Vector3<f64>) -> Self {
        Self::new(position, UnitQuaternion::identity())
    }

    /// Direction the pose looks at (-Z in local frame).
    pub fn forward(&self) -> Vector3<f64> {
        self.orientation * -Vector3::z()
    }

    pub fn is_finite(&self) -> bool {
        self.position.iter().all(|c| c.is_finite())
            && self.orientation.coords.iter().all(|c| c.is_finite())
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::at(Vector3::zeros())
    }
}

/// Short-horizon look-ahead point relative to the target.
///
/// The velocity is scaled, then repeatedly rotated by the (scaled) yaw rate
/// and accumulated, so a turning drone yields a point along the curve it is
/// flying rather than along its tangent.
pub fn target_destination(
    speed: &Vector3<f64>,
    rotation_speed: &Vector3<f64>,
    config: &CameraConfig,
) -> Option<Vector3<f64>> {
    if !speed.iter().all(|c| c.is_finite()) || speed.norm() <= config.min_speed_target_trigger {
        return None;
    }
    let yaw_rate = if rotation_speed.y.is_finite() {
        rotation_speed.y
    } else {
        0.0
    };

    let rotation = UnitQuaternion::from_axis_angle(
        &Vector3::y_axis(),
        yaw_rate * config.destination_expand,
    );
    let mut step = speed * config.destination_expand;
    let mut destination = Vector3::zeros();
    for _ in 0..config.destination_steps {
        step = rotation * step;
        destination += step;
    }
    Some(destination)
}

/// Following camera: two angle state machines and the pose math around them.
#[derive(Debug, Clone)]
pub struct FollowingCamera {
    config: CameraConfig,
    horizontal: FollowingAngleAnalyser,
    vertical: FollowingAngleAnalyser,

    /// Render time of the last destination refresh
    last_refresh: Option<f64>,

    /// Destination computed at the last refresh
    destination: Option<Vector3<f64>>,
}

impl FollowingCamera {
    pub fn new(config: CameraConfig) -> Self {
        let horizontal = FollowingAngleAnalyser::new(
            SightAngleAnalyser::horizontal(config.slices, config.min_horizontal_trigger),
            config.horizontal_transition_secs,
            config.horizontal_override_delay_secs,
            config.horizontal_neutral_angle,
        );
        let vertical = FollowingAngleAnalyser::new(
            SightAngleAnalyser::vertical(
                config.slices,
                config.min_vertical_trigger,
                config.vertical_damping,
            ),
            config.vertical_transition_secs,
            config.vertical_override_delay_secs,
            config.vertical_neutral_angle,
        );

        Self {
            config,
            horizontal,
            vertical,
            last_refresh: None,
            destination: None,
        }
    }

    pub fn horizontal_angle(&self) -> f64 {
        self.horizontal.current_angle()
    }

    pub fn vertical_angle(&self) -> f64 {
        self.vertical.current_angle()
    }

    pub fn horizontal(&self) -> &FollowingAngleAnalyser {
        &self.horizontal
    }

    pub fn vertical(&self) -> &FollowingAngleAnalyser {
        &self.vertical
    }

    /// Look-ahead destination of the last refresh.
    pub fn destination(&self) -> Option<Vector3<f64>> {
        self.destination
    }

    pub fn is_transitioning(&self) -> bool {
        self.horizontal.is_transitioning() || self.vertical.is_transitioning()
    }

    /// Moves `camera` for render time `now`.
    ///
    /// Destinations are recomputed at most at the configured refresh rate;
    /// in between, running transitions are only advanced.
    pub fn update(
        &mut self,
        camera: &mut Pose,
        target: &Pose,
        speed: &Vector3<f64>,
        rotation_speed: &Vector3<f64>,
        is_stationary: bool,
        now: f64,
    ) {
        let refresh_period = 1.0 / self.config.refresh_rate_hz;
        let due = self
            .last_refresh
            .map_or(true, |last| now - last > refresh_period);

        if due {
            self.last_refresh = Some(now);
            self.destination = target_destination(speed, rotation_speed, &self.config);
            self.horizontal
                .update(self.destination.as_ref(), is_stationary, now);
            self.vertical
                .update(self.destination.as_ref(), is_stationary, now);
        } else {
            self.horizontal.smart_update_if_running(now);
            self.vertical.smart_update_if_running(now);
        }

        *camera = self.place(target);
    }

    /// Camera pose around `target` for the current angles.
    pub fn place(&self, target: &Pose) -> Pose {
        let swing = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), self.horizontal_angle())
            * UnitQuaternion::from_axis_angle(&Vector3::x_axis(), self.vertical_angle());

        let offset = Vector3::new(
            0.0,
            self.config.height_above_target,
            self.config.distance_behind_target,
        );
        let position = target.position + swing * offset;

        let aim = target.position + Vector3::new(0.0, self.config.height_above_target, 0.0);
        let look = aim - position;
        let orientation = if look.norm() > f64::EPSILON {
            // face_towards aligns +Z; the camera looks down -Z
            UnitQuaternion::face_towards(&-look, &Vector3::y())
        } else {
            swing
        };

        Pose::new(position, orientation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn step(
        camera: &mut FollowingCamera,
        pose: &mut Pose,
        target: &Pose,
        speed: Vector3<f64>,
        from: f64,
        to: f64,
    ) {
        let mut t = from;
        while t <= to {
            camera.update(pose, target, &speed, &Vector3::zeros(), false, t);
            t += 1.0 / 60.0;
        }
    }

    #[test]
    fn test_destination_below_trigger() {
        let config = CameraConfig::default();
        assert!(target_destination(&Vector3::new(0.1, 0.0, 0.1), &Vector3::zeros(), &config).is_none());
        assert!(target_destination(&Vector3::new(f64::NAN, 0.0, 1.0), &Vector3::zeros(), &config).is_none());
    }

    #[test]
    fn test_destination_straight_line() {
        let config = CameraConfig::default();
        let d = target_destination(&Vector3::new(0.0, 0.0, 2.0), &Vector3::zeros(), &config).unwrap();
        // 5 steps of 2 * 1.5
        assert_relative_eq!(d, Vector3::new(0.0, 0.0, 15.0), epsilon = 1e-12);
    }

    #[test]
    fn test_destination_bends_with_yaw_rate() {
        let config = CameraConfig::default();
        let speed = Vector3::new(0.0, 0.0, 2.0);
        let d = target_destination(&speed, &Vector3::new(0.0, 0.2, 0.0), &config).unwrap();
        // A positive yaw rate about +Y bends the path towards +X
        assert!(d.x > 0.5);
        assert!(d.z < 15.0);
        assert_relative_eq!(d.y, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_neutral_placement() {
        let camera = FollowingCamera::new(CameraConfig::default());
        let target = Pose::at(Vector3::new(10.0, 5.0, -2.0));
        let pose = camera.place(&target);

        // Neutral: south of the target, looking north
        assert_relative_eq!(pose.position, Vector3::new(10.0, 5.6, -5.5), epsilon = 1e-9);
        assert_relative_eq!(pose.forward(), Vector3::z(), epsilon = 1e-9);
    }

    #[test]
    fn test_camera_swings_behind_southbound_drone() {
        let mut camera = FollowingCamera::new(CameraConfig::default());
        let mut pose = Pose::default();
        let target = Pose::default();

        step(&mut camera, &mut pose, &target, Vector3::new(0.0, 0.0, -2.0), 0.0, 2.0);

        assert!(!camera.is_transitioning());
        assert_relative_eq!(camera.horizontal_angle(), 0.0, epsilon = 1e-9);
        assert_relative_eq!(pose.position, Vector3::new(0.0, 0.6, 3.5), epsilon = 1e-9);
        assert_relative_eq!(pose.forward(), -Vector3::z(), epsilon = 1e-9);
    }

    #[test]
    fn test_camera_always_aims_above_target() {
        let mut camera = FollowingCamera::new(CameraConfig::default());
        let mut pose = Pose::default();
        let target = Pose::at(Vector3::new(1.0, 2.0, 3.0));
        let speed = Vector3::new(1.5, 2.5, -1.0);

        let mut t = 0.0;
        while t < 3.0 {
            camera.update(&mut pose, &target, &speed, &Vector3::new(0.0, 0.3, 0.0), false, t);
            assert!(pose.is_finite());

            let aim = target.position + Vector3::new(0.0, 0.6, 0.0);
            let expected = (aim - pose.position).normalize();
            assert_relative_eq!(pose.forward(), expected, epsilon = 1e-9);
            let radius = (0.6f64 * 0.6 + 3.5 * 3.5).sqrt();
            assert_relative_eq!((pose.position - target.position).norm(), radius, epsilon = 1e-9);
            t += 1.0 / 30.0;
        }
    }

    #[test]
    fn test_refresh_rate_gates_destination() {
        let mut camera = FollowingCamera::new(CameraConfig::default());
        let mut pose = Pose::default();
        let target = Pose::default();

        camera.update(&mut pose, &target, &Vector3::new(0.0, 0.0, 2.0), &Vector3::zeros(), false, 0.0);
        let first = camera.destination();

        camera.update(&mut pose, &target, &Vector3::new(2.0, 0.0, 0.0), &Vector3::zeros(), false, 0.05);
        assert_eq!(camera.destination(), first);

        camera.update(&mut pose, &target, &Vector3::new(2.0, 0.0, 0.0), &Vector3::zeros(), false, 0.15);
        assert_ne!(camera.destination(), first);
    }

    #[test]
    fn test_stationary_returns_to_neutral() {
        let mut camera = FollowingCamera::new(CameraConfig::default());
        let mut pose = Pose::default();
        let target = Pose::default();

        step(&mut camera, &mut pose, &target, Vector3::new(0.0, 0.0, -2.0), 0.0, 2.0);
        assert_relative_eq!(camera.horizontal_angle(), 0.0, epsilon = 1e-9);

        let mut t = 2.0;
        while t < 4.0 {
            camera.update(&mut pose, &target, &Vector3::zeros(), &Vector3::zeros(), true, t);
            t += 1.0 / 60.0;
        }
        assert_relative_eq!(camera.horizontal_angle(), PI, epsilon = 1e-9);
    }
}
