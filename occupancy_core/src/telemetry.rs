//! Telemetry adaptation: from drone NED telemetry to the scene the engine
//! works in, and from the producer threads to the estimators.
//!
//! Scene axes, in voxel units for positions and m/s for velocities:
//!
//! | scene | NED     |
//! |-------|---------|
//! | x     | -east   |
//! | y     | -down   |
//! | z     | north   |

use crate::following_camera::Pose;
use crate::kinematics::{Rotatiometer, Speedometer};
use crate::voxel_storage::VoxelStorageCore;
use nalgebra::{Matrix3, Quaternion, Rotation3, UnitQuaternion, Vector3};
use occupancy_env::{OccupancyContext, TelemetrySample};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

// ============================================================================
// SCENE MAPPING
// ============================================================================

/// NED → scene conversions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneMapper {
    voxel_real_size: f64,

    /// Scene position of the grid center
    center: Vector3<f64>,
}

impl SceneMapper {
    pub fn new(voxel_real_size: f64, center: Vector3<f64>) -> Self {
        Self {
            voxel_real_size,
            center,
        }
    }

    /// Mapper matching a storage's voxel size and grid center.
    pub fn for_storage(storage: &VoxelStorageCore) -> Self {
        Self::new(storage.voxel_real_size(), storage.center())
    }

    /// Rotation taking NED axes onto scene axes.
    pub fn axes() -> Rotation3<f64> {
        Rotation3::from_matrix_unchecked(Matrix3::new(
            0.0, -1.0, 0.0, //
            0.0, 0.0, -1.0, //
            1.0, 0.0, 0.0,
        ))
    }

    /// NED vector (velocity, angular velocity) on scene axes.
    pub fn vector(ned: &Vector3<f64>) -> Vector3<f64> {
        Vector3::new(-ned.y, -ned.z, ned.x)
    }

    /// Scene position (voxels) of a NED position (meters).
    ///
    /// The grid origin is the drone position of the first storage
    /// transaction; before it exists the drone sits at the grid center.
    pub fn position(&self, ned: &Vector3<f64>, grid_origin: Option<&Vector3<f64>>) -> Vector3<f64> {
        match grid_origin {
            Some(origin) => self.center + Self::vector(&(ned - origin)) / self.voxel_real_size,
            None => self.center,
        }
    }

    /// Scene orientation of a NED attitude given as `[w, x, y, z]`.
    ///
    /// A degenerate quaternion maps to the identity.
    pub fn attitude(attitude: &[f64; 4]) -> UnitQuaternion<f64> {
        let [w, x, y, z] = *attitude;
        let q = Quaternion::new(w, x, y, z);
        if !q.coords.iter().all(|c| c.is_finite()) || q.norm() < 1e-9 {
            return UnitQuaternion::identity();
        }
        let axes = UnitQuaternion::from_rotation_matrix(&Self::axes());
        axes * UnitQuaternion::from_quaternion(q) * axes.inverse()
    }

    /// Drone pose in the scene.
    pub fn target_pose(&self, sample: &TelemetrySample, grid_origin: Option<&Vector3<f64>>) -> Pose {
        Pose::new(
            self.position(&Vector3::from(sample.position_ned), grid_origin),
            Self::attitude(&sample.attitude),
        )
    }
}

// ============================================================================
// FRAME THROTTLE
// ============================================================================

/// What to do with an incoming depth frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecision {
    /// Process the frame; write the result into the storage if asked
    Process { update_storage: bool },
    /// The processor is still busy; the frame is dropped
    Missed,
}

/// Adaptive frame dropping for the grid producer.
///
/// When frames keep arriving while the processor is busy, the storage is
/// only refreshed every `drop_trigger` frames; the trigger grows by one each
/// time `drop_trigger` frames were missed, up to a maximum.
#[derive(Debug, Clone)]
pub struct FrameThrottle {
    max_drop_trigger: u32,
    drop_trigger: u32,
    missed: u32,
    frame_count: u64,
}

impl FrameThrottle {
    pub fn new(max_drop_trigger: u32) -> Self {
        Self {
            max_drop_trigger: max_drop_trigger.max(1),
            drop_trigger: 1,
            missed: 0,
            frame_count: 0,
        }
    }

    /// Current update period in frames.
    pub fn drop_trigger(&self) -> u32 {
        self.drop_trigger
    }

    /// Decides for the next frame; `slot_available` is false while the
    /// previous frame is still being processed.
    pub fn on_frame(&mut self, slot_available: bool) -> FrameDecision {
        let update_storage = self.frame_count % u64::from(self.drop_trigger) == 0;
        self.frame_count += 1;

        if slot_available {
            self.missed = 0;
            return FrameDecision::Process { update_storage };
        }

        self.missed += 1;
        if self.missed >= self.drop_trigger && self.drop_trigger < self.max_drop_trigger {
            self.drop_trigger += 1;
            self.missed = 0;
            trace!(drop_trigger = self.drop_trigger, "Frame drop trigger raised");
        }
        FrameDecision::Missed
    }
}

// ============================================================================
// SINK
// ============================================================================

struct SinkInner<Ctx: OccupancyContext> {
    speedometer: Speedometer<Ctx>,
    rotatiometer: Rotatiometer<Ctx>,
    stationary: AtomicBool,
    samples: AtomicU64,
}

/// Producer-side handle feeding the estimators.
///
/// Cheap to clone; every clone writes into the same estimators, from any
/// thread.
pub struct TelemetrySink<Ctx: OccupancyContext> {
    inner: Arc<SinkInner<Ctx>>,
}

impl<Ctx: OccupancyContext> Clone for TelemetrySink<Ctx> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Ctx: OccupancyContext> TelemetrySink<Ctx> {
    pub fn new(context: Arc<Ctx>, average_number: usize, frame_period: Duration) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                speedometer: Speedometer::new(context.clone(), average_number, frame_period),
                rotatiometer: Rotatiometer::new(context, average_number, frame_period),
                stationary: AtomicBool::new(true),
                samples: AtomicU64::new(0),
            }),
        }
    }

    /// Feeds one NED telemetry sample.
    pub fn push(&self, sample: &TelemetrySample) {
        self.inner
            .speedometer
            .set_sample(SceneMapper::vector(&Vector3::from(sample.velocity_ned)));
        self.inner
            .rotatiometer
            .set_sample(SceneMapper::vector(&Vector3::from(sample.angular_velocity)));
        self.set_stationary(sample.is_stationary());
        self.inner.samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Feeds a velocity already on scene axes.
    pub fn set_speed(&self, speed: Vector3<f64>) {
        self.inner.speedometer.set_sample(speed);
    }

    /// Feeds an angular velocity already on scene axes.
    pub fn set_rotation_speed(&self, rotation_speed: Vector3<f64>) {
        self.inner.rotatiometer.set_sample(rotation_speed);
    }

    /// Feeds a scene orientation (Euler angles); the rate is derived.
    pub fn set_orientation(&self, angles: Vector3<f64>) {
        self.inner.rotatiometer.set_orientation(angles);
    }

    pub fn set_stationary(&self, stationary: bool) {
        self.inner.stationary.store(stationary, Ordering::Release);
    }

    /// Averaged scene velocity.
    pub fn speed(&self) -> Vector3<f64> {
        self.inner.speedometer.average()
    }

    /// Averaged scene angular velocity.
    pub fn rotation_speed(&self) -> Vector3<f64> {
        self.inner.rotatiometer.average()
    }

    pub fn is_stationary(&self) -> bool {
        self.inner.stationary.load(Ordering::Acquire)
    }

    /// Number of samples fed through `push`.
    pub fn samples_received(&self) -> u64 {
        self.inner.samples.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::test_clock::ManualClock;
    use approx::assert_relative_eq;
    use occupancy_env::FlyingState;
    use std::f64::consts::FRAC_PI_2;

    fn mapper() -> SceneMapper {
        SceneMapper::new(0.5, Vector3::new(31.5, 31.5, 31.5))
    }

    #[test]
    fn test_axes_matches_vector_mapping() {
        let v = Vector3::new(1.0, 2.0, 3.0);
        assert_relative_eq!(SceneMapper::axes() * v, SceneMapper::vector(&v));
    }

    #[test]
    fn test_position_relative_to_origin() {
        let m = mapper();
        let origin = Vector3::new(100.0, 50.0, -10.0);
        assert_eq!(m.position(&origin, None), Vector3::new(31.5, 31.5, 31.5));
        assert_relative_eq!(m.position(&origin, Some(&origin)), Vector3::new(31.5, 31.5, 31.5));

        // 1m north, 1m east, 1m up
        let moved = Vector3::new(101.0, 51.0, -11.0);
        assert_relative_eq!(
            m.position(&moved, Some(&origin)),
            Vector3::new(29.5, 33.5, 33.5),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_attitude_yaw_maps_to_scene_y() {
        // Yaw of 90 degrees about down: nose from north to east
        let yaw = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2);
        let q = [yaw.w, yaw.i, yaw.j, yaw.k];
        let scene = SceneMapper::attitude(&q);

        // Scene nose starts at +z (north) and ends at -x (east)
        let nose = scene * Vector3::z();
        assert_relative_eq!(nose, Vector3::new(-1.0, 0.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_attitude_is_identity() {
        assert_eq!(SceneMapper::attitude(&[0.0; 4]), UnitQuaternion::identity());
        assert_eq!(SceneMapper::attitude(&[f64::NAN, 0.0, 0.0, 0.0]), UnitQuaternion::identity());
    }

    #[test]
    fn test_throttle_processes_when_free() {
        let mut t = FrameThrottle::new(5);
        for _ in 0..10 {
            assert_eq!(t.on_frame(true), FrameDecision::Process { update_storage: true });
        }
        assert_eq!(t.drop_trigger(), 1);
    }

    #[test]
    fn test_throttle_backs_off_when_busy() {
        let mut t = FrameThrottle::new(3);
        assert_eq!(t.on_frame(false), FrameDecision::Missed);
        assert_eq!(t.drop_trigger(), 2);

        assert_eq!(t.on_frame(false), FrameDecision::Missed);
        assert_eq!(t.on_frame(false), FrameDecision::Missed);
        assert_eq!(t.drop_trigger(), 3);

        // Capped
        for _ in 0..10 {
            t.on_frame(false);
        }
        assert_eq!(t.drop_trigger(), 3);

        // Frame 13 of a period of 3: no storage update, next multiple does
        assert_eq!(t.on_frame(true), FrameDecision::Process { update_storage: false });
        assert_eq!(t.on_frame(true), FrameDecision::Process { update_storage: false });
        assert_eq!(t.on_frame(true), FrameDecision::Process { update_storage: true });
    }

    #[test]
    fn test_sink_maps_and_shares() {
        let clock = Arc::new(ManualClock::default());
        let sink = TelemetrySink::new(clock, 5, Duration::from_millis(33));
        let producer = sink.clone();

        let mut sample = TelemetrySample::hovering(0, [0.0; 3]);
        sample.velocity_ned = [2.0, 1.0, -0.5];
        sample.angular_velocity = [0.0, 0.0, 0.3];
        sample.flying_state = FlyingState::Flying;

        let handle = std::thread::spawn(move || producer.push(&sample));
        handle.join().unwrap();

        assert_relative_eq!(sink.speed(), Vector3::new(-1.0, 0.5, 2.0));
        assert_relative_eq!(sink.rotation_speed(), Vector3::new(0.0, -0.3, 0.0));
        assert!(!sink.is_stationary());
        assert_eq!(sink.samples_received(), 1);
    }
}
