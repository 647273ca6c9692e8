//! The "RENDER" Loop - Per-Frame Orchestration
//!
//! Runs on the render thread only. Each frame:
//!
//! 1. accumulate the elapsed time from the host's render clock
//! 2. read the smoothed speed and rotation from the estimators
//! 3. move the following camera (own refresh rate)
//! 4. at the beam refresh rate, collect the chunks changed since the last
//!    refresh and rebuild the trajectory beam against the grid
//!
//! Telemetry producers never touch the renderer; they write through the
//! [`TelemetrySink`] handed out by [`OccupancyRenderer::sink`].

use crate::beam::{BeamSnapshot, TrajectoryBeam};
use crate::config::OccupancyConfig;
use crate::following_camera::{FollowingCamera, Pose};
use crate::telemetry::TelemetrySink;
use crate::voxel_storage::{ChunkKey, VoxelStore};
use nalgebra::Vector3;
use occupancy_env::OccupancyContext;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Output of one rendered frame.
#[derive(Debug, Clone, Serialize)]
pub struct RenderFrame {
    /// Accumulated render time (seconds)
    pub elapsed: f64,
    pub camera: Pose,
    pub target: Pose,

    /// Averaged velocity used this frame
    pub speed: Vector3<f64>,
    pub is_stationary: bool,

    pub horizontal_angle: f64,
    pub vertical_angle: f64,

    /// Present on beam refresh frames only
    pub beam: Option<BeamSnapshot>,

    /// Chunks to redraw; empty between beam refreshes
    pub dirty_chunks: HashSet<ChunkKey>,
}

/// Counters over the renderer lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RenderStats {
    pub frames: u64,
    pub beam_updates: u64,
    pub danger_frames: u64,
    pub dirty_chunks: u64,
    /// Render clock values that went backwards or were not finite
    pub rejected_clock_values: u64,
}

/// Render loop over a shared voxel store.
pub struct OccupancyRenderer<Ctx: OccupancyContext, S: VoxelStore> {
    store: Arc<S>,
    sink: TelemetrySink<Ctx>,
    camera: FollowingCamera,
    beam: TrajectoryBeam,

    camera_pose: Pose,
    target_pose: Pose,

    /// First change-log version not seen yet
    watermark: u64,

    elapsed: f64,
    last_render_time: Option<f64>,
    last_beam_update: Option<f64>,
    beam_period: f64,

    stats: RenderStats,
}

impl<Ctx: OccupancyContext, S: VoxelStore> OccupancyRenderer<Ctx, S> {
    /// Creates a renderer; `context` times the estimator samples.
    pub fn new(context: Arc<Ctx>, store: Arc<S>, config: &OccupancyConfig) -> Self {
        let frame_period = Duration::from_secs_f64(config.estimator.frame_period_secs.max(0.0));
        info!(
            camera_hz = config.camera.refresh_rate_hz,
            beam_hz = config.beam.refresh_rate_hz,
            window = config.estimator.average_number,
            "Occupancy renderer created"
        );

        Self {
            store,
            sink: TelemetrySink::new(context, config.estimator.average_number, frame_period),
            camera: FollowingCamera::new(config.camera.clone()),
            beam: TrajectoryBeam::new(config.beam.clone()),
            camera_pose: Pose::default(),
            target_pose: Pose::default(),
            watermark: 1,
            elapsed: 0.0,
            last_render_time: None,
            last_beam_update: None,
            beam_period: 1.0 / config.beam.refresh_rate_hz,
            stats: RenderStats::default(),
        }
    }

    /// Handle for telemetry producers.
    pub fn sink(&self) -> TelemetrySink<Ctx> {
        self.sink.clone()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn camera(&self) -> &FollowingCamera {
        &self.camera
    }

    pub fn camera_pose(&self) -> &Pose {
        &self.camera_pose
    }

    pub fn target_pose(&self) -> &Pose {
        &self.target_pose
    }

    pub fn stats(&self) -> &RenderStats {
        &self.stats
    }

    /// First change-log version the renderer has not consumed yet.
    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Accumulated render time.
    pub fn elapsed(&self) -> f64 {
        self.elapsed
    }

    /// Moves the tracked drone.
    pub fn set_target_pose(&mut self, pose: Pose) {
        if pose.is_finite() {
            self.target_pose = pose;
        }
    }

    /// Renders one frame at host time `render_time` (seconds).
    pub fn render(&mut self, render_time: f64) -> RenderFrame {
        self.advance_clock(render_time);
        let now = self.elapsed;

        let speed = self.sink.speed();
        let rotation_speed = self.sink.rotation_speed();
        let is_stationary = self.sink.is_stationary();

        self.camera.update(
            &mut self.camera_pose,
            &self.target_pose,
            &speed,
            &rotation_speed,
            is_stationary,
            now,
        );

        let beam_due = self
            .last_beam_update
            .map_or(true, |last| now - last > self.beam_period);
        let (beam, dirty_chunks) = if beam_due {
            self.last_beam_update = Some(now);
            let dirty = self.store.updated_chunks(&mut self.watermark);
            let snapshot = self.beam.update(
                self.store.as_ref(),
                &self.target_pose.position,
                &speed,
                rotation_speed.y,
            );

            self.stats.beam_updates += 1;
            self.stats.dirty_chunks += dirty.len() as u64;
            if snapshot.danger {
                self.stats.danger_frames += 1;
                debug!(elapsed = now, ring = ?snapshot.danger_ring, "Beam in danger");
            }
            (Some(snapshot), dirty)
        } else {
            (None, HashSet::new())
        };

        self.stats.frames += 1;
        trace!(
            elapsed = now,
            h = self.camera.horizontal_angle(),
            v = self.camera.vertical_angle(),
            "Frame rendered"
        );

        RenderFrame {
            elapsed: now,
            camera: self.camera_pose,
            target: self.target_pose,
            speed,
            is_stationary,
            horizontal_angle: self.camera.horizontal_angle(),
            vertical_angle: self.camera.vertical_angle(),
            beam,
            dirty_chunks,
        }
    }

    fn advance_clock(&mut self, render_time: f64) {
        if !render_time.is_finite() {
            self.stats.rejected_clock_values += 1;
            return;
        }
        if let Some(last) = self.last_render_time {
            let delta = render_time - last;
            if delta < 0.0 {
                // Baseline stays at the last accepted time
                self.stats.rejected_clock_values += 1;
                return;
            }
            self.elapsed += delta;
        }
        self.last_render_time = Some(render_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinematics::test_clock::ManualClock;
    use crate::voxel_storage::VoxelStorageCore;
    use approx::assert_relative_eq;
    use nalgebra::Point3;

    fn renderer() -> (Arc<ManualClock>, Arc<VoxelStorageCore>, OccupancyRenderer<ManualClock, VoxelStorageCore>) {
        let config = OccupancyConfig::default();
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(VoxelStorageCore::new(&config.storage));
        let r = OccupancyRenderer::new(clock.clone(), store.clone(), &config);
        (clock, store, r)
    }

    fn commit(store: &VoxelStorageCore, points: &[(i32, i32, i32)]) {
        let mut tx = store.start_transaction(&Vector3::zeros());
        for &(x, y, z) in points {
            tx.add_point(&Point3::new(x, y, z));
        }
        tx.end_transaction();
    }

    #[test]
    fn test_first_frame_refreshes_everything() {
        let (_clock, store, mut r) = renderer();
        commit(&store, &[(0, 0, 0)]);

        let frame = r.render(100.0);
        assert_eq!(frame.elapsed, 0.0);
        assert!(frame.beam.is_some());
        assert_eq!(frame.dirty_chunks.len(), 1);
        assert_eq!(r.watermark(), 2);
        assert!(frame.camera.is_finite());
    }

    #[test]
    fn test_elapsed_accumulates_host_deltas() {
        let (_clock, _store, mut r) = renderer();
        r.render(10.0);
        r.render(10.5);
        r.render(10.25);
        r.render(f64::NAN);
        r.render(11.0);
        assert_relative_eq!(r.elapsed(), 1.0);
        assert_eq!(r.stats().rejected_clock_values, 2);
        assert_eq!(r.stats().frames, 5);
    }

    #[test]
    fn test_backwards_render_time_keeps_baseline() {
        let (_clock, _store, mut r) = renderer();
        r.render(10.0);
        r.render(10.5);
        r.render(10.25);
        assert_relative_eq!(r.elapsed(), 0.5);
        r.render(11.0);
        assert_relative_eq!(r.elapsed(), 1.0);
    }

    #[test]
    fn test_beam_runs_at_its_own_rate() {
        let (_clock, store, mut r) = renderer();
        let mut beams = 0;
        for i in 0..60 {
            if i == 30 {
                commit(&store, &[(1, 1, 1)]);
            }
            let frame = r.render(i as f64 / 60.0);
            if frame.beam.is_some() {
                beams += 1;
            } else {
                assert!(frame.dirty_chunks.is_empty());
            }
        }
        // 15 Hz over one second of 60 Hz frames, refreshed strictly after
        // each period: every fifth frame
        assert!((11..=15).contains(&beams), "beams = {beams}");
        assert_eq!(r.stats().dirty_chunks, 1);
    }

    #[test]
    fn test_stationary_drone_keeps_neutral_camera() {
        let (_clock, _store, mut r) = renderer();
        let target = Pose::at(Vector3::new(31.5, 31.5, 31.5));
        r.set_target_pose(target);
        r.sink().set_stationary(true);

        let mut frame = r.render(0.0);
        for i in 1..120 {
            frame = r.render(i as f64 / 60.0);
        }
        assert_relative_eq!(frame.horizontal_angle, std::f64::consts::PI);
        assert_relative_eq!(
            frame.camera.position,
            target.position + Vector3::new(0.0, 0.6, -3.5),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_camera_follows_sink_speed() {
        let (clock, _store, mut r) = renderer();
        let sink = r.sink();
        sink.set_stationary(false);

        for i in 0..180 {
            // Southbound at 2 m/s, fed at the render rate
            sink.set_speed(Vector3::new(0.0, 0.0, -2.0));
            clock.advance(Duration::from_millis(16));
            r.render(i as f64 / 60.0);
        }
        assert_relative_eq!(r.camera().horizontal_angle(), 0.0, epsilon = 1e-9);
        assert!(r.camera_pose().position.z > r.target_pose().position.z);
    }

    #[test]
    fn test_non_finite_target_is_ignored() {
        let (_clock, _store, mut r) = renderer();
        r.set_target_pose(Pose::at(Vector3::new(1.0, 2.0, 3.0)));
        r.set_target_pose(Pose::at(Vector3::new(f64::NAN, 0.0, 0.0)));
        assert_eq!(r.target_pose().position, Vector3::new(1.0, 2.0, 3.0));
    }
}
