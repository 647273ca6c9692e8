//! Trajectory beam: a chain of rings projected along the predicted path of
//! the drone, turning to danger as soon as one of them meets an occupied
//! voxel.
//!
//! Each ring is placed relative to the previous one (offset by a fraction of
//! the averaged move, turned by a fraction of the yaw rate), so a turning
//! drone gets a curved beam. The first ring slides along the path to give a
//! sense of motion.

use crate::config::BeamConfig;
use crate::voxel_storage::{ChunkKey, ChunkStorage, VoxelKey, VoxelStore};
use nalgebra::{Point3, UnitQuaternion, Vector3};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One ring of the beam, in scene coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeamRing {
    pub position: Vector3<f64>,
    /// Accumulated yaw of the ring frame
    pub yaw: f64,
    pub opacity: f64,
    pub visible: bool,
}

/// Occupied voxels found around a ring, fading out over time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObstacleMarker {
    /// Voxel the ring was in
    pub anchor: VoxelKey,
    /// Occupied voxels among the anchor and its six face neighbors
    pub voxels: Vec<VoxelKey>,
    pub opacity: f64,
}

/// State of the beam after one update, for the render host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeamSnapshot {
    pub rings: Vec<BeamRing>,
    /// True when the drone is too slow and a placeholder beam is shown
    pub dummy: bool,
    pub danger: bool,
    /// First ring that met an obstacle
    pub danger_ring: Option<usize>,
    pub obstacles: Vec<ObstacleMarker>,
}

impl BeamSnapshot {
    pub fn visible_rings(&self) -> usize {
        self.rings.iter().filter(|r| r.visible).count()
    }
}

/// Per-update chunk lookups, so successive rings reuse the same chunk.
struct ChunkCache<'a, S: VoxelStore + ?Sized> {
    store: &'a S,
    chunks: HashMap<ChunkKey, Option<Arc<ChunkStorage>>>,
}

impl<'a, S: VoxelStore + ?Sized> ChunkCache<'a, S> {
    fn new(store: &'a S) -> Self {
        Self {
            store,
            chunks: HashMap::new(),
        }
    }

    fn is_occupied(&mut self, voxel: &VoxelKey) -> bool {
        let (key, voxel) = self
            .store
            .convert_world_position(&voxel.coords.cast::<f64>());
        let store = self.store;
        self.chunks
            .entry(key)
            .or_insert_with(|| store.chunk(&key))
            .as_ref()
            .is_some_and(|chunk| chunk.contains(&voxel))
    }
}

/// Beam updater.
#[derive(Debug, Clone)]
pub struct TrajectoryBeam {
    config: BeamConfig,

    /// Slide of the first ring along the path, in [0, slide length]
    current_move: f64,

    obstacles: HashMap<VoxelKey, ObstacleMarker>,
}

impl TrajectoryBeam {
    pub fn new(config: BeamConfig) -> Self {
        Self {
            config,
            current_move: 0.0,
            obstacles: HashMap::new(),
        }
    }

    pub fn config(&self) -> &BeamConfig {
        &self.config
    }

    /// Current slide of the first ring.
    pub fn slide(&self) -> f64 {
        self.current_move
    }

    /// Number of live obstacle markers.
    pub fn obstacle_count(&self) -> usize {
        self.obstacles.len()
    }

    /// Rebuilds the beam for a drone at `target` moving by `move_vector`
    /// (averaged velocity) and turning at `rotation_y` rad/s.
    pub fn update<S: VoxelStore + ?Sized>(
        &mut self,
        store: &S,
        target: &Vector3<f64>,
        move_vector: &Vector3<f64>,
        rotation_y: f64,
    ) -> BeamSnapshot {
        let segments = self.config.max_segments.max(2);
        let spacing = self.config.spacing_coef;
        let mut opacity = self.config.global_opacity;

        let finite = move_vector.iter().all(|c| c.is_finite()) && rotation_y.is_finite();
        let dummy = !finite || move_vector.norm() < self.config.min_display_speed;
        let (travel, per_ring, yaw_per_ring) = if dummy {
            opacity /= 2.0;
            let travel = Vector3::from(self.config.dummy_move);
            (travel, travel * spacing, 0.0)
        } else {
            (*move_vector, move_vector * spacing, rotation_y * spacing)
        };

        // Travel up to the first ring far enough from the drone
        let slide_length = (1..segments)
            .find(|&i| (per_ring * i as f64).norm() >= self.config.min_distance_between_rings)
            .map_or(per_ring.norm(), |i| (per_ring * i as f64).norm());
        let slide = if travel.norm() > 0.0 {
            travel.normalize() * self.current_move
        } else {
            Vector3::zeros()
        };
        let ratio = self.current_move / if slide_length == 0.0 { 1.0 } else { slide_length };

        // Ring frames, each relative to the previous one
        let yaw = |angle: f64| UnitQuaternion::from_axis_angle(&Vector3::y_axis(), angle);
        let root = yaw(yaw_per_ring);
        let mut frames = Vec::with_capacity(segments);
        let first = (
            target + root * (Vector3::from(self.config.anchor) + slide),
            root * yaw(yaw_per_ring * ratio),
        );
        frames.push(first);
        for i in 1..segments {
            let (position, rotation) = frames[i - 1];
            frames.push((position + rotation * per_ring, rotation * yaw(yaw_per_ring)));
        }

        let mut rings: Vec<BeamRing> = frames
            .iter()
            .map(|(position, rotation)| BeamRing {
                position: *position,
                yaw: rotation.scaled_axis().y,
                opacity: 0.0,
                visible: false,
            })
            .collect();

        let mut cache = ChunkCache::new(store);
        let mut danger_ring = None;
        let mut since_visible = Vector3::zeros();
        for i in 1..segments {
            since_visible += per_ring;
            if danger_ring.is_none() && since_visible.norm() >= self.config.min_distance_between_rings {
                since_visible = Vector3::zeros();
                opacity -= self.config.opacity_decrement;
                rings[i].opacity = opacity.max(0.0);
                rings[i].visible = true;
            }
            if danger_ring.is_none() && self.check_obstacle(&mut cache, &rings[i].position) {
                debug!(ring = i, "Obstacle on trajectory");
                danger_ring = Some(i);
            }
        }

        rings[0].opacity = (ratio * opacity).clamp(0.0, 1.0);
        rings[0].visible = true;

        self.advance_slide(dummy, slide_length);
        self.fade_obstacles();

        if let Some(last) = rings.iter_mut().rev().find(|r| r.visible) {
            last.visible = false;
        }

        let mut obstacles: Vec<ObstacleMarker> = self.obstacles.values().cloned().collect();
        obstacles.sort_by_key(|m| (m.anchor.x, m.anchor.y, m.anchor.z));

        BeamSnapshot {
            rings,
            dummy,
            danger: danger_ring.is_some(),
            danger_ring,
            obstacles,
        }
    }

    /// Tests the ring voxel and its face neighbors; records a marker on hit.
    fn check_obstacle<S: VoxelStore + ?Sized>(
        &mut self,
        cache: &mut ChunkCache<'_, S>,
        position: &Vector3<f64>,
    ) -> bool {
        let (_, anchor) = cache.store.convert_world_position(position);
        let hits: Vec<VoxelKey> = neighborhood(&anchor)
            .into_iter()
            .filter(|v| cache.is_occupied(v))
            .collect();
        if hits.is_empty() {
            return false;
        }
        // Re-detection replaces the marker at full opacity
        self.obstacles.insert(
            anchor,
            ObstacleMarker {
                anchor,
                voxels: hits,
                opacity: 1.0,
            },
        );
        true
    }

    fn advance_slide(&mut self, dummy: bool, slide_length: f64) {
        let step = slide_length / 10.0;
        if dummy {
            self.current_move += step;
            if self.current_move >= slide_length {
                self.current_move = (self.current_move - slide_length).max(0.0);
            }
        } else {
            self.current_move -= step;
            if self.current_move <= 0.0 {
                self.current_move = (self.current_move + slide_length).min(slide_length);
            }
        }
    }

    fn fade_obstacles(&mut self) {
        let fade = self.config.obstacle_fade;
        self.obstacles.retain(|_, marker| {
            marker.opacity -= fade;
            marker.opacity > 0.0
        });
    }
}

/// A voxel and its six face neighbors.
fn neighborhood(center: &VoxelKey) -> [VoxelKey; 7] {
    let at = |dx: i32, dy: i32, dz: i32| Point3::new(center.x + dx, center.y + dy, center.z + dz);
    [
        *center,
        at(-1, 0, 0),
        at(1, 0, 0),
        at(0, -1, 0),
        at(0, 1, 0),
        at(0, 0, -1),
        at(0, 0, 1),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::voxel_storage::VoxelStorageCore;
    use approx::assert_relative_eq;

    fn store_with(points: &[(i32, i32, i32)]) -> VoxelStorageCore {
        let store = VoxelStorageCore::new(&StorageConfig::default());
        let mut tx = store.start_transaction(&Vector3::zeros());
        for &(x, y, z) in points {
            tx.add_point(&Point3::new(x, y, z));
        }
        tx.end_transaction();
        store
    }

    fn target() -> Vector3<f64> {
        Vector3::new(0.5, 10.5, 0.5)
    }

    #[test]
    fn test_neighborhood() {
        let n = neighborhood(&Point3::new(1, 2, 3));
        assert_eq!(n[0], Point3::new(1, 2, 3));
        assert!(n.contains(&Point3::new(1, 2, 4)));
        assert!(n.contains(&Point3::new(0, 2, 3)));
        assert!(!n.contains(&Point3::new(2, 3, 3)));
    }

    #[test]
    fn test_slow_drone_gets_dummy_beam() {
        let store = store_with(&[]);
        let mut beam = TrajectoryBeam::new(BeamConfig::default());
        let snap = beam.update(&store, &target(), &Vector3::new(0.1, 0.0, 0.0), 0.0);

        assert!(snap.dummy);
        assert!(!snap.danger);
        let max_opacity = BeamConfig::default().global_opacity / 2.0;
        assert!(snap.rings.iter().all(|r| r.opacity <= max_opacity));
        // Dummy beam points forward (+Z)
        assert!(snap.rings[5].position.z > snap.rings[1].position.z);
    }

    #[test]
    fn test_straight_beam_layout() {
        let store = store_with(&[]);
        let mut beam = TrajectoryBeam::new(BeamConfig::default());
        // 4 * 0.25 = one voxel per ring
        let snap = beam.update(&store, &target(), &Vector3::new(0.0, 0.0, 4.0), 0.0);

        assert!(!snap.dummy);
        assert_eq!(snap.rings.len(), 12);
        for (i, ring) in snap.rings.iter().enumerate() {
            assert_relative_eq!(ring.position, Vector3::new(0.5, 10.0, 0.5 + i as f64), epsilon = 1e-9);
        }
        // Every ring is spaced enough; the last visible one is hidden
        assert_eq!(snap.visible_rings(), 11);
        assert!(!snap.rings[11].visible);
        assert_relative_eq!(snap.rings[1].opacity, 0.79, epsilon = 1e-9);
        assert_relative_eq!(snap.rings[2].opacity, 0.78, epsilon = 1e-9);
    }

    #[test]
    fn test_dense_rings_are_hidden() {
        let store = store_with(&[]);
        let mut beam = TrajectoryBeam::new(BeamConfig::default());
        // Half a voxel per ring: every other ring shows
        let snap = beam.update(&store, &target(), &Vector3::new(0.0, 0.0, 2.0), 0.0);
        assert!(!snap.rings[1].visible);
        assert!(snap.rings[2].visible);
        assert!(!snap.rings[3].visible);
        assert!(snap.rings[4].visible);
    }

    #[test]
    fn test_turning_beam_curves() {
        let store = store_with(&[]);
        let mut beam = TrajectoryBeam::new(BeamConfig::default());
        let snap = beam.update(&store, &target(), &Vector3::new(0.0, 0.0, 4.0), 1.0);

        let d1 = snap.rings[2].position - snap.rings[1].position;
        let d2 = snap.rings[9].position - snap.rings[8].position;
        assert_relative_eq!(d1.norm(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(d2.norm(), 1.0, epsilon = 1e-9);
        assert!(d1.angle(&d2) > 0.5);
    }

    #[test]
    fn test_obstacle_marks_danger() {
        // Ring 2 sits in voxel (0, 10, 2); its +Z neighbor is occupied
        let store = store_with(&[(0, 10, 3)]);
        let mut beam = TrajectoryBeam::new(BeamConfig::default());
        let snap = beam.update(&store, &target(), &Vector3::new(0.0, 0.0, 4.0), 0.0);

        assert!(snap.danger);
        assert_eq!(snap.danger_ring, Some(2));
        // No ring shows past the danger
        assert!(snap.rings[3..].iter().all(|r| !r.visible));

        assert_eq!(snap.obstacles.len(), 1);
        let marker = &snap.obstacles[0];
        assert_eq!(marker.anchor, Point3::new(0, 10, 2));
        assert_eq!(marker.voxels, vec![Point3::new(0, 10, 3)]);
        assert_relative_eq!(marker.opacity, 0.9, epsilon = 1e-9);
    }

    #[test]
    fn test_obstacle_across_chunk_border() {
        // Ring 1 sits in voxel (0, 10, 1); its -X neighbor lives in chunk -1
        let store = store_with(&[(-1, 10, 1)]);
        let mut beam = TrajectoryBeam::new(BeamConfig::default());
        let snap = beam.update(&store, &target(), &Vector3::new(0.0, 0.0, 4.0), 0.0);
        assert_eq!(snap.danger_ring, Some(1));
    }

    #[test]
    fn test_markers_fade_out() {
        let store = store_with(&[(0, 10, 3)]);
        let mut beam = TrajectoryBeam::new(BeamConfig::default());
        beam.update(&store, &target(), &Vector3::new(0.0, 0.0, 4.0), 0.0);
        assert_eq!(beam.obstacle_count(), 1);

        let away = Vector3::new(40.5, 10.5, 40.5);
        for _ in 0..5 {
            beam.update(&store, &away, &Vector3::new(0.0, 0.0, 4.0), 0.0);
        }
        assert_eq!(beam.obstacle_count(), 1);
        for _ in 0..5 {
            beam.update(&store, &away, &Vector3::new(0.0, 0.0, 4.0), 0.0);
        }
        assert_eq!(beam.obstacle_count(), 0);
    }

    #[test]
    fn test_slide_stays_in_range() {
        let store = store_with(&[]);
        let mut beam = TrajectoryBeam::new(BeamConfig::default());
        for i in 0..60 {
            let speed = if i % 20 < 10 { 4.0 } else { 0.0 };
            let snap = beam.update(&store, &target(), &Vector3::new(0.0, 0.0, speed), 0.0);
            assert!(beam.slide() >= 0.0);
            assert!(beam.slide() <= 1.0 + 1e-9);
            assert!(snap.rings.iter().all(|r| r.position.iter().all(|c| c.is_finite())));
        }
    }

    #[test]
    fn test_non_finite_input_falls_back_to_dummy() {
        let store = store_with(&[]);
        let mut beam = TrajectoryBeam::new(BeamConfig::default());
        let snap = beam.update(&store, &target(), &Vector3::new(f64::NAN, 0.0, 0.0), 0.0);
        assert!(snap.dummy);
        assert!(snap.rings.iter().all(|r| r.position.iter().all(|c| c.is_finite())));
    }
}
