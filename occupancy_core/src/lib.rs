//! Occupancy Core - Real-Time Obstacle Visualization Engine
//!
//! This library keeps a drone's surroundings on screen without stutter:
//! 1. **Catch-up Problem**: a bounded, versioned change log so the renderer
//!    redraws only the chunks changed since its last frame
//! 2. **Jitter Problem**: sliding-window estimators that smooth irregular
//!    telemetry and decay when it stalls
//! 3. **Seasickness Problem**: a following camera that snaps to a few look
//!    angles and eases between them, with a timed override against dropouts

pub mod beam;
pub mod config;
pub mod error;
pub mod following_angle;
pub mod following_camera;
pub mod kinematics;
pub mod math;
pub mod renderer;
pub mod sight_angle;
pub mod telemetry;
pub mod transaction_history;
pub mod voxel_storage;

// Re-export key types for convenience
pub use beam::{BeamRing, BeamSnapshot, ObstacleMarker, TrajectoryBeam};
pub use config::{BeamConfig, CameraConfig, EstimatorConfig, OccupancyConfig, StorageConfig};
pub use error::OccupancyError;
pub use following_angle::FollowingAngleAnalyser;
pub use following_camera::{target_destination, FollowingCamera, Pose};
pub use kinematics::{Rotatiometer, SampleWindow, Speedometer};
pub use renderer::{OccupancyRenderer, RenderFrame, RenderStats};
pub use sight_angle::{CameraPlane, SightAngleAnalyser};
pub use telemetry::{FrameDecision, FrameThrottle, SceneMapper, TelemetrySink};
pub use transaction_history::{ChangeSet, TransactionHistory};
pub use voxel_storage::{ChunkKey, ChunkStorage, Transaction, VoxelKey, VoxelStorageCore, VoxelStore};
