//! Occupancy Deterministic Simulation Harness
//!
//! This crate flies a simulated drone through an obstacle field and drives
//! the occupancy engine with what the drone would report, so every camera
//! and beam decision can be replayed from a single seed.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: a virtual clock advanced one render frame at a time
//! - **Telemetry**: a channel with injectable stalls and dropouts
//! - **Randomness**: all noise derived from a single 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          SimWorld                            │
//! │  ┌──────────────┐  telemetry   ┌──────────────────────────┐  │
//! │  │ FlightOracle │─────────────►│ SimTelemetry (faults)    │  │
//! │  │ (truth)      │              └────────────┬─────────────┘  │
//! │  └──────┬───────┘                           ▼                │
//! │         │ depth scans          ┌──────────────────────────┐  │
//! │         ▼                      │ TelemetrySink            │  │
//! │  ┌──────────────┐  changes     │   └► OccupancyRenderer   │  │
//! │  │ VoxelStorage │─────────────►│      camera + beam       │  │
//! │  └──────────────┘              └──────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use occupancy_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::TelemetryStall);
//! assert!(result.passed);
//! ```

mod context;
mod error;
mod exporter;
mod live;
mod oracle;
mod runner;
mod telemetry;
mod world;
pub mod scenarios;

pub use context::SimContext;
pub use error::SimError;
pub use exporter::SimExport;
pub use live::{live_duration, run_live, LiveConfig, LiveSummary};
pub use oracle::{DroneTruth, FlightLeg, FlightOracle, Pillar, SensorNoise};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use telemetry::{SimTelemetry, SimTelemetryController, SimTelemetryFeed};
pub use world::{FrameRecord, SimConfig, SimWorld, WorldMetrics};
