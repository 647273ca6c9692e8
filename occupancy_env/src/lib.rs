//! Occupancy Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the occupancy
//! engines to run against **Production** (tokio, wall clock) and
//! **Simulation** (virtual clock) environments.
//!
//! # Core Concept
//!
//! The visualization engines never read the clock or a telemetry socket
//! directly. Everything that makes a run non-reproducible goes through:
//! - Time (`now()`, `sleep()`)
//! - Telemetry (`recv()`)
//!
//! so a simulated flight replays bit-for-bit from its seed.
//!
//! # Example
//!
//! ```ignore
//! use occupancy_env::{OccupancyContext, TelemetrySource};
//!
//! async fn producer<Ctx: OccupancyContext, Src: TelemetrySource>(ctx: &Ctx, src: &Src) {
//!     while let Ok(sample) = src.recv().await {
//!         sink.push(&sample);
//!         ctx.sleep(Duration::from_millis(33)).await;
//!     }
//! }
//! ```

mod context;
mod telemetry;
mod types;
mod error;
mod tokio_impl;

pub use context::OccupancyContext;
pub use telemetry::{TelemetrySource, TelemetryController};
pub use types::{FlyingState, TelemetrySample};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
