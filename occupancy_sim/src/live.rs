//! Real-time run on the production context.
//!
//! Same pipeline as [`SimWorld`](crate::SimWorld), but paced by tokio's
//! clock and with telemetry consumed by a spawned task through
//! [`TelemetrySource::recv`], the way a connected drone is served.

use crate::error::SimError;
use crate::oracle::{FlightLeg, FlightOracle, Pillar};
use crate::telemetry::SimTelemetry;

use nalgebra::Vector3;
use occupancy_core::{OccupancyConfig, OccupancyRenderer, SceneMapper, VoxelStorageCore};
use occupancy_env::{OccupancyContext, TelemetryController, TelemetrySample, TelemetrySource, TokioContext};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Settings of a live run.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub seed: u64,
    pub duration: Duration,
    pub render_hz: u32,
    /// Telemetry loss probability
    pub dropout: f64,
    pub engine: OccupancyConfig,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            duration: Duration::from_secs(10),
            render_hz: 60,
            dropout: 0.0,
            engine: OccupancyConfig::default(),
        }
    }
}

/// Converts a CLI duration in seconds; negative values clamp to zero.
pub fn live_duration(secs: f64) -> Result<Duration, SimError> {
    Duration::try_from_secs_f64(secs.max(0.0))
        .map_err(|e| SimError::InvalidSetting(format!("duration {secs}: {e}")))
}

/// What a live run produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LiveSummary {
    pub frames: u64,
    pub samples_published: u64,
    pub samples_received: u64,
    pub storage_commits: u64,
    pub beam_updates: u64,
    pub danger_frames: u64,
    pub final_horizontal_angle: f64,
    pub final_vertical_angle: f64,
}

/// Flies an orbit around a pillar field in real time.
pub async fn run_live(config: LiveConfig) -> Result<LiveSummary, SimError> {
    config.engine.validate()?;
    if config.render_hz == 0 {
        return Err(SimError::InvalidSetting("render_hz must be positive".into()));
    }

    let context = TokioContext::shared();
    let storage = Arc::new(VoxelStorageCore::new(&config.engine.storage));
    let mut renderer = OccupancyRenderer::new(context.clone(), storage.clone(), &config.engine);
    let mapper = SceneMapper::for_storage(&storage);

    let (feed, source, controller) =
        SimTelemetry::channel(64, ChaCha8Rng::seed_from_u64(config.seed ^ 1));
    controller.set_dropout_rate(config.dropout);

    // Consumer task: the sink is fed as samples arrive, not per frame
    let latest: Arc<Mutex<Option<TelemetrySample>>> = Arc::new(Mutex::new(None));
    let (done_tx, done_rx) = oneshot::channel();
    {
        let sink = renderer.sink();
        let latest = latest.clone();
        context.spawn("telemetry", async move {
            while let Ok(sample) = source.recv().await {
                sink.push(&sample);
                *latest.lock().unwrap_or_else(|e| e.into_inner()) = Some(sample);
            }
            debug!(received = source.received_count(), "Telemetry channel closed");
            let _ = done_tx.send(());
        });
    }

    let mut oracle = FlightOracle::new(config.seed, Vector3::new(0.0, 0.0, -5.0));
    oracle.push_leg(FlightLeg::Hover { duration: 1.0 });
    oracle.push_leg(FlightLeg::Orbit {
        speed: 3.0,
        turn_rate: 0.4,
        duration: f64::MAX,
    });
    for (north, east) in [(6.0, 2.0), (-4.0, 7.0), (3.0, -8.0)] {
        oracle.add_pillar(Pillar {
            north,
            east,
            radius: 1.0,
            height: 12.0,
        });
    }

    info!(seed = config.seed, secs = config.duration.as_secs_f64(), "Live run started");

    let period = Duration::from_secs_f64(1.0 / f64::from(config.render_hz));
    let mut interval = tokio::time::interval(period);
    let mut summary = LiveSummary::default();
    let mut last = context.now();

    while context.now() < config.duration {
        interval.tick().await;
        let now = context.now();
        oracle.step((now - last).as_secs_f64());
        last = now;

        if summary.frames % 2 == 0 {
            feed.publish(oracle.telemetry_sample(now.as_millis() as u64));

            let points = oracle.depth_scan(&mapper, storage.voxel_real_size());
            let mut transaction = storage.start_transaction(&oracle.drone().position_ned);
            for point in &points {
                transaction.add_point(point);
            }
            transaction.end_transaction();
            summary.storage_commits += 1;
        }

        let sample = latest.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(sample) = sample {
            renderer.set_target_pose(mapper.target_pose(&sample, storage.grid_origin().as_ref()));
        }

        let frame = renderer.render(now.as_secs_f64());
        summary.frames += 1;
        summary.final_horizontal_angle = frame.horizontal_angle;
        summary.final_vertical_angle = frame.vertical_angle;
    }

    // Closing the feed ends the consumer task once the queue is drained
    summary.samples_published = feed.published_count();
    drop(feed);
    if done_rx.await.is_err() {
        warn!("Telemetry consumer ended without signalling");
    }

    let stats = renderer.stats();
    summary.samples_received = renderer.sink().samples_received();
    summary.beam_updates = stats.beam_updates;
    summary.danger_frames = stats.danger_frames;
    info!(frames = summary.frames, samples = summary.samples_received, "Live run finished");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_live_run_renders() {
        let config = LiveConfig {
            duration: Duration::from_millis(300),
            ..Default::default()
        };
        let summary = run_live(config).await.unwrap();

        assert!(summary.frames > 0);
        assert!(summary.storage_commits > 0);
        assert!(summary.beam_updates > 0);
        assert!(summary.final_horizontal_angle.is_finite());
    }

    #[tokio::test]
    async fn test_live_summary_counts_every_queued_sample() {
        let config = LiveConfig {
            duration: Duration::from_millis(200),
            ..Default::default()
        };
        let summary = run_live(config).await.unwrap();

        assert!(summary.samples_published > 0);
        assert_eq!(summary.samples_received, summary.samples_published);
    }

    #[test]
    fn test_live_duration_rejects_infinity() {
        assert_eq!(live_duration(1.5).unwrap(), Duration::from_millis(1500));
        assert_eq!(live_duration(-3.0).unwrap(), Duration::ZERO);
        assert!(matches!(live_duration(f64::INFINITY), Err(SimError::InvalidSetting(_))));
    }

    #[tokio::test]
    async fn test_live_rejects_bad_config() {
        let config = LiveConfig {
            render_hz: 0,
            ..Default::default()
        };
        assert!(matches!(run_live(config).await, Err(SimError::InvalidSetting(_))));
    }
}
