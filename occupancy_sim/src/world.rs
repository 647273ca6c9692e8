//! SimWorld - The simulation harness container.
//!
//! One `step()` is one render frame. Within it the world:
//! 1. advances the virtual clock and the flight oracle
//! 2. publishes telemetry through the faulty feed and drains it into the sink
//! 3. offers a depth frame to the throttled grid producer
//! 4. renders, then checks what the renderer was told against the storage

use crate::context::SimContext;
use crate::error::SimError;
use crate::oracle::{FlightOracle, SensorNoise};
use crate::telemetry::{SimTelemetry, SimTelemetryController, SimTelemetryFeed};

use nalgebra::Vector3;
use occupancy_core::{
    ChunkKey, FrameDecision, FrameThrottle, OccupancyConfig, OccupancyRenderer, Pose, RenderFrame,
    SceneMapper, TelemetrySink, VoxelStorageCore, VoxelStore,
};
use occupancy_env::{OccupancyContext, TelemetrySample};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Configuration for a simulation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Master seed for determinism
    pub seed: u64,

    /// Render rate in Hz; one world step per frame
    pub render_hz: u32,

    /// Telemetry publish rate in Hz
    pub telemetry_hz: u32,

    /// Depth frame rate in Hz
    pub depth_hz: u32,

    /// Render frames a processed depth frame keeps the grid producer busy
    pub processing_ticks: u32,

    /// Telemetry channel capacity
    pub telemetry_capacity: usize,

    /// Drone start position [north, east, down]
    pub start_ned: [f64; 3],

    /// Depth sensor range (meters)
    pub sensor_range: f64,

    pub noise: SensorNoise,

    /// Engine under test
    pub engine: OccupancyConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            render_hz: 60,
            telemetry_hz: 30,
            depth_hz: 30,
            processing_ticks: 1,
            telemetry_capacity: 64,
            start_ned: [0.0, 0.0, -5.0],
            sensor_range: 12.0,
            noise: SensorNoise::default(),
            engine: OccupancyConfig::default(),
        }
    }
}

impl SimConfig {
    fn validate(&self) -> Result<(), SimError> {
        self.engine.validate()?;
        for (name, hz) in [
            ("render_hz", self.render_hz),
            ("telemetry_hz", self.telemetry_hz),
            ("depth_hz", self.depth_hz),
        ] {
            if hz == 0 {
                return Err(SimError::InvalidSetting(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Counters collected while stepping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldMetrics {
    pub frames: u64,
    pub telemetry_published: u64,
    pub telemetry_dropped: u64,
    pub samples_received: u64,

    pub depth_frames: u64,
    pub depth_processed: u64,
    pub depth_missed: u64,
    pub storage_commits: u64,
    pub max_drop_trigger: u32,

    pub beam_updates: u64,
    pub danger_frames: u64,
    /// Beam refreshes that read from an evicted version
    pub resyncs: u64,
    /// Camera transitions started
    pub transitions: u64,

    /// Frames with a non-finite pose or angle
    pub non_finite_frames: u64,
    /// Beam refreshes after which a stored chunk was never reported
    pub unreported_chunks: u64,
    /// Beam refreshes that did not leave the watermark at the next version
    pub stale_watermarks: u64,
}

/// Compact, serializable view of one rendered frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecord {
    pub tick: u64,
    pub time_secs: f64,
    pub truth_ned: Vector3<f64>,
    pub camera: Pose,
    pub target: Pose,
    pub speed: Vector3<f64>,
    pub is_stationary: bool,
    pub horizontal_angle: f64,
    pub vertical_angle: f64,
    pub transitioning: bool,
    pub beam_refreshed: bool,
    pub danger: bool,
    pub visible_rings: usize,
    pub obstacles: usize,
    pub dirty_chunks: usize,
    pub resync: bool,
    pub store_version: u64,
    pub watermark: u64,
}

/// The SimWorld - container for the entire simulation.
pub struct SimWorld {
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Ground truth oracle
    pub oracle: FlightOracle,

    storage: Arc<VoxelStorageCore>,
    renderer: OccupancyRenderer<SimContext, VoxelStorageCore>,
    sink: TelemetrySink<SimContext>,
    mapper: SceneMapper,

    feed: SimTelemetryFeed,
    source: SimTelemetry,
    controller: SimTelemetryController,

    throttle: FrameThrottle,
    /// Tick at which the grid producer becomes free again
    busy_until: u64,

    last_sample: Option<TelemetrySample>,
    was_transitioning: bool,

    /// Chunks the renderer has been told about
    reported: HashSet<ChunkKey>,

    tick_count: u64,
    metrics: WorldMetrics,
}

impl SimWorld {
    /// Creates a new SimWorld with the given configuration.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        config.validate()?;

        // Separate streams, so a fault schedule never shifts the flight noise
        let context = SimContext::shared(config.seed);
        let physics_seed = config.seed.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        let oracle = FlightOracle::new(physics_seed, Vector3::from(config.start_ned))
            .with_noise(config.noise)
            .with_sensor_range(config.sensor_range);
        let (feed, source, controller) =
            SimTelemetry::channel(config.telemetry_capacity, context.derive_rng(1));

        let storage = Arc::new(VoxelStorageCore::new(&config.engine.storage));
        let renderer = OccupancyRenderer::new(context.clone(), storage.clone(), &config.engine);
        let sink = renderer.sink();
        let mapper = SceneMapper::for_storage(&storage);
        let throttle = FrameThrottle::new(config.engine.storage.max_drop_frame_for_update);

        Ok(Self {
            config,
            context,
            oracle,
            storage,
            renderer,
            sink,
            mapper,
            feed,
            source,
            controller,
            throttle,
            busy_until: 0,
            last_sample: None,
            was_transitioning: false,
            reported: HashSet::new(),
            tick_count: 0,
            metrics: WorldMetrics::default(),
        })
    }

    /// Fault injection handle for the telemetry feed.
    pub fn telemetry_controller(&self) -> &SimTelemetryController {
        &self.controller
    }

    pub fn renderer(&self) -> &OccupancyRenderer<SimContext, VoxelStorageCore> {
        &self.renderer
    }

    pub fn storage(&self) -> &Arc<VoxelStorageCore> {
        &self.storage
    }

    pub fn metrics(&self) -> &WorldMetrics {
        &self.metrics
    }

    /// Returns the current simulation time in seconds.
    pub fn time(&self) -> f64 {
        self.context.now().as_secs_f64()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Advances the simulation by one render frame.
    pub fn step(&mut self) -> FrameRecord {
        let dt = 1.0 / f64::from(self.config.render_hz);
        self.context.advance_time(Duration::from_secs_f64(dt));
        self.oracle.step(dt);
        self.tick_count += 1;

        if self.tick_count % every(self.config.render_hz, self.config.telemetry_hz) == 0 {
            let timestamp_ms = self.context.now().as_millis() as u64;
            let sample = self.oracle.telemetry_sample(timestamp_ms);
            self.feed.publish(sample);
        }
        for sample in self.source.drain() {
            self.sink.push(&sample);
            self.last_sample = Some(sample);
        }

        if self.tick_count % every(self.config.render_hz, self.config.depth_hz) == 0 {
            self.process_depth_frame();
        }

        if let Some(sample) = &self.last_sample {
            let origin = self.storage.grid_origin();
            let pose = self.mapper.target_pose(sample, origin.as_ref());
            self.renderer.set_target_pose(pose);
        }

        let behind = self
            .storage
            .history()
            .oldest_retained_version()
            .map_or(false, |oldest| self.renderer.watermark() < oldest);
        let frame = self.renderer.render(self.time());
        self.observe(frame, behind)
    }

    /// Steps until `duration` seconds of simulated time have passed.
    pub fn run_for(&mut self, duration: f64) -> Vec<FrameRecord> {
        let ticks = (duration * f64::from(self.config.render_hz)).round() as u64;
        (0..ticks).map(|_| self.step()).collect()
    }

    fn process_depth_frame(&mut self) {
        self.metrics.depth_frames += 1;
        let slot_available = self.tick_count >= self.busy_until;

        match self.throttle.on_frame(slot_available) {
            FrameDecision::Missed => {
                self.metrics.depth_missed += 1;
            }
            FrameDecision::Process { update_storage } => {
                self.metrics.depth_processed += 1;
                self.busy_until = self.tick_count + u64::from(self.config.processing_ticks);
                if update_storage {
                    let voxel_size = self.storage.voxel_real_size();
                    let points = self.oracle.depth_scan(&self.mapper, voxel_size);
                    let drone = self.oracle.drone().position_ned;

                    let mut transaction = self.storage.start_transaction(&drone);
                    for point in &points {
                        transaction.add_point(point);
                    }
                    let version = transaction.end_transaction();
                    self.metrics.storage_commits += 1;
                    trace!(version, points = points.len(), "Depth frame committed");
                }
            }
        }
        self.metrics.max_drop_trigger = self.metrics.max_drop_trigger.max(self.throttle.drop_trigger());
    }

    fn observe(&mut self, frame: RenderFrame, behind: bool) -> FrameRecord {
        self.metrics.frames += 1;
        self.metrics.telemetry_published = self.feed.published_count();
        self.metrics.telemetry_dropped = self.feed.dropped_count();
        self.metrics.samples_received = self.sink.samples_received();

        let finite = frame.camera.is_finite()
            && frame.target.is_finite()
            && frame.horizontal_angle.is_finite()
            && frame.vertical_angle.is_finite();
        if !finite {
            self.metrics.non_finite_frames += 1;
        }

        let transitioning = self.renderer.camera().is_transitioning();
        if transitioning && !self.was_transitioning {
            self.metrics.transitions += 1;
        }
        self.was_transitioning = transitioning;

        let store_version = self.storage.current_version();
        let watermark = self.renderer.watermark();
        let resync = frame.beam.is_some() && behind;

        if let Some(beam) = &frame.beam {
            self.metrics.beam_updates += 1;
            if resync {
                self.metrics.resyncs += 1;
                debug!(tick = self.tick_count, "Renderer fell behind the change log");
            }
            if beam.danger {
                self.metrics.danger_frames += 1;
            }
            if watermark != store_version + 1 {
                self.metrics.stale_watermarks += 1;
            }

            for key in &frame.dirty_chunks {
                if self.storage.chunk(key).is_some() {
                    self.reported.insert(*key);
                } else {
                    self.reported.remove(key);
                }
            }
            if !self.storage.all_chunk_keys().is_subset(&self.reported) {
                self.metrics.unreported_chunks += 1;
            }
        }

        FrameRecord {
            tick: self.tick_count,
            time_secs: frame.elapsed,
            truth_ned: self.oracle.drone().position_ned,
            camera: frame.camera,
            target: frame.target,
            speed: frame.speed,
            is_stationary: frame.is_stationary,
            horizontal_angle: frame.horizontal_angle,
            vertical_angle: frame.vertical_angle,
            transitioning,
            beam_refreshed: frame.beam.is_some(),
            danger: frame.beam.as_ref().map_or(false, |b| b.danger),
            visible_rings: frame.beam.as_ref().map_or(0, |b| b.visible_rings()),
            obstacles: frame.beam.as_ref().map_or(0, |b| b.obstacles.len()),
            dirty_chunks: frame.dirty_chunks.len(),
            resync,
            store_version,
            watermark,
        }
    }
}

/// Render ticks between two events of rate `hz`.
fn every(render_hz: u32, hz: u32) -> u64 {
    u64::from((render_hz / hz.max(1)).max(1))
}
