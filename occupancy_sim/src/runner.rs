//! Scenario runner - flies scenarios and checks the engine invariants.

use crate::error::SimError;
use crate::oracle::{FlightLeg, Pillar};
use crate::scenarios::ScenarioId;
use crate::world::{FrameRecord, SimConfig, SimWorld, WorldMetrics};

use nalgebra::Vector3;
use occupancy_core::math::wrap_pi;
use occupancy_core::{target_destination, CameraConfig, OccupancyConfig, SceneMapper, SightAngleAnalyser};
use occupancy_env::TelemetryController;
use serde::Serialize;
use std::f64::consts::FRAC_PI_3;
use tracing::{debug, info, warn};

/// Tolerance for comparing settled camera angles.
const ANGLE_EPSILON: f64 = 1e-6;

/// Climbing at 60° above the horizon, the center of a vertical slice.
const CLIMB_VELOCITY: [f64; 3] = [1.154_700_538_379_251_5, 0.0, -2.0];

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total render frames executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    pub world: WorldMetrics,

    pub final_horizontal_angle: f64,
    pub final_vertical_angle: f64,

    /// Settled angle the camera should reach, when the scenario defines one
    pub expected_horizontal_angle: Option<f64>,
    pub expected_vertical_angle: Option<f64>,

    /// Distance to the nearest pillar when the beam first reported danger
    pub first_danger_clearance: Option<f64>,
}

/// Telemetry fault applied at a given simulation time.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Fault {
    Stall,
    Resume,
    Dropout(f64),
}

/// Everything a scenario sets up before flying.
struct Plan {
    config: SimConfig,
    legs: Vec<FlightLeg>,
    pillars: Vec<Pillar>,
    faults: Vec<(f64, Fault)>,
}

/// Runs flight scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Requested duration in seconds; scenarios may run longer
    max_duration_secs: f64,

    /// Engine configuration under test
    engine: OccupancyConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            max_duration_secs: 10.0,
            engine: OccupancyConfig::default(),
        }
    }

    /// Sets the maximum duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs;
        self
    }

    /// Sets the engine configuration.
    pub fn with_engine(mut self, engine: OccupancyConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Obstacles a scenario places in the world.
    pub fn pillars(&self, scenario: ScenarioId) -> Vec<Pillar> {
        self.plan(scenario).pillars
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        self.run_recorded(scenario).0
    }

    /// Runs a scenario and also returns every rendered frame.
    pub fn run_recorded(&self, scenario: ScenarioId) -> (ScenarioResult, Vec<FrameRecord>) {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        match self.execute(scenario) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Scenario could not start");
                let result = ScenarioResult {
                    scenario: scenario.name().to_string(),
                    seed: self.seed,
                    passed: false,
                    total_ticks: 0,
                    final_time_secs: 0.0,
                    failure_reason: Some(e.to_string()),
                    metrics: ScenarioMetrics::default(),
                };
                (result, Vec::new())
            }
        }
    }

    fn execute(&self, scenario: ScenarioId) -> Result<(ScenarioResult, Vec<FrameRecord>), SimError> {
        let plan = self.plan(scenario);
        let duration = self.max_duration_secs.max(scenario.min_duration());
        let camera = plan.config.engine.camera.clone();

        let mut world = SimWorld::new(plan.config)?;
        for leg in plan.legs {
            world.oracle.push_leg(leg);
        }
        for pillar in plan.pillars {
            world.oracle.add_pillar(pillar);
        }

        let mut faults = plan.faults;
        faults.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut pending = faults.into_iter().peekable();

        let ticks = (duration * f64::from(world.config.render_hz)).round() as u64;
        let mut frames = Vec::with_capacity(ticks as usize);
        let mut first_danger_clearance = None;

        for tick in 0..ticks {
            while let Some((_, fault)) = pending.next_if(|(at, _)| *at <= world.time()) {
                debug!(t = world.time(), ?fault, "Injecting telemetry fault");
                let controller = world.telemetry_controller();
                match fault {
                    Fault::Stall => controller.stall(),
                    Fault::Resume => controller.resume(),
                    Fault::Dropout(rate) => controller.set_dropout_rate(rate),
                }
            }

            let frame = world.step();
            if frame.danger && first_danger_clearance.is_none() {
                first_danger_clearance = world.oracle.nearest_clearance();
            }
            if tick % 60 == 0 {
                debug!(
                    "  t={:.1}s | h={:.3} | v={:.3} | chunks={}",
                    frame.time_secs,
                    frame.horizontal_angle,
                    frame.vertical_angle,
                    world.storage().chunk_count()
                );
            }
            frames.push(frame);
        }

        let mut metrics = ScenarioMetrics {
            world: world.metrics().clone(),
            first_danger_clearance,
            ..Default::default()
        };
        if let Some(last) = frames.last() {
            metrics.final_horizontal_angle = last.horizontal_angle;
            metrics.final_vertical_angle = last.vertical_angle;
        }

        let verdict = check_common(&world).and_then(|()| {
            self.check_scenario(scenario, &world, &frames, &camera, &mut metrics)
        });

        let result = ScenarioResult {
            scenario: scenario.name().to_string(),
            seed: self.seed,
            passed: verdict.is_ok(),
            total_ticks: world.tick_count(),
            final_time_secs: world.time(),
            failure_reason: verdict.err(),
            metrics,
        };
        Ok((result, frames))
    }

    fn plan(&self, scenario: ScenarioId) -> Plan {
        let mut config = SimConfig {
            seed: self.seed,
            engine: self.engine.clone(),
            ..Default::default()
        };
        let long = 1_000.0;
        let mut legs = Vec::new();
        let mut pillars = Vec::new();
        let mut faults = Vec::new();

        match scenario {
            ScenarioId::Hover => {
                legs.push(FlightLeg::Hover { duration: long });
                pillars.push(pillar(6.0, 3.0));
            }
            ScenarioId::StraightLine => {
                legs.push(straight(heading_velocity(4.0), long));
                pillars.push(pillar(20.0, 20.0));
            }
            ScenarioId::Orbit => {
                legs.push(FlightLeg::Orbit {
                    speed: 3.0,
                    turn_rate: 0.5,
                    duration: long,
                });
            }
            ScenarioId::Climb => {
                legs.push(FlightLeg::Climb {
                    rate: 2.0,
                    duration: 0.5,
                });
                legs.push(straight(CLIMB_VELOCITY, long));
                pillars.push(pillar(3.0, 3.0));
            }
            ScenarioId::SensorDropout => {
                legs.push(straight(heading_velocity(4.0), long));
                faults.push((1.0, Fault::Dropout(0.6)));
            }
            ScenarioId::TelemetryStall => {
                legs.push(straight(heading_velocity(4.0), long));
                faults.push((3.0, Fault::Stall));
                faults.push((7.0, Fault::Resume));
            }
            ScenarioId::ObstacleApproach => {
                legs.push(straight([3.0, 0.0, 0.0], 3.5));
                legs.push(FlightLeg::Hover { duration: long });
                pillars.push(pillar(14.0, 0.0));
            }
            ScenarioId::SlowConsumer => {
                config.engine.beam.refresh_rate_hz = 2.0;
                config.engine.storage.history_capacity = 3;
                legs.push(straight(heading_velocity(4.0), long));
                pillars.push(pillar(8.0, 6.0));
                pillars.push(pillar(16.0, 14.0));
            }
            ScenarioId::SlowProcessor => {
                config.processing_ticks = 9;
                legs.push(straight(heading_velocity(2.0), long));
                pillars.push(pillar(6.0, 4.0));
            }
        }

        Plan {
            config,
            legs,
            pillars,
            faults,
        }
    }

    fn check_scenario(
        &self,
        scenario: ScenarioId,
        world: &SimWorld,
        frames: &[FrameRecord],
        camera: &CameraConfig,
        metrics: &mut ScenarioMetrics,
    ) -> Result<(), String> {
        let last = frames.last().ok_or("no frame rendered")?;
        let m = metrics.world.clone();

        match scenario {
            ScenarioId::Hover => {
                expect_angle("horizontal", last.horizontal_angle, camera.horizontal_neutral_angle)?;
                expect_angle("vertical", last.vertical_angle, camera.vertical_neutral_angle)?;
                if !last.is_stationary {
                    return Err("hovering drone not reported stationary".into());
                }
                let offset = last.camera.position - last.target.position;
                let behind = Vector3::new(0.0, camera.height_above_target, -camera.distance_behind_target);
                if (offset - behind).norm() > ANGLE_EPSILON {
                    return Err(format!("camera offset {offset:?} is not behind the drone"));
                }
                if m.transitions > 0 {
                    return Err(format!("{} transitions while hovering", m.transitions));
                }
            }
            ScenarioId::StraightLine => {
                let expected = expected_horizontal(camera, heading_velocity(4.0));
                metrics.expected_horizontal_angle = expected;
                let expected = expected.ok_or("heading gives no horizontal angle")?;
                expect_angle("horizontal", last.horizontal_angle, expected)?;
                if m.transitions > 2 {
                    return Err(format!("camera flapped: {} transitions", m.transitions));
                }
            }
            ScenarioId::Orbit => {
                let slice = 2.0 * std::f64::consts::PI / f64::from(camera.slices.max(1));
                let crossings = (0.5 * last.time_secs / slice).ceil() as u64;
                if m.transitions == 0 {
                    return Err("camera never followed the turn".into());
                }
                if m.transitions > 2 * crossings + 3 {
                    return Err(format!(
                        "camera flapped: {} transitions for {} slice crossings",
                        m.transitions, crossings
                    ));
                }
            }
            ScenarioId::Climb => {
                let expected = expected_vertical(camera, CLIMB_VELOCITY);
                metrics.expected_vertical_angle = expected;
                let expected = expected.ok_or("climb gives no vertical angle")?;
                if expected <= 0.0 {
                    return Err(format!("climb angle {expected} is not positive"));
                }
                expect_angle("vertical", last.vertical_angle, expected)?;
            }
            ScenarioId::SensorDropout => {
                if m.telemetry_dropped == 0 {
                    return Err("no telemetry was dropped".into());
                }
                let expected = expected_horizontal(camera, heading_velocity(4.0));
                metrics.expected_horizontal_angle = expected;
                let expected = expected.ok_or("heading gives no horizontal angle")?;
                expect_angle("horizontal", last.horizontal_angle, expected)?;
                let fell_back = frames.iter().any(|f| {
                    f.time_secs > 3.0
                        && wrap_pi(f.horizontal_angle - camera.horizontal_neutral_angle).abs() < ANGLE_EPSILON
                });
                if fell_back {
                    return Err("camera fell back to neutral during dropout".into());
                }
            }
            ScenarioId::TelemetryStall => {
                let drained = frame_at(frames, 3.5).ok_or("run ended before the stall")?;
                if drained.speed.norm() != 0.0 {
                    return Err(format!("speed {:?} did not decay during the stall", drained.speed));
                }
                let stalled = frame_at(frames, 6.9).ok_or("run ended during the stall")?;
                expect_angle("stalled horizontal", stalled.horizontal_angle, camera.horizontal_neutral_angle)?;

                let expected = expected_horizontal(camera, heading_velocity(4.0));
                metrics.expected_horizontal_angle = expected;
                let expected = expected.ok_or("heading gives no horizontal angle")?;
                expect_angle("recovered horizontal", last.horizontal_angle, expected)?;
            }
            ScenarioId::ObstacleApproach => {
                if m.danger_frames == 0 {
                    return Err("beam never reported the pillar".into());
                }
                match metrics.first_danger_clearance {
                    Some(clearance) if clearance > 0.5 => {}
                    other => return Err(format!("danger reported too late: clearance {other:?}")),
                }
                if !frames.iter().any(|f| f.obstacles > 0) {
                    return Err("no obstacle marker produced".into());
                }
            }
            ScenarioId::SlowConsumer => {
                if m.resyncs == 0 {
                    return Err("renderer never fell behind the change log".into());
                }
                if world.storage().chunk_count() == 0 {
                    return Err("no chunk stored".into());
                }
            }
            ScenarioId::SlowProcessor => {
                let max = world.config.engine.storage.max_drop_frame_for_update.max(1);
                if m.depth_missed == 0 {
                    return Err("processor never missed a frame".into());
                }
                if m.max_drop_trigger <= 1 || m.max_drop_trigger > max {
                    return Err(format!("drop trigger {} outside (1, {max}]", m.max_drop_trigger));
                }
                if m.storage_commits == 0 {
                    return Err("no depth frame reached the storage".into());
                }
            }
        }
        Ok(())
    }
}

/// Invariants every scenario must hold.
fn check_common(world: &SimWorld) -> Result<(), String> {
    let m = world.metrics();
    if m.non_finite_frames > 0 {
        return Err(format!("{} frames with non-finite poses", m.non_finite_frames));
    }
    if m.unreported_chunks > 0 {
        return Err(format!("{} beam refreshes missed stored chunks", m.unreported_chunks));
    }
    if m.stale_watermarks > 0 {
        return Err(format!("{} beam refreshes left a stale watermark", m.stale_watermarks));
    }
    let rejected = world.renderer().stats().rejected_clock_values;
    if rejected > 0 {
        return Err(format!("{rejected} render clock values rejected"));
    }
    Ok(())
}

fn expect_angle(name: &str, actual: f64, expected: f64) -> Result<(), String> {
    if wrap_pi(actual - expected).abs() < ANGLE_EPSILON {
        Ok(())
    } else {
        Err(format!("{name} angle {actual:.4} != expected {expected:.4}"))
    }
}

fn frame_at(frames: &[FrameRecord], time: f64) -> Option<&FrameRecord> {
    frames.iter().find(|f| f.time_secs >= time)
}

/// NED velocity of `speed` m/s on a 60° heading (a slice center).
fn heading_velocity(speed: f64) -> [f64; 3] {
    [speed * FRAC_PI_3.cos(), speed * FRAC_PI_3.sin(), 0.0]
}

fn straight(velocity_ned: [f64; 3], duration: f64) -> FlightLeg {
    FlightLeg::Straight {
        velocity_ned,
        duration,
    }
}

fn pillar(north: f64, east: f64) -> Pillar {
    Pillar {
        north,
        east,
        radius: 1.0,
        height: 12.0,
    }
}

/// Settled horizontal angle for a noiseless, non-turning flight.
fn expected_horizontal(camera: &CameraConfig, velocity_ned: [f64; 3]) -> Option<f64> {
    let speed = SceneMapper::vector(&Vector3::from(velocity_ned));
    let destination = target_destination(&speed, &Vector3::zeros(), camera);
    SightAngleAnalyser::horizontal(camera.slices, camera.min_horizontal_trigger).analyze(destination.as_ref())
}

fn expected_vertical(camera: &CameraConfig, velocity_ned: [f64; 3]) -> Option<f64> {
    let speed = SceneMapper::vector(&Vector3::from(velocity_ned));
    let destination = target_destination(&speed, &Vector3::zeros(), camera);
    SightAngleAnalyser::vertical(camera.slices, camera.min_vertical_trigger, camera.vertical_damping)
        .analyze(destination.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn run(scenario: ScenarioId) -> ScenarioResult {
        let result = ScenarioRunner::new(42).with_duration(0.0).run(scenario);
        assert!(
            result.passed,
            "{} failed: {:?}",
            scenario,
            result.failure_reason
        );
        result
    }

    #[test]
    fn test_expected_angles() {
        let camera = CameraConfig::default();
        let h = expected_horizontal(&camera, heading_velocity(4.0));
        assert_relative_eq!(h.unwrap_or(f64::NAN), 2.0 * FRAC_PI_3, epsilon = 1e-9);

        // Slice 1 of the vertical plane, damped by half
        let v = expected_vertical(&camera, CLIMB_VELOCITY);
        assert_relative_eq!(v.unwrap_or(f64::NAN), FRAC_PI_3 / 2.0, epsilon = 1e-9);

        assert_eq!(expected_horizontal(&camera, [0.0, 0.0, 0.0]), None);
    }

    #[test]
    fn test_hover() {
        let result = run(ScenarioId::Hover);
        assert_eq!(result.metrics.world.transitions, 0);
        assert!(result.metrics.world.storage_commits > 0);
    }

    #[test]
    fn test_straight_line() {
        run(ScenarioId::StraightLine);
    }

    #[test]
    fn test_orbit() {
        run(ScenarioId::Orbit);
    }

    #[test]
    fn test_climb() {
        run(ScenarioId::Climb);
    }

    #[test]
    fn test_sensor_dropout() {
        run(ScenarioId::SensorDropout);
    }

    #[test]
    fn test_telemetry_stall() {
        let result = run(ScenarioId::TelemetryStall);
        assert!(result.final_time_secs >= 11.0 - 1e-6);
    }

    #[test]
    fn test_obstacle_approach() {
        let result = run(ScenarioId::ObstacleApproach);
        assert!(result.metrics.first_danger_clearance.is_some());
    }

    #[test]
    fn test_slow_consumer() {
        let result = run(ScenarioId::SlowConsumer);
        assert!(result.metrics.world.resyncs > 0);
    }

    #[test]
    fn test_slow_processor() {
        run(ScenarioId::SlowProcessor);
    }

    #[test]
    fn test_scenarios_are_deterministic() {
        let runner = ScenarioRunner::new(7).with_duration(0.0);
        let (a, frames_a) = runner.run_recorded(ScenarioId::SensorDropout);
        let (b, frames_b) = runner.run_recorded(ScenarioId::SensorDropout);
        assert_eq!(a.metrics.world, b.metrics.world);
        assert_eq!(frames_a.len(), frames_b.len());
        assert!(frames_a
            .iter()
            .zip(&frames_b)
            .all(|(x, y)| x.camera == y.camera && x.horizontal_angle == y.horizontal_angle));
    }

    #[test]
    fn test_invalid_engine_fails_cleanly() {
        let mut engine = OccupancyConfig::default();
        engine.beam.max_segments = 1;
        let result = ScenarioRunner::new(1).with_engine(engine).run(ScenarioId::Hover);
        assert!(!result.passed);
        assert_eq!(result.total_ticks, 0);
        assert!(result.failure_reason.is_some());
    }
}
