//! Ground truth flight oracle.
//!
//! The oracle owns the true state of the simulated drone and its obstacle
//! field:
//! - Flight plan made of legs (hover, straight, orbit, climb)
//! - Pillar obstacles standing on the ground
//! - Noisy telemetry samples and depth scans generated from the truth

use nalgebra::{Point3, Vector3};
use occupancy_core::{SceneMapper, VoxelKey};
use occupancy_env::{FlyingState, TelemetrySample};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// One segment of the flight plan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FlightLeg {
    /// Hold position
    Hover { duration: f64 },

    /// Constant NED velocity (m/s)
    Straight { velocity_ned: [f64; 3], duration: f64 },

    /// Constant-speed turn; positive `turn_rate` turns clockwise seen from above
    Orbit { speed: f64, turn_rate: f64, duration: f64 },

    /// Vertical flight; positive `rate` climbs
    Climb { rate: f64, duration: f64 },
}

impl FlightLeg {
    pub fn duration(&self) -> f64 {
        match *self {
            FlightLeg::Hover { duration }
            | FlightLeg::Straight { duration, .. }
            | FlightLeg::Orbit { duration, .. }
            | FlightLeg::Climb { duration, .. } => duration,
        }
    }
}

/// Vertical cylinder rising from the ground (down = 0).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pillar {
    pub north: f64,
    pub east: f64,
    pub radius: f64,
    pub height: f64,
}

impl Pillar {
    pub fn contains(&self, ned: &Vector3<f64>) -> bool {
        let dn = ned.x - self.north;
        let de = ned.y - self.east;
        dn * dn + de * de <= self.radius * self.radius && ned.z <= 0.0 && ned.z >= -self.height
    }

    /// Horizontal distance from the pillar surface.
    pub fn clearance(&self, ned: &Vector3<f64>) -> f64 {
        let dn = ned.x - self.north;
        let de = ned.y - self.east;
        ((dn * dn + de * de).sqrt() - self.radius).max(0.0)
    }
}

/// True drone state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroneTruth {
    pub position_ned: Vector3<f64>,
    pub velocity_ned: Vector3<f64>,
    /// Heading from north, clockwise (rad)
    pub yaw: f64,
    pub yaw_rate: f64,
    pub flying_state: FlyingState,
}

/// Noise applied to generated readings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorNoise {
    /// Position noise standard deviation (meters)
    pub position_std: f64,
    /// Velocity noise standard deviation (m/s)
    pub velocity_std: f64,
    /// Angular velocity noise standard deviation (rad/s)
    pub rate_std: f64,
    /// Probability that an occupied voxel is missing from a scan
    pub scan_miss: f64,
}

impl Default for SensorNoise {
    fn default() -> Self {
        Self {
            position_std: 0.05,
            velocity_std: 0.05,
            rate_std: 0.01,
            scan_miss: 0.0,
        }
    }
}

/// The oracle: ground truth plus reading generation.
pub struct FlightOracle {
    /// RNG for sensor noise
    physics_rng: ChaCha8Rng,

    legs: Vec<FlightLeg>,
    leg_index: usize,
    leg_elapsed: f64,

    drone: DroneTruth,
    pillars: Vec<Pillar>,

    /// Simulation time (seconds)
    current_time: f64,

    noise: SensorNoise,

    /// Depth sensor range (meters)
    sensor_range: f64,
}

impl FlightOracle {
    /// Creates an oracle with the drone hovering at `start_ned`.
    pub fn new(physics_seed: u64, start_ned: Vector3<f64>) -> Self {
        Self {
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            legs: Vec::new(),
            leg_index: 0,
            leg_elapsed: 0.0,
            drone: DroneTruth {
                position_ned: start_ned,
                velocity_ned: Vector3::zeros(),
                yaw: 0.0,
                yaw_rate: 0.0,
                flying_state: FlyingState::Hovering,
            },
            pillars: Vec::new(),
            current_time: 0.0,
            noise: SensorNoise::default(),
            sensor_range: 12.0,
        }
    }

    pub fn with_noise(mut self, noise: SensorNoise) -> Self {
        self.noise = noise;
        self
    }

    pub fn with_sensor_range(mut self, range: f64) -> Self {
        self.sensor_range = range;
        self
    }

    /// Appends a leg to the flight plan.
    pub fn push_leg(&mut self, leg: FlightLeg) {
        self.legs.push(leg);
    }

    pub fn add_pillar(&mut self, pillar: Pillar) {
        self.pillars.push(pillar);
    }

    pub fn pillars(&self) -> &[Pillar] {
        &self.pillars
    }

    pub fn drone(&self) -> &DroneTruth {
        &self.drone
    }

    pub fn time(&self) -> f64 {
        self.current_time
    }

    /// The leg being flown, `None` once the plan is exhausted.
    pub fn current_leg(&self) -> Option<&FlightLeg> {
        self.legs.get(self.leg_index)
    }

    /// Smallest horizontal clearance to any pillar.
    pub fn nearest_clearance(&self) -> Option<f64> {
        self.pillars
            .iter()
            .map(|p| p.clearance(&self.drone.position_ned))
            .min_by(|a, b| a.total_cmp(b))
    }

    /// Advances the flight by `dt` seconds.
    pub fn step(&mut self, dt: f64) {
        let drone = &mut self.drone;
        match self.legs.get(self.leg_index).copied() {
            None | Some(FlightLeg::Hover { .. }) => {
                drone.velocity_ned = Vector3::zeros();
                drone.yaw_rate = 0.0;
                drone.flying_state = FlyingState::Hovering;
            }
            Some(FlightLeg::Straight { velocity_ned, .. }) => {
                drone.velocity_ned = Vector3::from(velocity_ned);
                drone.yaw_rate = 0.0;
                if drone.velocity_ned.xy().norm() > 0.1 {
                    drone.yaw = drone.velocity_ned.y.atan2(drone.velocity_ned.x);
                }
                drone.flying_state = FlyingState::Flying;
            }
            Some(FlightLeg::Orbit { speed, turn_rate, .. }) => {
                drone.yaw += turn_rate * dt;
                drone.yaw_rate = turn_rate;
                drone.velocity_ned =
                    Vector3::new(speed * drone.yaw.cos(), speed * drone.yaw.sin(), 0.0);
                drone.flying_state = FlyingState::Flying;
            }
            Some(FlightLeg::Climb { rate, .. }) => {
                drone.velocity_ned = Vector3::new(0.0, 0.0, -rate);
                drone.yaw_rate = 0.0;
                drone.flying_state = FlyingState::Flying;
            }
        }
        drone.position_ned += drone.velocity_ned * dt;
        self.current_time += dt;

        if let Some(leg) = self.legs.get(self.leg_index) {
            self.leg_elapsed += dt;
            if self.leg_elapsed >= leg.duration() {
                self.leg_index += 1;
                self.leg_elapsed = 0.0;
            }
        }
    }

    /// Noisy telemetry sample of the current state.
    pub fn telemetry_sample(&mut self, timestamp_ms: u64) -> TelemetrySample {
        let position = self.drone.position_ned + self.noise_vector(self.noise.position_std);
        let velocity = self.drone.velocity_ned + self.noise_vector(self.noise.velocity_std);
        let rates = Vector3::new(0.0, 0.0, self.drone.yaw_rate)
            + self.noise_vector(self.noise.rate_std);
        let half = self.drone.yaw / 2.0;

        TelemetrySample {
            timestamp_ms,
            position_ned: position.into(),
            velocity_ned: velocity.into(),
            angular_velocity: rates.into(),
            attitude: [half.cos(), 0.0, 0.0, half.sin()],
            flying_state: self.drone.flying_state,
        }
    }

    /// Occupied voxels around the drone, in sensor grid coordinates.
    ///
    /// The sensor grid is centered on the drone; the storage shifts the
    /// points by the drone displacement since the first frame.
    pub fn depth_scan(&mut self, mapper: &SceneMapper, voxel_size: f64) -> Vec<VoxelKey> {
        let drone = self.drone.position_ned;
        let range = self.sensor_range;
        let mut points = Vec::new();

        for pillar in &self.pillars {
            if pillar.clearance(&drone) > range {
                continue;
            }
            let n_range = cell_range(pillar.north - pillar.radius, pillar.north + pillar.radius, voxel_size);
            let e_range = cell_range(pillar.east - pillar.radius, pillar.east + pillar.radius, voxel_size);
            let d_range = cell_range(
                (-pillar.height).max(drone.z - range),
                0.0_f64.min(drone.z + range),
                voxel_size,
            );

            for n in n_range.clone() {
                for e in e_range.clone() {
                    for d in d_range.clone() {
                        let cell = Vector3::new(
                            (f64::from(n) + 0.5) * voxel_size,
                            (f64::from(e) + 0.5) * voxel_size,
                            (f64::from(d) + 0.5) * voxel_size,
                        );
                        if !pillar.contains(&cell) || (cell - drone).norm() > range {
                            continue;
                        }
                        if self.noise.scan_miss > 0.0 && self.physics_rng.gen::<f64>() < self.noise.scan_miss {
                            continue;
                        }
                        let scene = mapper.position(&cell, Some(&drone));
                        points.push(Point3::new(
                            scene.x.floor() as i32,
                            scene.y.floor() as i32,
                            scene.z.floor() as i32,
                        ));
                    }
                }
            }
        }
        points
    }

    fn noise_vector(&mut self, std: f64) -> Vector3<f64> {
        if std <= 0.0 {
            return Vector3::zeros();
        }
        match Normal::new(0.0, std) {
            Ok(normal) => Vector3::new(
                normal.sample(&mut self.physics_rng),
                normal.sample(&mut self.physics_rng),
                normal.sample(&mut self.physics_rng),
            ),
            Err(_) => Vector3::zeros(),
        }
    }
}

fn cell_range(from: f64, to: f64, voxel_size: f64) -> std::ops::RangeInclusive<i32> {
    (from / voxel_size).floor() as i32..=(to / voxel_size).floor() as i32
}
