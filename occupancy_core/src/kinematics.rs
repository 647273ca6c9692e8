//! The "KINEMATICS" Engine - Sliding-Window Speed and Rotation Estimators
//!
//! Telemetry arrives at an irregular rate on producer threads while the
//! render thread reads one smoothed vector per frame. Each estimator keeps a
//! short window of samples and decays it when the producer stalls, so the
//! average never stays frozen on data that is no longer true.

use crate::math::wrap_pi;
use nalgebra::Vector3;
use occupancy_env::OccupancyContext;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Bounded, time-aware window of vector samples.
///
/// Not synchronized; the estimators wrap it in a mutex.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    /// Samples, oldest first
    samples: VecDeque<Vector3<f64>>,

    /// Maximum number of samples (>= 1)
    average_number: usize,

    /// Arrival time of the last accepted sample
    last_sample_time: Option<Duration>,

    /// Nominal producer period
    frame_period: Duration,
}

impl SampleWindow {
    /// Creates an empty window. A size of 0 is coerced to 1.
    pub fn new(average_number: usize, frame_period: Duration) -> Self {
        let average_number = average_number.max(1);
        Self {
            samples: VecDeque::with_capacity(average_number + 1),
            average_number,
            last_sample_time: None,
            frame_period,
        }
    }

    /// Appends a sample received at `now`, dropping the oldest when full.
    ///
    /// Non-finite samples are ignored.
    pub fn push(&mut self, sample: Vector3<f64>, now: Duration) {
        if !sample.iter().all(|c| c.is_finite()) {
            return;
        }
        self.samples.push_back(sample);
        if self.samples.len() > self.average_number {
            self.samples.pop_front();
        }
        self.last_sample_time = Some(now);
    }

    /// Mean of the retained samples as seen at `now`, or zero if empty.
    ///
    /// If nothing was accepted for more than two frame periods, the oldest
    /// sample is discarded first. Every stale read discards one more, so a
    /// stalled producer drains the window instead of freezing it.
    pub fn average(&mut self, now: Duration) -> Vector3<f64> {
        if let Some(last) = self.last_sample_time {
            if now.saturating_sub(last) > self.frame_period * 2 {
                self.samples.pop_front();
            }
        }
        if self.samples.is_empty() {
            return Vector3::zeros();
        }
        let sum = self
            .samples
            .iter()
            .fold(Vector3::zeros(), |acc, s| acc + s);
        sum / self.samples.len() as f64
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns true if no sample is retained.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Maximum number of samples.
    pub fn average_number(&self) -> usize {
        self.average_number
    }

    /// Drops every sample.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.last_sample_time = None;
    }
}

/// Thread-safe estimator over a [`SampleWindow`].
///
/// Writes and reads go through one mutex; the critical section is a few
/// vector operations, so producers are never blocked for long.
pub struct KinematicEstimator<Ctx: OccupancyContext> {
    context: Arc<Ctx>,
    window: Mutex<SampleWindow>,
}

impl<Ctx: OccupancyContext> KinematicEstimator<Ctx> {
    /// Creates an estimator timing its samples with `context`.
    pub fn new(context: Arc<Ctx>, average_number: usize, frame_period: Duration) -> Self {
        Self {
            context,
            window: Mutex::new(SampleWindow::new(average_number, frame_period)),
        }
    }

    /// Records an instantaneous vector at the current time.
    pub fn set_sample(&self, sample: Vector3<f64>) {
        let now = self.context.now();
        self.lock().push(sample, now);
    }

    /// Smoothed vector (zero if no fresh sample is retained).
    pub fn average(&self) -> Vector3<f64> {
        let now = self.context.now();
        self.lock().average(now)
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no sample is retained.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops every sample.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> MutexGuard<'_, SampleWindow> {
        // The window is always left consistent between statements
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Smoothed linear velocity of the target.
pub struct Speedometer<Ctx: OccupancyContext> {
    estimator: KinematicEstimator<Ctx>,
}

impl<Ctx: OccupancyContext> Speedometer<Ctx> {
    pub fn new(context: Arc<Ctx>, average_number: usize, frame_period: Duration) -> Self {
        Self {
            estimator: KinematicEstimator::new(context, average_number, frame_period),
        }
    }

    /// Records a velocity sample.
    pub fn set_sample(&self, speed: Vector3<f64>) {
        self.estimator.set_sample(speed);
    }

    /// Averaged velocity.
    pub fn average(&self) -> Vector3<f64> {
        self.estimator.average()
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.estimator.len()
    }

    /// Returns true if no sample is retained.
    pub fn is_empty(&self) -> bool {
        self.estimator.is_empty()
    }
}

/// Orientation reading used to derive a rotation rate.
#[derive(Debug, Clone, Copy)]
struct OrientationSample {
    angles: Vector3<f64>,
    time: Duration,
}

/// Smoothed angular velocity of the target.
///
/// Accepts either direct angular-velocity samples or successive
/// orientations (Euler angles), from which a per-second rate is derived.
pub struct Rotatiometer<Ctx: OccupancyContext> {
    estimator: KinematicEstimator<Ctx>,

    /// Last orientation seen by `set_orientation`
    previous: Mutex<Option<OrientationSample>>,

    /// Axis whose angle wraps around (1 = yaw about Y)
    wrap_axis: usize,
}

impl<Ctx: OccupancyContext> Rotatiometer<Ctx> {
    /// Creates a rotation estimator; the Y (yaw) axis wraps around.
    pub fn new(context: Arc<Ctx>, average_number: usize, frame_period: Duration) -> Self {
        Self {
            estimator: KinematicEstimator::new(context, average_number, frame_period),
            previous: Mutex::new(None),
            wrap_axis: 1,
        }
    }

    /// Records an angular velocity sample (rad/s).
    pub fn set_sample(&self, rotation_speed: Vector3<f64>) {
        self.estimator.set_sample(rotation_speed);
    }

    /// Records an orientation and derives the rate from the previous one.
    ///
    /// The wrap-around axis delta is normalized into (-PI, PI] first. Two
    /// orientations at the same instant yield a zero rate instead of a
    /// division by zero. The first orientation only primes the estimator.
    pub fn set_orientation(&self, angles: Vector3<f64>) {
        if !angles.iter().all(|c| c.is_finite()) {
            return;
        }
        let now = self.estimator.context.now();
        let mut previous = self.previous.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(prev) = previous.replace(OrientationSample { angles, time: now }) {
            let mut delta = angles - prev.angles;
            delta[self.wrap_axis] = wrap_pi(delta[self.wrap_axis]);

            let elapsed = now.saturating_sub(prev.time).as_secs_f64();
            let rate = if elapsed > 0.0 {
                delta / elapsed
            } else {
                Vector3::zeros()
            };
            self.estimator.set_sample(rate);
        }
    }

    /// Averaged angular velocity.
    pub fn average(&self) -> Vector3<f64> {
        self.estimator.average()
    }

    /// Number of retained samples.
    pub fn len(&self) -> usize {
        self.estimator.len()
    }

    /// Returns true if no sample is retained.
    pub fn is_empty(&self) -> bool {
        self.estimator.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_clock {
    use async_trait::async_trait;
    use occupancy_env::OccupancyContext;
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    /// Manually advanced clock for unit tests.
    #[derive(Default)]
    pub struct ManualClock {
        now: Mutex<Duration>,
    }

    impl ManualClock {
        pub fn advance(&self, d: Duration) {
            *self.now.lock().unwrap() += d;
        }
    }

    #[async_trait]
    impl OccupancyContext for ManualClock {
        fn now(&self) -> Duration {
            *self.now.lock().unwrap()
        }

        fn system_time(&self) -> SystemTime {
            UNIX_EPOCH + self.now()
        }

        async fn sleep(&self, duration: Duration) {
            self.advance(duration);
        }

        fn spawn<F>(&self, _name: &str, _future: F)
        where
            F: std::future::Future<Output = ()> + Send + 'static,
        {
        }

        fn seed(&self) -> u64 {
            0
        }
    }
}
