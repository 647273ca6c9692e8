//! Following angle state machine.
//!
//! Wraps a [`SightAngleAnalyser`] with a timed override against sensor
//! dropouts and an eased transition between successive look angles.
//!
//! ```text
//!            new angle differs from destination
//!   Steady ─────────────────────────────────────▶ Transitioning
//!     ▲                                                 │
//!     └──────────── elapsed > transition_duration ──────┘
//! ```
//!
//! Time is the render clock in seconds, supplied by the caller.

use crate::math::{smoothstep, wrap_pi, wrap_two_pi};
use crate::sight_angle::{CameraPlane, SightAngleAnalyser};
use nalgebra::Vector3;
use tracing::debug;

/// Angles closer than this are the same look angle.
const ANGLE_EPSILON: f64 = 1e-9;

/// A running transition between two angles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngleTransition {
    pub from: f64,
    pub to: f64,
    pub start: f64,
}

/// Last input seen by `update`, replayed by `smart_update_if_running`.
#[derive(Debug, Clone, Copy)]
struct LastInput {
    direction: Option<Vector3<f64>>,
    is_stationary: bool,
}

/// Per-plane angle state machine with hysteresis and easing.
#[derive(Debug, Clone)]
pub struct FollowingAngleAnalyser {
    analyser: SightAngleAnalyser,
    transition_duration: f64,
    override_delay: f64,
    neutral_angle: f64,

    /// Target of the last completed transition (None = never moved)
    latest_angle: Option<f64>,

    /// Angle held when no target is known
    stored_angle_for_nil_motion: f64,

    transition: Option<AngleTransition>,

    /// Start of the current run of missing angles
    nil_since: Option<f64>,

    last_input: Option<LastInput>,
    current_angle: f64,
}

impl FollowingAngleAnalyser {
    /// Creates a machine resting on `neutral_angle`.
    ///
    /// A non-positive transition duration is coerced to a single instant.
    pub fn new(
        analyser: SightAngleAnalyser,
        transition_duration: f64,
        override_delay: f64,
        neutral_angle: f64,
    ) -> Self {
        let mut machine = Self {
            analyser,
            transition_duration: transition_duration.max(f64::EPSILON),
            override_delay: override_delay.max(0.0),
            neutral_angle: 0.0,
            latest_angle: None,
            stored_angle_for_nil_motion: 0.0,
            transition: None,
            nil_since: None,
            last_input: None,
            current_angle: 0.0,
        };
        machine.neutral_angle = machine.normalize(neutral_angle);
        machine.stored_angle_for_nil_motion = machine.neutral_angle;
        machine.current_angle = machine.neutral_angle;
        machine
    }

    pub fn plane(&self) -> CameraPlane {
        self.analyser.plane()
    }

    pub fn neutral_angle(&self) -> f64 {
        self.neutral_angle
    }

    /// Angle computed by the last update.
    pub fn current_angle(&self) -> f64 {
        self.current_angle
    }

    pub fn is_transitioning(&self) -> bool {
        self.transition.is_some()
    }

    pub fn transition(&self) -> Option<AngleTransition> {
        self.transition
    }

    /// Feeds a new look-ahead destination.
    pub fn update(&mut self, direction: Option<&Vector3<f64>>, is_stationary: bool, now: f64) {
        if !now.is_finite() {
            return;
        }
        self.last_input = Some(LastInput {
            direction: direction.copied(),
            is_stationary,
        });

        let target = if is_stationary {
            self.nil_since = None;
            Some(self.neutral_angle)
        } else {
            match self.analyser.analyze(direction) {
                Some(angle) => {
                    self.nil_since = None;
                    Some(self.normalize(angle))
                }
                None => {
                    let since = *self.nil_since.get_or_insert(now);
                    // A short dropout holds the current angle
                    (now - since > self.override_delay).then_some(self.neutral_angle)
                }
            }
        };

        self.finish_if_elapsed(now);

        if let Some(target) = target {
            let destination = self
                .transition
                .map(|t| t.to)
                .unwrap_or_else(|| self.steady_angle());
            if !same_angle(target, destination) {
                let from = self.angle_at(now);
                debug!(
                    plane = ?self.plane(),
                    from,
                    to = target,
                    "Starting camera angle transition"
                );
                self.transition = Some(AngleTransition {
                    from,
                    to: target,
                    start: now,
                });
            }
        }

        self.current_angle = self.angle_at(now);
    }

    /// Replays the last input while a transition runs, so the eased angle
    /// keeps moving between destination refreshes.
    pub fn smart_update_if_running(&mut self, now: f64) {
        if self.transition.is_none() {
            return;
        }
        if let Some(input) = self.last_input {
            self.update(input.direction.as_ref(), input.is_stationary, now);
        }
    }

    /// Angle at `now` without changing state.
    pub fn angle_at(&self, now: f64) -> f64 {
        match self.transition {
            Some(t) => {
                let progress = ((now - t.start) / self.transition_duration).clamp(0.0, 1.0);
                let eased = smoothstep(progress);
                self.normalize(t.from + wrap_pi(t.to - t.from) * eased)
            }
            None => self.steady_angle(),
        }
    }

    fn steady_angle(&self) -> f64 {
        self.latest_angle
            .unwrap_or(self.stored_angle_for_nil_motion)
    }

    fn finish_if_elapsed(&mut self, now: f64) {
        if let Some(t) = self.transition {
            if now - t.start > self.transition_duration {
                self.latest_angle = Some(t.to);
                self.stored_angle_for_nil_motion = t.to;
                self.transition = None;
            }
        }
    }

    fn normalize(&self, angle: f64) -> f64 {
        match self.plane() {
            CameraPlane::Horizontal => wrap_two_pi(angle),
            CameraPlane::Vertical => wrap_pi(angle),
        }
    }
}

fn same_angle(a: f64, b: f64) -> bool {
    wrap_pi(a - b).abs() < ANGLE_EPSILON
}
