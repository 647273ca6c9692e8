//! Flight scenarios exercised by the simulator.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// Drone holds position; camera must stay neutral
    Hover,

    /// Constant heading; camera settles on one slice without flapping
    StraightLine,

    /// Constant turn; camera steps through slices
    Orbit,

    /// Steep climb; vertical angle engages
    Climb,

    /// Heavy telemetry loss while flying
    SensorDropout,

    /// Telemetry stops, then resumes
    TelemetryStall,

    /// Flight towards a pillar; beam must warn before contact
    ObstacleApproach,

    /// Renderer reads the change log less often than it is evicted
    SlowConsumer,

    /// Grid producer slower than the depth frame rate
    SlowProcessor,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Hover,
            ScenarioId::StraightLine,
            ScenarioId::Orbit,
            ScenarioId::Climb,
            ScenarioId::SensorDropout,
            ScenarioId::TelemetryStall,
            ScenarioId::ObstacleApproach,
            ScenarioId::SlowConsumer,
            ScenarioId::SlowProcessor,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Hover => "hover",
            ScenarioId::StraightLine => "straight_line",
            ScenarioId::Orbit => "orbit",
            ScenarioId::Climb => "climb",
            ScenarioId::SensorDropout => "sensor_dropout",
            ScenarioId::TelemetryStall => "telemetry_stall",
            ScenarioId::ObstacleApproach => "obstacle_approach",
            ScenarioId::SlowConsumer => "slow_consumer",
            ScenarioId::SlowProcessor => "slow_processor",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Hover => "Hovering drone, camera stays behind it at the neutral angle",
            ScenarioId::StraightLine => "4 m/s on a 60° heading, camera settles on the heading slice",
            ScenarioId::Orbit => "3 m/s turn at 0.5 rad/s, camera steps through slices",
            ScenarioId::Climb => "2 m/s climb at 60° above the horizon, vertical angle engages",
            ScenarioId::SensorDropout => "60% telemetry loss, camera keeps the heading slice",
            ScenarioId::TelemetryStall => "4 s telemetry stall, estimators drain, camera falls back then recovers",
            ScenarioId::ObstacleApproach => "Flight towards a pillar, beam reports danger before contact",
            ScenarioId::SlowConsumer => "2 Hz beam against a 3-deep change log, renderer resyncs",
            ScenarioId::SlowProcessor => "Grid producer busy for 150 ms per frame, drop trigger adapts",
        }
    }

    /// Shortest run that exercises the scenario (seconds).
    pub fn min_duration(&self) -> f64 {
        match self {
            ScenarioId::TelemetryStall => 11.0,
            ScenarioId::Orbit => 8.0,
            ScenarioId::ObstacleApproach => 5.0,
            _ => 4.0,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "hover" => Ok(ScenarioId::Hover),
            "straight_line" | "straight" => Ok(ScenarioId::StraightLine),
            "orbit" => Ok(ScenarioId::Orbit),
            "climb" => Ok(ScenarioId::Climb),
            "sensor_dropout" | "dropout" => Ok(ScenarioId::SensorDropout),
            "telemetry_stall" | "stall" => Ok(ScenarioId::TelemetryStall),
            "obstacle_approach" | "obstacle" => Ok(ScenarioId::ObstacleApproach),
            "slow_consumer" => Ok(ScenarioId::SlowConsumer),
            "slow_processor" => Ok(ScenarioId::SlowProcessor),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for scenario in ScenarioId::all() {
            assert_eq!(scenario.name().parse::<ScenarioId>(), Ok(scenario));
        }
    }

    #[test]
    fn test_aliases_and_unknown() {
        assert_eq!("Telemetry-Stall".parse::<ScenarioId>(), Ok(ScenarioId::TelemetryStall));
        assert_eq!("obstacle".parse::<ScenarioId>(), Ok(ScenarioId::ObstacleApproach));
        assert!("split_brain".parse::<ScenarioId>().is_err());
    }
}
