//! Occupancy Simulator CLI
//!
//! Fly deterministic scenarios against the occupancy engine.

use clap::Parser;
use occupancy_core::OccupancyConfig;
use occupancy_sim::scenarios::ScenarioId;
use occupancy_sim::{live_duration, run_live, LiveConfig, ScenarioResult, ScenarioRunner, SimError, SimExport};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Occupancy deterministic simulation CLI
#[derive(Parser, Debug)]
#[command(name = "occupancy-sim")]
#[command(about = "Run deterministic flight scenarios against the occupancy engine", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Scenario to run (hover, straight_line, orbit, climb, sensor_dropout,
    /// telemetry_stall, obstacle_approach, slow_consumer, slow_processor, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Simulation duration in seconds (scenarios may need longer)
    #[arg(short, long, default_value = "10")]
    duration: f64,

    /// Engine configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export rendered frames of a single scenario to a JSON file
    #[arg(long)]
    export: Option<PathBuf>,

    /// Export every N-th frame
    #[arg(long, default_value = "6")]
    export_interval: usize,

    /// Fly in real time on the tokio runtime instead of the virtual clock
    #[arg(long)]
    live: bool,

    /// Telemetry loss probability in live mode
    #[arg(long, default_value = "0")]
    dropout: f64,
}

fn main() {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let level = if args.verbose { "debug" } else { "info" };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }

    if let Err(e) = run(args) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), SimError> {
    let engine = match &args.config {
        Some(path) => {
            info!("Loading engine configuration from {}", path.display());
            OccupancyConfig::from_file(path)?
        }
        None => OccupancyConfig::default(),
    };

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(1, |d| d.as_nanos() as u64)
    } else {
        args.seed
    };

    if args.live {
        return run_live_mode(&args, base_seed, engine);
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        vec![args
            .scenario
            .parse()
            .map_err(|_| SimError::UnknownScenario(args.scenario.clone()))?]
    };

    if !args.json {
        info!("Occupancy Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            return Err(SimError::InvalidSetting(
                "--export only supports a single scenario, not 'all'".into(),
            ));
        }
        let scenario = scenarios[0];
        let runner = ScenarioRunner::new(base_seed)
            .with_duration(args.duration)
            .with_engine(engine);
        let (result, frames) = runner.run_recorded(scenario);
        let export = SimExport::from_run(&result, &runner.pillars(scenario), frames, args.export_interval);
        export.write_to_file(export_path)?;
        info!("Exported {} frames to {}", export.frames.len(), export_path.display());

        report(&result, args.json);
        if !result.passed {
            std::process::exit(1);
        }
        return Ok(());
    }

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed)
            .with_duration(args.duration)
            .with_engine(engine.clone());

        for scenario in &scenarios {
            let result = runner.run(*scenario);
            if !args.json {
                report(&result, false);
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let failed: Vec<&ScenarioResult> = all_results.iter().filter(|r| !r.passed).collect();

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": total - failed.len(),
            "failed": failed.len(),
            "results": all_results,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed.is_empty() {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed.len(), total);
            for result in &failed {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario,
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    // Exit with proper code for CI
    if !failed.is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_live_mode(args: &Args, seed: u64, engine: OccupancyConfig) -> Result<(), SimError> {
    let config = LiveConfig {
        seed,
        duration: live_duration(args.duration)?,
        dropout: args.dropout,
        engine,
        ..Default::default()
    };
    let runtime = tokio::runtime::Runtime::new()?;
    let summary = runtime.block_on(run_live(config))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!(
            "Live run: {} frames, {} samples, {} beam updates ({} in danger)",
            summary.frames, summary.samples_received, summary.beam_updates, summary.danger_frames
        );
    }
    Ok(())
}

fn report(result: &ScenarioResult, json: bool) {
    if json {
        return;
    }
    if result.passed {
        info!("✓ {} (seed={}) PASSED", result.scenario, result.seed);
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario,
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}
