//! FleetWatch Simulator CLI
//!
//! Run seeded route and reconciler scenarios on a virtual clock.

use clap::Parser;
use fleetwatch_core::{ReconcilerConfig, RouteConfig};
use fleetwatch_sim::scenarios::ScenarioId;
use fleetwatch_sim::{ScenarioResult, ScenarioRunner};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "fleetwatch-sim")]
#[command(about = "Run deterministic fleet telemetry scenarios", long_about = None)]
struct Args {
    /// Base seed (0 = derive from the system clock)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Vehicles per scenario
    #[arg(short, long, default_value = "6")]
    vehicles: usize,

    /// Scenario to run (stop_and_go, sentinel_noise, poll_failover, channel_drop, overlapping_ticks, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Consecutive seeds to run, starting at --seed
    #[arg(long, default_value = "1")]
    seeds: u64,

    /// Debug logging
    #[arg(long)]
    verbose: bool,

    /// Print a JSON summary instead of log lines
    #[arg(long)]
    json: bool,

    /// List the scenarios and exit
    #[arg(long)]
    list: bool,

    /// Overlay FLEETWATCH_* variables on the default configs (checks are tuned to the defaults)
    #[arg(long)]
    env_config: bool,
}

fn kind(scenario: ScenarioId) -> &'static str {
    if scenario.is_live() {
        "live"
    } else {
        "route"
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn main() {
    let args = Args::parse();

    if args.list {
        for scenario in ScenarioId::all() {
            println!("{:<18} {:<6} {}", scenario.name(), kind(scenario), scenario.description());
        }
        return;
    }

    if !args.json {
        init_logging(args.verbose);
        info!("FleetWatch Simulator v{}", env!("CARGO_PKG_VERSION"));
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        match args.scenario.parse() {
            Ok(scenario) => vec![scenario],
            Err(e) => {
                eprintln!("Error: {}", e);
                let names: Vec<&str> = ScenarioId::all().iter().map(|s| s.name()).collect();
                eprintln!("Available scenarios: {}, all", names.join(", "));
                std::process::exit(1);
            }
        }
    };

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(42)
    } else {
        args.seed
    };

    let mut all_results: Vec<ScenarioResult> = Vec::new();

    for seed_offset in 0..args.seeds.max(1) {
        let seed = base_seed.wrapping_add(seed_offset);
        let mut runner = ScenarioRunner::new(seed, args.vehicles);
        if args.env_config {
            runner = runner
                .with_reconciler_config(ReconcilerConfig::from_env())
                .with_route_config(RouteConfig::from_env());
        }

        for scenario in &scenarios {
            if !args.json {
                info!("{} [{}]: {}", scenario.name(), kind(*scenario), scenario.description());
            }
            let result = runner.run_blocking(*scenario);

            if !args.json {
                if result.passed {
                    info!("✓ {} (seed={}) PASSED in {:.0}s virtual", scenario.name(), seed, result.final_time_secs);
                } else {
                    error!(
                        "✗ {} (seed={}) FAILED: {}",
                        scenario.name(),
                        seed,
                        result.failure_reason.as_deref().unwrap_or("unknown")
                    );
                }
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
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "kind": kind(r.scenario),
                    "seed": r.seed,
                    "passed": r.passed,
                    "vehicles": r.vehicles,
                    "time_secs": r.final_time_secs,
                    "failure_reason": r.failure_reason,
                    "metrics": r.metrics,
                })
            }).collect::<Vec<_>>(),
        });
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("Failed to encode summary: {}", e),
        }
    } else if failed.is_empty() {
        info!("All {} scenario runs passed", total);
    } else {
        error!("{}/{} scenario runs failed", failed.len(), total);
        for result in &failed {
            error!(
                "  - {} seed={}: {}",
                result.scenario.name(),
                result.seed,
                result.failure_reason.as_deref().unwrap_or("unknown")
            );
        }
    }

    if !failed.is_empty() {
        std::process::exit(1);
    }
}
