#![forbid(unsafe_code)]

use std::env;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use pces_sim::{CampaignConfig, SimulationResult, run_campaign, run_single_seed};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "pces-sim: seeded crash and replay runs of the pces intake pipeline",
    long_about = None
)]
struct Cli {
    /// Emit JSON output instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,

    /// Events per generated graph.
    #[arg(long, global = true, default_value_t = 200)]
    events: usize,

    /// Crash probability per seed (percent).
    #[arg(long, global = true, default_value_t = 75)]
    crash_percent: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one seed and print what happened.
    Run {
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Run a range of seeds and report failures.
    Campaign {
        /// First seed (inclusive).
        #[arg(long, default_value_t = 0)]
        from: u64,
        /// Last seed (exclusive).
        #[arg(long, default_value_t = 100)]
        to: u64,
    },
}

impl Cli {
    fn campaign_config(&self, seeds: std::ops::Range<u64>) -> CampaignConfig {
        CampaignConfig {
            seed_range: seeds,
            events: self.events,
            crash_percent: self.crash_percent,
            ..CampaignConfig::default()
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("PCES_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if env::var("DEBUG").is_ok() {
            "pces=debug,info"
        } else {
            "pces=info,warn"
        })
    });

    let format = env::var("PCES_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn print_run(result: &SimulationResult, json: bool) -> Result<()> {
    let violations: Vec<String> = result
        .oracle
        .violations
        .iter()
        .map(ToString::to_string)
        .collect();
    if json {
        let value = serde_json::json!({
            "seed": result.seed,
            "events": result.events_generated,
            "arrivals": result.arrivals,
            "duplicate_arrivals": result.duplicate_arrivals,
            "released": result.released,
            "ancient_on_arrival": result.ancient_on_arrival,
            "crash": result.crash,
            "final_window": result.final_window,
            "logged": result.logged,
            "passed": result.oracle.passed,
            "violations": violations,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!(
        "seed {}: events={} arrivals={} (dup {}) released={} ancient={} logged={}",
        result.seed,
        result.events_generated,
        result.arrivals,
        result.duplicate_arrivals,
        result.released,
        result.ancient_on_arrival,
        result.logged
    );
    match result.crash {
        Some(crash) => println!(
            "  crashed after {} arrivals, torn tail: {}, repaired files: {}, replayed: {}",
            crash.after_arrivals, crash.torn_tail, crash.repaired_files, crash.replayed
        ),
        None => println!("  no crash"),
    }
    println!(
        "  final window: ancient <= {}, expired <= {}",
        result.final_window.ancient_threshold(),
        result.final_window.expired_threshold()
    );
    if result.oracle.passed {
        println!("  PASS");
    } else {
        for violation in &violations {
            println!("  {violation}");
        }
    }
    Ok(())
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { seed } => {
            let config = cli.campaign_config(seed..seed + 1);
            config.validate()?;
            let result = run_single_seed(seed, &config)?;
            print_run(&result, cli.json)?;
            Ok(if result.oracle.passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Commands::Campaign { from, to } => {
            let report = run_campaign(&cli.campaign_config(from..to))?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "{}/{} seeds passed, {} crashed, {} reached interesting states",
                    report.seeds_passed,
                    report.seeds_run,
                    report.crashes,
                    report.interesting_states_reached
                );
                for failure in &report.failures {
                    println!("seed {}:", failure.seed);
                    for violation in &failure.violations {
                        println!("  {violation}");
                    }
                }
                if let Some(seed) = report.first_failure {
                    println!("replay with: pces-sim run --seed {seed}");
                }
            }
            Ok(if report.all_passed() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
