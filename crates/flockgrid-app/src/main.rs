use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use flockgrid_app::{ConfigOverride, RunOptions, StrategySwitch, apply_overrides, load_config, run};
use flockgrid_core::{FlockConfig, FlockWorld, NeighborStrategy};
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "flockgrid",
    version,
    about = "Run a headless boid flocking simulation"
)]
struct Cli {
    /// JSON configuration file; missing fields take their defaults.
    #[arg(long, env = "FLOCKGRID_CONFIG")]
    config: Option<PathBuf>,
    /// Initial number of agents.
    #[arg(long)]
    agents: Option<usize>,
    /// Ticks to simulate.
    #[arg(long, default_value_t = 600)]
    ticks: u64,
    /// Neighbor strategy active on the first tick.
    #[arg(long)]
    strategy: Option<NeighborStrategy>,
    /// Edge length of the containment cage.
    #[arg(long)]
    wall_scale: Option<f32>,
    /// Worker threads (defaults to one per core).
    #[arg(long)]
    threads: Option<usize>,
    /// RNG seed for reproducible populations.
    #[arg(long)]
    seed: Option<u64>,
    /// Validate neighbor lists against an exhaustive scan at every report.
    #[arg(long)]
    crosscheck: bool,
    /// Log a tick report every N ticks.
    #[arg(long, default_value_t = 60)]
    report_every: u64,
    /// Switch strategy before a given tick, e.g. `300:cell_cell`. Repeatable.
    #[arg(long = "switch", value_name = "TICK:STRATEGY")]
    switches: Vec<StrategySwitch>,
    /// Override a configuration field, e.g. `params.neighbor_search_range=2.0`. Repeatable.
    #[arg(long = "set", value_name = "PATH=VALUE")]
    overrides: Vec<ConfigOverride>,
    /// Grow or shrink the population towards this tick duration in milliseconds.
    #[arg(long)]
    target_frame_ms: Option<f64>,
    /// Print the final run report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let mut world = FlockWorld::new(config).context("failed to create flock world")?;
    info!(
        agents = world.agent_count(),
        strategy = %world.active_strategy(),
        workers = world.workers(),
        ticks = cli.ticks,
        "starting flockgrid run"
    );

    let options = RunOptions {
        ticks: cli.ticks,
        report_every: cli.report_every,
        crosscheck: cli.crosscheck,
        switches: cli.switches.clone(),
        target_frame: cli
            .target_frame_ms
            .filter(|ms| ms.is_finite() && *ms > 0.0)
            .map(|ms| Duration::from_secs_f64(ms / 1e3)),
        min_agents: 1,
    };
    let report = run(&mut world, &options).context("simulation failed")?;
    info!(
        ticks = report.ticks,
        agents = report.final_agents,
        mean_tick_ms = report.mean_tick.as_secs_f64() * 1e3,
        slowest_tick_ms = report.slowest_tick.as_secs_f64() * 1e3,
        dropped_neighbors = report.dropped_neighbors,
        "run complete"
    );
    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed to encode run report")?
        );
    }
    if report.mismatched_agents > 0 {
        bail!(
            "cross-check found {} agents with wrong neighbor lists",
            report.mismatched_agents
        );
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn build_config(cli: &Cli) -> Result<FlockConfig> {
    let mut config = match &cli.config {
        Some(path) => load_config(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => FlockConfig::default(),
    };
    if let Some(agents) = cli.agents {
        config.initial_agents = agents;
    }
    if let Some(strategy) = cli.strategy {
        config.strategy = strategy;
    }
    if let Some(wall_scale) = cli.wall_scale {
        config.wall_scale = wall_scale;
    }
    if cli.threads.is_some() {
        config.worker_threads = cli.threads;
    }
    if cli.seed.is_some() {
        config.rng_seed = cli.seed;
    }
    apply_overrides(&config, &cli.overrides).context("invalid configuration")
}
