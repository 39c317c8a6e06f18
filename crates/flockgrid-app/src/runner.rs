//! Headless tick loop with periodic reports, scheduled strategy switches, optional
//! cross-checks and frame-time driven population tuning.

use std::str::FromStr;
use std::time::{Duration, Instant};

use flockgrid_core::{FlockWorld, NeighborStrategy, TickSummary, WorldError};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

/// Population change applied per tick when tuning towards a target frame time.
const ADAPT_STEP: f64 = 0.05;
/// Frame times within this fraction of the target leave the population alone.
const ADAPT_DEADBAND: f64 = 0.1;

/// Switch to `strategy` right before the tick numbered `tick` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategySwitch {
    pub tick: u64,
    pub strategy: NeighborStrategy,
}

#[derive(Debug, Error)]
#[error("expected TICK:STRATEGY, got '{0}'")]
pub struct InvalidSwitch(String);

impl FromStr for StrategySwitch {
    type Err = InvalidSwitch;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidSwitch(s.to_owned());
        let (tick, strategy) = s.split_once(':').ok_or_else(invalid)?;
        Ok(Self {
            tick: tick.trim().parse().map_err(|_| invalid())?,
            strategy: strategy.parse().map_err(|_| invalid())?,
        })
    }
}

/// Parameters of one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub ticks: u64,
    /// Log a summary every this many ticks; zero logs only the final tick.
    pub report_every: u64,
    /// Validate neighbor lists against an exhaustive scan at every report.
    pub crosscheck: bool,
    pub switches: Vec<StrategySwitch>,
    /// Grow or shrink the population so a tick takes about this long.
    pub target_frame: Option<Duration>,
    /// Lower bound on the population while tuning.
    pub min_agents: usize,
}

/// Totals gathered over a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub ticks: u64,
    pub final_agents: usize,
    pub mean_tick: Duration,
    pub slowest_tick: Duration,
    pub crosschecks: usize,
    pub mismatched_agents: usize,
    pub dropped_neighbors: usize,
    pub last: Option<TickSummary>,
}

/// Step `world` for `options.ticks` ticks.
pub fn run(world: &mut FlockWorld, options: &RunOptions) -> Result<RunReport, WorldError> {
    let mut report = RunReport::default();
    let mut total = Duration::ZERO;
    for _ in 0..options.ticks {
        let upcoming = world.tick().next().0;
        for switch in options.switches.iter().filter(|s| s.tick == upcoming) {
            world.set_active_strategy(switch.strategy);
        }

        let started = Instant::now();
        let summary = world.step()?;
        let elapsed = started.elapsed();

        total += elapsed;
        report.ticks += 1;
        report.slowest_tick = report.slowest_tick.max(elapsed);
        report.dropped_neighbors += summary.dropped_neighbors;
        report.last = Some(summary);

        let is_last = report.ticks == options.ticks;
        let due = options.report_every > 0 && summary.tick.0 % options.report_every == 0;
        if due || is_last {
            info!(
                tick = summary.tick.0,
                agents = summary.agent_count,
                strategy = %summary.strategy,
                work_items = summary.work_items,
                batch_size = summary.batch_size,
                pairs = summary.neighbor_pairs,
                outside = summary.outside_domain,
                tick_ms = elapsed.as_secs_f64() * 1e3,
                "tick report"
            );
            if options.crosscheck {
                let mismatches = world.crosscheck()?;
                report.crosschecks += 1;
                report.mismatched_agents += mismatches.len();
                if let Some(first) = mismatches.first() {
                    warn!(
                        tick = summary.tick.0,
                        agents = mismatches.len(),
                        first_agent = first.agent,
                        missing = first.missing.len(),
                        unexpected = first.unexpected.len(),
                        "neighbor lists disagree with exhaustive scan"
                    );
                }
            }
        }

        if let Some(target) = options.target_frame {
            adapt_population(world, elapsed, target, options.min_agents.max(1));
        }
    }
    report.final_agents = world.agent_count();
    if report.ticks > 0 {
        report.mean_tick = total / u32::try_from(report.ticks).unwrap_or(u32::MAX);
    }
    Ok(report)
}

fn adapt_population(world: &mut FlockWorld, elapsed: Duration, target: Duration, floor: usize) {
    let ratio = elapsed.as_secs_f64() / target.as_secs_f64().max(f64::EPSILON);
    let current = world.agent_count();
    let step = ((current as f64 * ADAPT_STEP).ceil() as usize).max(1);
    let next = if ratio > 1.0 + ADAPT_DEADBAND {
        current.saturating_sub(step).max(floor)
    } else if ratio < 1.0 - ADAPT_DEADBAND {
        current + step
    } else {
        current
    };
    if next != current {
        world.set_population(next);
    }
}
