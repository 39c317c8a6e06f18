use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::fmt;

use flockgrid_index::{BatchScheduler, CellCoord, DomainBox, GridInfo, HashGrid};
use glam::Vec3;
use rand::{Rng, rngs::SmallRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::crosscheck::{NeighborMismatch, validate_neighbors};
use crate::forces::{VortexField, WallField, flock_acceleration, integrate};
use crate::strategy::{AgentView, NeighborEngine, NeighborStrategy, QueryInputs, QueryStats};
use crate::{AgentArena, AgentData, AgentId, FlockConfig, SimulationParams, Tick, WorldError};

/// Per-tick counters recorded in the world history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickSummary {
    pub tick: Tick,
    pub agent_count: usize,
    pub strategy: NeighborStrategy,
    pub grid_size: CellCoord,
    /// Agents, occupied cells or macro-cells processed by the query.
    pub work_items: usize,
    pub batch_size: usize,
    pub neighbor_pairs: usize,
    pub dropped_neighbors: usize,
    /// Agents outside the grid domain this tick.
    pub outside_domain: usize,
}

/// Explicit simulation context: configuration, agents, grid, workers and the active strategy.
pub struct FlockWorld {
    config: FlockConfig,
    tick: Tick,
    rng: SmallRng,
    pool: rayon::ThreadPool,
    agents: AgentArena,
    grid: HashGrid<usize>,
    engine: NeighborEngine,
    domain: DomainBox,
    wall: WallField,
    vortex: VortexField,
    active: NeighborStrategy,
    pending_strategy: Option<NeighborStrategy>,
    pending_params: Option<SimulationParams>,
    pending_wall_scale: Option<f32>,
    outside_domain: usize,
    history: VecDeque<TickSummary>,
}

impl fmt::Debug for FlockWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlockWorld")
            .field("config", &self.config)
            .field("tick", &self.tick)
            .field("strategy", &self.active)
            .field("agent_count", &self.agents.len())
            .field("grid_size", &self.grid.grid_size())
            .field("workers", &self.pool.current_num_threads())
            .finish()
    }
}

impl FlockWorld {
    /// Build a world and spawn `config.initial_agents` random agents.
    pub fn new(config: FlockConfig) -> Result<Self, WorldError> {
        config.validate()?;
        let domain = config.grid_domain()?;
        let mut builder = rayon::ThreadPoolBuilder::new()
            .thread_name(|index| format!("flockgrid-worker-{index}"));
        if let Some(threads) = config.worker_threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder.build()?;
        let scheduler = BatchScheduler::new(config.batch_pack, pool.current_num_threads())?;
        let rng = config.seeded_rng();
        let params = config.params;

        let mut world = Self {
            tick: Tick::zero(),
            rng,
            pool,
            agents: AgentArena::with_capacity(config.initial_agents),
            grid: HashGrid::new(),
            engine: NeighborEngine::new(scheduler),
            domain,
            wall: WallField::new(config.wall_scale, params.wall_distance, params.wall_weight),
            vortex: VortexField::new(config.wall_scale, params.vortex_intensity),
            active: config.strategy,
            pending_strategy: None,
            pending_params: None,
            pending_wall_scale: None,
            outside_domain: 0,
            history: VecDeque::with_capacity(config.history_capacity),
            config,
        };
        world.init_domain()?;
        world.spawn_random(world.config.initial_agents);
        info!(
            agents = world.agents.len(),
            strategy = %world.active,
            workers = world.pool.current_num_threads(),
            grid = %world.grid.grid_size(),
            "flock world ready"
        );
        Ok(world)
    }

    /// Resize the grid for the current population and search parameters.
    pub fn init_domain(&mut self) -> Result<(), WorldError> {
        let previous = self.grid.grid_size();
        self.grid.init_domain_with_range(
            self.domain,
            self.agents.len().max(1),
            self.config.params.cell_edge(),
        )?;
        if previous != self.grid.grid_size() {
            info!(
                grid = %self.grid.grid_size(),
                cell_edge = self.config.params.cell_edge(),
                "resized hash grid"
            );
        }
        Ok(())
    }

    /// Queue a strategy switch. It takes effect at the start of the next tick.
    pub fn set_active_strategy(&mut self, strategy: NeighborStrategy) {
        self.pending_strategy = Some(strategy);
    }

    /// Queue new simulation parameters, applied at the start of the next tick.
    ///
    /// They are checked against a queued wall scale, if any, rather than the current one.
    pub fn update_params(&mut self, params: SimulationParams) -> Result<(), WorldError> {
        let mut config = self.staged_config();
        config.params = params;
        check_reconfigure(&config)?;
        self.pending_params = Some(params);
        Ok(())
    }

    /// Queue a new cage edge length. The grid domain follows it at the start of the next tick.
    pub fn set_wall_scale(&mut self, wall_scale: f32) -> Result<(), WorldError> {
        let mut config = self.staged_config();
        config.wall_scale = wall_scale;
        check_reconfigure(&config)?;
        self.pending_wall_scale = Some(wall_scale);
        Ok(())
    }

    /// Current config with every queued parameter and wall scale change applied.
    fn staged_config(&self) -> FlockConfig {
        let mut config = self.config.clone();
        if let Some(params) = self.pending_params {
            config.params = params;
        }
        if let Some(wall_scale) = self.pending_wall_scale {
            config.wall_scale = wall_scale;
        }
        config
    }

    #[must_use]
    pub const fn active_strategy(&self) -> NeighborStrategy {
        self.active
    }

    #[must_use]
    pub const fn pending_strategy(&self) -> Option<NeighborStrategy> {
        self.pending_strategy
    }

    /// Items per batch the scheduler would pick for `n_items` work items.
    #[must_use]
    pub fn recommended_batch_size(&self, n_items: usize) -> usize {
        self.engine.scheduler().batch_size(n_items)
    }

    /// Spawn `count` agents uniformly in the unit cube with random headings.
    pub fn spawn_random(&mut self, count: usize) -> Vec<AgentId> {
        let speed = self.config.params.init_speed;
        let limit = self.config.params.neighbor_capacity;
        self.agents.reserve(count);
        (0..count)
            .map(|_| {
                let position = Vec3::new(
                    self.rng.random::<f32>(),
                    self.rng.random::<f32>(),
                    self.rng.random::<f32>(),
                );
                let z: f32 = self.rng.random_range(-1.0..=1.0);
                let phi: f32 = self.rng.random_range(0.0..TAU);
                let planar = (1.0 - z * z).max(0.0).sqrt();
                let heading = Vec3::new(planar * phi.cos(), planar * phi.sin(), z);
                self.agents
                    .insert(AgentData::new(position, heading * speed), limit)
            })
            .collect()
    }

    pub fn spawn_agent(&mut self, agent: AgentData) -> AgentId {
        self.agents
            .insert(agent, self.config.params.neighbor_capacity)
    }

    pub fn remove_agent(&mut self, id: AgentId) -> Option<AgentData> {
        self.agents.remove(id)
    }

    /// Remove the last `count` agents. Returns how many were removed.
    pub fn despawn(&mut self, count: usize) -> usize {
        let keep = self.agents.len().saturating_sub(count);
        self.agents.truncate(keep)
    }

    /// Spawn or despawn until exactly `count` agents remain.
    pub fn set_population(&mut self, count: usize) {
        let current = self.agents.len();
        if count > current {
            self.spawn_random(count - current);
        } else {
            self.despawn(current - count);
        }
    }

    /// Advance the simulation by one tick.
    pub fn step(&mut self) -> Result<TickSummary, WorldError> {
        let next_tick = self.tick.next();
        self.stage_reconfigure()?;
        self.stage_grid();
        let stats = self.stage_query()?;
        self.stage_flocking();
        self.stage_fields();
        self.stage_integrate();

        let summary = TickSummary {
            tick: next_tick,
            agent_count: self.agents.len(),
            strategy: self.active,
            grid_size: self.grid.grid_size(),
            work_items: stats.work_items,
            batch_size: stats.batch_size,
            neighbor_pairs: stats.neighbor_pairs,
            dropped_neighbors: stats.dropped_neighbors,
            outside_domain: self.outside_domain,
        };
        if summary.dropped_neighbors > 0 {
            warn!(
                tick = next_tick.0,
                dropped = summary.dropped_neighbors,
                capacity = self.config.params.neighbor_capacity,
                "neighbor lists overflowed"
            );
        }
        debug!(
            tick = next_tick.0,
            agents = summary.agent_count,
            work_items = summary.work_items,
            batch_size = summary.batch_size,
            pairs = summary.neighbor_pairs,
            outside = summary.outside_domain,
            "tick complete"
        );
        self.tick = next_tick;
        if self.history.len() >= self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(summary);
        Ok(summary)
    }

    /// Rebuild the grid and rerun the active strategy without moving any agent.
    ///
    /// Pending reconfiguration is applied first. Combined strategies leave the neighbor
    /// lists empty and write their steering into the accelerations.
    pub fn refresh_neighbors(&mut self) -> Result<QueryStats, WorldError> {
        self.stage_reconfigure()?;
        self.stage_grid();
        self.stage_query()
    }

    /// Recompute neighbor lists and compare them against an exhaustive scan.
    ///
    /// Combined strategies are checked through their list-producing counterparts.
    pub fn crosscheck(&mut self) -> Result<Vec<NeighborMismatch>, WorldError> {
        self.stage_reconfigure()?;
        let active = self.active;
        self.active = active.list_counterpart();
        self.stage_grid();
        let result = self.stage_query();
        self.active = active;
        result?;

        let query = self.config.params.query();
        let domain = active.uses_grid().then_some(&self.domain);
        let columns = self.agents.columns();
        let view = AgentView::new(columns.positions(), columns.velocities());
        let lists = columns.neighbors();
        Ok(self
            .pool
            .install(|| validate_neighbors(view, lists, &query, domain)))
    }

    /// Handles of the neighbors found for `id` by the last query.
    #[must_use]
    pub fn neighbors_of(&self, id: AgentId) -> Option<Vec<AgentId>> {
        let row = self.agents.index_of(id)?;
        let handles = self.agents.handles();
        let list = self.agents.columns().neighbors().get(row)?;
        Some(list.iter().filter_map(|other| handles.get(other).copied()).collect())
    }

    fn stage_reconfigure(&mut self) -> Result<(), WorldError> {
        if self.pending_params.is_some() || self.pending_wall_scale.is_some() {
            // Queued changes stay queued if the combination is rejected.
            let config = self.staged_config();
            self.domain = check_reconfigure(&config)?;
            self.pending_params = None;
            self.pending_wall_scale = None;
            self.config = config;
            let params = self.config.params;
            self.wall = WallField::new(
                self.config.wall_scale,
                params.wall_distance,
                params.wall_weight,
            );
            self.vortex = VortexField::new(self.config.wall_scale, params.vortex_intensity);
            self.init_domain()?;
            debug!(
                wall_scale = self.config.wall_scale,
                range = params.neighbor_search_range,
                angle = params.neighbor_search_angle,
                "applied simulation parameters"
            );
        }
        if let Some(strategy) = self.pending_strategy.take() {
            if strategy != self.active {
                info!(
                    from = %self.active,
                    to = %strategy,
                    tick = self.tick.0,
                    "switching neighbor strategy"
                );
                self.active = strategy;
            }
        }
        Ok(())
    }

    fn stage_grid(&mut self) {
        let positions = self.agents.columns().positions();
        if !self.active.uses_grid() {
            self.grid.clear();
            let domain = self.domain;
            self.outside_domain = positions
                .iter()
                .filter(|&&pos| !domain.is_inside(pos))
                .count();
            return;
        }
        let grid = &mut self.grid;
        grid.clear();
        let inserted = self.pool.install(|| {
            let inserted = grid.with_parallel_writer(|writer| {
                positions
                    .par_iter()
                    .enumerate()
                    .filter(|&(row, &pos)| writer.try_add(pos, row))
                    .count()
            });
            grid.sort_cells();
            inserted
        });
        self.outside_domain = positions.len() - inserted;
    }

    fn stage_query(&mut self) -> Result<QueryStats, WorldError> {
        let params = self.config.params;
        let mean_occupancy =
            self.grid.len() as f32 / self.grid.info().cell_count().max(1) as f32;
        let occupancy_hint = mean_occupancy * self.config.merged_occupancy_slack;
        let (view, lists, accelerations) = self.agents.columns_mut().query_split();
        let inputs = QueryInputs {
            grid: &self.grid,
            view,
            query: params.query(),
            weights: params.flock_weights(),
            merge_size: params.cell_merge_size,
            occupancy_hint,
            neighbor_limit: params.neighbor_capacity,
        };
        let engine = &mut self.engine;
        let strategy = self.active;
        let stats = self.pool.install(|| {
            accelerations.par_iter_mut().for_each(|acc| *acc = Vec3::ZERO);
            engine.run(strategy, &inputs, lists, accelerations)
        })?;
        Ok(stats)
    }

    fn stage_flocking(&mut self) {
        if self.active.is_combined() {
            return;
        }
        let weights = self.config.params.flock_weights();
        let min_len = self.engine.scheduler().batch_size(self.agents.len());
        let (view, lists, accelerations) = self.agents.columns_mut().query_split();
        let lists = &*lists;
        self.pool.install(|| {
            accelerations
                .par_iter_mut()
                .enumerate()
                .with_min_len(min_len)
                .for_each(|(row, acc)| {
                    *acc += flock_acceleration(view, row, &lists[row], weights);
                });
        });
    }

    fn stage_fields(&mut self) {
        let wall = self.wall;
        let vortex = self.vortex;
        let (positions, _, accelerations) = self.agents.columns_mut().kinematics_mut();
        let positions = &*positions;
        self.pool.install(|| {
            accelerations
                .par_iter_mut()
                .zip(positions.par_iter())
                .for_each(|(acc, &pos)| {
                    if vortex.is_enabled() {
                        *acc += vortex.acceleration(pos);
                    }
                    *acc = wall.apply(pos, *acc);
                });
        });
    }

    fn stage_integrate(&mut self) {
        let dt = self.config.time_step;
        let SimulationParams {
            min_speed,
            max_speed,
            ..
        } = self.config.params;
        let (positions, velocities, accelerations) = self.agents.columns_mut().kinematics_mut();
        self.pool.install(|| {
            positions
                .par_iter_mut()
                .zip(velocities.par_iter_mut())
                .zip(accelerations.par_iter_mut())
                .for_each(|((pos, vel), acc)| integrate(pos, vel, acc, dt, min_speed, max_speed));
        });
    }

    #[must_use]
    pub fn config(&self) -> &FlockConfig {
        &self.config
    }

    #[must_use]
    pub const fn tick(&self) -> Tick {
        self.tick
    }

    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    #[must_use]
    pub fn agents(&self) -> &AgentArena {
        &self.agents
    }

    /// Grid built by the last tick. Empty while [`NeighborStrategy::Direct`] is active.
    #[must_use]
    pub fn grid(&self) -> &HashGrid<usize> {
        &self.grid
    }

    /// Box indexed by the grid; agents outside it are not queried.
    #[must_use]
    pub const fn domain(&self) -> &DomainBox {
        &self.domain
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Recent tick summaries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TickSummary> {
        self.history.iter()
    }

    #[must_use]
    pub fn last_summary(&self) -> Option<&TickSummary> {
        self.history.back()
    }
}

/// Validate a reconfigured world and return the grid domain it implies.
///
/// Grid sizing is checked as well, so a committed config always fits the grid.
fn check_reconfigure(config: &FlockConfig) -> Result<DomainBox, WorldError> {
    config.validate()?;
    let domain = config.grid_domain()?;
    GridInfo::with_range(domain, config.params.cell_edge())?;
    Ok(domain)
}
