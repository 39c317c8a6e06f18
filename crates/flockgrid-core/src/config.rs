use flockgrid_index::{DEFAULT_BATCH_PACK, DomainBox};
use glam::Vec3;
use rand::{SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};

use crate::forces::FlockWeights;
use crate::strategy::{NeighborQuery, NeighborStrategy};
use crate::{NEIGHBOR_INLINE_CAPACITY, WorldError};

/// Tunable boid behaviour, read once per tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationParams {
    /// Speed given to freshly spawned agents.
    pub init_speed: f32,
    /// Lower clamp applied to speed after integration.
    pub min_speed: f32,
    /// Upper clamp applied to speed after integration.
    pub max_speed: f32,
    /// Neighbor search radius in world units.
    pub neighbor_search_range: f32,
    /// Full opening angle of the forward view cone, in degrees.
    pub neighbor_search_angle: f32,
    pub alignment_weight: f32,
    pub cohesion_weight: f32,
    pub separation_weight: f32,
    /// Repulsion distance scale of the containment walls.
    pub wall_distance: f32,
    pub wall_weight: f32,
    /// Vortex field strength; zero disables the field.
    pub vortex_intensity: f32,
    /// Grid cell edge as a multiple of the search radius.
    pub range_coef: f32,
    /// Macro-cell edge length in cells for the merged strategy.
    pub cell_merge_size: usize,
    /// Maximum neighbors stored per agent.
    pub neighbor_capacity: usize,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            init_speed: 0.5,
            min_speed: 2.0,
            max_speed: 5.0,
            neighbor_search_range: 1.2,
            neighbor_search_angle: 90.0,
            alignment_weight: 2.0,
            cohesion_weight: 3.0,
            separation_weight: 2.0,
            wall_distance: 3.0,
            wall_weight: 1.0,
            vortex_intensity: 1.0,
            range_coef: 1.5,
            cell_merge_size: 2,
            neighbor_capacity: NEIGHBOR_INLINE_CAPACITY,
        }
    }
}

impl SimulationParams {
    /// Validate against the cage of edge `wall_scale`.
    pub fn validate(&self, wall_scale: f32) -> Result<(), WorldError> {
        if !(self.neighbor_search_range > 0.0) || !self.neighbor_search_range.is_finite() {
            return Err(WorldError::InvalidConfig(
                "neighbor_search_range must be positive",
            ));
        }
        if !(self.neighbor_search_angle > 0.0 && self.neighbor_search_angle <= 360.0) {
            return Err(WorldError::InvalidConfig(
                "neighbor_search_angle must lie in (0, 360] degrees",
            ));
        }
        if !(0.2..=10.0).contains(&self.range_coef) {
            return Err(WorldError::InvalidConfig("range_coef must lie in [0.2, 10]"));
        }
        if self.min_speed < 0.0 || self.min_speed > self.max_speed || self.init_speed < 0.0 {
            return Err(WorldError::InvalidConfig(
                "speeds must be non-negative with min_speed <= max_speed",
            ));
        }
        if !(self.wall_distance > 0.0) || self.wall_distance >= wall_scale * 0.5 {
            return Err(WorldError::InvalidConfig(
                "wall_distance must be positive and below half the wall scale",
            ));
        }
        if self.wall_weight < 0.0 {
            return Err(WorldError::InvalidConfig("wall_weight must be non-negative"));
        }
        if self.cell_merge_size == 0 {
            return Err(WorldError::InvalidConfig("cell_merge_size must be positive"));
        }
        if self.neighbor_capacity == 0 {
            return Err(WorldError::InvalidConfig(
                "neighbor_capacity must be positive",
            ));
        }
        let weights = [
            self.alignment_weight,
            self.cohesion_weight,
            self.separation_weight,
            self.vortex_intensity,
        ];
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(WorldError::InvalidConfig("weights must be finite"));
        }
        Ok(())
    }

    /// Grid cell edge used when sizing the hash grid.
    #[must_use]
    pub fn cell_edge(&self) -> f32 {
        self.neighbor_search_range * self.range_coef
    }

    #[must_use]
    pub fn query(&self) -> NeighborQuery {
        NeighborQuery::new(self.neighbor_search_range, self.neighbor_search_angle)
    }

    #[must_use]
    pub fn flock_weights(&self) -> FlockWeights {
        FlockWeights {
            alignment: self.alignment_weight,
            cohesion: self.cohesion_weight,
            separation: self.separation_weight,
        }
    }
}

/// Static configuration for a flocking world.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FlockConfig {
    pub params: SimulationParams,
    /// Agents spawned when the world is created.
    pub initial_agents: usize,
    /// Edge length of the containment cage centred on the origin.
    pub wall_scale: f32,
    /// Extra room between the cage and the grid domain on every side.
    pub domain_margin: f32,
    /// Neighbor strategy active on the first tick.
    pub strategy: NeighborStrategy,
    /// Worker threads; `None` uses the rayon default.
    pub worker_threads: Option<usize>,
    /// Batches per worker targeted by the batch scheduler.
    pub batch_pack: usize,
    /// Multiplier applied to the mean cell occupancy when reserving merged-cell buffers.
    pub merged_occupancy_slack: f32,
    /// Optional RNG seed for reproducible worlds.
    pub rng_seed: Option<u64>,
    /// Integration step in seconds.
    pub time_step: f32,
    /// Maximum number of recent tick summaries retained in-memory.
    pub history_capacity: usize,
}

impl Default for FlockConfig {
    fn default() -> Self {
        Self {
            params: SimulationParams::default(),
            initial_agents: 100,
            wall_scale: 10.0,
            domain_margin: 1.0,
            strategy: NeighborStrategy::default(),
            worker_threads: None,
            batch_pack: DEFAULT_BATCH_PACK,
            merged_occupancy_slack: 1.5,
            rng_seed: None,
            time_step: 1.0 / 60.0,
            history_capacity: 256,
        }
    }
}

impl FlockConfig {
    pub fn validate(&self) -> Result<(), WorldError> {
        if !(self.wall_scale > 0.0) || !self.wall_scale.is_finite() {
            return Err(WorldError::InvalidConfig("wall_scale must be positive"));
        }
        if self.domain_margin < 0.0 {
            return Err(WorldError::InvalidConfig(
                "domain_margin must be non-negative",
            ));
        }
        if self.worker_threads == Some(0) {
            return Err(WorldError::InvalidConfig(
                "worker_threads must be positive when set",
            ));
        }
        if self.batch_pack == 0 {
            return Err(WorldError::InvalidConfig("batch_pack must be positive"));
        }
        if !(self.merged_occupancy_slack > 0.0) {
            return Err(WorldError::InvalidConfig(
                "merged_occupancy_slack must be positive",
            ));
        }
        if !(self.time_step > 0.0) {
            return Err(WorldError::InvalidConfig("time_step must be positive"));
        }
        if self.history_capacity == 0 {
            return Err(WorldError::InvalidConfig(
                "history_capacity must be positive",
            ));
        }
        self.params.validate(self.wall_scale)
    }

    /// Box indexed by the hash grid: the cage plus `domain_margin` on every side.
    pub fn grid_domain(&self) -> Result<DomainBox, WorldError> {
        let half = self.wall_scale * 0.5 + self.domain_margin;
        Ok(DomainBox::new(Vec3::splat(-half), Vec3::splat(half))?)
    }

    /// Returns the configured RNG seed, generating one from entropy if absent.
    pub(crate) fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}
