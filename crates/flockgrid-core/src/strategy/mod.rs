//! Neighbor query strategies.
//!
//! Every strategy accepts agent B as a neighbor of agent A when B is not A, lies strictly
//! inside the search radius, and falls inside A's forward view cone. Grid strategies only
//! differ in how candidates are enumerated and how work is split across workers; all of
//! them apply the exact predicate when collecting, so their neighbor sets match
//! [`NeighborStrategy::Direct`] for agents inside the grid domain.
//!
//! Cell and macro-cell strategies write into a scratch buffer laid out cell by cell, hand
//! each batch an exclusive sub-slice of it, then copy results back to agent rows.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use flockgrid_index::{BatchScheduler, CellCoord, HashGrid, IndexError, MergedCellRange, partition_mut};
use glam::Vec3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::NeighborList;
use crate::forces::FlockWeights;

mod cell;
mod combined;
mod direct;
mod entity;
mod merged;

/// Interchangeable neighbor query algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborStrategy {
    /// Pairwise scan of the whole population; no grid.
    Direct,
    /// One grid window per agent.
    EntityNeighborList,
    /// One grid window per occupied cell, shared by the agents in it.
    #[default]
    CellNeighborList,
    /// Per occupied cell, scan every in-range cell for every agent.
    CellCell,
    /// `CellNeighborList` fused with flocking accumulation.
    CombinedNeighborList,
    /// `CellCell` fused with flocking accumulation.
    CombinedCellCell,
    /// Per macro-cell, windows resolved from a shared cache.
    MergedCellNeighborList,
}

impl NeighborStrategy {
    pub const ALL: [Self; 7] = [
        Self::Direct,
        Self::EntityNeighborList,
        Self::CellNeighborList,
        Self::CellCell,
        Self::CombinedNeighborList,
        Self::CombinedCellCell,
        Self::MergedCellNeighborList,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::EntityNeighborList => "entity_neighbor_list",
            Self::CellNeighborList => "cell_neighbor_list",
            Self::CellCell => "cell_cell",
            Self::CombinedNeighborList => "combined_neighbor_list",
            Self::CombinedCellCell => "combined_cell_cell",
            Self::MergedCellNeighborList => "merged_cell_neighbor_list",
        }
    }

    /// True for every strategy that reads the hash grid.
    #[must_use]
    pub const fn uses_grid(self) -> bool {
        !matches!(self, Self::Direct)
    }

    /// True when flocking forces are accumulated during the query instead of afterwards.
    #[must_use]
    pub const fn is_combined(self) -> bool {
        matches!(self, Self::CombinedNeighborList | Self::CombinedCellCell)
    }

    /// The strategy that walks the grid the same way but stores neighbor lists.
    #[must_use]
    pub const fn list_counterpart(self) -> Self {
        match self {
            Self::CombinedNeighborList => Self::CellNeighborList,
            Self::CombinedCellCell => Self::CellCell,
            other => other,
        }
    }
}

impl fmt::Display for NeighborStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown strategy name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown neighbor strategy `{0}`")]
pub struct UnknownStrategy(pub String);

impl FromStr for NeighborStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| UnknownStrategy(s.to_owned()))
    }
}

/// Read-only kinematics snapshot indexed by agent row.
#[derive(Debug, Clone, Copy)]
pub struct AgentView<'a> {
    positions: &'a [Vec3],
    velocities: &'a [Vec3],
}

impl<'a> AgentView<'a> {
    #[must_use]
    pub fn new(positions: &'a [Vec3], velocities: &'a [Vec3]) -> Self {
        debug_assert_eq!(positions.len(), velocities.len());
        Self {
            positions,
            velocities,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn position(&self, row: usize) -> Vec3 {
        self.positions[row]
    }

    #[inline]
    #[must_use]
    pub fn velocity(&self, row: usize) -> Vec3 {
        self.velocities[row]
    }

    /// Unit heading of `row`, or zero for a stationary agent.
    #[inline]
    #[must_use]
    pub fn forward(&self, row: usize) -> Vec3 {
        self.velocities[row].normalize_or_zero()
    }

    #[must_use]
    pub fn positions(&self) -> &'a [Vec3] {
        self.positions
    }

    #[must_use]
    pub fn velocities(&self) -> &'a [Vec3] {
        self.velocities
    }
}

/// Distance and view-cone test shared by every strategy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NeighborQuery {
    radius: f32,
    radius_sq: f32,
    cos_half_angle: f32,
}

impl NeighborQuery {
    /// `angle_degrees` is the full opening angle of the cone.
    #[must_use]
    pub fn new(radius: f32, angle_degrees: f32) -> Self {
        Self {
            radius,
            radius_sq: radius * radius,
            cos_half_angle: (angle_degrees.to_radians() * 0.5).cos(),
        }
    }

    #[must_use]
    pub const fn radius(&self) -> f32 {
        self.radius
    }

    #[must_use]
    pub const fn cos_half_angle(&self) -> f32 {
        self.cos_half_angle
    }

    /// Unit direction towards `other` when it passes the test for an agent at `origin`
    /// heading along the unit vector `forward`.
    #[inline]
    #[must_use]
    pub fn classify(&self, origin: Vec3, forward: Vec3, other: Vec3) -> Option<Vec3> {
        let to = other - origin;
        if to.length_squared() >= self.radius_sq {
            return None;
        }
        let direction = to.normalize_or_zero();
        (direction.dot(forward) > self.cos_half_angle).then_some(direction)
    }

    #[inline]
    #[must_use]
    pub fn accepts(&self, origin: Vec3, forward: Vec3, other: Vec3) -> bool {
        self.classify(origin, forward, other).is_some()
    }
}

/// Inputs shared by every strategy for one tick.
#[derive(Debug, Clone, Copy)]
pub struct QueryInputs<'a> {
    pub grid: &'a HashGrid<usize>,
    pub view: AgentView<'a>,
    pub query: NeighborQuery,
    pub weights: FlockWeights,
    pub merge_size: usize,
    /// Expected values per cell when reserving merged-cell buffers.
    pub occupancy_hint: f32,
    pub neighbor_limit: usize,
}

/// Counters reported by one query pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStats {
    /// Agents, occupied cells or macro-cells, depending on the strategy.
    pub work_items: usize,
    pub batch_size: usize,
    /// Accepted (agent, neighbor) pairs that were stored or accumulated.
    pub neighbor_pairs: usize,
    /// Pairs discarded because a neighbor list was full.
    pub dropped_neighbors: usize,
}

const UNSLOTTED: usize = usize::MAX;

/// Agent rows grouped by work item, in the order the items' outputs are laid out.
#[derive(Debug, Default)]
pub(crate) struct CellLayout {
    rows: Vec<usize>,
    offsets: Vec<usize>,
    slot_of_row: Vec<usize>,
}

impl CellLayout {
    fn begin(&mut self, n_agents: usize) {
        self.rows.clear();
        self.offsets.clear();
        self.offsets.push(0);
        self.slot_of_row.clear();
        self.slot_of_row.resize(n_agents, UNSLOTTED);
    }

    fn finish(&mut self) {
        for (slot, &row) in self.rows.iter().enumerate() {
            self.slot_of_row[row] = slot;
        }
    }

    fn from_cells(&mut self, grid: &HashGrid<usize>, cells: &[CellCoord], n_agents: usize) {
        self.begin(n_agents);
        for &cell in cells {
            self.rows.extend_from_slice(grid.get_values_in_cell(cell));
            self.offsets.push(self.rows.len());
        }
        self.finish();
    }

    fn from_blocks(&mut self, grid: &HashGrid<usize>, blocks: &[MergedCellRange], n_agents: usize) {
        self.begin(n_agents);
        for block in blocks {
            for cell in block.iter() {
                self.rows.extend_from_slice(grid.get_values_in_cell(cell));
            }
            self.offsets.push(self.rows.len());
        }
        self.finish();
    }

    fn item_count(&self) -> usize {
        self.offsets.len() - 1
    }

    fn slot_count(&self) -> usize {
        self.rows.len()
    }

    fn item_rows(&self, item: usize) -> &[usize] {
        &self.rows[self.offsets[item]..self.offsets[item + 1]]
    }

    /// First output slot of `item`.
    fn item_start(&self, item: usize) -> usize {
        self.offsets[item]
    }

    fn slot(&self, row: usize) -> Option<usize> {
        match self.slot_of_row[row] {
            UNSLOTTED => None,
            slot => Some(slot),
        }
    }

    /// Run `body` over consecutive item batches in parallel, each with exclusive access to
    /// the outputs of its own items. Returns the sum of the per-batch results.
    fn dispatch<O, S>(
        &self,
        scheduler: &BatchScheduler,
        out: &mut [O],
        init: impl Fn() -> S + Sync + Send,
        body: impl Fn(&mut S, Range<usize>, &mut [O]) -> usize + Sync + Send,
    ) -> usize
    where
        O: Send,
    {
        let batches: Vec<Range<usize>> = scheduler.split(self.item_count()).collect();
        let ends: Vec<usize> = batches
            .iter()
            .map(|items| self.offsets[items.end])
            .collect();
        let parts = partition_mut(out, &ends);
        batches
            .into_par_iter()
            .zip(parts)
            .map_init(init, |state, (items, part)| body(state, items, part))
            .sum()
    }

    fn scatter_lists(&self, scratch: &[NeighborList], lists: &mut [NeighborList], min_len: usize) {
        lists
            .par_iter_mut()
            .with_min_len(min_len)
            .enumerate()
            .for_each(|(row, list)| match self.slot(row) {
                Some(slot) => list.clone_from(&scratch[slot]),
                None => list.clear(),
            });
    }

    fn scatter_add(&self, scratch: &[Vec3], accelerations: &mut [Vec3], min_len: usize) {
        accelerations
            .par_iter_mut()
            .with_min_len(min_len)
            .enumerate()
            .for_each(|(row, acc)| {
                if let Some(slot) = self.slot(row) {
                    *acc += scratch[slot];
                }
            });
    }
}

fn count_dropped(lists: &[NeighborList]) -> usize {
    lists.par_iter().map(|list| list.dropped() as usize).sum()
}

fn reset_lists(lists: &mut [NeighborList], limit: usize) {
    lists.par_iter_mut().for_each(|list| list.reset(limit));
}

/// Reusable state for running any strategy; owned by the world across ticks.
#[derive(Debug)]
pub struct NeighborEngine {
    scheduler: BatchScheduler,
    cells: Vec<CellCoord>,
    blocks: Vec<MergedCellRange>,
    layout: CellLayout,
    scratch_lists: Vec<NeighborList>,
    scratch_accel: Vec<Vec3>,
}

impl NeighborEngine {
    #[must_use]
    pub fn new(scheduler: BatchScheduler) -> Self {
        Self {
            scheduler,
            cells: Vec::new(),
            blocks: Vec::new(),
            layout: CellLayout::default(),
            scratch_lists: Vec::new(),
            scratch_accel: Vec::new(),
        }
    }

    #[must_use]
    pub const fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    /// Occupied cells found by the last cell-based pass.
    #[must_use]
    pub fn occupied_cells(&self) -> &[CellCoord] {
        &self.cells
    }

    /// Macro-cells found by the last merged pass.
    #[must_use]
    pub fn merged_cells(&self) -> &[MergedCellRange] {
        &self.blocks
    }

    /// Run `strategy` for every agent of `inputs.view`.
    ///
    /// List strategies overwrite `lists`; combined strategies clear `lists` and add their
    /// flocking steering into `accelerations`. Must run inside the worker pool.
    pub fn run(
        &mut self,
        strategy: NeighborStrategy,
        inputs: &QueryInputs<'_>,
        lists: &mut [NeighborList],
        accelerations: &mut [Vec3],
    ) -> Result<QueryStats, IndexError> {
        let n_agents = inputs.view.len();
        debug_assert_eq!(lists.len(), n_agents);
        debug_assert_eq!(accelerations.len(), n_agents);

        match strategy {
            NeighborStrategy::Direct | NeighborStrategy::EntityNeighborList => {
                let batch_size = self.scheduler.batch_size(n_agents);
                let neighbor_pairs = if strategy == NeighborStrategy::Direct {
                    direct::run(inputs, lists, batch_size)
                } else {
                    entity::run(inputs, lists, batch_size)
                };
                Ok(QueryStats {
                    work_items: n_agents,
                    batch_size,
                    neighbor_pairs,
                    dropped_neighbors: count_dropped(lists),
                })
            }
            NeighborStrategy::CellNeighborList
            | NeighborStrategy::CellCell
            | NeighborStrategy::CombinedNeighborList
            | NeighborStrategy::CombinedCellCell => {
                inputs.grid.get_contains_index_list(&mut self.cells);
                self.layout.from_cells(inputs.grid, &self.cells, n_agents);
                let batch_size = self.scheduler.batch_size(self.cells.len());
                let min_len = self.scheduler.batch_size(n_agents);
                let mut stats = QueryStats {
                    work_items: self.cells.len(),
                    batch_size,
                    ..QueryStats::default()
                };
                if strategy.is_combined() {
                    self.scratch_accel.clear();
                    self.scratch_accel
                        .resize(self.layout.slot_count(), Vec3::ZERO);
                    let cells = CellBatch::new(inputs, &self.layout, &self.cells);
                    stats.neighbor_pairs = if strategy == NeighborStrategy::CombinedNeighborList {
                        combined::neighbor_list(&cells, &self.scheduler, &mut self.scratch_accel)
                    } else {
                        combined::cell_cell(&cells, &self.scheduler, &mut self.scratch_accel)
                    };
                    self.layout
                        .scatter_add(&self.scratch_accel, accelerations, min_len);
                    reset_lists(lists, inputs.neighbor_limit);
                } else {
                    self.prepare_scratch_lists(inputs.neighbor_limit);
                    let cells = CellBatch::new(inputs, &self.layout, &self.cells);
                    stats.neighbor_pairs = if strategy == NeighborStrategy::CellNeighborList {
                        cell::neighbor_list(&cells, &self.scheduler, &mut self.scratch_lists)
                    } else {
                        cell::cell_cell(&cells, &self.scheduler, &mut self.scratch_lists)
                    };
                    self.layout
                        .scatter_lists(&self.scratch_lists, lists, min_len);
                    stats.dropped_neighbors = count_dropped(lists);
                }
                Ok(stats)
            }
            NeighborStrategy::MergedCellNeighborList => {
                inputs
                    .grid
                    .get_contains_merged_cell_list(inputs.merge_size, &mut self.blocks)?;
                self.layout.from_blocks(inputs.grid, &self.blocks, n_agents);
                self.prepare_scratch_lists(inputs.neighbor_limit);
                let neighbor_pairs = merged::run(
                    inputs,
                    &self.layout,
                    &self.blocks,
                    &self.scheduler,
                    &mut self.scratch_lists,
                );
                self.layout.scatter_lists(
                    &self.scratch_lists,
                    lists,
                    self.scheduler.batch_size(n_agents),
                );
                Ok(QueryStats {
                    work_items: self.blocks.len(),
                    batch_size: self.scheduler.batch_size(self.blocks.len()),
                    neighbor_pairs,
                    dropped_neighbors: count_dropped(lists),
                })
            }
        }
    }

    fn prepare_scratch_lists(&mut self, limit: usize) {
        let slots = self.layout.slot_count();
        self.scratch_lists.truncate(slots);
        self.scratch_lists
            .resize_with(slots, || NeighborList::with_limit(limit));
    }
}

/// Borrowed view of one cell-based pass, shared by all batches.
#[derive(Clone, Copy)]
pub(crate) struct CellBatch<'a> {
    inputs: &'a QueryInputs<'a>,
    layout: &'a CellLayout,
    cells: &'a [CellCoord],
}

impl<'a> CellBatch<'a> {
    fn new(inputs: &'a QueryInputs<'a>, layout: &'a CellLayout, cells: &'a [CellCoord]) -> Self {
        Self {
            inputs,
            layout,
            cells,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_names_round_trip() {
        for strategy in NeighborStrategy::ALL {
            assert_eq!(strategy.as_str().parse::<NeighborStrategy>(), Ok(strategy));
        }
        assert_eq!(
            "Merged-Cell-Neighbor-List".parse::<NeighborStrategy>(),
            Ok(NeighborStrategy::MergedCellNeighborList)
        );
        assert!("octree".parse::<NeighborStrategy>().is_err());
    }

    #[test]
    fn cone_uses_half_angle() {
        let query = NeighborQuery::new(1.0, 90.0);
        let forward = Vec3::Z;
        let at_40 = Vec3::new(40_f32.to_radians().sin(), 0.0, 40_f32.to_radians().cos()) * 0.5;
        let at_50 = Vec3::new(50_f32.to_radians().sin(), 0.0, 50_f32.to_radians().cos()) * 0.5;
        assert!(query.accepts(Vec3::ZERO, forward, at_40));
        assert!(!query.accepts(Vec3::ZERO, forward, at_50));
    }

    #[test]
    fn radius_is_strict() {
        let query = NeighborQuery::new(0.5, 180.0);
        assert!(!query.accepts(Vec3::ZERO, Vec3::Z, Vec3::new(0.0, 0.0, 0.5)));
        assert!(query.accepts(Vec3::ZERO, Vec3::Z, Vec3::new(0.0, 0.0, 0.499)));
    }

    #[test]
    fn behind_is_rejected_even_for_wide_cones() {
        for angle in [1.0_f32, 90.0, 180.0, 300.0, 359.0] {
            let query = NeighborQuery::new(1.0, angle);
            assert!(!query.accepts(Vec3::ZERO, Vec3::Z, Vec3::new(0.0, 0.0, -0.5)));
            assert!(query.accepts(Vec3::ZERO, Vec3::Z, Vec3::new(0.0, 0.0, 0.5)));
        }
    }
}
