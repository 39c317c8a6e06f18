//! Boid flocking world and the neighbor query strategies that drive it.

use flockgrid_index::IndexError;
use glam::Vec3;
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;
use thiserror::Error;

mod config;
pub mod crosscheck;
pub mod forces;
pub mod strategy;
mod world;

pub use config::{FlockConfig, SimulationParams};
pub use forces::{FlockAccumulator, FlockWeights, VortexField, WallField};
pub use strategy::{AgentView, NeighborEngine, NeighborQuery, NeighborStrategy, QueryStats};
pub use world::{FlockWorld, TickSummary};

new_key_type! {
    /// Stable handle for agents backed by a generational slot map.
    pub struct AgentId;
}

/// Inline capacity of a neighbor list, and its default bound.
pub const NEIGHBOR_INLINE_CAPACITY: usize = 12;

/// High level simulation clock (ticks processed since boot).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tick(pub u64);

impl Tick {
    /// Returns the next sequential tick.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Resets the tick counter back to zero.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }
}

/// Bounded list of neighbor rows for one agent.
///
/// Pushes past `limit` are dropped and only counted. Flocking then averages over the first
/// `limit` neighbors found, so results depend on the strategy's visiting order once a list
/// overflows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborList {
    items: SmallVec<[usize; NEIGHBOR_INLINE_CAPACITY]>,
    limit: usize,
    dropped: u32,
}

impl Default for NeighborList {
    fn default() -> Self {
        Self::with_limit(NEIGHBOR_INLINE_CAPACITY)
    }
}

impl NeighborList {
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            items: SmallVec::new(),
            limit,
            dropped: 0,
        }
    }

    /// Maximum number of entries kept.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Clear the list and install a new bound.
    pub fn reset(&mut self, limit: usize) {
        self.items.clear();
        self.limit = limit;
        self.dropped = 0;
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.dropped = 0;
    }

    /// Append `row`; returns false and counts the drop when the list is full.
    #[inline]
    pub fn push(&mut self, row: usize) -> bool {
        if self.items.len() >= self.limit {
            self.dropped = self.dropped.saturating_add(1);
            return false;
        }
        self.items.push(row);
        true
    }

    #[must_use]
    pub fn as_slice(&self) -> &[usize] {
        &self.items
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Neighbors discarded since the last clear.
    #[must_use]
    pub const fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.items.iter().copied()
    }
}

/// Scalar state of one agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentData {
    pub position: Vec3,
    pub velocity: Vec3,
    pub acceleration: Vec3,
}

impl AgentData {
    #[must_use]
    pub const fn new(position: Vec3, velocity: Vec3) -> Self {
        Self {
            position,
            velocity,
            acceleration: Vec3::ZERO,
        }
    }
}

/// Collection of per-agent columns for hot-path iteration.
#[derive(Debug, Default)]
pub struct AgentColumns {
    positions: Vec<Vec3>,
    velocities: Vec<Vec3>,
    accelerations: Vec<Vec3>,
    neighbors: Vec<NeighborList>,
}

impl AgentColumns {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: Vec::with_capacity(capacity),
            velocities: Vec::with_capacity(capacity),
            accelerations: Vec::with_capacity(capacity),
            neighbors: Vec::with_capacity(capacity),
        }
    }

    /// Number of active rows in the columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reserve(&mut self, additional: usize) {
        self.positions.reserve(additional);
        self.velocities.reserve(additional);
        self.accelerations.reserve(additional);
        self.neighbors.reserve(additional);
    }

    /// Remove all rows while retaining capacity.
    pub fn clear(&mut self) {
        self.positions.clear();
        self.velocities.clear();
        self.accelerations.clear();
        self.neighbors.clear();
    }

    /// Push a new row with an empty neighbor list bounded by `neighbor_limit`.
    pub fn push(&mut self, agent: AgentData, neighbor_limit: usize) {
        self.positions.push(agent.position);
        self.velocities.push(agent.velocity);
        self.accelerations.push(agent.acceleration);
        self.neighbors.push(NeighborList::with_limit(neighbor_limit));
        self.debug_assert_coherent();
    }

    /// Swap-remove the row at `index` and return its scalar fields.
    pub fn swap_remove(&mut self, index: usize) -> AgentData {
        let removed = AgentData {
            position: self.positions.swap_remove(index),
            velocity: self.velocities.swap_remove(index),
            acceleration: self.accelerations.swap_remove(index),
        };
        self.neighbors.swap_remove(index);
        self.debug_assert_coherent();
        removed
    }

    pub fn truncate(&mut self, len: usize) {
        self.positions.truncate(len);
        self.velocities.truncate(len);
        self.accelerations.truncate(len);
        self.neighbors.truncate(len);
        self.debug_assert_coherent();
    }

    /// Return a copy of the scalar fields at `index`.
    #[must_use]
    pub fn snapshot(&self, index: usize) -> AgentData {
        AgentData {
            position: self.positions[index],
            velocity: self.velocities[index],
            acceleration: self.accelerations[index],
        }
    }

    #[must_use]
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    #[must_use]
    pub fn positions_mut(&mut self) -> &mut [Vec3] {
        &mut self.positions
    }

    #[must_use]
    pub fn velocities(&self) -> &[Vec3] {
        &self.velocities
    }

    #[must_use]
    pub fn velocities_mut(&mut self) -> &mut [Vec3] {
        &mut self.velocities
    }

    #[must_use]
    pub fn accelerations(&self) -> &[Vec3] {
        &self.accelerations
    }

    #[must_use]
    pub fn accelerations_mut(&mut self) -> &mut [Vec3] {
        &mut self.accelerations
    }

    /// Neighbor rows found by the last query, indexed like the other columns.
    #[must_use]
    pub fn neighbors(&self) -> &[NeighborList] {
        &self.neighbors
    }

    /// Read-only kinematics next to the writable query outputs.
    pub fn query_split(&mut self) -> (AgentView<'_>, &mut [NeighborList], &mut [Vec3]) {
        (
            AgentView::new(&self.positions, &self.velocities),
            &mut self.neighbors,
            &mut self.accelerations,
        )
    }

    /// Mutable kinematics for the integrator.
    pub fn kinematics_mut(&mut self) -> (&mut [Vec3], &mut [Vec3], &mut [Vec3]) {
        (
            &mut self.positions,
            &mut self.velocities,
            &mut self.accelerations,
        )
    }

    #[inline]
    fn debug_assert_coherent(&self) {
        debug_assert_eq!(self.positions.len(), self.velocities.len());
        debug_assert_eq!(self.positions.len(), self.accelerations.len());
        debug_assert_eq!(self.positions.len(), self.neighbors.len());
    }
}

/// Dense SoA storage with generational handles for agent access.
#[derive(Debug)]
pub struct AgentArena {
    slots: SlotMap<AgentId, usize>,
    handles: Vec<AgentId>,
    columns: AgentColumns,
}

impl Default for AgentArena {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentArena {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: SlotMap::with_key(),
            handles: Vec::new(),
            columns: AgentColumns::new(),
        }
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: SlotMap::with_capacity_and_key(capacity),
            handles: Vec::with_capacity(capacity),
            columns: AgentColumns::with_capacity(capacity),
        }
    }

    /// Number of active agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.slots.reserve(additional);
        self.handles.reserve(additional);
        self.columns.reserve(additional);
    }

    /// Handles in dense row order.
    #[must_use]
    pub fn handles(&self) -> &[AgentId] {
        &self.handles
    }

    #[must_use]
    pub fn columns(&self) -> &AgentColumns {
        &self.columns
    }

    #[must_use]
    pub fn columns_mut(&mut self) -> &mut AgentColumns {
        &mut self.columns
    }

    /// Returns the dense index for `id`, if present.
    #[must_use]
    pub fn index_of(&self, id: AgentId) -> Option<usize> {
        self.slots.get(id).copied()
    }

    #[must_use]
    pub fn contains(&self, id: AgentId) -> bool {
        self.slots.contains_key(id)
    }

    /// Insert a new agent and return its handle.
    pub fn insert(&mut self, agent: AgentData, neighbor_limit: usize) -> AgentId {
        let index = self.columns.len();
        self.columns.push(agent, neighbor_limit);
        let id = self.slots.insert(index);
        self.handles.push(id);
        id
    }

    /// Remove `id` returning its scalar data if it was present.
    pub fn remove(&mut self, id: AgentId) -> Option<AgentData> {
        let index = self.slots.remove(id)?;
        let removed = self.columns.swap_remove(index);
        let removed_handle = self.handles.swap_remove(index);
        debug_assert_eq!(removed_handle, id);
        if index < self.handles.len() {
            let moved = self.handles[index];
            if let Some(slot) = self.slots.get_mut(moved) {
                *slot = index;
            }
        }
        Some(removed)
    }

    /// Drop every agent past the first `len` rows.
    pub fn truncate(&mut self, len: usize) -> usize {
        if len >= self.handles.len() {
            return 0;
        }
        for id in self.handles.drain(len..) {
            self.slots.remove(id);
        }
        let removed = self.columns.len() - len;
        self.columns.truncate(len);
        removed
    }

    #[must_use]
    pub fn snapshot(&self, id: AgentId) -> Option<AgentData> {
        let index = self.index_of(id)?;
        Some(self.columns.snapshot(index))
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.handles.clear();
        self.columns.clear();
    }
}

/// Errors that can occur when constructing or stepping a world.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Grid sizing or query arguments were rejected by the index.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// The worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neighbor_list_drops_past_limit() {
        let mut list = NeighborList::with_limit(3);
        for row in 0..5 {
            list.push(row);
        }
        assert_eq!(list.as_slice(), &[0, 1, 2]);
        assert_eq!(list.dropped(), 2);
        list.reset(20);
        assert!(list.is_empty());
        assert_eq!(list.dropped(), 0);
        for row in 0..15 {
            assert!(list.push(row));
        }
        assert_eq!(list.len(), 15);
    }

    #[test]
    fn arena_remove_keeps_handles_coherent() {
        let mut arena = AgentArena::new();
        let ids: Vec<_> = (0..4)
            .map(|i| {
                arena.insert(
                    AgentData::new(Vec3::splat(i as f32), Vec3::X),
                    NEIGHBOR_INLINE_CAPACITY,
                )
            })
            .collect();
        let removed = arena.remove(ids[1]).expect("agent present");
        assert_eq!(removed.position, Vec3::splat(1.0));
        assert!(!arena.contains(ids[1]));
        let moved = arena.index_of(ids[3]).expect("moved agent present");
        assert_eq!(arena.columns().positions()[moved], Vec3::splat(3.0));
        assert_eq!(arena.truncate(1), 2);
        assert_eq!(arena.len(), 1);
        assert!(arena.contains(ids[0]));
        assert!(!arena.contains(ids[3]));
    }

    #[test]
    fn tick_advances() {
        assert_eq!(Tick::zero().next().next(), Tick(2));
    }
}
