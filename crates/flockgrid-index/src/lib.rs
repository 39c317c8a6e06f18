//! Spatial indexing primitives for 3D neighborhood queries.
//!
//! The crate provides a uniform hash grid keyed by integer cell coordinates, the merged-cell
//! window cache used to amortise overlapping neighbor scans, and the batch sizing heuristic
//! shared by the cell-based query strategies.

mod batch;
mod coord;
mod domain;
mod grid;
mod merged;

pub use batch::{BatchScheduler, DEFAULT_BATCH_PACK, partition_mut, recommended_batch_size};
pub use coord::{CellCoord, MergedCellRange};
pub use domain::{Boundary, DomainBox};
pub use grid::{GridInfo, HashGrid, MAX_CELLS_PER_AXIS, MAX_GRID_CELLS, ParallelWriter};
pub use merged::{BufferRange, MergedCell, MergedNeighborList};

use glam::Vec3;
use thiserror::Error;

/// Errors emitted by spatial index construction and lookups.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexError {
    /// The domain box has a degenerate or inverted axis.
    #[error("invalid bounds: {0}")]
    InvalidBounds(&'static str),
    /// A sizing or query argument cannot be used (non-positive radius, density, merge size).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A position fell outside the grid domain where containment was required.
    #[error("position {position} lies outside the grid domain")]
    OutOfRange { position: Vec3 },
}
