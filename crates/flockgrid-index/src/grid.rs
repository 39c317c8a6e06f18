//! Uniform hash grid mapping cell coordinates to the values inserted into them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use glam::Vec3;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{Boundary, CellCoord, DomainBox, IndexError, MergedCellRange};

/// Upper bound on cells per axis; finer grids are rejected at sizing time.
pub const MAX_CELLS_PER_AXIS: i32 = 4096;

/// Upper bound on the total logical cell count of one grid.
pub const MAX_GRID_CELLS: usize = 1 << 24;

const SHARD_BITS: u32 = 4;
const SHARD_COUNT: usize = 1 << SHARD_BITS;
const SEARCH_MAX_SLACK: f32 = 1.01;
const MIN_DENSITY_CELLS: i32 = 4;

/// Derived sizing state for one grid generation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridInfo {
    grid_size: CellCoord,
    domain: DomainBox,
    cell_size: Vec3,
    cell_size_inv: Vec3,
    r_search_max: f32,
    r_search_margin: f32,
}

impl Default for GridInfo {
    fn default() -> Self {
        let domain = DomainBox::unit();
        Self {
            grid_size: CellCoord::ONE,
            domain,
            cell_size: domain.size(),
            cell_size_inv: domain.size_inv(),
            r_search_max: domain.diagonal() * SEARCH_MAX_SLACK,
            r_search_margin: domain.diagonal(),
        }
    }
}

impl GridInfo {
    /// Sizing with an explicit cell count per axis.
    pub fn new(domain: DomainBox, grid_size: CellCoord) -> Result<Self, IndexError> {
        if grid_size.min_element() < 1 {
            return Err(IndexError::InvalidArgument(
                "grid must have at least one cell per axis",
            ));
        }
        if grid_size.x > MAX_CELLS_PER_AXIS
            || grid_size.y > MAX_CELLS_PER_AXIS
            || grid_size.z > MAX_CELLS_PER_AXIS
        {
            return Err(IndexError::InvalidArgument(
                "grid resolution exceeds the per-axis cell limit",
            ));
        }
        if grid_size.volume() > MAX_GRID_CELLS {
            return Err(IndexError::InvalidArgument(
                "grid resolution exceeds the total cell limit",
            ));
        }
        let cells = grid_size.as_vec3();
        let cell_size = domain.size() / cells;
        Ok(Self {
            grid_size,
            domain,
            cell_size,
            cell_size_inv: cells * domain.size_inv(),
            r_search_max: domain.diagonal() * SEARCH_MAX_SLACK,
            r_search_margin: cell_size.length(),
        })
    }

    /// Sizing so that cells hold roughly `n_per_cell` of `n_total` uniformly spread values.
    ///
    /// Every axis keeps at least four cells. Dense targets coarsen until the grid fits in
    /// [`MAX_GRID_CELLS`].
    pub fn with_density(
        domain: DomainBox,
        n_total: usize,
        n_per_cell: f32,
    ) -> Result<Self, IndexError> {
        if n_total == 0 {
            return Err(IndexError::InvalidArgument("n_total must be positive"));
        }
        if !(n_per_cell > 0.0) || !n_per_cell.is_finite() {
            return Err(IndexError::InvalidArgument("n_per_cell must be positive"));
        }
        let target_cells = (n_total as f32 / n_per_cell).clamp(1.0, MAX_GRID_CELLS as f32);
        let size = domain.size();
        let fit = |edge: f32| {
            let per_axis = |extent: f32| {
                let cells = (extent / edge).round();
                (cells.min(MAX_CELLS_PER_AXIS as f32) as i32).max(MIN_DENSITY_CELLS)
            };
            CellCoord::new(per_axis(size.x), per_axis(size.y), per_axis(size.z))
        };
        let mut edge = (domain.volume() / target_cells).cbrt();
        let mut grid_size = fit(edge);
        // Rounding and the per-axis floor can overshoot; the floor alone always fits.
        while grid_size.volume() > MAX_GRID_CELLS {
            edge *= 1.05;
            grid_size = fit(edge);
        }
        Self::new(domain, grid_size)
    }

    /// Sizing so that the cell edge does not exceed `r_search` on any axis.
    ///
    /// Radii too small for [`MAX_CELLS_PER_AXIS`] or [`MAX_GRID_CELLS`] are rejected.
    pub fn with_range(domain: DomainBox, r_search: f32) -> Result<Self, IndexError> {
        if !(r_search > 0.0) || !r_search.is_finite() {
            return Err(IndexError::InvalidArgument("search radius must be positive"));
        }
        let per_axis = |extent: f32| {
            let cells = (extent / r_search).floor() + 1.0;
            if cells > MAX_CELLS_PER_AXIS as f32 {
                MAX_CELLS_PER_AXIS + 1
            } else {
                (cells as i32).max(1)
            }
        };
        let size = domain.size();
        Self::new(
            domain,
            CellCoord::new(per_axis(size.x), per_axis(size.y), per_axis(size.z)),
        )
    }

    #[must_use]
    pub const fn grid_size(&self) -> CellCoord {
        self.grid_size
    }

    #[must_use]
    pub const fn domain(&self) -> &DomainBox {
        &self.domain
    }

    #[must_use]
    pub const fn cell_size(&self) -> Vec3 {
        self.cell_size
    }

    #[must_use]
    pub const fn cell_size_inv(&self) -> Vec3 {
        self.cell_size_inv
    }

    /// Radius beyond which a query degenerates into a full-grid scan.
    #[must_use]
    pub const fn r_search_max(&self) -> f32 {
        self.r_search_max
    }

    /// Length of one cell diagonal.
    #[must_use]
    pub const fn r_search_margin(&self) -> f32 {
        self.r_search_margin
    }

    /// Total number of logical cells.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.grid_size.volume()
    }

    /// True when `coord` addresses a cell of this grid.
    #[must_use]
    pub fn contains_cell(&self, coord: CellCoord) -> bool {
        coord.within(CellCoord::ZERO, self.grid_size)
    }

    /// Cell owning `pos`, without any containment check.
    ///
    /// Positions inside the domain always map into the grid; the upper clamp only absorbs
    /// float rounding right below the exclusive face.
    #[inline]
    #[must_use]
    pub fn cell_of(&self, pos: Vec3) -> CellCoord {
        let raw = CellCoord::floor((pos - self.domain.lo()) * self.cell_size_inv);
        if self.domain.is_inside(pos) {
            raw.min(self.grid_size - CellCoord::ONE)
        } else {
            raw
        }
    }

    /// Cell owning `pos`. Debug builds reject positions outside the domain.
    pub fn get_index(&self, pos: Vec3) -> Result<CellCoord, IndexError> {
        if cfg!(debug_assertions) && !self.domain.is_inside(pos) {
            return Err(IndexError::OutOfRange { position: pos });
        }
        Ok(self.cell_of(pos))
    }

    /// Cells to expand on each side so that a radius `r_search` is fully covered.
    #[must_use]
    pub fn get_index_range(&self, r_search: f32) -> CellCoord {
        let r = r_search.max(0.0).min(self.r_search_max);
        CellCoord::floor(Vec3::splat(r) * self.cell_size_inv) + CellCoord::ONE
    }
}

type CellMap<T> = HashMap<CellCoord, Vec<T>>;

fn scan_key(coord: &CellCoord) -> (i32, i32, i32) {
    (coord.z, coord.y, coord.x)
}

#[inline]
fn shard_of(coord: CellCoord) -> usize {
    let h = (coord.x as u32).wrapping_mul(0x9E37_79B1)
        ^ (coord.y as u32).wrapping_mul(0x85EB_CA77)
        ^ (coord.z as u32).wrapping_mul(0xC2B2_AE3D);
    (h >> (32 - SHARD_BITS)) as usize
}

/// Maps a window index along one axis into the grid, or rejects it.
///
/// Periodic axes only accept wrapped indices that land in the part of the grid the
/// unwrapped window `[lo, hi]` did not already sweep.
#[inline]
fn wrap_axis(index: i32, lo: i32, hi: i32, size: i32, periodic: bool) -> Option<i32> {
    if index < 0 {
        if !periodic {
            return None;
        }
        let wrapped = index + size;
        (wrapped > hi && wrapped < size).then_some(wrapped)
    } else if index >= size {
        if !periodic {
            return None;
        }
        let wrapped = index - size;
        (wrapped >= 0 && wrapped < lo).then_some(wrapped)
    } else {
        Some(index)
    }
}

/// Multi-valued map from cell coordinates to values, rebuilt every tick.
///
/// Cell storage is sharded so the parallel writer can lock shards independently. Clearing
/// keeps every allocation alive for the next rebuild.
#[derive(Debug)]
pub struct HashGrid<T> {
    info: GridInfo,
    shards: Vec<CellMap<T>>,
    len: usize,
}

impl<T> Default for HashGrid<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HashGrid<T> {
    /// Create an empty single-cell grid over the unit box.
    #[must_use]
    pub fn new() -> Self {
        Self::with_info(GridInfo::default())
    }

    #[must_use]
    pub fn with_info(info: GridInfo) -> Self {
        Self {
            info,
            shards: (0..SHARD_COUNT).map(|_| HashMap::new()).collect(),
            len: 0,
        }
    }

    #[must_use]
    pub const fn info(&self) -> &GridInfo {
        &self.info
    }

    #[must_use]
    pub const fn grid_size(&self) -> CellCoord {
        self.info.grid_size
    }

    #[must_use]
    pub const fn domain(&self) -> &DomainBox {
        &self.info.domain
    }

    /// Number of stored values.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size the grid for `n_total` values at roughly `n_per_cell` per cell, then clear it.
    pub fn init_domain_with_density(
        &mut self,
        domain: DomainBox,
        n_total: usize,
        n_per_cell: f32,
    ) -> Result<(), IndexError> {
        let info = GridInfo::with_density(domain, n_total, n_per_cell)?;
        self.reset(info, n_total);
        Ok(())
    }

    /// Size the grid so the cell edge stays at or below `r_search`, then clear it.
    pub fn init_domain_with_range(
        &mut self,
        domain: DomainBox,
        n_total: usize,
        r_search: f32,
    ) -> Result<(), IndexError> {
        let info = GridInfo::with_range(domain, r_search)?;
        self.reset(info, n_total);
        Ok(())
    }

    /// Install a new sizing and drop all stored values.
    pub fn reset(&mut self, info: GridInfo, n_hint: usize) {
        if info.grid_size != self.info.grid_size {
            for shard in &mut self.shards {
                shard.clear();
            }
        } else {
            self.clear();
        }
        self.info = info;
        self.len = 0;
        let expected_cells = n_hint.min(info.cell_count()) / SHARD_COUNT + 1;
        for shard in &mut self.shards {
            shard.reserve(expected_cells.saturating_sub(shard.len()));
        }
    }

    /// Remove every value while keeping cell allocations.
    pub fn clear(&mut self) {
        for shard in &mut self.shards {
            for values in shard.values_mut() {
                values.clear();
            }
        }
        self.len = 0;
    }

    #[inline]
    fn insert(&mut self, coord: CellCoord, value: T) {
        self.shards[shard_of(coord)]
            .entry(coord)
            .or_default()
            .push(value);
        self.len += 1;
    }

    /// Insert `value` under the cell owning `pos`.
    ///
    /// The position must lie inside the domain; debug builds assert it.
    pub fn add(&mut self, pos: Vec3, value: T) {
        debug_assert!(
            self.info.domain.is_inside(pos),
            "HashGrid::add called with {pos} outside the domain"
        );
        let coord = self.info.cell_of(pos);
        self.insert(coord, value);
    }

    /// Insert `value` if `pos` lies inside the domain. Returns whether it was stored.
    pub fn try_add(&mut self, pos: Vec3, value: T) -> bool {
        if !self.info.domain.is_inside(pos) {
            return false;
        }
        let coord = self.info.cell_of(pos);
        self.insert(coord, value);
        true
    }

    /// As [`HashGrid::try_add`], wrapping `pos` along periodic axes first.
    pub fn try_add_with_boundary(&mut self, pos: Vec3, value: T, boundary: Boundary) -> bool {
        let pos = self.info.domain.apply_periodic(pos, boundary);
        self.try_add(pos, value)
    }

    /// Run `fill` with a writer that accepts concurrent insertions.
    ///
    /// The grid is unavailable for reads while `fill` runs; once it returns every insertion
    /// is visible. Values inserted by the writer are counted into [`HashGrid::len`].
    /// If `fill` panics the shards still return to the grid, holding whatever was inserted.
    pub fn with_parallel_writer<R>(&mut self, fill: impl FnOnce(&ParallelWriter<'_, T>) -> R) -> R {
        let Self { info, shards, len } = self;
        let taken = std::mem::take(shards);
        let writer = ParallelWriter {
            info: &*info,
            shards: taken.into_iter().map(Mutex::new).collect(),
            inserted: AtomicUsize::new(0),
            home: shards,
            len,
        };
        fill(&writer)
    }

    /// Sort the values of every cell so iteration order no longer depends on insertion order.
    pub fn sort_cells(&mut self)
    where
        T: Ord,
    {
        for shard in &mut self.shards {
            for values in shard.values_mut() {
                values.sort_unstable();
            }
        }
    }

    /// Values stored in `coord`; empty for unknown or out-of-grid cells.
    #[must_use]
    pub fn get_values_in_cell(&self, coord: CellCoord) -> &[T] {
        self.shards[shard_of(coord)]
            .get(&coord)
            .map_or(&[], Vec::as_slice)
    }

    /// Every logical cell in z-y-x scan order.
    pub fn get_grid_index_list(&self, out: &mut Vec<CellCoord>) {
        out.clear();
        let size = self.info.grid_size;
        out.reserve(self.info.cell_count());
        for z in 0..size.z {
            for y in 0..size.y {
                for x in 0..size.x {
                    out.push(CellCoord::new(x, y, z));
                }
            }
        }
    }

    /// Occupied cells in z-y-x scan order.
    ///
    /// Only the stored cells are visited, so the cost follows occupancy rather than
    /// resolution.
    pub fn get_contains_index_list(&self, out: &mut Vec<CellCoord>) {
        out.clear();
        if self.is_empty() {
            return;
        }
        out.extend(self.shards.iter().flat_map(|shard| {
            shard
                .iter()
                .filter(|(_, values)| !values.is_empty())
                .map(|(&coord, _)| coord)
        }));
        out.sort_unstable_by_key(scan_key);
    }

    /// Partition the grid into `n_merge`-cube macro-cells (clipped at the upper faces) and
    /// keep those with at least one occupied micro-cell.
    pub fn get_contains_merged_cell_list(
        &self,
        n_merge: usize,
        out: &mut Vec<MergedCellRange>,
    ) -> Result<(), IndexError> {
        out.clear();
        if n_merge == 0 {
            return Err(IndexError::InvalidArgument("merge size must be positive"));
        }
        if self.is_empty() {
            return Ok(());
        }
        let size = self.info.grid_size;
        let step = i32::try_from(n_merge)
            .unwrap_or(i32::MAX)
            .min(size.x.max(size.y).max(size.z));
        let mut origins = Vec::new();
        self.get_contains_index_list(&mut origins);
        for coord in &mut origins {
            *coord = CellCoord::new(
                coord.x / step * step,
                coord.y / step * step,
                coord.z / step * step,
            );
        }
        origins.sort_unstable_by_key(scan_key);
        origins.dedup();
        out.extend(
            origins
                .into_iter()
                .map(|lo| MergedCellRange::new(lo, (lo + CellCoord::splat(step)).min(size))),
        );
        Ok(())
    }

    /// Visit every in-grid cell of the window `[origin - range, origin + range]` around
    /// `origin`, passing the cell coordinate and its values.
    pub fn visit_neighbor_cells(
        &self,
        origin: CellCoord,
        r_search: f32,
        boundary: Boundary,
        mut visit: impl FnMut(CellCoord, &[T]),
    ) {
        if self.is_empty() {
            return;
        }
        let range = self.info.get_index_range(r_search);
        let lo = origin - range;
        let hi = origin + range;
        let size = self.info.grid_size;
        for z in lo.z..=hi.z {
            let Some(wz) = wrap_axis(z, lo.z, hi.z, size.z, boundary.is_periodic(2)) else {
                continue;
            };
            for y in lo.y..=hi.y {
                let Some(wy) = wrap_axis(y, lo.y, hi.y, size.y, boundary.is_periodic(1)) else {
                    continue;
                };
                for x in lo.x..=hi.x {
                    let Some(wx) = wrap_axis(x, lo.x, hi.x, size.x, boundary.is_periodic(0))
                    else {
                        continue;
                    };
                    let coord = CellCoord::new(wx, wy, wz);
                    let values = self.get_values_in_cell(coord);
                    if !values.is_empty() {
                        visit(coord, values);
                    }
                }
            }
        }
    }

    /// Coordinates of every in-grid cell within `r_search` of `origin`, occupied or not.
    pub fn get_search_index_list(
        &self,
        origin: CellCoord,
        r_search: f32,
        boundary: Boundary,
        out: &mut Vec<CellCoord>,
    ) {
        out.clear();
        let range = self.info.get_index_range(r_search);
        let lo = origin - range;
        let hi = origin + range;
        let size = self.info.grid_size;
        for z in lo.z..=hi.z {
            let Some(wz) = wrap_axis(z, lo.z, hi.z, size.z, boundary.is_periodic(2)) else {
                continue;
            };
            for y in lo.y..=hi.y {
                let Some(wy) = wrap_axis(y, lo.y, hi.y, size.y, boundary.is_periodic(1)) else {
                    continue;
                };
                for x in lo.x..=hi.x {
                    if let Some(wx) = wrap_axis(x, lo.x, hi.x, size.x, boundary.is_periodic(0)) {
                        out.push(CellCoord::new(wx, wy, wz));
                    }
                }
            }
        }
    }
}

impl<T: Copy> HashGrid<T> {
    /// Collect every value stored within `r_search` (in whole cells) of `origin`.
    ///
    /// `out` is cleared first; it stays empty when the grid holds nothing.
    pub fn get_neighbor_list(
        &self,
        origin: CellCoord,
        r_search: f32,
        boundary: Boundary,
        out: &mut Vec<T>,
    ) {
        out.clear();
        self.visit_neighbor_cells(origin, r_search, boundary, |_, values| {
            out.extend_from_slice(values);
        });
    }

    /// As [`HashGrid::get_neighbor_list`], centred on the cell owning `pos`.
    pub fn get_neighbor_list_at(
        &self,
        pos: Vec3,
        r_search: f32,
        boundary: Boundary,
        out: &mut Vec<T>,
    ) {
        let pos = self.info.domain.apply_periodic(pos, boundary);
        self.get_neighbor_list(self.info.cell_of(pos), r_search, boundary, out);
    }
}

/// Shared handle for inserting into a [`HashGrid`] from many threads at once.
///
/// Obtained through [`HashGrid::with_parallel_writer`]. Insertion only; reads are not
/// possible until the writer is released. Dropping the writer hands the shards back to the
/// grid, unwinding included.
#[derive(Debug)]
pub struct ParallelWriter<'g, T> {
    info: &'g GridInfo,
    shards: Vec<Mutex<CellMap<T>>>,
    inserted: AtomicUsize,
    home: &'g mut Vec<CellMap<T>>,
    len: &'g mut usize,
}

impl<T> Drop for ParallelWriter<'_, T> {
    fn drop(&mut self) {
        *self.home = std::mem::take(&mut self.shards)
            .into_iter()
            .map(Mutex::into_inner)
            .collect();
        *self.len += *self.inserted.get_mut();
    }
}

impl<T> ParallelWriter<'_, T> {
    #[must_use]
    pub fn info(&self) -> &GridInfo {
        self.info
    }

    #[inline]
    fn insert(&self, coord: CellCoord, value: T) {
        self.shards[shard_of(coord)]
            .lock()
            .entry(coord)
            .or_default()
            .push(value);
        self.inserted.fetch_add(1, Ordering::Relaxed);
    }

    /// Insert `value` under the cell owning `pos`; debug builds assert containment.
    pub fn add(&self, pos: Vec3, value: T) {
        debug_assert!(
            self.info.domain().is_inside(pos),
            "ParallelWriter::add called with {pos} outside the domain"
        );
        self.insert(self.info.cell_of(pos), value);
    }

    /// Insert `value` if `pos` lies inside the domain.
    pub fn try_add(&self, pos: Vec3, value: T) -> bool {
        if !self.info.domain().is_inside(pos) {
            return false;
        }
        self.insert(self.info.cell_of(pos), value);
        true
    }

    /// As [`ParallelWriter::try_add`], wrapping `pos` along periodic axes first.
    pub fn try_add_with_boundary(&self, pos: Vec3, value: T, boundary: Boundary) -> bool {
        self.try_add(self.info.domain().apply_periodic(pos, boundary), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng, rngs::SmallRng};
    use rayon::prelude::*;

    fn ten_box() -> DomainBox {
        DomainBox::centered_cube(5.0).expect("valid box")
    }

    fn random_positions(count: usize, seed: u64) -> Vec<Vec3> {
        let mut rng = SmallRng::seed_from_u64(seed);
        (0..count)
            .map(|_| {
                Vec3::new(
                    rng.random_range(-5.0..5.0),
                    rng.random_range(-5.0..5.0),
                    rng.random_range(-5.0..5.0),
                )
            })
            .collect()
    }

    fn build(positions: &[Vec3], r: f32) -> HashGrid<usize> {
        let mut grid = HashGrid::new();
        grid.init_domain_with_range(ten_box(), positions.len(), r)
            .expect("valid sizing");
        for (idx, &pos) in positions.iter().enumerate() {
            assert!(grid.try_add(pos, idx));
        }
        grid
    }

    #[test]
    fn range_sizing_matches_search_radius() {
        let mut grid = HashGrid::<usize>::new();
        grid.init_domain_with_range(ten_box(), 200, 1.2)
            .expect("valid sizing");
        assert_eq!(grid.grid_size(), CellCoord::splat(9));
        let cell = grid.info().cell_size();
        assert!((cell.x - 10.0 / 9.0).abs() < 1e-4);
        assert!(grid.grid_size().min_element() >= 4);
    }

    #[test]
    fn density_sizing_keeps_four_cells_floor() {
        let mut grid = HashGrid::<usize>::new();
        grid.init_domain_with_density(ten_box(), 10, 8.0)
            .expect("valid sizing");
        assert_eq!(grid.grid_size(), CellCoord::splat(4));

        grid.init_domain_with_density(ten_box(), 8_000, 1.0)
            .expect("valid sizing");
        assert_eq!(grid.grid_size(), CellCoord::splat(20));
    }

    #[test]
    fn sizing_rejects_bad_arguments() {
        let mut grid = HashGrid::<usize>::new();
        assert!(matches!(
            grid.init_domain_with_range(ten_box(), 10, 0.0),
            Err(IndexError::InvalidArgument(_))
        ));
        assert!(grid.init_domain_with_range(ten_box(), 10, -1.0).is_err());
        assert!(grid.init_domain_with_density(ten_box(), 0, 1.0).is_err());
        assert!(grid.init_domain_with_density(ten_box(), 10, 0.0).is_err());
        assert!(grid.init_domain_with_range(ten_box(), 10, 1e-6).is_err());
    }

    #[test]
    fn sizing_caps_total_cell_count() {
        let mut grid = HashGrid::<usize>::new();
        // 501 cells per axis passes the axis limit but not the total.
        assert!(matches!(
            grid.init_domain_with_range(ten_box(), 10, 0.02),
            Err(IndexError::InvalidArgument(_))
        ));

        grid.init_domain_with_density(ten_box(), 1_000_000_000, 1.0)
            .expect("dense targets coarsen instead of failing");
        assert!(grid.info().cell_count() <= MAX_GRID_CELLS);
        assert!(grid.grid_size().min_element() >= MIN_DENSITY_CELLS);

        let slab = DomainBox::new(Vec3::new(0.0, 0.0, 0.0), Vec3::new(4_000.0, 4_000.0, 0.01))
            .expect("valid box");
        grid.init_domain_with_density(slab, usize::MAX, 0.5)
            .expect("floored axes still fit");
        assert!(grid.info().cell_count() <= MAX_GRID_CELLS);
    }

    #[test]
    fn grid_index_list_walks_every_cell_z_major() {
        let mut grid = HashGrid::<usize>::new();
        grid.init_domain_with_range(ten_box(), 0, 4.0)
            .expect("valid sizing");
        assert_eq!(grid.grid_size(), CellCoord::splat(3));

        let mut cells = Vec::new();
        grid.get_grid_index_list(&mut cells);
        assert_eq!(cells.len(), grid.info().cell_count());
        assert_eq!(cells[0], CellCoord::ZERO);
        assert_eq!(cells[1], CellCoord::new(1, 0, 0));
        assert_eq!(cells[3], CellCoord::new(0, 1, 0));
        assert_eq!(cells[9], CellCoord::new(0, 0, 1));
        assert!(cells.windows(2).all(|w| scan_key(&w[0]) < scan_key(&w[1])));
    }

    #[test]
    fn upper_face_is_rejected() {
        let mut grid = HashGrid::new();
        grid.init_domain_with_range(ten_box(), 4, 1.2)
            .expect("valid sizing");
        assert!(!grid.try_add(Vec3::new(5.0, 0.0, 0.0), 0_usize));
        assert!(grid.try_add(Vec3::new(-5.0, 0.0, 0.0), 1));
        assert!(grid.try_add(Vec3::new(4.999_999, 4.999_999, 4.999_999), 2));
        assert_eq!(grid.len(), 2);
        assert_eq!(
            grid.get_values_in_cell(CellCoord::splat(8)),
            &[2],
            "positions right below the face stay in the last cell"
        );
    }

    #[test]
    fn periodic_insert_wraps_first() {
        let mut grid = HashGrid::new();
        grid.init_domain_with_range(ten_box(), 4, 1.2)
            .expect("valid sizing");
        assert!(grid.try_add_with_boundary(Vec3::new(5.5, 0.0, 0.0), 7_usize, Boundary::PERIODIC_X));
        assert_eq!(grid.get_values_in_cell(CellCoord::new(0, 4, 4)), &[7]);
    }

    #[test]
    fn get_index_reports_out_of_range_in_debug() {
        let mut grid = HashGrid::<usize>::new();
        grid.init_domain_with_range(ten_box(), 4, 1.2)
            .expect("valid sizing");
        assert_eq!(
            grid.info().get_index(Vec3::splat(-5.0)),
            Ok(CellCoord::ZERO)
        );
        if cfg!(debug_assertions) {
            assert!(matches!(
                grid.info().get_index(Vec3::splat(6.0)),
                Err(IndexError::OutOfRange { .. })
            ));
        }
    }

    #[test]
    fn index_range_is_monotonic() {
        let grid = build(&[], 0.7);
        let info = grid.info();
        let radii = [0.0, 0.1, 0.5, 0.7, 1.2, 3.0, 5.0, 20.0, 1e6];
        for pair in radii.windows(2) {
            let (a, b) = (info.get_index_range(pair[0]), info.get_index_range(pair[1]));
            assert!(a.all_le(b), "range({}) = {a} exceeds range({}) = {b}", pair[0], pair[1]);
        }
        assert_eq!(
            info.get_index_range(1e6),
            info.get_index_range(info.r_search_max())
        );
    }

    #[test]
    fn rebuild_is_idempotent() {
        let positions = random_positions(300, 11);
        let mut grid = build(&positions, 1.2);
        let mut first = Vec::new();
        grid.get_contains_index_list(&mut first);

        grid.clear();
        for (idx, &pos) in positions.iter().enumerate() {
            grid.try_add(pos, idx);
        }
        let mut second = Vec::new();
        grid.get_contains_index_list(&mut second);
        assert_eq!(first, second);
        assert_eq!(grid.len(), positions.len());
    }

    #[test]
    fn stored_values_live_in_their_own_cell() {
        let positions = random_positions(400, 3);
        let grid = build(&positions, 0.9);
        let mut cells = Vec::new();
        grid.get_contains_index_list(&mut cells);
        let mut seen = 0;
        for coord in cells {
            for &idx in grid.get_values_in_cell(coord) {
                assert_eq!(grid.info().get_index(positions[idx]), Ok(coord));
                seen += 1;
            }
        }
        assert_eq!(seen, positions.len());
    }

    #[test]
    fn contains_list_is_z_major_scan_order() {
        let grid = build(
            &[
                Vec3::new(4.0, -4.0, -4.0),
                Vec3::new(-4.0, 4.0, -4.0),
                Vec3::new(-4.0, -4.0, 4.0),
                Vec3::new(-4.0, -4.0, -4.0),
            ],
            2.0,
        );
        let mut cells = Vec::new();
        grid.get_contains_index_list(&mut cells);
        let last = grid.grid_size().x - 1;
        assert_eq!(
            cells,
            vec![
                CellCoord::new(0, 0, 0),
                CellCoord::new(last, 0, 0),
                CellCoord::new(0, last, 0),
                CellCoord::new(0, 0, last),
            ]
        );
    }

    #[test]
    fn neighbor_list_covers_every_value_within_radius() {
        let positions = random_positions(500, 5);
        for r in [0.5_f32, 1.2, 5.0] {
            let grid = build(&positions, r);
            let mut candidates = Vec::new();
            for (idx, &pos) in positions.iter().enumerate().step_by(7) {
                grid.get_neighbor_list_at(pos, r, Boundary::OPEN, &mut candidates);
                for (other, &other_pos) in positions.iter().enumerate() {
                    if pos.distance_squared(other_pos) < r * r {
                        assert!(
                            candidates.contains(&other),
                            "agent {other} missing from window of {idx} at r = {r}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn periodic_window_never_double_counts() {
        let positions = random_positions(200, 9);
        let mut grid = HashGrid::new();
        grid.init_domain_with_range(ten_box(), positions.len(), 3.0)
            .expect("valid sizing");
        for (idx, &pos) in positions.iter().enumerate() {
            grid.try_add(pos, idx);
        }
        let mut cells = Vec::new();
        let mut candidates = Vec::new();
        for r in [3.0_f32, 6.0, 12.0] {
            grid.get_search_index_list(CellCoord::ZERO, r, Boundary::PERIODIC_XYZ, &mut cells);
            let mut dedup = cells.clone();
            dedup.sort_by_key(|c| (c.z, c.y, c.x));
            dedup.dedup();
            assert_eq!(dedup.len(), cells.len(), "duplicate cell at r = {r}");

            grid.get_neighbor_list(CellCoord::ZERO, r, Boundary::PERIODIC_XYZ, &mut candidates);
            let mut ids = candidates.clone();
            ids.sort_unstable();
            ids.dedup();
            assert_eq!(ids.len(), candidates.len());
        }
        grid.get_search_index_list(CellCoord::ZERO, 12.0, Boundary::PERIODIC_XYZ, &mut cells);
        assert_eq!(cells.len(), grid.info().cell_count());
    }

    #[test]
    fn open_window_is_clipped() {
        let grid = build(&random_positions(10, 1), 2.0);
        let mut cells = Vec::new();
        grid.get_search_index_list(CellCoord::ZERO, 2.0, Boundary::OPEN, &mut cells);
        let range = grid.info().get_index_range(2.0);
        assert_eq!(cells.len(), (range + CellCoord::ONE).volume());
        assert!(cells.iter().all(|&c| grid.info().contains_cell(c)));
    }

    #[test]
    fn neighbor_list_is_empty_for_empty_grid() {
        let grid = build(&[], 1.0);
        let mut out = vec![1_usize, 2, 3];
        grid.get_neighbor_list(CellCoord::splat(2), 1.0, Boundary::OPEN, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn merged_cells_partition_and_clip() {
        let positions = random_positions(60, 21);
        let grid = build(&positions, 1.2);
        for n_merge in [1_usize, 2, 4] {
            let mut blocks = Vec::new();
            grid.get_contains_merged_cell_list(n_merge, &mut blocks)
                .expect("positive merge size");
            let mut occupied = Vec::new();
            grid.get_contains_index_list(&mut occupied);
            for &cell in &occupied {
                let owners = blocks.iter().filter(|b| b.contains(cell)).count();
                assert_eq!(owners, 1, "cell {cell} owned by {owners} blocks");
            }
            for block in &blocks {
                assert!(block.hi().all_le(grid.grid_size()));
                assert!(block.size().all_le(CellCoord::splat(n_merge as i32)));
                assert!(block.iter().any(|c| occupied.contains(&c)));
            }
        }
        let mut blocks = Vec::new();
        assert!(grid.get_contains_merged_cell_list(0, &mut blocks).is_err());
    }

    #[test]
    fn merged_blocks_follow_scan_order() {
        // Cell (0, 4, 0) scans before (0, 0, 1) but its block origin scans after.
        let grid = build(
            &[
                Vec3::new(-4.5, 0.0, -4.5),
                Vec3::new(-4.5, -4.5, -3.0),
                Vec3::new(4.5, 4.5, 4.5),
            ],
            1.2,
        );
        let mut blocks = Vec::new();
        grid.get_contains_merged_cell_list(4, &mut blocks)
            .expect("positive merge size");
        assert_eq!(blocks.len(), 3);
        assert!(
            blocks
                .windows(2)
                .all(|w| scan_key(&w[0].lo()) < scan_key(&w[1].lo()))
        );
    }

    #[test]
    fn parallel_writer_hands_shards_back_on_panic() {
        let mut grid = build(&random_positions(50, 5), 1.2);
        let before = grid.len();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            grid.with_parallel_writer(|writer| {
                assert!(writer.try_add(Vec3::ZERO, 999));
                panic!("fill aborted");
            })
        }));
        assert!(outcome.is_err());
        assert_eq!(grid.len(), before + 1);
        let cell = grid.info().cell_of(Vec3::ZERO);
        assert!(grid.get_values_in_cell(cell).contains(&999));
        assert!(grid.try_add(Vec3::new(1.0, 1.0, 1.0), 1_000));
        assert_eq!(grid.len(), before + 2);
    }

    #[test]
    fn parallel_writer_matches_sequential_build() {
        let positions = random_positions(2_000, 17);
        let sequential = build(&positions, 1.2);

        let mut parallel = HashGrid::new();
        parallel
            .init_domain_with_range(ten_box(), positions.len(), 1.2)
            .expect("valid sizing");
        let accepted = parallel.with_parallel_writer(|writer| {
            positions
                .par_iter()
                .enumerate()
                .filter(|&(idx, &pos)| writer.try_add(pos, idx))
                .count()
        });
        assert_eq!(accepted, positions.len());
        assert_eq!(parallel.len(), sequential.len());

        let mut cells = Vec::new();
        sequential.get_contains_index_list(&mut cells);
        let mut parallel_cells = Vec::new();
        parallel.get_contains_index_list(&mut parallel_cells);
        assert_eq!(cells, parallel_cells);
        parallel.sort_cells();
        for coord in cells {
            assert_eq!(
                sequential.get_values_in_cell(coord),
                parallel.get_values_in_cell(coord)
            );
        }
    }
}
