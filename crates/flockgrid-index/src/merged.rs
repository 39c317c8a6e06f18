//! Macro-cell window cache.
//!
//! A macro-cell `[lo, hi)` of micro-cells needs the neighbor window `[lo - R, hi + R)`
//! where `R` is the per-axis index range of the search radius. Every cell of that window
//! is copied into one flat buffer exactly once; the micro-cells' own contents are then
//! plain ranges into that cache, and their resolved neighbor windows are built from it
//! without touching the grid again.
//!
//! The default builder compresses along X. For each `(y, z)` row of the macro-cell it
//! emits one strip holding, slice by slice along X, the `(2R + 1)^2` cells of the row's
//! yz-neighborhood. The neighbor window of micro-cell `x` is then the contiguous strip
//! range from slice `x - R` to slice `x + R`, i.e. the window of `x - 1` advanced by one
//! slice, so a whole row costs `O(width + window)` copies instead of
//! `O(width * window)`.

use std::ops::Range;

use crate::{Boundary, CellCoord, GridInfo, HashGrid, MergedCellRange};

/// A `(start, len)` view into the flat buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferRange {
    pub start: usize,
    pub len: usize,
}

impl BufferRange {
    #[must_use]
    pub const fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    #[must_use]
    pub const fn as_range(self) -> Range<usize> {
        self.start..self.start + self.len
    }
}

/// One micro-cell of a built macro-cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedCell<'a, T> {
    pub coord: CellCoord,
    pub contents: &'a [T],
    pub neighbors: &'a [T],
}

/// Reusable per-worker buffer holding the resolved windows of one macro-cell.
///
/// `ranges[..n_cell]` describe each micro-cell's contents and `ranges[n_cell..]` its
/// neighbor window, both in the macro-cell's linear order.
#[derive(Debug, Clone)]
pub struct MergedNeighborList<T> {
    local: MergedCellRange,
    window: MergedCellRange,
    range: CellCoord,
    buffer: Vec<T>,
    cache: Vec<BufferRange>,
    ranges: Vec<BufferRange>,
    slice_marks: Vec<usize>,
}

impl<T> Default for MergedNeighborList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Grid coordinate backing window cell `coord`, if any.
///
/// Periodic wrapping assumes `2R + 1` does not exceed the grid along that axis; otherwise
/// a micro-cell window can see the same cell twice.
#[inline]
fn resolve_cell(info: &GridInfo, coord: CellCoord, boundary: Boundary) -> Option<CellCoord> {
    let size = info.grid_size();
    let mut out = coord;
    for (axis, (value, extent)) in [
        (&mut out.x, size.x),
        (&mut out.y, size.y),
        (&mut out.z, size.z),
    ]
    .into_iter()
    .enumerate()
    {
        if *value < 0 || *value >= extent {
            if !boundary.is_periodic(axis) {
                return None;
            }
            *value = value.rem_euclid(extent);
        }
    }
    Some(out)
}

impl<T> MergedNeighborList<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            local: MergedCellRange::default(),
            window: MergedCellRange::default(),
            range: CellCoord::ZERO,
            buffer: Vec::new(),
            cache: Vec::new(),
            ranges: Vec::new(),
            slice_marks: Vec::new(),
        }
    }

    /// Buffer entries needed for `local` with index range `range`, assuming
    /// `avg_occupancy` values per cell: the cached window plus the compressed strips.
    #[must_use]
    pub fn calc_capacity(local: &MergedCellRange, range: CellCoord, avg_occupancy: f32) -> usize {
        let size = local.size();
        let window = local.expand(range);
        let rows = size.y.max(0) as usize * size.z.max(0) as usize;
        let slices = window.size().x.max(0) as usize;
        let per_slice = (2 * range.y + 1).max(0) as usize * (2 * range.z + 1).max(0) as usize;
        let cells = window.len() + rows * slices * per_slice;
        (cells as f32 * avg_occupancy.max(0.0)).ceil() as usize
    }

    /// The macro-cell this buffer currently describes.
    #[must_use]
    pub const fn local(&self) -> &MergedCellRange {
        &self.local
    }

    /// The cached window `[lo - range, hi + range)`.
    #[must_use]
    pub const fn window(&self) -> &MergedCellRange {
        &self.window
    }

    #[must_use]
    pub const fn index_range(&self) -> CellCoord {
        self.range
    }

    /// Number of micro-cells in the macro-cell.
    #[must_use]
    pub fn n_cell(&self) -> usize {
        self.local.len()
    }

    #[must_use]
    pub fn buffer(&self) -> &[T] {
        &self.buffer
    }

    #[must_use]
    pub fn ranges(&self) -> &[BufferRange] {
        &self.ranges
    }

    /// Contents of the `index`-th micro-cell.
    #[must_use]
    pub fn cell(&self, index: usize) -> &[T] {
        &self.buffer[self.ranges[index].as_range()]
    }

    /// Resolved neighbor window of the `index`-th micro-cell.
    #[must_use]
    pub fn neighbors(&self, index: usize) -> &[T] {
        &self.buffer[self.ranges[self.n_cell() + index].as_range()]
    }

    #[must_use]
    pub fn cell_at(&self, coord: CellCoord) -> Option<&[T]> {
        self.local.linear_index(coord).map(|index| self.cell(index))
    }

    #[must_use]
    pub fn neighbors_at(&self, coord: CellCoord) -> Option<&[T]> {
        self.local
            .linear_index(coord)
            .map(|index| self.neighbors(index))
    }

    #[must_use]
    pub fn extract_cell(&self, index: usize) -> MergedCell<'_, T> {
        MergedCell {
            coord: self.local.coord_at(index),
            contents: self.cell(index),
            neighbors: self.neighbors(index),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = MergedCell<'_, T>> + '_ {
        (0..self.n_cell()).map(|index| self.extract_cell(index))
    }

    /// Copy the layout into `out`, mapping every buffered value through `map`.
    ///
    /// Used to lay positions out next to handles so the inner loop reads them contiguously.
    pub fn gather_into<U>(&self, out: &mut MergedNeighborList<U>, map: impl FnMut(&T) -> U) {
        out.local = self.local;
        out.window = self.window;
        out.range = self.range;
        out.cache.clone_from(&self.cache);
        out.ranges.clone_from(&self.ranges);
        out.buffer.clear();
        out.buffer.extend(self.buffer.iter().map(map));
    }

    fn prepare(&mut self, info: &GridInfo, local: MergedCellRange, r_search: f32) {
        self.local = local;
        self.range = info.get_index_range(r_search);
        self.window = local.expand(self.range);
        self.buffer.clear();
        self.cache.clear();
        self.ranges.clear();
    }

    #[inline]
    fn cached(&self, coord: CellCoord) -> BufferRange {
        self.cache[self.window.linear_index_unchecked(coord)]
    }
}

impl<T: Copy> MergedNeighborList<T> {
    /// Resolve every micro-cell of `local` using X-compressed strips.
    pub fn build(
        &mut self,
        grid: &HashGrid<T>,
        local: MergedCellRange,
        r_search: f32,
        boundary: Boundary,
        avg_occupancy: f32,
    ) {
        self.prepare(grid.info(), local, r_search);
        self.buffer
            .reserve(Self::calc_capacity(&local, self.range, avg_occupancy));
        self.fill_cache(grid, boundary);
        self.push_contents();
        self.build_compressed();
    }

    /// Resolve every micro-cell by concatenating its `(2R + 1)^3` cached cells one by one.
    pub fn build_uncompressed(
        &mut self,
        grid: &HashGrid<T>,
        local: MergedCellRange,
        r_search: f32,
        boundary: Boundary,
        avg_occupancy: f32,
    ) {
        self.prepare(grid.info(), local, r_search);
        let cells = self.window.len() + local.len() * (self.range * 2 + CellCoord::ONE).volume();
        self.buffer
            .reserve((cells as f32 * avg_occupancy.max(0.0)).ceil() as usize);
        self.fill_cache(grid, boundary);
        self.push_contents();

        let range = self.range;
        for index in 0..local.len() {
            let center = local.coord_at(index);
            let start = self.buffer.len();
            for dz in -range.z..=range.z {
                for dy in -range.y..=range.y {
                    for dx in -range.x..=range.x {
                        let cached = self.cached(center + CellCoord::new(dx, dy, dz));
                        self.buffer.extend_from_within(cached.as_range());
                    }
                }
            }
            self.ranges
                .push(BufferRange::new(start, self.buffer.len() - start));
        }
    }

    fn fill_cache(&mut self, grid: &HashGrid<T>, boundary: Boundary) {
        self.cache.reserve(self.window.len());
        for index in 0..self.window.len() {
            let coord = self.window.coord_at(index);
            let start = self.buffer.len();
            if let Some(cell) = resolve_cell(grid.info(), coord, boundary) {
                self.buffer
                    .extend_from_slice(grid.get_values_in_cell(cell));
            }
            self.cache
                .push(BufferRange::new(start, self.buffer.len() - start));
        }
    }

    fn push_contents(&mut self) {
        self.ranges.reserve(2 * self.local.len());
        for index in 0..self.local.len() {
            let cached = self.cached(self.local.coord_at(index));
            self.ranges.push(cached);
        }
    }

    fn build_compressed(&mut self) {
        let (local, window, range) = (self.local, self.window, self.range);
        let span = 2 * range.x as usize + 1;
        for z in local.lo().z..local.hi().z {
            for y in local.lo().y..local.hi().y {
                self.slice_marks.clear();
                for x in window.lo().x..window.hi().x {
                    self.slice_marks.push(self.buffer.len());
                    for dz in -range.z..=range.z {
                        for dy in -range.y..=range.y {
                            let cached = self.cached(CellCoord::new(x, y + dy, z + dz));
                            self.buffer.extend_from_within(cached.as_range());
                        }
                    }
                }
                self.slice_marks.push(self.buffer.len());
                for slot in 0..local.size().x as usize {
                    let start = self.slice_marks[slot];
                    let end = self.slice_marks[slot + span];
                    self.ranges.push(BufferRange::new(start, end - start));
                }
            }
        }
    }
}
