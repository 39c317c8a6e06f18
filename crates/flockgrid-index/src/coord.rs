use std::fmt;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};

use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Integer coordinate of one grid cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CellCoord {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CellCoord {
    pub const ZERO: Self = Self::splat(0);
    pub const ONE: Self = Self::splat(1);

    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub const fn splat(v: i32) -> Self {
        Self { x: v, y: v, z: v }
    }

    /// Componentwise floor of a float vector.
    #[must_use]
    pub fn floor(v: Vec3) -> Self {
        Self::new(
            v.x.floor() as i32,
            v.y.floor() as i32,
            v.z.floor() as i32,
        )
    }

    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Self::new(
            self.x.min(other.x),
            self.y.min(other.y),
            self.z.min(other.z),
        )
    }

    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self::new(
            self.x.max(other.x),
            self.y.max(other.y),
            self.z.max(other.z),
        )
    }

    #[must_use]
    pub fn min_element(self) -> i32 {
        self.x.min(self.y).min(self.z)
    }

    /// Number of cells in a box of this extent; zero when any axis is non-positive.
    #[must_use]
    pub fn volume(self) -> usize {
        if self.min_element() <= 0 {
            return 0;
        }
        self.x as usize * self.y as usize * self.z as usize
    }

    /// True when every component is `>= lo` and `< hi` componentwise.
    #[must_use]
    pub fn within(self, lo: Self, hi: Self) -> bool {
        self.x >= lo.x
            && self.y >= lo.y
            && self.z >= lo.z
            && self.x < hi.x
            && self.y < hi.y
            && self.z < hi.z
    }

    #[must_use]
    pub fn as_vec3(self) -> Vec3 {
        Vec3::new(self.x as f32, self.y as f32, self.z as f32)
    }

    /// Componentwise `<=`.
    #[must_use]
    pub fn all_le(self, other: Self) -> bool {
        self.x <= other.x && self.y <= other.y && self.z <= other.z
    }
}

impl fmt::Display for CellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

impl Add for CellCoord {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl AddAssign for CellCoord {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for CellCoord {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl SubAssign for CellCoord {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl Mul<i32> for CellCoord {
    type Output = Self;

    fn mul(self, rhs: i32) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

/// A `[lo, hi)` block of cells, used to describe a macro-cell or a cached window.
///
/// Linear indices run with X fastest, then Y, then Z.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MergedCellRange {
    lo: CellCoord,
    hi: CellCoord,
}

impl MergedCellRange {
    /// Build a block from its bounds. Inverted axes produce an empty block.
    #[must_use]
    pub fn new(lo: CellCoord, hi: CellCoord) -> Self {
        Self { lo, hi: hi.max(lo) }
    }

    /// A block of `size` cells starting at `lo`.
    #[must_use]
    pub fn from_origin(lo: CellCoord, size: CellCoord) -> Self {
        Self::new(lo, lo + size)
    }

    #[must_use]
    pub const fn lo(&self) -> CellCoord {
        self.lo
    }

    #[must_use]
    pub const fn hi(&self) -> CellCoord {
        self.hi
    }

    #[must_use]
    pub fn size(&self) -> CellCoord {
        self.hi - self.lo
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.size().volume()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn contains(&self, coord: CellCoord) -> bool {
        coord.within(self.lo, self.hi)
    }

    /// Grow the block by `margin` cells on every side.
    #[must_use]
    pub fn expand(&self, margin: CellCoord) -> Self {
        Self::new(self.lo - margin, self.hi + margin)
    }

    /// Coordinate of the `index`-th cell.
    #[must_use]
    pub fn coord_at(&self, index: usize) -> CellCoord {
        debug_assert!(index < self.len(), "linear index {index} outside block");
        let size = self.size();
        let (sx, sy) = (size.x as usize, size.y as usize);
        let x = index % sx;
        let y = (index / sx) % sy;
        let z = index / (sx * sy);
        self.lo + CellCoord::new(x as i32, y as i32, z as i32)
    }

    /// Linear index of `coord`, or `None` when it lies outside the block.
    #[must_use]
    pub fn linear_index(&self, coord: CellCoord) -> Option<usize> {
        if !self.contains(coord) {
            return None;
        }
        Some(self.linear_index_unchecked(coord))
    }

    #[inline]
    pub(crate) fn linear_index_unchecked(&self, coord: CellCoord) -> usize {
        let size = self.size();
        let rel = coord - self.lo;
        (rel.z as usize * size.y as usize + rel.y as usize) * size.x as usize + rel.x as usize
    }

    /// Iterate every cell of the block in linear order.
    pub fn iter(&self) -> impl Iterator<Item = CellCoord> + '_ {
        (0..self.len()).map(|index| self.coord_at(index))
    }
}
