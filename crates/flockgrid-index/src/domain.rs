use std::ops::BitOr;

use glam::Vec3;
use serde::{Deserialize, Serialize};

use crate::IndexError;

/// Per-axis boundary behaviour stored as a 3-bit flag set.
///
/// Bit 0 marks X as periodic, bit 1 Y and bit 2 Z. A cleared bit is an open axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Boundary(u8);

impl Boundary {
    pub const OPEN: Self = Self(0);
    pub const PERIODIC_X: Self = Self(0b001);
    pub const PERIODIC_Y: Self = Self(0b010);
    pub const PERIODIC_Z: Self = Self(0b100);
    pub const PERIODIC_XY: Self = Self(0b011);
    pub const PERIODIC_YZ: Self = Self(0b110);
    pub const PERIODIC_ZX: Self = Self(0b101);
    pub const PERIODIC_XYZ: Self = Self(0b111);

    /// Build a flag set from raw bits, ignoring anything above bit 2.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns true when every axis is open.
    #[must_use]
    pub const fn is_open(self) -> bool {
        self.0 == 0
    }

    /// Returns true when `axis` (0 = X, 1 = Y, 2 = Z) wraps around.
    #[must_use]
    pub const fn is_periodic(self, axis: usize) -> bool {
        axis < 3 && self.0 & (1 << axis) != 0
    }
}

impl BitOr for Boundary {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Axis-aligned box with inclusive lower and exclusive upper bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DomainBox {
    lo: Vec3,
    hi: Vec3,
    size: Vec3,
    size_inv: Vec3,
}

impl Default for DomainBox {
    fn default() -> Self {
        Self::unit()
    }
}

impl DomainBox {
    /// Construct a box spanning `[lo, hi)` on every axis.
    pub fn new(lo: Vec3, hi: Vec3) -> Result<Self, IndexError> {
        if !lo.is_finite() || !hi.is_finite() {
            return Err(IndexError::InvalidBounds("domain bounds must be finite"));
        }
        if lo.cmpge(hi).any() {
            return Err(IndexError::InvalidBounds(
                "lower bound must be strictly below the upper bound on every axis",
            ));
        }
        let size = hi - lo;
        Ok(Self {
            lo,
            hi,
            size,
            size_inv: size.recip(),
        })
    }

    /// Cube centred on the origin with the given half edge length.
    pub fn centered_cube(half_extent: f32) -> Result<Self, IndexError> {
        Self::new(Vec3::splat(-half_extent), Vec3::splat(half_extent))
    }

    /// The unit cube `[0, 1)^3`.
    #[must_use]
    pub fn unit() -> Self {
        Self {
            lo: Vec3::ZERO,
            hi: Vec3::ONE,
            size: Vec3::ONE,
            size_inv: Vec3::ONE,
        }
    }

    #[must_use]
    pub const fn lo(&self) -> Vec3 {
        self.lo
    }

    #[must_use]
    pub const fn hi(&self) -> Vec3 {
        self.hi
    }

    #[must_use]
    pub const fn size(&self) -> Vec3 {
        self.size
    }

    #[must_use]
    pub const fn size_inv(&self) -> Vec3 {
        self.size_inv
    }

    #[must_use]
    pub fn center(&self) -> Vec3 {
        (self.lo + self.hi) * 0.5
    }

    #[must_use]
    pub fn volume(&self) -> f32 {
        self.size.x * self.size.y * self.size.z
    }

    /// Length of the box diagonal.
    #[must_use]
    pub fn diagonal(&self) -> f32 {
        self.size.length()
    }

    /// Half-open containment test: `lo <= p < hi` on every axis.
    #[must_use]
    pub fn is_inside(&self, p: Vec3) -> bool {
        p.cmpge(self.lo).all() && p.cmplt(self.hi).all()
    }

    /// Wrap `pos` back into the box along every periodic axis.
    ///
    /// Only a single period is added or removed. Positions displaced by more than one box
    /// width are a caller bug and trip a debug assertion.
    #[must_use]
    pub fn apply_periodic(&self, pos: Vec3, boundary: Boundary) -> Vec3 {
        if boundary.is_open() {
            return pos;
        }
        let mut out = pos;
        for axis in 0..3 {
            if !boundary.is_periodic(axis) {
                continue;
            }
            let (lo, hi, size) = (self.lo[axis], self.hi[axis], self.size[axis]);
            let mut v = out[axis];
            if v < lo {
                v += size;
            } else if v >= hi {
                v -= size;
            }
            // lo - tiny + size can round up onto the excluded face.
            if v >= hi {
                v = lo;
            }
            debug_assert!(
                v >= lo && v < hi,
                "position {pos} is more than one period outside the domain on axis {axis}"
            );
            out[axis] = v;
        }
        out
    }

    /// Reduce a relative vector to its minimum image, `[-size/2, size/2)` per periodic axis.
    #[must_use]
    pub fn displacement(&self, delta: Vec3, boundary: Boundary) -> Vec3 {
        if boundary.is_open() {
            return delta;
        }
        let mut out = delta;
        for axis in 0..3 {
            if !boundary.is_periodic(axis) {
                continue;
            }
            let size = self.size[axis];
            let half = size * 0.5;
            let d = out[axis];
            let wrapped = d - size * ((d + half) * self.size_inv[axis]).floor();
            out[axis] = if wrapped >= half { wrapped - size } else { wrapped };
        }
        out
    }
}
