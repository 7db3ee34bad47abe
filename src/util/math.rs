//! Math type re-exports and GPU layout helpers.
//!
//! This module re-exports types from `glam` and provides the bounding box
//! and matrix packing used by acceleration structure builds.

pub use glam::{Mat4, Vec2, Vec3, Vec4};

use bytemuck::{Pod, Zeroable};
use std::fmt;

/// Axis-aligned bounds of triangles or instances.
#[derive(Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct BBox3f {
    pub min: Vec3,
    pub max: Vec3,
}

impl BBox3f {
    /// Inverted box; any expansion replaces it.
    pub const EMPTY: Self = Self {
        min: Vec3::splat(f32::INFINITY),
        max: Vec3::splat(f32::NEG_INFINITY),
    };

    /// Box spanning `min..max`; no ordering check is made.
    #[inline]
    pub const fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    /// True when any axis is inverted, as for [`EMPTY`](Self::EMPTY).
    /// Degenerate (flat or point) boxes are not empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Grow the box to contain `p`.
    #[inline]
    pub fn expand_by_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    /// Empty boxes leave `self` unchanged.
    #[inline]
    pub fn expand_by_box(&mut self, other: &Self) {
        if !other.is_empty() {
            self.min = self.min.min(other.min);
            self.max = self.max.max(other.max);
        }
    }

    /// Bounds of this box after an affine transform (all 8 corners).
    pub fn transformed(&self, m: &Mat4) -> Self {
        if self.is_empty() {
            return Self::EMPTY;
        }
        let mut out = Self::EMPTY;
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { self.min.x } else { self.max.x },
                if i & 2 == 0 { self.min.y } else { self.max.y },
                if i & 4 == 0 { self.min.z } else { self.max.z },
            );
            out.expand_by_point(m.transform_point3(corner));
        }
        out
    }
}

impl Default for BBox3f {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for BBox3f {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BBox3f[{} .. {}]", self.min, self.max)
    }
}

/// Round `value` up to the next multiple of `alignment` (0 and 1 leave it unchanged).
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

/// Pack a column-major 4x4 matrix into the row-major 3x4 layout
/// expected by instance records. The projective row is dropped.
#[inline]
pub fn to_row_major_3x4(m: &Mat4) -> [f32; 12] {
    let mut out = [0.0f32; 12];
    for row in 0..3 {
        for col in 0..4 {
            out[row * 4 + col] = m.col(col)[row];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox3f() {
        let mut b = BBox3f::EMPTY;
        assert!(b.is_empty());

        b.expand_by_point(Vec3::ZERO);
        assert!(!b.is_empty());
        b.expand_by_point(Vec3::ONE);
        assert_eq!(b.min, Vec3::ZERO);
        assert_eq!(b.max, Vec3::ONE);

        let mut merged = BBox3f::EMPTY;
        merged.expand_by_box(&BBox3f::EMPTY);
        assert!(merged.is_empty());
        merged.expand_by_box(&b);
        assert_eq!(merged, b);

        // A single point is degenerate, not empty.
        assert!(!BBox3f::new(Vec3::ONE, Vec3::ONE).is_empty());
        assert_eq!(BBox3f::default(), BBox3f::EMPTY);
    }

    #[test]
    fn test_bbox_transformed() {
        let b = BBox3f::new(Vec3::ZERO, Vec3::ONE);
        let moved = b.transformed(&Mat4::from_translation(Vec3::new(2.0, 0.0, -1.0)));
        assert_eq!(moved.min, Vec3::new(2.0, 0.0, -1.0));
        assert_eq!(moved.max, Vec3::new(3.0, 1.0, 0.0));

        let scaled = b.transformed(&Mat4::from_scale(Vec3::splat(-2.0)));
        assert_eq!(scaled.min, Vec3::splat(-2.0));
        assert_eq!(scaled.max, Vec3::ZERO);

        assert!(BBox3f::EMPTY.transformed(&Mat4::IDENTITY).is_empty());
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(33, 0), 33);
        assert_eq!(align_up(33, 1), 33);
    }

    #[test]
    fn test_row_major_packing() {
        let m = Mat4::from_translation(Vec3::new(5.0, 6.0, 7.0));
        let rows = to_row_major_3x4(&m);
        assert_eq!(rows, [1.0, 0.0, 0.0, 5.0, 0.0, 1.0, 0.0, 6.0, 0.0, 0.0, 1.0, 7.0]);
    }

    #[test]
    fn test_bbox_pod() {
        assert_eq!(std::mem::size_of::<BBox3f>(), 24);
    }
}
