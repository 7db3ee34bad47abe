//! Instance records and the transform source seam.

use std::collections::HashMap;

use bitflags::bitflags;

use super::BlasRef;
use crate::util::{to_row_major_3x4, Mat4, Vec4};

bitflags! {
    /// Per-instance traversal flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InstanceFlags: u8 {
        const TRIANGLE_FACING_CULL_DISABLE = 1 << 0;
        const TRIANGLE_FLIP_FACING = 1 << 1;
        const FORCE_OPAQUE = 1 << 2;
        const FORCE_NO_OPAQUE = 1 << 3;
    }
}

/// Largest value of the 24-bit custom index and SBT offset fields.
pub const MAX_INSTANCE_FIELD: u32 = (1 << 24) - 1;

/// Instance record as consumed by a top-level build. 64 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuInstance {
    /// Row-major 3x4 object-to-world transform.
    pub transform: [f32; 12],
    /// Custom index (low 24 bits), visibility mask (high 8 bits).
    pub custom_index_and_mask: u32,
    /// SBT record offset (low 24 bits), instance flags (high 8 bits).
    pub sbt_offset_and_flags: u32,
    pub blas_address: u64,
}

impl GpuInstance {
    pub fn new(
        transform: &Mat4,
        custom_index: u32,
        mask: u8,
        sbt_offset: u32,
        flags: InstanceFlags,
        blas_address: u64,
    ) -> Self {
        Self {
            transform: to_row_major_3x4(transform),
            custom_index_and_mask: (custom_index & MAX_INSTANCE_FIELD) | ((mask as u32) << 24),
            sbt_offset_and_flags: (sbt_offset & MAX_INSTANCE_FIELD) | ((flags.bits() as u32) << 24),
            blas_address,
        }
    }

    #[inline]
    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & MAX_INSTANCE_FIELD
    }

    #[inline]
    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    #[inline]
    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_and_flags & MAX_INSTANCE_FIELD
    }

    #[inline]
    pub fn flags(&self) -> InstanceFlags {
        InstanceFlags::from_bits_retain((self.sbt_offset_and_flags >> 24) as u8)
    }

    /// Expand the 3x4 rows back into a column-major matrix.
    pub fn transform(&self) -> Mat4 {
        let t = &self.transform;
        Mat4::from_cols(
            Vec4::new(t[0], t[4], t[8], 0.0),
            Vec4::new(t[1], t[5], t[9], 0.0),
            Vec4::new(t[2], t[6], t[10], 0.0),
            Vec4::new(t[3], t[7], t[11], 1.0),
        )
    }
}

/// One placement of a BLAS in the scene.
#[derive(Debug, Clone)]
pub struct BlasInstance {
    pub(crate) instance_id: u64,
    pub(crate) blas: BlasRef,
    pub(crate) transform: Mat4,
    pub(crate) flags: InstanceFlags,
    pub(crate) mask: u8,
    pub(crate) sbt_offset: u32,
    pub(crate) geometry_meta_offset: u32,
    /// Record position in the instance buffer, assigned by a full build.
    pub(crate) slot: Option<u32>,
    pub(crate) changed: bool,
}

impl BlasInstance {
    pub(crate) fn new(instance_id: u64, blas: BlasRef, transform: Mat4, flags: InstanceFlags) -> Self {
        Self {
            instance_id,
            blas,
            transform,
            flags,
            mask: 0xFF,
            sbt_offset: 0,
            geometry_meta_offset: 0,
            slot: None,
            changed: false,
        }
    }

    #[inline]
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    #[inline]
    pub fn blas(&self) -> &BlasRef {
        &self.blas
    }

    #[inline]
    pub fn transform(&self) -> Mat4 {
        self.transform
    }

    #[inline]
    pub fn flags(&self) -> InstanceFlags {
        self.flags
    }

    #[inline]
    pub fn mask(&self) -> u8 {
        self.mask
    }

    #[inline]
    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset
    }

    /// Offset of this instance's BLAS section in the geometry meta buffer.
    #[inline]
    pub fn geometry_meta_offset(&self) -> u32 {
        self.geometry_meta_offset
    }

    #[inline]
    pub fn slot(&self) -> Option<u32> {
        self.slot
    }

    pub fn to_gpu(&self) -> GpuInstance {
        GpuInstance::new(
            &self.transform,
            self.geometry_meta_offset,
            self.mask,
            self.sbt_offset,
            self.flags,
            self.blas.address(),
        )
    }
}

/// Supplies world transforms by instance id during
/// [`resolve_transforms`](super::AccelStructureManager::resolve_transforms).
pub trait TransformSource {
    fn world_transform(&self, instance_id: u64) -> Option<Mat4>;
}

impl TransformSource for HashMap<u64, Mat4> {
    fn world_transform(&self, instance_id: u64) -> Option<Mat4> {
        self.get(&instance_id).copied()
    }
}

impl<F> TransformSource for F
where
    F: Fn(u64) -> Option<Mat4>,
{
    fn world_transform(&self, instance_id: u64) -> Option<Mat4> {
        self(instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::Vec3;

    #[test]
    fn test_gpu_instance_layout() {
        assert_eq!(std::mem::size_of::<GpuInstance>(), 64);
    }

    #[test]
    fn test_packing() {
        let m = Mat4::from_scale_rotation_translation(
            Vec3::new(1.0, 2.0, 3.0),
            glam::Quat::from_rotation_y(0.5),
            Vec3::new(4.0, 5.0, 6.0),
        );
        let flags = InstanceFlags::FORCE_OPAQUE | InstanceFlags::TRIANGLE_FACING_CULL_DISABLE;
        let rec = GpuInstance::new(&m, 17, 0xFF, 3, flags, 0xdead_0000);
        assert_eq!(rec.custom_index(), 17);
        assert_eq!(rec.mask(), 0xFF);
        assert_eq!(rec.sbt_offset(), 3);
        assert_eq!(rec.flags(), flags);
        assert!(rec.transform().abs_diff_eq(m, 1e-6));
        assert_eq!(rec.transform[3], 4.0);
        assert_eq!(rec.transform[7], 5.0);
        assert_eq!(rec.transform[11], 6.0);
    }

    #[test]
    fn test_field_overflow_masked() {
        let rec = GpuInstance::new(&Mat4::IDENTITY, 1 << 24 | 5, 1, 0, InstanceFlags::empty(), 0);
        assert_eq!(rec.custom_index(), 5);
        assert_eq!(rec.mask(), 1);
    }

    #[test]
    fn test_transform_sources() {
        let mut map = HashMap::new();
        map.insert(1u64, Mat4::from_translation(Vec3::X));
        assert!(map.world_transform(1).is_some());
        assert!(map.world_transform(2).is_none());

        let closure = |id: u64| (id == 7).then_some(Mat4::IDENTITY);
        assert_eq!(closure.world_transform(7), Some(Mat4::IDENTITY));
    }
}
