//! GPU vertex and per-primitive metadata.

use crate::util::{BBox3f, Vec3};

/// Vertex layout shared by every mesh in a [`GeometryStore`](super::GeometryStore).
///
/// Position sits at offset 0 so acceleration structure builds can read it
/// with the vertex stride.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct Vertex {
    pub pos: [f32; 3],
    pub normal: [f32; 3],
    pub tangent: [f32; 4],
    pub uv: [f32; 2],
}

impl Vertex {
    pub const STRIDE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn new(pos: Vec3, normal: Vec3, uv: [f32; 2]) -> Self {
        Self {
            pos: pos.to_array(),
            normal: normal.to_array(),
            tangent: [1.0, 0.0, 0.0, 1.0],
            uv,
        }
    }

    #[inline]
    pub fn position(&self) -> Vec3 {
        Vec3::from_array(self.pos)
    }
}

/// One primitive (index range with a material) of a mesh.
///
/// Indices are global into the store's shared vertex array.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeometryMeta {
    pub first_index: u32,
    pub index_count: u32,
    /// First vertex of the owning mesh.
    pub vertex_offset: u32,
    pub vertex_count: u32,
    /// Highest vertex index referenced by this primitive.
    pub highest_referenced_index: u32,
    /// Negative means no material.
    pub material_index: i32,
    pub bounds: BBox3f,
}

impl GeometryMeta {
    #[inline]
    pub fn triangle_count(&self) -> u32 {
        self.index_count / 3
    }
}

/// Input for one primitive of [`GeometryStore::add_mesh`](super::GeometryStore::add_mesh).
#[derive(Clone, Copy, Debug)]
pub struct PrimitiveDesc<'a> {
    /// Triangle list, indices local to the mesh's vertices.
    pub indices: &'a [u32],
    pub material_index: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout() {
        assert_eq!(Vertex::STRIDE, 48);
        let v = Vertex::new(Vec3::new(1.0, 2.0, 3.0), Vec3::Y, [0.5, 0.5]);
        let bytes = bytemuck::bytes_of(&v);
        let pos: [f32; 3] = bytemuck::pod_read_unaligned(&bytes[..12]);
        assert_eq!(pos, [1.0, 2.0, 3.0]);
    }
}
