//! Shared vertex/index storage for every static mesh.

use rayon::prelude::*;

use super::{GeometryMeta, PrimitiveDesc, Vertex};
use crate::device::{BufferDesc, BufferUsage, Device, ManagedBuffer, MemoryLocation};
use crate::util::{BBox3f, Error, Result};

/// Index of a mesh inside a [`GeometryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u32);

/// A mesh: a list of primitives over a contiguous vertex range.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub primitives: Vec<GeometryMeta>,
    pub bounds: BBox3f,
}

/// CPU copy of all geometry plus its device buffers.
///
/// Meshes are immutable once added. [`upload`](Self::upload) must run
/// before any BLAS is built from the store.
#[derive(Debug, Default)]
pub struct GeometryStore {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    meshes: Vec<Mesh>,
    vertex_buffer: Option<ManagedBuffer>,
    index_buffer: Option<ManagedBuffer>,
    dirty: bool,
}

impl GeometryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mesh. Indices are rebased onto the shared vertex array.
    pub fn add_mesh(&mut self, vertices: &[Vertex], primitives: &[PrimitiveDesc<'_>]) -> Result<MeshId> {
        if vertices.is_empty() || primitives.is_empty() {
            return Err(Error::InvalidGeometry("mesh without vertices or primitives".into()));
        }
        let vertex_count = vertices.len() as u32;
        for (i, prim) in primitives.iter().enumerate() {
            if prim.indices.is_empty() || prim.indices.len() % 3 != 0 {
                return Err(Error::InvalidGeometry(format!(
                    "primitive {i} has {} indices, expected a non-empty triangle list",
                    prim.indices.len()
                )));
            }
            if let Some(bad) = prim.indices.iter().find(|&&idx| idx >= vertex_count) {
                return Err(Error::InvalidGeometry(format!(
                    "primitive {i} references vertex {bad} of {vertex_count}"
                )));
            }
        }

        let vertex_offset = self.vertices.len() as u32;
        let mut first_index = self.indices.len() as u32;

        // Per-primitive scan is independent; large meshes benefit from rayon.
        let scanned: Vec<(u32, BBox3f)> = primitives
            .par_iter()
            .map(|prim| {
                let mut bounds = BBox3f::EMPTY;
                let mut highest = 0u32;
                for &idx in prim.indices {
                    highest = highest.max(idx);
                    bounds.expand_by_point(vertices[idx as usize].position());
                }
                (highest, bounds)
            })
            .collect();

        let mut mesh = Mesh {
            primitives: Vec::with_capacity(primitives.len()),
            bounds: BBox3f::EMPTY,
        };
        for (prim, (highest, bounds)) in primitives.iter().zip(scanned) {
            self.indices.extend(prim.indices.iter().map(|&idx| idx + vertex_offset));
            mesh.primitives.push(GeometryMeta {
                first_index,
                index_count: prim.indices.len() as u32,
                vertex_offset,
                vertex_count,
                highest_referenced_index: highest + vertex_offset,
                material_index: prim.material_index,
                bounds,
            });
            mesh.bounds.expand_by_box(&bounds);
            first_index += prim.indices.len() as u32;
        }
        self.vertices.extend_from_slice(vertices);

        let id = MeshId(self.meshes.len() as u32);
        tracing::debug!(
            mesh = id.0,
            vertices = vertex_count,
            primitives = mesh.primitives.len(),
            "mesh added"
        );
        self.meshes.push(mesh);
        self.dirty = true;
        Ok(id)
    }

    /// Write vertex and index data to device buffers, growing them if needed.
    ///
    /// Blocking; a no-op when nothing changed since the last upload.
    #[tracing::instrument(skip_all, fields(vertices = self.vertices.len(), indices = self.indices.len()))]
    pub fn upload(&mut self, device: &dyn Device) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if self.vertices.is_empty() {
            return Err(Error::InvalidGeometry("nothing to upload".into()));
        }
        let usage = BufferUsage::STORAGE
            | BufferUsage::AS_BUILD_INPUT
            | BufferUsage::SHADER_DEVICE_ADDRESS
            | BufferUsage::TRANSFER_DST;

        let vertex_bytes: &[u8] = bytemuck::cast_slice(&self.vertices);
        Self::write_grow(device, &mut self.vertex_buffer, "geometry.vertices", usage | BufferUsage::VERTEX, vertex_bytes)?;
        let index_bytes: &[u8] = bytemuck::cast_slice(&self.indices);
        Self::write_grow(device, &mut self.index_buffer, "geometry.indices", usage | BufferUsage::INDEX, index_bytes)?;

        self.dirty = false;
        tracing::info!(bytes = vertex_bytes.len() + index_bytes.len(), "geometry uploaded");
        Ok(())
    }

    fn write_grow(
        device: &dyn Device,
        slot: &mut Option<ManagedBuffer>,
        label: &str,
        usage: BufferUsage,
        bytes: &[u8],
    ) -> Result<()> {
        let needed = bytes.len() as u64;
        if slot.as_ref().is_some_and(|b| b.size() < needed) {
            if let Some(old) = slot.take() {
                old.destroy(device);
            }
        }
        if slot.is_none() {
            let desc = BufferDesc::new(label, needed.next_power_of_two(), usage, MemoryLocation::CpuToGpu);
            *slot = Some(ManagedBuffer::create(device, &desc)?);
        }
        match slot {
            Some(buffer) => buffer.write(device, 0, bytes),
            None => Err(Error::backend("geometry buffer missing after allocation")),
        }
    }

    pub fn mesh(&self, id: MeshId) -> Option<&Mesh> {
        self.meshes.get(id.0 as usize)
    }

    pub fn bounds(&self, id: MeshId) -> Option<BBox3f> {
        self.mesh(id).map(|m| m.bounds)
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Device vertex buffer, `None` before the first upload.
    pub fn vertex_buffer(&self) -> Option<&ManagedBuffer> {
        self.vertex_buffer.as_ref()
    }

    pub fn index_buffer(&self) -> Option<&ManagedBuffer> {
        self.index_buffer.as_ref()
    }

    /// True when meshes were added since the last upload.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn destroy(&mut self, device: &dyn Device) {
        if let Some(b) = self.vertex_buffer.take() {
            b.destroy(device);
        }
        if let Some(b) = self.index_buffer.take() {
            b.destroy(device);
        }
        self.dirty = !self.vertices.is_empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HeadlessDevice;
    use crate::util::Vec3;

    fn quad() -> Vec<Vertex> {
        [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ]
        .into_iter()
        .map(|p| Vertex::new(p, Vec3::Z, [p.x, p.y]))
        .collect()
    }

    #[test]
    fn test_add_mesh_rebases_indices() {
        let mut store = GeometryStore::new();
        let a = store
            .add_mesh(&quad(), &[PrimitiveDesc { indices: &[0, 1, 2], material_index: 0 }])
            .unwrap();
        let b = store
            .add_mesh(
                &quad(),
                &[
                    PrimitiveDesc { indices: &[0, 1, 2], material_index: 1 },
                    PrimitiveDesc { indices: &[0, 2, 3], material_index: -1 },
                ],
            )
            .unwrap();

        assert_eq!(a, MeshId(0));
        assert_eq!(b, MeshId(1));
        assert_eq!(&store.indices()[3..], &[4, 5, 6, 4, 6, 7]);

        let mesh = store.mesh(b).unwrap();
        assert_eq!(mesh.primitives[0].first_index, 3);
        assert_eq!(mesh.primitives[1].first_index, 6);
        assert_eq!(mesh.primitives[1].highest_referenced_index, 7);
        assert_eq!(mesh.primitives[0].highest_referenced_index, 6);
        assert_eq!(mesh.bounds.max, Vec3::new(1.0, 1.0, 0.0));
        assert_eq!(store.bounds(a).unwrap().max, Vec3::new(1.0, 1.0, 0.0));
    }

    #[test]
    fn test_rejects_bad_primitives() {
        let mut store = GeometryStore::new();
        let err = store
            .add_mesh(&quad(), &[PrimitiveDesc { indices: &[0, 1], material_index: 0 }])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidGeometry(_)));
        assert!(store
            .add_mesh(&quad(), &[PrimitiveDesc { indices: &[0, 1, 9], material_index: 0 }])
            .is_err());
        assert_eq!(store.mesh_count(), 0);
    }

    #[test]
    fn test_upload() {
        let device = HeadlessDevice::new();
        let mut store = GeometryStore::new();
        assert!(store.vertex_buffer().is_none());
        store
            .add_mesh(&quad(), &[PrimitiveDesc { indices: &[0, 1, 2, 0, 2, 3], material_index: 0 }])
            .unwrap();
        assert!(store.is_dirty());
        store.upload(&device).unwrap();
        assert!(!store.is_dirty());

        let ib = store.index_buffer().unwrap();
        let bytes = ib.read(&device, 0, 24).unwrap();
        let indices: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes);
        assert_eq!(indices, vec![0, 1, 2, 0, 2, 3]);

        let buffers = device.metrics().snapshot().live_buffers;
        store.upload(&device).unwrap();
        assert_eq!(device.metrics().snapshot().live_buffers, buffers);

        store.destroy(&device);
        assert_eq!(device.metrics().snapshot().live_buffers, 0);
    }
}
