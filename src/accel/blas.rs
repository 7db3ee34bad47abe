//! Bottom-level acceleration structures.

use std::sync::{Arc, Weak};

use super::GpuGeometryMeta;
use crate::command::CommandList;
use crate::device::{
    AccelBuildDesc, AccelBuildFlags, AccelBuildMode, AccelGeometry, AccelId, AccelKind, BufferDesc,
    BufferUsage, Device, ManagedBuffer, MemoryLocation, SubmitMode, TriangleGeometry,
};
use crate::geometry::{GeometryStore, MeshId, Vertex};
use crate::settings::Settings;
use crate::state::AccessState;
use crate::util::{align_up, BBox3f, Error, Result};

/// Stable identity of a BLAS for the lifetime of its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlasId(pub u64);

#[derive(Debug, Clone)]
pub struct BlasOptions {
    pub label: String,
    pub prefer_fast_trace: bool,
    /// Keep scratch memory and allow [`Blas::update`].
    pub allow_update: bool,
}

impl Default for BlasOptions {
    fn default() -> Self {
        Self {
            label: "blas".to_owned(),
            prefer_fast_trace: true,
            allow_update: false,
        }
    }
}

impl BlasOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            prefer_fast_trace: settings.prefer_fast_trace,
            allow_update: settings.allow_blas_update,
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Bottom-level acceleration structure over one mesh of a [`GeometryStore`].
///
/// Immutable after [`build`](Self::build) except for the optional GPU refit.
/// Instances hold a [`BlasRef`], which does not keep the BLAS alive.
#[derive(Debug)]
pub struct Blas {
    id: BlasId,
    accel: AccelId,
    storage: ManagedBuffer,
    scratch: Option<ManagedBuffer>,
    address: u64,
    mesh: MeshId,
    bounds: BBox3f,
    geometry: AccelGeometry,
    flags: AccelBuildFlags,
    geometries: Arc<[GpuGeometryMeta]>,
    alive: Arc<()>,
}

/// Non-owning reference to a [`Blas`].
#[derive(Debug, Clone)]
pub struct BlasRef {
    id: BlasId,
    address: u64,
    bounds: BBox3f,
    geometries: Arc<[GpuGeometryMeta]>,
    alive: Weak<()>,
}

impl BlasRef {
    #[inline]
    pub fn id(&self) -> BlasId {
        self.id
    }

    /// Device address of the BLAS.
    #[inline]
    pub fn address(&self) -> u64 {
        self.address
    }

    #[inline]
    pub fn bounds(&self) -> BBox3f {
        self.bounds
    }

    pub fn geometries(&self) -> &[GpuGeometryMeta] {
        &self.geometries
    }

    /// False once the referenced BLAS was destroyed.
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

impl Blas {
    /// Build synchronously: one geometry per primitive of `mesh`.
    #[tracing::instrument(skip_all, fields(mesh = mesh.0, label = %options.label))]
    pub fn build(device: &dyn Device, store: &GeometryStore, mesh: MeshId, options: &BlasOptions) -> Result<Self> {
        let mesh_data = store
            .mesh(mesh)
            .ok_or_else(|| Error::not_found(format!("mesh {}", mesh.0)))?;
        if store.is_dirty() {
            return Err(Error::InvalidGeometry("geometry store has pending uploads".into()));
        }
        let (vertex_buffer, index_buffer) = match (store.vertex_buffer(), store.index_buffer()) {
            (Some(v), Some(i)) => (v.id(), i.id()),
            _ => return Err(Error::InvalidGeometry("geometry store was never uploaded".into())),
        };

        let triangles: Vec<TriangleGeometry> = mesh_data
            .primitives
            .iter()
            .map(|prim| TriangleGeometry {
                vertex_buffer,
                vertex_stride: Vertex::STRIDE,
                max_vertex: prim.highest_referenced_index,
                index_buffer,
                first_index: prim.first_index,
                triangle_count: prim.triangle_count(),
                opaque: true,
            })
            .collect();
        let geometries: Arc<[GpuGeometryMeta]> = mesh_data
            .primitives
            .iter()
            .map(|prim| GpuGeometryMeta {
                material_index: prim.material_index,
                index_buffer_offset: prim.first_index,
            })
            .collect();

        let mut flags = if options.prefer_fast_trace {
            AccelBuildFlags::PREFER_FAST_TRACE
        } else {
            AccelBuildFlags::PREFER_FAST_BUILD
        };
        if options.allow_update {
            flags |= AccelBuildFlags::ALLOW_UPDATE;
        }
        let geometry = AccelGeometry::Triangles(triangles);
        let mut desc = AccelBuildDesc::new(geometry.clone(), flags);
        let sizes = device.accel_build_sizes(&desc)?;

        let storage = ManagedBuffer::create(
            device,
            &BufferDesc::new(
                format!("{}.storage", options.label),
                sizes.accel_size,
                BufferUsage::AS_STORAGE | BufferUsage::SHADER_DEVICE_ADDRESS,
                MemoryLocation::GpuOnly,
            )
            .with_alignment(256),
        )?;
        let accel = match device.create_accel(AccelKind::BottomLevel, storage.id(), sizes.accel_size) {
            Ok(accel) => accel,
            Err(e) => {
                storage.destroy(device);
                return Err(e);
            }
        };

        let scratch_size = if options.allow_update {
            sizes.build_scratch_size.max(sizes.update_scratch_size)
        } else {
            sizes.build_scratch_size
        };
        let scratch_alignment = device.caps().rt.min_scratch_alignment as u64;
        let scratch = match ManagedBuffer::create(
            device,
            &BufferDesc::new(
                format!("{}.scratch", options.label),
                align_up(scratch_size, scratch_alignment),
                BufferUsage::STORAGE | BufferUsage::SHADER_DEVICE_ADDRESS,
                MemoryLocation::GpuOnly,
            )
            .with_alignment(scratch_alignment),
        ) {
            Ok(s) => s,
            Err(e) => {
                device.destroy_accel(accel);
                storage.destroy(device);
                return Err(e);
            }
        };

        desc.dst = Some(accel);
        desc.scratch = Some(scratch.id());
        let mut cmd = CommandList::new();
        cmd.build_accel(desc);
        cmd.memory_barrier(AccessState::AS_BUILD_WRITE, AccessState::AS_READ);

        let address = device
            .submit(&cmd, SubmitMode::Wait)
            .and_then(|_| device.accel_address(accel));
        let address = match address {
            Ok(a) => a,
            Err(e) => {
                tracing::error!(error = %e, "BLAS build failed");
                scratch.destroy(device);
                device.destroy_accel(accel);
                storage.destroy(device);
                return Err(e);
            }
        };

        let scratch = if options.allow_update {
            Some(scratch)
        } else {
            scratch.destroy(device);
            None
        };
        device.metrics().blas_built();
        tracing::info!(address = format_args!("{address:#x}"), size = sizes.accel_size, "BLAS built");

        Ok(Self {
            id: BlasId(accel.0),
            accel,
            storage,
            scratch,
            address,
            mesh,
            bounds: mesh_data.bounds,
            geometry,
            flags,
            geometries,
            alive: Arc::new(()),
        })
    }

    /// Record a refit of this BLAS from the current vertex data.
    ///
    /// Only available when built with `allow_update`. Topology must be unchanged.
    pub fn update(&self, cmd: &mut CommandList) -> Result<()> {
        let scratch = match (&self.scratch, self.flags.contains(AccelBuildFlags::ALLOW_UPDATE)) {
            (Some(scratch), true) => scratch,
            _ => return Err(Error::Unsupported("BLAS was built without allow_update".into())),
        };
        cmd.memory_barrier(AccessState::AS_READ, AccessState::AS_BUILD_WRITE);
        cmd.build_accel(AccelBuildDesc {
            geometry: self.geometry.clone(),
            flags: self.flags,
            mode: AccelBuildMode::Update,
            src: Some(self.accel),
            dst: Some(self.accel),
            scratch: Some(scratch.id()),
        });
        cmd.memory_barrier(AccessState::AS_BUILD_WRITE, AccessState::AS_READ);
        Ok(())
    }

    pub fn reference(&self) -> BlasRef {
        BlasRef {
            id: self.id,
            address: self.address,
            bounds: self.bounds,
            geometries: Arc::clone(&self.geometries),
            alive: Arc::downgrade(&self.alive),
        }
    }

    #[inline]
    pub fn id(&self) -> BlasId {
        self.id
    }

    #[inline]
    pub fn accel(&self) -> AccelId {
        self.accel
    }

    #[inline]
    pub fn address(&self) -> u64 {
        self.address
    }

    #[inline]
    pub fn mesh(&self) -> MeshId {
        self.mesh
    }

    #[inline]
    pub fn bounds(&self) -> BBox3f {
        self.bounds
    }

    pub fn geometries(&self) -> &[GpuGeometryMeta] {
        &self.geometries
    }

    pub fn size(&self) -> u64 {
        self.storage.size()
    }

    /// Release GPU objects. Outstanding [`BlasRef`]s become dangling.
    pub fn destroy(self, device: &dyn Device) {
        device.destroy_accel(self.accel);
        self.storage.destroy(device);
        if let Some(scratch) = self.scratch {
            scratch.destroy(device);
        }
        tracing::debug!(blas = self.id.0, "BLAS destroyed");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::HeadlessDevice;
    use crate::geometry::PrimitiveDesc;
    use crate::util::Vec3;

    /// Unit quad as two primitives, uploaded.
    pub(crate) fn quad_store(device: &dyn Device) -> (GeometryStore, MeshId) {
        let vertices: Vec<Vertex> = [
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
        ]
        .into_iter()
        .map(|p| Vertex::new(p, Vec3::Z, [p.x, p.y]))
        .collect();
        let mut store = GeometryStore::new();
        let mesh = store
            .add_mesh(
                &vertices,
                &[
                    PrimitiveDesc { indices: &[0, 1, 2], material_index: 3 },
                    PrimitiveDesc { indices: &[0, 2, 3], material_index: 4 },
                ],
            )
            .unwrap();
        store.upload(device).unwrap();
        (store, mesh)
    }

    #[test]
    fn test_build_blas() {
        let device = HeadlessDevice::new();
        let (store, mesh) = quad_store(&device);
        let blas = Blas::build(&device, &store, mesh, &BlasOptions::default()).unwrap();

        assert_ne!(blas.address(), 0);
        assert_eq!(blas.geometries().len(), 2);
        assert_eq!(blas.geometries()[1].material_index, 4);
        assert_eq!(blas.geometries()[1].index_buffer_offset, 3);

        let info = device.accel_info(blas.accel()).unwrap();
        assert!(info.built);
        assert_eq!(info.primitive_count, 2);
        assert_eq!(info.bounds.max, Vec3::new(1.0, 1.0, 0.0));
        assert_eq!(device.metrics().snapshot().blas_builds, 1);
        // scratch released, storage kept
        assert_eq!(device.metrics().snapshot().live_buffers, 3);
    }

    #[test]
    fn test_reference_dangles_after_destroy() {
        let device = HeadlessDevice::new();
        let (store, mesh) = quad_store(&device);
        let blas = Blas::build(&device, &store, mesh, &BlasOptions::default()).unwrap();
        let r = blas.reference();
        assert!(r.is_alive());
        assert_eq!(r.address(), blas.address());
        blas.destroy(&device);
        assert!(!r.is_alive());
        assert_eq!(device.metrics().snapshot().live_accels, 0);
    }

    #[test]
    fn test_update_requires_flag() {
        let device = HeadlessDevice::new();
        let (store, mesh) = quad_store(&device);
        let mut cmd = CommandList::new();

        let fixed = Blas::build(&device, &store, mesh, &BlasOptions::default()).unwrap();
        assert!(matches!(fixed.update(&mut cmd), Err(Error::Unsupported(_))));

        let options = BlasOptions {
            allow_update: true,
            ..BlasOptions::default()
        };
        let dynamic = Blas::build(&device, &store, mesh, &options).unwrap();
        dynamic.update(&mut cmd).unwrap();
        device.submit(&cmd, SubmitMode::Wait).unwrap();
        assert_eq!(device.accel_info(dynamic.accel()).unwrap().updates, 1);
    }

    #[test]
    fn test_requires_upload() {
        let device = HeadlessDevice::new();
        let (mut store, mesh) = quad_store(&device);
        store
            .add_mesh(
                &[Vertex::default(); 3],
                &[PrimitiveDesc { indices: &[0, 1, 2], material_index: 0 }],
            )
            .unwrap();
        let err = Blas::build(&device, &store, mesh, &BlasOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidGeometry(_)));
        assert!(Blas::build(&device, &store, MeshId(42), &BlasOptions::default()).is_err());
    }
}
