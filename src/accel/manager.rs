//! Instance set and top-level acceleration structure maintenance.

use std::collections::HashMap;

use rayon::prelude::*;
use slotmap::{new_key_type, SlotMap};

use super::{Blas, BlasInstance, BlasRef, GeometryMetaBuffer, GpuInstance, InstanceFlags, TransformSource, MAX_INSTANCE_FIELD};
use crate::command::CopyRegion;
use crate::device::{
    AccelBuildDesc, AccelBuildFlags, AccelBuildMode, AccelGeometry, AccelId, AccelKind, BufferDesc,
    BufferId, BufferUsage, Device, ManagedBuffer, MemoryLocation,
};
use crate::frame::FrameContext;
use crate::settings::Settings;
use crate::state::AccessState;
use crate::util::{align_up, BBox3f, Error, Mat4, Result};

new_key_type! {
    /// Handle of an instance inside an [`AccelStructureManager`].
    pub struct InstanceHandle;
}

const RECORD_SIZE: u64 = std::mem::size_of::<GpuInstance>() as u64;

/// Which path a [`rebuild`](AccelStructureManager::rebuild) took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildKind {
    Full,
    Refit,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub full_builds: u64,
    pub refits: u64,
}

/// The current top-level acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tlas {
    pub accel: AccelId,
    pub address: u64,
    pub instance_count: u32,
    /// World-space bounds of all instances.
    pub bounds: BBox3f,
    /// Bumped whenever `accel` is replaced; descriptors referencing it must be rewritten.
    pub generation: u64,
}

#[derive(Debug)]
struct TlasStorage {
    accel: AccelId,
    buffer: ManagedBuffer,
}

impl TlasStorage {
    fn destroy(self, device: &dyn Device) {
        device.destroy_accel(self.accel);
        self.buffer.destroy(device);
    }
}

/// An object replaced while earlier frames may still read it.
#[derive(Debug)]
enum Retired {
    Tlas(TlasStorage),
    Buffer(ManagedBuffer),
}

impl Retired {
    fn destroy(self, device: &dyn Device) {
        match self {
            Retired::Tlas(storage) => storage.destroy(device),
            Retired::Buffer(buffer) => buffer.destroy(device),
        }
    }
}

/// Owns the instance set and keeps one TLAS up to date.
///
/// Topology changes (add/remove) force a full build on the next
/// [`rebuild`](Self::rebuild); transform and attribute changes only refit.
/// Objects replaced by a rebuild (the TLAS, its instance, staging and
/// scratch buffers, the geometry meta buffer) stay alive until every frame
/// in flight at the time of the replacement has been recycled.
pub struct AccelStructureManager {
    instances: SlotMap<InstanceHandle, BlasInstance>,
    by_id: HashMap<u64, InstanceHandle>,
    /// Record order of the last full build.
    order: Vec<InstanceHandle>,
    changed: Vec<InstanceHandle>,
    topology_dirty: bool,

    meta: GeometryMetaBuffer,
    instance_buffer: Option<ManagedBuffer>,
    /// One section of `capacity` records per frame in flight.
    staging: Option<ManagedBuffer>,
    staging_frames: usize,
    capacity: u32,
    storage: Option<TlasStorage>,
    scratch: Option<ManagedBuffer>,
    retired: Vec<(u64, Retired)>,
    tlas: Option<Tlas>,

    prefer_fast_trace: bool,
    full_rebuild_interval: Option<u32>,
    refits_since_full: u32,
    generation: u64,
    stats: RebuildStats,
}

impl Default for AccelStructureManager {
    fn default() -> Self {
        Self::new(&Settings::default())
    }
}

impl AccelStructureManager {
    pub fn new(settings: &Settings) -> Self {
        Self {
            instances: SlotMap::with_key(),
            by_id: HashMap::new(),
            order: Vec::new(),
            changed: Vec::new(),
            topology_dirty: true,
            meta: GeometryMetaBuffer::new(),
            instance_buffer: None,
            staging: None,
            staging_frames: 0,
            capacity: 0,
            storage: None,
            scratch: None,
            retired: Vec::new(),
            tlas: None,
            prefer_fast_trace: settings.prefer_fast_trace,
            full_rebuild_interval: settings.full_rebuild_interval,
            refits_since_full: 0,
            generation: 0,
            stats: RebuildStats::default(),
        }
    }

    // ---- instance set ----

    /// Place `blas` in the scene under a caller-assigned id.
    pub fn add_instance(&mut self, instance_id: u64, blas: &Blas, transform: Mat4, flags: InstanceFlags) -> Result<InstanceHandle> {
        self.add_instance_ref(instance_id, blas.reference(), transform, flags)
    }

    /// Like [`add_instance`](Self::add_instance) with an existing reference.
    pub fn add_instance_ref(&mut self, instance_id: u64, blas: BlasRef, transform: Mat4, flags: InstanceFlags) -> Result<InstanceHandle> {
        if self.by_id.contains_key(&instance_id) {
            return Err(Error::DuplicateId(instance_id));
        }
        if !blas.is_alive() {
            return Err(Error::DanglingReference { instance_id });
        }
        let handle = self
            .instances
            .insert(BlasInstance::new(instance_id, blas, transform, flags));
        self.by_id.insert(instance_id, handle);
        self.topology_dirty = true;
        Ok(handle)
    }

    /// Remove an instance. Unknown handles leave the topology untouched.
    pub fn remove_instance(&mut self, handle: InstanceHandle) -> Result<()> {
        let instance = self
            .instances
            .remove(handle)
            .ok_or_else(|| Error::not_found("instance handle"))?;
        self.by_id.remove(&instance.instance_id);
        self.topology_dirty = true;
        Ok(())
    }

    /// Remove every instance. The next rebuild produces an empty TLAS.
    pub fn clear_instances(&mut self) {
        self.instances.clear();
        self.by_id.clear();
        self.order.clear();
        self.changed.clear();
        self.topology_dirty = true;
    }

    pub fn instance(&self, handle: InstanceHandle) -> Option<&BlasInstance> {
        self.instances.get(handle)
    }

    pub fn handle_of(&self, instance_id: u64) -> Option<InstanceHandle> {
        self.by_id.get(&instance_id).copied()
    }

    pub fn instances(&self) -> impl Iterator<Item = (InstanceHandle, &BlasInstance)> {
        self.instances.iter()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    fn instance_mut(&mut self, handle: InstanceHandle) -> Result<&mut BlasInstance> {
        self.instances
            .get_mut(handle)
            .ok_or_else(|| Error::not_found("instance handle"))
    }

    fn mark_changed(changed: &mut Vec<InstanceHandle>, handle: InstanceHandle, instance: &mut BlasInstance) {
        if !instance.changed {
            instance.changed = true;
            changed.push(handle);
        }
    }

    /// Set the world transform directly. Unchanged matrices are ignored.
    pub fn set_transform(&mut self, handle: InstanceHandle, transform: Mat4) -> Result<()> {
        let instance = self
            .instances
            .get_mut(handle)
            .ok_or_else(|| Error::not_found("instance handle"))?;
        if instance.transform != transform {
            instance.transform = transform;
            Self::mark_changed(&mut self.changed, handle, instance);
        }
        Ok(())
    }

    /// Pull world transforms from `source`; returns how many instances changed.
    ///
    /// Instances the source does not know keep their transform.
    pub fn resolve_transforms(&mut self, source: &impl TransformSource) -> usize {
        let mut count = 0;
        for (handle, instance) in self.instances.iter_mut() {
            let Some(world) = source.world_transform(instance.instance_id) else {
                continue;
            };
            if world != instance.transform {
                instance.transform = world;
                Self::mark_changed(&mut self.changed, handle, instance);
                count += 1;
            }
        }
        count
    }

    pub fn set_flags(&mut self, handle: InstanceHandle, flags: InstanceFlags) -> Result<()> {
        let instance = self.instance_mut(handle)?;
        if instance.flags != flags {
            instance.flags = flags;
            self.touch(handle);
        }
        Ok(())
    }

    pub fn set_mask(&mut self, handle: InstanceHandle, mask: u8) -> Result<()> {
        let instance = self.instance_mut(handle)?;
        if instance.mask != mask {
            instance.mask = mask;
            self.touch(handle);
        }
        Ok(())
    }

    /// Hit group offset of this instance inside the SBT hit region.
    pub fn set_sbt_offset(&mut self, handle: InstanceHandle, offset: u32) -> Result<()> {
        if offset > MAX_INSTANCE_FIELD {
            return Err(Error::InvalidInstance(format!("SBT offset {offset} exceeds 24 bits")));
        }
        let instance = self.instance_mut(handle)?;
        if instance.sbt_offset != offset {
            instance.sbt_offset = offset;
            self.touch(handle);
        }
        Ok(())
    }

    fn touch(&mut self, handle: InstanceHandle) {
        if let Some(instance) = self.instances.get_mut(handle) {
            Self::mark_changed(&mut self.changed, handle, instance);
        }
    }

    // ---- TLAS ----

    pub fn is_topology_dirty(&self) -> bool {
        self.topology_dirty
    }

    pub fn stats(&self) -> RebuildStats {
        self.stats
    }

    /// The TLAS produced by the last successful rebuild.
    pub fn tlas(&self) -> Result<&Tlas> {
        self.tlas.as_ref().ok_or(Error::TlasNotBuilt)
    }

    pub fn geometry_meta(&self) -> &GeometryMetaBuffer {
        &self.meta
    }

    /// Bring the TLAS up to date, recording work into `frame.commands`.
    ///
    /// Full build when the topology changed, no TLAS exists yet or the
    /// periodic rebuild interval was reached; refit otherwise.
    pub fn rebuild(&mut self, device: &dyn Device, frame: &mut FrameContext) -> Result<RebuildKind> {
        if let Some((_, instance)) = self.instances.iter().find(|(_, i)| !i.blas.is_alive()) {
            return Err(Error::DanglingReference {
                instance_id: instance.instance_id,
            });
        }
        self.release_retired(device, frame.serial(), frame.frames_in_flight());

        let interval_hit = self
            .full_rebuild_interval
            .is_some_and(|n| self.refits_since_full >= n);
        let full = self.topology_dirty
            || self.tlas.is_none()
            || interval_hit
            || frame.frames_in_flight() != self.staging_frames;
        if full {
            self.full_build(device, frame)?;
            Ok(RebuildKind::Full)
        } else {
            self.refit(device, frame)?;
            Ok(RebuildKind::Refit)
        }
    }

    fn build_flags(&self) -> AccelBuildFlags {
        let preference = if self.prefer_fast_trace {
            AccelBuildFlags::PREFER_FAST_TRACE
        } else {
            AccelBuildFlags::PREFER_FAST_BUILD
        };
        AccelBuildFlags::ALLOW_UPDATE | preference
    }

    fn world_bounds(&self) -> BBox3f {
        let mut bounds = BBox3f::EMPTY;
        for instance in self.instances.values() {
            bounds.expand_by_box(&instance.blas.bounds().transformed(&instance.transform));
        }
        bounds
    }

    #[tracing::instrument(skip_all, fields(instances = self.instances.len(), frame = frame.frame_index()))]
    fn full_build(&mut self, device: &dyn Device, frame: &mut FrameContext) -> Result<()> {
        let mut order: Vec<InstanceHandle> = self.instances.keys().collect();
        order.sort_by_key(|h| self.instances[*h].instance_id);

        let serial = frame.serial();
        self.meta.rebuild(device, order.iter().map(|h| &self.instances[*h].blas), |old| {
            self.retired.push((serial, Retired::Buffer(old)))
        })?;
        for (slot, handle) in order.iter().enumerate() {
            let offset = self.meta.offset_of(self.instances[*handle].blas.id()).unwrap_or(0);
            if offset > MAX_INSTANCE_FIELD {
                return Err(Error::InvalidInstance(format!(
                    "geometry meta offset {offset} exceeds 24 bits"
                )));
            }
            let instance = &mut self.instances[*handle];
            instance.geometry_meta_offset = offset;
            instance.slot = Some(slot as u32);
            instance.changed = false;
        }
        self.changed.clear();

        let count = order.len() as u32;
        self.ensure_instance_capacity(device, count, frame.frames_in_flight(), serial)?;

        let records: Vec<GpuInstance> = order
            .par_iter()
            .map(|h| self.instances[*h].to_gpu())
            .collect();
        self.order = order;

        let (staging, instance_buffer) = self.instance_buffers()?;
        let section = self.section_offset(frame.frame_index());
        if !records.is_empty() {
            staging.write(device, section, bytemuck::cast_slice(&records))?;
        }
        let staging_id = staging.id();
        let instance_id = instance_buffer.id();

        let mut desc = AccelBuildDesc::new(
            AccelGeometry::Instances {
                buffer: instance_id,
                offset: 0,
                count,
            },
            self.build_flags(),
        );
        let sizes = device.accel_build_sizes(&desc)?;
        self.ensure_storage(device, sizes.accel_size, serial)?;
        self.ensure_scratch(device, sizes.build_scratch_size.max(sizes.update_scratch_size), serial)?;
        let (accel, scratch) = self.storage_and_scratch()?;
        desc.dst = Some(accel);
        desc.scratch = Some(scratch);

        let cmd = &mut frame.commands;
        cmd.copy_buffer(
            staging_id,
            instance_id,
            [CopyRegion {
                src_offset: section,
                dst_offset: 0,
                size: count as u64 * RECORD_SIZE,
            }],
        );
        cmd.memory_barrier(AccessState::TRANSFER_DST_BUFFER, AccessState::AS_BUILD_INPUT);
        cmd.build_accel(desc);
        cmd.memory_barrier(AccessState::AS_BUILD_WRITE, AccessState::AS_READ);

        let address = device.accel_address(accel)?;
        self.tlas = Some(Tlas {
            accel,
            address,
            instance_count: count,
            bounds: self.world_bounds(),
            generation: self.generation,
        });
        self.topology_dirty = false;
        self.refits_since_full = 0;
        self.stats.full_builds += 1;
        device.metrics().tlas_built(false);
        tracing::debug!(count, size = sizes.accel_size, "TLAS full build recorded");
        Ok(())
    }

    fn refit(&mut self, device: &dyn Device, frame: &mut FrameContext) -> Result<()> {
        let mut slots: Vec<(u32, InstanceHandle)> = self
            .changed
            .drain(..)
            .filter_map(|h| {
                let instance = self.instances.get_mut(h)?;
                instance.changed = false;
                instance.slot.map(|slot| (slot, h))
            })
            .collect();
        slots.sort_unstable_by_key(|(slot, _)| *slot);

        let section = self.section_offset(frame.frame_index());
        let (staging, instance_buffer) = self.instance_buffers()?;
        let mut regions: Vec<CopyRegion> = Vec::new();
        for run in slots.chunk_by(|a, b| b.0 == a.0 + 1) {
            let records: Vec<GpuInstance> = run.iter().map(|(_, h)| self.instances[*h].to_gpu()).collect();
            let offset = run[0].0 as u64 * RECORD_SIZE;
            staging.write(device, section + offset, bytemuck::cast_slice(&records))?;
            regions.push(CopyRegion {
                src_offset: section + offset,
                dst_offset: offset,
                size: records.len() as u64 * RECORD_SIZE,
            });
        }
        let staging_id = staging.id();
        let instance_id = instance_buffer.id();
        let (accel, scratch) = self.storage_and_scratch()?;
        let count = self.order.len() as u32;

        let cmd = &mut frame.commands;
        if !regions.is_empty() {
            cmd.copy_buffer(staging_id, instance_id, regions);
            cmd.memory_barrier(AccessState::TRANSFER_DST_BUFFER, AccessState::AS_BUILD_INPUT);
        }
        cmd.memory_barrier(AccessState::AS_READ, AccessState::AS_BUILD_WRITE);
        cmd.build_accel(AccelBuildDesc {
            geometry: AccelGeometry::Instances {
                buffer: instance_id,
                offset: 0,
                count,
            },
            flags: self.build_flags(),
            mode: AccelBuildMode::Update,
            src: Some(accel),
            dst: Some(accel),
            scratch: Some(scratch),
        });
        cmd.memory_barrier(AccessState::AS_BUILD_WRITE, AccessState::AS_READ);

        let bounds = self.world_bounds();
        if let Some(tlas) = self.tlas.as_mut() {
            tlas.bounds = bounds;
        }
        self.refits_since_full += 1;
        self.stats.refits += 1;
        device.metrics().tlas_built(true);
        tracing::trace!(changed = slots.len(), "TLAS refit recorded");
        Ok(())
    }

    fn section_offset(&self, frame_index: usize) -> u64 {
        frame_index as u64 * self.capacity as u64 * RECORD_SIZE
    }

    fn instance_buffers(&self) -> Result<(&ManagedBuffer, &ManagedBuffer)> {
        match (&self.staging, &self.instance_buffer) {
            (Some(s), Some(i)) => Ok((s, i)),
            _ => Err(Error::TlasNotBuilt),
        }
    }

    fn storage_and_scratch(&self) -> Result<(AccelId, BufferId)> {
        match (&self.storage, &self.scratch) {
            (Some(storage), Some(scratch)) => Ok((storage.accel, scratch.id())),
            _ => Err(Error::TlasNotBuilt),
        }
    }

    /// Grow the instance and staging buffers to hold `count` records.
    fn ensure_instance_capacity(&mut self, device: &dyn Device, count: u32, frames: usize, serial: u64) -> Result<()> {
        let fits = count <= self.capacity && frames == self.staging_frames;
        if fits && self.staging.is_some() && self.instance_buffer.is_some() {
            return Ok(());
        }
        let capacity = count.max(self.capacity).max(1).next_power_of_two();
        for old in [self.instance_buffer.take(), self.staging.take()].into_iter().flatten() {
            self.retired.push((serial, Retired::Buffer(old)));
        }
        self.capacity = 0;
        self.instance_buffer = Some(ManagedBuffer::create(
            device,
            &BufferDesc::new(
                "tlas.instances",
                capacity as u64 * RECORD_SIZE,
                BufferUsage::AS_BUILD_INPUT | BufferUsage::SHADER_DEVICE_ADDRESS | BufferUsage::TRANSFER_DST,
                MemoryLocation::GpuOnly,
            )
            .with_alignment(RECORD_SIZE),
        )?);
        self.staging = Some(ManagedBuffer::create(
            device,
            &BufferDesc::new(
                "tlas.instances.staging",
                capacity as u64 * RECORD_SIZE * frames as u64,
                BufferUsage::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
            ),
        )?);
        self.capacity = capacity;
        self.staging_frames = frames;
        tracing::debug!(capacity, frames, "instance buffers allocated");
        Ok(())
    }

    /// Reuse the TLAS object when it is large enough, otherwise replace it.
    fn ensure_storage(&mut self, device: &dyn Device, size: u64, serial: u64) -> Result<()> {
        if let Some(storage) = &self.storage {
            if storage.buffer.size() >= size {
                return Ok(());
            }
        }
        let size = size.next_power_of_two();
        let buffer = ManagedBuffer::create(
            device,
            &BufferDesc::new(
                "tlas.storage",
                size,
                BufferUsage::AS_STORAGE | BufferUsage::SHADER_DEVICE_ADDRESS,
                MemoryLocation::GpuOnly,
            )
            .with_alignment(256),
        )?;
        let accel = match device.create_accel(AccelKind::TopLevel, buffer.id(), size) {
            Ok(accel) => accel,
            Err(e) => {
                buffer.destroy(device);
                return Err(e);
            }
        };
        if let Some(old) = self.storage.replace(TlasStorage { accel, buffer }) {
            self.retired.push((serial, Retired::Tlas(old)));
        }
        self.generation += 1;
        Ok(())
    }

    fn ensure_scratch(&mut self, device: &dyn Device, size: u64, serial: u64) -> Result<()> {
        if self.scratch.as_ref().is_some_and(|s| s.size() >= size) {
            return Ok(());
        }
        if let Some(old) = self.scratch.take() {
            self.retired.push((serial, Retired::Buffer(old)));
        }
        let alignment = device.caps().rt.min_scratch_alignment as u64;
        self.scratch = Some(ManagedBuffer::create(
            device,
            &BufferDesc::new(
                "tlas.scratch",
                align_up(size, alignment).next_power_of_two(),
                BufferUsage::STORAGE | BufferUsage::SHADER_DEVICE_ADDRESS,
                MemoryLocation::GpuOnly,
            )
            .with_alignment(alignment),
        )?);
        Ok(())
    }

    /// Destroy replaced objects no in-flight frame can still read.
    fn release_retired(&mut self, device: &dyn Device, serial: u64, frames_in_flight: usize) {
        let (done, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.retired)
            .into_iter()
            .partition(|(retired_at, _)| retired_at + frames_in_flight as u64 <= serial);
        self.retired = keep;
        for (_, retired) in done {
            retired.destroy(device);
        }
    }

    /// Forget all GPU objects without touching the device (device loss).
    ///
    /// The instance set survives; the next rebuild is a full build.
    pub fn invalidate(&mut self) {
        self.meta.invalidate();
        self.instance_buffer = None;
        self.staging = None;
        self.staging_frames = 0;
        self.capacity = 0;
        self.storage = None;
        self.scratch = None;
        self.retired.clear();
        self.tlas = None;
        self.order.clear();
        self.changed.clear();
        for instance in self.instances.values_mut() {
            instance.slot = None;
            instance.changed = false;
        }
        self.topology_dirty = true;
        tracing::warn!("acceleration structures invalidated");
    }

    /// Release every GPU object. Instances are kept.
    pub fn destroy(&mut self, device: &dyn Device) {
        self.meta.destroy(device);
        for b in [self.instance_buffer.take(), self.staging.take(), self.scratch.take()]
            .into_iter()
            .flatten()
        {
            b.destroy(device);
        }
        if let Some(storage) = self.storage.take() {
            storage.destroy(device);
        }
        for (_, retired) in self.retired.drain(..) {
            retired.destroy(device);
        }
        self.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::blas::tests::quad_store;
    use crate::accel::BlasOptions;
    use crate::device::{HeadlessDevice, SubmitMode};
    use crate::util::Vec3;

    fn setup() -> (HeadlessDevice, Blas, AccelStructureManager, FrameContext) {
        let device = HeadlessDevice::new();
        let (store, mesh) = quad_store(&device);
        let blas = Blas::build(&device, &store, mesh, &BlasOptions::default()).unwrap();
        (device, blas, AccelStructureManager::default(), FrameContext::new(2))
    }

    #[test]
    fn test_duplicate_and_missing() {
        let (_device, blas, mut mgr, _frame) = setup();
        let h = mgr.add_instance(1, &blas, Mat4::IDENTITY, InstanceFlags::empty()).unwrap();
        let err = mgr.add_instance(1, &blas, Mat4::IDENTITY, InstanceFlags::empty()).unwrap_err();
        assert!(matches!(err, Error::DuplicateId(1)));

        mgr.remove_instance(h).unwrap();
        assert!(matches!(mgr.remove_instance(h), Err(Error::NotFound(_))));
        assert_eq!(mgr.instance_count(), 0);
    }

    #[test]
    fn test_full_then_refit() {
        let (device, blas, mut mgr, mut frame) = setup();
        assert!(matches!(mgr.tlas(), Err(Error::TlasNotBuilt)));

        let a = mgr.add_instance(10, &blas, Mat4::IDENTITY, InstanceFlags::empty()).unwrap();
        mgr.add_instance(20, &blas, Mat4::from_translation(Vec3::X * 5.0), InstanceFlags::empty())
            .unwrap();
        assert_eq!(mgr.rebuild(&device, &mut frame).unwrap(), RebuildKind::Full);
        frame.submit(&device, SubmitMode::Wait).unwrap();
        assert!(!mgr.is_topology_dirty());

        let tlas = *mgr.tlas().unwrap();
        assert_eq!(tlas.instance_count, 2);
        assert_eq!(tlas.bounds.max, Vec3::new(6.0, 1.0, 0.0));
        let info = device.accel_info(tlas.accel).unwrap();
        assert_eq!(info.primitive_count, 2);
        assert_eq!(info.bounds, tlas.bounds);

        frame.advance();
        mgr.set_transform(a, Mat4::from_translation(Vec3::Y * 3.0)).unwrap();
        assert_eq!(mgr.rebuild(&device, &mut frame).unwrap(), RebuildKind::Refit);
        frame.submit(&device, SubmitMode::Wait).unwrap();

        let after = mgr.tlas().unwrap();
        assert_eq!(after.accel, tlas.accel);
        assert_eq!(after.instance_count, 2);
        assert_eq!(device.accel_info(after.accel).unwrap().bounds.max, Vec3::new(6.0, 4.0, 0.0));
        assert_eq!(mgr.stats(), RebuildStats { full_builds: 1, refits: 1 });
    }

    #[test]
    fn test_clear_instances() {
        let (device, blas, mut mgr, mut frame) = setup();
        let h = mgr.add_instance(1, &blas, Mat4::IDENTITY, InstanceFlags::empty()).unwrap();
        mgr.add_instance(2, &blas, Mat4::IDENTITY, InstanceFlags::empty()).unwrap();
        mgr.rebuild(&device, &mut frame).unwrap();
        frame.submit(&device, SubmitMode::Wait).unwrap();
        frame.advance();

        mgr.clear_instances();
        assert!(mgr.is_topology_dirty());
        assert_eq!(mgr.instance_count(), 0);
        assert!(mgr.handle_of(1).is_none());
        assert!(matches!(mgr.set_transform(h, Mat4::IDENTITY), Err(Error::NotFound(_))));

        assert_eq!(mgr.rebuild(&device, &mut frame).unwrap(), RebuildKind::Full);
        frame.submit(&device, SubmitMode::Wait).unwrap();
        let tlas = mgr.tlas().unwrap();
        assert_eq!(tlas.instance_count, 0);
        assert_eq!(device.accel_info(tlas.accel).unwrap().primitive_count, 0);

        // Ids are free again.
        mgr.add_instance(1, &blas, Mat4::IDENTITY, InstanceFlags::empty()).unwrap();
    }

    #[test]
    fn test_dangling_reference() {
        let (device, blas, mut mgr, mut frame) = setup();
        mgr.add_instance(3, &blas, Mat4::IDENTITY, InstanceFlags::empty()).unwrap();
        blas.destroy(&device);
        let err = mgr.rebuild(&device, &mut frame).unwrap_err();
        assert!(matches!(err, Error::DanglingReference { instance_id: 3 }));
        assert!(frame.commands.is_empty());
    }

    #[test]
    fn test_periodic_full_rebuild() {
        let device = HeadlessDevice::new();
        let (store, mesh) = quad_store(&device);
        let blas = Blas::build(&device, &store, mesh, &BlasOptions::default()).unwrap();
        let settings = Settings {
            full_rebuild_interval: Some(2),
            ..Settings::default()
        };
        let mut mgr = AccelStructureManager::new(&settings);
        let mut frame = FrameContext::new(2);
        mgr.add_instance(1, &blas, Mat4::IDENTITY, InstanceFlags::empty()).unwrap();

        let kinds: Vec<RebuildKind> = (0..5)
            .map(|_| {
                let kind = mgr.rebuild(&device, &mut frame).unwrap();
                frame.submit(&device, SubmitMode::Wait).unwrap();
                frame.advance();
                kind
            })
            .collect();
        use RebuildKind::*;
        assert_eq!(kinds, vec![Full, Refit, Refit, Full, Refit]);
    }
}
