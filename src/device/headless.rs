//! Deterministic in-memory device.
//!
//! Buffers are byte vectors placed at fake, aligned device addresses.
//! Acceleration structure builds are executed on the CPU far enough to
//! record primitive counts and bounds, so tests can observe what a real
//! device would have built. Submission is always synchronous.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::*;
use crate::accel::GpuInstance;
use crate::command::{Command, CommandList, CopyRegion, TraceRaysDesc};
use crate::rtpipe::{SbtRegionInfo, ShaderStage};
use crate::util::{align_up, BBox3f, DeviceMetrics, Error, Result, Vec3};

const SPIRV_MAGIC: u32 = 0x0723_0203;
const SPIRV_HEADER_BYTES: usize = 20;
const ADDRESS_BASE: u64 = 0x1_0000;
const MIN_BUFFER_ALIGNMENT: u64 = 16;

/// Counters of work executed by a [`HeadlessDevice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub submits: u64,
    pub barriers: u64,
    pub memory_barriers: u64,
    pub copies: u64,
    pub copied_bytes: u64,
    pub accel_builds: u64,
    pub accel_updates: u64,
    pub pipeline_binds: u64,
    pub traces: u64,
}

/// What the device knows about one acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelInfo {
    pub kind: AccelKind,
    pub size: u64,
    pub address: u64,
    /// A build command has executed into this structure.
    pub built: bool,
    /// Triangles for bottom level, instances for top level.
    pub primitive_count: u32,
    pub bounds: BBox3f,
    pub flags: AccelBuildFlags,
    pub builds: u32,
    pub updates: u32,
}

#[derive(Debug)]
struct BufferEntry {
    data: Vec<u8>,
    address: u64,
    alignment: u64,
    location: MemoryLocation,
    label: String,
}

#[derive(Debug)]
struct ModuleEntry {
    /// Set when the module is not valid SPIR-V.
    diagnostic: Option<String>,
}

#[derive(Debug)]
struct PipelineEntry {
    group_count: u32,
}

#[derive(Debug, Default)]
struct Inner {
    next_handle: u64,
    next_address: u64,
    buffers: HashMap<u64, BufferEntry>,
    images: HashMap<u64, ImageDesc>,
    accels: HashMap<u64, AccelInfo>,
    accel_buffers: HashMap<u64, BufferId>,
    modules: HashMap<u64, ModuleEntry>,
    pipelines: HashMap<u64, PipelineEntry>,
    lost: bool,
    stats: HeadlessStats,
}

impl Inner {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn buffer(&self, id: BufferId) -> Result<&BufferEntry> {
        self.buffers
            .get(&id.0)
            .ok_or_else(|| Error::not_found(format!("buffer {}", id.0)))
    }

    fn buffer_bytes(&self, id: BufferId, offset: u64, len: u64) -> Result<&[u8]> {
        let entry = self.buffer(id)?;
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= entry.data.len() as u64)
            .ok_or_else(|| {
                Error::backend(format!(
                    "range {offset}+{len} outside buffer '{}' ({} bytes)",
                    entry.label,
                    entry.data.len()
                ))
            })?;
        Ok(&entry.data[offset as usize..end as usize])
    }

    fn accel(&self, id: AccelId) -> Result<&AccelInfo> {
        self.accels
            .get(&id.0)
            .ok_or_else(|| Error::not_found(format!("acceleration structure {}", id.0)))
    }

    fn blas_by_address(&self, address: u64) -> Option<&AccelInfo> {
        self.accels
            .values()
            .find(|a| a.kind == AccelKind::BottomLevel && a.address == address)
    }
}

/// Software device with configurable ray-tracing limits.
pub struct HeadlessDevice {
    caps: DeviceCaps,
    metrics: DeviceMetrics,
    memory_budget: Option<u64>,
    inner: Mutex<Inner>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    pub fn new() -> Self {
        Self::with_properties(RtProperties::default())
    }

    pub fn with_properties(rt: RtProperties) -> Self {
        Self {
            caps: DeviceCaps {
                device_name: "headless".to_owned(),
                rt,
            },
            metrics: DeviceMetrics::new(),
            memory_budget: None,
            inner: Mutex::new(Inner {
                next_address: ADDRESS_BASE,
                ..Inner::default()
            }),
        }
    }

    /// Fail allocations that would push live bytes past `budget`.
    pub fn with_memory_budget(mut self, budget: Option<u64>) -> Self {
        self.memory_budget = budget;
        self
    }

    /// Simulate device loss: every later submit and creation fails.
    pub fn lose_device(&self) {
        tracing::warn!("headless device lost");
        self.inner.lock().lost = true;
    }

    pub fn stats(&self) -> HeadlessStats {
        self.inner.lock().stats
    }

    pub fn accel_info(&self, accel: AccelId) -> Option<AccelInfo> {
        self.inner.lock().accels.get(&accel.0).copied()
    }

    /// Read any buffer, including device-local ones.
    pub fn peek_buffer(&self, buffer: BufferId) -> Option<Vec<u8>> {
        self.inner.lock().buffers.get(&buffer.0).map(|b| b.data.clone())
    }

    fn check_alive(inner: &Inner) -> Result<()> {
        if inner.lost {
            return Err(Error::DeviceLost);
        }
        Ok(())
    }

    fn sizes_for(desc: &AccelBuildDesc) -> AccelBuildSizes {
        let primitives: u64 = desc.geometry.primitive_counts().iter().map(|&c| c as u64).sum();
        let per = match desc.kind() {
            AccelKind::BottomLevel => 64,
            AccelKind::TopLevel => 128,
        };
        AccelBuildSizes {
            accel_size: 256 + per * primitives,
            build_scratch_size: 128 + per / 2 * primitives,
            update_scratch_size: 64 + per / 4 * primitives,
        }
    }

    fn execute(&self, inner: &mut Inner, command: &Command, bound: &mut Option<PipelineId>) -> Result<()> {
        match command {
            Command::Barrier(_) => inner.stats.barriers += 1,
            Command::MemoryBarrier { .. } => inner.stats.memory_barriers += 1,
            Command::CopyBuffer { src, dst, regions } => {
                for region in regions {
                    self.copy(inner, *src, *dst, region)?;
                }
                inner.stats.copies += 1;
            }
            Command::BuildAccel(desc) => self.build_accel(inner, desc)?,
            Command::BindPipeline(pipeline) => {
                if !inner.pipelines.contains_key(&pipeline.0) {
                    return Err(Error::not_found(format!("pipeline {}", pipeline.0)));
                }
                *bound = Some(*pipeline);
                inner.stats.pipeline_binds += 1;
            }
            Command::TraceRays(desc) => {
                if bound.is_none() {
                    return Err(Error::backend("trace rays without a bound pipeline"));
                }
                self.check_trace(desc)?;
                inner.stats.traces += 1;
            }
        }
        Ok(())
    }

    fn copy(&self, inner: &mut Inner, src: BufferId, dst: BufferId, region: &CopyRegion) -> Result<()> {
        let bytes = inner.buffer_bytes(src, region.src_offset, region.size)?.to_vec();
        let dst_entry = inner
            .buffers
            .get_mut(&dst.0)
            .ok_or_else(|| Error::not_found(format!("buffer {}", dst.0)))?;
        let start = region.dst_offset as usize;
        let end = start + bytes.len();
        if end > dst_entry.data.len() {
            return Err(Error::backend(format!(
                "copy of {} bytes at {} overflows buffer '{}'",
                bytes.len(),
                region.dst_offset,
                dst_entry.label
            )));
        }
        dst_entry.data[start..end].copy_from_slice(&bytes);
        inner.stats.copied_bytes += region.size;
        Ok(())
    }

    fn build_accel(&self, inner: &mut Inner, desc: &AccelBuildDesc) -> Result<()> {
        let dst = desc.dst.ok_or_else(|| Error::backend("build without destination"))?;
        let dst_info = *inner.accel(dst)?;
        if dst_info.kind != desc.kind() {
            return Err(Error::backend("geometry kind does not match destination"));
        }

        let required = Self::sizes_for(desc);
        if required.accel_size > dst_info.size {
            return Err(Error::backend(format!(
                "destination holds {} bytes, build needs {}",
                dst_info.size, required.accel_size
            )));
        }

        let scratch = desc.scratch.ok_or_else(|| Error::backend("build without scratch buffer"))?;
        let scratch_entry = inner.buffer(scratch)?;
        let alignment = self.caps.rt.min_scratch_alignment as u64;
        if scratch_entry.address % alignment.max(1) != 0 {
            return Err(Error::backend(format!(
                "scratch address {:#x} violates alignment {alignment}",
                scratch_entry.address
            )));
        }
        let scratch_needed = match desc.mode {
            AccelBuildMode::Build => required.build_scratch_size,
            AccelBuildMode::Update => required.update_scratch_size,
        };
        if (scratch_entry.data.len() as u64) < scratch_needed {
            return Err(Error::backend(format!(
                "scratch holds {} bytes, build needs {scratch_needed}",
                scratch_entry.data.len()
            )));
        }

        let (primitive_count, bounds) = match &desc.geometry {
            AccelGeometry::Triangles(geometries) => Self::triangle_bounds(inner, geometries)?,
            AccelGeometry::Instances { buffer, offset, count } => {
                Self::instance_bounds(inner, *buffer, *offset, *count)?
            }
        };

        if desc.mode == AccelBuildMode::Update {
            let src = desc.src.ok_or_else(|| Error::backend("update without source"))?;
            let src_info = inner.accel(src)?;
            if !src_info.built {
                return Err(Error::backend("update source was never built"));
            }
            if !src_info.flags.contains(AccelBuildFlags::ALLOW_UPDATE) {
                return Err(Error::backend("update source was built without ALLOW_UPDATE"));
            }
            if src_info.primitive_count != primitive_count {
                return Err(Error::backend(format!(
                    "update changes primitive count {} -> {primitive_count}",
                    src_info.primitive_count
                )));
            }
        }

        let info = inner
            .accels
            .get_mut(&dst.0)
            .ok_or_else(|| Error::not_found(format!("acceleration structure {}", dst.0)))?;
        info.built = true;
        info.primitive_count = primitive_count;
        info.bounds = bounds;
        match desc.mode {
            AccelBuildMode::Build => {
                info.flags = desc.flags;
                info.builds += 1;
                inner.stats.accel_builds += 1;
            }
            AccelBuildMode::Update => {
                info.updates += 1;
                inner.stats.accel_updates += 1;
            }
        }
        Ok(())
    }

    fn triangle_bounds(inner: &Inner, geometries: &[TriangleGeometry]) -> Result<(u32, BBox3f)> {
        let mut bounds = BBox3f::EMPTY;
        let mut triangles = 0u32;
        for geo in geometries {
            let count = geo.triangle_count as u64 * 3;
            let indices = inner.buffer_bytes(geo.index_buffer, geo.primitive_offset(), count * 4)?;
            for chunk in indices.chunks_exact(4) {
                let index: u32 = bytemuck::pod_read_unaligned(chunk);
                if index > geo.max_vertex {
                    return Err(Error::backend(format!(
                        "index {index} exceeds max vertex {}",
                        geo.max_vertex
                    )));
                }
                let pos = inner.buffer_bytes(geo.vertex_buffer, index as u64 * geo.vertex_stride, 12)?;
                let p: [f32; 3] = bytemuck::pod_read_unaligned(pos);
                bounds.expand_by_point(Vec3::from_array(p));
            }
            triangles += geo.triangle_count;
        }
        Ok((triangles, bounds))
    }

    fn instance_bounds(inner: &Inner, buffer: BufferId, offset: u64, count: u32) -> Result<(u32, BBox3f)> {
        let stride = std::mem::size_of::<GpuInstance>() as u64;
        let bytes = inner.buffer_bytes(buffer, offset, stride * count as u64)?;
        let mut bounds = BBox3f::EMPTY;
        for chunk in bytes.chunks_exact(stride as usize) {
            let record: GpuInstance = bytemuck::pod_read_unaligned(chunk);
            let blas = inner.blas_by_address(record.blas_address).ok_or_else(|| {
                Error::backend(format!("instance references unknown BLAS {:#x}", record.blas_address))
            })?;
            if !blas.built {
                return Err(Error::backend("instance references a BLAS that was never built"));
            }
            bounds.expand_by_box(&blas.bounds.transformed(&record.transform()));
        }
        Ok((count, bounds))
    }

    fn check_trace(&self, desc: &TraceRaysDesc) -> Result<()> {
        let rt = &self.caps.rt;
        if desc.raygen.size == 0 || desc.raygen.size != desc.raygen.stride {
            return Err(Error::backend("raygen region must hold exactly one entry"));
        }
        // Zero alignments in the reported properties mean "unconstrained".
        let base_alignment = (rt.shader_group_base_alignment as u64).max(1);
        let handle_alignment = (rt.shader_group_handle_alignment as u64).max(1);
        let regions: [&SbtRegionInfo; 4] = [&desc.raygen, &desc.miss, &desc.hit, &desc.callable];
        for region in regions {
            if region.size == 0 {
                continue;
            }
            if region.address % base_alignment != 0 {
                return Err(Error::backend(format!(
                    "SBT region address {:#x} violates base alignment",
                    region.address
                )));
            }
            if region.stride % handle_alignment != 0
                || region.stride > rt.max_shader_group_stride as u64
            {
                return Err(Error::backend(format!("invalid SBT stride {}", region.stride)));
            }
        }
        if desc.width == 0 || desc.height == 0 || desc.depth == 0 {
            return Err(Error::backend("empty trace extent"));
        }
        Ok(())
    }

    fn validate_spirv(code: &[u8]) -> Option<String> {
        if code.len() < SPIRV_HEADER_BYTES || code.len() % 4 != 0 {
            return Some(format!("truncated SPIR-V module ({} bytes)", code.len()));
        }
        let magic: u32 = bytemuck::pod_read_unaligned(&code[..4]);
        if magic != SPIRV_MAGIC {
            return Some(format!("invalid SPIR-V magic {magic:#010x}"));
        }
        None
    }

    fn group_handle(&self, pipeline: PipelineId, group: u32) -> Vec<u8> {
        let size = self.caps.rt.shader_group_handle_size as usize;
        let mut seed = Vec::with_capacity(12);
        seed.extend_from_slice(&pipeline.0.to_le_bytes());
        seed.extend_from_slice(&group.to_le_bytes());
        (0..size)
            .map(|i| match seed.get(i) {
                Some(b) => *b,
                None => (group as u8).wrapping_mul(31) ^ (i as u8) ^ 0x5a,
            })
            .collect()
    }
}

impl Device for HeadlessDevice {
    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    fn metrics(&self) -> &DeviceMetrics {
        &self.metrics
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId> {
        let mut inner = self.inner.lock();
        Self::check_alive(&inner)?;
        if desc.size == 0 {
            return Err(Error::backend(format!("zero-sized buffer '{}'", desc.label)));
        }
        if let Some(budget) = self.memory_budget {
            if self.metrics.allocated_bytes() + desc.size > budget {
                return Err(Error::AllocationFailure {
                    size: desc.size,
                    reason: format!("memory budget of {budget} bytes exhausted"),
                });
            }
        }
        let alignment = desc.alignment.max(MIN_BUFFER_ALIGNMENT);
        let address = align_up(inner.next_address, alignment);
        inner.next_address = address + desc.size;
        let id = inner.next_handle();
        inner.buffers.insert(
            id,
            BufferEntry {
                data: vec![0; desc.size as usize],
                address,
                alignment,
                location: desc.location,
                label: desc.label.clone(),
            },
        );
        self.metrics.buffer_created(desc.size);
        Ok(BufferId(id))
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        let mut inner = self.inner.lock();
        match inner.buffers.remove(&buffer.0) {
            Some(entry) => self.metrics.buffer_destroyed(entry.data.len() as u64),
            None => tracing::warn!(buffer = buffer.0, "destroying unknown buffer"),
        }
    }

    fn buffer_address(&self, buffer: BufferId) -> Result<u64> {
        let inner = self.inner.lock();
        let entry = inner.buffer(buffer)?;
        debug_assert_eq!(entry.address % entry.alignment, 0);
        Ok(entry.address)
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_alive(&inner)?;
        let entry = inner
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| Error::not_found(format!("buffer {}", buffer.0)))?;
        if !entry.location.is_host_visible() {
            return Err(Error::backend(format!("buffer '{}' is not host visible", entry.label)));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > entry.data.len() {
            return Err(Error::backend(format!(
                "write of {} bytes at {offset} overflows buffer '{}'",
                data.len(),
                entry.label
            )));
        }
        entry.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let entry = inner.buffer(buffer)?;
        if !entry.location.is_host_visible() {
            return Err(Error::backend(format!("buffer '{}' is not host visible", entry.label)));
        }
        Ok(inner.buffer_bytes(buffer, offset, len)?.to_vec())
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<ImageId> {
        let mut inner = self.inner.lock();
        Self::check_alive(&inner)?;
        if desc.width == 0 || desc.height == 0 {
            return Err(Error::backend(format!("zero-sized image '{}'", desc.label)));
        }
        let id = inner.next_handle();
        inner.images.insert(id, desc.clone());
        self.metrics.image_created();
        Ok(ImageId(id))
    }

    fn destroy_image(&self, image: ImageId) {
        if self.inner.lock().images.remove(&image.0).is_some() {
            self.metrics.image_destroyed();
        }
    }

    fn accel_build_sizes(&self, desc: &AccelBuildDesc) -> Result<AccelBuildSizes> {
        Self::check_alive(&self.inner.lock())?;
        Ok(Self::sizes_for(desc))
    }

    fn create_accel(&self, kind: AccelKind, buffer: BufferId, size: u64) -> Result<AccelId> {
        let mut inner = self.inner.lock();
        Self::check_alive(&inner)?;
        let entry = inner.buffer(buffer)?;
        if (entry.data.len() as u64) < size {
            return Err(Error::backend(format!(
                "buffer '{}' too small for acceleration structure of {size} bytes",
                entry.label
            )));
        }
        let address = entry.address;
        let id = inner.next_handle();
        inner.accels.insert(
            id,
            AccelInfo {
                kind,
                size,
                address,
                built: false,
                primitive_count: 0,
                bounds: BBox3f::EMPTY,
                flags: AccelBuildFlags::empty(),
                builds: 0,
                updates: 0,
            },
        );
        inner.accel_buffers.insert(id, buffer);
        self.metrics.accel_created();
        Ok(AccelId(id))
    }

    fn destroy_accel(&self, accel: AccelId) {
        let mut inner = self.inner.lock();
        if inner.accels.remove(&accel.0).is_some() {
            inner.accel_buffers.remove(&accel.0);
            self.metrics.accel_destroyed();
        }
    }

    fn accel_address(&self, accel: AccelId) -> Result<u64> {
        Ok(self.inner.lock().accel(accel)?.address)
    }

    fn create_shader_module(&self, desc: &ShaderModuleDesc<'_>) -> Result<ShaderModuleId> {
        let mut inner = self.inner.lock();
        Self::check_alive(&inner)?;
        let mut diagnostic = Self::validate_spirv(desc.code);
        if diagnostic.is_none() && desc.entry_point.is_empty() {
            diagnostic = Some("empty entry point name".to_owned());
        }
        let id = inner.next_handle();
        inner.modules.insert(id, ModuleEntry { diagnostic });
        Ok(ShaderModuleId(id))
    }

    fn destroy_shader_module(&self, module: ShaderModuleId) {
        self.inner.lock().modules.remove(&module.0);
    }

    fn create_rt_pipeline(&self, desc: &RtPipelineDesc) -> Result<PipelineId> {
        let mut inner = self.inner.lock();
        Self::check_alive(&inner)?;

        for stage in &desc.stages {
            let module = inner
                .modules
                .get(&stage.module.0)
                .ok_or_else(|| Error::not_found(format!("shader module {}", stage.module.0)))?;
            if let Some(diagnostic) = &module.diagnostic {
                return Err(Error::CompilationFailure {
                    stage: stage.stage,
                    diagnostic: diagnostic.clone(),
                });
            }
        }

        let stage_of = |index: Option<u32>| -> Result<Option<ShaderStage>> {
            match index {
                None => Ok(None),
                Some(i) => desc
                    .stages
                    .get(i as usize)
                    .map(|s| Some(s.stage))
                    .ok_or_else(|| Error::backend(format!("group references missing stage {i}"))),
            }
        };
        for group in &desc.groups {
            let general = stage_of(group.general)?;
            let closest = stage_of(group.closest_hit)?;
            let any = stage_of(group.any_hit)?;
            let intersection = stage_of(group.intersection)?;
            let valid = match group.ty {
                GroupType::General => {
                    matches!(
                        general,
                        Some(ShaderStage::Raygen | ShaderStage::Miss | ShaderStage::Callable)
                    ) && closest.is_none()
                        && any.is_none()
                        && intersection.is_none()
                }
                GroupType::TrianglesHit | GroupType::ProceduralHit => {
                    general.is_none()
                        && matches!(closest, None | Some(ShaderStage::ClosestHit))
                        && matches!(any, None | Some(ShaderStage::AnyHit))
                        && match group.ty {
                            GroupType::ProceduralHit => intersection == Some(ShaderStage::Intersection),
                            _ => intersection.is_none(),
                        }
                }
            };
            if !valid {
                return Err(Error::backend(format!("malformed shader group {group:?}")));
            }
        }

        if desc.max_recursion_depth > self.caps.rt.max_ray_recursion_depth {
            return Err(Error::backend(format!(
                "recursion depth {} exceeds device limit {}",
                desc.max_recursion_depth, self.caps.rt.max_ray_recursion_depth
            )));
        }

        let id = inner.next_handle();
        inner.pipelines.insert(
            id,
            PipelineEntry {
                group_count: desc.groups.len() as u32,
            },
        );
        self.metrics.pipeline_created();
        Ok(PipelineId(id))
    }

    fn shader_group_handles(&self, pipeline: PipelineId, first_group: u32, group_count: u32) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let entry = inner
            .pipelines
            .get(&pipeline.0)
            .ok_or_else(|| Error::not_found(format!("pipeline {}", pipeline.0)))?;
        if first_group + group_count > entry.group_count {
            return Err(Error::backend(format!(
                "group range {first_group}+{group_count} outside pipeline with {} groups",
                entry.group_count
            )));
        }
        Ok((first_group..first_group + group_count)
            .flat_map(|g| self.group_handle(pipeline, g))
            .collect())
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        self.inner.lock().pipelines.remove(&pipeline.0);
    }

    fn submit(&self, commands: &CommandList, _mode: SubmitMode) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_alive(&inner)?;
        let mut bound = None;
        for command in commands.commands() {
            self.execute(&mut inner, command, &mut bound)?;
        }
        inner.stats.submits += 1;
        self.metrics.submitted();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spirv() -> Vec<u8> {
        let words: [u32; 5] = [SPIRV_MAGIC, 0x0001_0500, 0, 8, 0];
        bytemuck::cast_slice(&words).to_vec()
    }

    #[test]
    fn test_buffer_alignment_and_rw() {
        let device = HeadlessDevice::new();
        let desc = BufferDesc::new("a", 100, BufferUsage::STORAGE, MemoryLocation::CpuToGpu).with_alignment(256);
        let a = device.create_buffer(&desc).unwrap();
        let b = device.create_buffer(&desc).unwrap();
        assert_eq!(device.buffer_address(a).unwrap() % 256, 0);
        assert_eq!(device.buffer_address(b).unwrap() % 256, 0);
        assert_ne!(device.buffer_address(a).unwrap(), device.buffer_address(b).unwrap());

        device.write_buffer(a, 4, &[1, 2, 3]).unwrap();
        assert_eq!(device.read_buffer(a, 3, 5).unwrap(), vec![0, 1, 2, 3, 0]);
        assert!(device.write_buffer(a, 99, &[1, 2]).is_err());

        assert_eq!(device.metrics().snapshot().live_buffers, 2);
        device.destroy_buffer(a);
        assert_eq!(device.metrics().snapshot().live_buffers, 1);
        assert_eq!(device.metrics().allocated_bytes(), 100);
    }

    #[test]
    fn test_device_local_not_writable() {
        let device = HeadlessDevice::new();
        let buf = device
            .create_buffer(&BufferDesc::new("gpu", 64, BufferUsage::STORAGE, MemoryLocation::GpuOnly))
            .unwrap();
        assert!(device.write_buffer(buf, 0, &[0; 4]).is_err());
    }

    #[test]
    fn test_memory_budget() {
        let device = HeadlessDevice::new().with_memory_budget(Some(1024));
        let desc = BufferDesc::new("big", 800, BufferUsage::STORAGE, MemoryLocation::CpuToGpu);
        device.create_buffer(&desc).unwrap();
        let err = device.create_buffer(&desc).unwrap_err();
        assert!(matches!(err, Error::AllocationFailure { size: 800, .. }));
    }

    #[test]
    fn test_lost_device() {
        let device = HeadlessDevice::new();
        device.submit(&CommandList::new(), SubmitMode::Wait).unwrap();
        device.lose_device();
        let err = device.submit(&CommandList::new(), SubmitMode::NoWait).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(device.stats().submits, 1);
    }

    #[test]
    fn test_bad_spirv_fails_pipeline() {
        let device = HeadlessDevice::new();
        let good = device
            .create_shader_module(&ShaderModuleDesc {
                label: "rgen",
                stage: ShaderStage::Raygen,
                code: &spirv(),
                entry_point: "main",
            })
            .unwrap();
        let bad = device
            .create_shader_module(&ShaderModuleDesc {
                label: "rchit",
                stage: ShaderStage::ClosestHit,
                code: &[0u8; 24],
                entry_point: "main",
            })
            .unwrap();
        let desc = RtPipelineDesc {
            label: "test".into(),
            stages: vec![
                PipelineStageDesc {
                    module: good,
                    stage: ShaderStage::Raygen,
                    entry_point: "main".into(),
                },
                PipelineStageDesc {
                    module: bad,
                    stage: ShaderStage::ClosestHit,
                    entry_point: "main".into(),
                },
            ],
            groups: vec![
                PipelineGroupDesc {
                    ty: GroupType::General,
                    general: Some(0),
                    closest_hit: None,
                    any_hit: None,
                    intersection: None,
                },
                PipelineGroupDesc {
                    ty: GroupType::TrianglesHit,
                    general: None,
                    closest_hit: Some(1),
                    any_hit: None,
                    intersection: None,
                },
            ],
            max_recursion_depth: 1,
            layout: PipelineLayoutId(0),
        };
        match device.create_rt_pipeline(&desc) {
            Err(Error::CompilationFailure { stage, .. }) => assert_eq!(stage, ShaderStage::ClosestHit),
            other => panic!("expected compilation failure, got {other:?}"),
        }
        assert_eq!(device.metrics().snapshot().pipelines_created, 0);
    }

    #[test]
    fn test_group_handles_deterministic() {
        let device = HeadlessDevice::new();
        let a = device.group_handle(PipelineId(3), 0);
        let b = device.group_handle(PipelineId(3), 1);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert_eq!(a, device.group_handle(PipelineId(3), 0));
    }

    #[test]
    fn test_zero_alignments_do_not_constrain_traces() {
        let device = HeadlessDevice::with_properties(RtProperties {
            shader_group_handle_alignment: 0,
            shader_group_base_alignment: 0,
            ..RtProperties::default()
        });
        let module = device
            .create_shader_module(&ShaderModuleDesc {
                label: "rgen",
                stage: ShaderStage::Raygen,
                code: &spirv(),
                entry_point: "main",
            })
            .unwrap();
        let pipeline = device
            .create_rt_pipeline(&RtPipelineDesc {
                label: "rgen-only".into(),
                stages: vec![PipelineStageDesc {
                    module,
                    stage: ShaderStage::Raygen,
                    entry_point: "main".into(),
                }],
                groups: vec![PipelineGroupDesc {
                    ty: GroupType::General,
                    general: Some(0),
                    closest_hit: None,
                    any_hit: None,
                    intersection: None,
                }],
                max_recursion_depth: 1,
                layout: PipelineLayoutId(0),
            })
            .unwrap();

        let mut commands = CommandList::new();
        commands.bind_pipeline(pipeline);
        commands.trace_rays(TraceRaysDesc {
            raygen: SbtRegionInfo {
                address: 0x1_0024,
                stride: 36,
                size: 36,
            },
            miss: SbtRegionInfo::EMPTY,
            hit: SbtRegionInfo::EMPTY,
            callable: SbtRegionInfo::EMPTY,
            width: 8,
            height: 8,
            depth: 1,
        });
        device.submit(&commands, SubmitMode::Wait).unwrap();
        assert_eq!(device.stats().traces, 1);
    }
}
