//! Vulkan backend on `ash` with `gpu-allocator` managed memory.
//!
//! The host creates the instance and logical device with
//! `VK_KHR_acceleration_structure`, `VK_KHR_ray_tracing_pipeline`,
//! `VK_KHR_deferred_host_operations` and the buffer device address feature
//! enabled, then hands them over. The host must drop this device before
//! destroying the `ash::Device`.

use std::collections::HashMap;
use std::ffi::CString;

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation as GpuLocation;
use parking_lot::Mutex;

use super::*;
use crate::command::{Command, CommandList, TraceRaysDesc};
use crate::rtpipe::{SbtRegionInfo, ShaderStage};
use crate::state::{
    AccessFlags, AccessState, BarrierDescriptor, ImageAspect, ImageLayout, PipelineStages, ResourceKind,
    SubresourceRange,
};
use crate::util::{DeviceMetrics, Error, Result};

struct BufferEntry {
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
    address: u64,
}

struct ImageEntry {
    image: vk::Image,
    allocation: Option<Allocation>,
}

struct AccelEntry {
    accel: vk::AccelerationStructureKHR,
    address: u64,
}

struct InFlight {
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
}

struct Inner {
    allocator: Allocator,
    command_pool: vk::CommandPool,
    next_handle: u64,
    buffers: HashMap<u64, BufferEntry>,
    images: HashMap<u64, ImageEntry>,
    accels: HashMap<u64, AccelEntry>,
    modules: HashMap<u64, vk::ShaderModule>,
    layouts: HashMap<u64, vk::PipelineLayout>,
    pipelines: HashMap<u64, vk::Pipeline>,
    in_flight: Vec<InFlight>,
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

    fn accel(&self, id: AccelId) -> Result<vk::AccelerationStructureKHR> {
        self.accels
            .get(&id.0)
            .map(|a| a.accel)
            .ok_or_else(|| Error::not_found(format!("acceleration structure {}", id.0)))
    }
}

/// [`Device`] backed by a Vulkan logical device.
pub struct VulkanDevice {
    device: ash::Device,
    queue: vk::Queue,
    accel_loader: ash::khr::acceleration_structure::Device,
    rt_loader: ash::khr::ray_tracing_pipeline::Device,
    caps: DeviceCaps,
    metrics: DeviceMetrics,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("caps", &self.caps)
            .finish_non_exhaustive()
    }
}

fn vk_err(what: &str, result: vk::Result) -> Error {
    match result {
        vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => Error::AllocationFailure {
            size: 0,
            reason: format!("{what}: {result:?}"),
        },
        _ => Error::backend(format!("{what}: {result:?}")),
    }
}

impl VulkanDevice {
    /// Wrap an existing device. `queue_family` must support compute.
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family: u32,
    ) -> Result<Self> {
        let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
        let mut as_props = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let device_name = {
            let mut props2 = vk::PhysicalDeviceProperties2::default()
                .push_next(&mut rt_props)
                .push_next(&mut as_props);
            unsafe { instance.get_physical_device_properties2(physical_device, &mut props2) };
            props2
                .properties
                .device_name_as_c_str()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default()
        };

        let caps = DeviceCaps {
            device_name,
            rt: RtProperties {
                shader_group_handle_size: rt_props.shader_group_handle_size,
                shader_group_handle_alignment: rt_props.shader_group_handle_alignment,
                shader_group_base_alignment: rt_props.shader_group_base_alignment,
                max_shader_group_stride: rt_props.max_shader_group_stride,
                min_scratch_alignment: as_props.min_acceleration_structure_scratch_offset_alignment,
                max_ray_recursion_depth: rt_props.max_ray_recursion_depth,
            },
        };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| Error::backend(format!("allocator: {e}")))?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool =
            unsafe { device.create_command_pool(&pool_info, None) }.map_err(|e| vk_err("create_command_pool", e))?;
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let accel_loader = ash::khr::acceleration_structure::Device::new(instance, &device);
        let rt_loader = ash::khr::ray_tracing_pipeline::Device::new(instance, &device);

        tracing::info!(device = %caps.device_name, rt = ?caps.rt, "vulkan device ready");
        Ok(Self {
            device,
            queue,
            accel_loader,
            rt_loader,
            caps,
            metrics: DeviceMetrics::new(),
            inner: Mutex::new(Inner {
                allocator,
                command_pool,
                next_handle: 0,
                buffers: HashMap::new(),
                images: HashMap::new(),
                accels: HashMap::new(),
                modules: HashMap::new(),
                layouts: HashMap::new(),
                pipelines: HashMap::new(),
                in_flight: Vec::new(),
            }),
        })
    }

    /// Make a host-created pipeline layout usable in [`RtPipelineDesc`].
    /// The host keeps ownership.
    pub fn register_pipeline_layout(&self, layout: vk::PipelineLayout) -> PipelineLayoutId {
        let mut inner = self.inner.lock();
        let id = inner.next_handle();
        inner.layouts.insert(id, layout);
        PipelineLayoutId(id)
    }

    pub fn raw_buffer(&self, id: BufferId) -> Option<vk::Buffer> {
        self.inner.lock().buffers.get(&id.0).map(|b| b.buffer)
    }

    pub fn raw_image(&self, id: ImageId) -> Option<vk::Image> {
        self.inner.lock().images.get(&id.0).map(|i| i.image)
    }

    /// For descriptor writes of the TLAS.
    pub fn raw_accel(&self, id: AccelId) -> Option<vk::AccelerationStructureKHR> {
        self.inner.lock().accels.get(&id.0).map(|a| a.accel)
    }

    /// Free command buffers whose fences signaled.
    fn reclaim(&self, inner: &mut Inner) -> Result<()> {
        let mut i = 0;
        while i < inner.in_flight.len() {
            let done = unsafe { self.device.get_fence_status(inner.in_flight[i].fence) }
                .map_err(|e| vk_err("get_fence_status", e))?;
            if done {
                let f = inner.in_flight.swap_remove(i);
                unsafe {
                    self.device.free_command_buffers(inner.command_pool, &[f.cmd]);
                    self.device.destroy_fence(f.fence, None);
                }
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    fn build_geometry(
        inner: &Inner,
        device: &ash::Device,
        geometry: &AccelGeometry,
    ) -> Result<(Vec<vk::AccelerationStructureGeometryKHR<'static>>, Vec<vk::AccelerationStructureBuildRangeInfoKHR>)>
    {
        let address = |id: BufferId| -> Result<u64> {
            let entry = inner.buffer(id)?;
            Ok(unsafe {
                device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(entry.buffer))
            })
        };
        let mut geometries = Vec::new();
        let mut ranges = Vec::new();
        match geometry {
            AccelGeometry::Triangles(tris) => {
                for t in tris {
                    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                        .vertex_format(vk::Format::R32G32B32_SFLOAT)
                        .vertex_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: address(t.vertex_buffer)?,
                        })
                        .vertex_stride(t.vertex_stride)
                        .max_vertex(t.max_vertex)
                        .index_type(vk::IndexType::UINT32)
                        .index_data(vk::DeviceOrHostAddressConstKHR {
                            device_address: address(t.index_buffer)?,
                        });
                    let flags = if t.opaque {
                        vk::GeometryFlagsKHR::OPAQUE
                    } else {
                        vk::GeometryFlagsKHR::empty()
                    };
                    geometries.push(
                        vk::AccelerationStructureGeometryKHR::default()
                            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                            .flags(flags)
                            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles }),
                    );
                    ranges.push(
                        vk::AccelerationStructureBuildRangeInfoKHR::default()
                            .primitive_count(t.triangle_count)
                            .primitive_offset(t.primitive_offset() as u32),
                    );
                }
            }
            AccelGeometry::Instances { buffer, offset, count } => {
                let instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
                    .array_of_pointers(false)
                    .data(vk::DeviceOrHostAddressConstKHR {
                        device_address: address(*buffer)? + offset,
                    });
                geometries.push(
                    vk::AccelerationStructureGeometryKHR::default()
                        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
                        .geometry(vk::AccelerationStructureGeometryDataKHR { instances }),
                );
                ranges.push(vk::AccelerationStructureBuildRangeInfoKHR::default().primitive_count(*count));
            }
        }
        Ok((geometries, ranges))
    }

    fn record(&self, inner: &Inner, cmd: vk::CommandBuffer, command: &Command) -> Result<()> {
        let device = &self.device;
        match command {
            Command::Barrier(barrier) => self.record_barrier(inner, cmd, barrier)?,
            Command::MemoryBarrier { src, dst } => {
                let barrier = vk::MemoryBarrier::default()
                    .src_access_mask(vk_access(src.access))
                    .dst_access_mask(vk_access(dst.access));
                unsafe {
                    device.cmd_pipeline_barrier(
                        cmd,
                        src_stages(src),
                        dst_stages(dst),
                        vk::DependencyFlags::empty(),
                        &[barrier],
                        &[],
                        &[],
                    );
                }
            }
            Command::CopyBuffer { src, dst, regions } => {
                let copies: Vec<vk::BufferCopy> = regions
                    .iter()
                    .map(|r| vk::BufferCopy {
                        src_offset: r.src_offset,
                        dst_offset: r.dst_offset,
                        size: r.size,
                    })
                    .collect();
                let (src, dst) = (inner.buffer(*src)?.buffer, inner.buffer(*dst)?.buffer);
                unsafe { device.cmd_copy_buffer(cmd, src, dst, &copies) };
            }
            Command::BuildAccel(desc) => {
                let dst = desc
                    .dst
                    .ok_or_else(|| Error::backend("acceleration structure build without destination"))?;
                let scratch = desc
                    .scratch
                    .ok_or_else(|| Error::backend("acceleration structure build without scratch"))?;
                let scratch = inner.buffer(scratch)?;
                let scratch_address = unsafe {
                    device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(scratch.buffer))
                };
                let (geometries, ranges) = Self::build_geometry(inner, device, &desc.geometry)?;
                let mut info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                    .ty(vk_accel_kind(desc.kind()))
                    .flags(vk_build_flags(desc.flags))
                    .mode(match desc.mode {
                        AccelBuildMode::Build => vk::BuildAccelerationStructureModeKHR::BUILD,
                        AccelBuildMode::Update => vk::BuildAccelerationStructureModeKHR::UPDATE,
                    })
                    .dst_acceleration_structure(inner.accel(dst)?)
                    .geometries(&geometries)
                    .scratch_data(vk::DeviceOrHostAddressKHR {
                        device_address: scratch_address,
                    });
                if let Some(src) = desc.src {
                    info = info.src_acceleration_structure(inner.accel(src)?);
                }
                unsafe {
                    self.accel_loader
                        .cmd_build_acceleration_structures(cmd, &[info], &[ranges.as_slice()]);
                }
            }
            Command::BindPipeline(pipeline) => {
                let pipeline = inner
                    .pipelines
                    .get(&pipeline.0)
                    .copied()
                    .ok_or_else(|| Error::not_found(format!("pipeline {}", pipeline.0)))?;
                unsafe { device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, pipeline) };
            }
            Command::TraceRays(desc) => self.record_trace(cmd, desc),
        }
        Ok(())
    }

    fn record_barrier(&self, inner: &Inner, cmd: vk::CommandBuffer, barrier: &BarrierDescriptor) -> Result<()> {
        let (src_queue, dst_queue) = if barrier.src.queue.is_ignored() || barrier.dst.queue.is_ignored() {
            (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED)
        } else {
            (barrier.src.queue.0, barrier.dst.queue.0)
        };
        let (src_access, dst_access) = (vk_access(barrier.src.access), vk_access(barrier.dst.access));
        let (mut memory, mut buffers, mut images) = (Vec::new(), Vec::new(), Vec::new());
        match barrier.resource.kind {
            ResourceKind::Buffer => {
                let entry = inner.buffer(BufferId(barrier.resource.raw))?;
                buffers.push(
                    vk::BufferMemoryBarrier::default()
                        .src_access_mask(src_access)
                        .dst_access_mask(dst_access)
                        .src_queue_family_index(src_queue)
                        .dst_queue_family_index(dst_queue)
                        .buffer(entry.buffer)
                        .offset(0)
                        .size(vk::WHOLE_SIZE),
                );
            }
            ResourceKind::Image => {
                let image = inner
                    .images
                    .get(&barrier.resource.raw)
                    .ok_or_else(|| Error::not_found(format!("image {}", barrier.resource.raw)))?;
                images.push(
                    vk::ImageMemoryBarrier::default()
                        .src_access_mask(src_access)
                        .dst_access_mask(dst_access)
                        .old_layout(vk_layout(barrier.src.layout))
                        .new_layout(vk_layout(barrier.dst.layout))
                        .src_queue_family_index(src_queue)
                        .dst_queue_family_index(dst_queue)
                        .image(image.image)
                        .subresource_range(vk_range(&barrier.range)),
                );
            }
            ResourceKind::Accel => {
                memory.push(
                    vk::MemoryBarrier::default()
                        .src_access_mask(src_access)
                        .dst_access_mask(dst_access),
                );
            }
        }
        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stages(&barrier.src),
                dst_stages(&barrier.dst),
                vk::DependencyFlags::empty(),
                &memory,
                &buffers,
                &images,
            );
        }
        Ok(())
    }

    fn record_trace(&self, cmd: vk::CommandBuffer, desc: &TraceRaysDesc) {
        let region = |r: &SbtRegionInfo| vk::StridedDeviceAddressRegionKHR {
            device_address: r.address,
            stride: r.stride,
            size: r.size,
        };
        unsafe {
            self.rt_loader.cmd_trace_rays(
                cmd,
                &region(&desc.raygen),
                &region(&desc.miss),
                &region(&desc.hit),
                &region(&desc.callable),
                desc.width,
                desc.height,
                desc.depth,
            );
        }
    }

    fn free_allocation(inner: &mut Inner, allocation: Option<Allocation>) {
        if let Some(allocation) = allocation {
            if let Err(e) = inner.allocator.free(allocation) {
                tracing::warn!(error = %e, "failed to free allocation");
            }
        }
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        unsafe {
            let _ = self.device.device_wait_idle();
            for f in inner.in_flight.drain(..) {
                self.device.destroy_fence(f.fence, None);
            }
            for (_, p) in inner.pipelines.drain() {
                self.device.destroy_pipeline(p, None);
            }
            for (_, m) in inner.modules.drain() {
                self.device.destroy_shader_module(m, None);
            }
            for (_, a) in inner.accels.drain() {
                self.accel_loader.destroy_acceleration_structure(a.accel, None);
            }
            let images: Vec<_> = inner.images.drain().map(|(_, i)| i).collect();
            for image in images {
                self.device.destroy_image(image.image, None);
                Self::free_allocation(inner, image.allocation);
            }
            let buffers: Vec<_> = inner.buffers.drain().map(|(_, b)| b).collect();
            for buffer in buffers {
                self.device.destroy_buffer(buffer.buffer, None);
                Self::free_allocation(inner, buffer.allocation);
            }
            self.device.destroy_command_pool(inner.command_pool, None);
        }
    }
}

impl Device for VulkanDevice {
    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    fn metrics(&self) -> &DeviceMetrics {
        &self.metrics
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId> {
        if desc.size == 0 {
            return Err(Error::backend(format!("zero-sized buffer '{}'", desc.label)));
        }
        let info = vk::BufferCreateInfo::default()
            .size(desc.size)
            .usage(vk_buffer_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&info, None) }.map_err(|e| vk_err("create_buffer", e))?;
        let mut requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        requirements.alignment = requirements.alignment.max(desc.alignment);

        let mut inner = self.inner.lock();
        let allocation = inner.allocator.allocate(&AllocationCreateDesc {
            name: &desc.label,
            requirements,
            location: gpu_location(desc.location),
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(a) => a,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(Error::AllocationFailure {
                    size: desc.size,
                    reason: e.to_string(),
                });
            }
        };
        if let Err(e) = unsafe { self.device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) } {
            unsafe { self.device.destroy_buffer(buffer, None) };
            Self::free_allocation(&mut inner, Some(allocation));
            return Err(vk_err("bind_buffer_memory", e));
        }
        let address = if desc.usage.contains(BufferUsage::SHADER_DEVICE_ADDRESS) {
            unsafe { self.device.get_buffer_device_address(&vk::BufferDeviceAddressInfo::default().buffer(buffer)) }
        } else {
            0
        };
        let id = inner.next_handle();
        inner.buffers.insert(
            id,
            BufferEntry {
                buffer,
                allocation: Some(allocation),
                size: desc.size,
                address,
            },
        );
        self.metrics.buffer_created(desc.size);
        tracing::trace!(label = %desc.label, size = desc.size, "buffer created");
        Ok(BufferId(id))
    }

    fn destroy_buffer(&self, buffer: BufferId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.buffers.remove(&buffer.0) {
            unsafe { self.device.destroy_buffer(entry.buffer, None) };
            Self::free_allocation(&mut inner, entry.allocation);
            self.metrics.buffer_destroyed(entry.size);
        }
    }

    fn buffer_address(&self, buffer: BufferId) -> Result<u64> {
        let inner = self.inner.lock();
        let entry = inner.buffer(buffer)?;
        if entry.address == 0 {
            return Err(Error::backend(format!("buffer {} has no device address", buffer.0)));
        }
        Ok(entry.address)
    }

    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| Error::not_found(format!("buffer {}", buffer.0)))?;
        let mapped = entry
            .allocation
            .as_mut()
            .and_then(|a| a.mapped_slice_mut())
            .ok_or_else(|| Error::backend(format!("buffer {} is not host visible", buffer.0)))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > mapped.len() {
            return Err(Error::backend(format!(
                "write of {} bytes at {offset} overflows buffer {}",
                data.len(),
                buffer.0
            )));
        }
        mapped[start..end].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        let entry = inner.buffer(buffer)?;
        let mapped = entry
            .allocation
            .as_ref()
            .and_then(|a| a.mapped_slice())
            .ok_or_else(|| Error::backend(format!("buffer {} is not host visible", buffer.0)))?;
        mapped
            .get(offset as usize..(offset + len) as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::backend(format!("read past the end of buffer {}", buffer.0)))
    }

    fn create_image(&self, desc: &ImageDesc) -> Result<ImageId> {
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format(desc.format))
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(desc.mip_levels)
            .array_layers(desc.array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk_image_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { self.device.create_image(&info, None) }.map_err(|e| vk_err("create_image", e))?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let mut inner = self.inner.lock();
        let allocation = match inner.allocator.allocate(&AllocationCreateDesc {
            name: &desc.label,
            requirements,
            location: GpuLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(a) => a,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(Error::AllocationFailure {
                    size: requirements.size,
                    reason: e.to_string(),
                });
            }
        };
        if let Err(e) = unsafe { self.device.bind_image_memory(image, allocation.memory(), allocation.offset()) } {
            unsafe { self.device.destroy_image(image, None) };
            Self::free_allocation(&mut inner, Some(allocation));
            return Err(vk_err("bind_image_memory", e));
        }
        let id = inner.next_handle();
        inner.images.insert(
            id,
            ImageEntry {
                image,
                allocation: Some(allocation),
            },
        );
        self.metrics.image_created();
        Ok(ImageId(id))
    }

    fn destroy_image(&self, image: ImageId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.images.remove(&image.0) {
            unsafe { self.device.destroy_image(entry.image, None) };
            Self::free_allocation(&mut inner, entry.allocation);
            self.metrics.image_destroyed();
        }
    }

    fn accel_build_sizes(&self, desc: &AccelBuildDesc) -> Result<AccelBuildSizes> {
        let inner = self.inner.lock();
        let (geometries, _) = Self::build_geometry(&inner, &self.device, &desc.geometry)?;
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk_accel_kind(desc.kind()))
            .flags(vk_build_flags(desc.flags))
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.accel_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &info,
                &desc.geometry.primitive_counts(),
                &mut sizes,
            );
        }
        Ok(AccelBuildSizes {
            accel_size: sizes.acceleration_structure_size,
            build_scratch_size: sizes.build_scratch_size,
            update_scratch_size: sizes.update_scratch_size,
        })
    }

    fn create_accel(&self, kind: AccelKind, buffer: BufferId, size: u64) -> Result<AccelId> {
        let mut inner = self.inner.lock();
        let buffer = inner.buffer(buffer)?.buffer;
        let info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer)
            .offset(0)
            .size(size)
            .ty(vk_accel_kind(kind));
        let accel = unsafe { self.accel_loader.create_acceleration_structure(&info, None) }
            .map_err(|e| vk_err("create_acceleration_structure", e))?;
        let address = unsafe {
            self.accel_loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(accel),
            )
        };
        let id = inner.next_handle();
        inner.accels.insert(id, AccelEntry { accel, address });
        self.metrics.accel_created();
        Ok(AccelId(id))
    }

    fn destroy_accel(&self, accel: AccelId) {
        if let Some(entry) = self.inner.lock().accels.remove(&accel.0) {
            unsafe { self.accel_loader.destroy_acceleration_structure(entry.accel, None) };
            self.metrics.accel_destroyed();
        }
    }

    fn accel_address(&self, accel: AccelId) -> Result<u64> {
        self.inner
            .lock()
            .accels
            .get(&accel.0)
            .map(|a| a.address)
            .ok_or_else(|| Error::not_found(format!("acceleration structure {}", accel.0)))
    }

    fn create_shader_module(&self, desc: &ShaderModuleDesc<'_>) -> Result<ShaderModuleId> {
        let words = ash::util::read_spv(&mut std::io::Cursor::new(desc.code)).map_err(|e| Error::CompilationFailure {
            stage: desc.stage,
            diagnostic: format!("{}: {e}", desc.label),
        })?;
        let info = vk::ShaderModuleCreateInfo::default().code(&words);
        let module = unsafe { self.device.create_shader_module(&info, None) }.map_err(|e| Error::CompilationFailure {
            stage: desc.stage,
            diagnostic: format!("{}: {e:?}", desc.label),
        })?;
        let mut inner = self.inner.lock();
        let id = inner.next_handle();
        inner.modules.insert(id, module);
        Ok(ShaderModuleId(id))
    }

    fn destroy_shader_module(&self, module: ShaderModuleId) {
        if let Some(m) = self.inner.lock().modules.remove(&module.0) {
            unsafe { self.device.destroy_shader_module(m, None) };
        }
    }

    fn create_rt_pipeline(&self, desc: &RtPipelineDesc) -> Result<PipelineId> {
        let first_stage = desc.stages.first().map_or(ShaderStage::Raygen, |s| s.stage);
        let names = desc
            .stages
            .iter()
            .map(|s| CString::new(s.entry_point.as_str()))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::CompilationFailure {
                stage: first_stage,
                diagnostic: e.to_string(),
            })?;

        let mut inner = self.inner.lock();
        let layout = inner
            .layouts
            .get(&desc.layout.0)
            .copied()
            .ok_or_else(|| Error::not_found(format!("pipeline layout {}", desc.layout.0)))?;
        let mut stages = Vec::with_capacity(desc.stages.len());
        for (stage, name) in desc.stages.iter().zip(&names) {
            let module = inner
                .modules
                .get(&stage.module.0)
                .copied()
                .ok_or_else(|| Error::not_found(format!("shader module {}", stage.module.0)))?;
            stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk_shader_stage(stage.stage))
                    .module(module)
                    .name(name.as_c_str()),
            );
        }
        let unused = |i: Option<u32>| i.unwrap_or(vk::SHADER_UNUSED_KHR);
        let groups: Vec<_> = desc
            .groups
            .iter()
            .map(|g| {
                vk::RayTracingShaderGroupCreateInfoKHR::default()
                    .ty(match g.ty {
                        GroupType::General => vk::RayTracingShaderGroupTypeKHR::GENERAL,
                        GroupType::TrianglesHit => vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP,
                        GroupType::ProceduralHit => vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP,
                    })
                    .general_shader(unused(g.general))
                    .closest_hit_shader(unused(g.closest_hit))
                    .any_hit_shader(unused(g.any_hit))
                    .intersection_shader(unused(g.intersection))
            })
            .collect();
        let info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth)
            .layout(layout);

        let pipeline = unsafe {
            self.rt_loader.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[info],
                None,
            )
        }
        .map_err(|e| Error::CompilationFailure {
            stage: first_stage,
            diagnostic: format!("{}: {e:?}", desc.label),
        })?
        .into_iter()
        .next()
        .ok_or_else(|| Error::backend("driver returned no pipeline"))?;

        let id = inner.next_handle();
        inner.pipelines.insert(id, pipeline);
        self.metrics.pipeline_created();
        Ok(PipelineId(id))
    }

    fn shader_group_handles(&self, pipeline: PipelineId, first_group: u32, group_count: u32) -> Result<Vec<u8>> {
        let pipeline = self
            .inner
            .lock()
            .pipelines
            .get(&pipeline.0)
            .copied()
            .ok_or_else(|| Error::not_found(format!("pipeline {}", pipeline.0)))?;
        let size = (self.caps.rt.shader_group_handle_size * group_count) as usize;
        unsafe {
            self.rt_loader
                .get_ray_tracing_shader_group_handles(pipeline, first_group, group_count, size)
        }
        .map_err(|e| vk_err("get_ray_tracing_shader_group_handles", e))
    }

    fn destroy_pipeline(&self, pipeline: PipelineId) {
        if let Some(p) = self.inner.lock().pipelines.remove(&pipeline.0) {
            unsafe { self.device.destroy_pipeline(p, None) };
        }
    }

    #[tracing::instrument(skip_all, fields(commands = commands.len()))]
    fn submit(&self, commands: &CommandList, mode: SubmitMode) -> Result<()> {
        let mut inner = self.inner.lock();
        self.reclaim(&mut inner)?;

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(inner.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| vk_err("allocate_command_buffers", e))?[0];
        let fence = match unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) } {
            Ok(f) => f,
            Err(e) => {
                unsafe { self.device.free_command_buffers(inner.command_pool, &[cmd]) };
                return Err(vk_err("create_fence", e));
            }
        };

        let recorded = (|| -> Result<()> {
            let begin = vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.begin_command_buffer(cmd, &begin) }.map_err(|e| vk_err("begin_command_buffer", e))?;
            for command in commands.commands() {
                self.record(&inner, cmd, command)?;
            }
            unsafe { self.device.end_command_buffer(cmd) }.map_err(|e| vk_err("end_command_buffer", e))?;
            let submit = vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&cmd));
            unsafe { self.device.queue_submit(self.queue, &[submit], fence) }.map_err(|e| vk_err("queue_submit", e))
        })();
        if let Err(e) = recorded {
            unsafe {
                self.device.free_command_buffers(inner.command_pool, &[cmd]);
                self.device.destroy_fence(fence, None);
            }
            return Err(e);
        }
        self.metrics.submitted();

        match mode {
            SubmitMode::Wait => {
                let waited = unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) };
                unsafe {
                    self.device.free_command_buffers(inner.command_pool, &[cmd]);
                    self.device.destroy_fence(fence, None);
                }
                waited.map_err(|e| vk_err("wait_for_fences", e))
            }
            SubmitMode::NoWait => {
                inner.in_flight.push(InFlight { cmd, fence });
                Ok(())
            }
        }
    }
}

fn gpu_location(location: MemoryLocation) -> GpuLocation {
    match location {
        MemoryLocation::GpuOnly => GpuLocation::GpuOnly,
        MemoryLocation::CpuToGpu => GpuLocation::CpuToGpu,
        MemoryLocation::GpuToCpu => GpuLocation::GpuToCpu,
    }
}

fn vk_accel_kind(kind: AccelKind) -> vk::AccelerationStructureTypeKHR {
    match kind {
        AccelKind::BottomLevel => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
        AccelKind::TopLevel => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
    }
}

fn vk_build_flags(flags: AccelBuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut out = vk::BuildAccelerationStructureFlagsKHR::empty();
    for (ours, theirs) in [
        (AccelBuildFlags::ALLOW_UPDATE, vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE),
        (AccelBuildFlags::ALLOW_COMPACTION, vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION),
        (AccelBuildFlags::PREFER_FAST_TRACE, vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE),
        (AccelBuildFlags::PREFER_FAST_BUILD, vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD),
    ] {
        if flags.contains(ours) {
            out |= theirs;
        }
    }
    out
}

fn vk_buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut out = vk::BufferUsageFlags::empty();
    for (ours, theirs) in [
        (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
        (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
        (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
        (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
        (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
        (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
        (BufferUsage::SHADER_DEVICE_ADDRESS, vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS),
        (
            BufferUsage::AS_BUILD_INPUT,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
        ),
        (BufferUsage::AS_STORAGE, vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR),
        (BufferUsage::SHADER_BINDING_TABLE, vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR),
    ] {
        if usage.contains(ours) {
            out |= theirs;
        }
    }
    out
}

fn vk_image_usage(usage: ImageUsage) -> vk::ImageUsageFlags {
    let mut out = vk::ImageUsageFlags::empty();
    for (ours, theirs) in [
        (ImageUsage::TRANSFER_SRC, vk::ImageUsageFlags::TRANSFER_SRC),
        (ImageUsage::TRANSFER_DST, vk::ImageUsageFlags::TRANSFER_DST),
        (ImageUsage::SAMPLED, vk::ImageUsageFlags::SAMPLED),
        (ImageUsage::STORAGE, vk::ImageUsageFlags::STORAGE),
        (ImageUsage::COLOR_ATTACHMENT, vk::ImageUsageFlags::COLOR_ATTACHMENT),
    ] {
        if usage.contains(ours) {
            out |= theirs;
        }
    }
    out
}

fn vk_format(format: Format) -> vk::Format {
    match format {
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::D32Float => vk::Format::D32_SFLOAT,
    }
}

fn vk_shader_stage(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::Raygen => vk::ShaderStageFlags::RAYGEN_KHR,
        ShaderStage::Miss => vk::ShaderStageFlags::MISS_KHR,
        ShaderStage::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        ShaderStage::AnyHit => vk::ShaderStageFlags::ANY_HIT_KHR,
        ShaderStage::Intersection => vk::ShaderStageFlags::INTERSECTION_KHR,
        ShaderStage::Callable => vk::ShaderStageFlags::CALLABLE_KHR,
    }
}

fn vk_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthStencilReadOnly => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::Present => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

fn vk_range(range: &SubresourceRange) -> vk::ImageSubresourceRange {
    let mut aspect = vk::ImageAspectFlags::empty();
    if range.aspect.contains(ImageAspect::COLOR) {
        aspect |= vk::ImageAspectFlags::COLOR;
    }
    if range.aspect.contains(ImageAspect::DEPTH) {
        aspect |= vk::ImageAspectFlags::DEPTH;
    }
    if range.aspect.contains(ImageAspect::STENCIL) {
        aspect |= vk::ImageAspectFlags::STENCIL;
    }
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: range.base_mip,
        level_count: range.mip_count,
        base_array_layer: range.base_layer,
        layer_count: range.layer_count,
    }
}

fn vk_stages(stages: PipelineStages) -> vk::PipelineStageFlags {
    let mut out = vk::PipelineStageFlags::empty();
    for (ours, theirs) in [
        (PipelineStages::TOP_OF_PIPE, vk::PipelineStageFlags::TOP_OF_PIPE),
        (PipelineStages::DRAW_INDIRECT, vk::PipelineStageFlags::DRAW_INDIRECT),
        (PipelineStages::VERTEX_INPUT, vk::PipelineStageFlags::VERTEX_INPUT),
        (PipelineStages::VERTEX_SHADER, vk::PipelineStageFlags::VERTEX_SHADER),
        (PipelineStages::FRAGMENT_SHADER, vk::PipelineStageFlags::FRAGMENT_SHADER),
        (PipelineStages::EARLY_FRAGMENT_TESTS, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS),
        (PipelineStages::LATE_FRAGMENT_TESTS, vk::PipelineStageFlags::LATE_FRAGMENT_TESTS),
        (PipelineStages::COLOR_ATTACHMENT_OUTPUT, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT),
        (PipelineStages::COMPUTE_SHADER, vk::PipelineStageFlags::COMPUTE_SHADER),
        (PipelineStages::TRANSFER, vk::PipelineStageFlags::TRANSFER),
        (PipelineStages::BOTTOM_OF_PIPE, vk::PipelineStageFlags::BOTTOM_OF_PIPE),
        (PipelineStages::HOST, vk::PipelineStageFlags::HOST),
        (PipelineStages::ALL_COMMANDS, vk::PipelineStageFlags::ALL_COMMANDS),
        (PipelineStages::RAY_TRACING_SHADER, vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR),
        (
            PipelineStages::ACCELERATION_STRUCTURE_BUILD,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
        ),
    ] {
        if stages.contains(ours) {
            out |= theirs;
        }
    }
    out
}

fn src_stages(state: &AccessState) -> vk::PipelineStageFlags {
    let stages = vk_stages(state.stages);
    if stages.is_empty() {
        vk::PipelineStageFlags::TOP_OF_PIPE
    } else {
        stages
    }
}

fn dst_stages(state: &AccessState) -> vk::PipelineStageFlags {
    let stages = vk_stages(state.stages);
    if stages.is_empty() {
        vk::PipelineStageFlags::BOTTOM_OF_PIPE
    } else {
        stages
    }
}

fn vk_access(access: AccessFlags) -> vk::AccessFlags {
    let mut out = vk::AccessFlags::empty();
    for (ours, theirs) in [
        (AccessFlags::INDIRECT_COMMAND_READ, vk::AccessFlags::INDIRECT_COMMAND_READ),
        (AccessFlags::INDEX_READ, vk::AccessFlags::INDEX_READ),
        (AccessFlags::VERTEX_ATTRIBUTE_READ, vk::AccessFlags::VERTEX_ATTRIBUTE_READ),
        (AccessFlags::UNIFORM_READ, vk::AccessFlags::UNIFORM_READ),
        (AccessFlags::SHADER_READ, vk::AccessFlags::SHADER_READ),
        (AccessFlags::SHADER_WRITE, vk::AccessFlags::SHADER_WRITE),
        (AccessFlags::COLOR_ATTACHMENT_READ, vk::AccessFlags::COLOR_ATTACHMENT_READ),
        (AccessFlags::COLOR_ATTACHMENT_WRITE, vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
        (AccessFlags::DEPTH_STENCIL_READ, vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ),
        (AccessFlags::DEPTH_STENCIL_WRITE, vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE),
        (AccessFlags::TRANSFER_READ, vk::AccessFlags::TRANSFER_READ),
        (AccessFlags::TRANSFER_WRITE, vk::AccessFlags::TRANSFER_WRITE),
        (AccessFlags::HOST_READ, vk::AccessFlags::HOST_READ),
        (AccessFlags::HOST_WRITE, vk::AccessFlags::HOST_WRITE),
        (AccessFlags::MEMORY_READ, vk::AccessFlags::MEMORY_READ),
        (AccessFlags::MEMORY_WRITE, vk::AccessFlags::MEMORY_WRITE),
        (AccessFlags::ACCELERATION_STRUCTURE_READ, vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR),
        (AccessFlags::ACCELERATION_STRUCTURE_WRITE, vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR),
        // No dedicated legacy bit; shader read covers table fetches.
        (AccessFlags::SHADER_BINDING_TABLE_READ, vk::AccessFlags::SHADER_READ),
    ] {
        if access.contains(ours) {
            out |= theirs;
        }
    }
    out
}
