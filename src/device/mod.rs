//! Backend seam between the ray-tracing core and a native GPU API.
//!
//! Every subsystem talks to the GPU through [`Device`]. Two implementations ship
//! with the crate:
//!
//! - [`HeadlessDevice`] - deterministic in-memory device used by tests and demos
//! - `VulkanDevice` - `ash` backend, enabled with the `vulkan` feature
//!
//! Work is never issued directly: callers record a [`CommandList`](crate::command::CommandList)
//! and hand it to [`Device::submit`].

mod desc;
mod headless;
mod resource;
#[cfg(feature = "vulkan")]
mod vulkan;

pub use desc::*;
pub use headless::{AccelInfo, HeadlessDevice, HeadlessStats};
pub use resource::{ManagedBuffer, ManagedImage, ImageView};
#[cfg(feature = "vulkan")]
pub use vulkan::VulkanDevice;

use crate::command::CommandList;
use crate::util::{DeviceMetrics, Result};

/// Ray-tracing limits reported by the physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtProperties {
    /// Size of one opaque shader group handle in bytes.
    pub shader_group_handle_size: u32,
    /// Required alignment of every SBT entry.
    pub shader_group_handle_alignment: u32,
    /// Required alignment of every SBT region start address.
    pub shader_group_base_alignment: u32,
    /// Upper bound on the SBT entry stride.
    pub max_shader_group_stride: u32,
    /// Required alignment of acceleration structure scratch addresses.
    pub min_scratch_alignment: u32,
    pub max_ray_recursion_depth: u32,
}

impl Default for RtProperties {
    fn default() -> Self {
        Self {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
            max_shader_group_stride: 4096,
            min_scratch_alignment: 128,
            max_ray_recursion_depth: 31,
        }
    }
}

/// Device capabilities relevant to this crate.
#[derive(Debug, Clone, Default)]
pub struct DeviceCaps {
    pub device_name: String,
    pub rt: RtProperties,
}

/// Whether [`Device::submit`] blocks until the GPU finished the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitMode {
    /// Block the calling thread until the device is done (one-shot setup work).
    Wait,
    /// Return immediately; visibility is established by barriers in later lists.
    NoWait,
}

/// GPU device used by the core.
///
/// Methods take `&self`; implementations synchronize internally. Command
/// recording itself is single-threaded per [`CommandList`].
pub trait Device: Send + Sync {
    fn caps(&self) -> &DeviceCaps;

    /// Allocation and work counters owned by this device.
    fn metrics(&self) -> &DeviceMetrics;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferId>;
    fn destroy_buffer(&self, buffer: BufferId);
    fn buffer_address(&self, buffer: BufferId) -> Result<u64>;
    /// Write into a host-visible buffer.
    fn write_buffer(&self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()>;
    /// Read back a host-visible buffer.
    fn read_buffer(&self, buffer: BufferId, offset: u64, len: u64) -> Result<Vec<u8>>;

    fn create_image(&self, desc: &ImageDesc) -> Result<ImageId>;
    fn destroy_image(&self, image: ImageId);

    fn accel_build_sizes(&self, desc: &AccelBuildDesc) -> Result<AccelBuildSizes>;
    fn create_accel(&self, kind: AccelKind, buffer: BufferId, size: u64) -> Result<AccelId>;
    fn destroy_accel(&self, accel: AccelId);
    fn accel_address(&self, accel: AccelId) -> Result<u64>;

    fn create_shader_module(&self, desc: &ShaderModuleDesc<'_>) -> Result<ShaderModuleId>;
    fn destroy_shader_module(&self, module: ShaderModuleId);
    /// Fails with `CompilationFailure` naming the offending stage.
    fn create_rt_pipeline(&self, desc: &RtPipelineDesc) -> Result<PipelineId>;
    /// Opaque handles of `group_count` groups starting at `first_group`, packed back to back.
    fn shader_group_handles(
        &self,
        pipeline: PipelineId,
        first_group: u32,
        group_count: u32,
    ) -> Result<Vec<u8>>;
    fn destroy_pipeline(&self, pipeline: PipelineId);

    fn submit(&self, commands: &CommandList, mode: SubmitMode) -> Result<()>;
}
