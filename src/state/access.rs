//! Access states: which pipeline stages touch a resource, how, in what
//! layout and on which queue family.

use bitflags::bitflags;

bitflags! {
    /// Pipeline stages that access a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipelineStages: u64 {
        const TOP_OF_PIPE = 1 << 0;
        const DRAW_INDIRECT = 1 << 1;
        const VERTEX_INPUT = 1 << 2;
        const VERTEX_SHADER = 1 << 3;
        const FRAGMENT_SHADER = 1 << 4;
        const EARLY_FRAGMENT_TESTS = 1 << 5;
        const LATE_FRAGMENT_TESTS = 1 << 6;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 7;
        const COMPUTE_SHADER = 1 << 8;
        const TRANSFER = 1 << 9;
        const BOTTOM_OF_PIPE = 1 << 10;
        const HOST = 1 << 11;
        const ALL_COMMANDS = 1 << 12;
        const RAY_TRACING_SHADER = 1 << 13;
        const ACCELERATION_STRUCTURE_BUILD = 1 << 14;
    }
}

bitflags! {
    /// Memory access kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u64 {
        const INDIRECT_COMMAND_READ = 1 << 0;
        const INDEX_READ = 1 << 1;
        const VERTEX_ATTRIBUTE_READ = 1 << 2;
        const UNIFORM_READ = 1 << 3;
        const SHADER_READ = 1 << 4;
        const SHADER_WRITE = 1 << 5;
        const COLOR_ATTACHMENT_READ = 1 << 6;
        const COLOR_ATTACHMENT_WRITE = 1 << 7;
        const DEPTH_STENCIL_READ = 1 << 8;
        const DEPTH_STENCIL_WRITE = 1 << 9;
        const TRANSFER_READ = 1 << 10;
        const TRANSFER_WRITE = 1 << 11;
        const HOST_READ = 1 << 12;
        const HOST_WRITE = 1 << 13;
        const MEMORY_READ = 1 << 14;
        const MEMORY_WRITE = 1 << 15;
        const ACCELERATION_STRUCTURE_READ = 1 << 16;
        const ACCELERATION_STRUCTURE_WRITE = 1 << 17;
        const SHADER_BINDING_TABLE_READ = 1 << 18;
    }
}

impl AccessFlags {
    /// Every access kind that modifies memory.
    pub const WRITES: Self = Self::SHADER_WRITE
        .union(Self::COLOR_ATTACHMENT_WRITE)
        .union(Self::DEPTH_STENCIL_WRITE)
        .union(Self::TRANSFER_WRITE)
        .union(Self::HOST_WRITE)
        .union(Self::MEMORY_WRITE)
        .union(Self::ACCELERATION_STRUCTURE_WRITE);

    #[inline]
    pub fn has_writes(self) -> bool {
        self.intersects(Self::WRITES)
    }
}

/// Image layout. Buffers and acceleration structures always stay `Undefined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImageLayout {
    /// Contents may be discarded.
    #[default]
    Undefined,
    General,
    ColorAttachment,
    DepthStencilAttachment,
    DepthStencilReadOnly,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    Present,
}

/// Queue family index; `IGNORED` means no ownership is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueFamily(pub u32);

impl QueueFamily {
    pub const IGNORED: Self = Self(u32::MAX);

    #[inline]
    pub fn is_ignored(self) -> bool {
        self == Self::IGNORED
    }
}

impl Default for QueueFamily {
    fn default() -> Self {
        Self::IGNORED
    }
}

/// Complete description of how a resource is (or will be) accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessState {
    pub stages: PipelineStages,
    pub access: AccessFlags,
    pub layout: ImageLayout,
    pub queue: QueueFamily,
}

impl AccessState {
    /// Never used; contents undefined.
    pub const UNDEFINED: Self = Self::new(
        PipelineStages::TOP_OF_PIPE,
        AccessFlags::empty(),
        ImageLayout::Undefined,
    );

    pub const TRANSFER_SRC: Self = Self::new(
        PipelineStages::TRANSFER,
        AccessFlags::TRANSFER_READ,
        ImageLayout::TransferSrc,
    );

    pub const TRANSFER_DST: Self = Self::new(
        PipelineStages::TRANSFER,
        AccessFlags::TRANSFER_WRITE,
        ImageLayout::TransferDst,
    );

    /// Buffer written by a transfer command.
    pub const TRANSFER_DST_BUFFER: Self = Self::buffer(PipelineStages::TRANSFER, AccessFlags::TRANSFER_WRITE);

    /// Buffer read by a transfer command.
    pub const TRANSFER_SRC_BUFFER: Self = Self::buffer(PipelineStages::TRANSFER, AccessFlags::TRANSFER_READ);

    /// Sampled in ray-tracing shaders.
    pub const SHADER_READ: Self = Self::new(
        PipelineStages::RAY_TRACING_SHADER,
        AccessFlags::SHADER_READ,
        ImageLayout::ShaderReadOnly,
    );

    /// Storage image written by compute shaders.
    pub const STORAGE_WRITE: Self = Self::new(
        PipelineStages::COMPUTE_SHADER,
        AccessFlags::SHADER_WRITE,
        ImageLayout::General,
    );

    /// Storage image written (and read) by ray-tracing shaders.
    pub const RAY_TRACING_STORAGE_WRITE: Self = Self::new(
        PipelineStages::RAY_TRACING_SHADER,
        AccessFlags::SHADER_READ.union(AccessFlags::SHADER_WRITE),
        ImageLayout::General,
    );

    /// Acceleration structure or build input being written by a build.
    pub const AS_BUILD_WRITE: Self = Self::buffer(
        PipelineStages::ACCELERATION_STRUCTURE_BUILD,
        AccessFlags::ACCELERATION_STRUCTURE_READ.union(AccessFlags::ACCELERATION_STRUCTURE_WRITE),
    );

    /// Build input (vertex, index or instance data) read by a build.
    pub const AS_BUILD_INPUT: Self = Self::buffer(
        PipelineStages::ACCELERATION_STRUCTURE_BUILD,
        AccessFlags::SHADER_READ,
    );

    /// Acceleration structure traversed by ray-tracing shaders.
    pub const AS_READ: Self = Self::buffer(
        PipelineStages::RAY_TRACING_SHADER,
        AccessFlags::ACCELERATION_STRUCTURE_READ,
    );

    pub const SBT_READ: Self = Self::buffer(
        PipelineStages::RAY_TRACING_SHADER,
        AccessFlags::SHADER_BINDING_TABLE_READ,
    );

    pub const COLOR_ATTACHMENT_WRITE: Self = Self::new(
        PipelineStages::COLOR_ATTACHMENT_OUTPUT,
        AccessFlags::COLOR_ATTACHMENT_WRITE,
        ImageLayout::ColorAttachment,
    );

    pub const PRESENT: Self = Self::new(
        PipelineStages::BOTTOM_OF_PIPE,
        AccessFlags::empty(),
        ImageLayout::Present,
    );

    #[inline]
    pub const fn new(stages: PipelineStages, access: AccessFlags, layout: ImageLayout) -> Self {
        Self {
            stages,
            access,
            layout,
            queue: QueueFamily::IGNORED,
        }
    }

    /// State for a buffer-like resource (no layout).
    #[inline]
    pub const fn buffer(stages: PipelineStages, access: AccessFlags) -> Self {
        Self::new(stages, access, ImageLayout::Undefined)
    }

    #[inline]
    pub const fn with_queue(mut self, queue: QueueFamily) -> Self {
        self.queue = queue;
        self
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        !self.access.has_writes()
    }
}

impl Default for AccessState {
    fn default() -> Self {
        Self::UNDEFINED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_mask() {
        assert!(AccessFlags::TRANSFER_WRITE.has_writes());
        assert!(!AccessFlags::SHADER_READ.has_writes());
        assert!(!AccessFlags::empty().has_writes());
        assert!((AccessFlags::SHADER_READ | AccessFlags::ACCELERATION_STRUCTURE_WRITE).has_writes());
    }

    #[test]
    fn test_presets() {
        assert_eq!(AccessState::default(), AccessState::UNDEFINED);
        assert!(AccessState::UNDEFINED.is_read_only());
        assert!(AccessState::SHADER_READ.is_read_only());
        assert!(!AccessState::RAY_TRACING_STORAGE_WRITE.is_read_only());
        assert_eq!(AccessState::RAY_TRACING_STORAGE_WRITE.layout, ImageLayout::General);
        assert!(AccessState::AS_READ.queue.is_ignored());

        let owned = AccessState::SHADER_READ.with_queue(QueueFamily(2));
        assert_eq!(owned.queue, QueueFamily(2));
        assert_ne!(owned, AccessState::SHADER_READ);
    }
}
