//! Handles and creation descriptors shared by every backend.

use bitflags::bitflags;

use crate::rtpipe::ShaderStage;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw native handle value.
            #[inline]
            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

handle!(
    /// GPU buffer.
    BufferId
);
handle!(
    /// GPU image.
    ImageId
);
handle!(
    /// Acceleration structure (bottom or top level).
    AccelId
);
handle!(
    /// Compiled pipeline.
    PipelineId
);
handle!(
    /// Shader module.
    ShaderModuleId
);
handle!(
    /// Pipeline layout, owned by the descriptor-set layer outside this crate.
    PipelineLayoutId
);

bitflags! {
    /// How a buffer will be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDEX = 1 << 4;
        const VERTEX = 1 << 5;
        const SHADER_DEVICE_ADDRESS = 1 << 6;
        /// Read as vertex/index/instance input by an acceleration structure build.
        const AS_BUILD_INPUT = 1 << 7;
        /// Backing memory of an acceleration structure.
        const AS_STORAGE = 1 << 8;
        const SHADER_BINDING_TABLE = 1 << 9;
    }
}

bitflags! {
    /// How an image will be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const STORAGE = 1 << 3;
        const COLOR_ATTACHMENT = 1 << 4;
    }
}

/// Where buffer memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Device local, not host visible.
    GpuOnly,
    /// Host visible, written by the CPU and read by the GPU.
    CpuToGpu,
    /// Host visible, written by the GPU and read back.
    GpuToCpu,
}

impl MemoryLocation {
    #[inline]
    pub fn is_host_visible(self) -> bool {
        !matches!(self, Self::GpuOnly)
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
    /// Minimum alignment of the buffer start (and of its device address).
    pub alignment: u64,
}

impl BufferDesc {
    pub fn new(label: impl Into<String>, size: u64, usage: BufferUsage, location: MemoryLocation) -> Self {
        Self {
            label: label.into(),
            size,
            usage,
            location,
            alignment: 16,
        }
    }

    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    D32Float,
}

#[derive(Debug, Clone)]
pub struct ImageDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub format: Format,
    pub usage: ImageUsage,
}

impl ImageDesc {
    /// Single-mip, single-layer 2D image.
    pub fn new_2d(label: impl Into<String>, width: u32, height: u32, format: Format, usage: ImageUsage) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            mip_levels: 1,
            array_layers: 1,
            format,
            usage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelKind {
    BottomLevel,
    TopLevel,
}

bitflags! {
    /// Acceleration structure build preferences.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccelBuildFlags: u32 {
        const ALLOW_UPDATE = 1 << 0;
        const ALLOW_COMPACTION = 1 << 1;
        const PREFER_FAST_TRACE = 1 << 2;
        const PREFER_FAST_BUILD = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelBuildMode {
    /// Build from scratch.
    Build,
    /// Refit `src` into `dst`; topology and primitive counts must not change.
    Update,
}

/// One triangle geometry of a bottom-level build.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangleGeometry {
    pub vertex_buffer: BufferId,
    /// Byte stride between vertices. Position is read as 3 floats at offset 0.
    pub vertex_stride: u64,
    /// Highest vertex index referenced by this geometry.
    pub max_vertex: u32,
    pub index_buffer: BufferId,
    /// First index (in u32 elements) inside `index_buffer`.
    pub first_index: u32,
    pub triangle_count: u32,
    pub opaque: bool,
}

impl TriangleGeometry {
    /// Byte offset of the first index, as consumed by the build range.
    #[inline]
    pub fn primitive_offset(&self) -> u64 {
        self.first_index as u64 * 4
    }
}

/// Geometry of an acceleration structure build.
#[derive(Debug, Clone, PartialEq)]
pub enum AccelGeometry {
    Triangles(Vec<TriangleGeometry>),
    /// `count` packed [`GpuInstance`](crate::accel::GpuInstance) records at `offset`.
    Instances { buffer: BufferId, offset: u64, count: u32 },
}

impl AccelGeometry {
    pub fn kind(&self) -> AccelKind {
        match self {
            Self::Triangles(_) => AccelKind::BottomLevel,
            Self::Instances { .. } => AccelKind::TopLevel,
        }
    }

    /// Primitive count per geometry, as used by the size query.
    pub fn primitive_counts(&self) -> Vec<u32> {
        match self {
            Self::Triangles(tris) => tris.iter().map(|t| t.triangle_count).collect(),
            Self::Instances { count, .. } => vec![*count],
        }
    }
}

/// Complete description of one acceleration structure build.
///
/// Used both for the size query (where `dst`, `src` and `scratch` are ignored)
/// and for the recorded build command.
#[derive(Debug, Clone, PartialEq)]
pub struct AccelBuildDesc {
    pub geometry: AccelGeometry,
    pub flags: AccelBuildFlags,
    pub mode: AccelBuildMode,
    pub src: Option<AccelId>,
    pub dst: Option<AccelId>,
    /// Scratch buffer; its device address must honor `min_scratch_alignment`.
    pub scratch: Option<BufferId>,
}

impl AccelBuildDesc {
    pub fn new(geometry: AccelGeometry, flags: AccelBuildFlags) -> Self {
        Self {
            geometry,
            flags,
            mode: AccelBuildMode::Build,
            src: None,
            dst: None,
            scratch: None,
        }
    }

    #[inline]
    pub fn kind(&self) -> AccelKind {
        self.geometry.kind()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccelBuildSizes {
    pub accel_size: u64,
    pub build_scratch_size: u64,
    pub update_scratch_size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ShaderModuleDesc<'a> {
    pub label: &'a str,
    pub stage: ShaderStage,
    /// SPIR-V bytes.
    pub code: &'a [u8],
    pub entry_point: &'a str,
}

/// One stage entry of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStageDesc {
    pub module: ShaderModuleId,
    pub stage: ShaderStage,
    pub entry_point: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    General,
    TrianglesHit,
    ProceduralHit,
}

/// Shader group as handed to the native API: indices into the stage list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineGroupDesc {
    pub ty: GroupType,
    pub general: Option<u32>,
    pub closest_hit: Option<u32>,
    pub any_hit: Option<u32>,
    pub intersection: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct RtPipelineDesc {
    pub label: String,
    pub stages: Vec<PipelineStageDesc>,
    pub groups: Vec<PipelineGroupDesc>,
    pub max_recursion_depth: u32,
    pub layout: PipelineLayoutId,
}
