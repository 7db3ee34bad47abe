//! Backend-agnostic command recording.
//!
//! A [`CommandList`] is filled by one thread and replayed by the device on
//! [`Device::submit`](crate::device::Device::submit).

use smallvec::SmallVec;

use crate::device::{AccelBuildDesc, BufferId, PipelineId};
use crate::rtpipe::SbtRegionInfo;
use crate::state::{AccessState, BarrierDescriptor};

/// One byte range of a buffer-to-buffer copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Arguments of a ray dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRaysDesc {
    pub raygen: SbtRegionInfo,
    pub miss: SbtRegionInfo,
    pub hit: SbtRegionInfo,
    pub callable: SbtRegionInfo,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Resource barrier (image layout transition or buffer/AS hazard).
    Barrier(BarrierDescriptor),
    /// Global memory dependency between two access states.
    MemoryBarrier { src: AccessState, dst: AccessState },
    CopyBuffer {
        src: BufferId,
        dst: BufferId,
        regions: SmallVec<[CopyRegion; 4]>,
    },
    BuildAccel(Box<AccelBuildDesc>),
    BindPipeline(PipelineId),
    TraceRays(TraceRaysDesc),
}

/// Ordered list of recorded commands.
#[derive(Debug, Default, Clone)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn barrier(&mut self, barrier: BarrierDescriptor) {
        self.commands.push(Command::Barrier(barrier));
    }

    #[inline]
    pub fn memory_barrier(&mut self, src: AccessState, dst: AccessState) {
        self.commands.push(Command::MemoryBarrier { src, dst });
    }

    /// Record a copy; empty region lists are dropped.
    pub fn copy_buffer(&mut self, src: BufferId, dst: BufferId, regions: impl IntoIterator<Item = CopyRegion>) {
        let regions: SmallVec<[CopyRegion; 4]> = regions.into_iter().filter(|r| r.size > 0).collect();
        if !regions.is_empty() {
            self.commands.push(Command::CopyBuffer { src, dst, regions });
        }
    }

    #[inline]
    pub fn build_accel(&mut self, desc: AccelBuildDesc) {
        self.commands.push(Command::BuildAccel(Box::new(desc)));
    }

    #[inline]
    pub fn bind_pipeline(&mut self, pipeline: PipelineId) {
        self.commands.push(Command::BindPipeline(pipeline));
    }

    #[inline]
    pub fn trace_rays(&mut self, desc: TraceRaysDesc) {
        self.commands.push(Command::TraceRays(desc));
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Recorded resource barriers, in order.
    pub fn barriers(&self) -> impl Iterator<Item = &BarrierDescriptor> {
        self.commands.iter().filter_map(|c| match c {
            Command::Barrier(b) => Some(b),
            _ => None,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Reset for reuse; keeps the allocation.
    pub fn clear(&mut self) {
        self.commands.clear();
    }
}
