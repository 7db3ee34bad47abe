//! Recording of a ray-tracing dispatch.

use crate::accel::Tlas;
use crate::command::{CommandList, TraceRaysDesc};
use crate::device::ManagedImage;
use crate::rtpipe::{GroupIndex, RtPipeline, SbtRegion, ShaderBindingTable};
use crate::state::{AccessState, StateCache};
use crate::util::{Error, Result};

/// Record one trace over `extent` into `target`, starting at raygen entry `raygen`.
///
/// The target image is moved to ray-tracing storage write, the table to
/// shader-binding-table read and the TLAS to acceleration-structure read.
/// Empty miss, hit or callable regions are passed as null ranges.
#[allow(clippy::too_many_arguments)]
pub fn record_trace(
    cmd: &mut CommandList,
    state: &mut StateCache,
    pipeline: &RtPipeline,
    sbt: &ShaderBindingTable,
    tlas: &Tlas,
    target: &ManagedImage,
    raygen: GroupIndex,
    extent: (u32, u32),
) -> Result<()> {
    let (width, height) = extent;
    if width == 0 || height == 0 {
        return Err(Error::InvalidArgument(format!("empty trace extent {width}x{height}")));
    }
    let raygen_region = sbt
        .raygen_region(raygen)
        .ok_or_else(|| Error::not_found(format!("raygen entry {raygen} in shader binding table")))?;

    state.transition(cmd, tlas.accel, AccessState::AS_READ);
    state.transition(cmd, target.view(), AccessState::RAY_TRACING_STORAGE_WRITE);
    if let Some(buffer) = sbt.buffer() {
        state.transition(cmd, buffer, AccessState::SBT_READ);
    }
    cmd.bind_pipeline(pipeline.id());
    cmd.trace_rays(TraceRaysDesc {
        raygen: raygen_region,
        miss: sbt.region(SbtRegion::Miss),
        hit: sbt.region(SbtRegion::Hit),
        callable: sbt.region(SbtRegion::Callable),
        width,
        height,
        depth: 1,
    });
    tracing::trace!(raygen, width, height, instances = tlas.instance_count, tlas_generation = tlas.generation, "trace recorded");
    Ok(())
}
