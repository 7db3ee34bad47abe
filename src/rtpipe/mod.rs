//! Ray-tracing pipelines and shader binding tables.

mod collection;
mod pipeline;
mod sbt;
mod shader;

pub use collection::RtShaderCollection;
pub use pipeline::{GroupIndex, RtPipeline, RtPipelineBuilder};
pub use sbt::{SbtRegionInfo, ShaderBindingTable, ShaderBindingTableBuilder};
pub use shader::*;
