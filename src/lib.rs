//! # rtcore
//!
//! Hardware ray-tracing core: resource state tracking with automatic barriers,
//! bottom/top-level acceleration structure management, ray-tracing pipelines and
//! shader binding tables.
//!
//! All GPU work goes through the [`device::Device`] trait. [`device::HeadlessDevice`]
//! is a deterministic in-memory implementation used by the tests; the `vulkan`
//! feature adds an `ash` backend.
//!
//! ## Modules
//!
//! - [`util`] - Errors, math helpers, device metrics
//! - [`device`] - Device trait, resource descriptors, backends
//! - [`command`] - Backend-agnostic command lists
//! - [`state`] - Access states, barriers and the [`StateCache`]
//! - [`geometry`] - Shared vertex/index store
//! - [`accel`] - BLAS, instances and the [`AccelStructureManager`]
//! - [`rtpipe`] - Shader groups, [`RtPipelineBuilder`], shader binding tables
//! - [`frame`], [`schedule`], [`dispatch`] - Per-frame plumbing
//!
//! ## Example
//!
//! ```ignore
//! use rtcore::prelude::*;
//!
//! let device = HeadlessDevice::new();
//! let settings = Settings::default();
//! let mut frame = FrameContext::new(settings.frames_in_flight);
//! let mut accel = AccelStructureManager::new(&settings);
//!
//! let blas = Blas::build(&device, &store, mesh, &BlasOptions::from_settings(&settings))?;
//! accel.add_instance(1, &blas, Mat4::IDENTITY, InstanceFlags::empty())?;
//! accel.rebuild(&device, &mut frame)?;
//! frame.submit(&device, SubmitMode::NoWait)?;
//! ```

pub mod accel;
pub mod command;
pub mod device;
pub mod dispatch;
pub mod frame;
pub mod geometry;
pub mod logging;
pub mod rtpipe;
pub mod schedule;
pub mod settings;
pub mod state;
pub mod util;

// Re-export commonly used types
pub use accel::{AccelStructureManager, Blas, BlasInstance, InstanceHandle, RebuildKind, Tlas};
pub use command::CommandList;
pub use device::{Device, HeadlessDevice};
pub use frame::FrameContext;
pub use geometry::GeometryStore;
pub use rtpipe::{RtPipeline, RtPipelineBuilder, ShaderBindingTable, ShaderBindingTableBuilder};
pub use settings::Settings;
pub use state::StateCache;
pub use util::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::accel::{AccelStructureManager, Blas, BlasOptions, InstanceFlags, RebuildKind};
    pub use crate::command::CommandList;
    pub use crate::device::{Device, HeadlessDevice, ManagedBuffer, ManagedImage, SubmitMode};
    pub use crate::dispatch::record_trace;
    pub use crate::frame::FrameContext;
    pub use crate::geometry::{GeometryStore, MeshId, PrimitiveDesc, Vertex};
    pub use crate::rtpipe::{
        RtPipelineBuilder, SbtRegion, ShaderBindingTableBuilder, ShaderGroup, ShaderModule, ShaderStage,
    };
    pub use crate::schedule::FrameSchedule;
    pub use crate::settings::Settings;
    pub use crate::state::{AccessState, StateCache};
    pub use crate::util::{Error, Mat4, Result, Vec3};
}
