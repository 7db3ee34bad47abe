//! Acceleration structure management.
//!
//! - [`Blas`] - one bottom-level structure per static mesh, built once
//! - [`AccelStructureManager`] - instance set and the single TLAS over it
//! - [`GeometryMetaBuffer`] - per-geometry material data indexed from hit shaders

mod blas;
mod instance;
mod manager;
mod meta;

pub use blas::{Blas, BlasId, BlasOptions, BlasRef};
pub use instance::{BlasInstance, GpuInstance, InstanceFlags, TransformSource, MAX_INSTANCE_FIELD};
pub use manager::{AccelStructureManager, InstanceHandle, RebuildKind, RebuildStats, Tlas};
pub use meta::{GeometryMetaBuffer, GpuGeometryMeta};
