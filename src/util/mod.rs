//! Utility types shared by every subsystem.
//!
//! - [`Error`] / [`Result`] - Error handling
//! - Math type re-exports from glam, [`BBox3f`], alignment helpers
//! - [`DeviceMetrics`] - Per-device counters

mod error;
mod math;
mod metrics;

pub use error::*;
pub use math::*;
pub use metrics::*;
