//! Resource state tracking.
//!
//! [`StateCache`] remembers how each resource was last accessed and turns a
//! required access into the minimal [`BarrierDescriptor`].

mod access;
mod barrier;
mod cache;

pub use access::*;
pub use barrier::*;
pub use cache::StateCache;
