//! Static mesh storage feeding bottom-level acceleration structure builds.

mod store;
mod vertex;

pub use store::{GeometryStore, Mesh, MeshId};
pub use vertex::{GeometryMeta, PrimitiveDesc, Vertex};
