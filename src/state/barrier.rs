//! Resource identity and barrier descriptors.

use bitflags::bitflags;

use super::AccessState;
use crate::device::{AccelId, BufferId, ImageId, ImageView, ManagedBuffer, ManagedImage};

/// What kind of native object a [`ResourceKey`] names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Buffer,
    Image,
    Accel,
}

/// Canonical identity of a tracked resource: the native handle value plus its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub raw: u64,
}

impl ResourceKey {
    #[inline]
    pub const fn new(kind: ResourceKind, raw: u64) -> Self {
        Self { kind, raw }
    }

    #[inline]
    pub fn is_image(&self) -> bool {
        self.kind == ResourceKind::Image
    }
}

/// Anything whose access state can be tracked.
///
/// Wrappers and views resolve to the key of the native object they
/// refer to, so two aliases of one image share one cache entry.
pub trait TrackedResource {
    fn resource_key(&self) -> ResourceKey;

    /// Range covered by barriers on this resource.
    fn subresource_range(&self) -> SubresourceRange {
        SubresourceRange::default()
    }
}

impl TrackedResource for ResourceKey {
    fn resource_key(&self) -> ResourceKey {
        *self
    }
}

impl TrackedResource for BufferId {
    fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(ResourceKind::Buffer, self.0)
    }
}

impl TrackedResource for ImageId {
    fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(ResourceKind::Image, self.0)
    }
}

impl TrackedResource for AccelId {
    fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(ResourceKind::Accel, self.0)
    }
}

impl TrackedResource for ManagedBuffer {
    fn resource_key(&self) -> ResourceKey {
        self.id().resource_key()
    }
}

impl TrackedResource for ManagedImage {
    fn resource_key(&self) -> ResourceKey {
        self.id().resource_key()
    }
}

impl TrackedResource for ImageView<'_> {
    fn resource_key(&self) -> ResourceKey {
        self.image.resource_key()
    }

    fn subresource_range(&self) -> SubresourceRange {
        self.range
    }
}

impl<T: TrackedResource + ?Sized> TrackedResource for &T {
    fn resource_key(&self) -> ResourceKey {
        (**self).resource_key()
    }

    fn subresource_range(&self) -> SubresourceRange {
        (**self).subresource_range()
    }
}

bitflags! {
    /// Image aspects covered by a barrier.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageAspect: u32 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

/// Mip and layer range of an image barrier. Ignored for buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub aspect: ImageAspect,
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    /// Remaining-mips / remaining-layers sentinel.
    pub const REMAINING: u32 = u32::MAX;
}

impl Default for SubresourceRange {
    /// Whole color image.
    fn default() -> Self {
        Self {
            aspect: ImageAspect::COLOR,
            base_mip: 0,
            mip_count: Self::REMAINING,
            base_layer: 0,
            layer_count: Self::REMAINING,
        }
    }
}

/// One pipeline barrier between two access states of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierDescriptor {
    pub resource: ResourceKey,
    pub src: AccessState,
    pub dst: AccessState,
    pub range: SubresourceRange,
}

impl BarrierDescriptor {
    /// True when no hazard exists and nothing needs to transition:
    /// both sides read-only, same layout, same queue family.
    pub fn is_redundant(&self) -> bool {
        self.src.is_read_only()
            && self.dst.is_read_only()
            && self.src.layout == self.dst.layout
            && self.src.queue == self.dst.queue
    }

    /// Layout change on an image.
    pub fn is_layout_transition(&self) -> bool {
        self.resource.is_image() && self.src.layout != self.dst.layout
    }

    /// Queue family ownership transfer.
    pub fn is_queue_transfer(&self) -> bool {
        self.src.queue != self.dst.queue && !self.src.queue.is_ignored() && !self.dst.queue.is_ignored()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{ImageLayout, QueueFamily};

    fn barrier(src: AccessState, dst: AccessState) -> BarrierDescriptor {
        BarrierDescriptor {
            resource: ImageId(1).resource_key(),
            src,
            dst,
            range: SubresourceRange::default(),
        }
    }

    #[test]
    fn test_keys_by_kind() {
        assert_ne!(BufferId(5).resource_key(), ImageId(5).resource_key());
        assert_eq!(ImageId(5).resource_key(), (&&ImageId(5)).resource_key());
    }

    #[test]
    fn test_redundancy() {
        assert!(barrier(AccessState::SHADER_READ, AccessState::SHADER_READ).is_redundant());
        assert!(!barrier(AccessState::TRANSFER_DST, AccessState::SHADER_READ).is_redundant());
        assert!(!barrier(AccessState::UNDEFINED, AccessState::SHADER_READ).is_redundant());
        // write after write still needs ordering
        assert!(!barrier(AccessState::STORAGE_WRITE, AccessState::STORAGE_WRITE).is_redundant());

        let owned = AccessState::SHADER_READ.with_queue(QueueFamily(1));
        let b = barrier(AccessState::SHADER_READ.with_queue(QueueFamily(0)), owned);
        assert!(!b.is_redundant());
        assert!(b.is_queue_transfer());
    }

    #[test]
    fn test_layout_transition() {
        let b = barrier(AccessState::UNDEFINED, AccessState::TRANSFER_DST);
        assert!(b.is_layout_transition());
        assert_eq!(b.dst.layout, ImageLayout::TransferDst);

        let buf = BarrierDescriptor {
            resource: BufferId(1).resource_key(),
            ..b
        };
        assert!(!buf.is_layout_transition());
    }
}
