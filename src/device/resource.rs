//! Owning wrappers around device resources.
//!
//! Destruction is explicit (`destroy(device)`) because releasing a native
//! object needs the device that created it.

use super::{BufferDesc, BufferId, Device, ImageDesc, ImageId, MemoryLocation};
use crate::state::SubresourceRange;
use crate::util::{Error, Result};

/// Buffer plus the metadata callers keep asking the device for.
#[derive(Debug)]
pub struct ManagedBuffer {
    id: BufferId,
    size: u64,
    address: u64,
    location: MemoryLocation,
    label: String,
}

impl ManagedBuffer {
    pub fn create(device: &dyn Device, desc: &BufferDesc) -> Result<Self> {
        let id = device.create_buffer(desc)?;
        let address = match device.buffer_address(id) {
            Ok(address) => address,
            Err(e) => {
                device.destroy_buffer(id);
                return Err(e);
            }
        };
        tracing::trace!(label = %desc.label, size = desc.size, address, "buffer created");
        Ok(Self {
            id,
            size: desc.size,
            address,
            location: desc.location,
            label: desc.label.clone(),
        })
    }

    #[inline]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Device address of the first byte.
    #[inline]
    pub fn address(&self) -> u64 {
        self.address
    }

    #[inline]
    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Map-and-write into a host-visible buffer.
    pub fn write(&self, device: &dyn Device, offset: u64, data: &[u8]) -> Result<()> {
        if offset + data.len() as u64 > self.size {
            return Err(Error::backend(format!(
                "write of {} bytes at {} overflows buffer '{}' ({} bytes)",
                data.len(),
                offset,
                self.label,
                self.size
            )));
        }
        device.write_buffer(self.id, offset, data)
    }

    pub fn read(&self, device: &dyn Device, offset: u64, len: u64) -> Result<Vec<u8>> {
        device.read_buffer(self.id, offset, len)
    }

    pub fn destroy(self, device: &dyn Device) {
        device.destroy_buffer(self.id);
    }
}

/// Image with its creation parameters.
#[derive(Debug)]
pub struct ManagedImage {
    id: ImageId,
    desc: ImageDesc,
}

impl ManagedImage {
    pub fn create(device: &dyn Device, desc: &ImageDesc) -> Result<Self> {
        let id = device.create_image(desc)?;
        Ok(Self { id, desc: desc.clone() })
    }

    #[inline]
    pub fn id(&self) -> ImageId {
        self.id
    }

    #[inline]
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    /// Extent as (width, height).
    #[inline]
    pub fn extent(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    /// View of the whole image.
    pub fn view(&self) -> ImageView<'_> {
        ImageView {
            image: self,
            range: SubresourceRange {
                base_mip: 0,
                mip_count: self.desc.mip_levels,
                base_layer: 0,
                layer_count: self.desc.array_layers,
                ..SubresourceRange::default()
            },
        }
    }

    pub fn destroy(self, device: &dyn Device) {
        device.destroy_image(self.id);
    }
}

/// Borrowed view of an image. Tracks state under the image's identity.
#[derive(Debug, Clone, Copy)]
pub struct ImageView<'a> {
    pub image: &'a ManagedImage,
    pub range: SubresourceRange,
}
