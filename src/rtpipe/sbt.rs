//! Shader binding table layout and upload.
//!
//! Each region (raygen, miss, hit, callable) is an array of fixed-stride entries:
//!
//! ```text
//! | handle (handle_size) | user data (data_size) | zero padding | ...
//! ```
//!
//! `stride = align_up(handle_size + data_size, handle_alignment)` and every region
//! starts at a multiple of `max(base_alignment, handle_alignment)`. A trace call
//! takes a single raygen entry whose address must be base aligned, so raygen
//! entries are spaced by the stride rounded up to the region alignment.

use std::collections::BTreeMap;

use super::pipeline::check_contiguous;
use super::{GroupIndex, RtPipeline, SbtRegion, ShaderGroup};
use crate::device::{BufferDesc, BufferUsage, Device, ManagedBuffer, MemoryLocation, RtProperties};
use crate::util::{align_up, Error, Result};

/// Device address range of one SBT region, as consumed by a trace call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SbtRegionInfo {
    pub address: u64,
    pub stride: u64,
    pub size: u64,
}

impl SbtRegionInfo {
    pub const EMPTY: Self = Self {
        address: 0,
        stride: 0,
        size: 0,
    };

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

#[derive(Debug, Clone, Default)]
struct SbtEntry {
    group: Option<ShaderGroup>,
    data: Vec<u8>,
}

/// Records groups and per-entry data, then lays them out once.
#[derive(Debug)]
pub struct ShaderBindingTableBuilder {
    props: RtProperties,
    data_size: usize,
    /// Set by the first `set_group`/`set_data`; the data size is fixed from then on.
    finalized: bool,
    built: bool,
    entries: [BTreeMap<GroupIndex, SbtEntry>; 4],
}

impl ShaderBindingTableBuilder {
    pub fn new(props: &RtProperties) -> Self {
        Self {
            props: *props,
            data_size: 0,
            finalized: false,
            built: false,
            entries: Default::default(),
        }
    }

    /// Builder with one entry per group of `pipeline`, in pipeline order.
    pub fn from_pipeline(props: &RtProperties, pipeline: &RtPipeline, data_size: usize) -> Result<Self> {
        let mut builder = Self::new(props);
        builder.set_entry_data_size(data_size)?;
        for region in SbtRegion::ALL {
            for index in 0..pipeline.group_count(region) {
                if let Some(group) = pipeline.group(region, index) {
                    builder.set_group(region, index, group)?;
                }
            }
        }
        Ok(builder)
    }

    /// Fix the per-entry user data size. Must precede any group or data.
    pub fn set_entry_data_size(&mut self, bytes: usize) -> Result<()> {
        if self.finalized {
            return Err(Error::LayoutAlreadyFinalized);
        }
        let stride = Self::stride_for(&self.props, bytes);
        if stride > self.props.max_shader_group_stride as u64 {
            return Err(Error::StrideTooLarge {
                stride,
                max: self.props.max_shader_group_stride as u64,
            });
        }
        self.data_size = bytes;
        Ok(())
    }

    #[inline]
    pub fn entry_data_size(&self) -> usize {
        self.data_size
    }

    #[inline]
    pub fn entry_stride(&self) -> u64 {
        Self::stride_for(&self.props, self.data_size)
    }

    fn stride_for(props: &RtProperties, data_size: usize) -> u64 {
        align_up(
            props.shader_group_handle_size as u64 + data_size as u64,
            props.shader_group_handle_alignment.max(1) as u64,
        )
    }

    fn region_alignment(&self) -> u64 {
        self.props
            .shader_group_base_alignment
            .max(self.props.shader_group_handle_alignment)
            .max(1) as u64
    }

    /// Record which group backs the entry at `index`. Existing data is kept.
    pub fn set_group(&mut self, region: SbtRegion, index: GroupIndex, group: &ShaderGroup) -> Result<()> {
        let actual = group.region()?;
        if actual != region {
            return Err(Error::InvalidGroup(format!(
                "{} group cannot back a {} entry",
                actual.name(),
                region.name()
            )));
        }
        self.finalized = true;
        self.entries[region.index()].entry(index).or_default().group = Some(group.clone());
        Ok(())
    }

    /// Copy `data` into the entry's data block.
    pub fn set_data(&mut self, region: SbtRegion, index: GroupIndex, data: &[u8]) -> Result<()> {
        if data.len() > self.data_size {
            return Err(Error::DataTooLarge {
                size: data.len(),
                max: self.data_size,
            });
        }
        self.finalized = true;
        let entry = self.entries[region.index()].entry(index).or_default();
        entry.data.clear();
        entry.data.extend_from_slice(data);
        Ok(())
    }

    pub fn data(&self, region: SbtRegion, index: GroupIndex) -> Option<&[u8]> {
        self.entries[region.index()].get(&index).map(|e| e.data.as_slice())
    }

    pub fn entry_count(&self, region: SbtRegion) -> u32 {
        self.entries[region.index()].len() as u32
    }

    #[inline]
    pub fn is_built(&self) -> bool {
        self.built
    }

    /// Assemble the table from the pipeline's handles and upload it.
    #[tracing::instrument(skip_all)]
    pub fn build(&mut self, device: &dyn Device, pipeline: &RtPipeline) -> Result<ShaderBindingTable> {
        if self.built {
            return Err(Error::AlreadyBuilt);
        }
        let handle_size = self.props.shader_group_handle_size as usize;
        if pipeline.handle_size() != handle_size {
            return Err(Error::backend(format!(
                "pipeline handle size {} differs from table handle size {handle_size}",
                pipeline.handle_size()
            )));
        }
        let stride = self.entry_stride();
        let region_alignment = self.region_alignment();

        let mut handles: [Vec<&[u8]>; 4] = Default::default();
        for region in SbtRegion::ALL {
            let entries = &self.entries[region.index()];
            check_contiguous(region, entries)?;
            for (&index, entry) in entries {
                let handle = entry
                    .group
                    .as_ref()
                    .and_then(|g| pipeline.find_group(region, g))
                    .and_then(|g| pipeline.group_handle(region, g))
                    .ok_or(Error::GroupMismatch {
                        region: region.name(),
                        index,
                    })?;
                handles[region.index()].push(handle);
            }
        }

        let mut regions = [RegionLayout::default(); 4];
        let mut size = 0u64;
        for region in SbtRegion::ALL {
            let count = handles[region.index()].len() as u64;
            if count == 0 {
                continue;
            }
            let offset = align_up(size, region_alignment);
            let region_stride = match region {
                SbtRegion::RayGen => align_up(stride, region_alignment),
                _ => stride,
            };
            regions[region.index()] = RegionLayout {
                offset,
                count,
                stride: region_stride,
            };
            size = offset + count * region_stride;
        }

        let mut bytes = vec![0u8; size as usize];
        for region in SbtRegion::ALL {
            let layout = regions[region.index()];
            for (i, (handle, entry)) in handles[region.index()]
                .iter()
                .zip(self.entries[region.index()].values())
                .enumerate()
            {
                let at = (layout.offset + i as u64 * layout.stride) as usize;
                bytes[at..at + handle_size].copy_from_slice(handle);
                let data_at = at + handle_size;
                bytes[data_at..data_at + entry.data.len()].copy_from_slice(&entry.data);
            }
        }

        let buffer = if size == 0 {
            None
        } else {
            let buffer = ManagedBuffer::create(
                device,
                &BufferDesc::new(
                    "rtpipe.sbt",
                    size,
                    BufferUsage::SHADER_BINDING_TABLE | BufferUsage::SHADER_DEVICE_ADDRESS,
                    MemoryLocation::CpuToGpu,
                )
                .with_alignment(region_alignment),
            )?;
            if let Err(e) = buffer.write(device, 0, &bytes) {
                buffer.destroy(device);
                return Err(e);
            }
            Some(buffer)
        };

        self.built = true;
        tracing::info!(
            size,
            stride,
            raygen = regions[0].count,
            miss = regions[1].count,
            hit = regions[2].count,
            callable = regions[3].count,
            "shader binding table built"
        );
        Ok(ShaderBindingTable {
            buffer,
            bytes,
            stride,
            handle_size,
            data_size: self.data_size,
            regions,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RegionLayout {
    offset: u64,
    count: u64,
    stride: u64,
}

/// Uploaded shader binding table.
#[derive(Debug)]
pub struct ShaderBindingTable {
    buffer: Option<ManagedBuffer>,
    /// Host copy of the uploaded bytes.
    bytes: Vec<u8>,
    stride: u64,
    handle_size: usize,
    data_size: usize,
    regions: [RegionLayout; 4],
}

impl ShaderBindingTable {
    /// Whole region for a trace call. Empty regions have a null address.
    pub fn region(&self, region: SbtRegion) -> SbtRegionInfo {
        let layout = self.regions[region.index()];
        match &self.buffer {
            Some(buffer) if layout.count > 0 => SbtRegionInfo {
                address: buffer.address() + layout.offset,
                stride: layout.stride,
                size: layout.count * layout.stride,
            },
            _ => SbtRegionInfo::EMPTY,
        }
    }

    /// Single raygen entry; a trace call consumes exactly one.
    ///
    /// Every entry starts on the base alignment, so any index can be dispatched.
    pub fn raygen_region(&self, index: GroupIndex) -> Option<SbtRegionInfo> {
        let layout = self.regions[SbtRegion::RayGen.index()];
        let buffer = self.buffer.as_ref()?;
        if index as u64 >= layout.count {
            return None;
        }
        Some(SbtRegionInfo {
            address: buffer.address() + layout.offset + index as u64 * layout.stride,
            stride: layout.stride,
            size: layout.stride,
        })
    }

    /// Byte offset of an entry from the start of the table.
    pub fn entry_offset(&self, region: SbtRegion, index: GroupIndex) -> Option<u64> {
        let layout = self.regions[region.index()];
        (layout.count > index as u64).then(|| layout.offset + index as u64 * layout.stride)
    }

    pub fn entry_count(&self, region: SbtRegion) -> u32 {
        self.regions[region.index()].count as u32
    }

    /// Overwrite the data block of a built entry, on the host copy and the device.
    pub fn write_data(&mut self, device: &dyn Device, region: SbtRegion, index: GroupIndex, data: &[u8]) -> Result<()> {
        if data.len() > self.data_size {
            return Err(Error::DataTooLarge {
                size: data.len(),
                max: self.data_size,
            });
        }
        let offset = self
            .entry_offset(region, index)
            .ok_or_else(|| Error::not_found(format!("{} entry {index}", region.name())))?
            + self.handle_size as u64;
        let buffer = self
            .buffer
            .as_ref()
            .ok_or_else(|| Error::not_found("shader binding table buffer"))?;
        buffer.write(device, offset, data)?;
        let at = offset as usize;
        self.bytes[at..at + data.len()].copy_from_slice(data);
        Ok(())
    }

    #[inline]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Entry stride of the miss, hit and callable regions.
    #[inline]
    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Entry stride of `region`; raygen entries may be spaced wider.
    pub fn region_stride(&self, region: SbtRegion) -> u64 {
        match self.regions[region.index()] {
            layout if layout.count > 0 => layout.stride,
            _ => self.stride,
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn buffer(&self) -> Option<&ManagedBuffer> {
        self.buffer.as_ref()
    }

    pub fn destroy(self, device: &dyn Device) {
        if let Some(buffer) = self.buffer {
            buffer.destroy(device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ShaderModuleId;
    use crate::rtpipe::{ShaderRef, ShaderStage};

    fn props() -> RtProperties {
        RtProperties {
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 64,
            shader_group_base_alignment: 64,
            ..RtProperties::default()
        }
    }

    fn miss() -> ShaderGroup {
        ShaderGroup::general(ShaderRef {
            module: ShaderModuleId(7),
            stage: ShaderStage::Miss,
            entry_point: "main".into(),
        })
    }

    #[test]
    fn test_stride() {
        let mut b = ShaderBindingTableBuilder::new(&props());
        assert_eq!(b.entry_stride(), 64);
        b.set_entry_data_size(40).unwrap();
        assert_eq!(b.entry_stride(), 128);
    }

    #[test]
    fn test_layout_finalized_after_group() {
        let mut b = ShaderBindingTableBuilder::new(&props());
        b.set_group(SbtRegion::Miss, 0, &miss()).unwrap();
        assert!(matches!(b.set_entry_data_size(16), Err(Error::LayoutAlreadyFinalized)));
    }

    #[test]
    fn test_data_too_large_leaves_entry() {
        let mut b = ShaderBindingTableBuilder::new(&props());
        b.set_entry_data_size(8).unwrap();
        b.set_group(SbtRegion::Miss, 0, &miss()).unwrap();
        b.set_data(SbtRegion::Miss, 0, &[1; 8]).unwrap();
        let err = b.set_data(SbtRegion::Miss, 0, &[2; 9]).unwrap_err();
        assert!(matches!(err, Error::DataTooLarge { size: 9, max: 8 }));
        assert_eq!(b.data(SbtRegion::Miss, 0), Some(&[1u8; 8][..]));
    }

    #[test]
    fn test_stride_too_large() {
        let mut b = ShaderBindingTableBuilder::new(&props());
        let err = b.set_entry_data_size(8192).unwrap_err();
        assert!(matches!(err, Error::StrideTooLarge { .. }));
        assert_eq!(b.entry_data_size(), 0);
    }

    #[test]
    fn test_wrong_region() {
        let mut b = ShaderBindingTableBuilder::new(&props());
        assert!(matches!(
            b.set_group(SbtRegion::Hit, 0, &miss()),
            Err(Error::InvalidGroup(_))
        ));
    }
}
