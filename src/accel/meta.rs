//! Per-geometry metadata shared by all instances of a BLAS.

use std::collections::HashMap;

use super::{BlasId, BlasRef};
use crate::device::{BufferDesc, BufferUsage, Device, ManagedBuffer, MemoryLocation};
use crate::util::Result;

/// GPU record of one BLAS geometry, read by hit shaders through
/// `instance custom index + geometry index`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuGeometryMeta {
    pub material_index: i32,
    /// First index of the geometry in the shared index buffer.
    pub index_buffer_offset: u32,
}

/// Deduplicated per-BLAS sections of [`GpuGeometryMeta`].
#[derive(Debug, Default)]
pub struct GeometryMetaBuffer {
    records: Vec<GpuGeometryMeta>,
    offsets: HashMap<BlasId, u32>,
    buffer: Option<ManagedBuffer>,
}

impl GeometryMetaBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lay out one section per distinct BLAS, in first-seen order, and upload.
    ///
    /// When the records outgrow the device buffer it is replaced and the old
    /// one is passed to `retire`, which owns its release.
    pub fn rebuild<'a>(
        &mut self,
        device: &dyn Device,
        blases: impl IntoIterator<Item = &'a BlasRef>,
        retire: impl FnOnce(ManagedBuffer),
    ) -> Result<()> {
        self.records.clear();
        self.offsets.clear();
        for blas in blases {
            if self.offsets.contains_key(&blas.id()) {
                continue;
            }
            self.offsets.insert(blas.id(), self.records.len() as u32);
            self.records.extend_from_slice(blas.geometries());
        }

        // Never zero-sized so the buffer can stay bound.
        let bytes: &[u8] = if self.records.is_empty() {
            bytemuck::bytes_of(&GpuGeometryMeta::ZERO)
        } else {
            bytemuck::cast_slice(&self.records)
        };
        let needed = bytes.len() as u64;
        let buffer = match self.buffer.take() {
            Some(b) if b.size() >= needed => b,
            previous => {
                let created = ManagedBuffer::create(
                    device,
                    &BufferDesc::new(
                        "accel.geometry_meta",
                        needed.next_power_of_two(),
                        BufferUsage::STORAGE | BufferUsage::SHADER_DEVICE_ADDRESS,
                        MemoryLocation::CpuToGpu,
                    ),
                );
                match created {
                    Ok(b) => {
                        if let Some(old) = previous {
                            retire(old);
                        }
                        b
                    }
                    Err(e) => {
                        self.buffer = previous;
                        return Err(e);
                    }
                }
            }
        };
        let written = buffer.write(device, 0, bytes);
        self.buffer = Some(buffer);
        written?;
        tracing::debug!(sections = self.offsets.len(), records = self.records.len(), "geometry meta rebuilt");
        Ok(())
    }

    /// Section offset (in records) of a BLAS, if it was part of the last rebuild.
    pub fn offset_of(&self, blas: BlasId) -> Option<u32> {
        self.offsets.get(&blas).copied()
    }

    pub fn records(&self) -> &[GpuGeometryMeta] {
        &self.records
    }

    pub fn buffer(&self) -> Option<&ManagedBuffer> {
        self.buffer.as_ref()
    }

    /// Drop the device buffer without touching the device.
    pub fn invalidate(&mut self) {
        self.buffer = None;
        self.offsets.clear();
        self.records.clear();
    }

    pub fn destroy(&mut self, device: &dyn Device) {
        if let Some(b) = self.buffer.take() {
            b.destroy(device);
        }
        self.invalidate();
    }
}

impl GpuGeometryMeta {
    const ZERO: Self = Self {
        material_index: 0,
        index_buffer_offset: 0,
    };
}
