//! Ray-tracing pipeline construction.

use std::collections::BTreeMap;

use super::{RtShaderCollection, SbtRegion, ShaderGroup};
use crate::device::{Device, GroupType, PipelineGroupDesc, PipelineId, PipelineLayoutId, RtPipelineDesc};
use crate::settings::Settings;
use crate::util::{Error, Result};

/// Index of a group inside its region.
pub type GroupIndex = u32;

/// Check that the keys of `groups` are exactly `0..n`.
pub(crate) fn check_contiguous<T>(region: SbtRegion, groups: &BTreeMap<u32, T>) -> Result<()> {
    for (expected, &index) in groups.keys().enumerate() {
        if index != expected as u32 {
            return Err(Error::NonContiguousGroupIndex {
                region: region.name(),
                index,
                expected: expected as u32,
            });
        }
    }
    Ok(())
}

/// Collects shader groups per region and compiles them into an [`RtPipeline`].
#[derive(Debug)]
pub struct RtPipelineBuilder {
    label: String,
    groups: [BTreeMap<GroupIndex, ShaderGroup>; 4],
    max_recursion_depth: u32,
}

impl Default for RtPipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RtPipelineBuilder {
    pub fn new() -> Self {
        Self {
            label: "rt_pipeline".to_owned(),
            groups: Default::default(),
            max_recursion_depth: 1,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new().with_max_recursion_depth(settings.max_ray_recursion_depth)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Requested depth; clamped to the device limit at build.
    pub fn with_max_recursion_depth(mut self, depth: u32) -> Self {
        self.max_recursion_depth = depth.max(1);
        self
    }

    /// Append a group after the highest index of its region.
    pub fn add_group(&mut self, group: ShaderGroup) -> Result<GroupIndex> {
        let region = group.region()?;
        let map = &mut self.groups[region.index()];
        let index = map.keys().next_back().map_or(0, |last| last + 1);
        map.insert(index, group);
        Ok(index)
    }

    /// Place a group at a caller-chosen index, replacing any previous one.
    pub fn set_group(&mut self, region: SbtRegion, index: GroupIndex, group: ShaderGroup) -> Result<()> {
        let actual = group.region()?;
        if actual != region {
            return Err(Error::InvalidGroup(format!(
                "{} group cannot be placed in the {} region",
                actual.name(),
                region.name()
            )));
        }
        self.groups[region.index()].insert(index, group);
        Ok(())
    }

    pub fn group(&self, region: SbtRegion, index: GroupIndex) -> Option<&ShaderGroup> {
        self.groups[region.index()].get(&index)
    }

    pub fn group_count(&self, region: SbtRegion) -> u32 {
        self.groups[region.index()].len() as u32
    }

    /// Compile the pipeline and fetch every group handle.
    ///
    /// Index contiguity is validated before the device is touched.
    #[tracing::instrument(skip_all, fields(label = %self.label))]
    pub fn build(self, device: &dyn Device, layout: PipelineLayoutId) -> Result<RtPipeline> {
        for region in SbtRegion::ALL {
            check_contiguous(region, &self.groups[region.index()])?;
        }
        if self.groups[SbtRegion::RayGen.index()].is_empty() {
            return Err(Error::InvalidGroup("pipeline needs a ray generation group".into()));
        }

        let mut collection = RtShaderCollection::new();
        let mut group_descs = Vec::new();
        let mut first = [0u32; 4];
        for region in SbtRegion::ALL {
            first[region.index()] = group_descs.len() as u32;
            for group in self.groups[region.index()].values() {
                group_descs.push(Self::group_desc(&mut collection, group));
            }
        }

        let rt = &device.caps().rt;
        let max_recursion_depth = self.max_recursion_depth.min(rt.max_ray_recursion_depth);
        if max_recursion_depth < self.max_recursion_depth {
            tracing::warn!(
                requested = self.max_recursion_depth,
                limit = rt.max_ray_recursion_depth,
                "ray recursion depth clamped"
            );
        }
        let handle_size = rt.shader_group_handle_size as usize;

        let desc = RtPipelineDesc {
            label: self.label.clone(),
            stages: collection.stage_descs(),
            groups: group_descs,
            max_recursion_depth,
            layout,
        };
        let id = match device.create_rt_pipeline(&desc) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(error = %e, "ray tracing pipeline creation failed");
                return Err(e);
            }
        };

        let total = desc.groups.len() as u32;
        let handles = device
            .shader_group_handles(id, 0, total)
            .and_then(|h| {
                if h.len() == total as usize * handle_size {
                    Ok(h)
                } else {
                    Err(Error::backend(format!(
                        "expected {} handle bytes, got {}",
                        total as usize * handle_size,
                        h.len()
                    )))
                }
            });
        let handles = match handles {
            Ok(h) => h,
            Err(e) => {
                device.destroy_pipeline(id);
                return Err(e);
            }
        };

        tracing::info!(groups = total, stages = collection.len(), "ray tracing pipeline built");
        Ok(RtPipeline {
            id,
            layout,
            groups: self.groups.map(|m| m.into_values().collect()),
            first,
            handles,
            handle_size,
            max_recursion_depth,
        })
    }

    fn group_desc(collection: &mut RtShaderCollection, group: &ShaderGroup) -> PipelineGroupDesc {
        let mut desc = PipelineGroupDesc {
            ty: GroupType::General,
            general: None,
            closest_hit: None,
            any_hit: None,
            intersection: None,
        };
        match group {
            ShaderGroup::General(s) | ShaderGroup::Callable(s) => desc.general = Some(collection.add(s)),
            ShaderGroup::Hit {
                closest_hit,
                any_hit,
                intersection,
            } => {
                desc.ty = if intersection.is_some() {
                    GroupType::ProceduralHit
                } else {
                    GroupType::TrianglesHit
                };
                desc.closest_hit = closest_hit.as_ref().map(|s| collection.add(s));
                desc.any_hit = any_hit.as_ref().map(|s| collection.add(s));
                desc.intersection = intersection.as_ref().map(|s| collection.add(s));
            }
        }
        desc
    }
}

/// Compiled ray-tracing pipeline plus the opaque handle of each group.
#[derive(Debug)]
pub struct RtPipeline {
    id: PipelineId,
    layout: PipelineLayoutId,
    groups: [Vec<ShaderGroup>; 4],
    /// Pipeline-wide index of each region's first group.
    first: [u32; 4],
    handles: Vec<u8>,
    handle_size: usize,
    max_recursion_depth: u32,
}

impl RtPipeline {
    #[inline]
    pub fn id(&self) -> PipelineId {
        self.id
    }

    #[inline]
    pub fn layout(&self) -> PipelineLayoutId {
        self.layout
    }

    pub fn group_count(&self, region: SbtRegion) -> u32 {
        self.groups[region.index()].len() as u32
    }

    pub fn group(&self, region: SbtRegion, index: GroupIndex) -> Option<&ShaderGroup> {
        self.groups[region.index()].get(index as usize)
    }

    /// Index of the first group in `region` equal to `group`.
    pub fn find_group(&self, region: SbtRegion, group: &ShaderGroup) -> Option<GroupIndex> {
        self.groups[region.index()]
            .iter()
            .position(|g| g == group)
            .map(|i| i as GroupIndex)
    }

    /// Opaque handle of a group, `handle_size` bytes.
    pub fn group_handle(&self, region: SbtRegion, index: GroupIndex) -> Option<&[u8]> {
        if index >= self.group_count(region) {
            return None;
        }
        let global = (self.first[region.index()] + index) as usize;
        self.handles
            .get(global * self.handle_size..(global + 1) * self.handle_size)
    }

    #[inline]
    pub fn handle_size(&self) -> usize {
        self.handle_size
    }

    #[inline]
    pub fn max_recursion_depth(&self) -> u32 {
        self.max_recursion_depth
    }

    pub fn destroy(self, device: &dyn Device) {
        device.destroy_pipeline(self.id);
    }
}
