//! Deduplicated list of pipeline stages.

use std::collections::HashMap;

use super::ShaderRef;
use crate::device::PipelineStageDesc;

/// Assigns each distinct shader entry point one stage index.
#[derive(Debug, Default)]
pub struct RtShaderCollection {
    stages: Vec<ShaderRef>,
    indices: HashMap<ShaderRef, u32>,
}

impl RtShaderCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage index of `shader`, adding it on first use.
    pub fn add(&mut self, shader: &ShaderRef) -> u32 {
        if let Some(&index) = self.indices.get(shader) {
            return index;
        }
        let index = self.stages.len() as u32;
        self.stages.push(shader.clone());
        self.indices.insert(shader.clone(), index);
        index
    }

    pub fn index_of(&self, shader: &ShaderRef) -> Option<u32> {
        self.indices.get(shader).copied()
    }

    pub fn stages(&self) -> &[ShaderRef] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_descs(&self) -> Vec<PipelineStageDesc> {
        self.stages
            .iter()
            .map(|s| PipelineStageDesc {
                module: s.module,
                stage: s.stage,
                entry_point: s.entry_point.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ShaderModuleId;
    use crate::rtpipe::ShaderStage;

    #[test]
    fn test_dedup() {
        let chit = ShaderRef {
            module: ShaderModuleId(1),
            stage: ShaderStage::ClosestHit,
            entry_point: "main".into(),
        };
        let other_entry = ShaderRef {
            entry_point: "shadow".into(),
            ..chit.clone()
        };
        let mut c = RtShaderCollection::new();
        assert_eq!(c.add(&chit), 0);
        assert_eq!(c.add(&other_entry), 1);
        assert_eq!(c.add(&chit), 0);
        assert_eq!(c.len(), 2);
        assert_eq!(c.index_of(&other_entry), Some(1));
        assert_eq!(c.stage_descs()[1].entry_point, "shadow");
    }
}
