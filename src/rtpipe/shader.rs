//! Shader stages, modules and shader groups.

use smallvec::SmallVec;

use crate::device::{Device, ShaderModuleDesc, ShaderModuleId};
use crate::util::{Error, Result};

/// Ray-tracing shader stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Raygen,
    Miss,
    ClosestHit,
    AnyHit,
    Intersection,
    Callable,
}

/// The four regions of a shader binding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SbtRegion {
    RayGen,
    Miss,
    Hit,
    Callable,
}

impl SbtRegion {
    /// All regions in table order.
    pub const ALL: [SbtRegion; 4] = [Self::RayGen, Self::Miss, Self::Hit, Self::Callable];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            Self::RayGen => 0,
            Self::Miss => 1,
            Self::Hit => 2,
            Self::Callable => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::RayGen => "raygen",
            Self::Miss => "miss",
            Self::Hit => "hit",
            Self::Callable => "callable",
        }
    }
}

/// Reference to one entry point of a shader module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShaderRef {
    pub module: ShaderModuleId,
    pub stage: ShaderStage,
    pub entry_point: String,
}

/// Compiled shader module bound to a single stage and entry point.
#[derive(Debug)]
pub struct ShaderModule {
    id: ShaderModuleId,
    stage: ShaderStage,
    entry_point: String,
}

impl ShaderModule {
    pub fn create(device: &dyn Device, label: &str, stage: ShaderStage, code: &[u8], entry_point: &str) -> Result<Self> {
        let id = device.create_shader_module(&ShaderModuleDesc {
            label,
            stage,
            code,
            entry_point,
        })?;
        Ok(Self {
            id,
            stage,
            entry_point: entry_point.to_owned(),
        })
    }

    #[inline]
    pub fn id(&self) -> ShaderModuleId {
        self.id
    }

    #[inline]
    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn shader_ref(&self) -> ShaderRef {
        ShaderRef {
            module: self.id,
            stage: self.stage,
            entry_point: self.entry_point.clone(),
        }
    }

    /// Modules may be destroyed once every pipeline using them is built.
    pub fn destroy(self, device: &dyn Device) {
        device.destroy_shader_module(self.id);
    }
}

/// A shader group: what one SBT entry dispatches to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShaderGroup {
    /// Ray generation or miss shader.
    General(ShaderRef),
    /// Hit group. Procedural when an intersection shader is present,
    /// triangle otherwise.
    Hit {
        closest_hit: Option<ShaderRef>,
        any_hit: Option<ShaderRef>,
        intersection: Option<ShaderRef>,
    },
    Callable(ShaderRef),
}

impl ShaderGroup {
    pub fn general(shader: ShaderRef) -> Self {
        Self::General(shader)
    }

    pub fn triangles_hit(closest_hit: Option<ShaderRef>, any_hit: Option<ShaderRef>) -> Self {
        Self::Hit {
            closest_hit,
            any_hit,
            intersection: None,
        }
    }

    pub fn procedural_hit(intersection: ShaderRef, closest_hit: Option<ShaderRef>, any_hit: Option<ShaderRef>) -> Self {
        Self::Hit {
            closest_hit,
            any_hit,
            intersection: Some(intersection),
        }
    }

    pub fn callable(shader: ShaderRef) -> Self {
        Self::Callable(shader)
    }

    /// Region this group belongs to, after checking every stage fits the group.
    pub fn region(&self) -> Result<SbtRegion> {
        match self {
            Self::General(s) => match s.stage {
                ShaderStage::Raygen => Ok(SbtRegion::RayGen),
                ShaderStage::Miss => Ok(SbtRegion::Miss),
                other => Err(Error::InvalidGroup(format!(
                    "{other:?} shader cannot form a general group"
                ))),
            },
            Self::Hit {
                closest_hit,
                any_hit,
                intersection,
            } => {
                let slots = [
                    (closest_hit, ShaderStage::ClosestHit),
                    (any_hit, ShaderStage::AnyHit),
                    (intersection, ShaderStage::Intersection),
                ];
                if slots.iter().all(|(s, _)| s.is_none()) {
                    return Err(Error::InvalidGroup("hit group without any shader".into()));
                }
                for (shader, expected) in slots {
                    if let Some(s) = shader {
                        if s.stage != expected {
                            return Err(Error::InvalidGroup(format!(
                                "{:?} shader placed in the {expected:?} slot of a hit group",
                                s.stage
                            )));
                        }
                    }
                }
                Ok(SbtRegion::Hit)
            }
            Self::Callable(s) => {
                if s.stage != ShaderStage::Callable {
                    return Err(Error::InvalidGroup(format!(
                        "{:?} shader cannot form a callable group",
                        s.stage
                    )));
                }
                Ok(SbtRegion::Callable)
            }
        }
    }

    #[inline]
    pub fn is_procedural(&self) -> bool {
        matches!(self, Self::Hit { intersection: Some(_), .. })
    }

    /// Shaders referenced by this group.
    pub fn shaders(&self) -> SmallVec<[&ShaderRef; 3]> {
        match self {
            Self::General(s) | Self::Callable(s) => smallvec::smallvec![s],
            Self::Hit {
                closest_hit,
                any_hit,
                intersection,
            } => [closest_hit, any_hit, intersection]
                .into_iter()
                .filter_map(Option::as_ref)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shader(stage: ShaderStage) -> ShaderRef {
        ShaderRef {
            module: ShaderModuleId(stage as u64 + 1),
            stage,
            entry_point: "main".into(),
        }
    }

    #[test]
    fn test_group_regions() {
        assert_eq!(ShaderGroup::general(shader(ShaderStage::Raygen)).region().unwrap(), SbtRegion::RayGen);
        assert_eq!(ShaderGroup::general(shader(ShaderStage::Miss)).region().unwrap(), SbtRegion::Miss);
        assert_eq!(
            ShaderGroup::triangles_hit(Some(shader(ShaderStage::ClosestHit)), None).region().unwrap(),
            SbtRegion::Hit
        );
        assert_eq!(
            ShaderGroup::callable(shader(ShaderStage::Callable)).region().unwrap(),
            SbtRegion::Callable
        );
    }

    #[test]
    fn test_invalid_groups() {
        let err = ShaderGroup::general(shader(ShaderStage::ClosestHit)).region().unwrap_err();
        assert!(matches!(err, Error::InvalidGroup(_)));

        let swapped = ShaderGroup::triangles_hit(Some(shader(ShaderStage::AnyHit)), None);
        assert!(matches!(swapped.region(), Err(Error::InvalidGroup(_))));

        let empty = ShaderGroup::triangles_hit(None, None);
        assert!(matches!(empty.region(), Err(Error::InvalidGroup(_))));

        assert!(ShaderGroup::callable(shader(ShaderStage::Miss)).region().is_err());
    }

    #[test]
    fn test_procedural() {
        let g = ShaderGroup::procedural_hit(
            shader(ShaderStage::Intersection),
            Some(shader(ShaderStage::ClosestHit)),
            None,
        );
        assert!(g.is_procedural());
        assert_eq!(g.shaders().len(), 2);
        assert!(!ShaderGroup::triangles_hit(Some(shader(ShaderStage::ClosestHit)), None).is_procedural());
    }
}
