//! Tunable settings for the ray-tracing core

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::util::Result;

pub const MAX_FRAMES_IN_FLIGHT: u32 = 4;

/// Core settings, loadable from JSON. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // Frame pacing
    pub frames_in_flight: u32, // 1..=4

    // TLAS maintenance
    /// Force a full TLAS build after this many consecutive refits.
    pub full_rebuild_interval: Option<u32>,
    pub prefer_fast_trace: bool,

    // BLAS
    pub allow_blas_update: bool,

    // Pipeline / SBT
    pub max_ray_recursion_depth: u32,
    pub sbt_entry_data_size: u32,

    /// Headless device only: fail allocations past this many bytes.
    pub memory_budget: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            full_rebuild_interval: None,
            prefer_fast_trace: true,
            allow_blas_update: false,
            max_ray_recursion_depth: 1,
            sbt_entry_data_size: 0,
            memory_budget: None,
        }
    }
}

impl Settings {
    /// Parse from a JSON string and clamp out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut settings: Self = serde_json::from_str(json)?;
        settings.validate();
        Ok(settings)
    }

    /// Load settings from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let settings = Self::from_json_str(&text)?;
        tracing::debug!(path = %path.as_ref().display(), "settings loaded");
        Ok(settings)
    }

    /// Save settings as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Clamp values into their supported ranges.
    pub fn validate(&mut self) {
        let frames = self.frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT);
        if frames != self.frames_in_flight {
            tracing::warn!(requested = self.frames_in_flight, used = frames, "frames_in_flight clamped");
            self.frames_in_flight = frames;
        }
        if self.full_rebuild_interval == Some(0) {
            self.full_rebuild_interval = None;
        }
        self.max_ray_recursion_depth = self.max_ray_recursion_depth.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let s = Settings::from_json_str(r#"{ "allow_blas_update": true }"#).unwrap();
        assert!(s.allow_blas_update);
        assert_eq!(s.frames_in_flight, 2);
        assert_eq!(s.full_rebuild_interval, None);
    }

    #[test]
    fn test_validate_clamps() {
        let s = Settings::from_json_str(
            r#"{ "frames_in_flight": 9, "full_rebuild_interval": 0, "max_ray_recursion_depth": 0 }"#,
        )
        .unwrap();
        assert_eq!(s.frames_in_flight, MAX_FRAMES_IN_FLIGHT);
        assert_eq!(s.full_rebuild_interval, None);
        assert_eq!(s.max_ray_recursion_depth, 1);
    }

    #[test]
    fn test_bad_json() {
        assert!(matches!(
            Settings::from_json_str("{ nope"),
            Err(crate::util::Error::Json(_))
        ));
    }
}
