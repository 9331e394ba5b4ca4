// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2021-2022 Adrian <adrian.eddy at gmail>

use serde::{ Serialize, Deserialize };
use crate::calibration::CalibrationError;
use crate::region::RoiF;
use crate::warp_table::DEFAULT_GRID_PITCH;

/// Number of regions each camera is split into.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Complexity {
    /// 4 quadrants per camera, 8 warp passes
    #[default]
    Normal,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct StitchConfig {
    pub complexity: Complexity,
    pub grid_pitch: usize,
    pub upper_roi: RoiF,
    pub lower_roi: RoiF,
    /// Size of one plane in the mask file
    pub mask_size: [usize; 2],
    pub confidence_blending: bool,
    pub confidence_feather_deg: f64,
    pub swap_channels: bool,
    pub reuse_context: bool,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            complexity: Complexity::Normal,
            grid_pitch: DEFAULT_GRID_PITCH,
            upper_roi: RoiF { x: 0.0, y: 0.0, w: 1.0, h: 0.6 },
            lower_roi: RoiF { x: 0.0, y: 0.4, w: 1.0, h: 0.6 },
            mask_size: [720, 360],
            confidence_blending: true,
            confidence_feather_deg: 0.0,
            swap_channels: true,
            reuse_context: true,
        }
    }
}

impl StitchConfig {
    pub fn from_json(json: &str) -> Result<Self, CalibrationError> {
        let ret: Self = serde_json::from_str(json)?;
        ret.validate()?;
        Ok(ret)
    }

    pub fn load_from_file(&mut self, path: &str) -> Result<(), CalibrationError> {
        let data = std::fs::read_to_string(path)?;
        *self = serde_json::from_str(&data)?;
        self.validate()
    }

    pub fn validate(&self) -> Result<(), CalibrationError> {
        if self.grid_pitch == 0 {
            return Err(CalibrationError::Invalid("grid_pitch must be positive".into()));
        }
        for (name, roi) in [("upper_roi", &self.upper_roi), ("lower_roi", &self.lower_roi)] {
            if !roi.is_valid() {
                return Err(CalibrationError::Invalid(format!("{name} {:?}", roi)));
            }
        }
        if self.confidence_feather_deg < 0.0 {
            return Err(CalibrationError::Invalid(format!("confidence_feather_deg {}", self.confidence_feather_deg)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = StitchConfig::from_json("{}").unwrap();
        assert_eq!(c, StitchConfig::default());
        assert_eq!(c.grid_pitch, 40);
        assert_eq!(c.mask_size, [720, 360]);
    }

    #[test]
    fn overrides() {
        let c = StitchConfig::from_json(r#"{ "grid_pitch": 10, "swap_channels": false, "lower_roi": { "x": 0, "y": 0.5, "w": 1, "h": 0.5 } }"#).unwrap();
        assert_eq!(c.grid_pitch, 10);
        assert!(!c.swap_channels);
        assert_eq!(c.lower_roi.y, 0.5);
        assert!(c.reuse_context);
    }

    #[test]
    fn invalid() {
        assert!(StitchConfig::from_json(r#"{ "grid_pitch": 0 }"#).is_err());
        assert!(StitchConfig::from_json(r#"{ "upper_roi": { "x": 0, "y": 0.6, "w": 1, "h": 0.6 } }"#).is_err());
    }
}
