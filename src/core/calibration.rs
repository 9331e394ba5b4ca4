// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2021-2022 Adrian <adrian.eddy at gmail>

use serde::{ Serialize, Deserialize };

#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("Invalid calibration: {0}")]
    Invalid(String),
    #[error("IO error: {0:?}")]
    IOError(#[from] std::io::Error),
    #[error("JSON error: {0:?}")]
    JsonError(#[from] serde_json::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct CameraParams {
    pub image_width: usize,
    pub image_height: usize,
    /// Optical centre in source pixels
    pub center: [f64; 2],
    /// Pixels per radian of the equidistant projection
    pub focal: f64,
    /// OpenCV fisheye coefficients: θd = θ (1 + k1 θ² + k2 θ⁴ + k3 θ⁶ + k4 θ⁸)
    pub distortion: [f64; 4],
    /// Yaw, pitch, roll in degrees
    pub rotation: [f64; 3],
    pub translation: [f64; 3],
}
impl Default for CameraParams {
    fn default() -> Self {
        Self {
            image_width: 1920,
            image_height: 1920,
            center: [960.0, 960.0],
            focal: 960.0 / 95.0f64.to_radians(),
            distortion: [0.0; 4],
            rotation: [0.0; 3],
            translation: [0.0; 3],
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct FisheyePanoParams {
    pub name: String,
    pub pano_width: usize,
    pub pano_height: usize,
    pub sphere_radius: f64,
    /// Half-angle of the lens field of view, in degrees
    pub max_fov_angle: f64,
    /// Front camera first, back camera second
    pub cameras: [CameraParams; 2],
}
impl Default for FisheyePanoParams {
    fn default() -> Self {
        let back = CameraParams { rotation: [180.0, 0.0, 0.0], ..Default::default() };
        Self {
            name: String::new(),
            pano_width: 1440,
            pano_height: 720,
            sphere_radius: 1.0,
            max_fov_angle: 95.0,
            cameras: [CameraParams::default(), back],
        }
    }
}

impl FisheyePanoParams {
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
        if self.pano_width == 0 || self.pano_height == 0 {
            return Err(CalibrationError::Invalid(format!("panorama size {}x{}", self.pano_width, self.pano_height)));
        }
        if !(self.max_fov_angle > 0.0 && self.max_fov_angle <= 180.0) {
            return Err(CalibrationError::Invalid(format!("max_fov_angle {}", self.max_fov_angle)));
        }
        if !(self.sphere_radius > 0.0) || !self.sphere_radius.is_finite() {
            return Err(CalibrationError::Invalid(format!("sphere_radius {}", self.sphere_radius)));
        }
        for (i, cam) in self.cameras.iter().enumerate() {
            if cam.image_width == 0 || cam.image_height == 0 {
                return Err(CalibrationError::Invalid(format!("camera {i}: image size {}x{}", cam.image_width, cam.image_height)));
            }
            if !(cam.focal > 0.0) || !cam.focal.is_finite() {
                return Err(CalibrationError::Invalid(format!("camera {i}: focal {}", cam.focal)));
            }
        }
        Ok(())
    }
}
