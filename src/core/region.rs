// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2021-2022 Adrian <adrian.eddy at gmail>

use rayon::prelude::*;
use serde::{ Serialize, Deserialize };

use crate::calibration::FisheyePanoParams;
use crate::camera::CameraModel;
use crate::config::{ Complexity, StitchConfig };
use crate::frame::PixelRect;
use crate::warp_table::{ WarpTable, WarpTableGenerator };

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Camera { Front, Back }

impl Camera {
    pub const ALL: [Camera; 2] = [Camera::Front, Camera::Back];
    pub fn index(self) -> usize {
        match self { Camera::Front => 0, Camera::Back => 1 }
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Quadrant { TopLeft, TopRight, BottomLeft, BottomRight }

impl Quadrant {
    /// Also the blend target, readback buffer and mask slot order.
    pub const ALL: [Quadrant; 4] = [Quadrant::TopLeft, Quadrant::TopRight, Quadrant::BottomLeft, Quadrant::BottomRight];

    pub fn slot(self) -> usize {
        match self {
            Quadrant::TopLeft     => 0,
            Quadrant::TopRight    => 1,
            Quadrant::BottomLeft  => 2,
            Quadrant::BottomRight => 3,
        }
    }

    pub fn is_upper(self) -> bool { matches!(self, Quadrant::TopLeft | Quadrant::TopRight) }
    pub fn is_left(self)  -> bool { matches!(self, Quadrant::TopLeft | Quadrant::BottomLeft) }

    /// Placement inside a `pano_w × pano_h` panorama. All quadrants have the same size.
    pub fn bounds(self, pano_w: usize, pano_h: usize) -> PixelRect {
        let (w, h) = (pano_w / 2, pano_h / 2);
        PixelRect::new(
            if self.is_left()  { 0 } else { w },
            if self.is_upper() { 0 } else { h },
            w, h
        )
    }
}

/// Warp target slot of each region.
pub const REGION_SLOTS: [(Camera, Quadrant); 8] = [
    (Camera::Front, Quadrant::TopLeft),
    (Camera::Front, Quadrant::TopRight),
    (Camera::Front, Quadrant::BottomLeft),
    (Camera::Front, Quadrant::BottomRight),
    (Camera::Back,  Quadrant::TopLeft),
    (Camera::Back,  Quadrant::TopRight),
    (Camera::Back,  Quadrant::BottomLeft),
    (Camera::Back,  Quadrant::BottomRight),
];

pub fn warp_slot(camera: Camera, quadrant: Quadrant) -> usize {
    REGION_SLOTS.iter().position(|&s| s == (camera, quadrant)).unwrap_or_default()
}

/// Normalized rectangle within the source image.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq)]
pub struct RoiF { pub x: f64, pub y: f64, pub w: f64, pub h: f64 }

impl RoiF {
    pub fn is_valid(&self) -> bool {
        self.x >= 0.0 && self.y >= 0.0 && self.w > 0.0 && self.h > 0.0 && self.x + self.w <= 1.0 + 1e-9 && self.y + self.h <= 1.0 + 1e-9
    }

    pub fn to_pixels(&self, width: usize, height: usize) -> PixelRect {
        let x0 = ((self.x * width as f64).round() as usize).min(width);
        let y0 = ((self.y * height as f64).round() as usize).min(height);
        let x1 = (((self.x + self.w) * width as f64).round() as usize).min(width);
        let y1 = (((self.y + self.h) * height as f64).round() as usize).min(height);
        PixelRect::new(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }
}

/// Overlap band between the two cameras, in region pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SeamGeometry {
    pub seam_width: usize,
    pub region_width: usize,
    pub region_height: usize,
}

impl SeamGeometry {
    /// The horizontal coverage of both lenses, quantized to whole grid steps, minus the half sphere.
    pub fn compute(pano_w: usize, pano_h: usize, max_fov_deg: f64, pitch: usize) -> Self {
        let steps = (pano_w / pitch.max(1)).max(1);
        let angle_per_step = 360.0 / steps as f64;
        let hori_angle = (2.0 * max_fov_deg / angle_per_step).floor() * angle_per_step;
        let seam = pano_w as f64 * (hori_angle - 180.0) / 360.0;

        let region_width = pano_w / 2;
        Self {
            seam_width: (seam.max(0.0).round() as usize).min(region_width / 2),
            region_width,
            region_height: pano_h / 2,
        }
    }

    /// Band centered in the region.
    pub fn roi(&self) -> PixelRect {
        PixelRect::new((self.region_width - self.seam_width) / 2, 0, self.seam_width, self.region_height)
    }
}

#[derive(Clone, Debug)]
pub struct RegionDescriptor {
    pub camera: Camera,
    pub quadrant: Quadrant,
    /// Destination in the panorama
    pub bounds: PixelRect,
    pub table: WarpTable,
    pub src_roi: RoiF,
    pub seam: PixelRect,
    pub confidence_blending: bool,
}

impl RegionDescriptor {
    pub fn dst_size(&self) -> (usize, usize) { (self.bounds.width, self.bounds.height) }
    pub fn src_rect(&self, width: usize, height: usize) -> PixelRect { self.src_roi.to_pixels(width, height) }
}

#[derive(Clone, Debug)]
pub struct RegionSet {
    regions: Vec<RegionDescriptor>,
    pub seam: SeamGeometry,
    pub pano_size: (usize, usize),
    /// Calibrated sensor size of each camera, the pixel space of the warp tables
    pub source_sizes: [(usize, usize); 2],
}

impl RegionSet {
    pub fn build(params: &FisheyePanoParams, cameras: &[CameraModel; 2], config: &StitchConfig) -> Self {
        let (pw, ph) = (params.pano_width, params.pano_height);
        let seam = SeamGeometry::compute(pw, ph, params.max_fov_angle, config.grid_pitch);
        let generator = WarpTableGenerator::new(config.grid_pitch).with_feather(config.confidence_feather_deg);

        let slots: &[(Camera, Quadrant)] = match config.complexity {
            Complexity::Normal => &REGION_SLOTS,
        };

        let regions = slots.par_iter().map(|&(camera, quadrant)| {
            let bounds = quadrant.bounds(pw, ph);
            RegionDescriptor {
                camera,
                quadrant,
                bounds,
                table: generator.generate(&cameras[camera.index()], (pw, ph), bounds),
                src_roi: if quadrant.is_upper() { config.upper_roi } else { config.lower_roi },
                seam: seam.roi(),
                confidence_blending: config.confidence_blending,
            }
        }).collect();

        ::log::debug!("Regions: {} of {}x{}, seam width: {}", slots.len(), seam.region_width, seam.region_height, seam.seam_width);

        let source_sizes = [
            (params.cameras[0].image_width, params.cameras[0].image_height),
            (params.cameras[1].image_width, params.cameras[1].image_height),
        ];

        Self { regions, seam, pano_size: (pw, ph), source_sizes }
    }

    pub fn get(&self, camera: Camera, quadrant: Quadrant) -> Option<&RegionDescriptor> {
        self.regions.iter().find(|r| r.camera == camera && r.quadrant == quadrant)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RegionDescriptor> { self.regions.iter() }
    pub fn len(&self) -> usize { self.regions.len() }
    pub fn is_empty(&self) -> bool { self.regions.is_empty() }
    pub fn region_size(&self) -> (usize, usize) { (self.seam.region_width, self.seam.region_height) }
    pub fn source_size(&self, camera: Camera) -> (usize, usize) { self.source_sizes[camera.index()] }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(720,  360, 96.0, 10, 20 ; "five degree steps")]
    #[test_case(1440, 720, 95.0, 40, 40 ; "default rig")]
    #[test_case(1440, 720, 89.0, 40, 0  ; "no overlap")]
    #[test_case(720,  360, 180.0, 10, 180 ; "clamped to half region")]
    #[test_case(1,    180, 96.0, 40, 0  ; "degenerate width")]
    fn seam_width(w: usize, h: usize, fov: f64, pitch: usize, expected: usize) {
        let s = SeamGeometry::compute(w, h, fov, pitch);
        assert_eq!(s.seam_width, expected);
        assert!(s.seam_width <= s.region_width / 2);
    }

    #[test]
    fn seam_roi_centered() {
        let s = SeamGeometry::compute(720, 360, 96.0, 10);
        assert_eq!(s.roi(), PixelRect::new(170, 0, 20, 180));
    }

    #[test]
    fn roi_to_pixels() {
        let cfg = StitchConfig::default();
        assert_eq!(cfg.upper_roi.to_pixels(200, 200), PixelRect::new(0, 0, 200, 120));
        assert_eq!(cfg.lower_roi.to_pixels(200, 200), PixelRect::new(0, 80, 200, 120));
    }

    #[test]
    fn quadrant_layout() {
        assert_eq!(Quadrant::TopRight.bounds(1440, 720), PixelRect::new(720, 0, 720, 360));
        assert_eq!(Quadrant::BottomLeft.bounds(1440, 720), PixelRect::new(0, 360, 720, 360));
        for (i, q) in Quadrant::ALL.iter().enumerate() { assert_eq!(q.slot(), i); }
        assert_eq!(warp_slot(Camera::Back, Quadrant::TopLeft), 4);
        assert_eq!(warp_slot(Camera::Front, Quadrant::BottomRight), 3);
    }

    #[test]
    fn full_set() {
        let params = FisheyePanoParams { pano_width: 720, pano_height: 360, ..Default::default() };
        let cameras = [
            CameraModel::new(&params.cameras[0], params.max_fov_angle, params.sphere_radius),
            CameraModel::new(&params.cameras[1], params.max_fov_angle, params.sphere_radius),
        ];
        let set = RegionSet::build(&params, &cameras, &StitchConfig::default());
        assert_eq!(set.len(), 8);
        let seam = set.iter().next().unwrap().seam;
        assert!(set.iter().all(|r| r.seam == seam));
        for &(camera, quadrant) in &REGION_SLOTS {
            let r = set.get(camera, quadrant).unwrap();
            assert_eq!(r.dst_size(), (360, 180));
            assert_eq!(r.src_roi.y, if quadrant.is_upper() { 0.0 } else { 0.4 });
            assert_eq!(r.table.table_w, 10);
        }
    }
}
