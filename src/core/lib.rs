// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2021-2022 Adrian <adrian.eddy at gmail>

pub mod calibration;
pub mod camera;
pub mod config;
pub mod frame;
pub mod region;
pub mod warp_table;
pub mod blend_mask;
pub mod assembler;
pub mod pipeline;

pub mod gpu;

use std::sync::Arc;

pub use calibration::{ CalibrationError, CameraParams, FisheyePanoParams };
pub use config::{ Complexity, StitchConfig };
pub use frame::{ ImageFrame, PanoramaImage, PixelRect };
pub use region::{ Camera, Quadrant };
pub use blend_mask::{ BlendMasks, MaskError };
pub use pipeline::{ PipelineState, RegionStatus, StitchPipeline, StitchReport };
pub use gpu::{ GpuError, GraphicsBackend };

use camera::CameraModel;
use region::RegionSet;

#[derive(thiserror::Error, Debug)]
pub enum StitchError {
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),
    #[error("Blend mask error: {0}")]
    Mask(#[from] MaskError),
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("IO error: {0:?}")]
    IOError(#[from] std::io::Error),
}

/// Dual-fisheye to equirectangular stitcher for one camera rig.
pub struct PanoStitcher<B: GraphicsBackend> {
    params: FisheyePanoParams,
    pipeline: StitchPipeline<B>,
}

impl<B: GraphicsBackend> PanoStitcher<B> {
    /// Precomputes the warp tables and creates the rendering context.
    /// Without `masks`, a linear ramp across the seam is used.
    pub fn new(backend: B, params: FisheyePanoParams, masks: Option<BlendMasks>, config: StitchConfig) -> Result<Self, StitchError> {
        params.validate()?;
        config.validate()?;

        let _time = std::time::Instant::now();
        let cameras = [
            CameraModel::new(&params.cameras[0], params.max_fov_angle, params.sphere_radius),
            CameraModel::new(&params.cameras[1], params.max_fov_angle, params.sphere_radius),
        ];
        let regions = RegionSet::build(&params, &cameras, &config);
        ::log::debug!("Warp tables built in {:.3}ms", _time.elapsed().as_micros() as f64 / 1000.0);

        let masks = match masks {
            Some(m) => m,
            None => BlendMasks::generate_linear(&regions.seam),
        };

        let mut pipeline = StitchPipeline::new(backend, Arc::new(regions), Arc::new(masks), config);
        pipeline.init()?;

        Ok(Self { params, pipeline })
    }

    /// Same as [`PanoStitcher::new`], with the masks read from a file of `config.mask_size` planes.
    pub fn with_mask_file(backend: B, params: FisheyePanoParams, mask_path: &str, config: StitchConfig) -> Result<Self, StitchError> {
        let [w, h] = config.mask_size;
        let masks = BlendMasks::load(mask_path, w, h)?;
        Self::new(backend, params, Some(masks), config)
    }

    pub fn params(&self) -> &FisheyePanoParams { &self.params }
    pub fn pano_size(&self) -> (usize, usize) { (self.params.pano_width, self.params.pano_height) }
    pub fn pipeline(&self) -> &StitchPipeline<B> { &self.pipeline }

    pub fn stitch_into(&mut self, front: &ImageFrame, back: &ImageFrame, pano: &mut PanoramaImage) -> Result<StitchReport, StitchError> {
        self.pipeline.stitch(front, back, pano)
    }

    pub fn stitch(&mut self, front: &ImageFrame, back: &ImageFrame) -> Result<(PanoramaImage, StitchReport), StitchError> {
        let (w, h) = self.pano_size();
        let mut pano = PanoramaImage::new(w, h);
        let report = self.pipeline.stitch(front, back, &mut pano)?;
        Ok((pano, report))
    }

    pub fn teardown(&mut self) {
        self.pipeline.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu::cpu::CpuBackend;
    use nalgebra::Vector3;

    const SRC: usize = 200;

    // 720x360 panorama, 200px sensors with a 96° half-angle
    fn rig(pano_width: usize) -> FisheyePanoParams {
        let mut params = FisheyePanoParams { pano_width, pano_height: 360, max_fov_angle: 96.0, ..Default::default() };
        for c in &mut params.cameras {
            c.image_width = SRC;
            c.image_height = SRC;
            c.center = [100.0, 100.0];
            c.focal = 100.0 / 96f64.to_radians();
        }
        params.cameras[0].rotation = [0.0, 0.0, 0.0];
        params.cameras[1].rotation = [180.0, 0.0, 0.0];
        params
    }

    fn config() -> StitchConfig {
        StitchConfig { grid_pitch: 10, ..Default::default() }
    }

    fn gray(value: u8) -> Vec<u8> { vec![value; SRC * SRC * 3] }

    #[test]
    fn uniform_gray() {
        let mut stitcher = PanoStitcher::new(CpuBackend, rig(720), None, config()).unwrap();
        let src = gray(128);
        let frame = ImageFrame::new(&src, SRC, SRC, SRC * 3).unwrap();

        let (pano, report) = stitcher.stitch(&frame, &frame).unwrap();
        assert!(report.is_complete());
        assert_eq!((pano.width(), pano.height()), (720, 360));
        for y in 0..360 {
            for x in 0..720 {
                for c in pano.pixel(x, y) {
                    assert!((c as i32 - 128).abs() <= 2, "pixel {x},{y}: {c}");
                }
            }
        }
        assert_eq!(stitcher.pipeline().device().unwrap().live_meshes(), 0);
    }

    #[test]
    fn marker_lands_on_its_longitude() {
        let params = rig(720);
        let model = CameraModel::new(&params.cameras[0], params.max_fov_angle, params.sphere_radius);

        // Project the direction at lon 30°, lat 20° into the front sensor
        let (lon, lat) = (30f64.to_radians(), 20f64.to_radians());
        let u = (lon + std::f64::consts::PI) / (2.0 * std::f64::consts::PI) * 720.0;
        let v = (std::f64::consts::FRAC_PI_2 - lat) / std::f64::consts::PI * 360.0;
        let ray: Vector3<f64> = CameraModel::sphere_direction(u, v, 720, 360);
        let p = model.project(&ray);
        let (mx, my) = (p.x.round() as usize, p.y.round() as usize);

        let mut front = gray(0);
        for y in my - 1..=my + 1 {
            for x in mx - 1..=mx + 1 {
                front[(y * SRC + x) * 3..(y * SRC + x) * 3 + 3].copy_from_slice(&[255, 255, 255]);
            }
        }
        let back = gray(0);

        let mut stitcher = PanoStitcher::new(CpuBackend, params, None, config()).unwrap();
        let (pano, _) = stitcher.stitch(
            &ImageFrame::new(&front, SRC, SRC, SRC * 3).unwrap(),
            &ImageFrame::new(&back, SRC, SRC, SRC * 3).unwrap()
        ).unwrap();

        let (mut sx, mut sy, mut n) = (0.0, 0.0, 0.0);
        for y in 0..360 {
            for x in 0..720 {
                let w = pano.pixel(x, y)[0] as f64;
                if w > 64.0 {
                    sx += x as f64 * w;
                    sy += y as f64 * w;
                    n += w;
                }
            }
        }
        assert!(n > 0.0, "marker not found");
        let (cx, cy) = (sx / n, sy / n);
        assert!((cx - u).abs() <= 10.0 && (cy - v).abs() <= 10.0, "centroid {cx},{cy} expected {u},{v}");
    }

    #[test]
    fn degenerate_width_does_not_crash() {
        let mut stitcher = PanoStitcher::new(CpuBackend, rig(1), None, config()).unwrap();
        let src = gray(50);
        let frame = ImageFrame::new(&src, SRC, SRC, SRC * 3).unwrap();

        let (pano, report) = stitcher.stitch(&frame, &frame).unwrap();
        assert_eq!((pano.width(), pano.height()), (1, 360));
        assert!(!report.is_complete());
        assert_eq!(report.quadrant(Quadrant::TopLeft), RegionStatus::Failed);
        assert_eq!(report.region(Camera::Front, Quadrant::TopRight), RegionStatus::Failed);
    }

    #[test]
    fn repeated_runs_are_identical() {
        let src: Vec<u8> = (0..SRC * SRC * 3).map(|i| ((i * 31) % 251) as u8).collect();
        let frame = ImageFrame::new(&src, SRC, SRC, SRC * 3).unwrap();

        let mut a = PanoStitcher::new(CpuBackend, rig(720), None, config()).unwrap();
        let mut b = PanoStitcher::new(CpuBackend, rig(720), None, config()).unwrap();
        let (pa, _) = a.stitch(&frame, &frame).unwrap();
        let (pb, _) = b.stitch(&frame, &frame).unwrap();
        assert!(pa.data() == pb.data());

        let (pa2, _) = a.stitch(&frame, &frame).unwrap();
        assert!(pa.data() == pa2.data());
    }

    #[test]
    fn padded_stride_and_roi() {
        // The picture sits at (8, 4) inside a wider buffer with padded rows
        let stride = (SRC + 16) * 3 + 12;
        let mut buf = vec![255u8; stride * (SRC + 8)];
        for y in 0..SRC {
            buf[(y + 4) * stride + 8 * 3..(y + 4) * stride + (8 + SRC) * 3].fill(128);
        }
        let frame = ImageFrame::new(&buf, SRC + 16, SRC + 8, stride).unwrap()
            .with_roi(PixelRect::new(8, 4, SRC, SRC)).unwrap();

        let mut stitcher = PanoStitcher::new(CpuBackend, rig(720), None, config()).unwrap();
        let (pano, report) = stitcher.stitch(&frame, &frame).unwrap();
        assert!(report.is_complete());
        assert!(pano.data().iter().all(|&c| (c as i32 - 128).abs() <= 2));
    }

    #[test]
    fn frame_size_must_match_calibration() {
        // Twice the calibrated size, left half black and right half white
        let big = SRC * 2;
        let mut src = vec![0u8; big * big * 3];
        for row in src.chunks_exact_mut(big * 3) { row[big * 3 / 2..].fill(255); }
        let frame = ImageFrame::new(&src, big, big, big * 3).unwrap();

        let mut stitcher = PanoStitcher::new(CpuBackend, rig(720), None, config()).unwrap();
        assert!(matches!(stitcher.stitch(&frame, &frame), Err(StitchError::InvalidInput(_))));
    }

    #[test]
    fn missing_mask_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("masks.bin");
        let r = PanoStitcher::with_mask_file(CpuBackend, rig(720), path.to_str().unwrap(), config());
        assert!(matches!(r, Err(StitchError::Mask(MaskError::Open(..)))));
    }

    #[test]
    fn invalid_params() {
        let params = FisheyePanoParams { pano_width: 0, ..Default::default() };
        assert!(matches!(PanoStitcher::new(CpuBackend, params, None, StitchConfig::default()), Err(StitchError::Calibration(_))));
    }
}
