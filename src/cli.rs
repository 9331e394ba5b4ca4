// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2022 Adrian <adrian.eddy at gmail>

use argh::FromArgs;
use std::fs::File;
use std::io::{ BufReader, BufWriter, ErrorKind, Read, Write };
use std::time::Instant;
use indicatif::{ ProgressBar, ProgressState, ProgressStyle };
use panostitch_core::*;
use panostitch_core::gpu::{ self, cpu::CpuBackend, wgpu::WgpuBackend };

/** Panostitch
Dual-fisheye to equirectangular panorama stitching
*/
#[derive(FromArgs)]
struct Opts {
    /// rig calibration json, default: built-in 1440x720 rig
    #[argh(option, short = 'c')]
    calibration: Option<String>,

    /// stitcher settings json, eg. "{{ 'grid_pitch': 20, 'swap_channels': false }}" or a path to a file
    #[argh(option, short = 's')]
    settings: Option<String>,

    /// raw RGB24 frames of the front camera
    #[argh(option)]
    front: Option<String>,

    /// raw RGB24 frames of the back camera
    #[argh(option)]
    back: Option<String>,

    /// blend mask file, default: linear ramp across the seam
    #[argh(option, short = 'm')]
    mask: Option<String>,

    /// output file for raw RGB24 panoramas
    #[argh(option, short = 'o')]
    output: Option<String>,

    /// rendering backend: auto, wgpu or cpu. Default: auto
    #[argh(option, short = 'b', default = "String::from(\"auto\")")]
    backend: String,

    /// maximum number of frames to stitch, default: all
    #[argh(option, short = 'n')]
    frames: Option<usize>,

    /// overwrite if output file exists, default: false
    #[argh(switch, short = 'f')]
    overwrite: bool,

    /// print the panorama size and seam geometry, then exit
    #[argh(switch)]
    info: bool,

    /// print version
    #[argh(switch, short = 'v')]
    version: bool,
}

pub fn will_run_in_console() -> bool {
    std::env::args().len() > 1
}

pub fn run() -> bool {
    let opts: Opts = argh::from_env();

    if opts.version {
        println!("Panostitch v{}", env!("CARGO_PKG_VERSION"));
        return true;
    }

    let mut params = FisheyePanoParams::default();
    if let Some(path) = &opts.calibration {
        if let Err(e) = params.load_from_file(path) {
            log::error!("Failed to load calibration {}: {}", path, e);
            return false;
        }
    }
    let config = match load_settings(opts.settings.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            log::error!("Invalid settings: {}", e);
            return false;
        }
    };

    if opts.info {
        print_info(&params, &config);
        return true;
    }

    let (Some(front), Some(back), Some(output)) = (&opts.front, &opts.back, &opts.output) else {
        log::error!("--front, --back and --output are required. See --help");
        return false;
    };
    for file in [front, back] {
        if !std::path::Path::new(file).exists() {
            log::error!("File {} doesn't exist.", file);
            return false;
        }
    }
    if !opts.overwrite && std::path::Path::new(output).exists() {
        log::error!("Output file {} already exists, use -f to overwrite.", output);
        return false;
    }

    let use_wgpu = match opts.backend.as_str() {
        "cpu"  => false,
        "wgpu" => true,
        "auto" => {
            match gpu::initialize_contexts() {
                Some(name) => { log::info!("Using GPU: {}", name); true },
                None => { log::warn!("No GPU available, falling back to the software renderer"); false }
            }
        },
        other => {
            log::error!("Unknown backend {}", other);
            return false;
        }
    };

    let time = Instant::now();
    let result = if use_wgpu {
        stitch_files(WgpuBackend, &opts, params, config)
    } else {
        stitch_files(CpuBackend, &opts, params, config)
    };

    match result {
        Ok(frames) => {
            log::info!("Stitched {} frames in {:.2}s", frames, time.elapsed().as_secs_f64());
            true
        },
        Err(e) => {
            log::error!("Stitching failed: {}", e);
            false
        }
    }
}

fn load_settings(settings: Option<&str>) -> Result<StitchConfig, CalibrationError> {
    let mut config = StitchConfig::default();
    match settings {
        Some(s) if s.trim_start().starts_with('{') => { config = StitchConfig::from_json(&s.replace('\'', "\""))?; },
        Some(path) => { config.load_from_file(path)?; },
        None => { }
    }
    Ok(config)
}

fn print_info(params: &FisheyePanoParams, config: &StitchConfig) {
    let seam = panostitch_core::region::SeamGeometry::compute(params.pano_width, params.pano_height, params.max_fov_angle, config.grid_pitch);
    println!("Rig: {}", if params.name.is_empty() { "-" } else { &params.name });
    println!("Panorama: {}x{}", params.pano_width, params.pano_height);
    println!("Region: {}x{}", seam.region_width, seam.region_height);
    println!("Seam: {} px at {:?}", seam.seam_width, seam.roi());
    for (camera, c) in Camera::ALL.iter().zip(params.cameras.iter()) {
        println!("{:?}: {}x{}, yaw {} pitch {} roll {}", camera, c.image_width, c.image_height, c.rotation[0], c.rotation[1], c.rotation[2]);
    }
}

/// Reads one frame, `Ok(false)` at the end of the stream.
fn read_frame<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e)
    }
}

fn stitch_files<B: GraphicsBackend>(backend: B, opts: &Opts, params: FisheyePanoParams, config: StitchConfig) -> Result<usize, StitchError> {
    let (Some(front_path), Some(back_path), Some(output_path)) = (&opts.front, &opts.back, &opts.output) else {
        return Err(StitchError::InvalidInput("missing input".into()));
    };
    let sizes = params.cameras.iter().map(|c| (c.image_width, c.image_height)).collect::<Vec<_>>();
    let frame_count = {
        let len = std::fs::metadata(front_path)?.len() as usize;
        len / (sizes[0].0 * sizes[0].1 * 3).max(1)
    };

    let mut stitcher = match &opts.mask {
        Some(mask) => PanoStitcher::with_mask_file(backend, params, mask, config)?,
        None => PanoStitcher::new(backend, params, None, config)?,
    };
    let (pw, ph) = stitcher.pano_size();

    let mut front_reader = BufReader::new(File::open(front_path)?);
    let mut back_reader = BufReader::new(File::open(back_path)?);
    let mut writer = BufWriter::new(File::create(output_path)?);

    let mut front = vec![0u8; sizes[0].0 * sizes[0].1 * 3];
    let mut back = vec![0u8; sizes[1].0 * sizes[1].1 * 3];
    let mut pano = PanoramaImage::new(pw, ph);

    let total = opts.frames.map(|n| n.min(frame_count)).unwrap_or(frame_count);
    let pb = ProgressBar::new(total as u64);
    if let Ok(sty) = ProgressStyle::with_template("[{bar:50.cyan/blue}] {pos:>5}/{len:5} {eta:11} {msg}") {
        pb.set_style(sty
            .with_key("eta", |state: &ProgressState, w: &mut dyn std::fmt::Write| { let _ = write!(w, "ETA {:.1}s", state.eta().as_secs_f64()); })
            .progress_chars("#>-"));
    }

    let mut stitched = 0;
    while stitched < total {
        if !read_frame(&mut front_reader, &mut front)? || !read_frame(&mut back_reader, &mut back)? {
            log::warn!("Input ended after {} frames", stitched);
            break;
        }
        let front_frame = ImageFrame::new(&front, sizes[0].0, sizes[0].1, sizes[0].0 * 3).ok_or_else(|| StitchError::InvalidInput("front frame".into()))?;
        let back_frame = ImageFrame::new(&back, sizes[1].0, sizes[1].1, sizes[1].0 * 3).ok_or_else(|| StitchError::InvalidInput("back frame".into()))?;

        let report = stitcher.stitch_into(&front_frame, &back_frame, &mut pano)?;
        if !report.is_complete() {
            log::warn!("Frame {} is incomplete: {:?}", stitched, report);
        }
        writer.write_all(pano.data())?;

        stitched += 1;
        pb.set_position(stitched as u64);
    }
    writer.flush()?;
    pb.finish_and_clear();

    Ok(stitched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("{ 'grid_pitch': 20, 'swap_channels': false }", Some((20, false)) ; "inline json")]
    #[test_case("  {'swap_channels': true}", Some((40, true)) ; "partial with defaults")]
    #[test_case("{ 'grid_pitch': 0 }", None ; "zero pitch")]
    #[test_case("{ 'grid_pitch': ", None ; "broken json")]
    fn inline_settings(settings: &str, expected: Option<(usize, bool)>) {
        match (load_settings(Some(settings)), expected) {
            (Ok(c), Some((pitch, swap))) => {
                assert_eq!((c.grid_pitch, c.swap_channels), (pitch, swap));
                assert!(c.confidence_blending);
            },
            (Err(_), None) => { },
            (r, e) => panic!("{:?} expected {:?}", r.map(|c| c.grid_pitch), e),
        }
    }

    #[test]
    fn settings_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{ "grid_pitch": 16 }"#).unwrap();
        file.flush().unwrap();
        assert_eq!(load_settings(file.path().to_str()).unwrap().grid_pitch, 16);
        assert_eq!(load_settings(None).unwrap(), StitchConfig::default());
        assert!(load_settings(Some("/nonexistent/settings.json")).is_err());
    }

    #[test]
    fn frame_stream() {
        let data = [1u8; 10];
        let mut reader = &data[..];
        let mut buf = [0u8; 4];
        assert!(read_frame(&mut reader, &mut buf).unwrap());
        assert!(read_frame(&mut reader, &mut buf).unwrap());
        assert!(!read_frame(&mut reader, &mut buf).unwrap());
    }

    #[test]
    fn stitches_raw_files() {
        let dir = tempfile::tempdir().unwrap();
        // Wide lenses so that every grid vertex next to the seam sees both cameras
        let mut params = FisheyePanoParams { pano_width: 80, pano_height: 40, max_fov_angle: 110.0, ..Default::default() };
        for c in &mut params.cameras {
            c.image_width = 32;
            c.image_height = 32;
            c.center = [16.0, 16.0];
            c.focal = 16.0 / 110f64.to_radians();
        }
        let raw = vec![90u8; 32 * 32 * 3 * 2];
        let front = dir.path().join("front.rgb");
        let back = dir.path().join("back.rgb");
        let output = dir.path().join("pano.rgb");
        std::fs::write(&front, &raw).unwrap();
        std::fs::write(&back, &raw).unwrap();

        let opts = Opts {
            calibration: None,
            settings: None,
            front: Some(front.to_string_lossy().into()),
            back: Some(back.to_string_lossy().into()),
            mask: None,
            output: Some(output.to_string_lossy().into()),
            backend: "cpu".into(),
            frames: None,
            overwrite: true,
            info: false,
            version: false,
        };
        let config = StitchConfig { grid_pitch: 8, ..Default::default() };
        assert_eq!(stitch_files(CpuBackend, &opts, params, config).unwrap(), 2);

        let out = std::fs::read(&output).unwrap();
        assert_eq!(out.len(), 80 * 40 * 3 * 2);
        assert!(out.iter().all(|&c| (c as i32 - 90).abs() <= 2));
    }
}
