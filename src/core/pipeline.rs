// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2021-2022 Adrian <adrian.eddy at gmail>

use std::collections::{ HashMap, HashSet };
use std::sync::Arc;

use crate::StitchError;
use crate::assembler::PanoramaAssembler;
use crate::blend_mask::BlendMasks;
use crate::config::StitchConfig;
use crate::frame::{ ImageFrame, PanoramaImage, PixelRect };
use crate::gpu::*;
use crate::region::{ Camera, Quadrant, RegionDescriptor, RegionSet, REGION_SLOTS, warp_slot };

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Uninitialized,
    ContextReady,
    TornDown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionStatus {
    Rendered,
    Failed,
}

/// Outcome of one frame. Failures of individual passes are logged and reported here,
/// the rest of the frame is still produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StitchReport {
    /// Warp passes, in `REGION_SLOTS` order
    pub regions: [RegionStatus; 8],
    /// Blend and readback of each quadrant, in `Quadrant::ALL` order
    pub quadrants: [RegionStatus; 4],
}

impl StitchReport {
    pub fn is_complete(&self) -> bool {
        self.regions.iter().chain(self.quadrants.iter()).all(|s| *s == RegionStatus::Rendered)
    }
    pub fn region(&self, camera: Camera, quadrant: Quadrant) -> RegionStatus { self.regions[warp_slot(camera, quadrant)] }
    pub fn quadrant(&self, quadrant: Quadrant) -> RegionStatus { self.quadrants[quadrant.slot()] }
}

fn status<T>(r: &Result<T, GpuError>) -> RegionStatus {
    if r.is_ok() { RegionStatus::Rendered } else { RegionStatus::Failed }
}

/// Everything created on the device. Released in reverse order of creation when dropped,
/// the device itself goes last.
struct ResourceSet<D: GraphicsDevice> {
    device: D,
    warp_program: Option<ProgramId>,
    blend_program: Option<ProgramId>,
    mask_textures: Vec<TextureId>,
    warp_targets: Vec<TargetId>,
    blend_targets: Vec<TargetId>,
    readback_buffers: Vec<BufferId>,
    source_textures: HashMap<(Camera, PixelRect), TextureId>,
}

impl<D: GraphicsDevice> ResourceSet<D> {
    fn acquire(device: D, regions: &RegionSet, masks: &BlendMasks) -> Result<Self, GpuError> {
        // Partially acquired sets are released by Drop on the error path
        let mut set = Self {
            device,
            warp_program: None,
            blend_program: None,
            mask_textures: Vec::with_capacity(4),
            warp_targets: Vec::with_capacity(REGION_SLOTS.len()),
            blend_targets: Vec::with_capacity(4),
            readback_buffers: Vec::with_capacity(4),
            source_textures: HashMap::new(),
        };

        set.warp_program = Some(set.device.create_program(ProgramKind::Warp)?);
        set.blend_program = Some(set.device.create_program(ProgramKind::Blend)?);

        for q in Quadrant::ALL {
            let mask = masks.get(q);
            let tex = set.device.create_texture(mask.width as u32, mask.height as u32, TextureFormat::R8)?;
            set.mask_textures.push(tex);
            set.device.update_texture(tex, mask.width as u32, mask.height as u32, &mask.data, mask.width)?;
        }

        for &(camera, quadrant) in &REGION_SLOTS {
            let (w, h) = regions.get(camera, quadrant).map(|r| r.dst_size()).unwrap_or_default();
            let target = set.device.create_render_target(w as u32, h as u32)?;
            set.warp_targets.push(target);
        }

        let (w, h) = regions.region_size();
        for _ in Quadrant::ALL {
            let target = set.device.create_render_target(w as u32, h as u32)?;
            set.blend_targets.push(target);
            let buffer = set.device.create_readback_buffer(w as u32, h as u32)?;
            set.readback_buffers.push(buffer);
        }

        Ok(set)
    }

    fn programs(&self) -> Result<(ProgramId, ProgramId), GpuError> {
        match (self.warp_program, self.blend_program) {
            (Some(w), Some(b)) => Ok((w, b)),
            _ => Err(GpuError::InvalidHandle("program", u32::MAX))
        }
    }

    /// Texture holding `rect` of the camera frame, uploaded at most once per frame.
    fn source_texture(&mut self, camera: Camera, rect: PixelRect, frame: &ImageFrame, uploaded: &mut HashSet<(Camera, PixelRect)>) -> Result<TextureId, GpuError> {
        let key = (camera, rect);
        let id = match self.source_textures.get(&key) {
            Some(id) => *id,
            None => {
                let id = self.device.create_texture(rect.width as u32, rect.height as u32, TextureFormat::Rgb8)?;
                self.source_textures.insert(key, id);
                id
            }
        };
        if !uploaded.contains(&key) {
            let data = frame.rect_data(&rect).ok_or(GpuError::SizeMismatch(rect.right() * rect.bottom(), frame.width() * frame.height()))?;
            self.device.update_texture(id, rect.width as u32, rect.height as u32, data, frame.stride())?;
            uploaded.insert(key);
        }
        Ok(id)
    }
}

impl<D: GraphicsDevice> Drop for ResourceSet<D> {
    fn drop(&mut self) {
        for (_, id) in self.source_textures.drain() { self.device.destroy_texture(id); }
        for id in self.readback_buffers.drain(..) { self.device.destroy_readback_buffer(id); }
        for id in self.blend_targets.drain(..) { self.device.destroy_render_target(id); }
        for id in self.warp_targets.drain(..) { self.device.destroy_render_target(id); }
        for id in self.mask_textures.drain(..) { self.device.destroy_texture(id); }
        if let Some(id) = self.blend_program.take() { self.device.destroy_program(id); }
        if let Some(id) = self.warp_program.take() { self.device.destroy_program(id); }
        ::log::debug!("Released resources on {}", self.device.name());
    }
}

/// Mesh that lives for a single draw.
struct ScopedMesh<'a, D: GraphicsDevice> {
    device: &'a mut D,
    id: MeshId,
}
impl<'a, D: GraphicsDevice> ScopedMesh<'a, D> {
    fn new(device: &'a mut D, vertices: &[WarpVertex], indices: &[u32]) -> Result<Self, GpuError> {
        let id = device.create_mesh(vertices, indices)?;
        Ok(Self { device, id })
    }
}
impl<'a, D: GraphicsDevice> Drop for ScopedMesh<'a, D> {
    fn drop(&mut self) {
        self.device.destroy_mesh(self.id);
    }
}

/// Drives one rendering context through warp, blend and readback for each frame pair.
pub struct StitchPipeline<B: GraphicsBackend> {
    backend: B,
    config: StitchConfig,
    regions: Arc<RegionSet>,
    masks: Arc<BlendMasks>,
    resources: Option<ResourceSet<B::Device>>,
    state: PipelineState,
}

impl<B: GraphicsBackend> StitchPipeline<B> {
    pub fn new(backend: B, regions: Arc<RegionSet>, masks: Arc<BlendMasks>, config: StitchConfig) -> Self {
        Self { backend, config, regions, masks, resources: None, state: PipelineState::Uninitialized }
    }

    pub fn state(&self) -> PipelineState { self.state }
    pub fn regions(&self) -> &Arc<RegionSet> { &self.regions }
    pub fn device(&self) -> Option<&B::Device> { self.resources.as_ref().map(|r| &r.device) }

    /// Creates the context and all per-pipeline resources. Does nothing when already initialized.
    pub fn init(&mut self) -> Result<(), StitchError> {
        if self.resources.is_some() { return Ok(()); }

        let device = self.backend.create_context()?;
        ::log::info!("Initializing {} pipeline on {}", self.backend.name(), device.name());
        let resources = ResourceSet::acquire(device, &self.regions, &self.masks)?;
        self.resources = Some(resources);
        self.state = PipelineState::ContextReady;
        Ok(())
    }

    /// Releases every resource and the context.
    pub fn teardown(&mut self) {
        if self.resources.take().is_some() {
            self.state = PipelineState::TornDown;
        }
    }

    /// Stitches one synchronized frame pair into `pano`, which must have the configured panorama size.
    pub fn stitch(&mut self, front: &ImageFrame, back: &ImageFrame, pano: &mut PanoramaImage) -> Result<StitchReport, StitchError> {
        let (pw, ph) = self.regions.pano_size;
        if (pano.width(), pano.height()) != (pw, ph) {
            return Err(StitchError::InvalidInput(format!("Panorama size {}x{} doesn't match {}x{}", pano.width(), pano.height(), pw, ph)));
        }
        for (camera, frame) in Camera::ALL.into_iter().zip([front, back]) {
            let (w, h) = self.regions.source_size(camera);
            if (frame.width(), frame.height()) != (w, h) {
                return Err(StitchError::InvalidInput(format!("{:?} frame size {}x{} doesn't match the calibrated {}x{}", camera, frame.width(), frame.height(), w, h)));
            }
        }
        self.init()?;

        let _time = std::time::Instant::now();

        let report = {
            let regions = self.regions.clone();
            let swap_channels = self.config.swap_channels;
            let res = self.resources.as_mut().ok_or_else(|| StitchError::InvalidInput("No rendering context".into()))?;
            let (warp_program, blend_program) = res.programs()?;

            let mut report = StitchReport {
                regions: [RegionStatus::Failed; 8],
                quadrants: [RegionStatus::Failed; 4],
            };

            // Warp
            let frames = [front, back];
            let mut uploaded = HashSet::new();
            for region in regions.iter() {
                let slot = warp_slot(region.camera, region.quadrant);
                let target = res.warp_targets[slot];
                let complete = res.device.check_render_target(target) == TargetStatus::Complete;
                if !complete {
                    ::log::error!("Render target of {:?} {:?} is incomplete", region.camera, region.quadrant);
                }
                let r = Self::warp_region(res, warp_program, target, region, frames[region.camera.index()], &mut uploaded, swap_channels);
                if let Err(e) = &r {
                    ::log::error!("Warp of {:?} {:?} failed: {}", region.camera, region.quadrant, e);
                }
                report.regions[slot] = if complete { status(&r) } else { RegionStatus::Failed };
            }

            // Blend
            for q in Quadrant::ALL {
                let target = res.blend_targets[q.slot()];
                let complete = res.device.check_render_target(target) == TargetStatus::Complete;
                if !complete {
                    ::log::error!("Blend target of {:?} is incomplete", q);
                }
                let inputs = [
                    Sampled::Target(res.warp_targets[warp_slot(Camera::Back, q)]),
                    Sampled::Target(res.warp_targets[warp_slot(Camera::Front, q)]),
                    Sampled::Texture(res.mask_textures[q.slot()]),
                ];
                let r = res.device.draw_fullscreen_quad(blend_program, target, inputs);
                if let Err(e) = &r {
                    ::log::error!("Blend of {:?} failed: {}", q, e);
                }
                report.quadrants[q.slot()] = if complete { status(&r) } else { RegionStatus::Failed };
            }

            // Readback
            let mut queued = [false; 4];
            for q in Quadrant::ALL {
                match res.device.queue_readback(res.blend_targets[q.slot()], res.readback_buffers[q.slot()]) {
                    Ok(()) => { queued[q.slot()] = true; },
                    Err(e) => {
                        ::log::error!("Readback of {:?} failed: {}", q, e);
                        report.quadrants[q.slot()] = RegionStatus::Failed;
                    }
                }
            }
            if let Err(e) = res.device.finish() {
                ::log::error!("Failed to finish frame: {}", e);
                queued = [false; 4];
                report.quadrants = [RegionStatus::Failed; 4];
            }

            for q in Quadrant::ALL {
                if !queued[q.slot()] { continue; }
                if let Err(e) = PanoramaAssembler::store(&mut res.device, res.readback_buffers[q.slot()], q, pano) {
                    ::log::error!("Failed to store {:?}: {}", q, e);
                    report.quadrants[q.slot()] = RegionStatus::Failed;
                }
            }

            report
        };

        ::log::info!("Stitched {}x{} in {:.3}ms", pw, ph, _time.elapsed().as_micros() as f64 / 1000.0);

        if !self.config.reuse_context {
            self.teardown();
        }

        Ok(report)
    }

    fn warp_region(res: &mut ResourceSet<B::Device>, program: ProgramId, target: TargetId, region: &RegionDescriptor, frame: &ImageFrame, uploaded: &mut HashSet<(Camera, PixelRect)>, swap_channels: bool) -> Result<(), GpuError> {
        let rect = region.src_rect(frame.width(), frame.height());
        let texture = res.source_texture(region.camera, rect, frame, uploaded)?;
        let (vertices, indices) = region.table.to_mesh(&rect, region.confidence_blending);
        let mut mesh = ScopedMesh::new(&mut res.device, &vertices, &indices)?;
        mesh.device.draw_mesh(program, target, mesh.id, Sampled::Texture(texture), swap_channels)
    }
}

impl<B: GraphicsBackend> Drop for StitchPipeline<B> {
    fn drop(&mut self) {
        self.teardown();
    }
}
