// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2021-2022 Adrian <adrian.eddy at gmail>

// Software implementation of the rendering capability. Follows the wgpu conventions:
// framebuffer row 0 is clip-space y = +1, texture coordinate v = 0 is the first uploaded row,
// sampling is bilinear with clamp-to-edge.

use nalgebra::Vector4;
use rayon::{ prelude::ParallelSliceMut, iter::{ ParallelIterator, IndexedParallelIterator } };

use super::*;

#[derive(Default, Clone, Copy, Debug)]
pub struct CpuBackend;

impl GraphicsBackend for CpuBackend {
    type Device = CpuDevice;

    fn name(&self) -> &'static str { "cpu" }
    fn create_context(&self) -> Result<CpuDevice, GpuError> {
        ::log::debug!("Creating software rendering context");
        Ok(CpuDevice::default())
    }
}

struct CpuTexture {
    width: usize,
    height: usize,
    channels: usize,
    format: TextureFormat,
    data: Vec<u8>,
}

impl CpuTexture {
    fn new(width: usize, height: usize, format: TextureFormat) -> Self {
        let channels = if format == TextureFormat::R8 { 1 } else { 4 };
        Self { width, height, channels, format, data: vec![0u8; width * height * channels] }
    }

    #[inline]
    fn fetch(&self, x: isize, y: isize) -> Vector4<f32> {
        let x = x.max(0).min(self.width as isize - 1) as usize;
        let y = y.max(0).min(self.height as isize - 1) as usize;
        let o = (y * self.width + x) * self.channels;
        if self.channels == 1 {
            Vector4::new(self.data[o] as f32 / 255.0, 0.0, 0.0, 1.0)
        } else {
            Vector4::new(self.data[o] as f32, self.data[o + 1] as f32, self.data[o + 2] as f32, self.data[o + 3] as f32) / 255.0
        }
    }

    fn sample(&self, u: f32, v: f32) -> Vector4<f32> {
        if self.width == 0 || self.height == 0 { return Vector4::zeros(); }
        let x = u * self.width as f32 - 0.5;
        let y = v * self.height as f32 - 0.5;
        let (x0, y0) = (x.floor(), y.floor());
        let (fx, fy) = (x - x0, y - y0);
        let (xi, yi) = (x0 as isize, y0 as isize);

        let top    = self.fetch(xi, yi)     * (1.0 - fx) + self.fetch(xi + 1, yi)     * fx;
        let bottom = self.fetch(xi, yi + 1) * (1.0 - fx) + self.fetch(xi + 1, yi + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }
}

#[inline]
fn store(px: &mut [u8], c: Vector4<f32>) {
    for i in 0..4 {
        px[i] = (c[i] * 255.0).round().max(0.0).min(255.0) as u8;
    }
}

struct CpuMesh {
    vertices: Vec<WarpVertex>,
    indices: Vec<u32>,
}

#[derive(Default)]
struct CpuReadback {
    width: usize,
    data: Vec<u8>,
    ready: bool,
}

struct Triangle {
    p: [(f32, f32); 3],
    attr: [Vector4<f32>; 3], // confidence, u, v
    area: f32,
    y_range: (f32, f32),
    x_range: (f32, f32),
}

#[inline]
fn edge(a: (f32, f32), b: (f32, f32), p: (f32, f32)) -> f32 {
    (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0)
}

#[derive(Default)]
pub struct CpuDevice {
    textures: Slots<CpuTexture>,
    targets: Slots<CpuTexture>,
    programs: Slots<ProgramKind>,
    meshes: Slots<CpuMesh>,
    buffers: Slots<CpuReadback>,
    pending: Vec<(TargetId, BufferId)>,
}

impl CpuDevice {
    pub fn live_meshes(&self) -> usize { self.meshes.live() }
    pub fn live_textures(&self) -> usize { self.textures.live() + self.targets.live() }

    fn resolve(&self, s: Sampled) -> Result<&CpuTexture, GpuError> {
        match s {
            Sampled::Texture(id) => self.textures.get(id.0).ok_or(GpuError::InvalidHandle("texture", id.0)),
            Sampled::Target(id)  => self.targets.get(id.0).ok_or(GpuError::InvalidHandle("render target", id.0)),
        }
    }

    fn program(&self, id: ProgramId, kind: ProgramKind) -> Result<(), GpuError> {
        match self.programs.get(id.0) {
            Some(k) if *k == kind => Ok(()),
            _ => Err(GpuError::InvalidHandle("program", id.0))
        }
    }

    fn target_size(&self, id: TargetId) -> Result<(usize, usize), GpuError> {
        let t = self.targets.get(id.0).ok_or(GpuError::InvalidHandle("render target", id.0))?;
        if t.width == 0 || t.height == 0 { return Err(GpuError::IncompleteTarget(id.0)); }
        Ok((t.width, t.height))
    }

    fn rasterize(out: &mut [u8], width: usize, height: usize, mesh: &CpuMesh, src: &CpuTexture, swap_channels: bool) {
        let (w, h) = (width as f32, height as f32);
        let tris: Vec<Triangle> = mesh.indices.chunks_exact(3).filter_map(|idx| {
            let v = [mesh.vertices.get(idx[0] as usize)?, mesh.vertices.get(idx[1] as usize)?, mesh.vertices.get(idx[2] as usize)?];
            let p = v.map(|v| ((v.position[0] + 1.0) * 0.5 * w, (v.position[1] + 1.0) * 0.5 * h));
            let area = edge(p[0], p[1], p[2]);
            if area.abs() < 1e-12 { return None; }
            Some(Triangle {
                p,
                attr: v.map(|v| Vector4::new(v.confidence, v.uv[0], v.uv[1], 0.0)),
                area,
                x_range: (p[0].0.min(p[1].0).min(p[2].0), p[0].0.max(p[1].0).max(p[2].0)),
                y_range: (p[0].1.min(p[1].1).min(p[2].1), p[0].1.max(p[1].1).max(p[2].1)),
            })
        }).collect();

        const EPS: f32 = -1e-5;
        out.par_chunks_mut(width * 4).enumerate().for_each(|(y, row)| {
            let py = y as f32 + 0.5;
            for t in tris.iter().filter(|t| py >= t.y_range.0 && py <= t.y_range.1) {
                let x0 = (t.x_range.0.floor().max(0.0) as usize).min(width);
                let x1 = (t.x_range.1.ceil().max(0.0) as usize).min(width);
                for x in x0..x1 {
                    let pt = (x as f32 + 0.5, py);
                    let b0 = edge(t.p[1], t.p[2], pt) / t.area;
                    let b1 = edge(t.p[2], t.p[0], pt) / t.area;
                    let b2 = edge(t.p[0], t.p[1], pt) / t.area;
                    if b0 < EPS || b1 < EPS || b2 < EPS { continue; }

                    let a = t.attr[0] * b0 + t.attr[1] * b1 + t.attr[2] * b2;
                    let mut c = src.sample(a[1], a[2]) * a[0];
                    if swap_channels { c.swap_rows(0, 2); }
                    store(&mut row[x * 4..x * 4 + 4], c);
                }
            }
        });
    }
}

impl GraphicsDevice for CpuDevice {
    fn name(&self) -> String { "CPU".into() }

    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<TextureId, GpuError> {
        Ok(TextureId(self.textures.insert(CpuTexture::new(width as usize, height as usize, format))))
    }

    fn update_texture(&mut self, id: TextureId, width: u32, height: u32, data: &[u8], stride: usize) -> Result<(), GpuError> {
        let tex = self.textures.get_mut(id.0).ok_or(GpuError::InvalidHandle("texture", id.0))?;
        let (width, height) = (width as usize, height as usize);
        let bpp = tex.format.upload_bytes_per_pixel();
        let needed = if height == 0 { 0 } else { (height - 1) * stride + width * bpp };
        if data.len() < needed || stride < width * bpp { return Err(GpuError::SizeMismatch(needed, data.len())); }

        if tex.width != width || tex.height != height {
            tex.width = width;
            tex.height = height;
            tex.data = vec![0u8; width * height * tex.channels];
        }
        if width == 0 || height == 0 { return Ok(()); }

        let channels = tex.channels;
        tex.data.par_chunks_mut(width * channels).enumerate().for_each(|(y, dst)| {
            let src = &data[y * stride..y * stride + width * bpp];
            if bpp == channels {
                dst.copy_from_slice(src);
            } else {
                for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(3)) {
                    d[..3].copy_from_slice(s);
                    d[3] = 255;
                }
            }
        });
        Ok(())
    }

    fn destroy_texture(&mut self, id: TextureId) { self.textures.remove(id.0); }

    fn create_render_target(&mut self, width: u32, height: u32) -> Result<TargetId, GpuError> {
        Ok(TargetId(self.targets.insert(CpuTexture::new(width as usize, height as usize, TextureFormat::Rgba8))))
    }

    fn check_render_target(&self, id: TargetId) -> TargetStatus {
        match self.targets.get(id.0) {
            Some(t) if t.width > 0 && t.height > 0 => TargetStatus::Complete,
            _ => TargetStatus::Incomplete
        }
    }

    fn destroy_render_target(&mut self, id: TargetId) { self.targets.remove(id.0); }

    fn create_program(&mut self, kind: ProgramKind) -> Result<ProgramId, GpuError> {
        Ok(ProgramId(self.programs.insert(kind)))
    }
    fn destroy_program(&mut self, id: ProgramId) { self.programs.remove(id.0); }

    fn create_mesh(&mut self, vertices: &[WarpVertex], indices: &[u32]) -> Result<MeshId, GpuError> {
        if let Some(&i) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(GpuError::SizeMismatch(i as usize, vertices.len()));
        }
        Ok(MeshId(self.meshes.insert(CpuMesh { vertices: vertices.to_vec(), indices: indices.to_vec() })))
    }
    fn destroy_mesh(&mut self, id: MeshId) { self.meshes.remove(id.0); }

    fn draw_mesh(&mut self, program: ProgramId, target: TargetId, mesh: MeshId, source: Sampled, swap_channels: bool) -> Result<(), GpuError> {
        self.program(program, ProgramKind::Warp)?;
        let (w, h) = self.target_size(target)?;
        let mut out = vec![0u8; w * h * 4];
        {
            let mesh = self.meshes.get(mesh.0).ok_or(GpuError::InvalidHandle("mesh", mesh.0))?;
            let src = self.resolve(source)?;
            Self::rasterize(&mut out, w, h, mesh, src, swap_channels);
        }
        if let Some(t) = self.targets.get_mut(target.0) { t.data = out; }
        Ok(())
    }

    fn draw_fullscreen_quad(&mut self, program: ProgramId, target: TargetId, inputs: [Sampled; 3]) -> Result<(), GpuError> {
        self.program(program, ProgramKind::Blend)?;
        let (w, h) = self.target_size(target)?;
        let mut out = vec![0u8; w * h * 4];
        {
            let a = self.resolve(inputs[0])?;
            let b = self.resolve(inputs[1])?;
            let mask = self.resolve(inputs[2])?;
            out.par_chunks_mut(w * 4).enumerate().for_each(|(y, row)| {
                let v = (y as f32 + 0.5) / h as f32;
                for (x, px) in row.chunks_exact_mut(4).enumerate() {
                    let u = (x as f32 + 0.5) / w as f32;
                    let t = 1.0 - mask.sample(u, v)[0];
                    store(px, a.sample(u, v) * (1.0 - t) + b.sample(u, v) * t);
                }
            });
        }
        if let Some(t) = self.targets.get_mut(target.0) { t.data = out; }
        Ok(())
    }

    fn create_readback_buffer(&mut self, width: u32, height: u32) -> Result<BufferId, GpuError> {
        let (width, height) = (width as usize, height as usize);
        Ok(BufferId(self.buffers.insert(CpuReadback { width, data: vec![0u8; width * height * 4], ready: false })))
    }
    fn destroy_readback_buffer(&mut self, id: BufferId) {
        self.pending.retain(|(_, b)| *b != id);
        self.buffers.remove(id.0);
    }

    fn queue_readback(&mut self, target: TargetId, buffer: BufferId) -> Result<(), GpuError> {
        let t = self.targets.get(target.0).ok_or(GpuError::InvalidHandle("render target", target.0))?;
        let b = self.buffers.get_mut(buffer.0).ok_or(GpuError::InvalidHandle("buffer", buffer.0))?;
        if t.data.len() != b.data.len() { return Err(GpuError::SizeMismatch(b.data.len(), t.data.len())); }
        b.ready = false;
        self.pending.push((target, buffer));
        Ok(())
    }

    fn finish(&mut self) -> Result<(), GpuError> {
        for (target, buffer) in std::mem::take(&mut self.pending) {
            if let (Some(t), Some(b)) = (self.targets.get(target.0), self.buffers.get_mut(buffer.0)) {
                if t.data.len() == b.data.len() {
                    b.data.copy_from_slice(&t.data);
                    b.ready = true;
                }
            }
        }
        Ok(())
    }

    fn map_readback(&mut self, buffer: BufferId, f: &mut dyn FnMut(&[u8], usize)) -> Result<(), GpuError> {
        let b = self.buffers.get(buffer.0).ok_or(GpuError::InvalidHandle("buffer", buffer.0))?;
        if !b.ready {
            return Err(GpuError::Map(buffer.0, "no completed transfer".into()));
        }
        f(&b.data, b.width * 4);
        Ok(())
    }
}
