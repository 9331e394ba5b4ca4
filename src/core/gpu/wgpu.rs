// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2021-2022 Adrian <adrian.eddy at gmail>

use std::borrow::Cow;
use bytemuck::{ Pod, Zeroable };
use futures_intrusive::channel::shared::{ oneshot_channel, OneshotReceiver };
use parking_lot::RwLock;
use wgpu::{ Adapter, BufferUsages, TextureUsages };
use wgpu::util::DeviceExt;

use super::{ BufferId, GpuError, GraphicsBackend, GraphicsDevice, MeshId, ProgramId, ProgramKind, Sampled, Slots, TargetId, TargetStatus, TextureFormat, TextureId, WarpVertex };

#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct WarpGlobals {
    swap_channels: u32,
    pad: [u32; 3],
}
unsafe impl Zeroable for WarpGlobals {}
unsafe impl Pod for WarpGlobals {}

lazy_static::lazy_static! {
    static ref ADAPTER: RwLock<Option<Adapter>> = RwLock::new(None);
}

#[derive(Default, Clone, Copy, Debug)]
pub struct WgpuBackend;

impl WgpuBackend {
    pub fn initialize_context() -> Option<String> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))?;
        let info = adapter.get_info();
        log::debug!("WGPU adapter: {:?}", &info);

        let name = info.name.clone();

        *ADAPTER.write() = Some(adapter);

        Some(name)
    }
}

impl GraphicsBackend for WgpuBackend {
    type Device = WgpuDevice;

    fn name(&self) -> &'static str { "wgpu" }

    fn create_context(&self) -> Result<WgpuDevice, GpuError> {
        let adapter_initialized = ADAPTER.read().is_some();
        if !adapter_initialized { Self::initialize_context(); }
        let lock = ADAPTER.read();
        let adapter = lock.as_ref().ok_or_else(|| GpuError::ContextCreation("no adapter available".into()))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("panostitch"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
        }, None)).map_err(|e| GpuError::ContextCreation(e.to_string()))?;

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("linear clamp"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        let globals_buffer = device.create_buffer(&wgpu::BufferDescriptor { size: std::mem::size_of::<WarpGlobals>() as u64, usage: BufferUsages::UNIFORM | BufferUsages::COPY_DST, label: Some("warp globals"), mapped_at_creation: false });

        Ok(WgpuDevice {
            adapter_name: adapter.get_info().name,
            device,
            queue,
            sampler,
            globals_buffer,
            textures: Slots::default(),
            targets: Slots::default(),
            programs: Slots::default(),
            meshes: Slots::default(),
            buffers: Slots::default(),
        })
    }
}

struct GpuTexture {
    // None for zero-sized textures, which wgpu cannot create
    texture: Option<(wgpu::Texture, wgpu::TextureView)>,
    width: u32,
    height: u32,
    format: TextureFormat,
}

struct GpuProgram {
    kind: ProgramKind,
    pipeline: wgpu::RenderPipeline,
    layout: wgpu::BindGroupLayout,
}

struct GpuMesh {
    buffers: Option<(wgpu::Buffer, wgpu::Buffer)>,
    index_count: u32,
}

enum ReadbackState {
    Idle,
    Queued,
    Mapping(OneshotReceiver<Result<(), wgpu::BufferAsyncError>>),
}

struct GpuReadback {
    buffer: Option<wgpu::Buffer>,
    width: u32,
    height: u32,
    padded_stride: u32,
    state: ReadbackState,
}

pub struct WgpuDevice {
    adapter_name: String,
    device: wgpu::Device,
    queue: wgpu::Queue,
    sampler: wgpu::Sampler,
    globals_buffer: wgpu::Buffer,

    textures: Slots<GpuTexture>,
    targets: Slots<GpuTexture>,
    programs: Slots<GpuProgram>,
    meshes: Slots<GpuMesh>,
    buffers: Slots<GpuReadback>,
}

fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgb8 | TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::R8 => wgpu::TextureFormat::R8Unorm,
    }
}

fn stored_bytes_per_pixel(format: TextureFormat) -> usize {
    if format == TextureFormat::R8 { 1 } else { 4 }
}

impl WgpuDevice {
    fn allocate(&self, width: u32, height: u32, format: TextureFormat, usage: TextureUsages) -> GpuTexture {
        let texture = if width > 0 && height > 0 {
            let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                label: None,
                size: wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu_format(format),
                usage,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            Some((texture, view))
        } else {
            None
        };
        GpuTexture { texture, width, height, format }
    }

    /// Runs `f` inside a validation error scope.
    fn scoped<T>(&self, f: impl FnOnce(&Self) -> T) -> Result<T, GpuError> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let ret = f(self);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(e) => Err(GpuError::Device(e.to_string())),
            None => Ok(ret)
        }
    }

    fn view(&self, s: Sampled) -> Result<&wgpu::TextureView, GpuError> {
        let (tex, kind, id) = match s {
            Sampled::Texture(id) => (self.textures.get(id.0), "texture", id.0),
            Sampled::Target(id)  => (self.targets.get(id.0), "render target", id.0),
        };
        tex.ok_or(GpuError::InvalidHandle(kind, id))?
           .texture.as_ref()
           .map(|(_, v)| v)
           .ok_or(GpuError::IncompleteTarget(id))
    }

    fn program(&self, id: ProgramId, kind: ProgramKind) -> Result<&GpuProgram, GpuError> {
        match self.programs.get(id.0) {
            Some(p) if p.kind == kind => Ok(p),
            _ => Err(GpuError::InvalidHandle("program", id.0))
        }
    }

    fn target_view(&self, id: TargetId) -> Result<&wgpu::TextureView, GpuError> {
        self.targets.get(id.0)
            .ok_or(GpuError::InvalidHandle("render target", id.0))?
            .texture.as_ref()
            .map(|(_, v)| v)
            .ok_or(GpuError::IncompleteTarget(id.0))
    }

    fn render_pass<'a>(encoder: &'a mut wgpu::CommandEncoder, label: &str, view: &'a wgpu::TextureView) -> wgpu::RenderPass<'a> {
        encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(label),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view,
                resolve_target: None,
                ops: wgpu::Operations { load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT), store: wgpu::StoreOp::Store },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        })
    }

    fn build_program(&self, kind: ProgramKind) -> GpuProgram {
        let (label, source) = match kind {
            ProgramKind::Warp  => ("warp",  include_str!("warp.wgsl")),
            ProgramKind::Blend => ("blend", include_str!("blend.wgsl")),
        };
        let shader = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
            label: Some(label)
        });

        let vertex_attributes = wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32, 2 => Float32x2];
        let vertex_layout = [wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<WarpVertex>() as u64,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &vertex_attributes,
        }];

        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: None,
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                buffers: if kind == ProgramKind::Warp { &vertex_layout } else { &[] },
            },
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: &[Some(wgpu::ColorTargetState { format: wgpu::TextureFormat::Rgba8Unorm, blend: None, write_mask: wgpu::ColorWrites::ALL })],
            }),
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        });
        let layout = pipeline.get_bind_group_layout(0);
        GpuProgram { kind, pipeline, layout }
    }
}

impl GraphicsDevice for WgpuDevice {
    fn name(&self) -> String { self.adapter_name.clone() }

    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<TextureId, GpuError> {
        let tex = self.scoped(|s| s.allocate(width, height, format, TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST))?;
        Ok(TextureId(self.textures.insert(tex)))
    }

    fn update_texture(&mut self, id: TextureId, width: u32, height: u32, data: &[u8], stride: usize) -> Result<(), GpuError> {
        let (format, old_size) = {
            let t = self.textures.get(id.0).ok_or(GpuError::InvalidHandle("texture", id.0))?;
            (t.format, (t.width, t.height))
        };
        let bpp = format.upload_bytes_per_pixel();
        let (w, h) = (width as usize, height as usize);
        let needed = if h == 0 { 0 } else { (h - 1) * stride + w * bpp };
        if data.len() < needed || stride < w * bpp { return Err(GpuError::SizeMismatch(needed, data.len())); }

        if old_size != (width, height) {
            let tex = self.scoped(|s| s.allocate(width, height, format, TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_DST))?;
            if let Some(t) = self.textures.get_mut(id.0) { *t = tex; }
        }
        let Some((texture, _)) = self.textures.get(id.0).and_then(|t| t.texture.as_ref()) else { return Ok(()); };

        // wgpu has no 3-channel format
        let (bytes, bytes_per_row): (Cow<[u8]>, usize) = if format == TextureFormat::Rgb8 {
            use rayon::prelude::{ ParallelSliceMut, ParallelIterator, IndexedParallelIterator };
            let mut rgba = vec![0u8; w * h * 4];
            rgba.par_chunks_mut(w * 4).enumerate().for_each(|(y, dst)| {
                let src = &data[y * stride..y * stride + w * 3];
                for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(3)) {
                    d[..3].copy_from_slice(s);
                    d[3] = 255;
                }
            });
            (Cow::Owned(rgba), w * 4)
        } else {
            (Cow::Borrowed(&data[..needed]), stride)
        };

        self.queue.write_texture(
            texture.as_image_copy(),
            &bytes,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row as u32),
                rows_per_image: None,
            },
            wgpu::Extent3d { width, height, depth_or_array_layers: 1 },
        );
        Ok(())
    }

    fn destroy_texture(&mut self, id: TextureId) {
        if let Some(GpuTexture { texture: Some((t, _)), .. }) = self.textures.remove(id.0) { t.destroy(); }
    }

    fn create_render_target(&mut self, width: u32, height: u32) -> Result<TargetId, GpuError> {
        let tex = self.scoped(|s| s.allocate(width, height, TextureFormat::Rgba8, TextureUsages::RENDER_ATTACHMENT | TextureUsages::TEXTURE_BINDING | TextureUsages::COPY_SRC))?;
        Ok(TargetId(self.targets.insert(tex)))
    }

    fn check_render_target(&self, id: TargetId) -> TargetStatus {
        match self.targets.get(id.0) {
            Some(GpuTexture { texture: Some(_), .. }) => TargetStatus::Complete,
            _ => TargetStatus::Incomplete
        }
    }

    fn destroy_render_target(&mut self, id: TargetId) {
        if let Some(GpuTexture { texture: Some((t, _)), .. }) = self.targets.remove(id.0) { t.destroy(); }
    }

    fn create_program(&mut self, kind: ProgramKind) -> Result<ProgramId, GpuError> {
        let program = self.scoped(|s| s.build_program(kind))?;
        Ok(ProgramId(self.programs.insert(program)))
    }
    fn destroy_program(&mut self, id: ProgramId) { self.programs.remove(id.0); }

    fn create_mesh(&mut self, vertices: &[WarpVertex], indices: &[u32]) -> Result<MeshId, GpuError> {
        if let Some(&i) = indices.iter().find(|&&i| i as usize >= vertices.len()) {
            return Err(GpuError::SizeMismatch(i as usize, vertices.len()));
        }
        let buffers = if indices.is_empty() {
            None
        } else {
            Some(self.scoped(|s| (
                s.device.create_buffer_init(&wgpu::util::BufferInitDescriptor { label: Some("warp vertices"), contents: bytemuck::cast_slice(vertices), usage: BufferUsages::VERTEX }),
                s.device.create_buffer_init(&wgpu::util::BufferInitDescriptor { label: Some("warp indices"),  contents: bytemuck::cast_slice(indices),  usage: BufferUsages::INDEX }),
            ))?)
        };
        Ok(MeshId(self.meshes.insert(GpuMesh { buffers, index_count: indices.len() as u32 })))
    }

    fn destroy_mesh(&mut self, id: MeshId) {
        if let Some(GpuMesh { buffers: Some((v, i)), .. }) = self.meshes.remove(id.0) {
            v.destroy();
            i.destroy();
        }
    }

    fn draw_mesh(&mut self, program: ProgramId, target: TargetId, mesh: MeshId, source: Sampled, swap_channels: bool) -> Result<(), GpuError> {
        let globals = WarpGlobals { swap_channels: swap_channels as u32, pad: [0; 3] };
        self.queue.write_buffer(&self.globals_buffer, 0, bytemuck::bytes_of(&globals));

        let program = self.program(program, ProgramKind::Warp)?;
        let view = self.target_view(target)?;
        let source = self.view(source)?;
        let mesh = self.meshes.get(mesh.0).ok_or(GpuError::InvalidHandle("mesh", mesh.0))?;

        self.scoped(|s| {
            let bind_group = s.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: None,
                layout: &program.layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(source) },
                    wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::Sampler(&s.sampler) },
                    wgpu::BindGroupEntry { binding: 2, resource: s.globals_buffer.as_entire_binding() },
                ],
            });
            let mut encoder = s.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
            {
                let mut pass = Self::render_pass(&mut encoder, "warp", view);
                if let Some((vertices, indices)) = &mesh.buffers {
                    pass.set_pipeline(&program.pipeline);
                    pass.set_bind_group(0, &bind_group, &[]);
                    pass.set_vertex_buffer(0, vertices.slice(..));
                    pass.set_index_buffer(indices.slice(..), wgpu::IndexFormat::Uint32);
                    pass.draw_indexed(0..mesh.index_count, 0, 0..1);
                }
            }
            s.queue.submit(Some(encoder.finish()));
        })
    }

    fn draw_fullscreen_quad(&mut self, program: ProgramId, target: TargetId, inputs: [Sampled; 3]) -> Result<(), GpuError> {
        let program = self.program(program, ProgramKind::Blend)?;
        let view = self.target_view(target)?;
        let [a, b, mask] = [self.view(inputs[0])?, self.view(inputs[1])?, self.view(inputs[2])?];

        self.scoped(|s| {
            let bind_group = s.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: None,
                layout: &program.layout,
                entries: &[
                    wgpu::BindGroupEntry { binding: 0, resource: wgpu::BindingResource::TextureView(a) },
                    wgpu::BindGroupEntry { binding: 1, resource: wgpu::BindingResource::TextureView(b) },
                    wgpu::BindGroupEntry { binding: 2, resource: wgpu::BindingResource::TextureView(mask) },
                    wgpu::BindGroupEntry { binding: 3, resource: wgpu::BindingResource::Sampler(&s.sampler) },
                ],
            });
            let mut encoder = s.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
            {
                let mut pass = Self::render_pass(&mut encoder, "blend", view);
                pass.set_pipeline(&program.pipeline);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.draw(0..3, 0..1);
            }
            s.queue.submit(Some(encoder.finish()));
        })
    }

    fn create_readback_buffer(&mut self, width: u32, height: u32) -> Result<BufferId, GpuError> {
        let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let stride = width * 4;
        let padding = (align - stride % align) % align;
        let padded_stride = stride + padding;
        let size = padded_stride as u64 * height as u64;

        let buffer = if size > 0 {
            Some(self.scoped(|s| s.device.create_buffer(&wgpu::BufferDescriptor { size, usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST, label: Some("readback"), mapped_at_creation: false }))?)
        } else {
            None
        };
        Ok(BufferId(self.buffers.insert(GpuReadback { buffer, width, height, padded_stride, state: ReadbackState::Idle })))
    }

    fn destroy_readback_buffer(&mut self, id: BufferId) {
        if let Some(GpuReadback { buffer: Some(b), .. }) = self.buffers.remove(id.0) { b.destroy(); }
    }

    fn queue_readback(&mut self, target: TargetId, buffer: BufferId) -> Result<(), GpuError> {
        let t = self.targets.get(target.0).ok_or(GpuError::InvalidHandle("render target", target.0))?;
        let b = self.buffers.get(buffer.0).ok_or(GpuError::InvalidHandle("buffer", buffer.0))?;
        if (t.width, t.height) != (b.width, b.height) {
            return Err(GpuError::SizeMismatch((b.width * b.height) as usize, (t.width * t.height) as usize));
        }
        if let (Some((texture, _)), Some(staging)) = (&t.texture, &b.buffer) {
            self.scoped(|s| {
                let mut encoder = s.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
                encoder.copy_texture_to_buffer(texture.as_image_copy(), wgpu::ImageCopyBuffer {
                    buffer: staging,
                    layout: wgpu::ImageDataLayout {
                        offset: 0,
                        bytes_per_row: Some(b.padded_stride),
                        rows_per_image: None,
                    },
                }, wgpu::Extent3d { width: t.width, height: t.height, depth_or_array_layers: 1 });
                s.queue.submit(Some(encoder.finish()));
            })?;
        }
        if let Some(b) = self.buffers.get_mut(buffer.0) { b.state = ReadbackState::Queued; }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), GpuError> {
        for b in self.buffers.iter_mut() {
            if !matches!(b.state, ReadbackState::Queued) { continue; }
            match &b.buffer {
                Some(buffer) => {
                    let (sender, receiver) = oneshot_channel();
                    buffer.slice(..).map_async(wgpu::MapMode::Read, move |v| { let _ = sender.send(v); });
                    b.state = ReadbackState::Mapping(receiver);
                }
                None => { b.state = ReadbackState::Idle; }
            }
        }
        let _ = self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }

    fn map_readback(&mut self, buffer: BufferId, f: &mut dyn FnMut(&[u8], usize)) -> Result<(), GpuError> {
        let b = self.buffers.get_mut(buffer.0).ok_or(GpuError::InvalidHandle("buffer", buffer.0))?;
        let Some(staging) = &b.buffer else {
            // Zero-sized target, nothing was copied
            f(&[], 0);
            return Ok(());
        };
        let receiver = match std::mem::replace(&mut b.state, ReadbackState::Idle) {
            ReadbackState::Mapping(receiver) => receiver,
            _ => { return Err(GpuError::Map(buffer.0, "no completed transfer".into())); }
        };

        match pollster::block_on(receiver.receive()) {
            Some(Ok(())) => {
                let data = staging.slice(..).get_mapped_range();
                f(&data, b.padded_stride as usize);
                // We have to make sure all mapped views are dropped before we unmap the buffer.
                drop(data);
                staging.unmap();
                Ok(())
            }
            Some(Err(e)) => Err(GpuError::Map(buffer.0, e.to_string())),
            None => Err(GpuError::Map(buffer.0, "map callback dropped".into()))
        }
    }
}

impl Drop for WgpuDevice {
    fn drop(&mut self) {
        log::debug!("Destroying wgpu context on {}", self.adapter_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(dev: &mut WgpuDevice, target: TargetId, w: u32, h: u32) -> (Vec<u8>, usize) {
        let buf = dev.create_readback_buffer(w, h).unwrap();
        dev.queue_readback(target, buf).unwrap();
        dev.finish().unwrap();
        let mut out = (Vec::new(), 0);
        dev.map_readback(buf, &mut |data, stride| { out = (data.to_vec(), stride); }).unwrap();
        // The transfer is consumed by the first map
        assert!(dev.map_readback(buf, &mut |_, _| { }).is_err());
        dev.destroy_readback_buffer(buf);
        out
    }

    #[test]
    fn upload_draw_readback() {
        if WgpuBackend::initialize_context().is_none() {
            log::warn!("No GPU adapter, skipping");
            return;
        }
        let mut dev = WgpuBackend.create_context().unwrap();

        // 10 px wide rows are 40 bytes, padded to 256 in the readback buffer
        let (w, h) = (10u32, 4u32);
        let stride = w as usize * 3 + 2;
        let mut src = vec![0u8; stride * h as usize];
        for row in src.chunks_exact_mut(stride) {
            row[..w as usize * 3].chunks_exact_mut(3).for_each(|p| p.copy_from_slice(&[200, 100, 50]));
        }
        let tex = dev.create_texture(w, h, TextureFormat::Rgb8).unwrap();
        dev.update_texture(tex, w, h, &src, stride).unwrap();
        assert!(dev.update_texture(tex, w, h, &src[..stride], stride).is_err());

        let target = dev.create_render_target(w, h).unwrap();
        assert_eq!(dev.check_render_target(target), TargetStatus::Complete);
        let program = dev.create_program(ProgramKind::Warp).unwrap();
        let v = |x: f32, y: f32| WarpVertex { position: [x, y], confidence: 1.0, uv: [(x + 1.0) / 2.0, (y + 1.0) / 2.0] };
        let mesh = dev.create_mesh(&[v(-1.0, -1.0), v(1.0, -1.0), v(-1.0, 1.0), v(1.0, 1.0)], &[0, 2, 1, 1, 2, 3]).unwrap();

        dev.draw_mesh(program, target, mesh, Sampled::Texture(tex), false).unwrap();
        let (data, padded_stride) = read(&mut dev, target, w, h);
        assert_eq!(padded_stride, 256);
        assert_eq!(data.len(), 256 * h as usize);
        for row in data.chunks_exact(padded_stride) {
            for px in row[..w as usize * 4].chunks_exact(4) {
                assert!(px.iter().zip([200, 100, 50, 255]).all(|(&a, b)| (a as i32 - b).abs() <= 1), "{:?}", px);
            }
        }

        dev.draw_mesh(program, target, mesh, Sampled::Texture(tex), true).unwrap();
        let (data, _) = read(&mut dev, target, w, h);
        assert!((data[0] as i32 - 50).abs() <= 1 && (data[2] as i32 - 200).abs() <= 1);

        // Mask 0 takes the second input only
        let other = dev.create_render_target(w, h).unwrap();
        let mask = dev.create_texture(w, h, TextureFormat::R8).unwrap();
        dev.update_texture(mask, w, h, &vec![0u8; (w * h) as usize], w as usize).unwrap();
        let blended = dev.create_render_target(w, h).unwrap();
        let blend = dev.create_program(ProgramKind::Blend).unwrap();
        dev.draw_mesh(program, other, mesh, Sampled::Texture(tex), false).unwrap();
        dev.draw_fullscreen_quad(blend, blended, [Sampled::Target(target), Sampled::Target(other), Sampled::Texture(mask)]).unwrap();
        let (data, _) = read(&mut dev, blended, w, h);
        assert!((data[0] as i32 - 200).abs() <= 1 && (data[2] as i32 - 50).abs() <= 1);

        dev.destroy_mesh(mesh);
        dev.destroy_render_target(blended);
        dev.destroy_render_target(other);
        dev.destroy_render_target(target);
        dev.destroy_texture(mask);
        dev.destroy_texture(tex);
    }

    #[test]
    fn zero_sized_target() {
        if WgpuBackend::initialize_context().is_none() { return; }
        let mut dev = WgpuBackend.create_context().unwrap();
        let target = dev.create_render_target(0, 4).unwrap();
        assert_eq!(dev.check_render_target(target), TargetStatus::Incomplete);
        let buf = dev.create_readback_buffer(0, 4).unwrap();
        dev.queue_readback(target, buf).unwrap();
        dev.finish().unwrap();
        let mut called = false;
        dev.map_readback(buf, &mut |data, _| { called = data.is_empty(); }).unwrap();
        assert!(called);
    }
}
