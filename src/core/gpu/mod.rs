// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2021-2022 Adrian <adrian.eddy at gmail>

use bytemuck::{ Pod, Zeroable };

pub mod cpu;
pub mod wgpu;

#[derive(thiserror::Error, Debug)]
pub enum GpuError {
    #[error("Failed to create rendering context: {0}")]
    ContextCreation(String),
    #[error("Invalid {0} handle {1}")]
    InvalidHandle(&'static str, u32),
    #[error("Render target {0} is incomplete")]
    IncompleteTarget(u32),
    #[error("Buffer size mismatch! {0} vs {1}")]
    SizeMismatch(usize, usize),
    #[error("Failed to map readback buffer {0}: {1}")]
    Map(u32, String),
    #[error("Device error: {0}")]
    Device(String),
}

macro_rules! handle {
    ($name:ident) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub u32);
    };
}
handle!(TextureId);
handle!(TargetId);
handle!(ProgramId);
handle!(MeshId);
handle!(BufferId);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextureFormat {
    /// Uploaded as packed 3-channel rows, stored with opaque alpha
    Rgb8,
    Rgba8,
    R8,
}
impl TextureFormat {
    pub fn upload_bytes_per_pixel(self) -> usize {
        match self { TextureFormat::Rgb8 => 3, TextureFormat::Rgba8 => 4, TextureFormat::R8 => 1 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgramKind {
    /// Textured mesh, color multiplied by the vertex confidence
    Warp,
    /// Full-screen `mix(a, b, 1 - mask)`
    Blend,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetStatus { Complete, Incomplete }

/// What a draw samples from: an uploaded texture or the result of an earlier pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sampled {
    Texture(TextureId),
    Target(TargetId),
}

// Must be kept in sync with warp.wgsl
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WarpVertex {
    /// Normalized device coordinates, y pointing down
    pub position: [f32; 2],
    pub confidence: f32,
    pub uv: [f32; 2],
}
unsafe impl Zeroable for WarpVertex {}
unsafe impl Pod for WarpVertex {}

/// Factory of rendering contexts.
pub trait GraphicsBackend {
    type Device: GraphicsDevice;

    fn name(&self) -> &'static str;
    fn create_context(&self) -> Result<Self::Device, GpuError>;
}

/// The rendering capability the stitcher drives. Dropping the device destroys the context.
///
/// Draws replace the previous content of the target. Readbacks are queued and only complete
/// after [`GraphicsDevice::finish`].
pub trait GraphicsDevice {
    fn name(&self) -> String;

    fn create_texture(&mut self, width: u32, height: u32, format: TextureFormat) -> Result<TextureId, GpuError>;
    /// `data` holds `height` rows of `width` pixels in the texture's upload format, `stride` bytes apart.
    /// The texture is reallocated when the size differs.
    fn update_texture(&mut self, id: TextureId, width: u32, height: u32, data: &[u8], stride: usize) -> Result<(), GpuError>;
    fn destroy_texture(&mut self, id: TextureId);

    fn create_render_target(&mut self, width: u32, height: u32) -> Result<TargetId, GpuError>;
    fn check_render_target(&self, id: TargetId) -> TargetStatus;
    fn destroy_render_target(&mut self, id: TargetId);

    fn create_program(&mut self, kind: ProgramKind) -> Result<ProgramId, GpuError>;
    fn destroy_program(&mut self, id: ProgramId);

    fn create_mesh(&mut self, vertices: &[WarpVertex], indices: &[u32]) -> Result<MeshId, GpuError>;
    fn destroy_mesh(&mut self, id: MeshId);

    fn draw_mesh(&mut self, program: ProgramId, target: TargetId, mesh: MeshId, source: Sampled, swap_channels: bool) -> Result<(), GpuError>;
    /// Inputs are `[a, b, mask]`.
    fn draw_fullscreen_quad(&mut self, program: ProgramId, target: TargetId, inputs: [Sampled; 3]) -> Result<(), GpuError>;

    fn create_readback_buffer(&mut self, width: u32, height: u32) -> Result<BufferId, GpuError>;
    fn destroy_readback_buffer(&mut self, id: BufferId);
    fn queue_readback(&mut self, target: TargetId, buffer: BufferId) -> Result<(), GpuError>;
    /// Blocks until every submitted command has completed.
    fn finish(&mut self) -> Result<(), GpuError>;
    /// Maps the buffer, calls `f` with the RGBA rows and their stride in bytes, then unmaps it.
    fn map_readback(&mut self, buffer: BufferId, f: &mut dyn FnMut(&[u8], usize)) -> Result<(), GpuError>;
}

/// Handle table of a device.
pub struct Slots<T> {
    items: Vec<Option<T>>,
}
impl<T> Default for Slots<T> {
    fn default() -> Self { Self { items: Vec::new() } }
}
impl<T> Slots<T> {
    pub fn insert(&mut self, item: T) -> u32 {
        if let Some(i) = self.items.iter().position(Option::is_none) {
            self.items[i] = Some(item);
            return i as u32;
        }
        self.items.push(Some(item));
        (self.items.len() - 1) as u32
    }
    pub fn get(&self, id: u32) -> Option<&T> { self.items.get(id as usize).and_then(Option::as_ref) }
    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> { self.items.get_mut(id as usize).and_then(Option::as_mut) }
    pub fn remove(&mut self, id: u32) -> Option<T> { self.items.get_mut(id as usize).and_then(Option::take) }
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> { self.items.iter_mut().flatten() }
    pub fn live(&self) -> usize { self.items.iter().filter(|x| x.is_some()).count() }
}

/// Probes the GPU adapter. Returns its name, or `None` when only the software device is usable.
pub fn initialize_contexts() -> Option<String> {
    let wgpu = std::panic::catch_unwind(|| {
        wgpu::WgpuBackend::initialize_context()
    });
    match wgpu {
        Ok(Some(name)) => { return Some(name); },
        Ok(None) => { log::error!("wgpu init error"); },
        Err(e) => {
            if let Some(s) = e.downcast_ref::<&str>() {
                log::error!("Failed to initialize wgpu {}", s);
            } else if let Some(s) = e.downcast_ref::<String>() {
                log::error!("Failed to initialize wgpu {}", s);
            } else {
                log::error!("Failed to initialize wgpu {:?}", e);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_reuse_freed_ids() {
        let mut s = Slots::default();
        let a = s.insert("a");
        let b = s.insert("b");
        assert_eq!((a, b), (0, 1));
        assert_eq!(s.remove(a), Some("a"));
        assert!(s.get(a).is_none());
        assert_eq!(s.insert("c"), 0);
        assert_eq!(s.live(), 2);
        assert!(s.remove(7).is_none());
    }

    #[test]
    fn vertex_layout() {
        assert_eq!(std::mem::size_of::<WarpVertex>(), 20);
        let v = [WarpVertex { position: [1.0, 2.0], confidence: 0.5, uv: [0.25, 0.75] }];
        let f: &[f32] = bytemuck::cast_slice(&v);
        assert_eq!(f, &[1.0, 2.0, 0.5, 0.25, 0.75]);
    }
}
