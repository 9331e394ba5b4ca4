// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2021-2022 Adrian <adrian.eddy at gmail>

use crate::camera::CameraModel;
use crate::frame::PixelRect;
use crate::gpu::WarpVertex;

pub const DEFAULT_GRID_PITCH: usize = 40;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WarpCell {
    /// Destination in normalized device coordinates of the region, y pointing down
    pub dst_x: f32,
    pub dst_y: f32,
    pub confidence: f32,
    /// Source pixel coordinate, always inside the source image
    pub src_x: f32,
    pub src_y: f32,
}

/// Sparse destination -> source mapping of one region.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WarpTable {
    pub table_w: usize,
    pub table_h: usize,
    pub cells: Vec<WarpCell>,
}

impl WarpTable {
    pub fn cell(&self, col: usize, row: usize) -> &WarpCell {
        &self.cells[row * self.table_w + col]
    }

    pub fn num_triangles(&self) -> usize {
        self.table_w.saturating_sub(1) * self.table_h.saturating_sub(1) * 2
    }

    /// Builds the triangle mesh: two triangles per grid cell, texture coordinates normalized to `roi` (source pixels).
    pub fn to_mesh(&self, roi: &PixelRect, confidence_blending: bool) -> (Vec<WarpVertex>, Vec<u32>) {
        let rw = roi.width.max(1) as f32;
        let rh = roi.height.max(1) as f32;
        let vertices = self.cells.iter().map(|c| WarpVertex {
            position: [c.dst_x, c.dst_y],
            confidence: if confidence_blending { c.confidence } else { 1.0 },
            uv: [(c.src_x - roi.x as f32) / rw, (c.src_y - roi.y as f32) / rh],
        }).collect();

        let w = self.table_w as u32;
        let mut indices = Vec::with_capacity(self.num_triangles() * 3);
        for row in 0..self.table_h.saturating_sub(1) as u32 {
            for col in 0..self.table_w.saturating_sub(1) as u32 {
                let i = row * w + col;
                indices.extend_from_slice(&[i, i + w, i + 1, i + 1, i + w, i + w + 1]);
            }
        }
        (vertices, indices)
    }
}

pub struct WarpTableGenerator {
    pub pitch: usize,
    /// Confidence falls off linearly over this many radians inside the FOV limit
    pub feather: f64,
}

impl Default for WarpTableGenerator {
    fn default() -> Self { Self { pitch: DEFAULT_GRID_PITCH, feather: 0.0 } }
}

fn grid_positions(len: usize, pitch: usize) -> Vec<usize> {
    let pitch = pitch.max(1);
    (0..=len.div_ceil(pitch)).map(|i| (i * pitch).min(len)).collect()
}

fn to_ndc(p: usize, len: usize) -> f32 {
    if len == 0 { return -1.0; }
    (p as f64 / len as f64 * 2.0 - 1.0) as f32
}

impl WarpTableGenerator {
    pub fn new(pitch: usize) -> Self {
        Self { pitch: pitch.max(1), ..Default::default() }
    }

    pub fn with_feather(mut self, degrees: f64) -> Self {
        self.feather = degrees.max(0.0).to_radians();
        self
    }

    fn confidence(&self, theta: f64, limit: f64) -> f32 {
        if !(theta <= limit + 1e-9) { return 0.0; }
        if self.feather > 0.0 {
            ((limit - theta) / self.feather).max(0.0).min(1.0) as f32
        } else {
            1.0
        }
    }

    /// Maps the grid vertices of `bounds` (panorama pixels) through `camera`.
    pub fn generate(&self, camera: &CameraModel, pano_size: (usize, usize), bounds: PixelRect) -> WarpTable {
        let xs = grid_positions(bounds.width, self.pitch);
        let ys = grid_positions(bounds.height, self.pitch);

        let mut cells = Vec::with_capacity(xs.len() * ys.len());
        for &y in &ys {
            for &x in &xs {
                let ray = CameraModel::sphere_direction((bounds.x + x) as f64, (bounds.y + y) as f64, pano_size.0, pano_size.1);
                let proj = camera.project(&ray);

                let mut confidence = self.confidence(proj.theta, camera.max_fov());
                if !camera.is_on_sensor(proj.x, proj.y) {
                    confidence = 0.0;
                }
                let (src_x, src_y) = camera.clamp_to_sensor(proj.x, proj.y);

                cells.push(WarpCell {
                    dst_x: to_ndc(x, bounds.width),
                    dst_y: to_ndc(y, bounds.height),
                    confidence,
                    src_x: src_x as f32,
                    src_y: src_y as f32,
                });
            }
        }

        WarpTable { table_w: xs.len(), table_h: ys.len(), cells }
    }
}
