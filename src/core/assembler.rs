// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2021-2022 Adrian <adrian.eddy at gmail>

use rayon::prelude::*;

use crate::frame::{ PanoramaImage, RGB_BYTES, rgba_to_rgb };
use crate::gpu::{ BufferId, GpuError, GraphicsDevice };
use crate::region::Quadrant;

/// Copies the blended quadrants out of the readback buffers into the panorama.
pub struct PanoramaAssembler;

impl PanoramaAssembler {
    /// Maps `buffer` and writes it into the `quadrant` of `pano`, dropping the alpha channel.
    /// On failure the quadrant is left untouched.
    pub fn store<D: GraphicsDevice>(device: &mut D, buffer: BufferId, quadrant: Quadrant, pano: &mut PanoramaImage) -> Result<(), GpuError> {
        device.map_readback(buffer, &mut |data, stride| {
            Self::copy_quadrant(pano, quadrant, data, stride);
        })
    }

    /// `data` holds RGBA rows of the quadrant size, `stride` bytes apart.
    pub fn copy_quadrant(pano: &mut PanoramaImage, quadrant: Quadrant, data: &[u8], stride: usize) {
        let rect = quadrant.bounds(pano.width(), pano.height());
        if rect.is_empty() { return; }

        let pano_stride = pano.stride();
        let (x0, x1) = (rect.x * RGB_BYTES, rect.right() * RGB_BYTES);
        let src_len = rect.width * 4;

        pano.data_mut()
            .par_chunks_mut(pano_stride)
            .skip(rect.y)
            .take(rect.height)
            .enumerate()
            .for_each(|(y, row)| {
                if let Some(src) = data.get(y * stride..y * stride + src_len) {
                    rgba_to_rgb(src, &mut row[x0..x1]);
                }
            });
    }
}
