// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2021-2022 Adrian <adrian.eddy at gmail>

pub const RGB_BYTES: usize = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PixelRect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}
impl PixelRect {
    pub const fn new(x: usize, y: usize, width: usize, height: usize) -> Self { Self { x, y, width, height } }
    pub fn is_empty(&self) -> bool { self.width == 0 || self.height == 0 }
    pub fn right(&self) -> usize { self.x + self.width }
    pub fn bottom(&self) -> usize { self.y + self.height }
}

/// Borrowed 3-channel packed image with an explicit stride. The ROI is the part of the buffer
/// that holds the fisheye picture; all coordinates passed to the frame are relative to it.
#[derive(Clone, Copy, Debug)]
pub struct ImageFrame<'a> {
    data: &'a [u8],
    width: usize,
    height: usize,
    stride: usize,
    roi: PixelRect,
}

impl<'a> ImageFrame<'a> {
    pub fn new(data: &'a [u8], width: usize, height: usize, stride: usize) -> Option<Self> {
        if stride < width * RGB_BYTES || data.len() < Self::min_len(height, stride, width) {
            log::error!("Buffer size mismatch! {} vs {}", Self::min_len(height, stride, width), data.len());
            return None;
        }
        Some(Self { data, width, height, stride, roi: PixelRect::new(0, 0, width, height) })
    }

    fn min_len(height: usize, stride: usize, width: usize) -> usize {
        if height == 0 { 0 } else { (height - 1) * stride + width * RGB_BYTES }
    }

    pub fn with_roi(mut self, roi: PixelRect) -> Option<Self> {
        if roi.right() > self.width || roi.bottom() > self.height { return None; }
        self.roi = roi;
        Some(self)
    }

    pub fn width(&self) -> usize { self.roi.width }
    pub fn height(&self) -> usize { self.roi.height }
    pub fn stride(&self) -> usize { self.stride }
    pub fn buffer_size(&self) -> (usize, usize) { (self.width, self.height) }

    /// Bytes starting at the top-left pixel of `rect` (ROI relative), rows `stride` apart.
    pub fn rect_data(&self, rect: &PixelRect) -> Option<&'a [u8]> {
        if rect.right() > self.roi.width || rect.bottom() > self.roi.height { return None; }
        if rect.is_empty() { return Some(&[]); }
        let start = (self.roi.y + rect.y) * self.stride + (self.roi.x + rect.x) * RGB_BYTES;
        let end = start + Self::min_len(rect.height, self.stride, rect.width);
        self.data.get(start..end)
    }

    pub fn row(&self, y: usize) -> Option<&'a [u8]> {
        if y >= self.roi.height { return None; }
        let start = (self.roi.y + y) * self.stride + self.roi.x * RGB_BYTES;
        self.data.get(start..start + self.roi.width * RGB_BYTES)
    }
}

/// Destination equirectangular image, 3-channel packed.
#[derive(Clone, Debug, Default)]
pub struct PanoramaImage {
    data: Vec<u8>,
    width: usize,
    height: usize,
    stride: usize,
}

impl PanoramaImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self::with_stride(width, height, width * RGB_BYTES)
    }
    pub fn with_stride(width: usize, height: usize, stride: usize) -> Self {
        let stride = stride.max(width * RGB_BYTES);
        Self { data: vec![0u8; stride * height], width, height, stride }
    }

    pub fn width(&self) -> usize { self.width }
    pub fn height(&self) -> usize { self.height }
    pub fn stride(&self) -> usize { self.stride }
    pub fn data(&self) -> &[u8] { &self.data }
    pub fn data_mut(&mut self) -> &mut [u8] { &mut self.data }
    pub fn into_inner(self) -> Vec<u8> { self.data }

    pub fn pixel(&self, x: usize, y: usize) -> [u8; 3] {
        let o = y * self.stride + x * RGB_BYTES;
        [self.data[o], self.data[o + 1], self.data[o + 2]]
    }
}

/// Drops the alpha channel.
pub fn rgba_to_rgb(src: &[u8], dst: &mut [u8]) {
    src.chunks_exact(4)
        .zip(dst.chunks_exact_mut(3))
        .for_each(|(s, d)| d.copy_from_slice(&s[..3]));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_drop() {
        let src = [1, 2, 3, 255, 4, 5, 6, 0];
        let mut dst = [0u8; 6];
        rgba_to_rgb(&src, &mut dst);
        assert_eq!(dst, [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn frame_roi_addressing() {
        // 4x3 image, stride padded to 16 bytes
        let mut buf = vec![0u8; 16 * 3];
        for y in 0..3 { for x in 0..4 { buf[y * 16 + x * 3] = (y * 10 + x) as u8; } }
        let frame = ImageFrame::new(&buf, 4, 3, 16).unwrap().with_roi(PixelRect::new(1, 1, 3, 2)).unwrap();
        assert_eq!((frame.width(), frame.height()), (3, 2));
        assert_eq!(frame.row(0).unwrap()[0], 11);
        assert_eq!(frame.row(1).unwrap(), &buf[2 * 16 + 3..2 * 16 + 12]);
        assert!(frame.row(2).is_none());
        let rect = frame.rect_data(&PixelRect::new(1, 1, 2, 1)).unwrap();
        assert_eq!(rect[0], 22);
        assert_eq!(rect.len(), 6);
        assert!(frame.rect_data(&PixelRect::new(2, 0, 2, 1)).is_none());
    }

    #[test]
    fn frame_rejects_short_buffer() {
        assert!(ImageFrame::new(&[0u8; 10], 2, 2, 6).is_none());
        assert!(ImageFrame::new(&[0u8; 12], 2, 2, 5).is_none());
    }
}
