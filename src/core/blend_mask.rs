// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2021-2022 Adrian <adrian.eddy at gmail>

use std::io::{ BufReader, ErrorKind, Read };
use std::path::Path;

use crate::region::{ Quadrant, SeamGeometry };

#[derive(thiserror::Error, Debug)]
pub enum MaskError {
    #[error("Failed to open mask file {0}: {1:?}")]
    Open(String, std::io::Error),
    #[error("Mask data truncated at plane {plane}, row {row}")]
    Truncated { plane: usize, row: usize },
    #[error("Invalid mask size {0}x{1}")]
    InvalidSize(usize, usize),
    #[error("IO error: {0:?}")]
    IOError(#[from] std::io::Error),
}

/// 8-bit weight of the back camera.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlendMask {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl BlendMask {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height, data: vec![0u8; width * height] }
    }

    pub fn row(&self, y: usize) -> Option<&[u8]> {
        if y >= self.height { return None; }
        self.data.get(y * self.width..(y + 1) * self.width)
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<u8> {
        if x >= self.width { return None; }
        self.row(y).map(|r| r[x])
    }

    /// Copy with the row order reversed.
    pub fn flipped_vertically(&self) -> Self {
        let data = if self.width == 0 { Vec::new() } else { self.data.chunks_exact(self.width).rev().flatten().copied().collect() };
        Self { width: self.width, height: self.height, data }
    }
}

/// One mask per quadrant. The lower masks are always the upper ones flipped.
#[derive(Clone, Debug, PartialEq)]
pub struct BlendMasks {
    masks: [BlendMask; 4],
}

impl BlendMasks {
    fn from_upper(top_left: BlendMask, top_right: BlendMask) -> Self {
        let bottom_left = top_left.flipped_vertically();
        let bottom_right = top_right.flipped_vertically();
        Self { masks: [top_left, top_right, bottom_left, bottom_right] }
    }

    pub fn load<P: AsRef<Path>>(path: P, width: usize, height: usize) -> Result<Self, MaskError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| MaskError::Open(path.display().to_string(), e))?;
        let ret = Self::read_from(BufReader::new(file), width, height)?;
        ::log::debug!("Loaded blend masks {} ({}x{}), crc: {:08x}", path.display(), width, height, ret.checksum());
        Ok(ret)
    }

    /// Reads two planes stored row-interleaved: row 0 of plane 0, row 0 of plane 1, row 1 of plane 0...
    pub fn read_from<R: Read>(mut reader: R, width: usize, height: usize) -> Result<Self, MaskError> {
        if width == 0 || height == 0 {
            return Err(MaskError::InvalidSize(width, height));
        }
        let mut planes = [BlendMask::new(width, height), BlendMask::new(width, height)];
        for row in 0..height {
            for (plane, mask) in planes.iter_mut().enumerate() {
                let dst = &mut mask.data[row * width..(row + 1) * width];
                reader.read_exact(dst).map_err(|e| match e.kind() {
                    ErrorKind::UnexpectedEof => MaskError::Truncated { plane, row },
                    _ => MaskError::IOError(e)
                })?;
            }
        }
        let [top_left, top_right] = planes;
        Ok(Self::from_upper(top_left, top_right))
    }

    /// Linear ramp across the seam band, for rigs without a mask file.
    pub fn generate_linear(seam: &SeamGeometry) -> Self {
        let (w, h) = (seam.region_width, seam.region_height);
        let band = seam.roi();

        // Back camera is on the outer side of each upper quadrant
        let back_weight = |x: usize| -> f64 {
            if x < band.x { return 1.0; }
            if x >= band.right() { return 0.0; }
            1.0 - (x as f64 + 0.5 - band.x as f64) / band.width as f64
        };

        let mut top_left = BlendMask::new(w, h);
        let mut top_right = BlendMask::new(w, h);
        if w > 0 {
            for (l, r) in top_left.data.chunks_exact_mut(w).zip(top_right.data.chunks_exact_mut(w)) {
                for x in 0..w {
                    let v = (back_weight(x) * 255.0).round() as u8;
                    l[x] = v;
                    r[w - 1 - x] = v;
                }
            }
        }
        Self::from_upper(top_left, top_right)
    }

    pub fn get(&self, quadrant: Quadrant) -> &BlendMask { &self.masks[quadrant.slot()] }

    pub fn size(&self) -> (usize, usize) { (self.masks[0].width, self.masks[0].height) }

    pub fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for m in &self.masks { hasher.update(&m.data); }
        hasher.finalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn artifact(width: usize, height: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(width * height * 2);
        for row in 0..height {
            data.extend((0..width).map(|x| ((row * 7 + x) % 256) as u8));
            data.extend((0..width).map(|x| (255 - (row * 3 + x) % 256) as u8));
        }
        data
    }

    #[test]
    fn load_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&artifact(720, 360)).unwrap();
        file.flush().unwrap();

        let masks = BlendMasks::load(file.path(), 720, 360).unwrap();
        assert_eq!(masks.size(), (720, 360));
        assert_eq!(masks.get(Quadrant::TopLeft).pixel(5, 2), Some(19));
        assert_eq!(masks.get(Quadrant::TopRight).pixel(5, 2), Some(244));
        for q in Quadrant::ALL {
            assert_eq!(masks.get(q).data.len(), 720 * 360);
        }
    }

    #[test]
    fn lower_masks_are_mirrored() {
        let masks = BlendMasks::read_from(&artifact(16, 9)[..], 16, 9).unwrap();
        for (upper, lower) in [(Quadrant::TopLeft, Quadrant::BottomLeft), (Quadrant::TopRight, Quadrant::BottomRight)] {
            let (u, l) = (masks.get(upper), masks.get(lower));
            for r in 0..9 {
                assert_eq!(l.row(r), u.row(8 - r));
            }
        }
    }

    #[test]
    fn truncated_file_fails() {
        let data = artifact(720, 360);
        let short = &data[..data.len() - 100];
        match BlendMasks::read_from(short, 720, 360) {
            Err(MaskError::Truncated { plane, row }) => { assert_eq!((plane, row), (1, 359)); },
            other => panic!("unexpected {:?}", other.map(|m| m.size())),
        }
        assert!(matches!(BlendMasks::read_from(&[0u8; 0][..], 720, 360), Err(MaskError::Truncated { plane: 0, row: 0 })));
    }

    #[test]
    fn missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(BlendMasks::load(dir.path().join("mask.bin"), 720, 360), Err(MaskError::Open(..))));
    }

    #[test]
    fn linear_masks() {
        let seam = SeamGeometry::compute(720, 360, 96.0, 10);
        let masks = BlendMasks::generate_linear(&seam);
        let tl = masks.get(Quadrant::TopLeft);
        let tr = masks.get(Quadrant::TopRight);
        assert_eq!((tl.width, tl.height), (360, 180));
        assert_eq!(tl.pixel(169, 0), Some(255));
        assert_eq!(tl.pixel(190, 0), Some(0));
        assert!(tl.pixel(175, 0) > tl.pixel(185, 0));
        assert_eq!(tr.pixel(169, 0), Some(0));
        assert_eq!(tr.pixel(190, 0), Some(255));
        assert_eq!(tr.pixel(359 - 175, 7), tl.pixel(175, 7));
        assert_eq!(masks.get(Quadrant::BottomRight).row(0), tr.row(179));
        assert_eq!(tl.pixel(360, 0), None);
        assert_eq!(tl.row(180), None);
    }

    #[test]
    fn checksum_changes() {
        let a = BlendMasks::read_from(&artifact(8, 4)[..], 8, 4).unwrap();
        let mut data = artifact(8, 4);
        data[3] ^= 1;
        let b = BlendMasks::read_from(&data[..], 8, 4).unwrap();
        assert_ne!(a.checksum(), b.checksum());
    }
}
