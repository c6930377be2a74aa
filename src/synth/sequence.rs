//! Multi-image sequences: one input image becomes exactly one output frame.

use std::path::PathBuf;

use image::imageops::{self, FilterType};

use crate::error::{ConvertError, ConvertResult};
use crate::synth::{image_dimensions, open_image, Frame};

/// Output size for a set of images: the requested size when both dimensions
/// are given, otherwise the smallest width and height among the inputs so no
/// frame is upscaled.
pub fn target_size(
    dimensions: &[(u32, u32)],
    width: Option<u32>,
    height: Option<u32>,
) -> ConvertResult<(u32, u32)> {
    if let (Some(w), Some(h)) = (width, height) {
        return Ok((w, h));
    }
    let w = dimensions.iter().map(|d| d.0).min();
    let h = dimensions.iter().map(|d| d.1).min();
    match (w, h) {
        (Some(w), Some(h)) => Ok((w, h)),
        _ => Err(ConvertError::validation("no images to size the sequence from")),
    }
}

pub fn probe_dimensions(paths: &[PathBuf]) -> ConvertResult<Vec<(u32, u32)>> {
    paths
        .iter()
        .map(|path| image_dimensions(path))
        .collect()
}

/// Center-crops `image` to the aspect ratio of `size`, then resizes to it.
pub fn fit(image: &image::RgbaImage, (width, height): (u32, u32)) -> Frame {
    let (w, h) = image.dimensions();
    let src_ratio = f64::from(w) / f64::from(h);
    let dst_ratio = f64::from(width) / f64::from(height);

    let cropped = if (src_ratio - dst_ratio).abs() <= 1e-6 {
        image.clone()
    } else if src_ratio > dst_ratio {
        let new_w = ((f64::from(h) * dst_ratio) as u32).clamp(1, w);
        imageops::crop_imm(image, (w - new_w) / 2, 0, new_w, h).to_image()
    } else {
        let new_h = ((f64::from(w) / dst_ratio) as u32).clamp(1, h);
        imageops::crop_imm(image, 0, (h - new_h) / 2, w, new_h).to_image()
    };

    imageops::resize(&cropped, width, height, FilterType::Lanczos3)
}

/// Decodes and fits each input lazily, in input order.
pub struct ImageSequence {
    paths: std::vec::IntoIter<PathBuf>,
    size: (u32, u32),
}

impl ImageSequence {
    pub fn new(paths: &[PathBuf], size: (u32, u32)) -> Self {
        Self {
            paths: paths.to_vec().into_iter(),
            size,
        }
    }
}

impl Iterator for ImageSequence {
    type Item = ConvertResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.paths.next()?;
        Some(open_image(&path).map(|image| fit(&image, self.size)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.paths.size_hint()
    }
}
