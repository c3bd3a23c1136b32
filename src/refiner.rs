//! Refinement against the original image.
//!
//! The segmentation mask is only trusted to say where the subject probably
//! is. For each tile the original image decides the final look: a tile the
//! mask considers see-through that is also white in the original is
//! dropped, every other tile becomes fully opaque with the original's own
//! average color. Alpha in the result is always 0 or 255.

use image::imageops::FilterType;
use image::{Rgb, RgbImage, Rgba};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;
use crate::buffer::{self, BlockSize, PixelBuffer, TRANSPARENT};

/// Mask alpha at or below which a tile is a candidate for removal
pub const MASK_SEE_THROUGH_LEVEL: u8 = 240;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefineSettings {
    /// Run the refinement pass after pixelating a segmentation (default: true)
    pub enabled: bool,
    /// Average RGB at or above which a see-through tile is background (default: 200)
    pub white_threshold: u8,
}

impl Default for RefineSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            white_threshold: 200,
        }
    }
}

/// Original pixels as opaque RGB, resampled to the mask size when they differ
fn align_original(original: &PixelBuffer, width: u32, height: u32) -> RgbImage {
    let rgb = RgbImage::from_fn(original.width(), original.height(), |x, y| {
        let p = original.get_pixel(x, y);
        Rgb([p[0], p[1], p[2]])
    });

    if rgb.dimensions() == (width, height) {
        return rgb;
    }
    image::imageops::resize(&rgb, width, height, FilterType::Lanczos3)
}

fn is_uniform(mask: &PixelBuffer, x1: u32, y1: u32, x2: u32, y2: u32) -> bool {
    let anchor = mask.get_pixel(x1, y1);
    (y1..y2).all(|y| (x1..x2).all(|x| mask.get_pixel(x, y) == anchor))
}

fn mean_rgb(img: &RgbImage, x1: u32, y1: u32, x2: u32, y2: u32) -> (f64, f64, f64) {
    let mut sum = (0.0f64, 0.0f64, 0.0f64);
    for y in y1..y2 {
        for x in x1..x2 {
            let p = img.get_pixel(x, y);
            sum.0 += p[0] as f64;
            sum.1 += p[1] as f64;
            sum.2 += p[2] as f64;
        }
    }
    let n = ((x2 - x1) * (y2 - y1)) as f64;
    (sum.0 / n, sum.1 / n, sum.2 / n)
}

/// Refine and also return how many mask tiles were not uniform
pub(crate) fn refine_counting(
    mask: &PixelBuffer,
    original: &PixelBuffer,
    block: BlockSize,
    white_threshold: u8,
) -> (PixelBuffer, usize) {
    let (width, height) = mask.dimensions();
    let mut output = PixelBuffer::new(width, height);
    if width == 0 || height == 0 {
        return (output, 0);
    }

    let original = align_original(original, width, height);
    let grid = block.grid_for(width, height);
    let band_len = width as usize * block.h as usize * 4;

    let raw: &mut [u8] = &mut output;
    let non_uniform = raw
        .par_chunks_mut(band_len)
        .enumerate()
        .map(|(gy, band)| {
            let mut non_uniform = 0usize;
            for gx in 0..grid.grid_w {
                let (x1, y1, x2, y2) = grid.cell_bounds(gx, gy as u32, width, height);
                if !is_uniform(mask, x1, y1, x2, y2) {
                    non_uniform += 1;
                }

                let mask_alpha = mask.get_pixel(x1, y1)[3];
                let (r, g, b) = mean_rgb(&original, x1, y1, x2, y2);
                let avg_rgb = (r + g + b) / 3.0;

                let color = if mask_alpha <= MASK_SEE_THROUGH_LEVEL && avg_rgb >= white_threshold as f64 {
                    TRANSPARENT
                } else {
                    Rgba([r as u8, g as u8, b as u8, 255])
                };
                buffer::fill_band_columns(band, width, x1, x2, color);
            }
            non_uniform
        })
        .sum::<usize>();

    (output, non_uniform)
}

/// Rebuild a pixelated segmentation from the original image's colors.
///
/// The output has `mask`'s dimensions; `original` is resampled with
/// Lanczos3 when its size differs. Each mask tile is read from its top-left
/// pixel, so `mask` should come out of [`crate::pixelator::pixelate`] with
/// the same `block`.
pub fn refine(mask: &PixelBuffer, original: &PixelBuffer, block: BlockSize, white_threshold: u8) -> PixelBuffer {
    let (output, non_uniform) = refine_counting(mask, original, block, white_threshold);
    if non_uniform > 0 {
        warn!(
            non_uniform,
            block = %block,
            "mask tiles are not uniform, refinement sampled their top-left pixel"
        );
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(w: u32, h: u32) -> BlockSize {
        BlockSize::new(w, h).unwrap()
    }

    #[test]
    fn test_see_through_white_tile_is_dropped() {
        let mask = PixelBuffer::from_pixel(4, 4, Rgba([120, 10, 10, 10]));
        let original = PixelBuffer::from_pixel(4, 4, Rgba([250, 250, 248, 255]));
        let out = refine(&mask, &original, block(4, 4), 200);
        assert!(out.pixels().all(|p| *p == TRANSPARENT));
    }

    #[test]
    fn test_opaque_mask_keeps_original_color_even_if_white() {
        let mask = PixelBuffer::from_pixel(4, 4, Rgba([1, 2, 3, 255]));
        let original = PixelBuffer::from_pixel(4, 4, Rgba([250, 250, 248, 255]));
        let out = refine(&mask, &original, block(4, 4), 200);
        assert!(out.pixels().all(|p| *p == Rgba([250, 250, 248, 255])));
    }

    #[test]
    fn test_see_through_dark_tile_becomes_opaque() {
        let mask = PixelBuffer::from_pixel(2, 2, Rgba([0, 0, 0, 0]));
        let original = PixelBuffer::from_pixel(2, 2, Rgba([20, 40, 60, 255]));
        let out = refine(&mask, &original, block(2, 2), 200);
        assert_eq!(out.get_pixel(1, 1), &Rgba([20, 40, 60, 255]));
    }

    #[test]
    fn test_original_alpha_is_ignored() {
        let mask = PixelBuffer::from_pixel(2, 2, Rgba([0, 0, 0, 255]));
        let original = PixelBuffer::from_pixel(2, 2, Rgba([90, 80, 70, 0]));
        let out = refine(&mask, &original, block(2, 2), 200);
        assert_eq!(out.get_pixel(0, 0), &Rgba([90, 80, 70, 255]));
    }

    #[test]
    fn test_boundary_240_is_see_through() {
        let mask = PixelBuffer::from_pixel(2, 2, Rgba([0, 0, 0, 240]));
        let original = PixelBuffer::from_pixel(2, 2, Rgba([255, 255, 255, 255]));
        let out = refine(&mask, &original, block(2, 2), 255);
        assert_eq!(out.get_pixel(0, 0), &TRANSPARENT);

        let mask = PixelBuffer::from_pixel(2, 2, Rgba([0, 0, 0, 241]));
        let out = refine(&mask, &original, block(2, 2), 255);
        assert_eq!(out.get_pixel(0, 0), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn test_alpha_is_binary_and_tiles_uniform() {
        let mask = PixelBuffer::from_fn(12, 9, |x, y| {
            let a = ((x / 3) * 60 + (y / 3) * 35) as u8;
            Rgba([0, 0, 0, a])
        });
        let original = PixelBuffer::from_fn(12, 9, |x, y| {
            let v = (x * 21 + y * 7) as u8;
            Rgba([v, 255 - v, v / 2 + 120, 255])
        });
        let out = refine(&mask, &original, block(3, 3), 150);
        assert!(out.pixels().all(|p| p[3] == 0 || p[3] == 255));
        for y in 0..9 {
            for x in 0..12 {
                assert_eq!(out.get_pixel(x, y), out.get_pixel((x / 3) * 3, (y / 3) * 3));
            }
        }
    }

    #[test]
    fn test_refinement_is_deterministic() {
        let mask = PixelBuffer::from_fn(16, 16, |x, y| Rgba([0, 0, 0, ((x / 4 + y / 4) * 50) as u8]));
        let original = PixelBuffer::from_fn(16, 16, |x, y| Rgba([(x * 16) as u8, (y * 16) as u8, 200, 255]));
        let first = refine(&mask, &original, block(4, 4), 180);
        let second = refine(&mask, &original, block(4, 4), 180);
        assert_eq!(first.as_raw(), second.as_raw());
    }

    #[test]
    fn test_original_is_resampled_to_mask_size() {
        let mask = PixelBuffer::from_pixel(8, 8, Rgba([0, 0, 0, 255]));
        let original = PixelBuffer::from_pixel(5, 7, Rgba([10, 200, 30, 255]));
        let out = refine(&mask, &original, block(4, 4), 200);
        assert_eq!(out.dimensions(), (8, 8));
        let p = out.get_pixel(4, 4);
        assert_eq!(p[3], 255);
        assert!((p[1] as i16 - 200).abs() <= 2, "green drifted to {}", p[1]);
    }

    #[test]
    fn test_partial_tiles_are_clipped_to_mask() {
        let mask = PixelBuffer::from_pixel(5, 5, Rgba([0, 0, 0, 255]));
        let original = PixelBuffer::from_fn(5, 5, |x, _| {
            if x == 4 { Rgba([100, 100, 100, 255]) } else { Rgba([0, 0, 0, 255]) }
        });
        let out = refine(&mask, &original, block(4, 4), 200);
        assert_eq!(out.dimensions(), (5, 5));
        assert_eq!(out.get_pixel(4, 0), &Rgba([100, 100, 100, 255]));
        assert_eq!(out.get_pixel(0, 0), &Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn test_non_uniform_mask_is_counted() {
        let mut mask = PixelBuffer::from_pixel(4, 4, Rgba([0, 0, 0, 255]));
        mask.put_pixel(3, 3, Rgba([0, 0, 0, 0]));
        let original = PixelBuffer::from_pixel(4, 4, Rgba([0, 0, 0, 255]));
        let (_, non_uniform) = refine_counting(&mask, &original, block(2, 2), 200);
        assert_eq!(non_uniform, 1);
    }
}
