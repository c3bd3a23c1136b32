//! Grid Pixelation
//!
//! Collapses every `block.w` x `block.h` tile of an RGBA image into a single
//! color and a single alpha:
//! 1. RGB is averaged with each pixel weighted by its own alpha, so
//!    transparent padding never tints a visible edge
//! 2. Near-white tiles with low mean alpha are background fringe and drop out
//! 3. Mostly opaque tiles snap to alpha 255, the rest keep their mean alpha
//!
//! The output is rounded up to whole blocks. Grid rows are independent and
//! are processed in parallel.

use image::Rgba;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use crate::buffer::{self, BlockSize, GridGeometry, PixelBuffer, TRANSPARENT};
use crate::error::Result;

/// Average RGB above which a tile counts as near-white
pub const NEAR_WHITE_LEVEL: f64 = 200.0;

/// Mean alpha above which a tile snaps to fully opaque
pub const OPAQUE_SNAP_LEVEL: f64 = 200.0;

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PixelateSettings {
    /// Tile size of the grid (default: 8x8)
    pub block: BlockSize,
    /// Near-white tiles with mean alpha below this become transparent (default: 128)
    pub alpha_threshold: u8,
    /// Crop the block-padded output back to the input size (default: false)
    pub clip_to_original: bool,
}

impl Default for PixelateSettings {
    fn default() -> Self {
        Self {
            block: BlockSize::default(),
            alpha_threshold: 128,
            clip_to_original: false,
        }
    }
}

impl PixelateSettings {
    pub fn validate(&self) -> Result<()> {
        self.block.validate()
    }
}

// ============================================================================
// BLOCK AGGREGATE
// ============================================================================

/// Per-tile statistics, alive only while one tile is being averaged
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct BlockAggregate {
    alpha_sum: f64,
    weighted_rgb: (f64, f64, f64),
    mean_alpha: f64,
}

impl BlockAggregate {
    fn collect(img: &PixelBuffer, x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        let mut alpha_sum = 0.0f64;
        let mut r_sum = 0.0f64;
        let mut g_sum = 0.0f64;
        let mut b_sum = 0.0f64;
        let mut pixel_count = 0u32;

        for y in y1..y2 {
            for x in x1..x2 {
                let pixel = img.get_pixel(x, y);
                let a = pixel[3] as f64;
                alpha_sum += a;
                r_sum += pixel[0] as f64 * a;
                g_sum += pixel[1] as f64 * a;
                b_sum += pixel[2] as f64 * a;
                pixel_count += 1;
            }
        }

        if alpha_sum == 0.0 || pixel_count == 0 {
            return Self::default();
        }

        Self {
            alpha_sum,
            weighted_rgb: (r_sum / alpha_sum, g_sum / alpha_sum, b_sum / alpha_sum),
            mean_alpha: alpha_sum / pixel_count as f64,
        }
    }

    fn avg_rgb(&self) -> f64 {
        (self.weighted_rgb.0 + self.weighted_rgb.1 + self.weighted_rgb.2) / 3.0
    }

    /// Output color of the tile
    fn resolve(&self, alpha_threshold: u8) -> Rgba<u8> {
        let is_near_white = self.avg_rgb() > NEAR_WHITE_LEVEL;
        if self.alpha_sum == 0.0 || (is_near_white && self.mean_alpha < alpha_threshold as f64) {
            return TRANSPARENT;
        }

        let (r, g, b) = self.weighted_rgb;
        let (r, g, b) = (r as u8, g as u8, b as u8);

        if self.mean_alpha > OPAQUE_SNAP_LEVEL {
            return Rgba([r, g, b, 255]);
        }

        // A tile that rounds to zero alpha is background, keep it canonical
        match self.mean_alpha.round() as u8 {
            0 => TRANSPARENT,
            a => Rgba([r, g, b, a]),
        }
    }
}

// ============================================================================
// PIXELATION
// ============================================================================

/// Color assigned to grid cell `(gx, gy)` of `input`
fn cell_color(input: &PixelBuffer, grid: &GridGeometry, gx: u32, gy: u32, alpha_threshold: u8) -> Rgba<u8> {
    let (width, height) = input.dimensions();
    let (x1, y1, x2, y2) = grid.cell_bounds(gx, gy, width, height);
    BlockAggregate::collect(input, x1, y1, x2, y2).resolve(alpha_threshold)
}

/// Pixelate `input` into uniform `block` tiles.
///
/// The result measures `grid_w * block.w` by `grid_h * block.h` and may be
/// larger than the input. `block` must have non-zero dimensions.
pub fn pixelate(input: &PixelBuffer, block: BlockSize, alpha_threshold: u8) -> PixelBuffer {
    let (width, height) = input.dimensions();
    let grid = block.grid_for(width, height);
    let (out_w, out_h) = grid.padded_dimensions();

    let mut output = PixelBuffer::new(out_w, out_h);
    let band_len = out_w as usize * block.h as usize * 4;
    if band_len == 0 {
        return output;
    }

    let raw: &mut [u8] = &mut output;
    raw.par_chunks_mut(band_len)
        .enumerate()
        .for_each(|(gy, band)| {
            for gx in 0..grid.grid_w {
                let color = cell_color(input, &grid, gx, gy as u32, alpha_threshold);
                let x1 = gx * block.w;
                buffer::fill_band_columns(band, out_w, x1, x1 + block.w, color);
            }
        });

    output
}

/// Pixelate using a settings bundle, applying the optional clip post-step
pub fn pixelate_with(input: &PixelBuffer, settings: &PixelateSettings) -> Result<PixelBuffer> {
    settings.validate()?;
    let output = pixelate(input, settings.block, settings.alpha_threshold);

    if settings.clip_to_original {
        let (width, height) = input.dimensions();
        return Ok(buffer::clip_to(&output, width, height));
    }
    Ok(output)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn block(w: u32, h: u32) -> BlockSize {
        BlockSize::new(w, h).unwrap()
    }

    /// Deterministic noisy image with a mix of opaque, partial and clear pixels
    fn noisy_image(width: u32, height: u32) -> PixelBuffer {
        PixelBuffer::from_fn(width, height, |x, y| {
            let h = x.wrapping_mul(73_856_093) ^ y.wrapping_mul(19_349_663);
            let alpha = match h % 5 {
                0 => 0,
                1 => 255,
                2 => (h >> 8) as u8,
                _ => 200 + (h % 56) as u8,
            };
            Rgba([(h >> 3) as u8, (h >> 11) as u8, (h >> 17) as u8, alpha])
        })
    }

    fn assert_blocks_uniform(img: &PixelBuffer, block: BlockSize) {
        let (width, height) = img.dimensions();
        for y in 0..height {
            for x in 0..width {
                let anchor = img.get_pixel((x / block.w) * block.w, (y / block.h) * block.h);
                assert_eq!(img.get_pixel(x, y), anchor, "pixel ({}, {}) differs from its tile", x, y);
            }
        }
    }

    #[test]
    fn test_solid_red_stays_opaque_red() {
        let img = PixelBuffer::from_pixel(4, 4, Rgba([255, 0, 0, 255]));
        let out = pixelate(&img, block(4, 4), 128);
        assert_eq!(out.dimensions(), (4, 4));
        assert!(out.pixels().all(|p| *p == Rgba([255, 0, 0, 255])));
    }

    #[test]
    fn test_faint_white_block_becomes_transparent() {
        let img = PixelBuffer::from_pixel(2, 2, Rgba([255, 255, 255, 50]));
        let out = pixelate(&img, block(2, 2), 128);
        assert!(out.pixels().all(|p| *p == TRANSPARENT));
    }

    #[test]
    fn test_fully_transparent_block_ignores_rgb() {
        let img = PixelBuffer::from_fn(4, 4, |x, y| Rgba([x as u8 * 60, y as u8 * 60, 77, 0]));
        let out = pixelate(&img, block(4, 4), 0);
        assert!(out.pixels().all(|p| *p == TRANSPARENT));
    }

    #[test]
    fn test_mostly_opaque_dark_block_snaps_to_255() {
        let img = PixelBuffer::from_fn(4, 4, |x, _| Rgba([40, 90, 10, if x == 0 { 180 } else { 230 }]));
        let out = pixelate(&img, block(4, 4), 128);
        assert_eq!(out.get_pixel(0, 0), &Rgba([40, 90, 10, 255]));
    }

    #[test]
    fn test_partial_alpha_is_rounded_mean() {
        // mean alpha = (100 + 101) / 2 = 100.5
        let img = PixelBuffer::from_fn(2, 1, |x, _| Rgba([10, 20, 30, 100 + x as u8]));
        let out = pixelate(&img, block(2, 1), 128);
        assert_eq!(out.get_pixel(0, 0), &Rgba([10, 20, 30, 101]));
    }

    #[test]
    fn test_faint_white_block_survives_when_threshold_allows() {
        let img = PixelBuffer::from_pixel(2, 2, Rgba([250, 250, 250, 100]));
        let out = pixelate(&img, block(2, 2), 50);
        assert_eq!(out.get_pixel(1, 1), &Rgba([250, 250, 250, 100]));
    }

    #[test]
    fn test_transparent_pixels_do_not_tint_color() {
        let mut img = PixelBuffer::from_pixel(2, 2, Rgba([255, 255, 255, 0]));
        img.put_pixel(0, 0, Rgba([0, 0, 200, 255]));
        let out = pixelate(&img, block(2, 2), 128);
        // Color comes only from the visible pixel; mean alpha is 63.75
        assert_eq!(out.get_pixel(1, 1), &Rgba([0, 0, 200, 64]));
    }

    #[test]
    fn test_output_is_padded_to_whole_blocks() {
        let img = PixelBuffer::from_pixel(10, 7, Rgba([30, 60, 90, 255]));
        let out = pixelate(&img, block(4, 4), 128);
        assert_eq!(out.dimensions(), (12, 8));
        // The partial tile is still painted across the padding
        assert_eq!(out.get_pixel(11, 7), &Rgba([30, 60, 90, 255]));
    }

    #[test]
    fn test_clip_to_original() {
        let img = PixelBuffer::from_pixel(10, 7, Rgba([30, 60, 90, 255]));
        let settings = PixelateSettings {
            block: block(4, 4),
            clip_to_original: true,
            ..Default::default()
        };
        let out = pixelate_with(&img, &settings).unwrap();
        assert_eq!(out.dimensions(), (10, 7));
    }

    #[test]
    fn test_tiles_are_uniform_and_colors_bounded() {
        let img = noisy_image(37, 23);
        let b = block(5, 4);
        let out = pixelate(&img, b, 128);
        assert_blocks_uniform(&out, b);

        let grid = b.grid_for(37, 23);
        let distinct: HashSet<_> = out.pixels().collect();
        assert!(distinct.len() as u64 <= grid.block_count());
    }

    #[test]
    fn test_pixelation_is_idempotent() {
        let img = noisy_image(41, 29);
        for (b, threshold) in [(block(4, 4), 128), (block(3, 5), 200), (block(7, 2), 0)] {
            let once = pixelate(&img, b, threshold);
            let twice = pixelate(&once, b, threshold);
            assert_eq!(once.as_raw(), twice.as_raw(), "block {} threshold {}", b, threshold);
        }
    }

    #[test]
    fn test_empty_image() {
        let img = PixelBuffer::new(0, 0);
        let out = pixelate(&img, block(4, 4), 128);
        assert_eq!(out.dimensions(), (0, 0));
    }

    #[test]
    fn test_zero_block_rejected_by_settings() {
        let img = PixelBuffer::new(4, 4);
        let settings = PixelateSettings {
            block: BlockSize { w: 0, h: 4 },
            ..Default::default()
        };
        assert!(pixelate_with(&img, &settings).is_err());
    }
}
