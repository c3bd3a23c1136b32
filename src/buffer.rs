//! Pixel buffers, block geometry and the codec boundary.
//!
//! Every stage consumes and produces a [`PixelBuffer`], a row-major RGBA8
//! raster. Decoding accepts anything the `image` crate can guess; results
//! always leave as PNG so the alpha channel survives.

use image::{ImageFormat, Rgb, RgbImage, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::str::FromStr;
use crate::error::{PixelsError, Result};

/// RGBA raster with `width * height` pixels, four 8-bit channels each.
pub type PixelBuffer = RgbaImage;

/// Fully transparent pixel written for background blocks.
pub const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

// ============================================================================
// BLOCK GEOMETRY
// ============================================================================

/// Tile dimensions of the pixelation grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSize {
    pub w: u32,
    pub h: u32,
}

impl BlockSize {
    pub fn new(w: u32, h: u32) -> Result<Self> {
        let block = Self { w, h };
        block.validate()?;
        Ok(block)
    }

    pub fn square(size: u32) -> Result<Self> {
        Self::new(size, size)
    }

    pub fn validate(&self) -> Result<()> {
        if self.w == 0 || self.h == 0 {
            return Err(PixelsError::InvalidParameter(format!(
                "block size must be positive, got {}x{}",
                self.w, self.h
            )));
        }
        Ok(())
    }

    /// Grid laid over a `width` x `height` image with this block size
    pub fn grid_for(&self, width: u32, height: u32) -> GridGeometry {
        GridGeometry {
            grid_w: width.div_ceil(self.w),
            grid_h: height.div_ceil(self.h),
            block: *self,
        }
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self { w: 8, h: 8 }
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.w, self.h)
    }
}

/// Parses `"W,H"` or a single `"N"` for square blocks.
impl FromStr for BlockSize {
    type Err = PixelsError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            PixelsError::InvalidParameter(format!(
                "invalid block size '{}', expected 'width,height'",
                s
            ))
        };

        let mut parts = s.split(',').map(|p| p.trim().parse::<u32>());
        match (parts.next(), parts.next(), parts.next()) {
            (Some(Ok(n)), None, None) => Self::square(n),
            (Some(Ok(w)), Some(Ok(h)), None) => Self::new(w, h),
            _ => Err(invalid()),
        }
    }
}

/// Derived tiling of an image; never stored alongside the pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GridGeometry {
    pub grid_w: u32,
    pub grid_h: u32,
    pub block: BlockSize,
}

impl GridGeometry {
    pub fn block_count(&self) -> u64 {
        self.grid_w as u64 * self.grid_h as u64
    }

    /// Dimensions rounded up to whole blocks
    pub fn padded_dimensions(&self) -> (u32, u32) {
        (self.grid_w * self.block.w, self.grid_h * self.block.h)
    }

    /// Pixel bounds `(x1, y1, x2, y2)` of cell `(gx, gy)`, clipped to `width` x `height`
    pub fn cell_bounds(&self, gx: u32, gy: u32, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let x1 = gx * self.block.w;
        let y1 = gy * self.block.h;
        let x2 = ((gx + 1) * self.block.w).min(width);
        let y2 = ((gy + 1) * self.block.h).min(height);
        (x1, y1, x2, y2)
    }
}

/// Paint columns `x1..x2` of every row in a band of `row_width`-pixel rows.
///
/// A band is the slice of output rows that belongs to one grid row, so bands
/// handed to different threads never overlap.
pub(crate) fn fill_band_columns(band: &mut [u8], row_width: u32, x1: u32, x2: u32, color: Rgba<u8>) {
    let stride = row_width as usize * 4;
    for row in band.chunks_exact_mut(stride) {
        for px in row[x1 as usize * 4..x2 as usize * 4].chunks_exact_mut(4) {
            px.copy_from_slice(&color.0);
        }
    }
}

// ============================================================================
// CODEC BOUNDARY
// ============================================================================

/// Decode an encoded raster (PNG, JPEG, ...) into an RGBA buffer
pub fn decode_image(bytes: &[u8]) -> Result<PixelBuffer> {
    let img = image::load_from_memory(bytes)?;
    Ok(img.to_rgba8())
}

/// Load an image from disk into memory
pub fn load_image(path: &Path) -> Result<PixelBuffer> {
    let bytes = std::fs::read(path)?;
    decode_image(&bytes)
}

/// Encode a buffer as PNG bytes
pub fn encode_png(img: &PixelBuffer) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, ImageFormat::Png)
        .map_err(|e| PixelsError::Encode(format!("Failed to encode PNG: {}", e)))?;
    Ok(buffer.into_inner())
}

/// Composite the buffer over an opaque background color (for JPEG output)
pub fn flatten_onto(img: &PixelBuffer, background: [u8; 3]) -> RgbImage {
    let (width, height) = img.dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        let p = img.get_pixel(x, y);
        let a = p[3] as u32;
        let blend = |c: u8, bg: u8| ((c as u32 * a + bg as u32 * (255 - a) + 127) / 255) as u8;
        Rgb([
            blend(p[0], background[0]),
            blend(p[1], background[1]),
            blend(p[2], background[2]),
        ])
    })
}

fn is_jpeg_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("jpg") || e.eq_ignore_ascii_case("jpeg"))
        .unwrap_or(false)
}

/// Save a buffer to disk, flattening onto white when the target is JPEG
pub fn save_image(img: &PixelBuffer, path: &Path) -> Result<()> {
    // Ensure output directory exists
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let saved = if is_jpeg_path(path) {
        flatten_onto(img, [255, 255, 255]).save(path)
    } else {
        img.save(path)
    };
    saved.map_err(|e| PixelsError::Encode(format!("Failed to save {}: {}", path.display(), e)))
}

/// Crop a padded buffer back to `width` x `height`
pub fn clip_to(img: &PixelBuffer, width: u32, height: u32) -> PixelBuffer {
    let (w, h) = img.dimensions();
    if w <= width && h <= height {
        return img.clone();
    }
    image::imageops::crop_imm(img, 0, 0, width.min(w), height.min(h)).to_image()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_rejects_zero() {
        assert!(BlockSize::new(0, 4).is_err());
        assert!(BlockSize::new(4, 0).is_err());
        assert!(BlockSize::new(1, 1).is_ok());
    }

    #[test]
    fn test_block_size_parse() {
        assert_eq!("4,4".parse::<BlockSize>().unwrap(), BlockSize { w: 4, h: 4 });
        assert_eq!("8, 2".parse::<BlockSize>().unwrap(), BlockSize { w: 8, h: 2 });
        assert_eq!("6".parse::<BlockSize>().unwrap(), BlockSize { w: 6, h: 6 });
        assert!("4x4".parse::<BlockSize>().is_err());
        assert!("0,4".parse::<BlockSize>().is_err());
        assert!("1,2,3".parse::<BlockSize>().is_err());
    }

    #[test]
    fn test_grid_rounds_up() {
        let grid = BlockSize::new(4, 3).unwrap().grid_for(10, 9);
        assert_eq!((grid.grid_w, grid.grid_h), (3, 3));
        assert_eq!(grid.padded_dimensions(), (12, 9));
        assert_eq!(grid.block_count(), 9);
        assert_eq!(grid.cell_bounds(2, 2, 10, 9), (8, 6, 10, 9));
    }

    #[test]
    fn test_png_roundtrip_keeps_alpha() {
        let img = RgbaImage::from_pixel(3, 2, Rgba([10, 20, 30, 40]));
        let png = encode_png(&img).unwrap();
        let decoded = decode_image(&png).unwrap();
        assert_eq!(decoded, img);
    }

    #[test]
    fn test_decode_garbage_is_decode_error() {
        let err = decode_image(b"definitely not an image").unwrap_err();
        assert!(matches!(err, PixelsError::Decode(_)));
    }

    #[test]
    fn test_flatten_onto_white() {
        let mut img = RgbaImage::new(2, 1);
        img.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        img.put_pixel(1, 0, Rgba([255, 0, 0, 255]));
        let flat = flatten_onto(&img, [255, 255, 255]);
        assert_eq!(flat.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(flat.get_pixel(1, 0), &Rgb([255, 0, 0]));
    }

    #[test]
    fn test_clip_to() {
        let img = RgbaImage::new(12, 8);
        assert_eq!(clip_to(&img, 10, 7).dimensions(), (10, 7));
        assert_eq!(clip_to(&img, 12, 8).dimensions(), (12, 8));
    }

    #[test]
    fn test_save_jpeg_flattens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.jpg");
        let img = RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 0]));
        save_image(&img, &path).unwrap();
        let back = image::open(&path).unwrap();
        assert_eq!(back.color(), image::ColorType::Rgb8);
    }
}
