//! File and directory front-ends for pixelate-only processing.

use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use crate::buffer::{self, BlockSize};
use crate::error::{PixelsError, Result};
use crate::pixelator::{self, PixelateSettings};

/// Extensions picked up by directory mode
pub const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "gif", "tiff", "webp"];

#[derive(Debug, Clone, Serialize)]
pub struct PixelateResult {
    pub output_path: PathBuf,
    pub original_size: (u32, u32),
    pub final_size: (u32, u32),
    pub block_count: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub processed: Vec<PixelateResult>,
    pub failed: Vec<(PathBuf, String)>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.processed.len() + self.failed.len()
    }
}

/// `{stem}_pixelated_{w}x{h}.png` next to the input
pub fn pixelated_output_path(input: &Path, block: BlockSize) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
    input.with_file_name(format!("{}_pixelated_{}.png", stem, block))
}

/// `{stem}_nobg.png` next to the input
pub fn cutout_output_path(input: &Path) -> PathBuf {
    let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("image");
    input.with_file_name(format!("{}_nobg.png", stem))
}

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known)))
            .unwrap_or(false)
}

/// Pixelate one file on disk
pub fn pixelate_file(input_path: &Path, output_path: &Path, settings: &PixelateSettings) -> Result<PixelateResult> {
    let img = buffer::load_image(input_path)?;
    let original_size = img.dimensions();

    let pixelated = pixelator::pixelate_with(&img, settings)?;
    buffer::save_image(&pixelated, output_path)?;

    Ok(PixelateResult {
        output_path: output_path.to_path_buf(),
        original_size,
        final_size: pixelated.dimensions(),
        block_count: settings.block.grid_for(original_size.0, original_size.1).block_count(),
    })
}

/// Pixelate every image in `input_dir` into `output_dir`, keeping file names.
///
/// A file that fails is recorded in the report; the rest still run.
pub fn pixelate_directory(input_dir: &Path, output_dir: &Path, settings: &PixelateSettings) -> Result<BatchReport> {
    settings.validate()?;
    if !input_dir.is_dir() {
        return Err(PixelsError::InvalidParameter(format!(
            "{} is not a directory",
            input_dir.display()
        )));
    }
    std::fs::create_dir_all(output_dir)?;

    let mut files: Vec<PathBuf> = std::fs::read_dir(input_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| is_image_file(path))
        .collect();
    files.sort();

    if files.is_empty() {
        warn!(dir = %input_dir.display(), "no image files found");
        return Ok(BatchReport::default());
    }
    info!(count = files.len(), block = %settings.block, "pixelating directory");

    let outcomes: Vec<(PathBuf, Result<PixelateResult>)> = files
        .into_par_iter()
        .map(|path| {
            let Some(name) = path.file_name() else {
                return (path.clone(), Err(PixelsError::InvalidParameter("file has no name".to_string())));
            };
            let output = output_dir.join(name);
            let result = pixelate_file(&path, &output, settings);
            (path, result)
        })
        .collect();

    let mut report = BatchReport::default();
    for (path, outcome) in outcomes {
        match outcome {
            Ok(result) => report.processed.push(result),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "failed to pixelate");
                report.failed.push((path, e.to_string()));
            }
        }
    }

    info!(processed = report.processed.len(), failed = report.failed.len(), "batch finished");
    Ok(report)
}
