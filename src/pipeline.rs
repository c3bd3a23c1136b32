//! Pipeline orchestration.
//!
//! Sequences decode, segmentation, pixelation, refinement and PNG encoding
//! for one encoded input image. CPU-bound stages run on tokio's blocking
//! pool; only segmentation is awaited on the runtime. A run either returns a
//! complete [`PipelineOutput`] or an error, never a partial image.

use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, instrument};
use crate::buffer::{self, GridGeometry, PixelBuffer};
use crate::config::{PipelineMode, PipelineSettings};
use crate::error::{PixelsError, Result};
use crate::pixelator;
use crate::refiner;
use crate::segmenter::{SegmentationPool, Segmenter, Unavailable};

/// Finished pipeline run
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub image: PixelBuffer,
    pub png: Vec<u8>,
    pub summary: PipelineSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub mode: PipelineMode,
    pub original_size: (u32, u32),
    pub final_size: (u32, u32),
    /// Absent when the output was not pixelated
    pub grid: Option<GridGeometry>,
    pub refined: bool,
}

/// Run CPU-heavy work off the async runtime
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PixelsError::Processing(format!("Task join error: {}", e)))?
}

/// Decode the collaborator's output; garbage from it is its failure, not ours
async fn decode_segmentation(bytes: Vec<u8>) -> Result<PixelBuffer> {
    blocking(move || buffer::decode_image(&bytes))
        .await
        .map_err(|e| match e {
            PixelsError::Decode(err) => {
                PixelsError::SegmentationFailure(format!("unreadable segmentation result: {}", err))
            }
            other => other,
        })
}

pub struct Pipeline<S = Unavailable> {
    settings: PipelineSettings,
    segmentation: SegmentationPool<S>,
}

impl Pipeline<Unavailable> {
    /// Pipeline without a segmentation service; only pixelate-only runs work
    pub fn new(settings: PipelineSettings) -> Result<Self> {
        if settings.mode.needs_segmentation() {
            return Err(PixelsError::InvalidParameter(format!(
                "mode {:?} needs a segmentation service",
                settings.mode
            )));
        }
        Self::with_segmenter(settings, Unavailable)
    }
}

impl<S: Segmenter> Pipeline<S> {
    pub fn with_segmenter(settings: PipelineSettings, segmenter: S) -> Result<Self> {
        settings.validate()?;
        let segmentation = SegmentationPool::new(
            segmenter,
            settings.segmentation.max_concurrent,
            settings.segmentation.timeout(),
        );
        Ok(Self { settings, segmentation })
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run with the settings the pipeline was built with
    pub async fn run(&self, input: Vec<u8>) -> Result<PipelineOutput> {
        self.run_with(input, &self.settings).await
    }

    /// Run with per-request settings; the segmentation pool is still shared
    #[instrument(skip_all, fields(mode = ?settings.mode, bytes = input.len()))]
    pub async fn run_with(&self, input: Vec<u8>, settings: &PipelineSettings) -> Result<PipelineOutput> {
        settings.validate()?;
        let started = Instant::now();

        let (input, original) = blocking(move || {
            let original = buffer::decode_image(&input)?;
            Ok((input, original))
        })
        .await?;
        let original_size = original.dimensions();
        debug!(width = original_size.0, height = original_size.1, "decoded input");

        let (image, grid, refined) = match settings.mode {
            PipelineMode::PixelateOnly => {
                let pixelate = settings.pixelate.clone();
                let grid = pixelate.block.grid_for(original_size.0, original_size.1);
                let image = blocking(move || pixelator::pixelate_with(&original, &pixelate)).await?;
                (image, Some(grid), false)
            }
            PipelineMode::SegmentOnly => {
                let cutout = self.segmentation.segment(input, settings.matting).await?;
                (decode_segmentation(cutout).await?, None, false)
            }
            PipelineMode::SegmentThenRefine => {
                let cutout = self.segmentation.segment(input, settings.matting).await?;
                let mask = decode_segmentation(cutout).await?;
                let grid = settings.pixelate.block.grid_for(mask.width(), mask.height());
                let pixelate = settings.pixelate.clone();
                let refine = settings.refine.clone();

                let image = blocking(move || {
                    let mask_size = mask.dimensions();
                    let pixelated = pixelator::pixelate(&mask, pixelate.block, pixelate.alpha_threshold);
                    let result = if refine.enabled {
                        refiner::refine(&pixelated, &original, pixelate.block, refine.white_threshold)
                    } else {
                        pixelated
                    };

                    // Clip last so refinement always sees whole tiles
                    if pixelate.clip_to_original {
                        return Ok(buffer::clip_to(&result, mask_size.0, mask_size.1));
                    }
                    Ok(result)
                })
                .await?;
                (image, Some(grid), settings.refine.enabled)
            }
        };

        let (image, png) = blocking(move || {
            let png = buffer::encode_png(&image)?;
            Ok((image, png))
        })
        .await?;

        let summary = PipelineSummary {
            mode: settings.mode,
            original_size,
            final_size: image.dimensions(),
            grid,
            refined,
        };
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            final_width = summary.final_size.0,
            final_height = summary.final_size.1,
            "pipeline finished"
        );

        Ok(PipelineOutput { image, png, summary })
    }
}
