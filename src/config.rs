//! Pipeline settings.
//!
//! One immutable [`PipelineSettings`] value describes a whole invocation.
//! It is read from a JSON file (every field optional, missing ones fall back
//! to defaults), then overridden by whatever the caller sets explicitly.

use serde::{Deserialize, Serialize};
use std::path::Path;
use crate::error::{PixelsError, Result};
use crate::pixelator::PixelateSettings;
use crate::refiner::RefineSettings;
use crate::segmenter::{AlphaMatting, SegmentationSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// Pixelate the input as-is
    PixelateOnly,
    /// Return the segmentation result without pixelating it
    SegmentOnly,
    /// Segment, pixelate the cutout, then refine it against the input
    SegmentThenRefine,
}

impl PipelineMode {
    pub fn needs_segmentation(&self) -> bool {
        !matches!(self, PipelineMode::PixelateOnly)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub mode: PipelineMode,
    pub pixelate: PixelateSettings,
    pub refine: RefineSettings,
    pub matting: AlphaMatting,
    pub segmentation: SegmentationSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            mode: PipelineMode::SegmentThenRefine,
            pixelate: PixelateSettings::default(),
            refine: RefineSettings::default(),
            matting: AlphaMatting::default(),
            segmentation: SegmentationSettings::default(),
        }
    }
}

impl PipelineSettings {
    pub fn pixelate_only(pixelate: PixelateSettings) -> Self {
        Self {
            mode: PipelineMode::PixelateOnly,
            pixelate,
            ..Default::default()
        }
    }

    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject anything that would make the pipeline misbehave, before any pixel work
    pub fn validate(&self) -> Result<()> {
        self.pixelate.validate()?;
        if self.mode.needs_segmentation() {
            self.segmentation.validate()?;
        }
        if self.matting.enabled && self.matting.background_threshold >= self.matting.foreground_threshold {
            return Err(PixelsError::InvalidParameter(format!(
                "alpha matting background threshold ({}) must be below foreground threshold ({})",
                self.matting.background_threshold, self.matting.foreground_threshold
            )));
        }
        Ok(())
    }
}
