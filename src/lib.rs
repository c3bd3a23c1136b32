//! Pixel art cutouts.
//!
//! Turns a photo or illustration into block-quantized pixel art with clean,
//! grid-aligned transparency:
//! - [`pixelator`] collapses each tile to one color and one alpha
//! - [`refiner`] re-checks a pixelated segmentation against the original image
//! - [`pipeline`] chains segmentation, pixelation and refinement
//!
//! Segmentation itself is an external service reached through [`segmenter`].

pub mod batch;
pub mod buffer;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod pixelator;
pub mod refiner;
pub mod segmenter;

pub use buffer::{BlockSize, PixelBuffer};
pub use config::{PipelineMode, PipelineSettings};
pub use error::{PixelsError, Result};
pub use pipeline::{Pipeline, PipelineOutput};
pub use pixelator::{pixelate, PixelateSettings};
pub use refiner::{refine, RefineSettings};
pub use segmenter::{AlphaMatting, HttpSegmenter, Segmenter};
