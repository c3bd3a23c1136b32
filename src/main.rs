use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use meowart_pixels::batch;
use meowart_pixels::buffer::{self, BlockSize};
use meowart_pixels::config::{PipelineMode, PipelineSettings};
use meowart_pixels::logging;
use meowart_pixels::pipeline::Pipeline;
use meowart_pixels::segmenter::HttpSegmenter;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "meowart-pixels")]
#[command(version, about = "Pixel art cutouts with clean grid-aligned transparency", long_about = None)]
struct Cli {
    /// Settings file (JSON); flags override its values
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, value_name = "LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GridArgs {
    /// Block size as 'width,height' (or a single number for squares)
    #[arg(short, long, value_name = "W,H")]
    size: Option<BlockSize>,

    /// Near-white blocks with mean alpha below this become transparent
    #[arg(long, value_name = "0-255")]
    alpha_threshold: Option<u8>,

    /// Crop the output back to the input size instead of whole blocks
    #[arg(long)]
    clip: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Pixelate an image without removing its background
    Pixelate {
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output path (default: <stem>_pixelated_<W>x<H>.png)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        #[command(flatten)]
        grid: GridArgs,
    },

    /// Remove the background, pixelate, and refine edges against the input
    Cutout {
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output path (default: <stem>_nobg.png)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Base URL of the segmentation server
        #[arg(long, value_name = "URL")]
        segmenter_url: Option<String>,

        #[command(flatten)]
        grid: GridArgs,

        /// Blocks the mask calls see-through are dropped when the original is at least this white
        #[arg(long, value_name = "0-255")]
        white_threshold: Option<u8>,

        /// Keep the pixelated cutout as-is, skip refinement
        #[arg(long)]
        no_refine: bool,

        /// Return the raw cutout, skip pixelation and refinement
        #[arg(long, conflicts_with = "no_refine")]
        no_pixelate: bool,

        /// Ask the segmentation server for alpha matting
        #[arg(long)]
        alpha_matting: bool,

        /// Alpha matting foreground threshold
        #[arg(long, value_name = "0-255", requires = "alpha_matting")]
        matting_foreground: Option<u8>,

        /// Alpha matting background threshold
        #[arg(long, value_name = "0-255", requires = "alpha_matting")]
        matting_background: Option<u8>,

        /// Alpha matting erode size
        #[arg(long, value_name = "PX", requires = "alpha_matting")]
        matting_erode: Option<u32>,

        /// Segmentation deadline in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Pixelate every image in a directory
    Batch {
        #[arg(value_name = "INPUT_DIR")]
        input_dir: PathBuf,

        #[arg(value_name = "OUTPUT_DIR")]
        output_dir: PathBuf,

        #[command(flatten)]
        grid: GridArgs,
    },
}

fn base_settings(config: Option<&Path>) -> Result<PipelineSettings> {
    match config {
        Some(path) => PipelineSettings::load(path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => Ok(PipelineSettings::default()),
    }
}

fn apply_grid(settings: &mut PipelineSettings, grid: &GridArgs) {
    if let Some(block) = grid.size {
        settings.pixelate.block = block;
    }
    if let Some(threshold) = grid.alpha_threshold {
        settings.pixelate.alpha_threshold = threshold;
    }
    if grid.clip {
        settings.pixelate.clip_to_original = true;
    }
}

async fn write_output(output: &meowart_pixels::PipelineOutput, path: &Path) -> Result<()> {
    let image = output.image.clone();
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || buffer::save_image(&image, &target))
        .await
        .context("Save task panicked")?
        .with_context(|| format!("Failed to save {}", path.display()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level)?;
    let mut settings = base_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Pixelate { input, output, grid } => {
            apply_grid(&mut settings, &grid);
            settings.mode = PipelineMode::PixelateOnly;
            let output_path = output.unwrap_or_else(|| batch::pixelated_output_path(&input, settings.pixelate.block));

            let bytes = tokio::fs::read(&input)
                .await
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let pipeline = Pipeline::new(settings)?;
            let result = pipeline.run(bytes).await?;
            write_output(&result, &output_path).await?;

            info!(size = ?result.summary.final_size, "pixelated image saved");
            println!("{}", output_path.display());
        }
        Commands::Cutout {
            input,
            output,
            segmenter_url,
            grid,
            white_threshold,
            no_refine,
            no_pixelate,
            alpha_matting,
            matting_foreground,
            matting_background,
            matting_erode,
            timeout,
        } => {
            apply_grid(&mut settings, &grid);
            settings.mode = if no_pixelate {
                PipelineMode::SegmentOnly
            } else {
                PipelineMode::SegmentThenRefine
            };
            if no_refine {
                settings.refine.enabled = false;
            }
            if let Some(threshold) = white_threshold {
                settings.refine.white_threshold = threshold;
            }
            if alpha_matting {
                settings.matting.enabled = true;
            }
            if let Some(v) = matting_foreground {
                settings.matting.foreground_threshold = v;
            }
            if let Some(v) = matting_background {
                settings.matting.background_threshold = v;
            }
            if let Some(v) = matting_erode {
                settings.matting.erode_size = v;
            }
            if let Some(secs) = timeout {
                settings.segmentation.timeout_secs = secs;
            }
            if segmenter_url.is_some() {
                settings.segmentation.endpoint = segmenter_url;
            }

            let output_path = output.unwrap_or_else(|| batch::cutout_output_path(&input));
            let segmenter = HttpSegmenter::from_settings(&settings.segmentation)
                .context("A segmentation server is required (--segmenter-url or config)")?;

            let bytes = tokio::fs::read(&input)
                .await
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let pipeline = Pipeline::with_segmenter(settings, segmenter)?;
            let result = pipeline.run(bytes).await?;
            write_output(&result, &output_path).await?;

            info!(size = ?result.summary.final_size, refined = result.summary.refined, "cutout saved");
            println!("{}", output_path.display());
        }
        Commands::Batch { input_dir, output_dir, grid } => {
            apply_grid(&mut settings, &grid);
            let pixelate = settings.pixelate.clone();

            let report = tokio::task::spawn_blocking(move || batch::pixelate_directory(&input_dir, &output_dir, &pixelate))
                .await
                .context("Batch task panicked")??;

            println!("Successfully processed: {}/{}", report.processed.len(), report.total());
            if !report.failed.is_empty() {
                println!("Failed: {}/{}", report.failed.len(), report.total());
                for (path, error) in &report.failed {
                    println!("  {}: {}", path.display(), error);
                }
            }
        }
    }

    Ok(())
}
