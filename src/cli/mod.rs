//! Command-line interface for the line batching pipeline.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::core::{loaders, writers};
use crate::processors::dataset::{DatasetIterator, EpochSink, NpyEpochSink, NullEpochSink};
use crate::PipelineConfig;

#[derive(Parser)]
#[command(name = "linenet-pipeline")]
#[command(about = "Line-segment batching pipeline for instance clustering", version)]
pub struct Cli {
    /// Path to YAML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report frame and line statistics of a dataset directory
    Inspect {
        /// Directory with one frame file per frame
        directory: PathBuf,
    },

    /// Draw batches from a dataset directory
    Sample {
        /// Directory with one frame file per frame
        directory: PathBuf,
        /// Number of batches to draw
        #[arg(short = 'n', long, default_value_t = 10)]
        batches: usize,
        /// Rows per batch
        #[arg(short, long, default_value_t = 512)]
        batch_size: usize,
        /// Load virtual camera images
        #[arg(long)]
        images: bool,
        /// Center on the dataset endpoint mean instead of the configured mean
        #[arg(long)]
        dataset_mean: bool,
        /// Write the valid rows of every batch as CSV into this directory
        #[arg(long)]
        export: Option<PathBuf>,
    },

    /// Compute the endpoint mean of a dataset directory
    Mean {
        /// Directory with one frame file per frame
        directory: PathBuf,
        /// Write the active config with this mean to a YAML file
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Plot line and cluster count histograms of persisted epoch statistics
    Histogram {
        /// Directory holding cluster_counts.npy and line_counts.npy
        stats_dir: PathBuf,
        /// Output PNG file path (defaults to <stats_dir>/epoch_statistics.png)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Create a spinner for indeterminate operations
fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

fn create_progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    if let Ok(style) =
        ProgressStyle::default_bar().template("{bar:40.cyan/blue} {pos}/{len} batches {msg}")
    {
        pb.set_style(style);
    }
    pb
}

/// Print a summary box
fn print_summary(title: &str, items: &[(&str, String)]) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║ {:<60} ║", title);
    println!("╠══════════════════════════════════════════════════════════════╣");
    for (key, value) in items {
        let display_value = if value.chars().count() > 38 {
            format!("{}...", value.chars().take(35).collect::<String>())
        } else {
            value.clone()
        };
        println!("║ {:<20}: {:<38} ║", key, display_value);
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

fn format_mean(mean: &[f64; 3]) -> String {
    format!("[{:.4}, {:.4}, {:.4}]", mean[0], mean[1], mean[2])
}

pub fn run() {
    let cli = Cli::parse();

    // Initialize logging based on verbosity (must come first)
    env_logger::Builder::new()
        .filter_level(match cli.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        })
        .format_timestamp_secs()
        .init();

    let config = match &cli.config {
        Some(path) => match PipelineConfig::from_yaml(path) {
            Ok(cfg) => {
                info!("Loaded config from: {}", path.display());
                cfg
            }
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}, using defaults",
                    path.display(),
                    e
                );
                PipelineConfig::default()
            }
        },
        None => PipelineConfig::default(),
    };

    let result = match cli.command {
        Commands::Inspect { directory } => cmd_inspect(&directory),
        Commands::Sample {
            directory,
            batches,
            batch_size,
            images,
            dataset_mean,
            export,
        } => cmd_sample(
            &directory,
            batches,
            batch_size,
            images,
            dataset_mean,
            export.as_deref(),
            &config,
        ),
        Commands::Mean { directory, save } => cmd_mean(&directory, save.as_deref(), &config),
        Commands::Histogram { stats_dir, output } => cmd_histogram(&stats_dir, output),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn cmd_inspect(directory: &Path) -> Result<()> {
    let start = Instant::now();
    let spinner = create_spinner("Loading frames...");

    let frames = loaders::load_frames(directory);
    spinner.finish_and_clear();
    let frames = frames.with_context(|| format!("loading frames from {}", directory.display()))?;

    let line_counts: Vec<usize> = frames.iter().map(|f| f.line_count()).collect();
    let total_lines: usize = line_counts.iter().sum();
    let empty_frames = frames.iter().filter(|f| f.is_empty()).count();
    let mean = loaders::endpoint_mean(&frames)
        .map(|m| format_mean(&m))
        .unwrap_or_else(|| "n/a".to_string());

    print_summary(
        "Dataset Inspection",
        &[
            ("Directory", directory.display().to_string()),
            ("Frames", frames.len().to_string()),
            ("Empty frames", empty_frames.to_string()),
            ("Total lines", total_lines.to_string()),
            (
                "Lines per frame",
                format!(
                    "{} to {}",
                    line_counts.iter().min().copied().unwrap_or(0),
                    line_counts.iter().max().copied().unwrap_or(0)
                ),
            ),
            ("Endpoint mean", mean),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );

    Ok(())
}

fn cmd_sample(
    directory: &Path,
    batches: usize,
    batch_size: usize,
    images: bool,
    dataset_mean: bool,
    export: Option<&Path>,
    config: &PipelineConfig,
) -> Result<()> {
    let start = Instant::now();

    let sink: Box<dyn EpochSink> = match &config.dataset.stats_dir {
        Some(dir) => {
            info!("Epoch statistics will be written to {}", dir.display());
            Box::new(NpyEpochSink::new(dir))
        }
        None => Box::new(NullEpochSink),
    };

    let spinner = create_spinner("Loading frames...");
    let iterator = DatasetIterator::from_directory(directory, config, sink);
    spinner.finish_and_clear();
    let mut iterator =
        iterator.with_context(|| format!("opening dataset {}", directory.display()))?;

    if dataset_mean {
        if let Some(mean) = iterator.endpoint_mean() {
            info!("Using dataset endpoint mean {}", format_mean(&mean));
            iterator.set_mean(mean);
        }
    }

    let progress = create_progress_bar(batches);
    let mut total_lines = 0usize;
    let mut total_clusters = 0usize;

    for index in 0..batches {
        let batch = iterator
            .next_batch(batch_size, images)
            .with_context(|| format!("drawing batch {}", index))?;

        info!(
            "Batch {}: {} lines, {} clusters",
            index, batch.line_count, batch.cluster_count
        );
        total_lines += batch.line_count;
        total_clusters += batch.cluster_count;

        if let Some(dir) = export {
            let path = dir.join(format!("batch_{:05}.csv", index));
            writers::write_batch_csv(&path, &batch)
                .with_context(|| format!("exporting batch {}", index))?;
        }

        progress.set_message(format!("epoch {}", iterator.epoch()));
        progress.inc(1);
    }
    progress.finish_and_clear();

    let per_batch = |total: usize| {
        if batches == 0 {
            0.0
        } else {
            total as f64 / batches as f64
        }
    };

    print_summary(
        "Sampling Complete",
        &[
            ("Directory", directory.display().to_string()),
            ("Frames", iterator.frame_count().to_string()),
            ("Batches", batches.to_string()),
            ("Batch size", batch_size.to_string()),
            ("Mean lines", format!("{:.2}", per_batch(total_lines))),
            ("Mean clusters", format!("{:.2}", per_batch(total_clusters))),
            ("Epochs completed", iterator.epoch().to_string()),
            ("Skipped this epoch", iterator.skipped_frames().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );

    Ok(())
}

fn cmd_mean(directory: &Path, save: Option<&Path>, config: &PipelineConfig) -> Result<()> {
    let spinner = create_spinner("Loading frames...");
    let frames = loaders::load_frames(directory);
    spinner.finish_and_clear();
    let frames = frames.with_context(|| format!("loading frames from {}", directory.display()))?;

    let mean = loaders::endpoint_mean(&frames)
        .with_context(|| format!("no lines found in {}", directory.display()))?;
    println!("{}", format_mean(&mean));

    if let Some(path) = save {
        let mut updated = config.clone();
        updated.dataset.mean = mean;
        updated
            .to_yaml(path)
            .with_context(|| format!("writing config to {}", path.display()))?;
        info!("Saved config with endpoint mean to {}", path.display());
    }

    Ok(())
}

fn cmd_histogram(stats_dir: &Path, output: Option<PathBuf>) -> Result<()> {
    use crate::visualization;

    let start = Instant::now();
    let output_path = output.unwrap_or_else(|| stats_dir.join("epoch_statistics.png"));

    let line_counts = writers::read_counts_npy(&stats_dir.join(writers::LINE_COUNT_FILE))?;
    let cluster_counts = writers::read_counts_npy(&stats_dir.join(writers::CLUSTER_COUNT_FILE))?;

    visualization::plot_epoch_statistics(&output_path, &line_counts, &cluster_counts)
        .with_context(|| format!("plotting {}", output_path.display()))?;

    print_summary(
        "Histogram Complete",
        &[
            ("Statistics", stats_dir.display().to_string()),
            ("Frames recorded", line_counts.len().to_string()),
            ("Output PNG", output_path.display().to_string()),
            ("Duration", format!("{:.2?}", start.elapsed())),
        ],
    );

    Ok(())
}
