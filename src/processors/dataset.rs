//! Epoch-aware iteration over frames with skip-and-retry semantics.
//!
//! The iterator owns the frames, a traversal permutation and a cursor into it.
//! Every call to [`DatasetIterator::next_batch`] draws frames until one passes
//! the validity policy (enough lines, at least one and not too many
//! instances). Reaching the end of the permutation closes the epoch: the
//! accumulated statistics are handed to an [`EpochSink`], counters are reset
//! and the order is reshuffled when shuffling is enabled.

use std::mem;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

use crate::config::{DatasetConfig, ImageConfig, PipelineConfig, TransformConfig};
use crate::core::loaders::{self, endpoint_mean, Frame, LoaderError};
use crate::core::writers::{write_epoch_counts, WriteError};

use super::batching::{
    cluster_count, pad_batch, prepare_sample, sample_frame, Batch, BatchError, ImageLoader,
};

/// Errors raised by the dataset iterator.
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("dataset contains no frames")]
    Empty,

    #[error("no acceptable frame found after {attempts} attempts")]
    NoAcceptableFrame { attempts: usize },

    #[error("pointer {index} out of range for {frame_count} frames")]
    PointerOutOfRange { index: usize, frame_count: usize },
}

/// Result type for dataset operations.
pub type Result<T> = std::result::Result<T, DatasetError>;

/// Line and cluster counts of every frame drawn during an epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EpochStatistics {
    pub line_counts: Vec<i64>,
    pub cluster_counts: Vec<i64>,
}

impl EpochStatistics {
    pub fn record(&mut self, line_count: usize, cluster_count: usize) {
        self.line_counts.push(line_count as i64);
        self.cluster_counts.push(cluster_count as i64);
    }

    /// Number of recorded frames.
    #[inline]
    pub fn len(&self) -> usize {
        self.line_counts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.line_counts.is_empty()
    }
}

/// Emitted once per completed epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochSummary {
    /// Zero-based index of the completed epoch.
    pub epoch: usize,
    pub skipped_frames: usize,
    pub accepted_batches: usize,
    pub statistics: EpochStatistics,
}

/// Receives the statistics of each completed epoch.
pub trait EpochSink {
    fn on_epoch_end(&mut self, summary: &EpochSummary) -> std::result::Result<(), WriteError>;
}

impl EpochSink for Box<dyn EpochSink> {
    fn on_epoch_end(&mut self, summary: &EpochSummary) -> std::result::Result<(), WriteError> {
        (**self).on_epoch_end(summary)
    }
}

/// Discards epoch statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEpochSink;

impl EpochSink for NullEpochSink {
    fn on_epoch_end(&mut self, _summary: &EpochSummary) -> std::result::Result<(), WriteError> {
        Ok(())
    }
}

/// Keeps every epoch summary in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryEpochSink {
    pub summaries: Vec<EpochSummary>,
}

impl EpochSink for MemoryEpochSink {
    fn on_epoch_end(&mut self, summary: &EpochSummary) -> std::result::Result<(), WriteError> {
        self.summaries.push(summary.clone());
        Ok(())
    }
}

/// Writes `cluster_counts.npy` and `line_counts.npy` into a directory,
/// replacing the previous epoch's files.
#[derive(Debug, Clone)]
pub struct NpyEpochSink {
    directory: PathBuf,
}

impl NpyEpochSink {
    pub fn new<P: Into<PathBuf>>(directory: P) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }
}

impl EpochSink for NpyEpochSink {
    fn on_epoch_end(&mut self, summary: &EpochSummary) -> std::result::Result<(), WriteError> {
        let (cluster_path, line_path) = write_epoch_counts(
            &self.directory,
            &summary.statistics.line_counts,
            &summary.statistics.cluster_counts,
        )?;
        debug!(
            "Epoch {} statistics written to {} and {}",
            summary.epoch,
            cluster_path.display(),
            line_path.display()
        );
        Ok(())
    }
}

/// Stateful, single-consumer iterator producing one padded batch per frame.
pub struct DatasetIterator<S: EpochSink = NullEpochSink> {
    frames: Vec<Frame>,
    frame_indices: Vec<usize>,
    pointer: usize,
    config: DatasetConfig,
    transform: TransformConfig,
    images: ImageConfig,
    image_loader: Option<ImageLoader>,
    rng: StdRng,
    statistics: EpochStatistics,
    skipped_frames: usize,
    accepted_batches: usize,
    epoch: usize,
    sink: S,
}

impl<S: EpochSink> DatasetIterator<S> {
    /// Build an iterator over already loaded frames.
    ///
    /// # Errors
    ///
    /// Returns [`DatasetError::Empty`] if `frames` is empty. The image
    /// configuration is checked on the first call that loads images.
    pub fn from_frames(frames: Vec<Frame>, config: &PipelineConfig, sink: S) -> Result<Self> {
        if frames.is_empty() {
            return Err(DatasetError::Empty);
        }

        let mut rng = match config.dataset.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };

        let mut frame_indices: Vec<usize> = (0..frames.len()).collect();
        if config.dataset.shuffle {
            frame_indices.shuffle(&mut rng);
        }

        Ok(Self {
            frames,
            frame_indices,
            pointer: 0,
            config: config.dataset.clone(),
            transform: config.transform.clone(),
            images: config.images,
            image_loader: None,
            rng,
            statistics: EpochStatistics::default(),
            skipped_frames: 0,
            accepted_batches: 0,
            epoch: 0,
            sink,
        })
    }

    /// Load every frame file of `directory` and build an iterator over them.
    pub fn from_directory(directory: &Path, config: &PipelineConfig, sink: S) -> Result<Self> {
        let frames = loaders::load_frames(directory)?;
        Self::from_frames(frames, config, sink)
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Current traversal order.
    #[inline]
    pub fn frame_indices(&self) -> &[usize] {
        &self.frame_indices
    }

    #[inline]
    pub fn pointer(&self) -> usize {
        self.pointer
    }

    /// Whether the next call to `next_batch` starts a new epoch.
    #[inline]
    pub fn at_epoch_boundary(&self) -> bool {
        self.pointer == self.frames.len()
    }

    #[inline]
    pub fn skipped_frames(&self) -> usize {
        self.skipped_frames
    }

    #[inline]
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Statistics accumulated in the current epoch.
    #[inline]
    pub fn statistics(&self) -> &EpochStatistics {
        &self.statistics
    }

    #[inline]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    #[inline]
    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    /// Mean of all start and end points over the loaded frames.
    pub fn endpoint_mean(&self) -> Option<[f64; 3]> {
        endpoint_mean(&self.frames)
    }

    /// Set the mean subtracted from endpoints before normalization.
    pub fn set_mean(&mut self, mean: [f64; 3]) {
        self.config.mean = mean;
    }

    /// Move the cursor to `index` (at most `frame_count`).
    pub fn set_pointer(&mut self, index: usize) -> Result<()> {
        if index > self.frames.len() {
            return Err(DatasetError::PointerOutOfRange {
                index,
                frame_count: self.frames.len(),
            });
        }
        self.pointer = index;
        Ok(())
    }

    /// Close the current epoch.
    ///
    /// Resets the cursor, the skip counter and the statistics, reshuffles the
    /// frame order when shuffling is enabled, then hands the summary of the
    /// closed epoch to the sink.
    pub fn reset_pointer(&mut self) -> Result<EpochSummary> {
        let summary = EpochSummary {
            epoch: self.epoch,
            skipped_frames: self.skipped_frames,
            accepted_batches: self.accepted_batches,
            statistics: mem::take(&mut self.statistics),
        };

        self.pointer = 0;
        self.skipped_frames = 0;
        self.accepted_batches = 0;
        self.epoch += 1;
        if self.config.shuffle {
            self.frame_indices.shuffle(&mut self.rng);
        }

        info!(
            "Dataset completed. Number of skipped frames: {}",
            summary.skipped_frames
        );
        self.sink.on_epoch_end(&summary)?;

        Ok(summary)
    }

    fn max_attempts(&self) -> usize {
        self.config
            .max_attempts
            .unwrap_or(2 * self.frames.len())
            .max(1)
    }

    fn rejects(&self, line_count: usize, clusters: usize) -> bool {
        line_count < self.config.min_line_count
            || clusters == 0
            || clusters > self.config.max_cluster_count
    }

    /// Produce the next accepted batch.
    ///
    /// Frames failing the validity policy are counted as skipped and the next
    /// frame is drawn, crossing epoch boundaries as needed.
    ///
    /// # Errors
    ///
    /// [`DatasetError::NoAcceptableFrame`] once the attempt budget is spent
    /// without an acceptable frame, a sink error at an epoch boundary, or
    /// [`DatasetError::Batch`] when images are requested with an unsupported
    /// channel count.
    pub fn next_batch(&mut self, batch_size: usize, load_images: bool) -> Result<Batch> {
        if load_images && self.image_loader.is_none() {
            self.image_loader = Some(ImageLoader::new(self.images)?);
        }

        let attempts = self.max_attempts();

        for _ in 0..attempts {
            if self.at_epoch_boundary() {
                self.reset_pointer()?;
            }

            let frame = &self.frames[self.frame_indices[self.pointer]];
            self.pointer += 1;

            let mut sample = sample_frame(frame, batch_size, self.config.shuffle, None, &mut self.rng);
            let clusters = cluster_count(
                &sample.labels,
                &sample.class_ids,
                &self.config.background_classes,
            );
            self.statistics.record(sample.line_count, clusters);

            if self.rejects(sample.line_count, clusters) {
                self.skipped_frames += 1;
                debug!(
                    "Skipping frame {} ({} lines, {} clusters)",
                    frame.path.display(),
                    sample.line_count,
                    clusters
                );
                continue;
            }

            if let (true, Some(loader)) = (load_images, &self.image_loader) {
                sample.images = Some(loader.load_stack(&sample.image_paths));
            }

            let prepared = prepare_sample(
                sample,
                &self.config.mean,
                &self.transform,
                self.config.data_augmentation,
                self.config.sort,
                &mut self.rng,
            );
            self.accepted_batches += 1;

            return Ok(pad_batch(prepared, batch_size, &self.config.background_classes));
        }

        Err(DatasetError::NoAcceptableFrame { attempts })
    }
}
