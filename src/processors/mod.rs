//! Batch assembly, dataset iteration and loss evaluation.

pub mod affinity;
pub mod batching;
pub mod dataset;
pub mod iou;

// Re-export key types for convenience
pub use affinity::{
    AffinityError, DebugStatistics, InstancePredictions, KlCrossDivergenceLoss, PairMasks,
    PairwiseMetrics,
};
pub use batching::{Batch, BatchError, ImageLoader, ImageStack};
pub use dataset::{
    DatasetError, DatasetIterator, EpochSink, EpochStatistics, EpochSummary, MemoryEpochSink,
    NpyEpochSink, NullEpochSink,
};
pub use iou::IouMetric;
