//! Batching pipeline for 3D line-segment frames and the pairwise affinity
//! losses used to train an instance-clustering network on them.
//!
//! This crate provides tools for:
//! - Loading per-frame line files (endpoints, normals, openness, labels, images)
//! - Normalizing, augmenting and sorting line geometries
//! - Drawing fixed-size padded batches with epoch-aware skip-and-retry
//! - Evaluating the KL cross-divergence loss, pairwise metrics and instance IoU
//!
//! # Example
//!
//! ```no_run
//! use linenet_pipeline::processors::dataset::{DatasetIterator, NullEpochSink};
//! use linenet_pipeline::PipelineConfig;
//!
//! let config = PipelineConfig::default();
//! let mut dataset =
//!     DatasetIterator::from_directory("frames".as_ref(), &config, NullEpochSink).unwrap();
//! let batch = dataset.next_batch(512, false).unwrap();
//! println!("{} lines, {} clusters", batch.line_count, batch.cluster_count);
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod processors;
pub mod visualization;

pub use config::{DatasetConfig, ImageConfig, LossConfig, PipelineConfig, TransformConfig};
pub use core::loaders::{Frame, GeometryMatrix};
pub use processors::batching::Batch;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
