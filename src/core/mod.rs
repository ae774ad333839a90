//! Core data types and I/O operations.

pub mod loaders;
pub mod transforms;
pub mod writers;

pub use loaders::{Frame, GeometryMatrix, LoaderError, FEATURE_WIDTH, GEOMETRY_WIDTH};
pub use writers::{read_counts_npy, write_batch_csv, write_epoch_counts, WriteError};
