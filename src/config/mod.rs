//! Configuration types for the line batching pipeline.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while reading or writing configuration files.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Frame selection, validity policy and epoch bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Class ids treated as background (excluded from clusters and losses)
    #[serde(default)]
    pub background_classes: Vec<i64>,

    /// Shuffle frame order every epoch and line order within each frame
    #[serde(default)]
    pub shuffle: bool,

    /// Apply flip and global rotation augmentation to accepted frames
    #[serde(default)]
    pub data_augmentation: bool,

    /// Sort lines of a batch by the smaller x coordinate of their endpoints
    #[serde(default)]
    pub sort: bool,

    /// Frames with fewer sampled lines are skipped
    #[serde(default = "default_min_line_count")]
    pub min_line_count: usize,

    /// Frames with more instances than this are skipped
    #[serde(default = "default_max_cluster_count")]
    pub max_cluster_count: usize,

    /// Mean of all segment endpoints, subtracted before normalization
    #[serde(default)]
    pub mean: [f64; 3],

    /// Upper bound on frames drawn for a single batch; defaults to twice the frame count
    #[serde(default)]
    pub max_attempts: Option<usize>,

    /// Seed for shuffling and augmentation
    #[serde(default)]
    pub seed: Option<u64>,

    /// Directory receiving the per-epoch line and cluster count arrays
    #[serde(default)]
    pub stats_dir: Option<PathBuf>,
}

fn default_min_line_count() -> usize {
    15
}

fn default_max_cluster_count() -> usize {
    15
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            background_classes: Vec::new(),
            shuffle: false,
            data_augmentation: false,
            sort: false,
            min_line_count: default_min_line_count(),
            max_cluster_count: default_max_cluster_count(),
            mean: [0.0; 3],
            max_attempts: None,
            seed: None,
            stats_dir: None,
        }
    }
}

impl DatasetConfig {
    /// Whether `class_id` belongs to the background set.
    #[inline]
    pub fn is_background(&self, class_id: i64) -> bool {
        self.background_classes.contains(&class_id)
    }
}

/// Geometry normalization and augmentation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Endpoint coordinates are divided by this after mean subtraction
    #[serde(default = "default_normalization_scale")]
    pub normalization_scale: f64,

    /// Standard deviation of the global rotation angle, in degrees
    #[serde(default = "default_angle_deviation_deg")]
    pub angle_deviation_deg: f64,

    /// Standard deviation of the global translation, per axis
    #[serde(default = "default_offset_deviation")]
    pub offset_deviation: f64,
}

fn default_normalization_scale() -> f64 {
    1.5
}

fn default_angle_deviation_deg() -> f64 {
    20.0
}

fn default_offset_deviation() -> f64 {
    0.5
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            normalization_scale: default_normalization_scale(),
            angle_deviation_deg: default_angle_deviation_deg(),
            offset_deviation: default_offset_deviation(),
        }
    }
}

/// Shape of the per-line virtual camera images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default = "default_image_side")]
    pub height: u32,

    #[serde(default = "default_image_side")]
    pub width: u32,

    #[serde(default = "default_image_channels")]
    pub channels: u32,
}

fn default_image_side() -> u32 {
    224
}

fn default_image_channels() -> u32 {
    3
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            height: default_image_side(),
            width: default_image_side(),
            channels: default_image_channels(),
        }
    }
}

impl ImageConfig {
    /// Number of values in one image.
    #[inline]
    pub fn pixel_len(&self) -> usize {
        self.height as usize * self.width as usize * self.channels as usize
    }
}

/// Constants of the pairwise affinity loss and metrics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LossConfig {
    /// Hinge margin for pairs with different instance labels
    #[serde(default = "default_margin")]
    pub margin: f64,

    /// Additive guard inside the divergence ratio and logarithm
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,

    /// Factor applied after averaging over comparable pairs
    #[serde(default = "default_loss_scale")]
    pub loss_scale: f64,

    /// Number of predicted cluster ids considered by the IoU metric
    #[serde(default = "default_predicted_cluster_capacity")]
    pub predicted_cluster_capacity: usize,
}

fn default_margin() -> f64 {
    2.0
}

fn default_epsilon() -> f64 {
    1e-100
}

fn default_loss_scale() -> f64 {
    150.0 * 150.0
}

fn default_predicted_cluster_capacity() -> usize {
    15
}

impl Default for LossConfig {
    fn default() -> Self {
        Self {
            margin: default_margin(),
            epsilon: default_epsilon(),
            loss_scale: default_loss_scale(),
            predicted_cluster_capacity: default_predicted_cluster_capacity(),
        }
    }
}

/// Main pipeline configuration combining all sub-configs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub dataset: DatasetConfig,

    #[serde(default)]
    pub transform: TransformConfig,

    #[serde(default)]
    pub images: ImageConfig,

    #[serde(default)]
    pub loss: LossConfig,
}

impl PipelineConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_dataset_config() {
        let config = DatasetConfig::default();
        assert_eq!(config.min_line_count, 15);
        assert_eq!(config.max_cluster_count, 15);
        assert!(config.background_classes.is_empty());
        assert!(!config.shuffle);
    }

    #[test]
    fn test_default_pipeline_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.transform.normalization_scale, 1.5);
        assert_eq!(config.images.pixel_len(), 224 * 224 * 3);
        assert_eq!(config.loss.loss_scale, 22_500.0);
        assert_eq!(config.loss.predicted_cluster_capacity, 15);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "dataset:\n  background_classes: [0, 20]\n  shuffle: true\n";
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();

        assert!(config.dataset.shuffle);
        assert!(config.dataset.is_background(20));
        assert!(!config.dataset.is_background(3));
        assert_eq!(config.dataset.min_line_count, 15);
        assert_eq!(config.transform.angle_deviation_deg, 20.0);
    }

    #[test]
    fn test_yaml_roundtrip_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");

        let mut config = PipelineConfig::default();
        config.dataset.max_cluster_count = 8;
        config.dataset.seed = Some(7);
        config.to_yaml(&path).unwrap();

        let loaded = PipelineConfig::from_yaml(&path).unwrap();
        assert_eq!(loaded.dataset.max_cluster_count, 8);
        assert_eq!(loaded.dataset.seed, Some(7));
    }
}
