//! Sampling lines from a frame and padding them into fixed-size batches.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Pixel};
use log::warn;
use rand::seq::SliceRandom;
use rand::Rng;
use thiserror::Error;

use crate::config::{ImageConfig, TransformConfig};
use crate::core::loaders::{Frame, GeometryMatrix};
use crate::core::transforms::{
    add_length, augment_flip, augment_global, normalize, sort_order_by_min_x, subtract_mean,
};

/// Width of the cluster-count one-hot vector.
pub const CLUSTER_ONE_HOT_WIDTH: usize = 31;

/// Cluster counts above this share the last one-hot slot.
pub const MAX_CLUSTER_INDEX: usize = CLUSTER_ONE_HOT_WIDTH - 1;

/// Errors raised while preparing batches.
#[derive(Error, Debug)]
pub enum BatchError {
    #[error("unsupported image channel count {0} (expected 1, 3 or 4)")]
    UnsupportedChannels(u32),
}

/// Stack of equally shaped images stored as `count × height × width × channels`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageStack {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
    pub data: Vec<f32>,
}

impl ImageStack {
    pub fn new(config: &ImageConfig) -> Self {
        Self {
            height: config.height,
            width: config.width,
            channels: config.channels,
            data: Vec::new(),
        }
    }

    /// Number of values per image.
    #[inline]
    pub fn image_len(&self) -> usize {
        self.height as usize * self.width as usize * self.channels as usize
    }

    /// Number of images in the stack.
    #[inline]
    pub fn len(&self) -> usize {
        match self.image_len() {
            0 => 0,
            n => self.data.len() / n,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn image(&self, index: usize) -> &[f32] {
        let n = self.image_len();
        &self.data[index * n..(index + 1) * n]
    }

    pub fn push(&mut self, pixels: &[f32]) {
        debug_assert_eq!(pixels.len(), self.image_len());
        self.data.extend_from_slice(pixels);
    }

    /// Images reordered to `indices`.
    pub fn select(&self, indices: &[usize]) -> Self {
        let mut out = Self {
            data: Vec::with_capacity(indices.len() * self.image_len()),
            ..self.clone_shape()
        };
        for &i in indices {
            out.data.extend_from_slice(self.image(i));
        }
        out
    }

    /// Append zero images until the stack holds `count` images.
    pub fn pad_to(&mut self, count: usize) {
        let target = count * self.image_len();
        if self.data.len() < target {
            self.data.resize(target, 0.0);
        }
    }

    fn clone_shape(&self) -> Self {
        Self {
            height: self.height,
            width: self.width,
            channels: self.channels,
            data: Vec::new(),
        }
    }
}

/// Loads virtual camera images, scaled to [-1, 1] and resized to a fixed shape.
#[derive(Debug, Clone)]
pub struct ImageLoader {
    config: ImageConfig,
}

impl ImageLoader {
    pub fn new(config: ImageConfig) -> Result<Self, BatchError> {
        match config.channels {
            1 | 3 | 4 => Ok(Self { config }),
            other => Err(BatchError::UnsupportedChannels(other)),
        }
    }

    #[inline]
    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Load one image. A missing or unreadable file yields an all-zero image.
    pub fn load(&self, path: &Path) -> Vec<f32> {
        let img = match image::open(path) {
            Ok(img) => img,
            Err(e) => {
                warn!("Virtual camera image not found at {}: {}", path.display(), e);
                return vec![0.0; self.config.pixel_len()];
            }
        };

        let (w, h) = (self.config.width, self.config.height);
        match self.config.channels {
            1 => rescale_pixels(img.to_luma32f(), w, h),
            4 => rescale_pixels(img.to_rgba32f(), w, h),
            _ => rescale_pixels(img.to_rgb32f(), w, h),
        }
    }

    /// Load a stack of images in order.
    pub fn load_stack(&self, paths: &[PathBuf]) -> ImageStack {
        let mut stack = ImageStack::new(&self.config);
        stack.data.reserve(paths.len() * self.config.pixel_len());
        for path in paths {
            stack.push(&self.load(path));
        }
        stack
    }
}

/// Resize in floating point, then map [0, 1] to [-1, 1].
///
/// Bilinear weights are non-negative and sum to one, so resizing before the
/// affine map equals resizing the mapped image without clamping at 0.
fn rescale_pixels<P>(img: ImageBuffer<P, Vec<f32>>, width: u32, height: u32) -> Vec<f32>
where
    P: Pixel<Subpixel = f32> + 'static,
{
    imageops::resize(&img, width, height, FilterType::Triangle)
        .into_raw()
        .into_iter()
        .map(|v| v * 2.0 - 1.0)
        .collect()
}

/// Lines drawn from one frame, before padding.
#[derive(Debug, Clone)]
pub struct FrameSample {
    pub line_count: usize,
    pub geometries: GeometryMatrix,
    pub labels: Vec<i64>,
    pub class_ids: Vec<i64>,
    pub image_paths: Vec<PathBuf>,
    pub images: Option<ImageStack>,
}

impl FrameSample {
    /// Reorder every column of the sample with the same permutation.
    pub fn reorder(&mut self, order: &[usize]) {
        self.geometries = self.geometries.select_rows(order);
        self.labels = order.iter().map(|&i| self.labels[i]).collect();
        self.class_ids = order.iter().map(|&i| self.class_ids[i]).collect();
        self.image_paths = order.iter().map(|&i| self.image_paths[i].clone()).collect();
        self.images = self.images.as_ref().map(|images| images.select(order));
    }
}

/// Draw up to `batch_size` lines from a frame.
///
/// A permutation of all line indices is truncated to
/// `min(batch_size, line_count)`; it is shuffled first when `shuffle` is set,
/// otherwise the leading lines are taken in file order. Images are loaded for
/// the selected lines when `images` is given.
pub fn sample_frame<R: Rng + ?Sized>(
    frame: &Frame,
    batch_size: usize,
    shuffle: bool,
    images: Option<&ImageLoader>,
    rng: &mut R,
) -> FrameSample {
    let count = batch_size.min(frame.line_count());

    let mut indices: Vec<usize> = (0..frame.line_count()).collect();
    if shuffle {
        indices.shuffle(rng);
    }
    indices.truncate(count);

    let image_paths: Vec<PathBuf> = indices
        .iter()
        .map(|&i| frame.image_paths[i].clone())
        .collect();
    let images = images.map(|loader| loader.load_stack(&image_paths));

    FrameSample {
        line_count: count,
        geometries: frame.geometries.select_rows(&indices),
        labels: indices.iter().map(|&i| frame.labels[i]).collect(),
        class_ids: indices.iter().map(|&i| frame.class_ids[i]).collect(),
        image_paths,
        images,
    }
}

/// Number of distinct instance labels among non-background lines.
pub fn cluster_count(labels: &[i64], class_ids: &[i64], background_classes: &[i64]) -> usize {
    labels
        .iter()
        .zip(class_ids)
        .filter(|&(_, class_id)| !background_classes.contains(class_id))
        .map(|(label, _)| *label)
        .collect::<BTreeSet<i64>>()
        .len()
}

/// One-hot encoding of a cluster count, clamped at [`MAX_CLUSTER_INDEX`].
pub fn cluster_one_hot(cluster_count: usize) -> [f32; CLUSTER_ONE_HOT_WIDTH] {
    let mut one_hot = [0.0f32; CLUSTER_ONE_HOT_WIDTH];
    one_hot[cluster_count.min(MAX_CLUSTER_INDEX)] = 1.0;
    one_hot
}

/// Normalize, extend and optionally augment and sort a sample.
///
/// The endpoints are centered on `mean` and scaled before the length column is
/// appended, so lengths are expressed in normalized units. Sorting reorders
/// labels, class ids and images together with the geometries.
pub fn prepare_sample<R: Rng + ?Sized>(
    mut sample: FrameSample,
    mean: &[f64; 3],
    transform: &TransformConfig,
    augment: bool,
    sort: bool,
    rng: &mut R,
) -> FrameSample {
    subtract_mean(&mut sample.geometries, mean);
    normalize(&mut sample.geometries, transform.normalization_scale);
    sample.geometries = add_length(&sample.geometries);

    if augment {
        augment_flip(&mut sample.geometries, rng);
        augment_global(
            &mut sample.geometries,
            transform.angle_deviation_deg.to_radians(),
            transform.offset_deviation,
            rng,
        );
    }

    if sort {
        let order = sort_order_by_min_x(&sample.geometries);
        sample.reorder(&order);
    }

    sample
}

/// Fixed-size batch handed to the model.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Number of leading rows holding real lines.
    pub line_count: usize,
    /// `batch_size` geometry rows; padding rows are zero.
    pub geometries: GeometryMatrix,
    pub labels: Vec<i64>,
    pub class_ids: Vec<i64>,
    /// True for the first `line_count` rows.
    pub valid_mask: Vec<bool>,
    /// True for valid rows whose class is a background class.
    pub background_mask: Vec<bool>,
    /// Images of all rows when loaded; padding images are zero.
    pub images: Option<ImageStack>,
    /// Distinct non-background instances among the valid rows.
    pub cluster_count: usize,
    pub cluster_one_hot: [f32; CLUSTER_ONE_HOT_WIDTH],
}

impl Batch {
    /// Number of rows, valid or padding.
    #[inline]
    pub fn batch_size(&self) -> usize {
        self.valid_mask.len()
    }
}

/// Pad a sample into a batch of `batch_size` rows.
pub fn pad_batch(sample: FrameSample, batch_size: usize, background_classes: &[i64]) -> Batch {
    debug_assert!(sample.line_count <= batch_size);
    let line_count = sample.line_count.min(batch_size);
    let width = sample.geometries.width();

    let mut geometries = GeometryMatrix::zeros(batch_size, width);
    let mut labels = vec![0i64; batch_size];
    let mut class_ids = vec![0i64; batch_size];
    let mut valid_mask = vec![false; batch_size];
    let mut background_mask = vec![false; batch_size];

    for i in 0..line_count {
        geometries.row_mut(i).copy_from_slice(sample.geometries.row(i));
        labels[i] = sample.labels[i];
        class_ids[i] = sample.class_ids[i];
        valid_mask[i] = true;
        background_mask[i] = background_classes.contains(&sample.class_ids[i]);
    }

    let clusters = cluster_count(
        &sample.labels[..line_count],
        &sample.class_ids[..line_count],
        background_classes,
    );

    let images = sample.images.map(|mut stack| {
        stack.pad_to(batch_size);
        stack
    });

    Batch {
        line_count,
        geometries,
        labels,
        class_ids,
        valid_mask,
        background_mask,
        images,
        cluster_count: clusters,
        cluster_one_hot: cluster_one_hot(clusters),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::loaders::{FEATURE_WIDTH, GEOMETRY_WIDTH, LENGTH};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::tempdir;

    fn make_frame(labels: &[i64], class_ids: &[i64]) -> Frame {
        let mut frame = Frame::empty("frame.txt");
        for (i, (&label, &class_id)) in labels.iter().zip(class_ids).enumerate() {
            let mut row = [0.0; GEOMETRY_WIDTH];
            row[0] = i as f64;
            row[3] = i as f64 + 3.0;
            row[4] = 4.0;
            frame.geometries.push_row(&row);
            frame.labels.push(label);
            frame.class_ids.push(class_id);
            frame.image_paths.push(PathBuf::from(format!("img_{}.png", i)));
        }
        frame
    }

    #[test]
    fn test_sample_frame_truncates_in_order() {
        let frame = make_frame(&[1, 2, 3, 4, 5], &[0; 5]);
        let mut rng = StdRng::seed_from_u64(0);

        let sample = sample_frame(&frame, 3, false, None, &mut rng);
        assert_eq!(sample.line_count, 3);
        assert_eq!(sample.labels, vec![1, 2, 3]);
        assert_eq!(sample.geometries.rows(), 3);
        assert_eq!(sample.image_paths[2], PathBuf::from("img_2.png"));
        assert!(sample.images.is_none());
    }

    #[test]
    fn test_sample_frame_shuffle_keeps_columns_aligned() {
        let frame = make_frame(&[10, 11, 12, 13, 14, 15], &[0, 1, 2, 3, 4, 5]);
        let mut rng = StdRng::seed_from_u64(9);

        let sample = sample_frame(&frame, 10, true, None, &mut rng);
        assert_eq!(sample.line_count, 6);
        let mut sorted = sample.labels.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![10, 11, 12, 13, 14, 15]);
        for i in 0..sample.line_count {
            let original = (sample.labels[i] - 10) as usize;
            assert_eq!(sample.class_ids[i], original as i64);
            assert_eq!(sample.geometries.get(i, 0), original as f64);
            assert_eq!(sample.image_paths[i], PathBuf::from(format!("img_{}.png", original)));
        }
    }

    #[test]
    fn test_sample_empty_frame() {
        let frame = Frame::empty("empty.txt");
        let sample = sample_frame(&frame, 8, true, None, &mut StdRng::seed_from_u64(1));
        assert_eq!(sample.line_count, 0);
        assert!(sample.labels.is_empty());
    }

    #[test]
    fn test_cluster_count_excludes_background() {
        let labels = [1, 1, 2, 3, 4];
        let classes = [5, 5, 0, 6, 0];
        assert_eq!(cluster_count(&labels, &classes, &[]), 4);
        assert_eq!(cluster_count(&labels, &classes, &[0]), 2);
        assert_eq!(cluster_count(&labels, &classes, &[0, 5, 6]), 0);
    }

    #[test]
    fn test_cluster_one_hot_clamps() {
        let one_hot = cluster_one_hot(5);
        assert_eq!(one_hot.len(), CLUSTER_ONE_HOT_WIDTH);
        assert_eq!(one_hot[5], 1.0);
        assert_eq!(one_hot.iter().sum::<f32>(), 1.0);

        let clamped = cluster_one_hot(45);
        assert_eq!(clamped[MAX_CLUSTER_INDEX], 1.0);
        assert_eq!(clamped.iter().sum::<f32>(), 1.0);
    }

    #[test]
    fn test_pad_batch_masks() {
        let frame = make_frame(&[1, 2, 2, 3], &[7, 0, 0, 7]);
        let sample = sample_frame(&frame, 6, false, None, &mut StdRng::seed_from_u64(0));
        let batch = pad_batch(sample, 6, &[0]);

        assert_eq!(batch.batch_size(), 6);
        assert_eq!(batch.valid_mask, vec![true, true, true, true, false, false]);
        assert_eq!(batch.valid_mask.iter().filter(|&&v| v).count(), 4);
        // Padding rows carry class id 0, which is a background class, yet stay false.
        assert_eq!(batch.background_mask, vec![false, true, true, false, false, false]);
        assert_eq!(batch.cluster_count, 2);
        assert_eq!(batch.cluster_one_hot[2], 1.0);
        assert_eq!(batch.geometries.rows(), 6);
        assert!(batch.geometries.row(5).iter().all(|&v| v == 0.0));
        assert_eq!(batch.labels[4], 0);
    }

    #[test]
    fn test_prepare_sample_orders_transforms() {
        let frame = make_frame(&[1, 2], &[0, 0]);
        let sample = sample_frame(&frame, 2, false, None, &mut StdRng::seed_from_u64(0));
        let transform = TransformConfig {
            normalization_scale: 2.0,
            ..TransformConfig::default()
        };

        let prepared = prepare_sample(
            sample,
            &[1.0, 0.0, 0.0],
            &transform,
            false,
            false,
            &mut StdRng::seed_from_u64(0),
        );

        assert_eq!(prepared.geometries.width(), FEATURE_WIDTH);
        // Row 1: start (1,0,0) end (4,4,0) -> centered (0,0,0),(3,4,0) -> scaled by 2.
        assert_eq!(prepared.geometries.get(1, 0), 0.0);
        assert_eq!(prepared.geometries.get(1, 3), 1.5);
        assert!((prepared.geometries.get(1, LENGTH) - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_prepare_sample_sort_reorders_everything() {
        let mut frame = make_frame(&[1, 2, 3], &[4, 5, 6]);
        // Reverse x so sorting must reorder the lines.
        for i in 0..3 {
            let row = frame.geometries.row_mut(i);
            row[0] = 10.0 - i as f64;
            row[3] = 20.0;
        }
        let mut sample = sample_frame(&frame, 3, false, None, &mut StdRng::seed_from_u64(0));
        let mut stack = ImageStack::new(&ImageConfig {
            height: 1,
            width: 1,
            channels: 1,
        });
        for v in [0.1f32, 0.2, 0.3] {
            stack.push(&[v]);
        }
        sample.images = Some(stack);

        let prepared = prepare_sample(
            sample,
            &[0.0; 3],
            &TransformConfig::default(),
            false,
            true,
            &mut StdRng::seed_from_u64(0),
        );

        assert_eq!(prepared.labels, vec![3, 2, 1]);
        assert_eq!(prepared.class_ids, vec![6, 5, 4]);
        assert_eq!(prepared.image_paths[0], PathBuf::from("img_2.png"));
        assert_eq!(prepared.images.unwrap().data, vec![0.3, 0.2, 0.1]);
    }

    #[test]
    fn test_missing_image_is_zero_placeholder() {
        let dir = tempdir().unwrap();
        let loader = ImageLoader::new(ImageConfig {
            height: 4,
            width: 5,
            channels: 3,
        })
        .unwrap();

        let pixels = loader.load(&dir.path().join("missing.png"));
        assert_eq!(pixels.len(), 4 * 5 * 3);
        assert!(pixels.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_image_loader_rescales_and_resizes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("white.png");
        image::RgbImage::from_pixel(8, 6, image::Rgb([255, 255, 255]))
            .save(&path)
            .unwrap();

        let loader = ImageLoader::new(ImageConfig {
            height: 3,
            width: 4,
            channels: 3,
        })
        .unwrap();
        let pixels = loader.load(&path);

        assert_eq!(pixels.len(), 3 * 4 * 3);
        assert!(pixels.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_image_loader_interpolates_in_float() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("edge.png");
        image::GrayImage::from_raw(2, 1, vec![0, 255])
            .unwrap()
            .save(&path)
            .unwrap();

        let loader = ImageLoader::new(ImageConfig {
            height: 1,
            width: 3,
            channels: 1,
        })
        .unwrap();
        let pixels = loader.load(&path);

        assert_eq!(pixels.len(), 3);
        // The middle sample sits halfway between black and white.
        assert!(pixels[1].abs() < 1e-6);
        assert!(pixels[0] < pixels[1] && pixels[1] < pixels[2]);
    }

    #[test]
    fn test_image_loader_rejects_channels() {
        assert!(ImageLoader::new(ImageConfig {
            height: 2,
            width: 2,
            channels: 2,
        })
        .is_err());
    }

    #[test]
    fn test_pad_batch_pads_images() {
        let frame = make_frame(&[1, 2], &[0, 0]);
        let loader = ImageLoader::new(ImageConfig {
            height: 2,
            width: 2,
            channels: 1,
        })
        .unwrap();
        let sample = sample_frame(&frame, 4, false, Some(&loader), &mut StdRng::seed_from_u64(0));
        let batch = pad_batch(sample, 4, &[]);

        let images = batch.images.unwrap();
        assert_eq!(images.len(), 4);
        assert!(images.image(3).iter().all(|&v| v == 0.0));
    }
}
