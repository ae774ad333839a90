//! Instance IoU between ground-truth clusters and argmax predictions.

use std::collections::BTreeSet;

use rayon::prelude::*;

use crate::config::LossConfig;

use super::affinity::{divide_no_nan, AffinityError, InstancePredictions, Result};
use super::batching::Batch;

/// Number of predicted instance slots considered by default.
pub const PREDICTED_CLUSTER_CAPACITY: usize = 15;

/// Mean best-match IoU of ground-truth clusters.
///
/// Only valid, non-background lines take part. For each ground-truth cluster
/// the best IoU over predicted slots `0..capacity` is taken; the sum of those
/// is divided by the number of ground-truth clusters and averaged over the
/// batch.
#[derive(Debug, Clone)]
pub struct IouMetric {
    batch: usize,
    lines: usize,
    labels: Vec<i64>,
    foreground: Vec<bool>,
    capacity: usize,
}

impl IouMetric {
    pub fn new(labels: &[i64], valid: &[bool], background: &[bool], lines: usize) -> Result<Self> {
        let batch = if lines == 0 { 0 } else { labels.len() / lines };
        let expected = batch * lines;
        for (what, found) in [
            ("labels", labels.len()),
            ("valid mask", valid.len()),
            ("background mask", background.len()),
        ] {
            if found != expected {
                return Err(AffinityError::ShapeMismatch {
                    what,
                    expected,
                    found,
                });
            }
        }

        Ok(Self {
            batch,
            lines,
            labels: labels.to_vec(),
            foreground: valid
                .iter()
                .zip(background)
                .map(|(&v, &bg)| v && !bg)
                .collect(),
            capacity: PREDICTED_CLUSTER_CAPACITY,
        })
    }

    /// Stack the ground truth of several batches of equal size.
    pub fn from_batches(batches: &[Batch]) -> Result<Self> {
        let lines = batches.first().map_or(0, Batch::batch_size);
        let mut labels = Vec::new();
        let mut valid = Vec::new();
        let mut background = Vec::new();

        for batch in batches {
            if batch.batch_size() != lines {
                return Err(AffinityError::ShapeMismatch {
                    what: "batch size",
                    expected: lines,
                    found: batch.batch_size(),
                });
            }
            labels.extend_from_slice(&batch.labels);
            valid.extend_from_slice(&batch.valid_mask);
            background.extend_from_slice(&batch.background_mask);
        }

        Self::new(&labels, &valid, &background, lines)
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_config(self, config: &LossConfig) -> Self {
        self.with_capacity(config.predicted_cluster_capacity)
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Batch mean of the per-element IoU.
    pub fn evaluate(&self, predictions: &InstancePredictions) -> Result<f64> {
        let per_element = self.evaluate_elements(predictions)?;
        Ok(divide_no_nan(
            per_element.iter().sum(),
            per_element.len() as f64,
        ))
    }

    /// IoU of every batch element.
    pub fn evaluate_elements(&self, predictions: &InstancePredictions) -> Result<Vec<f64>> {
        if predictions.batch() != self.batch || predictions.lines() != self.lines {
            return Err(AffinityError::ShapeMismatch {
                what: "predictions",
                expected: self.batch * self.lines,
                found: predictions.batch() * predictions.lines(),
            });
        }

        Ok((0..self.batch)
            .into_par_iter()
            .map(|element| self.element_iou(predictions, element))
            .collect())
    }

    fn element_iou(&self, predictions: &InstancePredictions, element: usize) -> f64 {
        let range = element * self.lines..(element + 1) * self.lines;
        let labels = &self.labels[range.clone()];
        let foreground = &self.foreground[range];
        let predicted = predictions.argmax_labels(element);

        let clusters: BTreeSet<i64> = labels
            .iter()
            .zip(foreground)
            .filter(|&(_, &fg)| fg)
            .map(|(&label, _)| label)
            .collect();

        let total: f64 = clusters
            .iter()
            .map(|&cluster| {
                (0..self.capacity)
                    .map(|slot| {
                        let mut intersection = 0usize;
                        let mut union = 0usize;
                        for i in (0..self.lines).filter(|&i| foreground[i]) {
                            let in_gt = labels[i] == cluster;
                            let in_pred = predicted[i] == slot;
                            intersection += usize::from(in_gt && in_pred);
                            union += usize::from(in_gt || in_pred);
                        }
                        divide_no_nan(intersection as f64, union as f64)
                    })
                    .fold(0.0, f64::max)
            })
            .sum();

        divide_no_nan(total, clusters.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hot(slots: &[usize], classes: usize) -> InstancePredictions {
        let mut data = vec![0.0; slots.len() * classes];
        for (i, &slot) in slots.iter().enumerate() {
            data[i * classes + slot] = 1.0;
        }
        InstancePredictions::new(1, slots.len(), classes, data).unwrap()
    }

    #[test]
    fn test_exact_single_cluster() {
        let metric = IouMetric::new(&[3, 3], &[true; 2], &[false; 2], 2).unwrap();
        let preds = one_hot(&[0, 0], 4);
        assert_eq!(metric.evaluate(&preds).unwrap(), 1.0);
    }

    #[test]
    fn test_label_ids_do_not_matter() {
        let metric = IouMetric::new(&[8, 8, 2, 2], &[true; 4], &[false; 4], 4).unwrap();
        let preds = one_hot(&[5, 5, 1, 1], 6);
        assert_eq!(metric.evaluate(&preds).unwrap(), 1.0);
    }

    #[test]
    fn test_partial_overlap() {
        let metric = IouMetric::new(&[1, 1, 2, 2], &[true; 4], &[false; 4], 4).unwrap();
        let preds = one_hot(&[0, 0, 0, 1], 2);

        // Cluster 1 best matches slot 0 (2/3), cluster 2 slot 1 (1/2).
        let expected = (2.0 / 3.0 + 0.5) / 2.0;
        assert!((metric.evaluate(&preds).unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_background_and_padding_ignored() {
        let metric = IouMetric::new(
            &[1, 1, 9, 0],
            &[true, true, true, false],
            &[false, false, true, false],
            4,
        )
        .unwrap();
        let preds = one_hot(&[2, 2, 0, 0], 3);
        assert_eq!(metric.evaluate(&preds).unwrap(), 1.0);
    }

    #[test]
    fn test_no_foreground_is_zero() {
        let metric = IouMetric::new(&[1, 2], &[false; 2], &[false; 2], 2).unwrap();
        let preds = one_hot(&[0, 1], 2);
        assert_eq!(metric.evaluate(&preds).unwrap(), 0.0);
    }

    #[test]
    fn test_slots_beyond_capacity_never_match() {
        let metric = IouMetric::new(&[1, 1], &[true; 2], &[false; 2], 2)
            .unwrap()
            .with_capacity(2);
        let preds = one_hot(&[2, 2], 3);
        assert_eq!(metric.evaluate(&preds).unwrap(), 0.0);
    }

    #[test]
    fn test_batch_average() {
        let metric = IouMetric::new(&[1, 1, 1, 2], &[true; 4], &[false; 4], 2).unwrap();
        let preds =
            InstancePredictions::new(2, 2, 2, vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0])
                .unwrap();

        // Element 0 matches exactly; element 1 merges two clusters (1/2 each).
        let values = metric.evaluate_elements(&preds).unwrap();
        assert_eq!(values, vec![1.0, 0.5]);
        assert_eq!(metric.evaluate(&preds).unwrap(), 0.75);
    }

    #[test]
    fn test_default_capacity_from_config() {
        let metric = IouMetric::new(&[1], &[true], &[false], 1)
            .unwrap()
            .with_config(&LossConfig::default());
        assert_eq!(metric.capacity(), PREDICTED_CLUSTER_CAPACITY);
    }
}
