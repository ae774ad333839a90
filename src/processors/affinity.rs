//! Pairwise affinity loss and metrics for instance predictions.
//!
//! Predictions assign every line a soft distribution over instance slots.
//! Two lines are compared when both are valid, neither is background and they
//! are distinct. Lines sharing a ground-truth label are pulled together by
//! their divergence; lines with different labels are pushed apart up to a
//! margin.
//!
//! Uses:
//! - `rayon` for per-element evaluation across the batch

use rayon::prelude::*;
use thiserror::Error;

use crate::config::LossConfig;

use super::batching::Batch;

/// Errors raised while evaluating losses and metrics.
#[derive(Error, Debug)]
pub enum AffinityError {
    #[error("shape mismatch for {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("prediction class axis is empty")]
    EmptyClassAxis,
}

/// Result type for affinity operations.
pub type Result<T> = std::result::Result<T, AffinityError>;

/// Division yielding 0 when the denominator is 0.
#[inline]
pub fn divide_no_nan(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Index of the first maximum of a row.
fn argmax(row: &[f64]) -> usize {
    let mut best = 0;
    for (i, &v) in row.iter().enumerate().skip(1) {
        if v > row[best] {
            best = i;
        }
    }
    best
}

/// Soft instance assignments stored as `batch × lines × classes`.
#[derive(Debug, Clone, PartialEq)]
pub struct InstancePredictions {
    batch: usize,
    lines: usize,
    classes: usize,
    data: Vec<f64>,
}

impl InstancePredictions {
    pub fn new(batch: usize, lines: usize, classes: usize, data: Vec<f64>) -> Result<Self> {
        if classes == 0 {
            return Err(AffinityError::EmptyClassAxis);
        }
        let expected = batch * lines * classes;
        if data.len() != expected {
            return Err(AffinityError::ShapeMismatch {
                what: "predictions",
                expected,
                found: data.len(),
            });
        }
        Ok(Self {
            batch,
            lines,
            classes,
            data,
        })
    }

    #[inline]
    pub fn batch(&self) -> usize {
        self.batch
    }

    #[inline]
    pub fn lines(&self) -> usize {
        self.lines
    }

    #[inline]
    pub fn classes(&self) -> usize {
        self.classes
    }

    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Distribution of one line.
    #[inline]
    pub fn row(&self, element: usize, line: usize) -> &[f64] {
        let start = (element * self.lines + line) * self.classes;
        &self.data[start..start + self.classes]
    }

    /// Most likely instance slot of one line. Ties resolve to the lowest slot.
    #[inline]
    pub fn argmax(&self, element: usize, line: usize) -> usize {
        argmax(self.row(element, line))
    }

    /// Most likely instance slot of every line of one element.
    pub fn argmax_labels(&self, element: usize) -> Vec<usize> {
        (0..self.lines).map(|line| self.argmax(element, line)).collect()
    }
}

/// Comparable-pair and same-label masks, each `batch × lines × lines`.
#[derive(Debug, Clone)]
pub struct PairMasks {
    batch: usize,
    lines: usize,
    labels: Vec<i64>,
    valid: Vec<bool>,
    background: Vec<bool>,
    comparable: Vec<bool>,
    same_label: Vec<bool>,
}

impl PairMasks {
    /// Build masks from flattened `batch × lines` ground truth.
    ///
    /// A pair `(i, j)` is comparable when `i != j` and both lines are valid
    /// and not background.
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

        let mut comparable = vec![false; batch * lines * lines];
        let mut same_label = vec![false; batch * lines * lines];
        for e in 0..batch {
            let base = e * lines;
            for i in 0..lines {
                let usable_i = valid[base + i] && !background[base + i];
                for j in 0..lines {
                    let pair = (base + i) * lines + j;
                    same_label[pair] = labels[base + i] == labels[base + j];
                    comparable[pair] =
                        usable_i && i != j && valid[base + j] && !background[base + j];
                }
            }
        }

        Ok(Self {
            batch,
            lines,
            labels: labels.to_vec(),
            valid: valid.to_vec(),
            background: background.to_vec(),
            comparable,
            same_label,
        })
    }

    /// Stack the ground truth of several batches of equal size.
    pub fn from_batches(batches: &[Batch]) -> Result<Self> {
        let lines = batches.first().map_or(0, Batch::batch_size);
        let mut labels = Vec::with_capacity(batches.len() * lines);
        let mut valid = Vec::with_capacity(batches.len() * lines);
        let mut background = Vec::with_capacity(batches.len() * lines);

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

    #[inline]
    pub fn batch(&self) -> usize {
        self.batch
    }

    #[inline]
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Ground-truth labels of one element.
    #[inline]
    pub fn labels(&self, element: usize) -> &[i64] {
        &self.labels[element * self.lines..(element + 1) * self.lines]
    }

    /// Whether a line is valid and not background.
    #[inline]
    pub fn is_foreground(&self, element: usize, line: usize) -> bool {
        let index = element * self.lines + line;
        self.valid[index] && !self.background[index]
    }

    #[inline]
    pub fn is_comparable(&self, element: usize, i: usize, j: usize) -> bool {
        self.comparable[self.pair_index(element, i, j)]
    }

    #[inline]
    pub fn is_same_label(&self, element: usize, i: usize, j: usize) -> bool {
        self.same_label[self.pair_index(element, i, j)]
    }

    /// Number of comparable ordered pairs of one element.
    pub fn comparable_pairs(&self, element: usize) -> usize {
        let n = self.lines * self.lines;
        self.comparable[element * n..(element + 1) * n]
            .iter()
            .filter(|&&c| c)
            .count()
    }

    #[inline]
    fn pair_index(&self, element: usize, i: usize, j: usize) -> usize {
        (element * self.lines + i) * self.lines + j
    }

    fn check(&self, predictions: &InstancePredictions) -> Result<()> {
        if predictions.batch() != self.batch {
            return Err(AffinityError::ShapeMismatch {
                what: "prediction batch",
                expected: self.batch,
                found: predictions.batch(),
            });
        }
        if predictions.lines() != self.lines {
            return Err(AffinityError::ShapeMismatch {
                what: "prediction lines",
                expected: self.lines,
                found: predictions.lines(),
            });
        }
        Ok(())
    }
}

/// Margin loss on the cross divergence of line distributions.
///
/// For a comparable pair the divergence is
/// `d(i, j) = Σ_k p_i[k] · ln(p_i[k] / (p_j[k] + ε) + ε)` with a zero-safe
/// division. Same-label pairs contribute `d`, different-label pairs
/// `max(0, margin - d)`. The per-element sum is divided by the number of
/// comparable pairs and multiplied by `loss_scale`.
#[derive(Debug, Clone)]
pub struct KlCrossDivergenceLoss {
    masks: PairMasks,
    config: LossConfig,
}

impl KlCrossDivergenceLoss {
    pub fn new(masks: PairMasks, config: LossConfig) -> Self {
        Self { masks, config }
    }

    #[inline]
    pub fn masks(&self) -> &PairMasks {
        &self.masks
    }

    /// Divergence of distribution `p` from `q`.
    pub fn divergence(&self, p: &[f64], q: &[f64]) -> f64 {
        let eps = self.config.epsilon;
        p.iter()
            .zip(q)
            .map(|(&pk, &qk)| pk * (divide_no_nan(pk, qk + eps) + eps).ln())
            .sum()
    }

    /// Loss of every batch element.
    pub fn evaluate(&self, predictions: &InstancePredictions) -> Result<Vec<f64>> {
        self.masks.check(predictions)?;

        Ok((0..self.masks.batch())
            .into_par_iter()
            .map(|element| self.element_loss(predictions, element))
            .collect())
    }

    /// Mean loss over the batch; 0 for an empty batch.
    pub fn evaluate_mean(&self, predictions: &InstancePredictions) -> Result<f64> {
        let losses = self.evaluate(predictions)?;
        Ok(divide_no_nan(losses.iter().sum(), losses.len() as f64))
    }

    fn element_loss(&self, predictions: &InstancePredictions, element: usize) -> f64 {
        let lines = self.masks.lines();
        let mut total = 0.0;
        let mut pairs = 0usize;

        for i in 0..lines {
            for j in 0..lines {
                if !self.masks.is_comparable(element, i, j) {
                    continue;
                }
                let d = self.divergence(predictions.row(element, i), predictions.row(element, j));
                total += if self.masks.is_same_label(element, i, j) {
                    d
                } else {
                    (self.config.margin - d).max(0.0)
                };
                pairs += 1;
            }
        }

        divide_no_nan(total, pairs as f64) * self.config.loss_scale
    }
}

/// Pair counts of one element under argmax predictions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairCounts {
    pub true_positive: usize,
    pub true_negative: usize,
    pub gt_positive: usize,
    pub gt_negative: usize,
    pub pred_positive: usize,
    pub pred_negative: usize,
}

impl PairCounts {
    fn count(masks: &PairMasks, predictions: &InstancePredictions, element: usize) -> Self {
        let predicted = predictions.argmax_labels(element);
        let mut counts = Self::default();

        for i in 0..masks.lines() {
            for j in 0..masks.lines() {
                if !masks.is_comparable(element, i, j) {
                    continue;
                }
                let same_gt = masks.is_same_label(element, i, j);
                let same_pred = predicted[i] == predicted[j];

                if same_gt {
                    counts.gt_positive += 1;
                } else {
                    counts.gt_negative += 1;
                }
                if same_pred {
                    counts.pred_positive += 1;
                } else {
                    counts.pred_negative += 1;
                }
                match (same_gt, same_pred) {
                    (true, true) => counts.true_positive += 1,
                    (false, false) => counts.true_negative += 1,
                    _ => {}
                }
            }
        }

        counts
    }
}

/// Pairwise recall and precision of same-instance and different-instance
/// decisions, averaged over the batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PairwiseMetrics {
    /// True positives over ground-truth positives.
    pub tp_gt_p: f64,
    /// True negatives over ground-truth negatives.
    pub tn_gt_n: f64,
    /// True positives over predicted positives.
    pub tp_pd_p: f64,
    /// True negatives over predicted negatives.
    pub tn_pd_n: f64,
}

impl PairwiseMetrics {
    pub fn evaluate(masks: &PairMasks, predictions: &InstancePredictions) -> Result<Self> {
        masks.check(predictions)?;

        let counts: Vec<PairCounts> = (0..masks.batch())
            .into_par_iter()
            .map(|element| PairCounts::count(masks, predictions, element))
            .collect();

        let mean = |ratio: fn(&PairCounts) -> f64| -> f64 {
            divide_no_nan(counts.iter().map(ratio).sum(), counts.len() as f64)
        };

        Ok(Self {
            tp_gt_p: mean(|c| divide_no_nan(c.true_positive as f64, c.gt_positive as f64)),
            tn_gt_n: mean(|c| divide_no_nan(c.true_negative as f64, c.gt_negative as f64)),
            tp_pd_p: mean(|c| divide_no_nan(c.true_positive as f64, c.pred_positive as f64)),
            tn_pd_n: mean(|c| divide_no_nan(c.true_negative as f64, c.pred_negative as f64)),
        })
    }
}

/// Per-line summaries of a prediction tensor over its class axis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugStatistics {
    pub sum: Vec<f64>,
    pub l1: Vec<f64>,
    pub std: Vec<f64>,
    pub max: Vec<f64>,
    pub min: Vec<f64>,
}

impl DebugStatistics {
    pub fn from_predictions(predictions: &InstancePredictions) -> Self {
        let rows: Vec<[f64; 5]> = predictions
            .as_slice()
            .par_chunks(predictions.classes())
            .map(row_statistics)
            .collect();

        let mut stats = Self::default();
        for [sum, l1, std, max, min] in rows {
            stats.sum.push(sum);
            stats.l1.push(l1);
            stats.std.push(std);
            stats.max.push(max);
            stats.min.push(min);
        }
        stats
    }
}

fn row_statistics(row: &[f64]) -> [f64; 5] {
    let n = row.len() as f64;
    let sum: f64 = row.iter().sum();
    let l1: f64 = row.iter().map(|v| v.abs()).sum();
    let mean = sum / n;
    // Population standard deviation.
    let variance = row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let min = row.iter().copied().fold(f64::INFINITY, f64::min);
    [sum, l1, variance.sqrt(), max, min]
}
