use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::training::config::default_thresholds;
use crate::types::InstanceMask;

/// Ordered IoU cutoffs a match has to reach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdList(Vec<f64>);

impl ThresholdList {
    pub fn new(thresholds: Vec<f64>) -> Result<Self> {
        if thresholds.is_empty() {
            return Err(Error::InvalidConfig("threshold list is empty".to_string()));
        }
        if let Some(t) = thresholds.iter().find(|t| !(0.0..=1.0).contains(*t)) {
            return Err(Error::InvalidConfig(format!("threshold {} outside [0, 1]", t)));
        }
        Ok(Self(thresholds))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

impl Default for ThresholdList {
    fn default() -> Self {
        Self(default_thresholds())
    }
}

/// True/false positive and false negative counts, one entry per threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionCounts {
    pub true_positives: Vec<u64>,
    pub false_positives: Vec<u64>,
    pub false_negatives: Vec<u64>,
}

impl ConfusionCounts {
    pub fn zeros(thresholds: usize) -> Self {
        Self {
            true_positives: vec![0; thresholds],
            false_positives: vec![0; thresholds],
            false_negatives: vec![0; thresholds],
        }
    }

    pub fn len(&self) -> usize {
        self.true_positives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.true_positives.is_empty()
    }

    pub fn add(&mut self, other: &ConfusionCounts) {
        assert_eq!(self.len(), other.len(), "confusion counts over different thresholds");
        for i in 0..self.len() {
            self.true_positives[i] += other.true_positives[i];
            self.false_positives[i] += other.false_positives[i];
            self.false_negatives[i] += other.false_negatives[i];
        }
    }

    /// Elementwise sum. Associative and commutative.
    pub fn merge(mut self, other: ConfusionCounts) -> Self {
        self.add(&other);
        self
    }

    /// Mean over thresholds of `tp / (tp + fp + fn)`.
    ///
    /// Thresholds with nothing to count are skipped; `None` when every
    /// threshold is empty, i.e. no predictions and no ground truth.
    pub fn image_score(&self) -> Option<f64> {
        let ratios: Vec<f64> = (0..self.len())
            .filter_map(|i| {
                let tp = self.true_positives[i];
                let total = tp + self.false_positives[i] + self.false_negatives[i];
                (total > 0).then(|| tp as f64 / total as f64)
            })
            .collect();
        if ratios.is_empty() {
            None
        } else {
            Some(ratios.iter().sum::<f64>() / ratios.len() as f64)
        }
    }

    /// Score over counts accumulated across a whole dataset.
    pub fn mean_iou(&self) -> Option<f64> {
        self.image_score()
    }
}

/// Pairwise IoU, indexed `[prediction][ground_truth]`.
pub fn iou_matrix(predicted: &[InstanceMask], ground_truth: &[InstanceMask]) -> Vec<Vec<f64>> {
    predicted
        .iter()
        .map(|p| ground_truth.iter().map(|g| p.iou(g)).collect())
        .collect()
}

/// Greedy one-to-one matching at every threshold.
///
/// Eligible pairs (`iou >= threshold` and `iou > 0`) are taken by IoU
/// descending, ties broken by prediction index then ground truth index.
pub fn score(
    thresholds: &ThresholdList,
    predicted: &[InstanceMask],
    ground_truth: &[InstanceMask],
) -> ConfusionCounts {
    let ious = iou_matrix(predicted, ground_truth);

    let mut pairs: Vec<(f64, usize, usize)> = Vec::new();
    for (p, row) in ious.iter().enumerate() {
        for (g, &iou) in row.iter().enumerate() {
            if iou > 0.0 {
                pairs.push((iou, p, g));
            }
        }
    }
    pairs.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(Ordering::Equal)
            .then(a.1.cmp(&b.1))
            .then(a.2.cmp(&b.2))
    });

    let mut counts = ConfusionCounts::zeros(thresholds.len());
    for (i, &threshold) in thresholds.as_slice().iter().enumerate() {
        let mut pred_used = vec![false; predicted.len()];
        let mut gt_used = vec![false; ground_truth.len()];
        let mut matched = 0u64;
        // sorted descending, so the first pair below the cutoff ends the scan
        for &(iou, p, g) in pairs.iter().take_while(|(iou, _, _)| *iou >= threshold) {
            debug_assert!(iou > 0.0);
            if pred_used[p] || gt_used[g] {
                continue;
            }
            pred_used[p] = true;
            gt_used[g] = true;
            matched += 1;
        }
        counts.true_positives[i] = matched;
        counts.false_positives[i] = predicted.len() as u64 - matched;
        counts.false_negatives[i] = ground_truth.len() as u64 - matched;
    }
    counts
}
