// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Quality metrics for multi-label allergen prediction
//!
//! Implements:
//! - Precision, Recall, FNR (pooled over labels and samples)
//! - Micro F1 and Macro F1 (per-label, equally weighted)
//! - Hamming loss
//! - Exact-match ratio (sample-level subset accuracy)
//!
//! Every ratio falls back to 0.0 when its denominator is zero.

use crate::confusion::{ConfusionCounts, PerLabelCounts};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// num / den clamped to [0, 1], 0.0 for an empty denominator
pub(crate) fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        return 0.0;
    }
    (num as f64 / den as f64).clamp(0.0, 1.0)
}

impl ConfusionCounts {
    /// Precision: TP / (TP + FP)
    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    /// Recall: TP / (TP + FN)
    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    /// F1: 2TP / (2TP + FP + FN)
    pub fn f1_score(&self) -> f64 {
        ratio(2 * self.tp, 2 * self.tp + self.fp + self.fn_)
    }

    /// False negative rate: FN / (TP + FN)
    pub fn fnr(&self) -> f64 {
        ratio(self.fn_, self.tp + self.fn_)
    }

    /// Label-level accuracy: (TP + TN) / Total
    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.total())
    }
}

/// Metrics for a single label
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    /// Samples whose ground truth contains the label
    pub support: usize,
}

impl From<&ConfusionCounts> for LabelMetrics {
    fn from(counts: &ConfusionCounts) -> Self {
        Self {
            precision: counts.precision(),
            recall: counts.recall(),
            f1_score: counts.f1_score(),
            support: counts.tp + counts.fn_,
        }
    }
}

/// Aggregate quality metrics of one model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1_micro: f64,
    pub f1_macro: f64,
    pub hamming_loss: f64,
    pub fnr: f64,
    pub exact_match_ratio: f64,
    pub per_label: BTreeMap<String, LabelMetrics>,
}

impl QualityMetrics {
    /// Derive quality metrics from accumulated counts
    ///
    /// `samples == 0` yields the all-zero metrics object.
    pub fn compute(
        totals: &ConfusionCounts,
        per_label: &PerLabelCounts,
        exact_matches: usize,
        samples: usize,
        universe_size: usize,
    ) -> Self {
        let per_label_metrics: BTreeMap<String, LabelMetrics> = per_label
            .iter()
            .map(|(label, counts)| (label.to_string(), LabelMetrics::from(counts)))
            .collect();

        if samples == 0 {
            return Self {
                per_label: per_label_metrics,
                ..Self::default()
            };
        }

        let f1_macro = if per_label_metrics.is_empty() {
            0.0
        } else {
            let sum: f64 = per_label_metrics.values().map(|m| m.f1_score).sum();
            (sum / per_label_metrics.len() as f64).clamp(0.0, 1.0)
        };

        Self {
            precision: totals.precision(),
            recall: totals.recall(),
            f1_micro: totals.f1_score(),
            f1_macro,
            hamming_loss: ratio(totals.fp + totals.fn_, samples * universe_size),
            fnr: totals.fnr(),
            exact_match_ratio: ratio(exact_matches, samples),
            per_label: per_label_metrics,
        }
    }

    /// Format as a human-readable string
    pub fn format(&self) -> String {
        let mut output = format!(
            r#"Quality Metrics
===============
Precision:         {:.4}
Recall:            {:.4}
F1 (micro):        {:.4}
F1 (macro):        {:.4}
Hamming Loss:      {:.4}
FNR:               {:.4}
Exact Match:       {:.4} ({:.2}%)
"#,
            self.precision,
            self.recall,
            self.f1_micro,
            self.f1_macro,
            self.hamming_loss,
            self.fnr,
            self.exact_match_ratio,
            self.exact_match_ratio * 100.0,
        );

        output.push_str("\nPer-Label Metrics:\n");
        for (label, metrics) in &self.per_label {
            output.push_str(&format!(
                "  {:<10} P={:.4} R={:.4} F1={:.4} (n={})\n",
                label, metrics.precision, metrics.recall, metrics.f1_score, metrics.support
            ));
        }

        output
    }
}
