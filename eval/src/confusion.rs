// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Multi-label confusion counting
//!
//! Each sample contributes one outcome per label of the universe, so a
//! sample always adds exactly `|L|` to the total of its counts. Counts are
//! combined by pointwise addition, which makes aggregation independent of
//! sample order and batching.

use crate::labels::{LabelSet, LabelUniverse};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Confusion counts for one label or pooled over a label set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionCounts {
    /// Predicted and present in ground truth
    pub tp: usize,
    /// Predicted but absent from ground truth
    pub fp: usize,
    /// Present in ground truth but not predicted
    #[serde(rename = "fn")]
    pub fn_: usize,
    /// Neither predicted nor present
    pub tn: usize,
}

impl ConfusionCounts {
    pub fn new(tp: usize, fp: usize, fn_: usize, tn: usize) -> Self {
        Self { tp, fp, fn_, tn }
    }

    /// Outcome of a single label for a single sample
    pub fn for_label(label: &str, predicted: &LabelSet, truth: &LabelSet) -> Self {
        match (predicted.contains(label), truth.contains(label)) {
            (true, true) => Self::new(1, 0, 0, 0),
            (true, false) => Self::new(0, 1, 0, 0),
            (false, true) => Self::new(0, 0, 1, 0),
            (false, false) => Self::new(0, 0, 0, 1),
        }
    }

    /// Pooled counts of one sample over the universe
    ///
    /// Labels outside the universe do not contribute, so
    /// `total() == universe.len()` always holds.
    pub fn from_sets(predicted: &LabelSet, truth: &LabelSet, universe: &LabelUniverse) -> Self {
        universe
            .labels()
            .iter()
            .map(|label| Self::for_label(label, predicted, truth))
            .sum()
    }

    /// tp + fp + fn + tn
    pub fn total(&self) -> usize {
        self.tp + self.fp + self.fn_ + self.tn
    }
}

impl Add for ConfusionCounts {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            tp: self.tp + rhs.tp,
            fp: self.fp + rhs.fp,
            fn_: self.fn_ + rhs.fn_,
            tn: self.tn + rhs.tn,
        }
    }
}

impl AddAssign for ConfusionCounts {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for ConfusionCounts {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// Confusion counts kept separately for every label of the universe
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PerLabelCounts(BTreeMap<String, ConfusionCounts>);

impl PerLabelCounts {
    /// Zeroed counts, one entry per label
    pub fn new(universe: &LabelUniverse) -> Self {
        Self(
            universe
                .labels()
                .iter()
                .map(|label| (label.clone(), ConfusionCounts::default()))
                .collect(),
        )
    }

    /// Per-label outcomes of one sample
    pub fn from_sets(predicted: &LabelSet, truth: &LabelSet, universe: &LabelUniverse) -> Self {
        Self(
            universe
                .labels()
                .iter()
                .map(|label| (label.clone(), ConfusionCounts::for_label(label, predicted, truth)))
                .collect(),
        )
    }

    pub fn get(&self, label: &str) -> Option<&ConfusionCounts> {
        self.0.get(label)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfusionCounts)> {
        self.0.iter().map(|(label, counts)| (label.as_str(), counts))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Pool all labels into a single set of counts
    pub fn pooled(&self) -> ConfusionCounts {
        self.0.values().copied().sum()
    }

    /// Pointwise sum; labels only known to `other` are added
    pub fn merge(&mut self, other: &PerLabelCounts) {
        for (label, counts) in &other.0 {
            *self.0.entry(label.clone()).or_default() += *counts;
        }
    }
}

impl AddAssign<&PerLabelCounts> for PerLabelCounts {
    fn add_assign(&mut self, rhs: &PerLabelCounts) {
        self.merge(rhs);
    }
}

/// Pooled confusion counts of one sample
pub fn confusion(predicted: &LabelSet, truth: &LabelSet, universe: &LabelUniverse) -> ConfusionCounts {
    ConfusionCounts::from_sets(predicted, truth, universe)
}

/// Per-label confusion counts of one sample
pub fn per_label_confusion(predicted: &LabelSet, truth: &LabelSet, universe: &LabelUniverse) -> PerLabelCounts {
    PerLabelCounts::from_sets(predicted, truth, universe)
}
