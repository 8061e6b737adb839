// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Multi-label evaluation engine for allergen prediction models
//!
//! This crate provides:
//! - Label universe and free-text allergen normalisation
//! - Per-sample and per-label confusion counting
//! - Quality metrics (Precision, Recall, micro/macro F1, Hamming loss, FNR, exact match)
//! - Safety metrics (hallucination, over-prediction, abstention accuracy)
//! - Per-model aggregation and cross-model ranking
//! - Reproducible evaluation pipeline with seeded synthetic runs

pub mod aggregate;
pub mod confusion;
pub mod error;
pub mod labels;
pub mod metrics;
pub mod pipeline;
pub mod ranking;
pub mod records;
pub mod safety;

pub use aggregate::{aggregate, Aggregator, EfficiencyMetrics, ModelAccumulator, ModelAggregateMetrics};
pub use confusion::{confusion, per_label_confusion, ConfusionCounts, PerLabelCounts};
pub use error::{EnvelopeError, RecordError};
pub use labels::{LabelSet, LabelUniverse, ALLERGENS};
pub use metrics::{LabelMetrics, QualityMetrics};
pub use pipeline::{EvaluationConfig, EvaluationPipeline, EvaluationResults, ModelInput};
pub use ranking::{rank, Badge, BadgeTier, MetricRank, ModelRanking, RankedMetric};
pub use records::{EfficiencySample, InferenceOutput, RawRecord, SampleRecord};
pub use safety::{has_over_prediction, KeywordLexicon, SafetyCounts, SafetyMetrics};
