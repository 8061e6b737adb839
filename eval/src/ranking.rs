// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Cross-model ranking
//!
//! Rankings are a pure function of a snapshot of model aggregates and are
//! recomputed whenever the compared set changes.

use crate::aggregate::ModelAggregateMetrics;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Models with fewer scored samples are left out of rankings
pub const DEFAULT_MIN_SAMPLES: usize = 10;

const STRENGTH_COUNT: usize = 3;
const WEAKNESS_COUNT: usize = 3;

/// A metric models are compared on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankedMetric {
    /// Exact-match ratio
    Accuracy,
    Precision,
    Recall,
    Latency,
    Ttft,
    OutputThroughput,
    Memory,
    HallucinationRate,
    Fnr,
    OverPredictionRate,
}

impl RankedMetric {
    pub const ALL: [RankedMetric; 10] = [
        RankedMetric::Accuracy,
        RankedMetric::Precision,
        RankedMetric::Recall,
        RankedMetric::Latency,
        RankedMetric::Ttft,
        RankedMetric::OutputThroughput,
        RankedMetric::Memory,
        RankedMetric::HallucinationRate,
        RankedMetric::Fnr,
        RankedMetric::OverPredictionRate,
    ];

    pub fn higher_is_better(self) -> bool {
        matches!(
            self,
            RankedMetric::Accuracy | RankedMetric::Precision | RankedMetric::Recall | RankedMetric::OutputThroughput
        )
    }

    /// Value of this metric for a model, if it was measured
    pub fn value(self, m: &ModelAggregateMetrics) -> Option<f64> {
        let value = match self {
            RankedMetric::Accuracy => Some(m.quality.exact_match_ratio),
            RankedMetric::Precision => Some(m.quality.precision),
            RankedMetric::Recall => Some(m.quality.recall),
            RankedMetric::Latency => m.efficiency.avg_latency_ms,
            RankedMetric::Ttft => m.efficiency.avg_ttft_ms,
            RankedMetric::OutputThroughput => m.efficiency.avg_output_tps,
            RankedMetric::Memory => m.efficiency.avg_memory_mb,
            RankedMetric::HallucinationRate => Some(m.safety.hallucination_rate),
            RankedMetric::Fnr => Some(m.quality.fnr),
            RankedMetric::OverPredictionRate => Some(m.safety.over_prediction_rate),
        };
        value.filter(|v| v.is_finite())
    }

    /// Badge title for badge-worthy metrics
    pub fn badge_title(self) -> Option<&'static str> {
        match self {
            RankedMetric::Accuracy => Some("Most Accurate"),
            RankedMetric::Latency => Some("Fastest"),
            RankedMetric::Memory => Some("Lightest"),
            RankedMetric::HallucinationRate => Some("Most Grounded"),
            RankedMetric::Fnr => Some("Fewest Missed Allergens"),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RankedMetric::Accuracy => "Accuracy",
            RankedMetric::Precision => "Precision",
            RankedMetric::Recall => "Recall",
            RankedMetric::Latency => "Latency",
            RankedMetric::Ttft => "TTFT",
            RankedMetric::OutputThroughput => "Output Throughput",
            RankedMetric::Memory => "Memory",
            RankedMetric::HallucinationRate => "Hallucination Rate",
            RankedMetric::Fnr => "FNR",
            RankedMetric::OverPredictionRate => "Over-prediction Rate",
        }
    }

    /// Best-first ordering of two values
    fn compare(self, a: f64, b: f64) -> Ordering {
        let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        if self.higher_is_better() {
            ord.reverse()
        } else {
            ord
        }
    }
}

impl fmt::Display for RankedMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A model's position on one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRank {
    pub metric: RankedMetric,
    /// 1-based rank
    pub rank: usize,
    /// Number of models ranked on this metric
    pub out_of: usize,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BadgeTier {
    Gold,
    Silver,
}

/// Awarded for rank 1 or 2 on a badge-worthy metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Badge {
    pub metric: RankedMetric,
    pub tier: BadgeTier,
    pub title: String,
}

/// Ranking view of one model against the compared set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRanking {
    pub model_key: String,
    pub display_name: String,
    pub ranks: Vec<MetricRank>,
    pub strengths: Vec<RankedMetric>,
    pub weaknesses: Vec<RankedMetric>,
    pub badges: Vec<Badge>,
}

impl ModelRanking {
    pub fn rank_of(&self, metric: RankedMetric) -> Option<usize> {
        self.ranks.iter().find(|r| r.metric == metric).map(|r| r.rank)
    }
}

/// Rank every model with at least `min_samples` scored samples
///
/// Ties keep input order and still get distinct ranks. Models below the
/// threshold receive no entry at all.
pub fn rank(models: &[ModelAggregateMetrics], min_samples: usize) -> BTreeMap<String, ModelRanking> {
    let eligible: Vec<&ModelAggregateMetrics> = models
        .iter()
        .filter(|m| {
            let keep = m.prediction_count >= min_samples;
            if !keep {
                tracing::debug!(
                    "Excluding {} from ranking: {} samples < {}",
                    m.model_key,
                    m.prediction_count,
                    min_samples
                );
            }
            keep
        })
        .collect();

    let mut ranks: Vec<Vec<MetricRank>> = vec![Vec::new(); eligible.len()];
    for metric in RankedMetric::ALL {
        let mut scored: Vec<(usize, f64)> = eligible
            .iter()
            .enumerate()
            .filter_map(|(idx, m)| metric.value(m).map(|v| (idx, v)))
            .collect();
        // stable: equal values keep input order
        scored.sort_by(|a, b| metric.compare(a.1, b.1));

        let out_of = scored.len();
        for (position, (idx, value)) in scored.into_iter().enumerate() {
            ranks[idx].push(MetricRank {
                metric,
                rank: position + 1,
                out_of,
                value,
            });
        }
    }

    let compared = eligible.len();
    eligible
        .into_iter()
        .zip(ranks)
        .map(|(model, ranks)| {
            let ranking = build_ranking(model, ranks, compared);
            (model.model_key.clone(), ranking)
        })
        .collect()
}

fn build_ranking(model: &ModelAggregateMetrics, ranks: Vec<MetricRank>, compared: usize) -> ModelRanking {
    let (strengths, weaknesses) = if compared < 2 {
        (Vec::new(), Vec::new())
    } else {
        let mut ordered: Vec<&MetricRank> = ranks.iter().collect();
        ordered.sort_by_key(|r| r.rank);
        let strengths: Vec<RankedMetric> = ordered.iter().take(STRENGTH_COUNT).map(|r| r.metric).collect();
        let weaknesses: Vec<RankedMetric> = ordered
            .iter()
            .skip(STRENGTH_COUNT)
            .rev()
            .take(WEAKNESS_COUNT)
            .map(|r| r.metric)
            .collect();
        (strengths, weaknesses)
    };

    let badges = ranks
        .iter()
        .filter_map(|r| {
            let title = r.metric.badge_title()?;
            let tier = match r.rank {
                1 => BadgeTier::Gold,
                2 => BadgeTier::Silver,
                _ => return None,
            };
            Some(Badge {
                metric: r.metric,
                tier,
                title: title.to_string(),
            })
        })
        .collect();

    ModelRanking {
        model_key: model.model_key.clone(),
        display_name: model.display_name.clone(),
        ranks,
        strengths,
        weaknesses,
        badges,
    }
}
