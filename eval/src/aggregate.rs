// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Per-model aggregation
//!
//! A single streaming pass folds every sample of a model into a
//! [`ModelAccumulator`]; finishing it invokes the quality and safety
//! calculators. All accumulated quantities are sums, so the result does not
//! depend on sample order, and partial accumulators can be merged.

use crate::confusion::{ConfusionCounts, PerLabelCounts};
use crate::error::RecordError;
use crate::labels::LabelUniverse;
use crate::metrics::QualityMetrics;
use crate::records::{EfficiencySample, RawRecord, SampleRecord};
use crate::safety::{KeywordLexicon, SafetyCounts, SafetyMetrics};
use serde::{Deserialize, Serialize};

/// Skip messages kept on the aggregate for inspection
const MAX_SKIP_EXAMPLES: usize = 5;

/// Mean efficiency values; `None` when no sample reported the value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EfficiencyMetrics {
    pub avg_latency_ms: Option<f64>,
    pub avg_ttft_ms: Option<f64>,
    pub avg_input_tps: Option<f64>,
    pub avg_output_tps: Option<f64>,
    pub avg_output_eval_ms: Option<f64>,
    pub avg_memory_mb: Option<f64>,
}

/// Efficiency values are summed in fixed-point micro-units so the total is
/// exact and independent of sample order.
const FIXED_POINT_SCALE: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct MeanSum {
    sum: i128,
    count: usize,
}

impl MeanSum {
    fn add(&mut self, value: Option<f64>) {
        if let Some(v) = value.filter(|v| v.is_finite()) {
            self.sum += (v * FIXED_POINT_SCALE).round() as i128;
            self.count += 1;
        }
    }

    fn merge(&mut self, other: MeanSum) {
        self.sum += other.sum;
        self.count += other.count;
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / FIXED_POINT_SCALE / self.count as f64)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct EfficiencySums {
    latency: MeanSum,
    ttft: MeanSum,
    input_tps: MeanSum,
    output_tps: MeanSum,
    output_eval: MeanSum,
    memory: MeanSum,
}

impl EfficiencySums {
    fn add(&mut self, sample: &EfficiencySample) {
        self.latency.add(sample.latency_ms);
        self.ttft.add(sample.ttft_ms);
        self.input_tps.add(sample.input_tps);
        self.output_tps.add(sample.output_tps);
        self.output_eval.add(sample.output_eval_ms);
        self.memory.add(sample.memory_mb);
    }

    fn merge(&mut self, other: &EfficiencySums) {
        self.latency.merge(other.latency);
        self.ttft.merge(other.ttft);
        self.input_tps.merge(other.input_tps);
        self.output_tps.merge(other.output_tps);
        self.output_eval.merge(other.output_eval);
        self.memory.merge(other.memory);
    }

    fn means(&self) -> EfficiencyMetrics {
        EfficiencyMetrics {
            avg_latency_ms: self.latency.mean(),
            avg_ttft_ms: self.ttft.mean(),
            avg_input_tps: self.input_tps.mean(),
            avg_output_tps: self.output_tps.mean(),
            avg_output_eval_ms: self.output_eval.mean(),
            avg_memory_mb: self.memory.mean(),
        }
    }
}

/// Running totals for one model evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct ModelAccumulator {
    samples: usize,
    exact_matches: usize,
    totals: ConfusionCounts,
    per_label: PerLabelCounts,
    safety: SafetyCounts,
    efficiency: EfficiencySums,
    skipped: usize,
    skip_examples: Vec<String>,
}

impl ModelAccumulator {
    pub fn new(universe: &LabelUniverse) -> Self {
        Self {
            samples: 0,
            exact_matches: 0,
            totals: ConfusionCounts::default(),
            per_label: PerLabelCounts::new(universe),
            safety: SafetyCounts::default(),
            efficiency: EfficiencySums::default(),
            skipped: 0,
            skip_examples: Vec::new(),
        }
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Fold one validated sample in
    pub fn observe(&mut self, sample: &SampleRecord, universe: &LabelUniverse, lexicon: &KeywordLexicon) {
        let per_label = PerLabelCounts::from_sets(&sample.predicted, &sample.ground_truth, universe);
        self.totals += per_label.pooled();
        self.per_label.merge(&per_label);
        self.safety
            .observe(&sample.predicted, &sample.ground_truth, &sample.ingredients_text, lexicon);
        self.efficiency.add(&sample.efficiency);
        if sample.is_exact_match() {
            self.exact_matches += 1;
        }
        self.samples += 1;
    }

    /// Count a record that could not be scored
    pub fn record_skip(&mut self, error: &RecordError) {
        tracing::warn!("Skipping malformed record: {}", error);
        self.skipped += 1;
        self.keep_skip_example(error.to_string());
    }

    /// Keep the lexicographically smallest messages, sorted
    fn keep_skip_example(&mut self, message: String) {
        let at = self.skip_examples.partition_point(|kept| *kept <= message);
        if at < MAX_SKIP_EXAMPLES {
            self.skip_examples.insert(at, message);
            self.skip_examples.truncate(MAX_SKIP_EXAMPLES);
        }
    }

    /// Combine with a partial accumulator over other samples
    pub fn merge(&mut self, other: &ModelAccumulator) {
        self.samples += other.samples;
        self.exact_matches += other.exact_matches;
        self.totals += other.totals;
        self.per_label.merge(&other.per_label);
        self.safety += other.safety;
        self.efficiency.merge(&other.efficiency);
        self.skipped += other.skipped;
        for example in &other.skip_examples {
            self.keep_skip_example(example.clone());
        }
    }

    /// Finalise into the model's metrics
    pub fn finish(self, model_key: &str, display_name: &str, universe: &LabelUniverse) -> ModelAggregateMetrics {
        if self.samples == 0 {
            tracing::warn!("Model {} has no valid samples; reporting zero-valued metrics", model_key);
        }
        let quality = QualityMetrics::compute(
            &self.totals,
            &self.per_label,
            self.exact_matches,
            self.samples,
            universe.len(),
        );
        let safety = SafetyMetrics::from_counts(&self.safety);

        ModelAggregateMetrics {
            model_key: model_key.to_string(),
            display_name: display_name.to_string(),
            prediction_count: self.samples,
            skipped_records: self.skipped,
            skip_examples: self.skip_examples,
            confusion: self.totals,
            per_label_counts: self.per_label,
            quality,
            safety,
            efficiency: self.efficiency.means(),
        }
    }
}

/// Aggregate metrics of one evaluated model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAggregateMetrics {
    pub model_key: String,
    pub display_name: String,
    /// Number of scored samples (N)
    pub prediction_count: usize,
    /// Records dropped as malformed
    pub skipped_records: usize,
    pub skip_examples: Vec<String>,
    pub confusion: ConfusionCounts,
    pub per_label_counts: PerLabelCounts,
    pub quality: QualityMetrics,
    pub safety: SafetyMetrics,
    pub efficiency: EfficiencyMetrics,
}

impl ModelAggregateMetrics {
    /// Zero-valued metrics for a model without samples
    pub fn empty(model_key: &str, display_name: &str, universe: &LabelUniverse) -> Self {
        ModelAccumulator::new(universe).finish(model_key, display_name, universe)
    }

    pub fn has_data(&self) -> bool {
        self.prediction_count > 0
    }

    /// Format as a human-readable string
    pub fn format(&self) -> String {
        let mut output = format!(
            "Model: {} ({})\nSamples: {} (skipped {})\nConfusion: TP={} FP={} FN={} TN={}\n\n",
            self.display_name,
            self.model_key,
            self.prediction_count,
            self.skipped_records,
            self.confusion.tp,
            self.confusion.fp,
            self.confusion.fn_,
            self.confusion.tn,
        );
        output.push_str(&self.quality.format());
        output.push('\n');
        output.push_str(&self.safety.format());
        output
    }
}

/// Aggregation with a fixed label universe and keyword lexicon
#[derive(Debug, Clone, Copy)]
pub struct Aggregator<'a> {
    universe: &'a LabelUniverse,
    lexicon: &'a KeywordLexicon,
}

impl<'a> Aggregator<'a> {
    pub fn new(universe: &'a LabelUniverse, lexicon: &'a KeywordLexicon) -> Self {
        Self { universe, lexicon }
    }

    pub fn accumulator(&self) -> ModelAccumulator {
        ModelAccumulator::new(self.universe)
    }

    pub fn observe(&self, acc: &mut ModelAccumulator, sample: &SampleRecord) {
        acc.observe(sample, self.universe, self.lexicon);
    }

    /// Validate a raw record and fold it in, or count it as skipped
    pub fn observe_raw(&self, acc: &mut ModelAccumulator, record: RawRecord) {
        match record.into_sample(self.universe) {
            Ok(sample) => self.observe(acc, &sample),
            Err(err) => acc.record_skip(&err),
        }
    }

    pub fn finish(&self, acc: ModelAccumulator, model_key: &str, display_name: &str) -> ModelAggregateMetrics {
        let metrics = acc.finish(model_key, display_name, self.universe);
        tracing::info!(
            "  {} - N={}, F1 micro: {:.4}, F1 macro: {:.4}, Hallucination: {:.2}%",
            metrics.display_name,
            metrics.prediction_count,
            metrics.quality.f1_micro,
            metrics.quality.f1_macro,
            metrics.safety.hallucination_rate
        );
        metrics
    }

    /// Aggregate validated samples in one pass
    pub fn aggregate<'s, I>(&self, samples: I, model_key: &str, display_name: &str) -> ModelAggregateMetrics
    where
        I: IntoIterator<Item = &'s SampleRecord>,
    {
        let mut acc = self.accumulator();
        for sample in samples {
            self.observe(&mut acc, sample);
        }
        self.finish(acc, model_key, display_name)
    }

    /// Aggregate raw records, skipping and counting malformed ones
    pub fn aggregate_raw<I>(&self, records: I, model_key: &str, display_name: &str) -> ModelAggregateMetrics
    where
        I: IntoIterator<Item = RawRecord>,
    {
        let mut acc = self.accumulator();
        for record in records {
            self.observe_raw(&mut acc, record);
        }
        if acc.skipped() > 0 {
            tracing::warn!("Model {}: skipped {} malformed records", model_key, acc.skipped());
        }
        self.finish(acc, model_key, display_name)
    }
}

/// Aggregate with the standard allergen universe and built-in lexicon
pub fn aggregate(samples: &[SampleRecord], model_key: &str, display_name: &str) -> ModelAggregateMetrics {
    let universe = LabelUniverse::allergens();
    let lexicon = KeywordLexicon::default();
    Aggregator::new(&universe, &lexicon).aggregate(samples, model_key, display_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LabelSet;

    fn set(labels: &[&str]) -> LabelSet {
        labels.iter().copied().collect()
    }

    fn sample(id: i64, ingredients: &str, truth: &[&str], predicted: &[&str]) -> SampleRecord {
        SampleRecord::new(id, ingredients, set(truth), set(predicted))
    }

    fn fixture() -> Vec<SampleRecord> {
        vec![
            sample(1, "wheat flour, milk powder", &["milk", "wheat"], &["milk", "soy"]),
            sample(2, "wheat flour", &["wheat"], &["wheat", "milk"]),
            sample(3, "sugar, oil", &[], &[]),
            sample(4, "sugar, oil", &[], &["milk"]),
            sample(5, "roasted peanuts, salt", &["peanut"], &["peanut"]),
        ]
    }

    #[test]
    fn test_aggregate_counts_and_rates() {
        let metrics = aggregate(&fixture(), "qwen", "Qwen 2.5");

        assert_eq!(metrics.prediction_count, 5);
        // tp: milk(1) + wheat(2) + peanut(5) = 3; fp: soy(1), milk(2), milk(4) = 3; fn: wheat(1) = 1
        assert_eq!(metrics.confusion, ConfusionCounts::new(3, 3, 1, 38));
        assert_eq!(metrics.confusion.total(), 5 * 9);
        assert!((metrics.quality.precision - 0.5).abs() < 1e-9);
        assert!((metrics.quality.recall - 0.75).abs() < 1e-9);
        assert!((metrics.quality.exact_match_ratio - 0.4).abs() < 1e-9);
        assert!((metrics.quality.hamming_loss - 4.0 / 45.0).abs() < 1e-9);

        // samples 1, 2 and 4 each predict a label with no keyword evidence
        assert!((metrics.safety.hallucination_rate - 60.0).abs() < 1e-9);
        assert!((metrics.safety.over_prediction_rate - 60.0).abs() < 1e-9);
        assert_eq!(metrics.safety.abstention_cases, 2);
        assert!((metrics.safety.abstention_accuracy - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_aggregate_order_independent() {
        let samples = fixture();
        let forward = aggregate(&samples, "m", "M");
        let reversed: Vec<SampleRecord> = samples.iter().rev().cloned().collect();
        let backward = aggregate(&reversed, "m", "M");
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_merge_equals_single_pass() {
        let universe = LabelUniverse::allergens();
        let lexicon = KeywordLexicon::default();
        let aggregator = Aggregator::new(&universe, &lexicon);
        let samples = fixture();

        let mut left = aggregator.accumulator();
        let mut right = aggregator.accumulator();
        for (i, s) in samples.iter().enumerate() {
            if i % 2 == 0 {
                aggregator.observe(&mut left, s);
            } else {
                aggregator.observe(&mut right, s);
            }
        }
        left.merge(&right);

        let merged = aggregator.finish(left, "m", "M");
        let single = aggregator.aggregate(&samples, "m", "M");
        assert_eq!(merged, single);
    }

    #[test]
    fn test_empty_sample_set() {
        let metrics = aggregate(&[], "none", "No data");

        assert!(!metrics.has_data());
        assert_eq!(metrics.quality.f1_micro, 0.0);
        assert_eq!(metrics.quality.hamming_loss, 0.0);
        assert_eq!(metrics.safety.hallucination_rate, 0.0);
        assert_eq!(metrics.safety.abstention_accuracy, 100.0);
        assert_eq!(metrics.efficiency, EfficiencyMetrics::default());
        assert_eq!(metrics, ModelAggregateMetrics::empty("none", "No data", &LabelUniverse::allergens()));
    }

    #[test]
    fn test_malformed_records_are_counted() {
        let universe = LabelUniverse::allergens();
        let lexicon = KeywordLexicon::default();
        let records = vec![
            RawRecord {
                data_id: Some(1),
                ingredients_text: Some("egg noodles".to_string()),
                ground_truth_allergens: Some("egg, wheat".to_string()),
                predicted_allergens: Some("eggs".to_string()),
                ..RawRecord::default()
            },
            RawRecord::default(),
            RawRecord {
                data_id: Some(3),
                ingredients_text: Some("fish".to_string()),
                ..RawRecord::default()
            },
        ];

        let metrics = Aggregator::new(&universe, &lexicon).aggregate_raw(records, "m", "M");
        assert_eq!(metrics.prediction_count, 1);
        assert_eq!(metrics.skipped_records, 2);
        assert_eq!(metrics.skip_examples.len(), 2);
        assert!(metrics.skip_examples.iter().any(|m| m.contains("ground_truth_allergens")));
        assert!(metrics.skip_examples.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_efficiency_means_pass_through() {
        let samples = vec![
            sample(1, "milk", &["milk"], &["milk"]).with_efficiency(EfficiencySample {
                latency_ms: Some(100.0),
                ttft_ms: Some(20.0),
                ..EfficiencySample::default()
            }),
            sample(2, "milk", &["milk"], &["milk"]).with_efficiency(EfficiencySample {
                latency_ms: Some(300.0),
                ..EfficiencySample::default()
            }),
            sample(3, "milk", &["milk"], &["milk"]),
        ];
        let metrics = aggregate(&samples, "m", "M");

        assert_eq!(metrics.efficiency.avg_latency_ms, Some(200.0));
        assert_eq!(metrics.efficiency.avg_ttft_ms, Some(20.0));
        assert_eq!(metrics.efficiency.avg_memory_mb, None);
    }

    #[test]
    fn test_fractional_efficiency_order_independent() {
        let with_latency = |id: i64, latency: f64| {
            sample(id, "milk", &["milk"], &["milk"]).with_efficiency(EfficiencySample {
                latency_ms: Some(latency),
                output_tps: Some(latency * 7.3),
                ..EfficiencySample::default()
            })
        };
        let forward = vec![with_latency(1, 0.1), with_latency(2, 0.2), with_latency(3, 0.3)];
        let reversed: Vec<SampleRecord> = forward.iter().rev().cloned().collect();

        let a = aggregate(&forward, "m", "M");
        let b = aggregate(&reversed, "m", "M");
        assert_eq!(a, b);
        assert!((a.efficiency.avg_latency_ms.unwrap_or_default() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_skip_examples_independent_of_record_order() {
        let universe = LabelUniverse::allergens();
        let lexicon = KeywordLexicon::default();
        let aggregator = Aggregator::new(&universe, &lexicon);
        let records: Vec<RawRecord> = (1..=8)
            .map(|id| RawRecord {
                data_id: Some(id),
                ..RawRecord::default()
            })
            .collect();

        let forward = aggregator.aggregate_raw(records.clone(), "m", "M");
        let backward = aggregator.aggregate_raw(records.into_iter().rev(), "m", "M");
        assert_eq!(forward.skipped_records, 8);
        assert_eq!(forward.skip_examples.len(), MAX_SKIP_EXAMPLES);
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_format_contains_sections() {
        let metrics = aggregate(&fixture(), "qwen", "Qwen 2.5");
        let formatted = metrics.format();
        assert!(formatted.contains("Qwen 2.5"));
        assert!(formatted.contains("Quality Metrics"));
        assert!(formatted.contains("Safety Metrics"));
    }
}
