// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Reproducible evaluation pipeline for allergen prediction models
//!
//! Orchestrates:
//! - Record loading (per-model files or seeded synthetic runs)
//! - Per-model aggregation
//! - Cross-model ranking
//! - Results serialization and markdown reporting

use crate::aggregate::{Aggregator, ModelAggregateMetrics};
use crate::labels::LabelUniverse;
use crate::ranking::{rank, ModelRanking, RankedMetric, DEFAULT_MIN_SAMPLES};
use crate::records::{load_records, synthetic_run};
use crate::safety::KeywordLexicon;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Simulated models used when no record files are given: (key, name, error rate)
const SYNTHETIC_MODELS: [(&str, &str, f64); 3] = [
    ("synthetic-strong", "Synthetic Strong", 0.03),
    ("synthetic-medium", "Synthetic Medium", 0.12),
    ("synthetic-weak", "Synthetic Weak", 0.30),
];

/// One model's record file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInput {
    pub model_key: String,
    pub display_name: String,
    pub path: String,
}

impl ModelInput {
    /// Parse `key=path` or a bare path (key taken from the file stem)
    pub fn parse(arg: &str) -> Result<Self> {
        let arg = arg.trim();
        let (key, path) = match arg.split_once('=') {
            Some((key, path)) => (key.trim().to_string(), path.trim().to_string()),
            None => {
                let key = Path::new(arg)
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
                    .unwrap_or_default();
                (key, arg.to_string())
            }
        };
        if key.is_empty() || path.is_empty() {
            bail!("Invalid model input '{}': expected key=path or a file path", arg);
        }
        Ok(Self {
            display_name: key.clone(),
            model_key: key,
            path,
        })
    }
}

/// Configuration for the evaluation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationConfig {
    /// Random seed for synthetic runs
    pub seed: u64,
    /// "synthetic" or "files"
    pub dataset_id: String,
    /// Per-model record files (used when dataset_id is "files")
    pub inputs: Vec<ModelInput>,
    /// Samples per simulated model
    pub synthetic_samples: usize,
    /// Models with fewer scored samples are not ranked
    pub min_samples_for_ranking: usize,
    /// Optional JSON keyword lexicon replacing the built-in one
    pub lexicon_path: Option<String>,
    /// Output directory for results
    pub output_dir: String,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            dataset_id: "synthetic".to_string(),
            inputs: vec![],
            synthetic_samples: 200,
            min_samples_for_ranking: DEFAULT_MIN_SAMPLES,
            lexicon_path: None,
            output_dir: "eval/results".to_string(),
        }
    }
}

/// Complete evaluation results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResults {
    pub config: EvaluationConfig,
    pub lexicon_version: String,
    pub models: Vec<ModelAggregateMetrics>,
    pub rankings: BTreeMap<String, ModelRanking>,
    pub summary: EvaluationSummary,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub best_model: Option<String>,
    pub best_f1_micro: f64,
    pub best_exact_match: f64,
    pub total_skipped_records: usize,
    /// Models below the ranking sample threshold
    pub unranked_models: Vec<String>,
    pub model_comparison: Vec<ModelComparison>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelComparison {
    pub model: String,
    pub samples: usize,
    pub f1_micro: f64,
    pub f1_macro: f64,
    pub exact_match: f64,
    pub hallucination_rate: f64,
    pub avg_latency_ms: Option<f64>,
}

/// Main evaluation pipeline
pub struct EvaluationPipeline {
    config: EvaluationConfig,
    universe: LabelUniverse,
    lexicon: KeywordLexicon,
}

impl EvaluationPipeline {
    /// Create a pipeline, loading the lexicon override if configured
    pub fn new(config: EvaluationConfig) -> Result<Self> {
        let lexicon = match config.lexicon_path {
            Some(ref path) => KeywordLexicon::from_json_file(Path::new(path))?,
            None => KeywordLexicon::default(),
        };
        Ok(Self {
            config,
            universe: LabelUniverse::allergens(),
            lexicon,
        })
    }

    pub fn with_universe(mut self, universe: LabelUniverse) -> Self {
        self.universe = universe;
        self
    }

    pub fn with_lexicon(mut self, lexicon: KeywordLexicon) -> Self {
        self.lexicon = lexicon;
        self
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    fn aggregator(&self) -> Aggregator<'_> {
        Aggregator::new(&self.universe, &self.lexicon)
    }

    /// Evaluate one model from its record file
    pub fn evaluate_input(&self, input: &ModelInput) -> Result<ModelAggregateMetrics> {
        tracing::info!("Evaluating model: {} ({})", input.display_name, input.path);
        let records = load_records(Path::new(&input.path))
            .with_context(|| format!("Failed to load records for model {}", input.model_key))?;
        Ok(self
            .aggregator()
            .aggregate_raw(records, &input.model_key, &input.display_name))
    }

    /// Evaluate the seeded simulated models
    pub fn evaluate_synthetic(&self) -> Vec<ModelAggregateMetrics> {
        SYNTHETIC_MODELS
            .iter()
            .enumerate()
            .map(|(i, (key, name, error_rate))| {
                tracing::info!("Evaluating synthetic model: {} (error rate {:.2})", name, error_rate);
                let samples = synthetic_run(
                    self.config.synthetic_samples,
                    self.config.seed.wrapping_add(i as u64),
                    *error_rate,
                    &self.universe,
                    &self.lexicon,
                );
                self.aggregator().aggregate(&samples, key, name)
            })
            .collect()
    }

    /// Rank and summarise already aggregated models
    pub fn compare(&self, models: Vec<ModelAggregateMetrics>) -> EvaluationResults {
        let rankings = rank(&models, self.config.min_samples_for_ranking);

        let mut best: Option<&ModelAggregateMetrics> = None;
        for m in models.iter().filter(|m| m.has_data()) {
            if best.map_or(true, |b| m.quality.f1_micro > b.quality.f1_micro) {
                best = Some(m);
            }
        }

        let unranked_models = models
            .iter()
            .filter(|m| !rankings.contains_key(&m.model_key))
            .map(|m| m.model_key.clone())
            .collect();

        let model_comparison = models
            .iter()
            .map(|m| ModelComparison {
                model: m.display_name.clone(),
                samples: m.prediction_count,
                f1_micro: m.quality.f1_micro,
                f1_macro: m.quality.f1_macro,
                exact_match: m.quality.exact_match_ratio,
                hallucination_rate: m.safety.hallucination_rate,
                avg_latency_ms: m.efficiency.avg_latency_ms,
            })
            .collect();

        let summary = EvaluationSummary {
            best_model: best.map(|m| m.display_name.clone()),
            best_f1_micro: best.map_or(0.0, |m| m.quality.f1_micro),
            best_exact_match: best.map_or(0.0, |m| m.quality.exact_match_ratio),
            total_skipped_records: models.iter().map(|m| m.skipped_records).sum(),
            unranked_models,
            model_comparison,
        };

        EvaluationResults {
            config: self.config.clone(),
            lexicon_version: self.lexicon.version.clone(),
            models,
            rankings,
            summary,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Run the full evaluation pipeline
    pub fn run(&self) -> Result<EvaluationResults> {
        let models = match self.config.dataset_id.as_str() {
            "synthetic" => self.evaluate_synthetic(),
            "files" => {
                if self.config.inputs.is_empty() {
                    bail!("Dataset 'files' requires at least one model input");
                }
                self.config
                    .inputs
                    .iter()
                    .map(|input| self.evaluate_input(input))
                    .collect::<Result<Vec<_>>>()?
            }
            other => bail!("Unknown dataset '{}' (expected 'synthetic' or 'files')", other),
        };

        Ok(self.compare(models))
    }

    /// Save results to JSON file
    pub fn save_results(results: &EvaluationResults, output_path: &Path) -> Result<()> {
        std::fs::create_dir_all(output_path.parent().unwrap_or(Path::new(".")))?;
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(output_path, json)
            .with_context(|| format!("Failed to write results: {}", output_path.display()))?;
        tracing::info!("Results saved to {}", output_path.display());
        Ok(())
    }

    /// Default results path for a run
    pub fn results_path(output_dir: &Path, dataset_id: &str, timestamp: &DateTime<Utc>, ext: &str) -> PathBuf {
        output_dir.join(format!("allergen_eval_{}_{}.{}", dataset_id, timestamp.format("%Y%m%d_%H%M%S"), ext))
    }

    /// Generate a markdown report
    pub fn generate_report(results: &EvaluationResults) -> String {
        let mut report = String::new();

        report.push_str("# Allergen Prediction Evaluation Report\n\n");
        report.push_str(&format!("**Generated:** {}\n\n", results.timestamp.format("%Y-%m-%d %H:%M:%S UTC")));
        report.push_str(&format!("**Version:** {}\n\n", results.version));
        report.push_str(&format!("**Keyword lexicon:** {}\n\n", results.lexicon_version));

        report.push_str("## Summary\n\n");
        match results.summary.best_model {
            Some(ref best) => report.push_str(&format!(
                "**Best Model:** {} (F1 micro={:.4}, Exact match={:.4})\n\n",
                best, results.summary.best_f1_micro, results.summary.best_exact_match
            )),
            None => report.push_str("**Best Model:** none (no model has scored samples)\n\n"),
        }
        if results.summary.total_skipped_records > 0 {
            report.push_str(&format!(
                "**Skipped malformed records:** {}\n\n",
                results.summary.total_skipped_records
            ));
        }

        report.push_str("### Quality\n\n");
        report.push_str("| Model | N | Precision | Recall | F1 micro | F1 macro | Hamming | FNR | Exact match |\n");
        report.push_str("|-------|---|-----------|--------|----------|----------|---------|-----|-------------|\n");
        for m in &results.models {
            report.push_str(&format!(
                "| {} | {} | {:.4} | {:.4} | {:.4} | {:.4} | {:.4} | {:.4} | {:.4} |\n",
                m.display_name,
                m.prediction_count,
                m.quality.precision,
                m.quality.recall,
                m.quality.f1_micro,
                m.quality.f1_macro,
                m.quality.hamming_loss,
                m.quality.fnr,
                m.quality.exact_match_ratio
            ));
        }

        report.push_str("\n### Safety\n\n");
        report.push_str("| Model | Hallucination % | Over-prediction % | Abstention accuracy % | Abstention cases |\n");
        report.push_str("|-------|-----------------|-------------------|-----------------------|------------------|\n");
        for m in &results.models {
            report.push_str(&format!(
                "| {} | {:.2} | {:.2} | {:.2} | {} |\n",
                m.display_name,
                m.safety.hallucination_rate,
                m.safety.over_prediction_rate,
                m.safety.abstention_accuracy,
                m.safety.abstention_cases
            ));
        }

        report.push_str("\n### Efficiency\n\n");
        report.push_str("| Model | Latency (ms) | TTFT (ms) | Output tok/s | Memory (MB) |\n");
        report.push_str("|-------|--------------|-----------|--------------|-------------|\n");
        let opt = |v: Option<f64>| v.map_or("-".to_string(), |v| format!("{:.1}", v));
        for m in &results.models {
            report.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                m.display_name,
                opt(m.efficiency.avg_latency_ms),
                opt(m.efficiency.avg_ttft_ms),
                opt(m.efficiency.avg_output_tps),
                opt(m.efficiency.avg_memory_mb)
            ));
        }

        report.push_str("\n## Rankings\n\n");
        if results.rankings.is_empty() {
            report.push_str("No model reached the minimum sample count for ranking.\n\n");
        }
        let list = |metrics: &[RankedMetric]| {
            if metrics.is_empty() {
                "-".to_string()
            } else {
                metrics.iter().map(|m| m.name()).collect::<Vec<_>>().join(", ")
            }
        };
        for ranking in results.rankings.values() {
            report.push_str(&format!("### {}\n\n", ranking.display_name));
            for r in &ranking.ranks {
                report.push_str(&format!("- {}: #{} of {} ({:.4})\n", r.metric, r.rank, r.out_of, r.value));
            }
            report.push_str(&format!("\n- **Strengths:** {}\n", list(ranking.strengths.as_slice())));
            report.push_str(&format!("- **Weaknesses:** {}\n", list(ranking.weaknesses.as_slice())));
            if !ranking.badges.is_empty() {
                let badges: Vec<String> = ranking
                    .badges
                    .iter()
                    .map(|b| format!("{} ({:?})", b.title, b.tier))
                    .collect();
                report.push_str(&format!("- **Badges:** {}\n", badges.join(", ")));
            }
            report.push('\n');
        }
        if !results.summary.unranked_models.is_empty() {
            report.push_str(&format!(
                "Not ranked (fewer than {} samples): {}\n\n",
                results.config.min_samples_for_ranking,
                results.summary.unranked_models.join(", ")
            ));
        }

        report.push_str("## Detailed Results\n\n");
        for m in &results.models {
            report.push_str(&format!("### {}\n\n", m.display_name));
            report.push_str(&format!("```\n{}\n```\n\n", m.format()));
            if !m.skip_examples.is_empty() {
                report.push_str("Skipped records:\n\n");
                for example in &m.skip_examples {
                    report.push_str(&format!("- {}\n", example));
                }
                report.push('\n');
            }
        }

        report.push_str("## Configuration\n\n");
        report.push_str(&format!(
            "```json\n{}\n```\n",
            serde_json::to_string_pretty(&results.config).unwrap_or_default()
        ));

        report
    }
}
