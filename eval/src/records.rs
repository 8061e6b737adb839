// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Evaluation records: intake, validation and synthetic generation

use crate::error::{EnvelopeError, RecordError};
use crate::labels::{LabelSet, LabelUniverse};
use crate::safety::KeywordLexicon;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::Path;

/// One record as supplied by the collecting app, before validation
///
/// Required: `data_id`, `ingredients_text`, `ground_truth_allergens`, and
/// either `predicted_allergens` or `raw_output`. Empty allergen sets are
/// written as `none`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default)]
    pub data_id: Option<i64>,
    #[serde(default)]
    pub ingredients_text: Option<String>,
    #[serde(default)]
    pub ground_truth_allergens: Option<String>,
    #[serde(default)]
    pub predicted_allergens: Option<String>,
    /// Unprocessed inference output envelope (`TTFT_MS=..;...|text`)
    #[serde(default)]
    pub raw_output: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub ttft_ms: Option<f64>,
    #[serde(default)]
    pub itps: Option<f64>,
    #[serde(default)]
    pub otps: Option<f64>,
    #[serde(default)]
    pub oet_ms: Option<f64>,
    #[serde(default)]
    pub memory_mb: Option<f64>,
}

/// Efficiency measurements of one inference call; `None` = not measured
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EfficiencySample {
    pub latency_ms: Option<f64>,
    pub ttft_ms: Option<f64>,
    /// Input (prefill) tokens per second
    pub input_tps: Option<f64>,
    /// Output (generation) tokens per second
    pub output_tps: Option<f64>,
    /// Output evaluation time
    pub output_eval_ms: Option<f64>,
    pub memory_mb: Option<f64>,
}

impl EfficiencySample {
    /// Fill fields missing from `self` with values from `other`
    fn or(self, other: EfficiencySample) -> Self {
        Self {
            latency_ms: self.latency_ms.or(other.latency_ms),
            ttft_ms: self.ttft_ms.or(other.ttft_ms),
            input_tps: self.input_tps.or(other.input_tps),
            output_tps: self.output_tps.or(other.output_tps),
            output_eval_ms: self.output_eval_ms.or(other.output_eval_ms),
            memory_mb: self.memory_mb.or(other.memory_mb),
        }
    }
}

/// Decoded inference output envelope
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceOutput {
    pub efficiency: EfficiencySample,
    /// Model text up to the first newline
    pub text: String,
}

impl InferenceOutput {
    /// Parse `TTFT_MS=<n>;ITPS=<n>;OTPS=<n>;OET_MS=<n>|<text>`
    ///
    /// Negative values mean "not measured". Input without `|` is bare model
    /// text. Unknown keys are ignored.
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let (header, body) = match raw.split_once('|') {
            Some((header, body)) => (Some(header), body),
            None => (None, raw),
        };

        let mut efficiency = EfficiencySample::default();
        for field in header.into_iter().flat_map(|h| h.split(';')).map(str::trim) {
            if field.is_empty() {
                continue;
            }
            let (key, value) = field
                .split_once('=')
                .ok_or_else(|| EnvelopeError::MalformedField(field.to_string()))?;
            let key = key.trim();
            let slot = match key {
                "TTFT_MS" => &mut efficiency.ttft_ms,
                "ITPS" => &mut efficiency.input_tps,
                "OTPS" => &mut efficiency.output_tps,
                "OET_MS" => &mut efficiency.output_eval_ms,
                _ => continue,
            };
            let parsed: i64 = value.trim().parse().map_err(|_| EnvelopeError::NotNumeric {
                key: key.to_string(),
                value: value.trim().to_string(),
            })?;
            *slot = (parsed >= 0).then_some(parsed as f64);
        }

        let text = body.split('\n').next().unwrap_or("").trim().to_string();
        Ok(Self { efficiency, text })
    }
}

/// A validated evaluation unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub data_id: i64,
    pub ingredients_text: String,
    pub ground_truth: LabelSet,
    pub predicted: LabelSet,
    #[serde(default)]
    pub efficiency: EfficiencySample,
}

impl SampleRecord {
    pub fn new(data_id: i64, ingredients_text: &str, ground_truth: LabelSet, predicted: LabelSet) -> Self {
        Self {
            data_id,
            ingredients_text: ingredients_text.to_string(),
            ground_truth,
            predicted,
            efficiency: EfficiencySample::default(),
        }
    }

    pub fn with_efficiency(mut self, efficiency: EfficiencySample) -> Self {
        self.efficiency = efficiency;
        self
    }

    /// Predicted set equals ground truth
    pub fn is_exact_match(&self) -> bool {
        self.predicted == self.ground_truth
    }
}

impl RawRecord {
    /// Validate and normalise against a label universe
    pub fn into_sample(self, universe: &LabelUniverse) -> Result<SampleRecord, RecordError> {
        let data_id = self.data_id.ok_or(RecordError::MissingField {
            data_id: None,
            field: "data_id",
        })?;
        let missing = |field| RecordError::MissingField {
            data_id: Some(data_id),
            field,
        };

        let ingredients_text = self.ingredients_text.ok_or_else(|| missing("ingredients_text"))?;
        if ingredients_text.trim().is_empty() {
            return Err(RecordError::BlankIngredients { data_id });
        }
        let ground_truth = self
            .ground_truth_allergens
            .as_deref()
            .filter(|text| !text.trim().is_empty())
            .map(|text| universe.normalize(text))
            .ok_or_else(|| missing("ground_truth_allergens"))?;

        let envelope = self
            .raw_output
            .as_deref()
            .map(InferenceOutput::parse)
            .transpose()
            .map_err(|source| RecordError::InvalidEfficiency { data_id, source })?;

        // Blank cells read as missing in every file format; empty sets are written `none`
        let explicit = self.predicted_allergens.as_deref().filter(|text| !text.trim().is_empty());
        let predicted_text = match (explicit, &envelope) {
            (Some(text), _) => text,
            (None, Some(output)) => output.text.as_str(),
            (None, None) => return Err(missing("predicted_allergens")),
        };
        let predicted = universe.normalize(predicted_text);

        let measured = EfficiencySample {
            latency_ms: self.latency_ms.filter(|v| *v >= 0.0),
            ttft_ms: self.ttft_ms.filter(|v| *v >= 0.0),
            input_tps: self.itps.filter(|v| *v >= 0.0),
            output_tps: self.otps.filter(|v| *v >= 0.0),
            output_eval_ms: self.oet_ms.filter(|v| *v >= 0.0),
            memory_mb: self.memory_mb.filter(|v| *v >= 0.0),
        };
        let efficiency = match envelope {
            Some(output) => measured.or(output.efficiency),
            None => measured,
        };

        Ok(SampleRecord {
            data_id,
            ingredients_text,
            ground_truth,
            predicted,
            efficiency,
        })
    }
}

/// Load raw records from a `.csv` or `.json` file
pub fn load_records(path: &Path) -> Result<Vec<RawRecord>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let records = match extension.as_str() {
        "csv" => load_csv(path)?,
        "json" => load_json(path)?,
        other => bail!("Unsupported record file extension '{}': {}", other, path.display()),
    };

    tracing::info!("Loaded {} records from {}", records.len(), path.display());
    Ok(records)
}

fn load_csv(path: &Path) -> Result<Vec<RawRecord>> {
    let file = File::open(path).with_context(|| format!("Failed to open record file: {}", path.display()))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::Headers)
        .from_reader(file);

    let mut records = Vec::new();
    for (idx, result) in reader.deserialize::<RawRecord>().enumerate() {
        match result {
            Ok(record) => records.push(record),
            // Kept as an empty record so it is counted as skipped downstream
            Err(err) => {
                tracing::warn!("Unreadable row {} in {}: {}", idx + 1, path.display(), err);
                records.push(RawRecord::default());
            }
        }
    }
    Ok(records)
}

fn load_json(path: &Path) -> Result<Vec<RawRecord>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read record file: {}", path.display()))?;
    let values: Vec<serde_json::Value> = serde_json::from_str(&content)
        .with_context(|| format!("Record file is not a JSON array: {}", path.display()))?;

    let records = values
        .into_iter()
        .enumerate()
        .map(|(idx, value)| {
            serde_json::from_value(value).unwrap_or_else(|err| {
                tracing::warn!("Unreadable record {} in {}: {}", idx + 1, path.display(), err);
                RawRecord::default()
            })
        })
        .collect();
    Ok(records)
}

/// Generate a deterministic simulated model run
///
/// Ingredients are assembled from lexicon keywords of the ground-truth
/// labels plus neutral fillers; each label's prediction is flipped with
/// probability `error_rate`. About a fifth of samples have no allergens.
pub fn synthetic_run(
    size: usize,
    seed: u64,
    error_rate: f64,
    universe: &LabelUniverse,
    lexicon: &KeywordLexicon,
) -> Vec<SampleRecord> {
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let error_rate = error_rate.clamp(0.0, 1.0);
    let fillers = ["sugar", "salt", "water", "sunflower oil", "rice", "cocoa", "vinegar", "maize starch"];

    (0..size)
        .map(|i| {
            let mut ingredients: Vec<String> = Vec::new();
            let mut truth = LabelSet::new();

            if !rng.gen_bool(0.2) {
                for label in universe.labels() {
                    if rng.gen_bool(0.25) {
                        let keywords = lexicon.keywords(label);
                        if !keywords.is_empty() {
                            ingredients.push(keywords[rng.gen_range(0..keywords.len())].clone());
                            truth.insert(label.clone());
                        }
                    }
                }
            }
            for _ in 0..rng.gen_range(1..4) {
                ingredients.push(fillers[rng.gen_range(0..fillers.len())].to_string());
            }

            let predicted: LabelSet = universe
                .labels()
                .iter()
                .filter(|label| truth.contains(label) != rng.gen_bool(error_rate))
                .cloned()
                .collect();

            let efficiency = EfficiencySample {
                latency_ms: Some(rng.gen_range(400..2500) as f64),
                ttft_ms: Some(rng.gen_range(80..600) as f64),
                input_tps: Some(rng.gen_range(20..200) as f64),
                output_tps: Some(rng.gen_range(4..40) as f64),
                output_eval_ms: Some(rng.gen_range(200..2000) as f64),
                memory_mb: Some(rng.gen_range(600..3000) as f64),
            };

            SampleRecord::new(i as i64, &ingredients.join(", "), truth, predicted).with_efficiency(efficiency)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: i64, ingredients: &str, truth: &str, predicted: &str) -> RawRecord {
        RawRecord {
            data_id: Some(id),
            ingredients_text: Some(ingredients.to_string()),
            ground_truth_allergens: Some(truth.to_string()),
            predicted_allergens: Some(predicted.to_string()),
            ..RawRecord::default()
        }
    }

    #[test]
    fn test_envelope_parse() {
        let output = InferenceOutput::parse("TTFT_MS=120;ITPS=85;OTPS=-1;OET_MS=900|Milk, eggs\nExplanation: ...")
            .expect("valid envelope");

        assert_eq!(output.text, "Milk, eggs");
        assert_eq!(output.efficiency.ttft_ms, Some(120.0));
        assert_eq!(output.efficiency.input_tps, Some(85.0));
        assert_eq!(output.efficiency.output_tps, None);
        assert_eq!(output.efficiency.output_eval_ms, Some(900.0));
    }

    #[test]
    fn test_envelope_bare_text() {
        let output = InferenceOutput::parse("soy, wheat").expect("bare text");
        assert_eq!(output.text, "soy, wheat");
        assert_eq!(output.efficiency, EfficiencySample::default());
    }

    #[test]
    fn test_envelope_errors() {
        assert_eq!(
            InferenceOutput::parse("TTFT_MS;OTPS=3|milk"),
            Err(EnvelopeError::MalformedField("TTFT_MS".to_string()))
        );
        assert!(matches!(
            InferenceOutput::parse("TTFT_MS=abc|milk"),
            Err(EnvelopeError::NotNumeric { .. })
        ));
    }

    #[test]
    fn test_into_sample_normalises() {
        let universe = LabelUniverse::allergens();
        let sample = raw(1, "wheat flour, milk", "Wheat, Milk", "wheat, mustard")
            .into_sample(&universe)
            .expect("valid record");

        assert_eq!(sample.ground_truth.len(), 2);
        assert_eq!(sample.predicted.len(), 1);
        assert!(!sample.is_exact_match());
    }

    #[test]
    fn test_into_sample_from_raw_output() {
        let universe = LabelUniverse::allergens();
        let record = RawRecord {
            predicted_allergens: None,
            raw_output: Some("TTFT_MS=50;ITPS=10;OTPS=12;OET_MS=300|crustaceans\n".to_string()),
            latency_ms: Some(640.0),
            ..raw(2, "prawns, salt", "shellfish", "")
        };
        let sample = record.into_sample(&universe).expect("valid record");

        assert!(sample.predicted.contains("shellfish"));
        assert!(sample.is_exact_match());
        assert_eq!(sample.efficiency.latency_ms, Some(640.0));
        assert_eq!(sample.efficiency.ttft_ms, Some(50.0));
    }

    #[test]
    fn test_explicit_fields_win_over_envelope() {
        let universe = LabelUniverse::allergens();
        let record = RawRecord {
            raw_output: Some("TTFT_MS=50|fish".to_string()),
            ttft_ms: Some(75.0),
            ..raw(3, "cod", "fish", "none")
        };
        let sample = record.into_sample(&universe).expect("valid record");

        assert!(sample.predicted.is_empty());
        assert_eq!(sample.efficiency.ttft_ms, Some(75.0));
    }

    #[test]
    fn test_malformed_records() {
        let universe = LabelUniverse::allergens();

        let no_id = RawRecord {
            data_id: None,
            ..raw(0, "milk", "milk", "milk")
        };
        assert_eq!(
            no_id.into_sample(&universe),
            Err(RecordError::MissingField {
                data_id: None,
                field: "data_id"
            })
        );

        let blank = raw(4, "   ", "none", "none");
        assert_eq!(blank.into_sample(&universe), Err(RecordError::BlankIngredients { data_id: 4 }));

        let no_prediction = RawRecord {
            predicted_allergens: None,
            ..raw(5, "egg", "egg", "")
        };
        assert!(matches!(
            no_prediction.into_sample(&universe),
            Err(RecordError::MissingField {
                field: "predicted_allergens",
                ..
            })
        ));

        let bad_envelope = RawRecord {
            predicted_allergens: None,
            raw_output: Some("OTPS=x|egg".to_string()),
            ..raw(6, "egg", "egg", "")
        };
        assert!(matches!(
            bad_envelope.into_sample(&universe),
            Err(RecordError::InvalidEfficiency { data_id: 6, .. })
        ));
    }

    #[test]
    fn test_load_csv_and_json() {
        let dir = std::env::temp_dir().join(format!("allergen_eval_records_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let csv_path = dir.join("model.csv");
        std::fs::write(
            &csv_path,
            "data_id,ingredients_text,ground_truth_allergens,predicted_allergens,latency_ms\n\
             1,\"wheat flour, salt\",wheat,wheat,800\n\
             2,\"sugar, water\",none,none,\n\
             3,\"milk\",milk,,\n",
        )
        .unwrap();
        let csv_records = load_records(&csv_path).unwrap();
        assert_eq!(csv_records.len(), 3);
        assert_eq!(csv_records[0].latency_ms, Some(800.0));
        assert_eq!(csv_records[1].latency_ms, None);
        assert_eq!(csv_records[2].predicted_allergens, None);

        let json_path = dir.join("model.json");
        std::fs::write(
            &json_path,
            r#"[{"data_id": 1, "ingredients_text": "egg noodles", "ground_truth_allergens": "egg, wheat",
                 "raw_output": "TTFT_MS=10;ITPS=1;OTPS=2;OET_MS=3|egg"}]"#,
        )
        .unwrap();
        let json_records = load_records(&json_path).unwrap();
        assert_eq!(json_records.len(), 1);
        assert!(json_records[0].raw_output.is_some());

        assert!(load_records(&dir.join("model.txt")).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_blank_predictions_are_missing() {
        let universe = LabelUniverse::allergens();

        assert!(matches!(
            raw(7, "egg noodles", "egg", "  ").into_sample(&universe),
            Err(RecordError::MissingField {
                field: "predicted_allergens",
                ..
            })
        ));
        assert!(matches!(
            raw(8, "egg noodles", "", "egg").into_sample(&universe),
            Err(RecordError::MissingField {
                field: "ground_truth_allergens",
                ..
            })
        ));

        let with_envelope = RawRecord {
            raw_output: Some("TTFT_MS=5|eggs".to_string()),
            ..raw(9, "egg noodles", "egg", "")
        };
        let sample = with_envelope.into_sample(&universe).expect("envelope text used");
        assert!(sample.is_exact_match());
    }

    #[test]
    fn test_load_json_skips_unreadable_records() {
        use crate::aggregate::Aggregator;

        let dir = std::env::temp_dir().join(format!("allergen_eval_bad_json_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("model.json");
        std::fs::write(
            &path,
            r#"[{"data_id": 1, "ingredients_text": "milk", "ground_truth_allergens": "milk", "predicted_allergens": "milk"},
                {"data_id": "two", "ingredients_text": "cod", "ground_truth_allergens": "fish", "predicted_allergens": "fish"},
                {"data_id": 3, "ingredients_text": "cod", "ground_truth_allergens": "fish", "predicted_allergens": ""}]"#,
        )
        .unwrap();

        let records = load_records(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1], RawRecord::default());

        let universe = LabelUniverse::allergens();
        let lexicon = KeywordLexicon::default();
        let metrics = Aggregator::new(&universe, &lexicon).aggregate_raw(records, "m", "M");
        assert_eq!(metrics.prediction_count, 1);
        assert_eq!(metrics.skipped_records, 2);

        std::fs::write(&path, r#"{"data_id": 1}"#).unwrap();
        assert!(load_records(&path).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_synthetic_run_is_deterministic() {
        let universe = LabelUniverse::allergens();
        let lexicon = KeywordLexicon::default();

        let a = synthetic_run(100, 42, 0.1, &universe, &lexicon);
        let b = synthetic_run(100, 42, 0.1, &universe, &lexicon);
        assert_eq!(a, b);
        assert_eq!(a.len(), 100);
        assert!(a.iter().all(|s| universe.covers(&s.predicted) && universe.covers(&s.ground_truth)));
        assert!(a.iter().any(|s| s.ground_truth.is_empty()));
    }

    #[test]
    fn test_synthetic_run_without_errors_is_perfect() {
        let universe = LabelUniverse::allergens();
        let lexicon = KeywordLexicon::default();

        let samples = synthetic_run(50, 7, 0.0, &universe, &lexicon);
        assert!(samples.iter().all(SampleRecord::is_exact_match));
        assert!(samples
            .iter()
            .all(|s| !lexicon.has_hallucination(&s.predicted, &s.ingredients_text)));
    }
}
