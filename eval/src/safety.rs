// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Safety metrics for allergen prediction
//!
//! Provides:
//! - Keyword lexicon linking each label to ingredient evidence
//! - Hallucination detection (predicted label with no keyword in the ingredients)
//! - Over-prediction detection (any false positive)
//! - Abstention accuracy on samples whose ground truth is empty
//!
//! Keyword matching is case-insensitive substring containment. It has known
//! false positives and negatives; revised keyword lists ship as a new
//! lexicon `version` so results stay comparable.

use crate::labels::LabelSet;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::AddAssign;
use std::path::Path;

/// Version tag of the built-in lexicon
pub const LEXICON_VERSION: &str = "allergen-keywords-v1";

const DEFAULT_KEYWORDS: [(&str, &[&str]); 9] = [
    (
        "milk",
        &[
            "milk", "cream", "butter", "cheese", "whey", "casein", "lactose", "dairy", "yogurt", "ghee", "curd",
            "buttermilk",
        ],
    ),
    (
        "egg",
        &["egg", "albumin", "albumen", "mayonnaise", "meringue", "ovalbumin", "lysozyme", "yolk"],
    ),
    ("peanut", &["peanut", "groundnut", "arachis", "monkey nut"]),
    (
        "tree nut",
        &[
            "almond",
            "cashew",
            "walnut",
            "pecan",
            "hazelnut",
            "pistachio",
            "macadamia",
            "brazil nut",
            "pine nut",
            "chestnut",
            "praline",
            "marzipan",
            "nougat",
            "tree nut",
        ],
    ),
    (
        "wheat",
        &[
            "wheat", "flour", "gluten", "semolina", "durum", "spelt", "farina", "bulgur", "couscous", "seitan",
            "bread",
        ],
    ),
    (
        "soy",
        &["soy", "soya", "tofu", "edamame", "miso", "tempeh", "tamari", "shoyu"],
    ),
    (
        "fish",
        &[
            "fish", "anchovy", "cod", "salmon", "tuna", "sardine", "mackerel", "haddock", "tilapia", "trout", "pollock",
            "herring",
        ],
    ),
    (
        "shellfish",
        &[
            "shellfish",
            "shrimp",
            "prawn",
            "crab",
            "lobster",
            "crayfish",
            "krill",
            "scallop",
            "clam",
            "mussel",
            "oyster",
            "squid",
            "crustacean",
        ],
    ),
    ("sesame", &["sesame", "tahini", "gingelly", "benne"]),
];

/// Label -> ingredient keywords evidencing that label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordLexicon {
    pub version: String,
    entries: BTreeMap<String, Vec<String>>,
}

impl KeywordLexicon {
    /// Build a lexicon; labels and keywords are lowercased
    pub fn new<I, K>(version: &str, entries: I) -> Self
    where
        I: IntoIterator<Item = (String, K)>,
        K: IntoIterator<Item = String>,
    {
        let entries = entries
            .into_iter()
            .map(|(label, keywords)| {
                let keywords = keywords
                    .into_iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect();
                (label.trim().to_lowercase(), keywords)
            })
            .collect();
        Self {
            version: version.to_string(),
            entries,
        }
    }

    /// Load a lexicon from a JSON file of the form `{"version": .., "entries": {label: [..]}}`
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read lexicon file: {}", path.display()))?;
        let raw: KeywordLexicon = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse lexicon file: {}", path.display()))?;
        tracing::info!("Loaded keyword lexicon {} from {}", raw.version, path.display());
        Ok(Self::new(&raw.version, raw.entries))
    }

    /// Keywords registered for a label (empty when the label is unknown)
    pub fn keywords(&self, label: &str) -> &[String] {
        self.entries.get(label).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether any keyword of `label` occurs in the lowercased ingredient text
    pub fn is_supported_by_ingredients(&self, label: &str, ingredients_text: &str) -> bool {
        self.supported_in_lowercase(label, &ingredients_text.to_lowercase())
    }

    fn supported_in_lowercase(&self, label: &str, ingredients_lower: &str) -> bool {
        self.keywords(label).iter().any(|k| ingredients_lower.contains(k.as_str()))
    }

    /// Predicted labels with no keyword evidence in the ingredients
    pub fn unsupported_labels<'a>(&self, predicted: &'a LabelSet, ingredients_text: &str) -> Vec<&'a str> {
        let lower = ingredients_text.to_lowercase();
        predicted
            .iter()
            .filter(|label| !self.supported_in_lowercase(label, &lower))
            .collect()
    }

    /// True iff any predicted label is unsupported by the ingredients
    pub fn has_hallucination(&self, predicted: &LabelSet, ingredients_text: &str) -> bool {
        let lower = ingredients_text.to_lowercase();
        predicted.iter().any(|label| !self.supported_in_lowercase(label, &lower))
    }
}

impl Default for KeywordLexicon {
    fn default() -> Self {
        Self::new(
            LEXICON_VERSION,
            DEFAULT_KEYWORDS.iter().map(|(label, keywords)| {
                (label.to_string(), keywords.iter().map(|k| k.to_string()).collect::<Vec<_>>())
            }),
        )
    }
}

/// True iff at least one predicted label is absent from ground truth
pub fn has_over_prediction(predicted: &LabelSet, truth: &LabelSet) -> bool {
    predicted.difference(truth).next().is_some()
}

/// A sample is an abstention case when its ground truth is empty
pub fn is_abstention_case(truth: &LabelSet) -> bool {
    truth.is_empty()
}

/// Safety event counters accumulated over samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyCounts {
    pub samples: usize,
    pub hallucinations: usize,
    pub over_predictions: usize,
    pub abstention_cases: usize,
    pub correct_abstentions: usize,
}

impl SafetyCounts {
    /// Record the safety outcome of one sample
    pub fn observe(&mut self, predicted: &LabelSet, truth: &LabelSet, ingredients_text: &str, lexicon: &KeywordLexicon) {
        self.samples += 1;
        if lexicon.has_hallucination(predicted, ingredients_text) {
            self.hallucinations += 1;
        }
        if has_over_prediction(predicted, truth) {
            self.over_predictions += 1;
        }
        if is_abstention_case(truth) {
            self.abstention_cases += 1;
            if predicted.is_empty() {
                self.correct_abstentions += 1;
            }
        }
    }
}

impl AddAssign for SafetyCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.samples += rhs.samples;
        self.hallucinations += rhs.hallucinations;
        self.over_predictions += rhs.over_predictions;
        self.abstention_cases += rhs.abstention_cases;
        self.correct_abstentions += rhs.correct_abstentions;
    }
}

/// Safety metrics of one model, all percentages in [0, 100]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyMetrics {
    pub hallucination_rate: f64,
    pub over_prediction_rate: f64,
    /// 100 when there are no abstention cases (see `abstention_cases`)
    pub abstention_accuracy: f64,
    pub abstention_cases: usize,
}

impl SafetyMetrics {
    pub fn from_counts(counts: &SafetyCounts) -> Self {
        let abstention_accuracy = if counts.abstention_cases == 0 {
            100.0
        } else {
            percent(counts.correct_abstentions, counts.abstention_cases)
        };
        Self {
            hallucination_rate: percent(counts.hallucinations, counts.samples),
            over_prediction_rate: percent(counts.over_predictions, counts.samples),
            abstention_accuracy,
            abstention_cases: counts.abstention_cases,
        }
    }

    /// Format as a human-readable string
    pub fn format(&self) -> String {
        format!(
            r#"Safety Metrics
==============
Hallucination Rate:   {:.2}%
Over-prediction Rate: {:.2}%
Abstention Accuracy:  {:.2}% ({} cases)
"#,
            self.hallucination_rate, self.over_prediction_rate, self.abstention_accuracy, self.abstention_cases,
        )
    }
}

impl Default for SafetyMetrics {
    fn default() -> Self {
        Self::from_counts(&SafetyCounts::default())
    }
}

fn percent(num: usize, den: usize) -> f64 {
    crate::metrics::ratio(num, den) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(labels: &[&str]) -> LabelSet {
        labels.iter().copied().collect()
    }

    #[test]
    fn test_keyword_support_is_case_insensitive() {
        let lexicon = KeywordLexicon::default();
        assert!(lexicon.is_supported_by_ingredients("milk", "Sugar, Skimmed MILK powder"));
        assert!(lexicon.is_supported_by_ingredients("milk", "cocoa butter"));
        assert!(lexicon.is_supported_by_ingredients("tree nut", "roasted Hazelnuts"));
        assert!(!lexicon.is_supported_by_ingredients("fish", "rice, salt"));
    }

    #[test]
    fn test_hallucination_without_evidence() {
        let lexicon = KeywordLexicon::default();
        assert!(lexicon.has_hallucination(&set(&["milk"]), "sugar, oil"));
        assert!(!lexicon.has_hallucination(&set(&["wheat"]), "wheat flour"));
        assert!(!lexicon.has_hallucination(&LabelSet::new(), "sugar, oil"));
    }

    #[test]
    fn test_unsupported_labels_listed() {
        let lexicon = KeywordLexicon::default();
        let predicted = set(&["wheat", "milk", "soy"]);
        let unsupported = lexicon.unsupported_labels(&predicted, "wheat flour, soya lecithin");
        assert_eq!(unsupported, vec!["milk"]);
    }

    #[test]
    fn test_unknown_label_is_never_supported() {
        let lexicon = KeywordLexicon::default();
        assert!(lexicon.keywords("lupin").is_empty());
        assert!(lexicon.has_hallucination(&set(&["lupin"]), "lupin flour"));
    }

    #[test]
    fn test_over_prediction() {
        assert!(has_over_prediction(&set(&["wheat", "milk"]), &set(&["wheat"])));
        assert!(!has_over_prediction(&set(&["wheat"]), &set(&["wheat", "milk"])));
        assert!(!has_over_prediction(&LabelSet::new(), &set(&["egg"])));
    }

    #[test]
    fn test_abstention_accuracy() {
        let lexicon = KeywordLexicon::default();
        let mut counts = SafetyCounts::default();
        for i in 0..50 {
            let predicted = if i < 45 { LabelSet::new() } else { set(&["milk"]) };
            counts.observe(&predicted, &LabelSet::new(), "water, salt", &lexicon);
        }
        let metrics = SafetyMetrics::from_counts(&counts);

        assert_eq!(metrics.abstention_cases, 50);
        assert!((metrics.abstention_accuracy - 90.0).abs() < 1e-9);
        assert!((metrics.hallucination_rate - 10.0).abs() < 1e-9);
        assert!((metrics.over_prediction_rate - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_abstention_cases_is_vacuously_correct() {
        let metrics = SafetyMetrics::default();
        assert_eq!(metrics.abstention_accuracy, 100.0);
        assert_eq!(metrics.abstention_cases, 0);
        assert_eq!(metrics.hallucination_rate, 0.0);
    }

    #[test]
    fn test_custom_lexicon_lowercases() {
        let lexicon = KeywordLexicon::new(
            "test-v2",
            vec![("Milk".to_string(), vec!["  Kefir ".to_string(), String::new()])],
        );
        assert_eq!(lexicon.keywords("milk"), &["kefir".to_string()]);
        assert!(lexicon.is_supported_by_ingredients("milk", "KEFIR culture"));
    }

    #[test]
    fn test_lexicon_json_round_trip() {
        let dir = std::env::temp_dir().join(format!("allergen_eval_lexicon_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("lexicon.json");
        std::fs::write(&path, r#"{"version": "v9", "entries": {"egg": ["EGG", "yolk"]}}"#).unwrap();

        let lexicon = KeywordLexicon::from_json_file(&path).unwrap();
        assert_eq!(lexicon.version, "v9");
        assert_eq!(lexicon.keywords("egg"), &["egg".to_string(), "yolk".to_string()]);

        std::fs::remove_dir_all(&dir).ok();
    }
}
