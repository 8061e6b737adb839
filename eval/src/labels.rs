// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Allergen label universe and free-text label normalisation
//!
//! Model output and ground truth both arrive as comma-separated strings.
//! [`LabelUniverse::normalize`] turns such a string into a [`LabelSet`] that
//! only ever contains canonical labels of the universe: unknown tokens are
//! dropped rather than reported, so malformed model output never reaches
//! scoring.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// The nine canonical allergen labels, in reporting order
pub const ALLERGENS: [&str; 9] = [
    "milk",
    "egg",
    "peanut",
    "tree nut",
    "wheat",
    "soy",
    "fish",
    "shellfish",
    "sesame",
];

/// Literal token meaning "no allergens"
pub const NONE_TOKEN: &str = "none";

/// Plural, punctuation and synonym variants mapped onto canonical labels
const ALLERGEN_ALIASES: [(&str, &str); 22] = [
    ("eggs", "egg"),
    ("peanuts", "peanut"),
    ("tree nuts", "tree nut"),
    ("tree-nut", "tree nut"),
    ("tree-nuts", "tree nut"),
    ("treenut", "tree nut"),
    ("treenuts", "tree nut"),
    ("gluten", "wheat"),
    ("soya", "soy"),
    ("soybean", "soy"),
    ("soybeans", "soy"),
    ("soy bean", "soy"),
    ("soy beans", "soy"),
    ("fishes", "fish"),
    ("shellfishes", "shellfish"),
    ("shell fish", "shellfish"),
    ("crustacean", "shellfish"),
    ("crustaceans", "shellfish"),
    ("sesame seed", "sesame"),
    ("sesame seeds", "sesame"),
    ("dairy", "milk"),
    ("milks", "milk"),
];

/// A set of canonical labels with set semantics (duplicates collapse)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelSet(BTreeSet<String>);

impl LabelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: impl Into<String>) -> bool {
        self.0.insert(label.into())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.0.contains(label)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Number of labels present in both sets
    pub fn intersection_count(&self, other: &LabelSet) -> usize {
        self.0.intersection(&other.0).count()
    }

    /// Labels in `self` that are missing from `other`
    pub fn difference<'a>(&'a self, other: &'a LabelSet) -> impl Iterator<Item = &'a str> {
        self.0.difference(&other.0).map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for LabelSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Renders as the comma-separated form accepted by the normaliser,
/// `none` for the empty set.
impl fmt::Display for LabelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str(NONE_TOKEN);
        }
        let joined: Vec<&str> = self.iter().collect();
        f.write_str(&joined.join(", "))
    }
}

/// Fixed, ordered set of labels plus the alias table used to reach them
///
/// Built once and passed by reference to the normaliser, the confusion
/// engine and the aggregator; alternate universes can be constructed for
/// testing or for other label vocabularies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelUniverse {
    labels: Vec<String>,
    aliases: HashMap<String, String>,
}

impl LabelUniverse {
    /// Create a universe from canonical labels (lowercased, first occurrence wins)
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ordered: Vec<String> = Vec::new();
        for label in labels {
            let label = clean_token(label.as_ref());
            if !label.is_empty() && label != NONE_TOKEN && !ordered.contains(&label) {
                ordered.push(label);
            }
        }
        Self {
            labels: ordered,
            aliases: HashMap::new(),
        }
    }

    /// Register an alias; ignored when `canonical` is not part of the universe
    pub fn with_alias(mut self, alias: &str, canonical: &str) -> Self {
        let canonical = clean_token(canonical);
        if self.labels.contains(&canonical) {
            self.aliases.insert(clean_token(alias), canonical);
        }
        self
    }

    /// The standard nine-allergen universe with its alias table
    pub fn allergens() -> Self {
        ALLERGEN_ALIASES
            .iter()
            .fold(Self::new(ALLERGENS), |universe, (alias, canonical)| {
                universe.with_alias(alias, canonical)
            })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }

    /// Map one raw token to its canonical label, if it has one
    pub fn canonicalize(&self, token: &str) -> Option<&str> {
        let token = clean_token(token);
        if token.is_empty() || token == NONE_TOKEN {
            return None;
        }
        if let Some(label) = self.labels.iter().find(|l| **l == token) {
            return Some(label.as_str());
        }
        self.aliases.get(&token).map(String::as_str)
    }

    /// Parse a comma-separated allergen string into a subset of the universe
    ///
    /// Total: every input yields a set, unknown tokens are silently dropped.
    pub fn normalize(&self, text: &str) -> LabelSet {
        text.split(',')
            .filter_map(|token| self.canonicalize(token))
            .collect()
    }

    /// True when every label of `set` belongs to this universe
    pub fn covers(&self, set: &LabelSet) -> bool {
        set.iter().all(|label| self.contains(label))
    }
}

impl Default for LabelUniverse {
    fn default() -> Self {
        Self::allergens()
    }
}

/// Lowercase, strip wrapping punctuation and collapse inner whitespace
fn clean_token(raw: &str) -> String {
    let stripped = raw
        .trim()
        .trim_matches(|c: char| matches!(c, '.' | '"' | '\'' | '*' | '[' | ']' | '`' | '-'))
        .to_lowercase();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}
