// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Record-level error kinds
//!
//! None of these abort an evaluation: a failing record is skipped, logged
//! and counted on the model's aggregate.

use thiserror::Error;

/// Why an input record could not become a scored sample
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum RecordError {
    /// A required field was absent.
    #[error("record {}: missing field `{field}`", display_id(.data_id))]
    MissingField {
        data_id: Option<i64>,
        field: &'static str,
    },

    /// Ingredient text was present but blank.
    #[error("record {data_id}: ingredients text is blank")]
    BlankIngredients { data_id: i64 },

    /// The inference output envelope carried an unreadable efficiency field.
    #[error("record {data_id}: {source}")]
    InvalidEfficiency {
        data_id: i64,
        #[source]
        source: EnvelopeError,
    },
}

/// Failure to read the `KEY=value;...|text` inference output envelope
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnvelopeError {
    /// A `KEY=value` pair lacked the `=` separator.
    #[error("malformed efficiency field `{0}`")]
    MalformedField(String),

    /// The value of a known key was not an integer.
    #[error("efficiency field `{key}` has non-numeric value `{value}`")]
    NotNumeric { key: String, value: String },
}

fn display_id(data_id: &Option<i64>) -> String {
    data_id.map_or_else(|| "<unknown>".to_string(), |id| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_record() {
        let missing = RecordError::MissingField {
            data_id: Some(7),
            field: "predicted_allergens",
        };
        assert_eq!(missing.to_string(), "record 7: missing field `predicted_allergens`");

        let unknown = RecordError::MissingField {
            data_id: None,
            field: "data_id",
        };
        assert!(unknown.to_string().contains("<unknown>"));

        let efficiency = RecordError::InvalidEfficiency {
            data_id: 3,
            source: EnvelopeError::NotNumeric {
                key: "TTFT_MS".to_string(),
                value: "fast".to_string(),
            },
        };
        assert!(efficiency.to_string().contains("TTFT_MS"));
    }
}
