//! Tagged stage outputs and the schemas they are validated against.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The structured value produced by a stage operation.
///
/// Outputs are tagged so that a persisted run can be decoded without knowing
/// which pipeline produced it. Each stage declares the [`OutputSchema`] its
/// output must satisfy; the aggregator checks it before scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageOutput {
    /// A scored assessment, the normal output of a pillar.
    Score {
        /// The headline score.
        value: f64,
        /// Named sub-scores.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        breakdown: BTreeMap<String, f64>,
        /// Free-form supporting detail.
        #[serde(default, skip_serializing_if = "Value::is_null")]
        details: Value,
    },
    /// A set of named measurements without a headline score.
    Metrics {
        /// The measurements.
        values: BTreeMap<String, f64>,
    },
    /// An unscored structured document.
    Document {
        /// The document body.
        body: Value,
    },
    /// No output.
    Empty,
}

impl StageOutput {
    /// Creates a score output with no breakdown.
    #[must_use]
    pub fn score(value: f64) -> Self {
        Self::Score {
            value,
            breakdown: BTreeMap::new(),
            details: Value::Null,
        }
    }

    /// Creates a score output with named sub-scores.
    #[must_use]
    pub fn score_with_breakdown<K: Into<String>>(
        value: f64,
        breakdown: impl IntoIterator<Item = (K, f64)>,
    ) -> Self {
        Self::Score {
            value,
            breakdown: breakdown.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            details: Value::Null,
        }
    }

    /// Creates a metrics output.
    #[must_use]
    pub fn metrics<K: Into<String>>(values: impl IntoIterator<Item = (K, f64)>) -> Self {
        Self::Metrics {
            values: values.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Creates a document output.
    #[must_use]
    pub fn document(body: Value) -> Self {
        Self::Document { body }
    }

    /// Attaches supporting detail to a score output. Other variants are
    /// returned unchanged.
    #[must_use]
    pub fn with_details(self, details: Value) -> Self {
        match self {
            Self::Score {
                value, breakdown, ..
            } => Self::Score {
                value,
                breakdown,
                details,
            },
            other => other,
        }
    }

    /// Returns the headline score, if this output carries one.
    #[must_use]
    pub fn score_value(&self) -> Option<f64> {
        match self {
            Self::Score { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Returns the variant name as it appears in the serialized tag.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Score { .. } => "score",
            Self::Metrics { .. } => "metrics",
            Self::Document { .. } => "document",
            Self::Empty => "empty",
        }
    }
}

/// Declared shape of a stage's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputSchema {
    /// Any output is accepted.
    #[default]
    Any,
    /// A score within `[min, max]` carrying the listed breakdown keys.
    Score {
        /// Inclusive lower bound.
        min: f64,
        /// Inclusive upper bound.
        max: f64,
        /// Breakdown keys that must be present.
        #[serde(default)]
        required_breakdown: Vec<String>,
    },
    /// Metrics carrying the listed keys.
    Metrics {
        /// Keys that must be present.
        #[serde(default)]
        required: Vec<String>,
    },
    /// A JSON object document carrying the listed top-level fields.
    Document {
        /// Fields that must be present.
        #[serde(default)]
        required_fields: Vec<String>,
    },
    /// No output is expected.
    Empty,
}

impl OutputSchema {
    /// A score in `[0, 1]`, the range used by the gravity index.
    #[must_use]
    pub fn unit_score() -> Self {
        Self::Score {
            min: 0.0,
            max: 1.0,
            required_breakdown: Vec::new(),
        }
    }

    /// Returns the schema with the listed breakdown keys required. Only
    /// meaningful on score schemas.
    #[must_use]
    pub fn with_required_breakdown<S: Into<String>>(
        self,
        keys: impl IntoIterator<Item = S>,
    ) -> Self {
        match self {
            Self::Score { min, max, .. } => Self::Score {
                min,
                max,
                required_breakdown: keys.into_iter().map(Into::into).collect(),
            },
            other => other,
        }
    }

    /// Returns true if the schema demands a score output.
    #[must_use]
    pub fn expects_score(&self) -> bool {
        matches!(self, Self::Score { .. })
    }

    /// Checks `output` against the schema, describing the first mismatch.
    pub fn validate(&self, output: &StageOutput) -> Result<(), String> {
        match (self, output) {
            (Self::Any, _) | (Self::Empty, StageOutput::Empty) => Ok(()),
            (
                Self::Score {
                    min,
                    max,
                    required_breakdown,
                },
                StageOutput::Score {
                    value, breakdown, ..
                },
            ) => {
                if !value.is_finite() {
                    return Err(format!("score {value} is not finite"));
                }
                if *value < *min || *value > *max {
                    return Err(format!("score {value} outside [{min}, {max}]"));
                }
                missing_keys(required_breakdown, |k| breakdown.contains_key(k))
                    .map_or(Ok(()), |m| Err(format!("missing breakdown keys: {m}")))
            }
            (Self::Metrics { required }, StageOutput::Metrics { values }) => {
                missing_keys(required, |k| values.contains_key(k))
                    .map_or(Ok(()), |m| Err(format!("missing metrics: {m}")))
            }
            (Self::Document { required_fields }, StageOutput::Document { body }) => {
                let Some(object) = body.as_object() else {
                    return Err("document body is not an object".to_string());
                };
                missing_keys(required_fields, |k| object.contains_key(k))
                    .map_or(Ok(()), |m| Err(format!("missing document fields: {m}")))
            }
            (expected, got) => Err(format!(
                "expected {} output, got {}",
                expected.kind(),
                got.kind()
            )),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Score { .. } => "score",
            Self::Metrics { .. } => "metrics",
            Self::Document { .. } => "document",
            Self::Empty => "empty",
        }
    }
}

fn missing_keys(required: &[String], present: impl Fn(&str) -> bool) -> Option<String> {
    let missing: Vec<&str> = required
        .iter()
        .map(String::as_str)
        .filter(|k| !present(k))
        .collect();
    if missing.is_empty() {
        None
    } else {
        Some(missing.join(", "))
    }
}
