use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a piece of model text failed to parse as JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JsonFailureKind {
    /// A complete value followed by junk (`{"a":1}, ""`).
    GarbageSuffix,
    /// Output stopped before all brackets or strings were closed.
    Truncation,
    /// The payload was JSON-encoded twice (`"{\"a\":1}"`).
    EscapedJson,
    /// The value parses but does not have the expected shape.
    SchemaDrift,
    /// A flat array of strings where an array of objects was expected.
    StringArray,
    /// No text at all.
    EmptyResponse,
    /// The model fell into a repetition loop.
    Degeneration,
    /// None of the above.
    Unknown,
}

impl fmt::Display for JsonFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JsonFailureKind::GarbageSuffix => "garbage_suffix",
            JsonFailureKind::Truncation => "truncation",
            JsonFailureKind::EscapedJson => "escaped_json",
            JsonFailureKind::SchemaDrift => "schema_drift",
            JsonFailureKind::StringArray => "string_array",
            JsonFailureKind::EmptyResponse => "empty_response",
            JsonFailureKind::Degeneration => "degeneration",
            JsonFailureKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// How sure the classifier is about its verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// Fallback verdict, repair may still succeed by accident.
    Low,
    /// Structural evidence without a decisive signature.
    Medium,
    /// Signature match (empty text, repetition run, balanced prefix).
    High,
}

/// Verdict produced once per failed parse attempt. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonClassification {
    /// Failure mode.
    pub kind: JsonFailureKind,
    /// Certainty of `kind`.
    pub confidence: Confidence,
    /// Byte offset one past the end of the longest balanced prefix, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_prefix_end: Option<usize>,
}

impl JsonClassification {
    /// Creates a verdict without prefix information.
    pub fn new(kind: JsonFailureKind, confidence: Confidence) -> Self {
        Self {
            kind,
            confidence,
            valid_prefix_end: None,
        }
    }

    /// Attaches the end offset of the balanced prefix.
    pub fn with_prefix_end(mut self, end: usize) -> Self {
        self.valid_prefix_end = Some(end);
        self
    }

    /// The worst-case verdict.
    pub fn unknown() -> Self {
        Self::new(JsonFailureKind::Unknown, Confidence::Low)
    }
}
