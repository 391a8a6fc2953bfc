use crate::detector::{DegenerationDetector, Strategy};
use crate::scanner::scan;
use deckwright_core::{Confidence, JsonClassification, JsonFailureKind};
use serde_json::Value;

/// Assigns a [`JsonClassification`] to text that failed to parse.
///
/// Checks run in a fixed priority order and the first match wins, so a
/// degenerate loop that also happens to be truncated is reported as
/// degeneration.
#[derive(Debug, Clone, Default)]
pub struct FailureClassifier {
    detector: DegenerationDetector,
}

impl FailureClassifier {
    /// Creates a classifier sharing the given detector's thresholds.
    pub fn new(detector: DegenerationDetector) -> Self {
        Self { detector }
    }

    /// The degeneration detector used for checks 2 through 4.
    pub fn detector(&self) -> &DegenerationDetector {
        &self.detector
    }

    /// Classifies `text`. Never panics; the worst case is
    /// [`JsonClassification::unknown`].
    pub fn classify(&self, text: &str) -> JsonClassification {
        if text.trim().is_empty() {
            return JsonClassification::new(JsonFailureKind::EmptyResponse, Confidence::High);
        }

        if let Some(rep) = self.detector.detect(text) {
            let confidence = match rep.strategy {
                Strategy::CharRun | Strategy::PhraseLoop => Confidence::High,
                Strategy::SubstringLoop | Strategy::WordLoop => {
                    let repeats = (rep.end - rep.start) / rep.period.max(1);
                    if repeats >= 8 {
                        Confidence::High
                    } else {
                        Confidence::Medium
                    }
                }
            };
            return JsonClassification::new(JsonFailureKind::Degeneration, confidence);
        }

        if is_flat_string_array(text) {
            return JsonClassification::new(JsonFailureKind::StringArray, Confidence::High);
        }

        let trimmed = text.trim_start();
        if trimmed.starts_with('"') && trimmed.contains("\\\"") {
            return JsonClassification::new(JsonFailureKind::EscapedJson, Confidence::Medium);
        }

        classify_structure(text)
    }
}

/// `true` for a non-empty JSON array whose elements are all strings.
pub fn is_flat_string_array(text: &str) -> bool {
    match serde_json::from_str::<Value>(text.trim()) {
        Ok(Value::Array(items)) => !items.is_empty() && items.iter().all(Value::is_string),
        _ => false,
    }
}

fn classify_structure(text: &str) -> JsonClassification {
    let state = scan(text);
    if state.start.is_none() {
        return JsonClassification::unknown();
    }

    match state.last_balanced_end {
        Some(end) if end < text.len() && state.open.is_empty() && is_junk(&text[end..]) => {
            JsonClassification::new(JsonFailureKind::GarbageSuffix, Confidence::High)
                .with_prefix_end(end)
        }
        None => JsonClassification::new(JsonFailureKind::Truncation, Confidence::High),
        Some(_) if !state.open.is_empty() => {
            JsonClassification::new(JsonFailureKind::Truncation, Confidence::Low)
        }
        Some(_) => JsonClassification::unknown(),
    }
}

fn is_junk(rest: &str) -> bool {
    rest.chars()
        .all(|c| c.is_whitespace() || c.is_ascii_punctuation())
}
