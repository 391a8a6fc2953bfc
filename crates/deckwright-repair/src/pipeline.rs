use crate::classifier::{is_flat_string_array, FailureClassifier};
use crate::detector::DegenerationDetector;
use crate::layers::{self, Step};
use crate::shape::ShapeHints;
use deckwright_core::{Confidence, JsonClassification, JsonFailureKind};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn};

/// Default ceiling above which repair is abandoned outright.
pub const DEFAULT_MAX_REPAIR_BYTES: usize = 15_000;

/// One local repair strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairLayer {
    /// Bare string list wrapped into the minimal wrapper structure.
    StringArrayWrap,
    /// Well-formed value reshaped into the expected root.
    ShapeCoercion,
    /// Double-encoded payload decoded.
    Unescape,
    /// Balanced prefix kept, junk suffix discarded.
    PrefixExtraction,
    /// Repetition loop cut, enums corrected, structures closed.
    DegenerationSalvage,
    /// Dangling fragments fixed, structures closed.
    TruncationRepair,
    /// Junk idioms collapsed.
    SemanticCleanup,
}

impl fmt::Display for RepairLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RepairLayer::StringArrayWrap => "string_array_wrap",
            RepairLayer::ShapeCoercion => "shape_coercion",
            RepairLayer::Unescape => "unescape",
            RepairLayer::PrefixExtraction => "prefix_extraction",
            RepairLayer::DegenerationSalvage => "degeneration_salvage",
            RepairLayer::TruncationRepair => "truncation_repair",
            RepairLayer::SemanticCleanup => "semantic_cleanup",
        };
        f.write_str(name)
    }
}

/// Why a fallback value was returned instead of a repaired one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    /// The text exceeded the repair size ceiling.
    Oversized,
    /// Degenerate output that no layer could salvage.
    DegenerationExhausted,
}

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RepairOutcome {
    /// The text parsed with the expected shape; no layer ran.
    Direct,
    /// A layer produced the value.
    Repaired {
        /// The successful layer.
        layer: RepairLayer,
    },
    /// The shape's fallback value was returned.
    Fallback {
        /// Why repair was abandoned.
        reason: FallbackReason,
    },
    /// Every local layer passed; escalation is the caller's decision.
    Exhausted,
}

/// Result of one pipeline run, including what was tried.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairReport {
    /// How the run ended.
    pub outcome: RepairOutcome,
    /// The recovered value, already normalized. `None` when exhausted.
    pub value: Option<Value>,
    /// Verdict on the text. `None` for direct parses and oversized text.
    pub classification: Option<JsonClassification>,
    /// Layers attempted, in order.
    pub attempted: Vec<RepairLayer>,
}

impl RepairReport {
    /// `true` when a value (repaired or fallback) is available.
    pub fn is_recovered(&self) -> bool {
        self.value.is_some()
    }

    /// Failure kind, or `unknown` when the text was never classified.
    pub fn kind(&self) -> JsonFailureKind {
        self.classification
            .as_ref()
            .map_or(JsonFailureKind::Unknown, |c| c.kind)
    }
}

/// Ordered chain of local repair layers, selected by the classifier.
#[derive(Debug, Clone)]
pub struct RepairPipeline {
    classifier: FailureClassifier,
    max_repair_bytes: usize,
}

impl Default for RepairPipeline {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REPAIR_BYTES)
    }
}

impl RepairPipeline {
    /// Creates a pipeline with the given size ceiling.
    pub fn new(max_repair_bytes: usize) -> Self {
        Self {
            classifier: FailureClassifier::default(),
            max_repair_bytes,
        }
    }

    /// Replaces the degeneration detector.
    pub fn with_detector(mut self, detector: DegenerationDetector) -> Self {
        self.classifier = FailureClassifier::new(detector);
        self
    }

    /// The classifier in use.
    pub fn classifier(&self) -> &FailureClassifier {
        &self.classifier
    }

    /// The size ceiling in bytes.
    pub fn max_repair_bytes(&self) -> usize {
        self.max_repair_bytes
    }

    /// Classifies text that failed to parse.
    pub fn classify(&self, text: &str) -> JsonClassification {
        self.classifier.classify(text)
    }

    /// Turns raw model text into a value of the expected shape.
    ///
    /// Valid JSON of the expected shape is returned as-is (normalized) and
    /// no layer runs, whatever its size. Any other text over the size
    /// ceiling returns the fallback value without classification.
    /// Everything else is classified and run through the layers for its
    /// failure kind, first success wins.
    pub fn recover(&self, text: &str, shape: &ShapeHints) -> RepairReport {
        let trimmed = text.trim();
        let parsed = match serde_json::from_str::<Value>(trimmed) {
            Ok(value) if shape.accepts(&value) => {
                return RepairReport {
                    outcome: RepairOutcome::Direct,
                    value: Some(shape.normalize(value)),
                    classification: None,
                    attempted: Vec::new(),
                };
            }
            Ok(value) => Some(value),
            Err(_) => None,
        };

        if text.len() > self.max_repair_bytes {
            warn!(
                bytes = text.len(),
                ceiling = self.max_repair_bytes,
                "Text exceeds the repair size ceiling, returning fallback"
            );
            return RepairReport {
                outcome: RepairOutcome::Fallback {
                    reason: FallbackReason::Oversized,
                },
                value: Some(shape.fallback_value()),
                classification: None,
                attempted: Vec::new(),
            };
        }

        match parsed {
            Some(value) => {
                let classification = drift_classification(&value, trimmed, shape);
                self.run(trimmed, classification, shape)
            }
            None => {
                let classification = self.classifier.classify(text);
                self.run(text, classification, shape)
            }
        }
    }

    fn run(
        &self,
        text: &str,
        classification: JsonClassification,
        shape: &ShapeHints,
    ) -> RepairReport {
        let mut attempted = Vec::new();
        let found = self.run_layers(text, &classification, shape, &mut attempted, true);

        let (outcome, value) = match found {
            Some((layer, value)) => {
                info!(%layer, kind = %classification.kind, "Repair layer succeeded");
                (RepairOutcome::Repaired { layer }, Some(shape.normalize(value)))
            }
            None if classification.kind == JsonFailureKind::Degeneration => {
                warn!("Degenerate output could not be salvaged, returning fallback");
                (
                    RepairOutcome::Fallback {
                        reason: FallbackReason::DegenerationExhausted,
                    },
                    Some(shape.fallback_value()),
                )
            }
            None => {
                debug!(kind = %classification.kind, "All local repair layers passed");
                (RepairOutcome::Exhausted, None)
            }
        };

        RepairReport {
            outcome,
            value,
            classification: Some(classification),
            attempted,
        }
    }

    fn run_layers(
        &self,
        text: &str,
        classification: &JsonClassification,
        shape: &ShapeHints,
        attempted: &mut Vec<RepairLayer>,
        allow_nested: bool,
    ) -> Option<(RepairLayer, Value)> {
        let mut candidate = text.to_string();

        for &layer in plan(classification.kind) {
            attempted.push(layer);
            let step = match layer {
                RepairLayer::StringArrayWrap => layers::string_array_wrap(&candidate, shape),
                RepairLayer::ShapeCoercion => layers::shape_coercion(&candidate, shape),
                RepairLayer::Unescape => layers::unescape(&candidate),
                RepairLayer::PrefixExtraction => layers::prefix_extraction(&candidate),
                RepairLayer::DegenerationSalvage => {
                    layers::degeneration_salvage(&candidate, self.classifier.detector(), shape)
                }
                RepairLayer::TruncationRepair => layers::truncation_repair(&candidate),
                RepairLayer::SemanticCleanup => layers::semantic_cleanup(&candidate),
            };

            match step {
                Step::Parsed(value) => match shape.coerce(value) {
                    Some(value) => return Some((layer, value)),
                    None => debug!(%layer, "Layer parsed a value of the wrong shape"),
                },
                Step::Pass(next) => {
                    debug!(%layer, "Repair layer passed");
                    if layer == RepairLayer::Unescape && allow_nested {
                        let inner = self.classifier.classify(&next);
                        if let Some(found) =
                            self.run_layers(&next, &inner, shape, attempted, false)
                        {
                            return Some(found);
                        }
                    }
                    candidate = next;
                }
            }
        }
        None
    }
}

/// Layers to try for each failure kind, in order.
fn plan(kind: JsonFailureKind) -> &'static [RepairLayer] {
    use RepairLayer::*;
    match kind {
        JsonFailureKind::EmptyResponse => &[],
        JsonFailureKind::StringArray => &[StringArrayWrap],
        JsonFailureKind::SchemaDrift => &[ShapeCoercion],
        JsonFailureKind::EscapedJson => &[Unescape],
        JsonFailureKind::GarbageSuffix => &[PrefixExtraction, TruncationRepair, SemanticCleanup],
        JsonFailureKind::Degeneration => {
            &[DegenerationSalvage, TruncationRepair, SemanticCleanup]
        }
        JsonFailureKind::Truncation | JsonFailureKind::Unknown => {
            &[TruncationRepair, PrefixExtraction, SemanticCleanup]
        }
    }
}

/// Verdict for text that parsed but has the wrong shape.
fn drift_classification(value: &Value, text: &str, shape: &ShapeHints) -> JsonClassification {
    let kind = match value {
        Value::String(_) => JsonFailureKind::EscapedJson,
        Value::Array(_) if shape.expects_objects() && is_flat_string_array(text) => {
            JsonFailureKind::StringArray
        }
        _ => JsonFailureKind::SchemaDrift,
    };
    JsonClassification::new(kind, Confidence::High)
}
