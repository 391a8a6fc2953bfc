//! JSON failure classification and layered repair for deckwright.
//!
//! Model output that is supposed to be JSON fails in a handful of
//! recognisable ways. This crate names those ways ([`FailureClassifier`]),
//! and repairs each one with the strategy that suits it
//! ([`RepairPipeline`]), because a fix tuned for one failure corrupts
//! another: auto-closing brackets on a garbage suffix yields plausible but
//! wrong JSON.
//!
//! # Main types
//!
//! - [`RepairPipeline`]: Entry point: raw text in, [`RepairReport`] out.
//! - [`FailureClassifier`]: Priority-ordered verdict on unparseable text.
//! - [`DegenerationDetector`]: Repetition-loop detection with named strategies.
//! - [`ShapeHints`]: Expected shape, defaults, enums and fallback value.

/// Priority-ordered failure classification.
pub mod classifier;
/// Repetition-loop detection.
pub mod detector;
mod layers;
/// Layer selection and the recovery entry point.
pub mod pipeline;
/// Bracket scanning and closer synthesis.
pub mod scanner;
/// Expected-shape hints and normalization.
pub mod shape;

pub use classifier::{is_flat_string_array, FailureClassifier};
pub use detector::{DegenerationDetector, DetectorConfig, Repetition, Strategy};
pub use pipeline::{
    FallbackReason, RepairLayer, RepairOutcome, RepairPipeline, RepairReport,
    DEFAULT_MAX_REPAIR_BYTES,
};
pub use scanner::{close_open_structures, scan, strip_preamble, ScanState};
pub use shape::{RootKind, ShapeHints};
