//! Core types and error definitions for deckwright.
//!
//! This crate provides the foundational types shared across all deckwright
//! crates: the interaction envelopes exchanged with the model, the tool
//! contract, the JSON failure taxonomy and the usage normalizer.
//!
//! # Main types
//!
//! - [`DeckwrightError`]: Unified error enum for all deckwright subsystems.
//! - [`DeckwrightResult`]: Convenience alias for `Result<T, DeckwrightError>`.
//! - [`InteractionRequest`] / [`InteractionResponse`]: One model turn.
//! - [`ContentBlock`]: Typed input/output block (text, function call, thought, ...).
//! - [`ToolDefinition`], [`ToolCall`], [`ToolResult`]: Tool contract.
//! - [`JsonClassification`]: Verdict on why model text failed to parse.
//! - [`UsageRecord`]: Canonical token accounting.

/// JSON failure taxonomy.
pub mod classification;
/// Error taxonomy.
pub mod error;
/// Interaction request/response envelopes.
pub mod interaction;
/// Tool contract types.
pub mod tool;
/// Provider usage normalization.
pub mod usage;

pub use classification::{Confidence, JsonClassification, JsonFailureKind};
pub use error::{excerpt, DeckwrightError, DeckwrightResult};
pub use interaction::{
    ContentBlock, GenerationConfig, InteractionInput, InteractionRequest, InteractionResponse,
    InteractionStatus, ThinkingLevel,
};
pub use tool::{ToolCall, ToolDefinition, ToolError, ToolErrorKind, ToolResult};
pub use usage::{normalize_usage, UsageField, UsageRecord, USAGE_ALIASES};
