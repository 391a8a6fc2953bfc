//! Request and response envelopes exchanged with the upstream model.
//!
//! The shapes mirror a stateful "interactions" style API: a request carries
//! typed input blocks plus an optional link to a prior turn, and a response
//! carries a status, typed output blocks and a provider-specific usage
//! object that is normalized by [`crate::usage`].

use crate::error::{DeckwrightError, DeckwrightResult};
use crate::tool::{ToolCall, ToolDefinition};
use crate::usage::{normalize_usage, UsageRecord};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reasoning effort requested from the model. `None` in
/// [`GenerationConfig::thinking_level`] disables reasoning entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    /// Smallest reasoning budget the provider supports.
    Minimal,
    /// Light reasoning.
    Low,
    /// Default reasoning depth.
    Medium,
    /// Deepest reasoning, most budget spent before answering.
    High,
}

/// Sampling and budget parameters for a single call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Cap on generated tokens, reasoning included for most providers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    /// Reasoning effort; `None` disables reasoning.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<ThinkingLevel>,
}

/// A typed block of content, produced by the provider or synthesized
/// locally for tool results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text itself.
        text: String,
    },
    /// The model asks for a tool to be executed.
    FunctionCall {
        /// Provider-assigned call identifier.
        id: String,
        /// Tool name.
        name: String,
        /// Arguments, usually an object; some providers send a JSON string.
        #[serde(default)]
        arguments: Value,
    },
    /// The outcome of a tool execution, sent back to the model.
    FunctionResult {
        /// Identifier of the call this answers.
        call_id: String,
        /// Tool name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Structured observation.
        result: Value,
        /// Whether the observation describes a failure.
        #[serde(default)]
        is_error: bool,
    },
    /// Reasoning trace with an opaque continuation signature.
    Thought {
        /// Opaque token that lets later turns resume the reasoning state.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
        /// Optional human-readable summary.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<Value>,
    },
    /// A provider-side search invocation.
    #[serde(rename = "google_search_call", alias = "search_call")]
    SearchCall {
        /// Call identifier.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// Search arguments (queries).
        #[serde(default)]
        arguments: Value,
    },
    /// Results of a provider-side search.
    #[serde(rename = "google_search_result", alias = "search_result")]
    SearchResult {
        /// Identifier of the originating search call.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        /// Raw result payload.
        #[serde(default)]
        result: Value,
    },
}

impl ContentBlock {
    /// Creates a text block.
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// Returns the text if this is a text block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Request input: a bare prompt or an ordered sequence of blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InteractionInput {
    /// A single prompt string.
    Text(String),
    /// Typed content blocks, oldest first.
    Blocks(Vec<ContentBlock>),
}

impl InteractionInput {
    /// `true` when there is nothing to send.
    pub fn is_empty(&self) -> bool {
        match self {
            InteractionInput::Text(text) => text.trim().is_empty(),
            InteractionInput::Blocks(blocks) => blocks.is_empty(),
        }
    }

    /// Concatenated text content, used by providers that only accept a prompt.
    pub fn to_prompt(&self) -> String {
        match self {
            InteractionInput::Text(text) => text.clone(),
            InteractionInput::Blocks(blocks) => blocks
                .iter()
                .filter_map(ContentBlock::as_text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

impl From<&str> for InteractionInput {
    fn from(value: &str) -> Self {
        InteractionInput::Text(value.to_string())
    }
}

impl From<String> for InteractionInput {
    fn from(value: String) -> Self {
        InteractionInput::Text(value)
    }
}

impl From<Vec<ContentBlock>> for InteractionInput {
    fn from(value: Vec<ContentBlock>) -> Self {
        InteractionInput::Blocks(value)
    }
}

/// Everything needed to ask the model for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRequest {
    /// Model identifier.
    pub model: String,
    /// Prompt or content blocks. Never empty.
    pub input: InteractionInput,
    /// System instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,
    /// Tools the model may call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    /// JSON schema the response must satisfy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    /// MIME type for the response, `application/json` when a schema is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    /// Sampling and budget parameters.
    #[serde(default)]
    pub generation: GenerationConfig,
    /// Identifier of a prior turn for server-side context chaining.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_interaction_id: Option<String>,
}

impl InteractionRequest {
    /// Creates a request with default generation parameters.
    pub fn new(model: impl Into<String>, input: impl Into<InteractionInput>) -> Self {
        Self {
            model: model.into(),
            input: input.into(),
            system_instruction: None,
            tools: Vec::new(),
            response_schema: None,
            response_mime_type: None,
            generation: GenerationConfig::default(),
            previous_interaction_id: None,
        }
    }

    /// Sets the system instruction.
    pub fn with_system(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    /// Declares the tools the model may call.
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Requests JSON output conforming to `schema`.
    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self.response_mime_type = Some("application/json".to_string());
        self
    }

    /// Sets the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.generation.temperature = Some(temperature);
        self
    }

    /// Sets the output token budget.
    pub fn with_max_output_tokens(mut self, max_output_tokens: u32) -> Self {
        self.generation.max_output_tokens = Some(max_output_tokens);
        self
    }

    /// Sets the reasoning effort; `None` disables reasoning.
    pub fn with_thinking(mut self, level: Option<ThinkingLevel>) -> Self {
        self.generation.thinking_level = level;
        self
    }

    /// Chains this request to a prior turn.
    pub fn with_previous_interaction(mut self, id: impl Into<String>) -> Self {
        self.previous_interaction_id = Some(id.into());
        self
    }

    /// Rejects requests that cannot be sent.
    pub fn validate(&self) -> DeckwrightResult<()> {
        if self.model.trim().is_empty() {
            return Err(DeckwrightError::InvalidRequest("model id is empty".into()));
        }
        if self.input.is_empty() {
            return Err(DeckwrightError::InvalidRequest("input is empty".into()));
        }
        Ok(())
    }
}

/// Lifecycle state of a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    /// Still generating.
    #[default]
    InProgress,
    /// Waiting for tool results.
    RequiresAction,
    /// Finished normally.
    Completed,
    /// Provider-side failure.
    Failed,
    /// Aborted before completion.
    Cancelled,
}

/// One turn's answer from the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionResponse {
    /// Opaque turn identifier, usable as `previous_interaction_id`.
    pub id: String,
    /// Turn status.
    pub status: InteractionStatus,
    /// Output blocks in generation order.
    #[serde(default)]
    pub outputs: Vec<ContentBlock>,
    /// Raw provider usage object; see [`InteractionResponse::usage_record`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Value>,
    /// Model that served the turn, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl InteractionResponse {
    /// Concatenated text output, `None` when no text block is present.
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self.outputs.iter().filter_map(ContentBlock::as_text).collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.concat())
        }
    }

    /// `true` when at least one text block carries non-whitespace content.
    pub fn has_text(&self) -> bool {
        self.outputs
            .iter()
            .filter_map(ContentBlock::as_text)
            .any(|t| !t.trim().is_empty())
    }

    /// Tool calls requested in this turn, in order.
    pub fn function_calls(&self) -> Vec<ToolCall> {
        self.outputs
            .iter()
            .filter_map(|block| match block {
                ContentBlock::FunctionCall {
                    id,
                    name,
                    arguments,
                } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// The most recent thought continuation signature, if any.
    pub fn thought_signature(&self) -> Option<&str> {
        self.outputs.iter().rev().find_map(|block| match block {
            ContentBlock::Thought {
                signature: Some(sig),
                ..
            } => Some(sig.as_str()),
            _ => None,
        })
    }

    /// Normalized token accounting for this turn.
    pub fn usage_record(&self) -> Option<UsageRecord> {
        self.usage.as_ref().map(normalize_usage)
    }

    /// Checks envelope invariants: `requires_action` needs a function call.
    pub fn validate(&self) -> DeckwrightResult<()> {
        if self.status == InteractionStatus::RequiresAction
            && !self
                .outputs
                .iter()
                .any(|b| matches!(b, ContentBlock::FunctionCall { .. }))
        {
            return Err(DeckwrightError::InvalidResponse(format!(
                "interaction {} requires action but carries no function_call",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_block_wire_tags() {
        let block = ContentBlock::FunctionCall {
            id: "c1".into(),
            name: "lookup".into(),
            arguments: json!({"q": "rust"}),
        };
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "function_call");

        let search: ContentBlock =
            serde_json::from_value(json!({"type": "search_call", "arguments": {}})).unwrap();
        assert!(matches!(search, ContentBlock::SearchCall { .. }));
    }

    #[test]
    fn test_request_rejects_empty_input() {
        let req = InteractionRequest::new("m", "   ");
        assert!(matches!(
            req.validate(),
            Err(DeckwrightError::InvalidRequest(_))
        ));
        let req = InteractionRequest::new("m", Vec::<ContentBlock>::new());
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_response_text_concatenates_blocks() {
        let resp = InteractionResponse {
            id: "i1".into(),
            status: InteractionStatus::Completed,
            outputs: vec![
                ContentBlock::Thought {
                    signature: Some("sig-a".into()),
                    summary: None,
                },
                ContentBlock::text("{\"a\":"),
                ContentBlock::text("1}"),
            ],
            usage: None,
            model: None,
        };
        assert_eq!(resp.text().as_deref(), Some("{\"a\":1}"));
        assert_eq!(resp.thought_signature(), Some("sig-a"));
    }

    #[test]
    fn test_requires_action_without_call_is_invalid() {
        let resp = InteractionResponse {
            id: "i2".into(),
            status: InteractionStatus::RequiresAction,
            outputs: vec![ContentBlock::text("hm")],
            usage: None,
            model: None,
        };
        assert!(matches!(
            resp.validate(),
            Err(DeckwrightError::InvalidResponse(_))
        ));
    }
}
