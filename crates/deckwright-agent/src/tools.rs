use async_trait::async_trait;
use deckwright_core::{ToolCall, ToolDefinition, ToolError, ToolErrorKind, ToolResult};
use deckwright_repair::{RepairOutcome, RepairPipeline, ShapeHints};
use futures_util::FutureExt;
use jsonschema::JSONSchema;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Error type tools report. Its message is classified; it never reaches the
/// model verbatim as a stack trace.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A callable tool exposed to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name, description and JSON Schema of the parameters.
    fn definition(&self) -> &ToolDefinition;

    /// Runs the tool with already-validated arguments.
    async fn execute(&self, arguments: Value) -> Result<Value, BoxError>;
}

/// Substrings that identify each error class, checked in this order.
const ERROR_PATTERNS: &[(ToolErrorKind, &[&str])] = &[
    (
        ToolErrorKind::RateLimit,
        &["rate limit", "rate_limit", "ratelimit", "too many requests", "429", "quota"],
    ),
    (
        ToolErrorKind::Timeout,
        &["timeout", "timed out", "deadline exceeded", "etimedout"],
    ),
    (
        ToolErrorKind::NotFound,
        &["not found", "not_found", "404", "no such", "does not exist", "enoent"],
    ),
    (
        ToolErrorKind::Validation,
        &["invalid", "validation", "missing required", "malformed", "must be", "expected"],
    ),
    (
        ToolErrorKind::Network,
        &["network", "connection", "econnrefused", "econnreset", "dns", "unreachable", "socket"],
    ),
];

/// Classifies a raw tool error message by known substrings, each matched
/// at the start of a word. Anything unrecognised is a `runtime` error.
pub fn classify_tool_error(message: &str) -> ToolErrorKind {
    let lower = message.to_lowercase();
    ERROR_PATTERNS
        .iter()
        .find(|(_, needles)| needles.iter().any(|n| starts_word(&lower, n)))
        .map_or(ToolErrorKind::Runtime, |(kind, _)| *kind)
}

/// `true` if `needle` occurs in `haystack` not preceded by a letter or digit.
fn starts_word(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(i, _)| {
        !haystack[..i]
            .chars()
            .next_back()
            .is_some_and(char::is_alphanumeric)
    })
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    validator: Option<JSONSchema>,
}

/// Central registry for the tools an agent loop may call.
///
/// Execution always yields exactly one [`ToolResult`]: unknown names,
/// malformed or schema-violating arguments, returned errors and panics are
/// all folded into a classified failure.
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
    pipeline: RepairPipeline,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            pipeline: RepairPipeline::default(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let definition = tool.definition();
        let name = definition.name.clone();
        let validator = match JSONSchema::compile(&definition.parameters) {
            Ok(compiled) => Some(compiled),
            Err(e) => {
                warn!(tool = %name, error = %e, "Parameter schema does not compile, arguments will not be validated");
                None
            }
        };
        info!(tool = %name, "Registered tool");
        self.tools.insert(name, RegisteredTool { tool, validator });
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name).map(|t| &t.tool)
    }

    /// Registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Definitions to declare to the model, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| t.tool.definition().clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Result for a call to a tool that is not registered.
    pub fn not_found(&self, name: &str) -> ToolResult {
        let available = self.names().join(", ");
        ToolResult::failure(
            ToolError::new(
                ToolErrorKind::NotFound,
                format!("Unknown tool '{name}'. Available tools: {available}"),
            )
            .with_hint("Call one of the available tools instead.")
            .with_retryable(false),
        )
    }

    /// Executes one call.
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let Some(registered) = self.tools.get(&call.name) else {
            warn!(tool = %call.name, "Call to unknown tool");
            return self.not_found(&call.name);
        };

        let arguments = match self.prepare_arguments(&call.arguments) {
            Ok(args) => args,
            Err(err) => return ToolResult::failure(err),
        };

        if let Some(ref validator) = registered.validator {
            if let Err(errors) = validator.validate(&arguments) {
                let detail: Vec<String> = errors
                    .map(|e| {
                        let path = e.instance_path.to_string();
                        if path.is_empty() {
                            e.to_string()
                        } else {
                            format!("{path}: {e}")
                        }
                    })
                    .collect();
                warn!(tool = %call.name, errors = detail.len(), "Tool arguments failed schema validation");
                return ToolResult::failure(ToolError::new(
                    ToolErrorKind::Validation,
                    format!("Invalid arguments for '{}': {}", call.name, detail.join("; ")),
                ));
            }
        }

        debug!(tool = %call.name, call_id = %call.id, "Executing tool");
        match AssertUnwindSafe(registered.tool.execute(arguments))
            .catch_unwind()
            .await
        {
            Ok(Ok(data)) => ToolResult::success(data),
            Ok(Err(e)) => {
                let message = e.to_string();
                let kind = classify_tool_error(&message);
                warn!(tool = %call.name, kind = %kind, error = %message, "Tool failed");
                ToolResult::failure(ToolError::new(kind, message))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(tool = %call.name, panic = %message, "Tool panicked");
                ToolResult::failure(ToolError::new(
                    ToolErrorKind::Runtime,
                    format!("Tool '{}' crashed: {message}", call.name),
                ))
            }
        }
    }

    /// Normalizes call arguments to a JSON value.
    ///
    /// Some providers send arguments as a JSON-encoded string; a malformed
    /// string goes through the local repair pipeline before giving up.
    fn prepare_arguments(&self, raw: &Value) -> Result<Value, ToolError> {
        match raw {
            Value::Null => Ok(Value::Object(Map::new())),
            Value::String(text) => {
                if text.trim().is_empty() {
                    return Ok(Value::Object(Map::new()));
                }
                if let Ok(value) = serde_json::from_str::<Value>(text) {
                    return Ok(value);
                }
                let report = self.pipeline.recover(text, &ShapeHints::object());
                match (report.outcome, report.value) {
                    (RepairOutcome::Repaired { layer }, Some(value)) => {
                        info!(layer = %layer, "Repaired malformed tool arguments");
                        Ok(value)
                    }
                    (RepairOutcome::Direct, Some(value)) => Ok(value),
                    _ => Err(ToolError::new(
                        ToolErrorKind::Validation,
                        "Tool arguments are not valid JSON",
                    )
                    .with_hint("Send the arguments as a single JSON object.")),
                }
            }
            other => Ok(other.clone()),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
