use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// A tool as declared to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description shown to the model.
    pub description: String,
    /// JSON-schema parameter contract.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Creates a tool definition.
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A request from the model to invoke a specific tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier assigned by the provider for this call.
    pub id: String,
    /// Name of the tool to invoke.
    pub name: String,
    /// Arguments to pass to the tool.
    pub arguments: Value,
}

/// Failure classes a tool execution is folded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Arguments did not satisfy the tool contract.
    Validation,
    /// The tool ran and failed.
    Runtime,
    /// A dependency of the tool could not be reached.
    Network,
    /// The tool, or something it looked up, does not exist.
    NotFound,
    /// A dependency throttled the tool.
    RateLimit,
    /// The tool or a dependency took too long.
    Timeout,
}

impl ToolErrorKind {
    /// Whether calling again with the same arguments may succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ToolErrorKind::Network | ToolErrorKind::RateLimit | ToolErrorKind::Timeout
        )
    }

    /// Model-facing advice for this failure class.
    pub fn default_hint(self) -> &'static str {
        match self {
            ToolErrorKind::Validation => {
                "Check the arguments against the tool's parameter schema and call again."
            }
            ToolErrorKind::Runtime => {
                "The tool failed while running. Try different arguments or another approach."
            }
            ToolErrorKind::Network => "A network dependency was unreachable. Retrying may help.",
            ToolErrorKind::NotFound => "The requested resource does not exist. Do not retry as-is.",
            ToolErrorKind::RateLimit => "The tool is being throttled. Wait before calling it again.",
            ToolErrorKind::Timeout => "The tool timed out. Retry with a smaller request.",
        }
    }
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ToolErrorKind::Validation => "validation",
            ToolErrorKind::Runtime => "runtime",
            ToolErrorKind::Network => "network",
            ToolErrorKind::NotFound => "not_found",
            ToolErrorKind::RateLimit => "rate_limit",
            ToolErrorKind::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

/// A classified tool failure, as the model sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    /// Failure class.
    pub kind: ToolErrorKind,
    /// What went wrong, without stack traces.
    pub message: String,
    /// What the model should do next.
    pub hint: String,
    /// Whether calling again may succeed.
    pub retryable: bool,
}

impl ToolError {
    /// Creates an error with the default hint and retryability for `kind`.
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            hint: kind.default_hint().to_string(),
            retryable: kind.is_retryable(),
        }
    }

    /// Replaces the hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = hint.into();
        self
    }

    /// Overrides retryability.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }
}

/// Outcome of exactly one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolResult {
    /// The tool produced data.
    Success {
        /// Tool output.
        data: Value,
    },
    /// The tool failed; the error is already classified.
    Failure(ToolError),
}

impl ToolResult {
    /// Creates a successful result.
    pub fn success(data: Value) -> Self {
        ToolResult::Success { data }
    }

    /// Creates a failed result.
    pub fn failure(error: ToolError) -> Self {
        ToolResult::Failure(error)
    }

    /// `true` for [`ToolResult::Failure`].
    pub fn is_error(&self) -> bool {
        matches!(self, ToolResult::Failure(_))
    }

    /// The classified error, if any.
    pub fn error(&self) -> Option<&ToolError> {
        match self {
            ToolResult::Failure(err) => Some(err),
            ToolResult::Success { .. } => None,
        }
    }

    /// Wire form sent back to the model:
    /// `{"success": true, "data": ..}` or
    /// `{"success": false, "error": {"kind", "message", "hint", "retryable"}}`.
    pub fn to_observation(&self) -> Value {
        match self {
            ToolResult::Success { data } => json!({ "success": true, "data": data }),
            ToolResult::Failure(err) => json!({
                "success": false,
                "error": {
                    "kind": err.kind,
                    "message": err.message,
                    "hint": err.hint,
                    "retryable": err.retryable,
                }
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_result_success_observation() {
        let result = ToolResult::success(json!({"rows": 3}));
        assert!(!result.is_error());
        let obs = result.to_observation();
        assert_eq!(obs["success"], true);
        assert_eq!(obs["data"]["rows"], 3);
    }

    #[test]
    fn test_tool_result_error_observation() {
        let result = ToolResult::failure(ToolError::new(ToolErrorKind::RateLimit, "slow down"));
        assert!(result.is_error());
        let obs = result.to_observation();
        assert_eq!(obs["success"], false);
        assert_eq!(obs["error"]["kind"], "rate_limit");
        assert_eq!(obs["error"]["retryable"], true);
    }

    #[test]
    fn test_not_found_is_not_retryable() {
        assert!(!ToolErrorKind::NotFound.is_retryable());
        assert!(ToolErrorKind::Timeout.is_retryable());
    }
}
