use crate::classification::JsonFailureKind;
use thiserror::Error;

/// A convenience `Result` alias using [`DeckwrightError`].
pub type DeckwrightResult<T> = Result<T, DeckwrightError>;

/// Top-level error type for deckwright.
///
/// Transport failures, empty completions, unrecoverable JSON and loop
/// exhaustion each get their own variant so callers can branch on the
/// failure class without string matching.
#[derive(Error, Debug)]
pub enum DeckwrightError {
    /// The request never produced an HTTP response (DNS, connect, TLS, body read).
    #[error("HTTP error: {0}")]
    Http(String),

    /// The provider answered with a non-success status code.
    #[error("HTTP status {status}: {body}")]
    Status {
        /// Numeric HTTP status.
        status: u16,
        /// Response body, truncated for diagnostics.
        body: String,
    },

    /// The call exceeded its deadline or was aborted by the caller.
    #[error("Request timed out after {elapsed_ms} ms (cancelled: {cancelled})")]
    Timeout {
        /// Milliseconds spent before giving up.
        elapsed_ms: u64,
        /// `true` when the caller aborted the call, `false` for a deadline.
        cancelled: bool,
    },

    /// Every attempt (primary, cheaper retry, fallback provider) returned no text.
    #[error("Empty response from {model} after {attempts} attempts")]
    EmptyResponse {
        /// Last model that was asked.
        model: String,
        /// Number of completions attempted.
        attempts: u32,
    },

    /// All local repair layers and cross-model escalation failed.
    #[error("All repair attempts failed ({kind}): {excerpt}")]
    RepairExhausted {
        /// Classification of the offending text.
        kind: JsonFailureKind,
        /// Bounded prefix of the offending text.
        excerpt: String,
    },

    /// The agent loop hit its iteration ceiling without completing.
    #[error("Agent loop exceeded maximum of {iterations} iterations; last output: {excerpt}")]
    MaxIterations {
        /// Iterations performed.
        iterations: u32,
        /// Bounded prefix of the last model text seen, if any.
        excerpt: String,
    },

    /// The response envelope violated the protocol (missing id, bad status pairing).
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The request could not be sent as built (empty input, bad schema).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// The interaction ended in `failed` or `cancelled` status.
    #[error("Agent error: {0}")]
    Agent(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeckwrightError {
    /// HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            DeckwrightError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// `true` when the caller aborted the request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeckwrightError::Timeout { cancelled: true, .. })
    }
}

/// Returns at most `max_chars` characters of `text`, appending an ellipsis
/// marker when something was cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_short_text_untouched() {
        assert_eq!(excerpt("abc", 10), "abc");
    }

    #[test]
    fn test_excerpt_cuts_on_char_boundary() {
        let cut = excerpt("ééééé", 2);
        assert_eq!(cut, "éé…");
    }

    #[test]
    fn test_timeout_cancelled_flag() {
        let err = DeckwrightError::Timeout {
            elapsed_ms: 12,
            cancelled: true,
        };
        assert!(err.is_cancelled());
        assert_eq!(err.status(), None);
    }
}
