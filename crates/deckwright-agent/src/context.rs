use crate::config::ContextFolding;
use deckwright_core::{
    ContentBlock, DeckwrightError, InteractionInput, InteractionResponse, ToolCall, ToolResult,
};
use std::collections::HashMap;

/// Body substrings that indicate the provider no longer accepts a
/// continuation id. Best-effort: providers word this differently.
const CONTINUATION_REJECTION_MARKERS: &[&str] = &[
    "previous_interaction_id",
    "previous interaction",
    "interaction not found",
    "interaction_not_found",
    "invalid interaction",
    "interaction has expired",
];

/// Whether `err` looks like the provider rejecting a continuation id.
pub fn is_continuation_rejection(err: &DeckwrightError) -> bool {
    match err {
        DeckwrightError::Status { status, body } if matches!(status, 400 | 404 | 409 | 410) => {
            let body = body.to_lowercase();
            CONTINUATION_REJECTION_MARKERS
                .iter()
                .any(|marker| body.contains(marker))
        }
        _ => false,
    }
}

/// Conversation state owned by one agent loop run.
///
/// Keeps the full transcript for providers (or moments) that need it, and
/// the delta since the last successful turn for server-side continuation.
pub struct ConversationContext {
    history: Vec<ContentBlock>,
    delta: Vec<ContentBlock>,
    folding: ContextFolding,
    previous_interaction_id: Option<String>,
    thought_signature: Option<String>,
    failure_counts: HashMap<String, u32>,
}

impl ConversationContext {
    pub fn new(input: InteractionInput, folding: ContextFolding) -> Self {
        let blocks = match input {
            InteractionInput::Text(text) => vec![ContentBlock::text(text)],
            InteractionInput::Blocks(blocks) => blocks,
        };
        Self {
            history: blocks.clone(),
            delta: blocks,
            folding,
            previous_interaction_id: None,
            thought_signature: None,
            failure_counts: HashMap::new(),
        }
    }

    /// Input for the next turn, and the continuation id to send with it.
    ///
    /// Full history goes out on the first turn, when folding is disabled,
    /// and after a rejected continuation. Otherwise only the delta is sent,
    /// prefixed with the retained thought signature when threading is on.
    pub fn next_input(&self, thread_signature: bool) -> (InteractionInput, Option<String>) {
        match (&self.folding, &self.previous_interaction_id) {
            (ContextFolding::ServerDelta, Some(prev)) => {
                let mut blocks = Vec::with_capacity(self.delta.len() + 1);
                if thread_signature {
                    if let Some(ref sig) = self.thought_signature {
                        blocks.push(ContentBlock::Thought {
                            signature: Some(sig.clone()),
                            summary: None,
                        });
                    }
                }
                blocks.extend(self.delta.iter().cloned());
                (InteractionInput::Blocks(blocks), Some(prev.clone()))
            }
            _ => (InteractionInput::Blocks(self.history.clone()), None),
        }
    }

    /// Appends the model's turn and starts a fresh delta.
    pub fn record_response(&mut self, response: &InteractionResponse) {
        self.history.extend(response.outputs.iter().cloned());
        self.delta.clear();
        self.previous_interaction_id = Some(response.id.clone());
        if let Some(sig) = response.thought_signature() {
            self.thought_signature = Some(sig.to_string());
        }
    }

    /// Appends a tool observation to both history and delta.
    pub fn push_tool_result(&mut self, call: &ToolCall, result: &ToolResult) {
        self.push(ContentBlock::FunctionResult {
            call_id: call.id.clone(),
            name: Some(call.name.clone()),
            result: result.to_observation(),
            is_error: result.is_error(),
        });
    }

    /// Appends a user-side block to both history and delta.
    pub fn push(&mut self, block: ContentBlock) {
        self.history.push(block.clone());
        self.delta.push(block);
    }

    /// Forgets the continuation id so the next turn sends full history.
    pub fn drop_continuation(&mut self) {
        self.previous_interaction_id = None;
    }

    pub fn thought_signature(&self) -> Option<&str> {
        self.thought_signature.as_deref()
    }

    pub fn history(&self) -> &[ContentBlock] {
        &self.history
    }

    /// Consecutive failures of `tool`.
    pub fn failures(&self, tool: &str) -> u32 {
        self.failure_counts.get(tool).copied().unwrap_or(0)
    }

    /// Counts a failure, or resets the streak on success.
    pub fn note_result(&mut self, tool: &str, result: &ToolResult) {
        if result.is_error() {
            *self.failure_counts.entry(tool.to_string()).or_insert(0) += 1;
        } else {
            self.failure_counts.remove(tool);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use deckwright_core::{InteractionStatus, ToolError, ToolErrorKind};
    use serde_json::json;

    fn response(id: &str, outputs: Vec<ContentBlock>) -> InteractionResponse {
        InteractionResponse {
            id: id.into(),
            status: InteractionStatus::RequiresAction,
            outputs,
            usage: None,
            model: None,
        }
    }

    fn call() -> ToolCall {
        ToolCall {
            id: "c1".into(),
            name: "search".into(),
            arguments: json!({}),
        }
    }

    fn blocks(input: InteractionInput) -> Vec<ContentBlock> {
        match input {
            InteractionInput::Blocks(b) => b,
            InteractionInput::Text(t) => vec![ContentBlock::text(t)],
        }
    }

    #[test]
    fn test_first_turn_sends_full_history() {
        let ctx = ConversationContext::new("hello".into(), ContextFolding::ServerDelta);
        let (input, prev) = ctx.next_input(true);
        assert!(prev.is_none());
        assert_eq!(blocks(input), vec![ContentBlock::text("hello")]);
    }

    #[test]
    fn test_later_turns_send_delta_with_signature() {
        let mut ctx = ConversationContext::new("hello".into(), ContextFolding::ServerDelta);
        ctx.record_response(&response(
            "int_1",
            vec![
                ContentBlock::Thought {
                    signature: Some("sig".into()),
                    summary: None,
                },
                ContentBlock::FunctionCall {
                    id: "c1".into(),
                    name: "search".into(),
                    arguments: json!({}),
                },
            ],
        ));
        ctx.push_tool_result(&call(), &ToolResult::success(json!({"hits": 1})));

        let (input, prev) = ctx.next_input(true);
        assert_eq!(prev.as_deref(), Some("int_1"));
        let sent = blocks(input);
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0], ContentBlock::Thought { .. }));
        assert!(matches!(sent[1], ContentBlock::FunctionResult { .. }));

        let (input, _) = ctx.next_input(false);
        assert_eq!(blocks(input).len(), 1);
        assert_eq!(ctx.history().len(), 4);
    }

    #[test]
    fn test_full_history_mode_never_continues() {
        let mut ctx = ConversationContext::new("hello".into(), ContextFolding::FullHistory);
        ctx.record_response(&response("int_1", vec![ContentBlock::text("thinking")]));
        ctx.push(ContentBlock::text("more"));
        let (input, prev) = ctx.next_input(true);
        assert!(prev.is_none());
        assert_eq!(blocks(input).len(), 3);
    }

    #[test]
    fn test_dropped_continuation_falls_back_to_history() {
        let mut ctx = ConversationContext::new("hello".into(), ContextFolding::ServerDelta);
        ctx.record_response(&response("int_1", vec![ContentBlock::text("a")]));
        ctx.push(ContentBlock::text("b"));
        ctx.drop_continuation();
        let (input, prev) = ctx.next_input(true);
        assert!(prev.is_none());
        assert_eq!(blocks(input).len(), 3);
    }

    #[test]
    fn test_failure_streak_resets_on_success() {
        let mut ctx = ConversationContext::new("hello".into(), ContextFolding::ServerDelta);
        let failure = ToolResult::failure(ToolError::new(ToolErrorKind::Timeout, "slow"));
        ctx.note_result("search", &failure);
        ctx.note_result("search", &failure);
        assert_eq!(ctx.failures("search"), 2);
        ctx.note_result("search", &ToolResult::success(json!(null)));
        assert_eq!(ctx.failures("search"), 0);
    }

    #[test]
    fn test_continuation_rejection_heuristic() {
        let rejected = DeckwrightError::Status {
            status: 400,
            body: r#"{"error": {"message": "Invalid previous_interaction_id"}}"#.into(),
        };
        assert!(is_continuation_rejection(&rejected));

        let unrelated = DeckwrightError::Status {
            status: 400,
            body: "temperature out of range".into(),
        };
        assert!(!is_continuation_rejection(&unrelated));

        let server = DeckwrightError::Status {
            status: 500,
            body: "previous_interaction_id".into(),
        };
        assert!(!is_continuation_rejection(&server));
    }
}
