use crate::backends::InteractionBackend;
use crate::config::RecoveryConfig;
use crate::context::{is_continuation_rejection, ConversationContext};
use crate::failover::compute_backoff;
use crate::ledger::CostLedger;
use crate::tools::ToolRegistry;
use deckwright_core::{
    excerpt, ContentBlock, DeckwrightError, DeckwrightResult, InteractionInput,
    InteractionRequest, InteractionResponse, InteractionStatus, ToolCall, ToolDefinition,
    ToolError, ToolErrorKind, ToolResult, UsageRecord,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Result of a completed agent loop.
#[derive(Debug, Clone)]
pub struct AgentRun {
    /// Text of the final turn.
    pub text: String,
    /// Model turns taken, including the final one.
    pub iterations: u32,
    /// Id of the final interaction.
    pub interaction_id: String,
    /// Last thought continuation signature seen, if any.
    pub thought_signature: Option<String>,
    /// Summed usage across all turns.
    pub usage: UsageRecord,
}

/// The agent loop: orchestrates model turns and tool execution.
/// Prompt → model → function calls → execute tools → fold results → repeat.
pub struct AgentLoop {
    backend: Arc<dyn InteractionBackend>,
    tools: Arc<ToolRegistry>,
    config: Arc<RecoveryConfig>,
    ledger: Option<Arc<CostLedger>>,
    system_instruction: Option<String>,
    model: String,
}

impl AgentLoop {
    /// `backend` should be the raw transport: the loop does its own 429/503
    /// backoff per iteration.
    pub fn new(
        backend: Arc<dyn InteractionBackend>,
        tools: Arc<ToolRegistry>,
        config: Arc<RecoveryConfig>,
    ) -> Self {
        let model = config.models.routine.clone();
        Self {
            backend,
            tools,
            config,
            ledger: None,
            system_instruction: None,
            model,
        }
    }

    pub fn with_system(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<CostLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Runs the loop until the model completes, an interaction fails, or
    /// the iteration ceiling is reached.
    pub async fn run(
        &self,
        input: impl Into<InteractionInput>,
        cancel: &CancellationToken,
    ) -> DeckwrightResult<AgentRun> {
        let settings = &self.config.agent;
        let mut ctx = ConversationContext::new(input.into(), settings.context_folding);
        let definitions = self.tools.definitions();
        let mut usage = UsageRecord::default();
        let mut last_text = String::new();

        info!(
            model = %self.model,
            tools = definitions.len(),
            max_iterations = settings.max_iterations,
            "Starting agent loop"
        );

        for iteration in 1..=settings.max_iterations {
            let response = self.send_turn(&mut ctx, &definitions, cancel).await?;
            ctx.record_response(&response);
            if let Some(turn) = response.usage_record() {
                accumulate(&mut usage, &turn);
            }

            info!(
                iteration,
                interaction = %response.id,
                status = ?response.status,
                "Agent loop turn"
            );

            if matches!(
                response.status,
                InteractionStatus::Failed | InteractionStatus::Cancelled
            ) {
                return Err(DeckwrightError::Agent(format!(
                    "interaction {} ended with status {:?}",
                    response.id, response.status
                )));
            }

            if let Some(text) = response.text() {
                last_text = text;
            }

            let calls = response.function_calls();
            let finished = response.status == InteractionStatus::Completed
                || (calls.is_empty() && response.has_text());
            if finished {
                info!(iterations = iteration, "Agent loop completed");
                return Ok(AgentRun {
                    text: response.text().unwrap_or_default(),
                    iterations: iteration,
                    interaction_id: response.id,
                    thought_signature: ctx.thought_signature().map(String::from),
                    usage,
                });
            }

            if calls.is_empty() {
                ctx.push(ContentBlock::text("Continue."));
                continue;
            }

            self.execute_calls(&mut ctx, calls).await;
        }

        warn!(
            max_iterations = settings.max_iterations,
            "Agent loop reached max iterations"
        );
        Err(DeckwrightError::MaxIterations {
            iterations: settings.max_iterations,
            excerpt: excerpt(&last_text, self.config.repair.excerpt_chars),
        })
    }

    /// Sends one model turn. A 429 or 503 backs off and retries the same
    /// turn; a rejected continuation id resends the full history once.
    async fn send_turn(
        &self,
        ctx: &mut ConversationContext,
        definitions: &[ToolDefinition],
        cancel: &CancellationToken,
    ) -> DeckwrightResult<InteractionResponse> {
        let policy = &self.config.retry;
        let mut attempt = 0;

        loop {
            let request = self.build_request(ctx, definitions);
            let continued = request.previous_interaction_id.is_some();

            match self.backend.create(&request, cancel).await {
                Ok(response) => {
                    if let (Some(ledger), Some(usage)) = (&self.ledger, response.usage_record()) {
                        ledger.record(response.model.as_deref().unwrap_or(&request.model), &usage);
                    }
                    return Ok(response);
                }
                Err(e) if continued && is_continuation_rejection(&e) => {
                    warn!(error = %e, "Continuation rejected, resending full history");
                    ctx.drop_continuation();
                }
                Err(e) if matches!(e.status(), Some(429 | 503)) && attempt < policy.max_retries => {
                    let delay = compute_backoff(policy, attempt);
                    attempt += 1;
                    warn!(attempt, delay_ms = delay, error = %e, "Transient error, retrying turn");
                    if delay > 0 {
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Err(DeckwrightError::Timeout {
                                    elapsed_ms: delay,
                                    cancelled: true,
                                });
                            }
                            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn build_request(
        &self,
        ctx: &ConversationContext,
        definitions: &[ToolDefinition],
    ) -> InteractionRequest {
        let (input, previous) = ctx.next_input(self.config.agent.thread_thought_signatures);
        let mut request = InteractionRequest::new(self.model.clone(), input)
            .with_tools(definitions.to_vec())
            .with_max_output_tokens(self.config.budgets.default_output_tokens)
            .with_thinking(self.config.budgets.default_thinking);
        if let Some(ref sys) = self.system_instruction {
            request = request.with_system(sys.clone());
        }
        if let Some(prev) = previous {
            request = request.with_previous_interaction(prev);
        }
        request
    }

    /// Executes one batch of calls and folds every result into the context.
    async fn execute_calls(&self, ctx: &mut ConversationContext, calls: Vec<ToolCall>) {
        let results: Vec<ToolResult> = if self.config.agent.parallel_tools {
            // Every scheduled execution may fail, so each one uses up a retry.
            let mut scheduled: HashMap<&str, u32> = HashMap::new();
            let refusals: Vec<Option<ToolResult>> = calls
                .iter()
                .map(|call| {
                    let queued = scheduled.entry(call.name.as_str()).or_insert(0);
                    let refused = self.refusal(call, ctx.failures(&call.name) + *queued);
                    if refused.is_none() {
                        *queued += 1;
                    }
                    refused
                })
                .collect();
            let pending = calls.iter().zip(refusals).map(|(call, refused)| async move {
                match refused {
                    Some(result) => result,
                    None => self.tools.execute(call).await,
                }
            });
            futures_util::future::join_all(pending).await
        } else {
            let mut results = Vec::with_capacity(calls.len());
            for call in &calls {
                let result = match self.refusal(call, ctx.failures(&call.name)) {
                    Some(result) => result,
                    None => self.tools.execute(call).await,
                };
                if self.tools.get(&call.name).is_some() {
                    ctx.note_result(&call.name, &result);
                }
                results.push(result);
            }
            results
        };

        for (call, result) in calls.iter().zip(&results) {
            if self.config.agent.parallel_tools && self.tools.get(&call.name).is_some() {
                ctx.note_result(&call.name, result);
            }
            ctx.push_tool_result(call, result);
        }
    }

    /// A synthesized result for a tool that has failed too often, or
    /// `None` if the tool may run.
    fn refusal(&self, call: &ToolCall, failures: u32) -> Option<ToolResult> {
        if failures < self.config.agent.max_tool_retries {
            return None;
        }
        warn!(tool = %call.name, failures, "Tool failure limit reached, refusing call");
        Some(ToolResult::failure(
            ToolError::new(
                ToolErrorKind::Runtime,
                format!(
                    "Tool '{}' has failed {failures} times and will not be called again",
                    call.name
                ),
            )
            .with_hint("Try an alternative approach or a different tool.")
            .with_retryable(false),
        ))
    }
}

fn accumulate(total: &mut UsageRecord, turn: &UsageRecord) {
    total.input_tokens += turn.input_tokens;
    total.output_tokens += turn.output_tokens;
    total.reasoning_tokens += turn.reasoning_tokens;
    total.cached_tokens += turn.cached_tokens;
    total.total_tokens += turn.total_tokens;
}
