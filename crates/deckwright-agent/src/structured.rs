use crate::backends::interactions::InteractionsBackend;
use crate::backends::openai::OpenAiFallback;
use crate::backends::InteractionBackend;
use crate::config::RecoveryConfig;
use crate::failover::RetryingBackend;
use crate::ledger::CostLedger;
use deckwright_core::{
    excerpt, DeckwrightError, DeckwrightResult, InteractionInput, InteractionRequest,
    InteractionResponse, ThinkingLevel,
};
use deckwright_repair::{RepairOutcome, RepairPipeline, RepairReport, ShapeHints};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REPAIR_INSTRUCTION: &str = "You repair malformed JSON. Re-emit the data from the broken \
output as one valid JSON document that matches the schema. Drop repeated or garbled content. \
Output only JSON, with no commentary and no code fences.";

/// Which attempt produced the text that was finally parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// First call on the requested model.
    Primary,
    /// Retry after an empty response, on the lite model without thinking.
    LiteRetry,
    /// Retry at temperature zero after degenerate output.
    DeterministicRetry,
    /// The independent fallback provider.
    FallbackProvider,
    /// Re-emitted by the repair model after local repair failed.
    Escalated,
}

/// One structured-output request.
#[derive(Debug, Clone)]
pub struct StructuredRequest {
    pub input: InteractionInput,
    pub system_instruction: Option<String>,
    pub schema: Option<Value>,
    pub shape: ShapeHints,
    /// Overrides the routine model tier.
    pub model: Option<String>,
}

impl StructuredRequest {
    pub fn new(input: impl Into<InteractionInput>) -> Self {
        Self {
            input: input.into(),
            system_instruction: None,
            schema: None,
            shape: ShapeHints::any(),
            model: None,
        }
    }

    pub fn with_system(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    /// Sets the response schema and derives shape hints from it.
    pub fn with_schema(mut self, schema: Value) -> Self {
        self.shape = ShapeHints::from_schema(&schema);
        self.schema = Some(schema);
        self
    }

    /// Replaces the derived shape hints.
    pub fn with_shape(mut self, shape: ShapeHints) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// A parsed value together with how it was obtained.
#[derive(Debug, Clone)]
pub struct StructuredOutput<T> {
    pub value: T,
    pub provenance: Provenance,
    /// Model that produced the parsed text.
    pub model: String,
    /// Repair report of the parse that produced `value`.
    pub report: RepairReport,
}

/// Drives one request to a parsed JSON value.
///
/// `send → {empty? lite retry → fallback provider} → local repair →
/// {not a direct parse and degenerate? deterministic retry} →
/// {exhausted? repair-model escalation} → value | error`.
/// The deterministic retry's text replaces the original only when it
/// recovers at least as well.
/// Malformed JSON is never surfaced directly: the caller gets a repaired
/// value, the shape's fallback value, or [`DeckwrightError::RepairExhausted`].
pub struct StructuredOutputOrchestrator {
    config: Arc<RecoveryConfig>,
    primary: Arc<dyn InteractionBackend>,
    fallback: Option<Arc<dyn InteractionBackend>>,
    pipeline: RepairPipeline,
    ledger: Option<Arc<CostLedger>>,
}

impl StructuredOutputOrchestrator {
    pub fn new(config: Arc<RecoveryConfig>, primary: Arc<dyn InteractionBackend>) -> Self {
        let pipeline = RepairPipeline::new(config.repair.max_repair_bytes);
        Self {
            config,
            primary,
            fallback: None,
            pipeline,
            ledger: None,
        }
    }

    /// Wires the HTTP backends described by `config`, each behind the
    /// configured retry policy. A missing fallback credential leaves the
    /// fallback disabled.
    pub fn from_config(config: Arc<RecoveryConfig>) -> DeckwrightResult<Self> {
        let primary = InteractionsBackend::from_config(&config.provider)?;
        let primary: Arc<dyn InteractionBackend> = Arc::new(RetryingBackend::new(
            Arc::new(primary),
            config.retry.clone(),
        ));

        let fallback = OpenAiFallback::from_config(
            &config.fallback,
            config.provider.request_timeout(),
        )
        .map(|fb| {
            info!(model = fb.model(), "Fallback provider enabled");
            Arc::new(RetryingBackend::new(Arc::new(fb), config.retry.clone()))
                as Arc<dyn InteractionBackend>
        });
        if fallback.is_none() {
            debug!("No fallback credential, fallback provider disabled");
        }

        let mut orchestrator = Self::new(config, primary);
        orchestrator.fallback = fallback;
        Ok(orchestrator)
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn InteractionBackend>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<CostLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn pipeline(&self) -> &RepairPipeline {
        &self.pipeline
    }

    /// Generates and deserializes into `T`.
    pub async fn generate<T: DeserializeOwned>(
        &self,
        request: &StructuredRequest,
        cancel: &CancellationToken,
    ) -> DeckwrightResult<StructuredOutput<T>> {
        let out = self.generate_value(request, cancel).await?;
        Ok(StructuredOutput {
            value: serde_json::from_value(out.value)?,
            provenance: out.provenance,
            model: out.model,
            report: out.report,
        })
    }

    /// Generates a JSON value.
    pub async fn generate_value(
        &self,
        request: &StructuredRequest,
        cancel: &CancellationToken,
    ) -> DeckwrightResult<StructuredOutput<Value>> {
        let budgets = &self.config.budgets;
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.config.models.routine.clone());

        let mut sent = self.build_request(
            request,
            &model,
            budgets.default_output_tokens,
            budgets.default_thinking,
        );
        let mut backend = Arc::clone(&self.primary);
        let mut provenance = Provenance::Primary;
        let mut response = self.call(backend.as_ref(), &sent, cancel).await?;

        if !response.has_text() {
            warn!(
                model = %model,
                outputs = response.outputs.len(),
                "Empty response, retrying on lite model at minimal thinking"
            );
            self.grace_sleep(cancel).await?;

            sent = self.build_request(
                request,
                &self.config.models.lite,
                budgets.empty_retry_output_tokens,
                Some(ThinkingLevel::Minimal),
            );
            provenance = Provenance::LiteRetry;
            response = self.call(backend.as_ref(), &sent, cancel).await?;

            if !response.has_text() {
                let Some(fallback) = self.fallback.clone() else {
                    return Err(DeckwrightError::EmptyResponse {
                        model: sent.model,
                        attempts: 2,
                    });
                };
                warn!(provider = fallback.name(), "Lite retry also empty, trying fallback provider");
                backend = fallback;
                provenance = Provenance::FallbackProvider;
                response = self.call(backend.as_ref(), &sent, cancel).await?;
                if !response.has_text() {
                    return Err(DeckwrightError::EmptyResponse {
                        model: response.model.unwrap_or(sent.model),
                        attempts: 3,
                    });
                }
            }
        }

        let mut text = response.text().unwrap_or_default();
        let mut produced_by = response.model.clone().unwrap_or_else(|| sent.model.clone());
        let mut report = self.pipeline.recover(&text, &request.shape);

        let repetition = match report.outcome {
            RepairOutcome::Direct => None,
            _ => self.pipeline.classifier().detector().detect(&text),
        };
        if let Some(rep) = repetition {
            warn!(
                strategy = %rep.strategy,
                start = rep.start,
                period = rep.period,
                "Degenerate output, retrying at temperature zero and minimal thinking"
            );
            let deterministic = sent
                .clone()
                .with_temperature(0.0)
                .with_thinking(Some(ThinkingLevel::Minimal));
            match self.call(backend.as_ref(), &deterministic, cancel).await {
                Ok(retry) if retry.has_text() => {
                    let retry_text = retry.text().unwrap_or_default();
                    let retry_report = self.pipeline.recover(&retry_text, &request.shape);
                    if recovery_rank(&retry_report) >= recovery_rank(&report) {
                        text = retry_text;
                        report = retry_report;
                        produced_by = retry.model.unwrap_or_else(|| deterministic.model.clone());
                        provenance = Provenance::DeterministicRetry;
                    } else {
                        debug!("Deterministic retry recovered worse, keeping original");
                    }
                }
                Ok(_) => debug!("Deterministic retry returned no text, keeping original"),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(error = %e, "Deterministic retry failed, keeping original"),
            }
        }

        if let Some(value) = report.value.clone() {
            log_outcome(&report, provenance);
            return Ok(StructuredOutput {
                value,
                provenance,
                model: produced_by,
                report,
            });
        }

        if self.config.repair.escalate {
            if let Some(out) = self.escalate(&text, request, cancel).await? {
                return Ok(out);
            }
        }

        let kind = report.kind();
        warn!(kind = %kind, attempted = report.attempted.len(), "All repair attempts failed");
        Err(DeckwrightError::RepairExhausted {
            kind,
            excerpt: excerpt(&text, self.config.repair.excerpt_chars),
        })
    }

    /// Asks the repair model to re-emit `text` as valid JSON, then runs the
    /// local pipeline on its answer. Transport failures are not fatal here.
    async fn escalate(
        &self,
        text: &str,
        request: &StructuredRequest,
        cancel: &CancellationToken,
    ) -> DeckwrightResult<Option<StructuredOutput<Value>>> {
        let schema = request
            .schema
            .as_ref()
            .map_or_else(|| "(any JSON)".to_string(), Value::to_string);
        let prompt = format!("Schema:\n{schema}\n\nBroken output:\n{text}");

        let mut repair = InteractionRequest::new(self.config.models.repair.clone(), prompt)
            .with_system(REPAIR_INSTRUCTION)
            .with_max_output_tokens(self.config.budgets.repair_output_tokens)
            .with_temperature(0.0)
            .with_thinking(None);
        if let Some(ref schema) = request.schema {
            repair = repair.with_response_schema(schema.clone());
        }

        info!(model = %repair.model, "Escalating to repair model");
        let response = match self.call(self.primary.as_ref(), &repair, cancel).await {
            Ok(r) => r,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Repair model call failed");
                return Ok(None);
            }
        };

        let Some(repaired) = response.text() else {
            warn!("Repair model returned no text");
            return Ok(None);
        };

        let report = self.pipeline.recover(&repaired, &request.shape);
        match (&report.outcome, report.value.clone()) {
            (RepairOutcome::Direct | RepairOutcome::Repaired { .. }, Some(value)) => {
                info!("Repair model produced valid JSON");
                Ok(Some(StructuredOutput {
                    value,
                    provenance: Provenance::Escalated,
                    model: response.model.unwrap_or(repair.model),
                    report,
                }))
            }
            _ => {
                warn!(kind = %report.kind(), "Repair model output is not recoverable either");
                Ok(None)
            }
        }
    }

    fn build_request(
        &self,
        request: &StructuredRequest,
        model: &str,
        max_output_tokens: u32,
        thinking: Option<ThinkingLevel>,
    ) -> InteractionRequest {
        let mut sent = InteractionRequest::new(model, request.input.clone())
            .with_max_output_tokens(max_output_tokens)
            .with_thinking(thinking);
        if let Some(ref sys) = request.system_instruction {
            sent = sent.with_system(sys.clone());
        }
        if let Some(ref schema) = request.schema {
            sent = sent.with_response_schema(schema.clone());
        }
        sent
    }

    async fn call(
        &self,
        backend: &dyn InteractionBackend,
        request: &InteractionRequest,
        cancel: &CancellationToken,
    ) -> DeckwrightResult<InteractionResponse> {
        debug!(provider = backend.name(), model = %request.model, "Structured-output call");
        let response = backend.create(request, cancel).await?;
        if let (Some(ledger), Some(usage)) = (&self.ledger, response.usage_record()) {
            ledger.record(response.model.as_deref().unwrap_or(&request.model), &usage);
        }
        Ok(response)
    }

    async fn grace_sleep(&self, cancel: &CancellationToken) -> DeckwrightResult<()> {
        let ms = self.config.budgets.empty_retry_grace_ms;
        if ms == 0 {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(DeckwrightError::Timeout {
                elapsed_ms: ms,
                cancelled: true,
            }),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(()),
        }
    }
}

/// Orders recoveries: a direct parse beats a repair, which beats a
/// fallback value or nothing.
fn recovery_rank(report: &RepairReport) -> u8 {
    match report.outcome {
        RepairOutcome::Direct => 3,
        RepairOutcome::Repaired { .. } => 2,
        RepairOutcome::Fallback { .. } => 1,
        RepairOutcome::Exhausted => 0,
    }
}

fn log_outcome(report: &RepairReport, provenance: Provenance) {
    match report.outcome {
        RepairOutcome::Direct => debug!(?provenance, "Parsed without repair"),
        RepairOutcome::Repaired { layer } => {
            info!(?provenance, layer = %layer, kind = %report.kind(), "Recovered structured output");
        }
        RepairOutcome::Fallback { reason } => {
            warn!(?provenance, ?reason, "Returning fallback value");
        }
        RepairOutcome::Exhausted => {}
    }
}
