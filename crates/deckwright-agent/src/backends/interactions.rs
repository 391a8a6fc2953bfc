use super::{send_json, InteractionBackend};
use crate::config::ProviderConfig;
use async_trait::async_trait;
use deckwright_core::{
    ContentBlock, DeckwrightError, DeckwrightResult, InteractionRequest, InteractionResponse,
    InteractionStatus,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backend for the stateful Interactions API.
///
/// One `create` call is one model turn. The server keeps conversation state
/// keyed by the returned interaction id, which later turns reference through
/// `previous_interaction_id`.
pub struct InteractionsBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl InteractionsBackend {
    /// Creates a backend against `base_url` with an explicit key.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout,
        }
    }

    /// Builds the backend from the provider section of the configuration.
    pub fn from_config(config: &ProviderConfig) -> DeckwrightResult<Self> {
        let api_key = config.api_key().ok_or_else(|| {
            DeckwrightError::Config(format!(
                "no API key configured for the primary provider (set {})",
                config.api_key_env
            ))
        })?;
        Ok(Self::new(
            config.base_url.clone(),
            api_key,
            config.request_timeout(),
        ))
    }

    fn endpoint(&self) -> String {
        format!("{}/v1beta/interactions", self.base_url)
    }
}

/// Serializes a request into the wire body of `POST /v1beta/interactions`.
pub fn build_body(request: &InteractionRequest) -> DeckwrightResult<Value> {
    let mut body = json!({
        "model": request.model,
        "input": request.input,
        "store": true,
    });

    if let Some(ref sys) = request.system_instruction {
        body["system_instruction"] = json!(sys);
    }

    if !request.tools.is_empty() {
        body["tools"] = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect();
    }

    if let Some(ref schema) = request.response_schema {
        body["response_format"] = schema.clone();
        body["response_mime_type"] = json!(request
            .response_mime_type
            .as_deref()
            .unwrap_or("application/json"));
    }

    let generation = serde_json::to_value(&request.generation)?;
    if generation.as_object().is_some_and(|o| !o.is_empty()) {
        body["generation_config"] = generation;
    }

    if let Some(ref prev) = request.previous_interaction_id {
        body["previous_interaction_id"] = json!(prev);
    }

    Ok(body)
}

/// Parses an Interactions API response body.
///
/// Output blocks of unknown types are skipped. A missing `id` or `status`
/// is a malformed envelope and aborts with [`DeckwrightError::InvalidResponse`].
pub fn parse_interaction(body: &Value) -> DeckwrightResult<InteractionResponse> {
    let id = body["id"]
        .as_str()
        .ok_or_else(|| DeckwrightError::InvalidResponse("interaction has no id".into()))?
        .to_string();

    let status: InteractionStatus = match body.get("status") {
        Some(s) if !s.is_null() => serde_json::from_value(s.clone()).map_err(|e| {
            DeckwrightError::InvalidResponse(format!("interaction {id} has unknown status: {e}"))
        })?,
        _ => {
            return Err(DeckwrightError::InvalidResponse(format!(
                "interaction {id} has no status"
            )))
        }
    };

    let outputs: Vec<ContentBlock> = body["outputs"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| match serde_json::from_value::<ContentBlock>(b.clone()) {
                    Ok(block) => Some(block),
                    Err(e) => {
                        debug!(block_type = %b["type"], error = %e, "Skipping output block");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let response = InteractionResponse {
        id,
        status,
        outputs,
        usage: body.get("usage").filter(|u| !u.is_null()).cloned(),
        model: body["model"].as_str().map(String::from),
    };
    response.validate()?;
    Ok(response)
}

#[async_trait]
impl InteractionBackend for InteractionsBackend {
    fn name(&self) -> &str {
        "interactions"
    }

    async fn create(
        &self,
        request: &InteractionRequest,
        cancel: &CancellationToken,
    ) -> DeckwrightResult<InteractionResponse> {
        request.validate()?;
        let body = build_body(request)?;

        debug!(
            model = %request.model,
            tools = request.tools.len(),
            continuation = request.previous_interaction_id.is_some(),
            "Creating interaction"
        );

        let builder = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json");

        let resp_body = send_json(builder, &body, self.timeout, cancel).await?;
        parse_interaction(&resp_body)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use deckwright_core::{ThinkingLevel, ToolDefinition};

    #[test]
    fn test_body_carries_schema_tools_and_generation() {
        let request = InteractionRequest::new("gemini-2.5-flash", "make slides")
            .with_system("You are terse.")
            .with_tools(vec![ToolDefinition::new(
                "search",
                "Web search",
                json!({"type": "object"}),
            )])
            .with_response_schema(json!({"type": "object"}))
            .with_temperature(0.0)
            .with_thinking(Some(ThinkingLevel::Low))
            .with_previous_interaction("int_7");

        let body = build_body(&request).unwrap();
        assert_eq!(body["model"], "gemini-2.5-flash");
        assert_eq!(body["input"], "make slides");
        assert_eq!(body["system_instruction"], "You are terse.");
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["name"], "search");
        assert_eq!(body["response_format"], json!({"type": "object"}));
        assert_eq!(body["response_mime_type"], "application/json");
        assert_eq!(body["generation_config"]["temperature"], 0.0);
        assert_eq!(body["generation_config"]["thinking_level"], "low");
        assert_eq!(body["previous_interaction_id"], "int_7");
    }

    #[test]
    fn test_body_omits_unset_fields() {
        let body = build_body(&InteractionRequest::new("m", "hi")).unwrap();
        assert!(body.get("tools").is_none());
        assert!(body.get("response_format").is_none());
        assert!(body.get("generation_config").is_none());
        assert!(body.get("previous_interaction_id").is_none());
    }

    #[test]
    fn test_parse_skips_unknown_blocks() {
        let body = json!({
            "id": "int_1",
            "status": "completed",
            "outputs": [
                {"type": "thought", "signature": "sig-1"},
                {"type": "audio", "data": "..."},
                {"type": "text", "text": "{\"a\":1}"}
            ],
            "usage": {"total_input_tokens": 10, "total_output_tokens": 4}
        });
        let resp = parse_interaction(&body).unwrap();
        assert_eq!(resp.outputs.len(), 2);
        assert_eq!(resp.text().as_deref(), Some("{\"a\":1}"));
        assert_eq!(resp.thought_signature(), Some("sig-1"));
        assert_eq!(resp.usage_record().unwrap().output_tokens, 4);
    }

    #[test]
    fn test_parse_rejects_missing_envelope_fields() {
        let err = parse_interaction(&json!({"status": "completed"})).unwrap_err();
        assert!(matches!(err, DeckwrightError::InvalidResponse(_)));

        let err = parse_interaction(&json!({"id": "int_1", "outputs": []})).unwrap_err();
        assert!(matches!(err, DeckwrightError::InvalidResponse(_)));
    }

    #[test]
    fn test_parse_requires_action_needs_a_call() {
        let body = json!({"id": "int_1", "status": "requires_action", "outputs": []});
        assert!(parse_interaction(&body).is_err());

        let body = json!({
            "id": "int_1",
            "status": "requires_action",
            "outputs": [{"type": "function_call", "id": "c1", "name": "search", "arguments": {"q": "x"}}]
        });
        let resp = parse_interaction(&body).unwrap();
        assert_eq!(resp.function_calls()[0].name, "search");
    }

    #[test]
    fn test_from_config_without_key_is_config_error() {
        let config = ProviderConfig {
            api_key: None,
            api_key_env: "DECKWRIGHT_TEST_UNSET_KEY_VAR".into(),
            ..ProviderConfig::default()
        };
        let err = InteractionsBackend::from_config(&config).err().unwrap();
        assert!(matches!(err, DeckwrightError::Config(_)));
    }
}
