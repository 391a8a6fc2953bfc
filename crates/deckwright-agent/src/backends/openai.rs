use super::{send_json, InteractionBackend};
use crate::config::FallbackConfig;
use async_trait::async_trait;
use deckwright_core::{
    ContentBlock, DeckwrightResult, InteractionRequest, InteractionResponse, InteractionStatus,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// OpenAI-compatible chat-completions backend, used as the independent
/// fallback provider for structured output.
///
/// It is stateless and text-only: the request's input is flattened into a
/// single user message and the configured fallback model replaces the
/// request's model id.
pub struct OpenAiFallback {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiFallback {
    /// Creates a fallback backend with an explicit key.
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: api_key.into(),
            timeout,
        }
    }

    /// Returns `None` when no credential is available; the fallback is then
    /// skipped rather than treated as an error.
    pub fn from_config(config: &FallbackConfig, timeout: Duration) -> Option<Self> {
        let api_key = config.api_key()?;
        Some(Self::new(
            config.base_url.clone(),
            config.model.clone(),
            api_key,
            timeout,
        ))
    }

    /// Model id sent to the provider.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_messages(&self, request: &InteractionRequest) -> Vec<Value> {
        let mut messages = Vec::new();
        if let Some(ref sys) = request.system_instruction {
            messages.push(json!({"role": "system", "content": sys}));
        }
        messages.push(json!({"role": "user", "content": request.input.to_prompt()}));
        messages
    }

    fn build_body(&self, request: &InteractionRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": self.build_messages(request),
        });
        if let Some(max_tokens) = request.generation.max_output_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.generation.temperature {
            body["temperature"] = json!(temperature);
        }
        if request.response_schema.is_some() {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }
}

/// Maps a chat-completions body onto the interaction model.
pub fn parse_chat_completion(body: &Value, model: &str) -> InteractionResponse {
    let content = body["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or_default();

    let outputs = if content.is_empty() {
        Vec::new()
    } else {
        vec![ContentBlock::text(content)]
    };

    InteractionResponse {
        id: body["id"].as_str().unwrap_or("chatcmpl-fallback").to_string(),
        status: InteractionStatus::Completed,
        outputs,
        usage: body.get("usage").filter(|u| !u.is_null()).cloned(),
        model: Some(body["model"].as_str().unwrap_or(model).to_string()),
    }
}

#[async_trait]
impl InteractionBackend for OpenAiFallback {
    fn name(&self) -> &str {
        "openai"
    }

    async fn create(
        &self,
        request: &InteractionRequest,
        cancel: &CancellationToken,
    ) -> DeckwrightResult<InteractionResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let builder = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json");

        let body = self.build_body(request);
        let resp_body = send_json(builder, &body, self.timeout, cancel).await?;
        Ok(parse_chat_completion(&resp_body, &self.model))
    }
}
