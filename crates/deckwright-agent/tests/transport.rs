#![allow(clippy::unwrap_used, clippy::expect_used)]

use deckwright_agent::{
    InteractionBackend, InteractionsBackend, OpenAiFallback, RetryPolicy, RetryingBackend,
};
use deckwright_core::{DeckwrightError, InteractionRequest, InteractionStatus};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn completed_body() -> serde_json::Value {
    json!({
        "id": "int_abc",
        "status": "completed",
        "model": "gemini-2.5-flash",
        "outputs": [{"type": "text", "text": "{\"ok\": true}"}],
        "usage": {"total_input_tokens": 7, "total_output_tokens": 3, "total_tokens": 10}
    })
}

fn backend(server: &MockServer, timeout: Duration) -> InteractionsBackend {
    InteractionsBackend::new(server.uri(), "test-key", timeout)
}

fn instant_retries() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        backoff_base_ms: 1,
        backoff_max_ms: 1,
    }
}

// ---------------------------------------------------------------------------
// 1. Request shape and response parsing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn posts_to_interactions_endpoint_with_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1beta/interactions"))
        .and(header("x-goog-api-key", "test-key"))
        .and(body_partial_json(json!({
            "model": "gemini-2.5-flash",
            "input": "hello",
            "response_format": {"type": "object"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completed_body()))
        .expect(1)
        .mount(&server)
        .await;

    let request = InteractionRequest::new("gemini-2.5-flash", "hello")
        .with_response_schema(json!({"type": "object"}));
    let resp = backend(&server, Duration::from_secs(5))
        .create(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(resp.id, "int_abc");
    assert_eq!(resp.status, InteractionStatus::Completed);
    assert_eq!(resp.text().as_deref(), Some("{\"ok\": true}"));
    assert_eq!(resp.usage_record().unwrap().total_tokens, 10);
}

#[tokio::test]
async fn malformed_envelope_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"outputs": []})))
        .mount(&server)
        .await;

    let err = backend(&server, Duration::from_secs(5))
        .create(&InteractionRequest::new("m", "hi"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DeckwrightError::InvalidResponse(_)));
}

// ---------------------------------------------------------------------------
// 2. Status codes and retry
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limit_then_success_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("quota exhausted"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completed_body()))
        .mount(&server)
        .await;

    let retrying = RetryingBackend::new(
        Arc::new(backend(&server, Duration::from_secs(5))),
        instant_retries(),
    );
    let resp = retrying
        .create(&InteractionRequest::new("m", "hi"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.id, "int_abc");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn bad_request_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_string("model not supported"))
        .mount(&server)
        .await;

    let retrying = RetryingBackend::new(
        Arc::new(backend(&server, Duration::from_secs(5))),
        instant_retries(),
    );
    let err = retrying
        .create(&InteractionRequest::new("m", "hi"), &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        DeckwrightError::Status { status, body } => {
            assert_eq!(status, 400);
            assert!(body.contains("model not supported"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn persistent_server_error_exhausts_retries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let retrying = RetryingBackend::new(
        Arc::new(backend(&server, Duration::from_secs(5))),
        instant_retries(),
    );
    let err = retrying
        .create(&InteractionRequest::new("m", "hi"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(503));
    assert_eq!(server.received_requests().await.unwrap().len(), 4);
}

// ---------------------------------------------------------------------------
// 3. Timeout and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn slow_response_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completed_body())
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let err = backend(&server, Duration::from_millis(100))
        .create(&InteractionRequest::new("m", "hi"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DeckwrightError::Timeout {
            cancelled: false,
            ..
        }
    ));
}

#[tokio::test]
async fn caller_abort_is_a_cancelled_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completed_body())
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let retrying = RetryingBackend::new(
        Arc::new(backend(&server, Duration::from_secs(30))),
        instant_retries(),
    );
    let err = retrying
        .create(&InteractionRequest::new("m", "hi"), &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(!matches!(err, DeckwrightError::Http(_)));
}

// ---------------------------------------------------------------------------
// 4. Fallback provider
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fallback_sends_chat_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "gpt-4o-mini",
            "response_format": {"type": "json_object"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-9",
            "model": "gpt-4o-mini",
            "choices": [{"message": {"role": "assistant", "content": "{\"slides\": []}"}}],
            "usage": {"prompt_tokens": 20, "completion_tokens": 4}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fallback = OpenAiFallback::new(server.uri(), "gpt-4o-mini", "sk-test", Duration::from_secs(5));
    let request = InteractionRequest::new("gemini-2.5-flash-lite", "deck please")
        .with_response_schema(json!({"type": "object"}));
    let resp = fallback
        .create(&request, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(resp.text().as_deref(), Some("{\"slides\": []}"));
    assert_eq!(resp.model.as_deref(), Some("gpt-4o-mini"));
    assert_eq!(resp.usage_record().unwrap().output_tokens, 4);
}

// ---------------------------------------------------------------------------
// 5. Agent loop over HTTP: continuation id on the second turn
// ---------------------------------------------------------------------------

struct Clock;

#[async_trait::async_trait]
impl deckwright_agent::Tool for Clock {
    fn definition(&self) -> &deckwright_core::ToolDefinition {
        static DEF: std::sync::OnceLock<deckwright_core::ToolDefinition> =
            std::sync::OnceLock::new();
        DEF.get_or_init(|| {
            deckwright_core::ToolDefinition::new("clock", "Current time", json!({"type": "object"}))
        })
    }

    async fn execute(
        &self,
        _arguments: serde_json::Value,
    ) -> Result<serde_json::Value, deckwright_agent::BoxError> {
        Ok(json!({"now": "12:00"}))
    }
}

#[tokio::test]
async fn agent_loop_chains_interactions() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({"previous_interaction_id": "int_1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "int_2",
            "status": "completed",
            "outputs": [{"type": "text", "text": "It is noon."}]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "int_1",
            "status": "requires_action",
            "outputs": [
                {"type": "thought", "signature": "sig-abc"},
                {"type": "function_call", "id": "call_1", "name": "clock", "arguments": {}}
            ]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    let mut registry = deckwright_agent::ToolRegistry::new();
    registry.register(Arc::new(Clock));
    let agent = deckwright_agent::AgentLoop::new(
        Arc::new(backend(&server, Duration::from_secs(5))),
        Arc::new(registry),
        Arc::new(deckwright_agent::RecoveryConfig::default()),
    );

    let run = agent
        .run("What time is it?", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(run.text, "It is noon.");
    assert_eq!(run.iterations, 2);
    assert_eq!(run.thought_signature.as_deref(), Some("sig-abc"));

    let requests = server.received_requests().await.unwrap();
    let second: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(second["input"][0]["type"], "thought");
    assert_eq!(second["input"][1]["type"], "function_result");
    assert_eq!(second["input"][1]["result"]["data"]["now"], "12:00");
}
