pub mod interactions;
pub mod openai;

use async_trait::async_trait;
use deckwright_core::{DeckwrightResult, InteractionRequest, InteractionResponse};
use tokio_util::sync::CancellationToken;

/// Trait for model provider backends.
///
/// Each provider (the primary Interactions endpoint, the OpenAI-compatible
/// fallback, test doubles) implements this trait. Implementations must
/// enforce their own request timeout and must report a triggered
/// `cancel` token as [`DeckwrightError::Timeout`] with `cancelled: true`.
///
/// [`DeckwrightError::Timeout`]: deckwright_core::DeckwrightError::Timeout
#[async_trait]
pub trait InteractionBackend: Send + Sync {
    /// Short provider name used in logs and in the cost ledger.
    fn name(&self) -> &str;

    /// Creates one interaction (one model turn).
    async fn create(
        &self,
        request: &InteractionRequest,
        cancel: &CancellationToken,
    ) -> DeckwrightResult<InteractionResponse>;
}

const ERROR_BODY_EXCERPT_CHARS: usize = 500;

/// Sends a prepared JSON request under a deadline and a cancellation token,
/// and returns the decoded body of a successful response.
pub(crate) async fn send_json(
    request: reqwest::RequestBuilder,
    body: &serde_json::Value,
    timeout: std::time::Duration,
    cancel: &CancellationToken,
) -> DeckwrightResult<serde_json::Value> {
    use deckwright_core::{excerpt, DeckwrightError};

    let started = std::time::Instant::now();
    let elapsed_ms = || u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    let exchange = async {
        let resp = request.json(body).send().await.map_err(|e| {
            if e.is_timeout() {
                DeckwrightError::Timeout {
                    elapsed_ms: elapsed_ms(),
                    cancelled: false,
                }
            } else {
                DeckwrightError::Http(e.to_string())
            }
        })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| DeckwrightError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(DeckwrightError::Status {
                status: status.as_u16(),
                body: excerpt(&text, ERROR_BODY_EXCERPT_CHARS),
            });
        }
        Ok::<_, DeckwrightError>(serde_json::from_str::<serde_json::Value>(&text)?)
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(DeckwrightError::Timeout {
            elapsed_ms: elapsed_ms(),
            cancelled: true,
        }),
        result = tokio::time::timeout(timeout, exchange) => match result {
            Ok(inner) => inner,
            Err(_) => Err(DeckwrightError::Timeout {
                elapsed_ms: elapsed_ms(),
                cancelled: false,
            }),
        },
    }
}
