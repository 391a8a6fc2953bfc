use crate::backends::InteractionBackend;
use async_trait::async_trait;
use deckwright_core::{DeckwrightError, DeckwrightResult, InteractionRequest, InteractionResponse};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Type alias for the injectable sleep function used in tests.
#[cfg(test)]
type SleepFn = Box<
    dyn Fn(u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync,
>;

/// Configures retry behaviour for transient transport errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Determines whether an error is transient and worth retrying.
///
/// Returns `true` for rate limiting (429), server errors (500, 502, 503,
/// 504), deadline timeouts and connection-level failures. A caller abort is
/// never retried, and neither are other 4xx statuses.
pub fn is_retryable(err: &DeckwrightError) -> bool {
    match err {
        DeckwrightError::Status { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
        DeckwrightError::Timeout { cancelled, .. } => !cancelled,
        DeckwrightError::Http(_) => true,
        _ => false,
    }
}

/// Computes the backoff delay for a given attempt using exponential backoff
/// capped at `backoff_max_ms`.
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy.backoff_base_ms.saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

/// An `InteractionBackend` that retries transient failures of another
/// backend with exponential backoff.
///
/// Non-retryable errors are returned immediately. Cancellation is checked
/// before every attempt and interrupts a pending backoff sleep.
pub struct RetryingBackend {
    inner: Arc<dyn InteractionBackend>,
    policy: RetryPolicy,
    /// Injectable sleep function for testing (allows skipping real delays).
    #[cfg(test)]
    sleep_fn: Option<SleepFn>,
}

impl RetryingBackend {
    /// Wraps `inner` with the given retry policy.
    pub fn new(inner: Arc<dyn InteractionBackend>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            #[cfg(test)]
            sleep_fn: None,
        }
    }

    /// Perform a sleep for the given duration in milliseconds.
    async fn do_sleep(&self, ms: u64) {
        #[cfg(test)]
        if let Some(ref f) = self.sleep_fn {
            f(ms).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl InteractionBackend for RetryingBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn create(
        &self,
        request: &InteractionRequest,
        cancel: &CancellationToken,
    ) -> DeckwrightResult<InteractionResponse> {
        let mut last_err: Option<DeckwrightError> = None;

        for attempt in 0..=self.policy.max_retries {
            if cancel.is_cancelled() {
                return Err(DeckwrightError::Timeout {
                    elapsed_ms: 0,
                    cancelled: true,
                });
            }

            match self.inner.create(request, cancel).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if !is_retryable(&e) {
                        warn!(
                            backend = self.inner.name(),
                            attempt,
                            error = %e,
                            "Non-retryable error"
                        );
                        return Err(e);
                    }

                    if attempt < self.policy.max_retries {
                        let delay = compute_backoff(&self.policy, attempt);
                        info!(
                            backend = self.inner.name(),
                            attempt,
                            delay_ms = delay,
                            error = %e,
                            "Retryable error, backing off"
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                return Err(DeckwrightError::Timeout {
                                    elapsed_ms: delay,
                                    cancelled: true,
                                });
                            }
                            _ = self.do_sleep(delay) => {}
                        }
                    }
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| DeckwrightError::Agent("Retries exhausted".into())))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
