use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{info, warn};

use crag_core::config::{ModelConfig, RetryConfig};
use crag_core::error::{CragError, Result};
use crag_core::traits::LlmClient;
use crag_core::types::*;

/// Wraps a primary client with retries and an ordered list of fallbacks.
///
/// Every attempt is drained to completion before anything is handed back,
/// so a connection dropped mid-response is retried like a failed request
/// and callers never see a half answer followed by an error.
pub struct RetryingClient {
    primary: Box<dyn LlmClient>,
    fallbacks: Vec<(ModelConfig, Box<dyn LlmClient>)>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(
        primary: Box<dyn LlmClient>,
        fallbacks: Vec<(ModelConfig, Box<dyn LlmClient>)>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary,
            fallbacks,
            retry_config,
        }
    }

    /// Primary with backoff, then each fallback once, until one succeeds.
    async fn buffered(&self, config: &ModelConfig, messages: &[ChatMessage]) -> Result<Vec<StreamDelta>> {
        let max_retries = self.retry_config.max_retries;
        let mut attempt = 0;
        let last_err = loop {
            match drain(self.primary.as_ref(), config, messages).await {
                Ok(deltas) => return Ok(deltas),
                Err(e) if is_retryable(&e) && attempt < max_retries => {
                    let backoff = calculate_backoff(attempt, &self.retry_config);
                    warn!(
                        attempt = attempt + 1,
                        max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying model request"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        if self.fallbacks.is_empty() {
            return Err(last_err);
        }
        info!(error = %last_err, "Primary model exhausted, trying fallbacks");

        let mut last_err = last_err;
        for (fb_config, fb_client) in &self.fallbacks {
            match drain(fb_client.as_ref(), fb_config, messages).await {
                Ok(deltas) => {
                    info!(
                        model = %fb_config.model_id,
                        provider = %fb_config.provider,
                        "Answered by fallback model"
                    );
                    return Ok(deltas);
                }
                Err(e) => {
                    warn!(model = %fb_config.model_id, error = %e, "Fallback model failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

/// Run one request to completion, keeping every delta.
async fn drain(
    client: &dyn LlmClient,
    config: &ModelConfig,
    messages: &[ChatMessage],
) -> Result<Vec<StreamDelta>> {
    let mut stream = client.chat_stream(config, messages.to_vec()).await?;
    let mut deltas = Vec::new();
    while let Some(delta) = stream.next().await {
        deltas.push(delta?);
    }
    Ok(deltas)
}

/// Rate limits, server errors and dropped connections are worth another try;
/// auth and request-shape errors are not.
fn is_retryable(e: &CragError) -> bool {
    match e {
        CragError::LlmRequest(msg) => {
            ["429", "500", "502", "503", "504", "timeout", "connection"]
                .iter()
                .any(|marker| msg.contains(marker))
        }
        CragError::LlmStream(_) => true,
        _ => false,
    }
}

/// Exponential backoff capped at `max_backoff_ms`, with ±20% jitter.
fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl LlmClient for RetryingClient {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let config = config.clone();
        Box::pin(async move {
            let deltas = self.buffered(&config, &messages).await?;
            Ok(futures::stream::iter(deltas.into_iter().map(Ok)).boxed())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use crag_test_utils::{test_model_config, ScriptedLlm};

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    /// Yields one delta, then fails the stream.
    struct DroppingLlm;

    impl LlmClient for DroppingLlm {
        fn chat_stream(
            &self,
            _config: &ModelConfig,
            _messages: Vec<ChatMessage>,
        ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
            Box::pin(async {
                let deltas = vec![
                    Ok(StreamDelta::TextDelta("partial ".into())),
                    Err(CragError::LlmStream("connection reset".into())),
                ];
                Ok(futures::stream::iter(deltas).boxed())
            })
        }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(is_retryable(&CragError::LlmRequest("HTTP 429: slow down".into())));
        assert!(is_retryable(&CragError::LlmStream("reset".into())));
        assert!(!is_retryable(&CragError::LlmRequest("HTTP 401: bad key".into())));
        assert!(!is_retryable(&CragError::Config("missing key".into())));
    }

    #[test]
    fn test_backoff_capped() {
        let config = RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 5000,
        };
        assert!(calculate_backoff(8, &config) <= Duration::from_millis(6000));
        assert!(calculate_backoff(63, &config) <= Duration::from_millis(6000));
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let primary = ScriptedLlm::new(vec!["ok"]).fail_first(2, "HTTP 503: unavailable");
        let calls = primary.call_counter();
        let client = RetryingClient::new(Box::new(primary), vec![], fast_retry());

        let text = crate::complete(&client, &test_model_config(), vec![ChatMessage::user("hi")])
            .await
            .unwrap();
        assert_eq!(text, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let primary = ScriptedLlm::new(vec!["never"]).fail_first(1, "HTTP 401: bad key");
        let calls = primary.call_counter();
        let client = RetryingClient::new(Box::new(primary), vec![], fast_retry());

        let err = crate::complete(&client, &test_model_config(), vec![ChatMessage::user("hi")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("401"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_falls_back_on_permanent_error() {
        let primary = ScriptedLlm::new(vec![]).fail_first(1, "HTTP 401: bad key");
        let fallback = ScriptedLlm::new(vec!["from fallback"]);
        let client = RetryingClient::new(
            Box::new(primary),
            vec![(test_model_config(), Box::new(fallback) as Box<dyn LlmClient>)],
            fast_retry(),
        );

        let text = crate::complete(&client, &test_model_config(), vec![ChatMessage::user("hi")])
            .await
            .unwrap();
        assert_eq!(text, "from fallback");
    }

    #[tokio::test]
    async fn test_mid_stream_failure_never_leaks_partial_text() {
        let fallback = ScriptedLlm::new(vec!["complete answer"]);
        let client = RetryingClient::new(
            Box::new(DroppingLlm),
            vec![(test_model_config(), Box::new(fallback) as Box<dyn LlmClient>)],
            fast_retry(),
        );

        let text = crate::complete(&client, &test_model_config(), vec![ChatMessage::user("hi")])
            .await
            .unwrap();
        assert_eq!(text, "complete answer");
    }
}
