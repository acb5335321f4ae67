pub mod providers;
pub mod retry;
pub mod streaming;

use futures::StreamExt;
use tracing::debug;

use crag_core::config::ModelConfig;
use crag_core::error::Result;
use crag_core::traits::LlmClient;
use crag_core::types::{ChatMessage, StreamDelta};

pub use providers::{AnthropicClient, GeminiClient, OpenAiClient, StreamingClient, WireFormat};
pub use retry::RetryingClient;

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    match config.provider.as_str() {
        "anthropic" | "claude" => Box::new(AnthropicClient::new()),
        "gemini" | "google" => Box::new(GeminiClient::new()),
        // Everything else uses the OpenAI-compatible client
        _ => Box::new(OpenAiClient::new()),
    }
}

/// Create the primary client wrapped with retries and the configured fallbacks.
pub fn create_retrying_client(primary: &ModelConfig, fallbacks: &[ModelConfig]) -> RetryingClient {
    let fallbacks = fallbacks
        .iter()
        .map(|fb| (fb.clone(), create_client(fb)))
        .collect();
    RetryingClient::new(
        create_client(primary),
        fallbacks,
        primary.retry.clone().unwrap_or_default(),
    )
}

/// Send a request and drain the stream into the full response text.
///
/// Stream errors are fatal: a partially received answer is never returned.
pub async fn complete(
    llm: &dyn LlmClient,
    config: &ModelConfig,
    messages: Vec<ChatMessage>,
) -> Result<String> {
    let mut stream = llm.chat_stream(config, messages).await?;
    let mut text = String::new();

    while let Some(delta) = stream.next().await {
        match delta? {
            StreamDelta::TextDelta(chunk) => text.push_str(&chunk),
            StreamDelta::Usage {
                input_tokens,
                output_tokens,
            } => debug!(input_tokens, output_tokens, "Token usage"),
            StreamDelta::Stop(reason) => debug!(?reason, "LLM response complete"),
        }
    }

    Ok(text)
}
