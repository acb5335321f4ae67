pub mod anthropic;
pub mod gemini;
pub mod openai;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use reqwest::{Client, RequestBuilder};
use tracing::debug;

use crag_core::config::ModelConfig;
use crag_core::error::Result;
use crag_core::traits::LlmClient;
use crag_core::types::{ChatMessage, StreamDelta};

use crate::streaming::{delta_stream, send_checked, SseEvent};

/// A provider's HTTP dialect: how to phrase a streaming chat request and
/// how to read the events that come back.
pub trait WireFormat: Send + Sync + 'static {
    const NAME: &'static str;

    /// Build the request. Fails when the config lacks something the
    /// provider requires, such as an API key.
    fn request(&self, http: &Client, config: &ModelConfig, messages: &[ChatMessage]) -> Result<RequestBuilder>;

    /// Deltas carried by one event; empty for keep-alives and bookkeeping.
    fn parse_event(event: SseEvent) -> Vec<Result<StreamDelta>>;
}

/// Streaming chat client for any [`WireFormat`].
pub struct StreamingClient<W> {
    http: Client,
    wire: W,
}

impl<W: WireFormat + Default> StreamingClient<W> {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
            wire: W::default(),
        }
    }
}

impl<W: WireFormat + Default> Default for StreamingClient<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: WireFormat> LlmClient for StreamingClient<W> {
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        debug!(
            provider = W::NAME,
            model = %config.model_id,
            messages = messages.len(),
            "Chat request"
        );
        let request = self.wire.request(&self.http, config, &messages);
        Box::pin(async move {
            let response = send_checked(request?).await?;
            Ok(delta_stream(response, W::parse_event))
        })
    }
}

pub type AnthropicClient = StreamingClient<anthropic::Anthropic>;
pub type GeminiClient = StreamingClient<gemini::Gemini>;
pub type OpenAiClient = StreamingClient<openai::OpenAiCompatible>;

#[cfg(test)]
pub(crate) fn event(data: &str) -> SseEvent {
    SseEvent {
        event_type: None,
        data: data.to_string(),
    }
}
