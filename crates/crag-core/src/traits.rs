use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// Multi-provider streaming chat client.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>>;
}

/// Source of passages for a question: local index lookup or web search.
///
/// Implementations are read-only with respect to the caller's run state: they
/// return fresh passages and never retry internally.
pub trait EvidenceSource: Send + Sync + 'static {
    /// Source name used in logs (e.g., "local_index", "tavily").
    fn name(&self) -> &str;

    /// Fetch passages for a question, best match first.
    fn fetch(&self, question: &str) -> BoxFuture<'_, Result<Vec<Passage>>>;
}

/// Turns text into vectors for the local index.
pub trait EmbeddingProvider: Send + Sync + 'static {
    /// Embed a batch of texts into vectors, one per input, in order.
    fn embed(&self, texts: &[String]) -> BoxFuture<'_, Result<Vec<Vec<f32>>>>;

    /// Number of dimensions in the embedding vectors.
    fn dimensions(&self) -> usize;
}
