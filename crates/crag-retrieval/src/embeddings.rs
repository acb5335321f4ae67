use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crag_core::config::EmbeddingConfig;
use crag_core::error::{CragError, Result};
use crag_core::traits::EmbeddingProvider;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OLLAMA_BASE_URL: &str = "http://localhost:11434/v1";

/// Embeddings over any OpenAI-compatible `/embeddings` endpoint
/// (OpenAI itself, Ollama, vLLM, LiteLLM).
///
/// Every returned vector is checked against the configured dimensions so a
/// model swap is caught before it reaches the index.
pub struct HttpEmbeddingProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dims: usize,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedItem>,
}

#[derive(Deserialize)]
struct EmbedItem {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

impl HttpEmbeddingProvider {
    pub fn new(base_url: &str, api_key: Option<&str>, model: &str, dims: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            api_key: api_key.map(String::from),
            model: model.to_string(),
            dims,
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        let default_base = if config.provider == "ollama" {
            OLLAMA_BASE_URL
        } else {
            OPENAI_BASE_URL
        };
        Self::new(
            config.base_url.as_deref().unwrap_or(default_base),
            config.api_key.as_deref(),
            &config.model,
            config.dimensions,
        )
    }

    async fn request(&self, texts: &[String]) -> Result<EmbedResponse> {
        let mut request = self.http.post(&self.endpoint).json(&EmbedRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CragError::Embedding(format!("{}: {}", self.endpoint, e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CragError::Embedding(format!("HTTP {}: {}", status, body)));
        }
        response
            .json()
            .await
            .map_err(|e| CragError::Embedding(format!("unreadable response: {}", e)))
    }
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn embed(&self, texts: &[String]) -> BoxFuture<'_, Result<Vec<Vec<f32>>>> {
        let texts = texts.to_vec();
        Box::pin(async move {
            if texts.is_empty() {
                return Ok(Vec::new());
            }
            debug!(model = %self.model, count = texts.len(), "Embedding batch");
            let response = self.request(&texts).await?;
            collect_vectors(response.data, texts.len(), self.dims)
        })
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Put vectors back in input order and reject a short batch or a
/// dimension mismatch.
fn collect_vectors(mut items: Vec<EmbedItem>, expected: usize, dims: usize) -> Result<Vec<Vec<f32>>> {
    if items.len() != expected {
        return Err(CragError::Embedding(format!(
            "asked for {} embeddings, received {}",
            expected,
            items.len()
        )));
    }
    if items.iter().all(|item| item.index.is_some()) {
        items.sort_unstable_by_key(|item| item.index);
    }
    if let Some(bad) = items.iter().find(|item| item.embedding.len() != dims) {
        return Err(CragError::Embedding(format!(
            "model returned {}-dimensional vectors, config says {}",
            bad.embedding.len(),
            dims
        )));
    }
    Ok(items.into_iter().map(|item| item.embedding).collect())
}

/// Cosine of the angle between two vectors; 0.0 for empty, mismatched or
/// zero-length input.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (dot, aa, bb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, aa, bb), (x, y)| {
            (dot + x * y, aa + x * x, bb + y * y)
        });
    let norm = aa.sqrt() * bb.sqrt();
    if norm == 0.0 {
        0.0
    } else {
        dot / norm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(index: Option<usize>, embedding: Vec<f32>) -> EmbedItem {
        EmbedItem { index, embedding }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[0.5, 0.5], &[1.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_degenerate_input() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_collect_vectors_restores_input_order() {
        let items = vec![item(Some(1), vec![2.0, 2.0]), item(Some(0), vec![1.0, 1.0])];
        let vectors = collect_vectors(items, 2, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 1.0], vec![2.0, 2.0]]);
    }

    #[test]
    fn test_collect_vectors_rejects_short_batch() {
        let err = collect_vectors(vec![item(None, vec![1.0])], 2, 1).unwrap_err();
        assert!(err.to_string().contains("received 1"));
    }

    #[test]
    fn test_collect_vectors_rejects_wrong_dimensions() {
        let err = collect_vectors(vec![item(Some(0), vec![1.0, 0.0, 0.0])], 1, 1536).unwrap_err();
        assert!(matches!(err, CragError::Embedding(_)));
        assert!(err.to_string().contains("1536"));
    }

    #[test]
    fn test_from_config_picks_provider_endpoint() {
        let ollama = HttpEmbeddingProvider::from_config(&EmbeddingConfig {
            provider: "ollama".into(),
            model: "nomic-embed-text".into(),
            dimensions: 768,
            ..Default::default()
        });
        assert_eq!(ollama.endpoint, "http://localhost:11434/v1/embeddings");
        assert_eq!(ollama.dimensions(), 768);

        let custom = HttpEmbeddingProvider::new("http://gpu-box:8000/v1/", None, "bge", 1024);
        assert_eq!(custom.endpoint, "http://gpu-box:8000/v1/embeddings");
    }

    #[tokio::test]
    async fn test_empty_batch_skips_request() {
        let provider = HttpEmbeddingProvider::new("http://127.0.0.1:9", None, "none", 8);
        assert!(provider.embed(&[]).await.unwrap().is_empty());
    }
}
