//! Scripted mocks shared by the crag crates' tests.
//!
//! `ScriptedLlm` answers by matching markers against the request text, so
//! concurrent callers (e.g. per-passage grading) get deterministic answers.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crag_core::config::ModelConfig;
use crag_core::error::{CragError, Result};
use crag_core::traits::{EmbeddingProvider, EvidenceSource, LlmClient};
use crag_core::types::{ChatMessage, Passage, StopReason, StreamDelta};

/// Minimal model config for tests.
pub fn test_model_config() -> ModelConfig {
    ModelConfig {
        provider: "openai".to_string(),
        model_id: "test-model".to_string(),
        api_key: None,
        base_url: None,
        max_tokens: 256,
        temperature: 0.0,
        retry: None,
    }
}

/// Write TOML to a temporary file that lives as long as the handle.
pub fn temp_config(toml: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml.as_bytes()).expect("write toml");
    tmp
}

struct Script {
    marker: Option<String>,
    responses: VecDeque<String>,
}

impl Script {
    /// Pop the next response; the last one repeats forever.
    fn next(&mut self) -> Option<String> {
        if self.responses.len() > 1 {
            self.responses.pop_front()
        } else {
            self.responses.front().cloned()
        }
    }
}

/// LLM mock returning scripted text.
///
/// Rules added with [`ScriptedLlm::on`] are checked in insertion order
/// against the concatenated request; the first rule whose marker occurs
/// answers. Requests matching no rule use the default script.
pub struct ScriptedLlm {
    rules: Mutex<Vec<Script>>,
    default: Mutex<Script>,
    failures: Mutex<(usize, String)>,
    calls: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            default: Mutex::new(Script {
                marker: None,
                responses: responses.into_iter().map(String::from).collect(),
            }),
            failures: Mutex::new((0, String::new())),
            calls: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Answer requests containing `marker` with `responses`, in order.
    pub fn on(self, marker: &str, responses: Vec<&str>) -> Self {
        self.rules.lock().unwrap().push(Script {
            marker: Some(marker.to_string()),
            responses: responses.into_iter().map(String::from).collect(),
        });
        self
    }

    /// Fail the first `n` requests with an `LlmRequest` error.
    pub fn fail_first(self, n: usize, message: &str) -> Self {
        *self.failures.lock().unwrap() = (n, message.to_string());
        self
    }

    /// Shared counter of `chat_stream` calls, failed ones included.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Shared log of request texts received.
    pub fn request_log(&self) -> Arc<Mutex<Vec<String>>> {
        self.requests.clone()
    }

    fn respond(&self, request: &str) -> Result<String> {
        {
            let mut failures = self.failures.lock().unwrap();
            if failures.0 > 0 {
                failures.0 -= 1;
                return Err(CragError::LlmRequest(failures.1.clone()));
            }
        }

        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            let hit = rule
                .marker
                .as_deref()
                .is_some_and(|m| request.contains(m));
            if hit {
                if let Some(text) = rule.next() {
                    return Ok(text);
                }
            }
        }
        drop(rules);

        self.default
            .lock()
            .unwrap()
            .next()
            .ok_or_else(|| CragError::LlmRequest("no scripted response".into()))
    }
}

impl LlmClient for ScriptedLlm {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        messages: Vec<ChatMessage>,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let request = messages
            .iter()
            .map(|m| m.text())
            .collect::<Vec<_>>()
            .join("\n");

        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            let text = self.respond(&request)?;

            // Split so callers exercise delta concatenation
            let mid = text
                .char_indices()
                .nth(text.chars().count() / 2)
                .map(|(i, _)| i)
                .unwrap_or(0);
            let deltas = vec![
                Ok(StreamDelta::TextDelta(text[..mid].to_string())),
                Ok(StreamDelta::TextDelta(text[mid..].to_string())),
                Ok(StreamDelta::Stop(StopReason::EndTurn)),
            ];
            Ok(Box::pin(futures::stream::iter(deltas)) as BoxStream<'_, Result<StreamDelta>>)
        })
    }
}

/// Evidence source returning the same passages on every fetch.
pub struct StaticSource {
    name: String,
    passages: Vec<Passage>,
    calls: Arc<AtomicUsize>,
}

impl StaticSource {
    pub fn new(name: &str, passages: Vec<Passage>) -> Self {
        Self {
            name: name.to_string(),
            passages,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl EvidenceSource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, _question: &str) -> BoxFuture<'_, Result<Vec<Passage>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let passages = self.passages.clone();
        Box::pin(async move { Ok(passages) })
    }
}

/// Evidence source that always fails with an unavailable error.
pub enum FailingSource {
    Index,
    Search,
}

impl EvidenceSource for FailingSource {
    fn name(&self) -> &str {
        match self {
            FailingSource::Index => "failing_index",
            FailingSource::Search => "failing_search",
        }
    }

    fn fetch(&self, _question: &str) -> BoxFuture<'_, Result<Vec<Passage>>> {
        let err = match self {
            FailingSource::Index => CragError::IndexUnavailable("index not built".into()),
            FailingSource::Search => CragError::SearchUnavailable("HTTP 401".into()),
        };
        Box::pin(async move { Err(err) })
    }
}

/// Deterministic bag-of-words embedder: each lowercase word is hashed into
/// one of `dims` buckets, so texts sharing words are similar.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let bucket = word
                .to_lowercase()
                .bytes()
                .fold(5381u64, |h, b| h.wrapping_mul(33) ^ b as u64);
            v[(bucket % self.dims as u64) as usize] += 1.0;
        }
        v
    }
}

impl EmbeddingProvider for HashEmbedder {
    fn embed(&self, texts: &[String]) -> BoxFuture<'_, Result<Vec<Vec<f32>>>> {
        let vectors = texts.iter().map(|t| self.embed_one(t)).collect();
        Box::pin(async move { Ok(vectors) })
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_repeats_last() {
        let llm = ScriptedLlm::new(vec!["a", "b"]);
        assert_eq!(llm.respond("x").unwrap(), "a");
        assert_eq!(llm.respond("x").unwrap(), "b");
        assert_eq!(llm.respond("x").unwrap(), "b");
    }

    #[test]
    fn test_rules_take_precedence() {
        let llm = ScriptedLlm::new(vec!["default"]).on("pasta", vec!["no"]);
        assert_eq!(llm.respond("how to cook pasta").unwrap(), "no");
        assert_eq!(llm.respond("vector databases").unwrap(), "default");
    }

    #[test]
    fn test_hash_embedder_similarity() {
        let e = HashEmbedder::new(64);
        assert_eq!(e.embed_one("Prompt engineering"), e.embed_one("prompt ENGINEERING"));
        assert_eq!(e.embed_one("").iter().sum::<f32>(), 0.0);
    }
}
