use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CragError, Result};

/// Top-level crag configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub web_search: WebSearchConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_provider() -> String { "gemini".to_string() }
fn default_max_tokens() -> u32 { 2048 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Local index and ingestion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// SQLite index file, `~` expanded.
    pub index_path: String,
    /// Passages returned by a local lookup.
    pub top_k: usize,
    /// Topics the local corpus covers; the router sends these to the index.
    pub topics: Vec<String>,
    /// Chunk size in tokens used when building the index.
    pub chunk_tokens: usize,
    /// Tokens repeated between neighbouring chunks, at most half a chunk.
    pub chunk_overlap: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            index_path: "~/.crag/index.db".into(),
            top_k: 4,
            topics: [
                "LLM-powered autonomous agents",
                "prompt engineering",
                "adversarial attacks on LLMs",
                "retrieval augmented generation",
                "vector databases",
                "fine-tuning language models",
            ]
            .map(String::from)
            .to_vec(),
            chunk_tokens: 250,
            chunk_overlap: 0,
        }
    }
}

/// Embedding model for the local index. `provider` is "openai", "ollama"
/// or any OpenAI-compatible API reached through `base_url`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Must match the model's output; checked on every response.
    pub dimensions: usize,
    /// Texts sent per embedding request during ingestion.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "text-embedding-3-small".into(),
            base_url: None,
            api_key: None,
            dimensions: 1536,
            batch_size: 32,
        }
    }
}

/// Web search provider. Only Tavily is supported.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSearchConfig {
    pub provider: String,
    pub api_key: Option<String>,
    pub max_results: usize,
    pub base_url: Option<String>,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            provider: "tavily".into(),
            api_key: None,
            max_results: 3,
            base_url: None,
        }
    }
}

/// Corrective loop limits and execution options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Regenerations allowed after a hallucinated answer.
    pub max_retries: u32,
    /// Extra web searches allowed after an answer judged not useful.
    pub max_requeries: u32,
    /// Grade retrieved passages concurrently.
    pub concurrent_grading: bool,
    /// Deadline for a single node, unbounded when absent.
    pub node_timeout_secs: Option<u64>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_requeries: 3,
            concurrent_grading: true,
            node_timeout_secs: None,
        }
    }
}

impl AppConfig {
    /// Read a TOML file, expand `${VAR}` references and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|_| CragError::ConfigNotFound(path.display().to_string()))?;
        let config: Self =
            toml::from_str(&expand_env_vars(&raw)).map_err(|e| CragError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the workflow cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(CragError::Config(msg));
        let r = &self.retrieval;
        if r.top_k == 0 {
            return fail("retrieval.top_k must be at least 1".into());
        }
        if r.chunk_tokens == 0 || r.chunk_overlap > r.chunk_tokens / 2 {
            return fail(format!(
                "retrieval.chunk_overlap ({}) must be at most half of chunk_tokens ({})",
                r.chunk_overlap, r.chunk_tokens
            ));
        }
        if self.embedding.dimensions == 0 || self.embedding.batch_size == 0 {
            return fail("embedding.dimensions and embedding.batch_size must be positive".into());
        }
        if self.web_search.provider != "tavily" {
            return fail(format!(
                "web_search.provider \"{}\" is not supported",
                self.web_search.provider
            ));
        }
        if self.web_search.max_results == 0 {
            return fail("web_search.max_results must be at least 1".into());
        }
        if self.workflow.node_timeout_secs == Some(0) {
            return fail("workflow.node_timeout_secs must be positive when set".into());
        }
        Ok(())
    }

    /// Index file with `~` expanded.
    pub fn index_path(&self) -> PathBuf {
        expand_home(&self.retrieval.index_path)
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs_home()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Replace `${VAR}` with the variable's value. Unset variables and an
/// unterminated `${` are left as written.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(len) = after.find('}') else {
            rest = &rest[start..];
            break;
        };
        let name = &after[..len];
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(&rest[start..start + 2 + len + 1]),
        }
        rest = &after[len + 1..];
    }
    out.push_str(rest);
    out
}

pub fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
