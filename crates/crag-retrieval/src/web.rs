use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crag_core::config::WebSearchConfig;
use crag_core::error::{CragError, Result};
use crag_core::traits::EvidenceSource;
use crag_core::types::Passage;

const TAVILY_API_URL: &str = "https://api.tavily.com";

/// Tavily web search. Each result snippet becomes one passage tagged with its URL.
pub struct TavilySearch {
    api_key: Option<String>,
    base_url: String,
    max_results: usize,
    http: reqwest::Client,
}

impl TavilySearch {
    pub fn new(api_key: Option<&str>, max_results: usize) -> Self {
        Self {
            api_key: api_key.map(String::from),
            base_url: TAVILY_API_URL.to_string(),
            max_results,
            http: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &WebSearchConfig) -> Self {
        let mut search = Self::new(config.api_key.as_deref(), config.max_results);
        if let Some(url) = &config.base_url {
            search.base_url = url.trim_end_matches('/').to_string();
        }
        search
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    #[serde(default)]
    url: String,
    #[serde(default)]
    content: String,
}

/// Convert a Tavily response body into at most `max` passages, skipping
/// empty snippets.
fn parse_results(body: &str, max: usize) -> Result<Vec<Passage>> {
    let resp: SearchResponse = serde_json::from_str(body)
        .map_err(|e| CragError::SearchUnavailable(format!("malformed response: {}", e)))?;
    Ok(resp
        .results
        .into_iter()
        .filter(|hit| !hit.content.trim().is_empty())
        .take(max)
        .map(|hit| Passage::web(hit.content, hit.url))
        .collect())
}

impl EvidenceSource for TavilySearch {
    fn name(&self) -> &str {
        "tavily"
    }

    fn fetch(&self, question: &str) -> BoxFuture<'_, Result<Vec<Passage>>> {
        let question = question.to_string();
        Box::pin(async move {
            let api_key = self.api_key.as_deref().ok_or_else(|| {
                CragError::SearchUnavailable("web_search.api_key is not set".into())
            })?;

            let resp = self
                .http
                .post(format!("{}/search", self.base_url))
                .bearer_auth(api_key)
                .json(&json!({
                    "query": question,
                    "max_results": self.max_results,
                }))
                .send()
                .await
                .map_err(|e| CragError::SearchUnavailable(e.to_string()))?;

            let status = resp.status();
            let body = resp
                .text()
                .await
                .map_err(|e| CragError::SearchUnavailable(e.to_string()))?;

            if !status.is_success() {
                return Err(CragError::SearchUnavailable(format!("HTTP {}: {}", status, body)));
            }

            let passages = parse_results(&body, self.max_results)?;
            debug!(results = passages.len(), "Web search complete");
            Ok(passages)
        })
    }
}
