//! Judgment functions: LLM-backed classifiers that map text onto a small,
//! closed set of labels.
//!
//! Each label type parses model output through `FromStr`. Parsing is strict;
//! the conservative label for a grader is chosen by the grader itself when
//! parsing fails, never inside the parser.

use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crag_core::config::ModelConfig;
use crag_core::error::{CragError, Result};
use crag_core::traits::LlmClient;
use crag_core::types::{ChatMessage, Passage};

/// Initial evidence source chosen by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteDecision {
    LocalIndex,
    WebSearch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Relevance {
    Relevant,
    Irrelevant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Groundedness {
    Grounded,
    Hallucinated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Utility {
    Useful,
    NotUseful,
}

/// Pull the label word out of a model response.
///
/// Accepts `{"score": "..."}` (optionally inside a markdown fence), the
/// `{"binary_score": "yes"}` form, booleans, or a bare word. The result is
/// lowercased with spaces and dashes folded to underscores.
fn extract_label(output: &str) -> String {
    let json_str = extract_json(output);
    let raw = match serde_json::from_str::<serde_json::Value>(json_str) {
        Ok(serde_json::Value::Object(map)) => ["score", "binary_score", "datasource", "label"]
            .iter()
            .find_map(|key| map.get(*key))
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Bool(true) => "yes".to_string(),
                serde_json::Value::Bool(false) => "no".to_string(),
                other => other.to_string(),
            })
            .unwrap_or_default(),
        Ok(serde_json::Value::String(s)) => s,
        _ => output.to_string(),
    };

    raw.trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '.' || c == '`')
        .trim()
        .to_lowercase()
        .replace([' ', '-'], "_")
}

/// Extract JSON from a response that may contain markdown code fences.
fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                return &trimmed[start..=end];
            }
        }
    }
    trimmed
}

fn parse_error(expected: &str, output: &str) -> CragError {
    CragError::JudgmentParse {
        expected: expected.to_string(),
        output: output.trim().to_string(),
    }
}

impl FromStr for RouteDecision {
    type Err = CragError;

    fn from_str(s: &str) -> Result<Self> {
        match extract_label(s).as_str() {
            "local_index" | "vectorstore" | "local" | "index" => Ok(Self::LocalIndex),
            "web_search" | "websearch" | "web" => Ok(Self::WebSearch),
            _ => Err(parse_error("local_index, web_search", s)),
        }
    }
}

impl FromStr for Relevance {
    type Err = CragError;

    fn from_str(s: &str) -> Result<Self> {
        match extract_label(s).as_str() {
            "relevant" | "yes" => Ok(Self::Relevant),
            "irrelevant" | "not_relevant" | "no" => Ok(Self::Irrelevant),
            _ => Err(parse_error("relevant, irrelevant", s)),
        }
    }
}

impl FromStr for Groundedness {
    type Err = CragError;

    fn from_str(s: &str) -> Result<Self> {
        match extract_label(s).as_str() {
            "grounded" | "supported" | "yes" => Ok(Self::Grounded),
            "hallucinated" | "not_supported" | "no" => Ok(Self::Hallucinated),
            _ => Err(parse_error("grounded, hallucinated", s)),
        }
    }
}

impl FromStr for Utility {
    type Err = CragError;

    fn from_str(s: &str) -> Result<Self> {
        match extract_label(s).as_str() {
            "useful" | "yes" => Ok(Self::Useful),
            "not_useful" | "no" => Ok(Self::NotUseful),
            _ => Err(parse_error("useful, not_useful", s)),
        }
    }
}

/// Shared request path for the four graders.
struct Classifier {
    llm: Arc<dyn LlmClient>,
    config: ModelConfig,
}

impl Classifier {
    async fn ask(&self, system: String, user: String) -> Result<String> {
        let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        let output = crag_llm::complete(self.llm.as_ref(), &self.config, messages).await?;
        debug!(chars = output.len(), "Judgment response");
        Ok(output)
    }
}

/// Decides whether a question belongs to the local corpus.
pub struct Router {
    inner: Classifier,
    topics: Vec<String>,
}

impl Router {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig, topics: Vec<String>) -> Self {
        Self {
            inner: Classifier { llm, config },
            topics,
        }
    }

    /// Falls back to web search on unparseable output, since it has no
    /// topical precondition.
    pub async fn classify(&self, question: &str) -> Result<RouteDecision> {
        let system = format!(
            r#"You are an expert at routing a user question to a local index or web search.
The local index contains documents about: {}.
Use the local index for questions on these topics. Otherwise, use web search.

Respond with ONLY valid JSON: {{"score": "local_index" | "web_search"}}"#,
            self.topics.join(", ")
        );
        let output = self.inner.ask(system, format!("Question: {}", question)).await?;

        match output.parse() {
            Ok(decision) => Ok(decision),
            Err(e) => {
                warn!(error = %e, "Unparseable route decision, using web search");
                Ok(RouteDecision::WebSearch)
            }
        }
    }
}

/// Grades one passage against the question.
pub struct RelevanceGrader {
    inner: Classifier,
}

impl RelevanceGrader {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig) -> Self {
        Self {
            inner: Classifier { llm, config },
        }
    }

    pub async fn classify(&self, question: &str, passage: &Passage) -> Result<Relevance> {
        let system = r#"You are a strict grader assessing relevance of a retrieved document to a user question.

The document must DIRECTLY address the user's question to be considered relevant.
Do NOT grade as relevant if:
- The document only shares a general topic area
- There is only a tangential or indirect connection
- The document cannot help answer the specific question asked

Respond with ONLY valid JSON: {"score": "relevant" | "irrelevant"}"#;
        let user = format!(
            "Retrieved document:\n\n{}\n\nUser question: {}",
            passage.text, question
        );
        let output = self.inner.ask(system.to_string(), user).await?;

        match output.parse() {
            Ok(label) => Ok(label),
            Err(e) => {
                warn!(error = %e, source = %passage.source, "Unparseable relevance grade, treating as irrelevant");
                Ok(Relevance::Irrelevant)
            }
        }
    }
}

/// Checks that an answer is supported by the evidence as a whole.
pub struct GroundednessGrader {
    inner: Classifier,
}

impl GroundednessGrader {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig) -> Self {
        Self {
            inner: Classifier { llm, config },
        }
    }

    pub async fn classify(&self, evidence: &[Passage], answer: &str) -> Result<Groundedness> {
        let system = r#"You are a grader assessing whether an LLM generation is grounded in / supported by a set of retrieved facts.
"grounded" means every claim in the generation is supported by the facts.

Respond with ONLY valid JSON: {"score": "grounded" | "hallucinated"}"#;
        let user = format!(
            "Set of facts:\n\n{}\n\nLLM generation: {}",
            join_passages(evidence),
            answer
        );
        let output = self.inner.ask(system.to_string(), user).await?;

        match output.parse() {
            Ok(label) => Ok(label),
            Err(e) => {
                warn!(error = %e, "Unparseable groundedness grade, treating as hallucinated");
                Ok(Groundedness::Hallucinated)
            }
        }
    }
}

/// Checks that an answer addresses the literal question.
pub struct UtilityGrader {
    inner: Classifier,
}

impl UtilityGrader {
    pub fn new(llm: Arc<dyn LlmClient>, config: ModelConfig) -> Self {
        Self {
            inner: Classifier { llm, config },
        }
    }

    pub async fn classify(&self, question: &str, answer: &str) -> Result<Utility> {
        let system = r#"You are a grader assessing whether an answer addresses / resolves a question.

Respond with ONLY valid JSON: {"score": "useful" | "not_useful"}"#;
        let user = format!("User question:\n\n{}\n\nLLM generation: {}", question, answer);
        let output = self.inner.ask(system.to_string(), user).await?;

        match output.parse() {
            Ok(label) => Ok(label),
            Err(e) => {
                warn!(error = %e, "Unparseable utility grade, treating as not useful");
                Ok(Utility::NotUseful)
            }
        }
    }
}

/// Concatenate passage texts for prompts.
pub(crate) fn join_passages(passages: &[Passage]) -> String {
    passages
        .iter()
        .map(|p| p.text.trim())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crag_test_utils::{test_model_config, ScriptedLlm};

    #[test]
    fn test_parse_score_json() {
        assert_eq!(
            r#"{"score": "relevant"}"#.parse::<Relevance>().unwrap(),
            Relevance::Relevant
        );
        assert_eq!(
            "```json\n{\"score\": \"not_useful\"}\n```".parse::<Utility>().unwrap(),
            Utility::NotUseful
        );
    }

    #[test]
    fn test_parse_binary_score() {
        assert_eq!(
            r#"{"binary_score": "yes"}"#.parse::<Groundedness>().unwrap(),
            Groundedness::Grounded
        );
        assert_eq!(
            r#"{"binary_score": false}"#.parse::<Relevance>().unwrap(),
            Relevance::Irrelevant
        );
    }

    #[test]
    fn test_parse_bare_word() {
        assert_eq!("Hallucinated.".parse::<Groundedness>().unwrap(), Groundedness::Hallucinated);
        assert_eq!("not useful".parse::<Utility>().unwrap(), Utility::NotUseful);
        assert_eq!(" web-search ".parse::<RouteDecision>().unwrap(), RouteDecision::WebSearch);
        assert_eq!(
            r#"{"datasource": "vectorstore"}"#.parse::<RouteDecision>().unwrap(),
            RouteDecision::LocalIndex
        );
    }

    #[test]
    fn test_parse_rejects_unknown_label() {
        let err = "maybe".parse::<Relevance>().unwrap_err();
        assert!(matches!(err, CragError::JudgmentParse { .. }));
        assert!(r#"{"score": "somewhat"}"#.parse::<Utility>().is_err());
        assert!("".parse::<RouteDecision>().is_err());
    }

    #[tokio::test]
    async fn test_router_fallback_is_web_search() {
        let llm = Arc::new(ScriptedLlm::new(vec!["I cannot decide."]));
        let router = Router::new(llm, test_model_config(), vec!["agents".into()]);
        assert_eq!(router.classify("anything").await.unwrap(), RouteDecision::WebSearch);
    }

    #[tokio::test]
    async fn test_router_prompt_lists_topics() {
        let llm = ScriptedLlm::new(vec![r#"{"score": "local_index"}"#]);
        let log = llm.request_log();
        let router = Router::new(
            Arc::new(llm),
            test_model_config(),
            vec!["prompt engineering".into(), "vector databases".into()],
        );
        assert_eq!(
            router.classify("What is prompt engineering?").await.unwrap(),
            RouteDecision::LocalIndex
        );
        let requests = log.lock().unwrap();
        assert!(requests[0].contains("prompt engineering, vector databases"));
    }

    #[tokio::test]
    async fn test_graders_conservative_on_garbage() {
        let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm::new(vec!["¯\\_(ツ)_/¯"]));
        let config = test_model_config();
        let passage = Passage::local("Agents use tools.", "agents.md");

        let relevance = RelevanceGrader::new(llm.clone(), config.clone());
        assert_eq!(relevance.classify("q", &passage).await.unwrap(), Relevance::Irrelevant);

        let grounded = GroundednessGrader::new(llm.clone(), config.clone());
        assert_eq!(
            grounded.classify(&[passage], "answer").await.unwrap(),
            Groundedness::Hallucinated
        );

        let utility = UtilityGrader::new(llm, config);
        assert_eq!(utility.classify("q", "answer").await.unwrap(), Utility::NotUseful);
    }

    #[tokio::test]
    async fn test_grader_propagates_llm_error() {
        let llm = Arc::new(ScriptedLlm::new(vec!["yes"]).fail_first(1, "HTTP 401"));
        let grader = UtilityGrader::new(llm, test_model_config());
        let err = grader.classify("q", "a").await.unwrap_err();
        assert!(matches!(err, CragError::LlmRequest(_)));
    }

    #[tokio::test]
    async fn test_relevance_is_repeatable() {
        let llm = Arc::new(
            ScriptedLlm::new(vec![r#"{"score": "relevant"}"#])
                .on("pasta", vec![r#"{"score": "irrelevant"}"#]),
        );
        let grader = RelevanceGrader::new(llm, test_model_config());
        let passage = Passage::local("How to boil pasta.", "cooking.md");
        let first = grader.classify("What is an agent?", &passage).await.unwrap();
        let second = grader.classify("What is an agent?", &passage).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Relevance::Irrelevant);
    }
}
