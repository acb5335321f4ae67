use thiserror::Error;

#[derive(Debug, Error)]
pub enum CragError {
    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    // Judgment errors. Recovered by the workflow, never surfaced from a run.
    #[error("Judgment output did not match labels [{expected}]: {output}")]
    JudgmentParse { expected: String, output: String },

    // Evidence source errors
    #[error("Local index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Web search unavailable: {0}")]
    SearchUnavailable(String),

    #[error("Embedding request failed: {0}")]
    Embedding(String),

    // Workflow errors
    #[error("Workflow node {node} exceeded deadline ({timeout_secs}s)")]
    NodeTimeout { node: String, timeout_secs: u64 },

    #[error("Workflow cancelled")]
    Cancelled,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CragError {
    /// Whether this error means an evidence source could not be reached.
    pub fn is_source_unavailable(&self) -> bool {
        matches!(
            self,
            CragError::IndexUnavailable(_) | CragError::SearchUnavailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CragError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_unavailable_classification() {
        assert!(CragError::IndexUnavailable("no index".into()).is_source_unavailable());
        assert!(CragError::SearchUnavailable("401".into()).is_source_unavailable());
        assert!(!CragError::LlmRequest("HTTP 500".into()).is_source_unavailable());
    }

    #[test]
    fn test_judgment_parse_message() {
        let err = CragError::JudgmentParse {
            expected: "relevant, irrelevant".into(),
            output: "maybe".into(),
        };
        assert_eq!(
            err.to_string(),
            "Judgment output did not match labels [relevant, irrelevant]: maybe"
        );
    }
}
