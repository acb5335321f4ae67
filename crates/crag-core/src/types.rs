use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a model exchange.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }

    pub fn text(&self) -> &str {
        &self.content
    }
}

/// Stop reason from the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
}

/// A streaming delta from the LLM.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text content.
    TextDelta(String),

    /// The response is complete.
    Stop(StopReason),

    /// Usage information.
    Usage {
        input_tokens: u64,
        output_tokens: u64,
    },
}

/// Where a passage came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    LocalIndex,
    WebSearch,
}

/// A unit of retrieved evidence with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    /// File path for local chunks, URL for web snippets.
    pub source: String,
    pub kind: SourceKind,
}

impl Passage {
    pub fn local(text: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: source.into(),
            kind: SourceKind::LocalIndex,
        }
    }

    pub fn web(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: url.into(),
            kind: SourceKind::WebSearch,
        }
    }
}

/// Workflow progress broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A run started for a question.
    RunStarted { run_id: RunId, question: String },
    /// The engine entered a node.
    NodeEntered {
        run_id: RunId,
        node: String,
        retry_count: u32,
        requery_count: u32,
    },
    /// A passage received a relevance grade.
    DocumentGraded {
        run_id: RunId,
        source: String,
        relevant: bool,
    },
    /// A run reached Terminate.
    RunComplete {
        run_id: RunId,
        verified: bool,
        transitions: usize,
    },
    /// A run failed.
    RunError { run_id: RunId, error: String },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::NodeEntered { run_id, .. }
            | WorkflowEvent::DocumentGraded { run_id, .. }
            | WorkflowEvent::RunComplete { run_id, .. }
            | WorkflowEvent::RunError { run_id, .. } => run_id,
        }
    }

    /// Last event a run publishes.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::RunComplete { .. } | WorkflowEvent::RunError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passage_constructors() {
        let p = Passage::local("Agents use tools.", "docs/agents.md");
        assert_eq!(p.kind, SourceKind::LocalIndex);
        let w = Passage::web("Sunny, 21C", "https://weather.example/tokyo");
        assert_eq!(w.kind, SourceKind::WebSearch);
        assert_eq!(w.source, "https://weather.example/tokyo");
    }

    #[test]
    fn test_passage_serde_kind() {
        let json = serde_json::to_value(Passage::web("x", "u")).unwrap();
        assert_eq!(json["kind"], "web_search");
    }

    #[test]
    fn test_chat_message_serializes_role_and_content_only() {
        let json = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "hi"}));
    }

    #[test]
    fn test_run_id_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }
}
