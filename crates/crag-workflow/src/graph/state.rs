use serde::Serialize;

use crag_core::types::{Passage, RunId};

use super::node::Node;

/// Mutable record for one question, owned by the engine for the length of a run.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run_id: RunId,
    pub question: String,
    pub documents: Vec<Passage>,
    pub generation: Option<String>,
    pub needs_web_search: bool,
    pub retry_count: u32,
    pub requery_count: u32,
    /// Nodes entered so far, in order.
    pub trace: Vec<Node>,
}

impl RunState {
    pub fn new(run_id: RunId, question: impl Into<String>) -> Self {
        Self {
            run_id,
            question: question.into(),
            documents: Vec::new(),
            generation: None,
            needs_web_search: false,
            retry_count: 0,
            requery_count: 0,
            trace: Vec::new(),
        }
    }

    /// Current candidate answer; empty before the first generation.
    pub fn answer(&self) -> &str {
        self.generation.as_deref().unwrap_or_default()
    }

    /// Finish the run, consuming the state.
    pub fn into_outcome(self, status: RunStatus) -> RunOutcome {
        let answer = match status {
            RunStatus::Unanswerable { .. } => None,
            _ => self.generation,
        };
        RunOutcome {
            run_id: self.run_id,
            question: self.question,
            answer,
            status,
            documents: self.documents,
            trace: self.trace,
            retry_count: self.retry_count,
            requery_count: self.requery_count,
        }
    }
}

/// Why a best-effort answer was returned without passing every check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnverifiedReason {
    GroundednessRetriesExhausted,
    UtilityRequeriesExhausted,
}

impl std::fmt::Display for UnverifiedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GroundednessRetriesExhausted => {
                write!(f, "answer still not grounded after the retry limit")
            }
            Self::UtilityRequeriesExhausted => {
                write!(f, "answer still not useful after the requery limit")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunStatus {
    /// Grounded in the evidence and useful for the question.
    Verified,
    /// Best-effort answer after a loop limit was hit.
    Unverified { reason: UnverifiedReason },
    /// The run failed; no answer is returned.
    Unanswerable { error: String },
}

impl RunStatus {
    pub fn is_verified(&self) -> bool {
        matches!(self, RunStatus::Verified)
    }
}

/// What a caller gets back from a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub question: String,
    pub answer: Option<String>,
    pub status: RunStatus,
    pub documents: Vec<Passage>,
    pub trace: Vec<Node>,
    pub retry_count: u32,
    pub requery_count: u32,
}
