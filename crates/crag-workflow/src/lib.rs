pub mod generator;
pub mod graph;
pub mod judge;

pub use generator::AnswerGenerator;
pub use graph::{RunOutcome, RunStatus, UnverifiedReason, WorkflowEngine};
pub use judge::{
    Groundedness, GroundednessGrader, Relevance, RelevanceGrader, RouteDecision, Router, Utility,
    UtilityGrader,
};
