//! Corrective retrieval state machine.
//!
//! A run walks a fixed graph of [`Node`]s. Each node does its work against
//! the [`RunState`] and reports an [`Outcome`]; [`edge::transition`] maps the
//! outcome and the loop counters to the next node. `Terminate` ends the run.

pub mod edge;
pub mod executor;
pub mod node;
pub mod state;

pub use edge::{transition, Effect, Limits, Outcome, Transition};
pub use executor::WorkflowEngine;
pub use node::Node;
pub use state::{RunOutcome, RunState, RunStatus, UnverifiedReason};
