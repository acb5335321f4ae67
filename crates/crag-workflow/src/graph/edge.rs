use crag_core::config::WorkflowConfig;

use super::node::Node;
use super::state::UnverifiedReason;
use crate::judge::{Groundedness, RouteDecision, Utility};

/// Result reported by a node after it ran. Each variant belongs to exactly
/// one node, so the transition table cannot see an outcome from the wrong
/// source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Routed(RouteDecision),
    Retrieved,
    Graded { needs_web_search: bool },
    Searched,
    Generated,
    Checked(Groundedness),
    Assessed(Utility),
}

impl Outcome {
    /// The node that produces this outcome.
    pub fn source(&self) -> Node {
        match self {
            Outcome::Routed(_) => Node::Route,
            Outcome::Retrieved => Node::RetrieveLocal,
            Outcome::Graded { .. } => Node::GradeDocuments,
            Outcome::Searched => Node::WebSearch,
            Outcome::Generated => Node::Generate,
            Outcome::Checked(_) => Node::CheckGroundedness,
            Outcome::Assessed(_) => Node::CheckUtility,
        }
    }
}

/// Loop limits for the two corrective cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_retries: u32,
    pub max_requeries: u32,
}

impl From<&WorkflowConfig> for Limits {
    fn from(config: &WorkflowConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            max_requeries: config.max_requeries,
        }
    }
}

impl Limits {
    /// Upper bound on node entries for one run, `Terminate` included.
    pub fn max_steps(&self) -> usize {
        // Route, retrieve, grade, search, then one generate/check/utility
        // round per retry plus a search per requery.
        let retries = self.max_retries as usize + 1;
        let requeries = self.max_requeries as usize + 1;
        4 + requeries * (1 + retries * 3) + 1
    }
}

/// Side effect applied to the run state when following an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    None,
    IncrementRetry,
    IncrementRequery,
    /// Terminate with a best-effort answer.
    Exhausted(UnverifiedReason),
    /// Terminate with a checked answer.
    Verified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub to: Node,
    pub effect: Effect,
}

impl Transition {
    fn to(node: Node) -> Self {
        Self {
            to: node,
            effect: Effect::None,
        }
    }
}

/// Pick the next node from a node outcome and the current loop counters.
pub fn transition(outcome: Outcome, retry_count: u32, requery_count: u32, limits: Limits) -> Transition {
    match outcome {
        Outcome::Routed(RouteDecision::LocalIndex) => Transition::to(Node::RetrieveLocal),
        Outcome::Routed(RouteDecision::WebSearch) => Transition::to(Node::WebSearch),
        Outcome::Retrieved => Transition::to(Node::GradeDocuments),
        Outcome::Graded { needs_web_search: true } => Transition::to(Node::WebSearch),
        Outcome::Graded { needs_web_search: false } => Transition::to(Node::Generate),
        Outcome::Searched => Transition::to(Node::Generate),
        Outcome::Generated => Transition::to(Node::CheckGroundedness),
        Outcome::Checked(Groundedness::Grounded) => Transition::to(Node::CheckUtility),
        Outcome::Checked(Groundedness::Hallucinated) if retry_count < limits.max_retries => {
            Transition {
                to: Node::Generate,
                effect: Effect::IncrementRetry,
            }
        }
        Outcome::Checked(Groundedness::Hallucinated) => Transition {
            to: Node::Terminate,
            effect: Effect::Exhausted(UnverifiedReason::GroundednessRetriesExhausted),
        },
        Outcome::Assessed(Utility::Useful) => Transition {
            to: Node::Terminate,
            effect: Effect::Verified,
        },
        Outcome::Assessed(Utility::NotUseful) if requery_count < limits.max_requeries => {
            Transition {
                to: Node::WebSearch,
                effect: Effect::IncrementRequery,
            }
        }
        Outcome::Assessed(Utility::NotUseful) => Transition {
            to: Node::Terminate,
            effect: Effect::Exhausted(UnverifiedReason::UtilityRequeriesExhausted),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: Limits = Limits {
        max_retries: 3,
        max_requeries: 3,
    };

    #[test]
    fn test_unconditional_edges() {
        assert_eq!(transition(Outcome::Retrieved, 0, 0, LIMITS).to, Node::GradeDocuments);
        assert_eq!(transition(Outcome::Searched, 0, 0, LIMITS).to, Node::Generate);
        assert_eq!(transition(Outcome::Generated, 0, 0, LIMITS).to, Node::CheckGroundedness);
    }

    #[test]
    fn test_route_and_grade_edges() {
        let local = transition(Outcome::Routed(RouteDecision::LocalIndex), 0, 0, LIMITS);
        assert_eq!(local.to, Node::RetrieveLocal);
        let web = transition(Outcome::Routed(RouteDecision::WebSearch), 0, 0, LIMITS);
        assert_eq!(web.to, Node::WebSearch);

        let fallback = transition(Outcome::Graded { needs_web_search: true }, 0, 0, LIMITS);
        assert_eq!(fallback.to, Node::WebSearch);
        let direct = transition(Outcome::Graded { needs_web_search: false }, 0, 0, LIMITS);
        assert_eq!(direct.to, Node::Generate);
    }

    #[test]
    fn test_hallucinated_retries_until_limit() {
        let hallucinated = Outcome::Checked(Groundedness::Hallucinated);
        for retry in 0..LIMITS.max_retries {
            let t = transition(hallucinated, retry, 0, LIMITS);
            assert_eq!(t.to, Node::Generate);
            assert_eq!(t.effect, Effect::IncrementRetry);
        }
        let t = transition(hallucinated, LIMITS.max_retries, 0, LIMITS);
        assert_eq!(t.to, Node::Terminate);
        assert_eq!(
            t.effect,
            Effect::Exhausted(UnverifiedReason::GroundednessRetriesExhausted)
        );
    }

    #[test]
    fn test_not_useful_requeries_until_limit() {
        let not_useful = Outcome::Assessed(Utility::NotUseful);
        let t = transition(not_useful, 3, 2, LIMITS);
        assert_eq!(t.to, Node::WebSearch);
        assert_eq!(t.effect, Effect::IncrementRequery);

        let t = transition(not_useful, 0, 3, LIMITS);
        assert_eq!(t.to, Node::Terminate);
        assert_eq!(
            t.effect,
            Effect::Exhausted(UnverifiedReason::UtilityRequeriesExhausted)
        );
    }

    #[test]
    fn test_useful_and_grounded() {
        let t = transition(Outcome::Assessed(Utility::Useful), 3, 3, LIMITS);
        assert_eq!(t, Transition { to: Node::Terminate, effect: Effect::Verified });
        let t = transition(Outcome::Checked(Groundedness::Grounded), 3, 0, LIMITS);
        assert_eq!(t.to, Node::CheckUtility);
    }

    #[test]
    fn test_zero_limits_terminate_immediately() {
        let zero = Limits {
            max_retries: 0,
            max_requeries: 0,
        };
        assert_eq!(
            transition(Outcome::Checked(Groundedness::Hallucinated), 0, 0, zero).to,
            Node::Terminate
        );
        assert_eq!(
            transition(Outcome::Assessed(Utility::NotUseful), 0, 0, zero).to,
            Node::Terminate
        );
    }

    #[test]
    fn test_outcome_source() {
        assert_eq!(Outcome::Graded { needs_web_search: true }.source(), Node::GradeDocuments);
        assert_eq!(Outcome::Assessed(Utility::Useful).source(), Node::CheckUtility);
    }
}
