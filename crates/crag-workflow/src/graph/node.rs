use serde::Serialize;

/// A step of the corrective retrieval graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Node {
    Route,
    RetrieveLocal,
    WebSearch,
    GradeDocuments,
    Generate,
    CheckGroundedness,
    CheckUtility,
    Terminate,
}

impl Node {
    pub fn as_str(&self) -> &'static str {
        match self {
            Node::Route => "route",
            Node::RetrieveLocal => "retrieve_local",
            Node::WebSearch => "web_search",
            Node::GradeDocuments => "grade_documents",
            Node::Generate => "generate",
            Node::CheckGroundedness => "check_groundedness",
            Node::CheckUtility => "check_utility",
            Node::Terminate => "terminate",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Node::Terminate)
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_serde() {
        for node in [Node::Route, Node::RetrieveLocal, Node::CheckUtility, Node::Terminate] {
            let json = serde_json::to_value(node).unwrap();
            assert_eq!(json, node.to_string());
        }
    }

    #[test]
    fn test_only_terminate_is_terminal() {
        assert!(Node::Terminate.is_terminal());
        assert!(!Node::Generate.is_terminal());
    }
}
