//! Agent capability tags.
//!
//! Specialization is configuration, not subtyping: an agent is described
//! entirely by the tags it declares and the model backing it. The engine
//! routes on tag intersection and never inspects agent internals.

use serde::{Deserialize, Serialize};

/// Capabilities that an agent can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Can choose between candidate plans
    DecisionMaking,
    /// Can delegate work to other agents
    TaskDelegation,
    /// Can gather information from external sources
    Research,
    /// Can analyze gathered material
    Analysis,
    /// Can condense long content
    Summarization,
    /// Can write and modify code
    Coding,
    /// Can diagnose failing code
    Debugging,
    /// Can review code for issues
    CodeReview,
    /// Can work through open-ended problems
    ProblemSolving,
    /// Can create written content
    Writing,
}

impl Capability {
    /// The closed set of known tags, in declaration order.
    pub const ALL: [Capability; 10] = [
        Capability::DecisionMaking,
        Capability::TaskDelegation,
        Capability::Research,
        Capability::Analysis,
        Capability::Summarization,
        Capability::Coding,
        Capability::Debugging,
        Capability::CodeReview,
        Capability::ProblemSolving,
        Capability::Writing,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Capability::DecisionMaking).unwrap(),
            "\"decision_making\""
        );
        assert_eq!(
            serde_json::to_string(&Capability::CodeReview).unwrap(),
            "\"code_review\""
        );
    }

    #[test]
    fn test_capability_roundtrip() {
        for cap in Capability::ALL {
            let json = serde_json::to_string(&cap).unwrap();
            let back: Capability = serde_json::from_str(&json).unwrap();
            assert_eq!(back, cap);
        }
    }

    #[test]
    fn test_all_has_no_duplicates() {
        let mut seen = std::collections::HashSet::new();
        for cap in Capability::ALL {
            assert!(seen.insert(cap));
        }
    }
}
