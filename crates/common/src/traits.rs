//! Collaborator contracts consumed by the engine.
//!
//! These traits are defined in `conclave-common` so the engine and any
//! collaborator implementation can reference them without circular
//! dependencies. Implementations (model inference, worker agents, the
//! knowledge store) live outside this workspace; tests use in-process
//! doubles.
//!
//! Every call through these traits is a suspension point. Callers wrap
//! them in a timeout and must not hold any lock across the await.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Snapshot of a task plus the partial plan under evaluation.
///
/// This is what the decision maker hands to the evaluation collaborator
/// when scoring a candidate workflow state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    /// ID of the task the search is planning for
    pub task_id: String,

    /// The description being planned at this node
    pub description: String,

    /// Step descriptions committed on the path from the search root
    #[serde(default)]
    pub plan: Vec<String>,

    /// Decomposition depth of this node below the search root
    #[serde(default)]
    pub depth: usize,
}

/// Opaque scoring function used to value candidate workflow states.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Estimate the value of a candidate state, in [0, 1].
    async fn evaluate(&self, state: &WorkflowState) -> Result<f64>;
}

/// What a worker agent produced for one task step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// The agent's result content
    pub result: String,

    /// Quality signal in [-1, 1] if the worker reports one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_signal: Option<f64>,
}

/// A ranked passage returned by the knowledge retrieval collaborator.
/// The engine forwards passages unmodified and never parses `content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    pub content: String,
    pub score: f64,
}

/// Context handed to a worker agent along with the task description.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Knowledge retrieved for the task, passed through as-is
    #[serde(default)]
    pub passages: Vec<Passage>,
}

impl ExecutionContext {
    pub fn with_passages(passages: Vec<Passage>) -> Self {
        Self { passages }
    }
}

/// Executes one task step on a worker agent.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(
        &self,
        agent_id: &str,
        description: &str,
        context: &ExecutionContext,
    ) -> Result<ExecutionOutcome>;
}

/// Retrieval-augmented knowledge store.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Ranked passages for a query derived from a task description.
    async fn retrieve(&self, query: &str) -> Result<Vec<Passage>>;
}
