//! Error types for the Conclave engine.

use crate::capability::Capability;
use crate::task::TaskStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Bad input from the caller; never retried.
    #[error("Invalid task: {0}")]
    InvalidTask(String),

    /// Programming or race defect; surfaced, never retried.
    #[error("Invalid state transition for task {task_id}: {from:?} -> {to:?}")]
    InvalidStateTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// No registered agent's capabilities intersect the task's.
    #[error("No agent available for capabilities {required:?}")]
    NoAgentAvailable { required: Vec<Capability> },

    /// The search finished without a single successful evaluation.
    #[error("Decision maker produced no usable result: {0}")]
    DecisionMakerUnavailable(String),

    #[error("Task {0} not found")]
    TaskNotFound(String),

    #[error("Agent {0} not registered")]
    AgentNotFound(String),

    #[error("Task {0} was cancelled")]
    Cancelled(String),

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// A worker agent or collaborator reported a failure.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A policy-update cycle failed; always recovered locally.
    #[error("Policy evolution error: {0}")]
    Evolution(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        EngineError::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
