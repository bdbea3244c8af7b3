//! Common types and traits shared across Conclave crates.
//!
//! This crate provides the vocabulary the coordination engine and its
//! collaborators use to communicate: the task model, capability tags,
//! the error taxonomy, and the collaborator contracts.

pub mod capability;
pub mod error;
pub mod task;
pub mod traits;

pub use capability::Capability;
pub use error::{EngineError, Result};
pub use task::{now_millis, FailureKind, Task, TaskEvent, TaskPriority, TaskStatus};
pub use traits::{
    AgentExecutor, Evaluator, ExecutionContext, ExecutionOutcome, KnowledgeStore, Passage,
    WorkflowState,
};
