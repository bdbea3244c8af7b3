//! Coordination and self-evolution engine.
//!
//! The engine tracks tasks through a lifecycle state machine, chooses
//! workflows with a Monte Carlo tree search, routes steps to worker
//! agents by incentive-weighted capability match, and periodically
//! re-learns its own routing policy from accumulated outcomes.
//!
//! # Architecture
//!
//! ```text
//! Task Request
//!      │
//!      ▼
//! ┌──────────────────┐
//! │   Coordinator    │  public entry point
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐   consults   ┌───────────────┐
//! │ UnifiedTaskMgr   │─────────────▶│ DecisionMaker │ (MCTS)
//! │  (lifecycle)     │              └───────┬───────┘
//! └────────┬─────────┘                      │
//!          │ routes via                     ▼
//!          ▼                        evaluation collaborator
//! ┌──────────────────┐
//! │   AgentRouter    │◀── RoutingPolicy snapshots
//! └────────┬─────────┘
//!          │ scores from
//!          ▼
//! ┌──────────────────┐   feeds   ┌────────────────────┐
//! │  IncentiveModel  │──────────▶│ SelfEvolvingSystem │
//! └──────────────────┘           │  (background loop) │
//!                                └─────────┬──────────┘
//!                                          │ swaps in new
//!                                          ▼
//!                                   RoutingPolicy
//! ```
//!
//! Model inference, worker-agent execution, and knowledge retrieval are
//! collaborator traits defined in `conclave-common`; the engine never
//! implements them.

pub mod analytics;
pub mod config;
pub mod coordinator;
pub mod decision;
pub mod evolution;
pub mod incentive;
pub mod router;
pub mod task_manager;

pub use analytics::{Analytics, AnalyticsSummary, MetricSummary};
pub use config::{
    DecisionConfig, EngineConfig, EvolutionConfig, ExecutionConfig, IncentiveConfig,
    RouterConfig, TaskManagerConfig,
};
pub use coordinator::{Coordinator, Introspection};
pub use decision::{Decision, DecisionMaker, WorkflowPlan};
pub use evolution::{CycleOutcome, SelfEvolvingSystem};
pub use incentive::{AgentProfile, IncentiveModel, IncentiveRecord, TaskShape};
pub use router::{AgentRouter, PolicyCell, RouteSelection, RoutingPolicy};
pub use task_manager::{QueueStats, UnifiedTaskManager};
