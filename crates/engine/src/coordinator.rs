//! The public entry point of the engine.
//!
//! The coordinator wires the five core components together and drives a
//! task end-to-end: submit, search for a workflow, route, execute each
//! step through the worker-agent collaborator, and record the outcome.
//! Worker execution and knowledge retrieval are suspension points with
//! caller-imposed timeouts; a timed-out step follows the ordinary
//! failure path rather than blocking the lifecycle.

use crate::analytics::{Analytics, AnalyticsSummary};
use crate::config::{EngineConfig, ExecutionConfig};
use crate::decision::DecisionMaker;
use crate::evolution::{CycleOutcome, SelfEvolvingSystem};
use crate::incentive::{AgentProfile, IncentiveModel};
use crate::router::{AgentRouter, PolicyCell, RoutingPolicy};
use crate::task_manager::{QueueStats, UnifiedTaskManager};
use conclave_common::{
    now_millis, AgentExecutor, Capability, EngineError, Evaluator, ExecutionContext,
    FailureKind, KnowledgeStore, Result, Task, TaskEvent, TaskStatus,
};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Read-only snapshot of the engine for operators.
#[derive(Debug, Clone, Serialize)]
pub struct Introspection {
    pub registered_agents: Vec<String>,
    pub tracked_tasks: usize,
    pub queue: QueueStats,
    pub policy: RoutingPolicy,
    pub exploration_constant: f64,
    pub evolution_cycles: u64,
    pub analytics: AnalyticsSummary,
}

pub struct Coordinator {
    manager: Arc<UnifiedTaskManager>,
    incentive: Arc<IncentiveModel>,
    decision: Arc<DecisionMaker>,
    policy: Arc<PolicyCell>,
    analytics: Arc<Analytics>,
    evolution: Arc<SelfEvolvingSystem>,
    executor: Arc<dyn AgentExecutor>,
    knowledge: Option<Arc<dyn KnowledgeStore>>,
    execution: ExecutionConfig,
    max_assign_attempts: u32,
    evolution_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Coordinator {
    /// Wire up the engine. The evolution loop is not started until
    /// [`Coordinator::start_evolution`] is called.
    pub fn new(
        config: EngineConfig,
        evaluator: Arc<dyn Evaluator>,
        executor: Arc<dyn AgentExecutor>,
        knowledge: Option<Arc<dyn KnowledgeStore>>,
    ) -> Self {
        info!("Initializing coordination engine");

        let incentive = Arc::new(IncentiveModel::new(config.incentive.clone()));
        let policy = Arc::new(PolicyCell::new(RoutingPolicy::uniform(
            config.router.exploration_rate,
        )));
        let router = Arc::new(AgentRouter::new(
            config.router.clone(),
            policy.clone(),
            incentive.clone(),
        ));
        let decision = Arc::new(DecisionMaker::new(
            config.decision.clone(),
            evaluator,
            router.clone(),
        ));
        let manager = Arc::new(UnifiedTaskManager::new(
            config.task_manager.clone(),
            decision.clone(),
            router,
            incentive.clone(),
        ));
        let analytics = Arc::new(Analytics::new());
        let evolution = Arc::new(SelfEvolvingSystem::new(
            config.evolution.clone(),
            policy.clone(),
            incentive.clone(),
            decision.clone(),
            analytics.clone(),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            manager,
            incentive,
            decision,
            policy,
            analytics,
            evolution,
            executor,
            knowledge,
            execution: config.execution,
            max_assign_attempts: config.task_manager.max_retries + 1,
            evolution_handle: parking_lot::Mutex::new(None),
            shutdown,
        }
    }

    /// Start the background evolution loop. Idempotent.
    pub fn start_evolution(&self) {
        let mut handle = self.evolution_handle.lock();
        if handle.is_some() {
            return;
        }
        *handle = Some(
            self.evolution
                .spawn(self.manager.subscribe(), self.shutdown.subscribe()),
        );
    }

    /// Stop the evolution loop and wait for it to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.evolution_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Coordination engine shut down");
    }

    // ------------------------------------------------------------------
    // Registration interface
    // ------------------------------------------------------------------

    pub fn register_agent(
        &self,
        agent_id: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) {
        self.incentive.register_agent(agent_id, capabilities);
        // A changed pool invalidates what repeated failures taught us.
        self.manager.reset_failure_counts();
    }

    pub fn deregister_agent(&self, agent_id: &str) -> bool {
        let removed = self.incentive.deregister_agent(agent_id);
        if removed {
            self.manager.reset_failure_counts();
        }
        removed
    }

    // ------------------------------------------------------------------
    // Task lifecycle
    // ------------------------------------------------------------------

    /// Accept a task without driving it; callers sequence the lifecycle
    /// themselves through the manager views.
    pub async fn submit(&self, task: Task) -> Result<Task> {
        self.manager.submit(task).await
    }

    /// Drive a task end-to-end and return its terminal state.
    pub async fn process(&self, task: Task) -> Result<Task> {
        let submitted = self.manager.submit(task).await?;
        self.drive(&submitted.id).await
    }

    /// Boxed because decomposed tasks drive their subgoals through the
    /// same path.
    fn drive<'a>(
        &'a self,
        task_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Task>> + Send + 'a>> {
        Box::pin(self.drive_inner(task_id))
    }

    async fn drive_inner(&self, task_id: &str) -> Result<Task> {
        let mut current_id = task_id.to_string();

        loop {
            self.assign_with_retry(&current_id).await?;
            self.manager.start(&current_id).await?;

            let snapshot = self
                .manager
                .get(&current_id)
                .await
                .ok_or_else(|| EngineError::TaskNotFound(current_id.clone()))?;

            if !snapshot.subgoals.is_empty() {
                return self.drive_subgoals(&current_id, &snapshot.subgoals).await;
            }

            let context = self.retrieve_context(&snapshot.description).await;
            let step_timeout = Duration::from_millis(self.execution.step_timeout_ms);
            let agent_id = snapshot
                .assigned_agent
                .clone()
                .unwrap_or_else(|| "unassigned".to_string());

            let execution = tokio::time::timeout(
                step_timeout,
                self.executor
                    .execute(&agent_id, &snapshot.description, &context),
            )
            .await;

            let (kind, error_info) = match execution {
                Ok(Ok(outcome)) => {
                    let task = self.manager.complete(&current_id, outcome).await?;
                    self.record_terminal(&task);
                    return Ok(task);
                }
                Ok(Err(e)) => (FailureKind::Execution, e.to_string()),
                Err(_) => (
                    FailureKind::Timeout,
                    format!("worker execution timed out after {}ms", step_timeout.as_millis()),
                ),
            };

            match self.manager.fail(&current_id, kind, &error_info).await? {
                Some(retry) => {
                    debug!(
                        task_id = %current_id,
                        retry_id = %retry.id,
                        "Continuing with retry task"
                    );
                    current_id = retry.id;
                }
                None => {
                    let task = self
                        .manager
                        .get(&current_id)
                        .await
                        .ok_or_else(|| EngineError::TaskNotFound(current_id.clone()))?;
                    self.record_terminal(&task);
                    return Ok(task);
                }
            }
        }
    }

    /// Drive each subgoal in order; the manager settles the parent when
    /// the last one reaches a terminal status.
    async fn drive_subgoals(&self, parent_id: &str, subgoals: &[String]) -> Result<Task> {
        for sub_id in subgoals {
            if let Err(e) = self.drive(sub_id).await {
                warn!(
                    parent_id = %parent_id,
                    subgoal_id = %sub_id,
                    error = %e,
                    "Subgoal could not be driven, failing parent"
                );
                self.manager
                    .fail(parent_id, FailureKind::Subgoal, &e.to_string())
                    .await?;
                break;
            }
        }

        let parent = self
            .manager
            .get(parent_id)
            .await
            .ok_or_else(|| EngineError::TaskNotFound(parent_id.to_string()))?;
        if parent.status.is_terminal() {
            self.record_terminal(&parent);
            Ok(parent)
        } else {
            // All subgoals were driven yet the parent did not settle; a
            // subgoal must have been swapped out underneath us.
            Err(EngineError::Execution(format!(
                "parent task {parent_id} did not settle after its subgoals"
            )))
        }
    }

    /// Assign with bounded retries for transient decision-maker outages.
    /// An unroutable task is removed before the error is surfaced so the
    /// caller never holds an id that can only rot in the queue.
    async fn assign_with_retry(&self, task_id: &str) -> Result<String> {
        let mut last_err = None;
        for attempt in 0..self.max_assign_attempts {
            match self.manager.assign(task_id).await {
                Ok(agent_id) => return Ok(agent_id),
                Err(e @ EngineError::DecisionMakerUnavailable(_)) => {
                    warn!(
                        task_id = %task_id,
                        attempt,
                        error = %e,
                        "Decision maker unavailable, retrying assignment"
                    );
                    last_err = Some(e);
                }
                Err(e @ EngineError::NoAgentAvailable { .. }) => {
                    // The router already retried once with relaxed
                    // capabilities; nothing further to try.
                    self.manager.cancel(task_id).await.ok();
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
        self.manager.cancel(task_id).await.ok();
        Err(last_err.unwrap_or_else(|| {
            EngineError::DecisionMakerUnavailable("assignment retries exhausted".into())
        }))
    }

    async fn retrieve_context(&self, description: &str) -> ExecutionContext {
        let Some(knowledge) = &self.knowledge else {
            return ExecutionContext::default();
        };

        let timeout = Duration::from_millis(self.execution.retrieval_timeout_ms);
        match tokio::time::timeout(timeout, knowledge.retrieve(description)).await {
            Ok(Ok(passages)) => ExecutionContext::with_passages(passages),
            Ok(Err(e)) => {
                warn!(error = %e, "Knowledge retrieval failed, continuing without context");
                ExecutionContext::default()
            }
            Err(_) => {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Knowledge retrieval timed out, continuing without context"
                );
                ExecutionContext::default()
            }
        }
    }

    fn record_terminal(&self, task: &Task) {
        let duration = now_millis().saturating_sub(task.created_at);
        self.analytics
            .record_task_completion(duration, task.status == TaskStatus::Completed);
    }

    // ------------------------------------------------------------------
    // Observable state
    // ------------------------------------------------------------------

    pub async fn task(&self, task_id: &str) -> Option<Task> {
        self.manager.get(task_id).await
    }

    pub async fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.manager.status(task_id).await
    }

    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        self.manager.cancel(task_id).await
    }

    pub fn policy_snapshot(&self) -> Arc<RoutingPolicy> {
        self.policy.load()
    }

    pub fn incentive_score(&self, agent_id: &str) -> Option<f64> {
        self.incentive.incentive_score(agent_id)
    }

    pub fn agent_profile(&self, agent_id: &str) -> Option<AgentProfile> {
        self.incentive.profile(agent_id)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TaskEvent> {
        self.manager.subscribe()
    }

    /// Trigger an evolution cycle immediately instead of waiting for the
    /// background cadence.
    pub fn evolve_now(&self) -> CycleOutcome {
        self.evolution.run_cycle()
    }

    pub async fn introspect(&self) -> Introspection {
        Introspection {
            registered_agents: self.incentive.agent_ids(),
            tracked_tasks: self.manager.task_count().await,
            queue: self.manager.queue_stats(),
            policy: (*self.policy.load()).clone(),
            exploration_constant: self.decision.exploration_constant(),
            evolution_cycles: self.evolution.cycles_completed(),
            analytics: self.analytics.summary(),
        }
    }
}
