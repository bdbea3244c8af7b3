//! Task lifecycle management.
//!
//! The task manager owns every `Task` and is the only component that
//! mutates one. Transitions are serialized per task id through a
//! per-entry mutex, and no lock is held across a call into the decision
//! maker or router. Every transition emits a `TaskEvent` on a broadcast
//! channel; the evolution loop and analytics consume the stream.
//!
//! Pending tasks wait in priority-ordered queues drained highest first.
//! Failed attempts are retried by resubmitting a fresh task with the
//! same description, up to a configured bound, before the failure is
//! surfaced as terminal.

use crate::config::TaskManagerConfig;
use crate::decision::{DecisionMaker, WorkflowPlan};
use crate::incentive::{IncentiveModel, TaskShape};
use crate::router::AgentRouter;
use conclave_common::{
    now_millis, EngineError, ExecutionOutcome, FailureKind, Result, Task, TaskEvent, TaskPriority,
    TaskStatus,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Ancestor chains deeper than this indicate a parent-link cycle.
const MAX_ANCESTRY: usize = 16;

/// Counts of queued tasks per priority plus how many left the queue.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total: usize,
    pub total_processed: u64,
}

#[derive(Default)]
struct PendingQueues {
    queues: HashMap<TaskPriority, VecDeque<String>>,
    processed: u64,
}

impl PendingQueues {
    fn enqueue(&mut self, priority: TaskPriority, task_id: String) {
        self.queues.entry(priority).or_default().push_back(task_id);
    }

    /// Pop the next id, highest priority first.
    fn pop_next(&mut self) -> Option<String> {
        for priority in TaskPriority::DESCENDING {
            if let Some(queue) = self.queues.get_mut(&priority) {
                if let Some(id) = queue.pop_front() {
                    self.processed += 1;
                    return Some(id);
                }
            }
        }
        None
    }

    fn remove(&mut self, task_id: &str) -> bool {
        for queue in self.queues.values_mut() {
            if let Some(pos) = queue.iter().position(|id| id == task_id) {
                queue.remove(pos);
                self.processed += 1;
                return true;
            }
        }
        false
    }

    /// Drop an id without counting it as processed (cancellation path).
    fn discard(&mut self, task_id: &str) {
        for queue in self.queues.values_mut() {
            if let Some(pos) = queue.iter().position(|id| id == task_id) {
                queue.remove(pos);
                return;
            }
        }
    }

    fn count(&self, priority: TaskPriority) -> usize {
        self.queues.get(&priority).map_or(0, |q| q.len())
    }

    fn stats(&self) -> QueueStats {
        let critical = self.count(TaskPriority::Critical);
        let high = self.count(TaskPriority::High);
        let normal = self.count(TaskPriority::Normal);
        let low = self.count(TaskPriority::Low);
        QueueStats {
            critical,
            high,
            normal,
            low,
            total: critical + high + normal + low,
            total_processed: self.processed,
        }
    }
}

pub struct UnifiedTaskManager {
    config: TaskManagerConfig,
    decision: Arc<DecisionMaker>,
    router: Arc<AgentRouter>,
    incentive: Arc<IncentiveModel>,
    tasks: RwLock<HashMap<String, Arc<Mutex<Task>>>>,
    pending: parking_lot::Mutex<PendingQueues>,
    /// Failure counts per kind; repeats past the threshold escalate the
    /// retry hint from plain retry to change-approach
    failure_counts: parking_lot::Mutex<HashMap<&'static str, u32>>,
    events: broadcast::Sender<TaskEvent>,
    completed: AtomicU64,
}

impl UnifiedTaskManager {
    pub fn new(
        config: TaskManagerConfig,
        decision: Arc<DecisionMaker>,
        router: Arc<AgentRouter>,
        incentive: Arc<IncentiveModel>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            decision,
            router,
            incentive,
            tasks: RwLock::new(HashMap::new()),
            pending: parking_lot::Mutex::new(PendingQueues::default()),
            failure_counts: parking_lot::Mutex::new(HashMap::new()),
            events,
            completed: AtomicU64::new(0),
        }
    }

    /// Subscribe to the lifecycle event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Accept a new task into the system in `Pending`.
    pub async fn submit(&self, mut task: Task) -> Result<Task> {
        if task.description.trim().is_empty() {
            return Err(EngineError::InvalidTask("empty description".into()));
        }

        task.status = TaskStatus::Pending;
        task.assigned_agent = None;
        task.result = None;

        self.prune_expired().await;

        let snapshot = task.clone();
        {
            let mut tasks = self.tasks.write().await;
            tasks.insert(task.id.clone(), Arc::new(Mutex::new(task)));
        }
        self.pending
            .lock()
            .enqueue(snapshot.priority, snapshot.id.clone());

        info!(
            task_id = %snapshot.id,
            priority = ?snapshot.priority,
            attempt = snapshot.attempt,
            "Task submitted"
        );
        self.emit(&snapshot.id, None, TaskStatus::Pending);
        Ok(snapshot)
    }

    /// Choose a workflow and an agent for a pending task.
    ///
    /// The decision maker may decompose the task, in which case each
    /// subgoal becomes its own pending task linked through `parent_task`.
    /// The task itself moves to `Assigned` with the selected agent.
    pub async fn assign(&self, task_id: &str) -> Result<String> {
        let entry = self.entry(task_id).await?;

        let snapshot = {
            let task = entry.lock().await;
            if task.status != TaskStatus::Pending {
                return Err(EngineError::InvalidStateTransition {
                    task_id: task_id.to_string(),
                    from: task.status,
                    to: TaskStatus::Assigned,
                });
            }
            task.clone()
        };

        // Both calls below suspend; no task lock may be held here.
        let depth = self.ancestor_depth(snapshot.parent_task.clone()).await;
        let decision = self.decision.plan(&snapshot, depth).await?;

        // Route before materializing any subgoals so an unroutable task
        // leaves nothing orphaned behind.
        let escalated = self.escalated(FailureKind::Execution.label())
            || self.escalated(FailureKind::Timeout.label());
        let selection = match self
            .router
            .route_relaxed(&snapshot.required_capabilities, escalated)
        {
            Ok(selection) => selection,
            Err(e) => {
                self.count_failure("no_agent");
                return Err(e);
            }
        };

        let subgoal_ids = match &decision.plan {
            WorkflowPlan::Direct => Vec::new(),
            WorkflowPlan::Decompose { subgoals } => {
                let mut ids = Vec::with_capacity(subgoals.len());
                for description in subgoals {
                    let mut subtask = Task::new(description.clone())
                        .with_parent(task_id.to_string())
                        .with_priority(snapshot.priority)
                        .with_capabilities(snapshot.required_capabilities.iter().copied());
                    subtask.deadline = snapshot.deadline;
                    let submitted = self.submit(subtask).await?;
                    ids.push(submitted.id);
                }
                ids
            }
        };

        let mut task = entry.lock().await;
        if task.status != TaskStatus::Pending {
            // Another worker raced us past Pending while we searched.
            return Err(EngineError::InvalidStateTransition {
                task_id: task_id.to_string(),
                from: task.status,
                to: TaskStatus::Assigned,
            });
        }
        task.assigned_agent = Some(selection.agent_id.clone());
        task.subgoals = subgoal_ids;
        task.status = TaskStatus::Assigned;
        task.touch();
        drop(task);

        self.pending.lock().remove(task_id);
        self.emit(task_id, Some(TaskStatus::Pending), TaskStatus::Assigned);
        info!(
            task_id = %task_id,
            agent_id = %selection.agent_id,
            relaxed = selection.relaxed,
            decision_visits = decision.visits,
            "Task assigned"
        );
        Ok(selection.agent_id)
    }

    /// Move an assigned task into `InProgress`.
    pub async fn start(&self, task_id: &str) -> Result<()> {
        let entry = self.entry(task_id).await?;
        {
            let mut task = entry.lock().await;
            self.transition(&mut task, TaskStatus::InProgress)?;
        }
        self.emit(task_id, Some(TaskStatus::Assigned), TaskStatus::InProgress);
        Ok(())
    }

    /// Record a successful outcome and move the task to `Completed`.
    ///
    /// When the task has a parent and every sibling is terminal, the
    /// parent is completed (or failed) in turn, recursively up the chain.
    pub async fn complete(&self, task_id: &str, outcome: ExecutionOutcome) -> Result<Task> {
        let entry = self.entry(task_id).await?;
        let snapshot = {
            let mut task = entry.lock().await;
            self.transition(&mut task, TaskStatus::Completed)?;
            task.result = Some(outcome.result.clone());
            task.clone()
        };
        self.emit(task_id, Some(TaskStatus::InProgress), TaskStatus::Completed);
        self.completed.fetch_add(1, Ordering::Relaxed);

        if let Some(agent_id) = &snapshot.assigned_agent {
            // A worker that reports no quality signal gets full marks at
            // low confidence; the self-report is clamped otherwise.
            let raw = outcome.quality_signal.unwrap_or(1.0);
            let low_confidence = outcome.quality_signal.is_none();
            let shape = TaskShape::of(&snapshot, now_millis());
            if let Err(e) =
                self.incentive
                    .record_outcome(agent_id, task_id, raw, shape, low_confidence)
            {
                warn!(task_id = %task_id, error = %e, "Failed to record completion outcome");
            }
        }

        if let Some(parent_id) = snapshot.parent_task.clone() {
            self.settle_ancestors(parent_id).await?;
        }

        Ok(snapshot)
    }

    /// Record a failed attempt.
    ///
    /// Retryable kinds are resubmitted as a fresh task (same description,
    /// bumped attempt) until the retry bound is exhausted; the fresh task
    /// replaces the failed one in its parent's subgoal list. Returns the
    /// retry task when one was scheduled.
    pub async fn fail(
        &self,
        task_id: &str,
        kind: FailureKind,
        error_info: &str,
    ) -> Result<Option<Task>> {
        let entry = self.entry(task_id).await?;
        let snapshot = {
            let mut task = entry.lock().await;
            self.transition(&mut task, TaskStatus::Failed)?;
            task.clone()
        };
        self.emit(task_id, Some(TaskStatus::InProgress), TaskStatus::Failed);
        self.count_failure(kind.label());

        warn!(
            task_id = %task_id,
            kind = kind.label(),
            attempt = snapshot.attempt,
            error = %error_info,
            "Task attempt failed"
        );

        if kind.is_agent_fault() {
            if let Some(agent_id) = &snapshot.assigned_agent {
                let shape = TaskShape::of(&snapshot, now_millis());
                if let Err(e) = self.incentive.record_outcome(
                    agent_id,
                    task_id,
                    -1.0,
                    shape,
                    kind == FailureKind::Timeout,
                ) {
                    warn!(task_id = %task_id, error = %e, "Failed to record failure outcome");
                }
            }
        }

        if kind.is_retryable() && snapshot.attempt < self.config.max_retries {
            let mut retry = Task::new(snapshot.description.clone())
                .with_priority(snapshot.priority)
                .with_capabilities(snapshot.required_capabilities.iter().copied());
            retry.deadline = snapshot.deadline;
            retry.parent_task = snapshot.parent_task.clone();
            retry.attempt = snapshot.attempt + 1;

            let retry = self.submit(retry).await?;
            if let Some(parent_id) = &snapshot.parent_task {
                self.replace_subgoal(parent_id, task_id, &retry.id).await;
            }
            info!(
                task_id = %task_id,
                retry_id = %retry.id,
                attempt = retry.attempt,
                "Scheduled retry"
            );
            return Ok(Some(retry));
        }

        if let Some(parent_id) = snapshot.parent_task.clone() {
            self.settle_ancestors(parent_id).await?;
        }
        Ok(None)
    }

    /// Cancel a task.
    ///
    /// Pending and assigned tasks are removed outright with no incentive
    /// record. An in-progress task becomes `Failed` with the cancelled
    /// kind, which is never retried.
    pub async fn cancel(&self, task_id: &str) -> Result<()> {
        let entry = self.entry(task_id).await?;
        let status = { entry.lock().await.status };

        match status {
            TaskStatus::Pending | TaskStatus::Assigned => {
                self.tasks.write().await.remove(task_id);
                self.pending.lock().discard(task_id);
                info!(task_id = %task_id, from = ?status, "Task cancelled and removed");
                Ok(())
            }
            TaskStatus::InProgress => {
                self.fail(task_id, FailureKind::Cancelled, "cancelled by caller")
                    .await?;
                Ok(())
            }
            terminal => Err(EngineError::InvalidStateTransition {
                task_id: task_id.to_string(),
                from: terminal,
                to: TaskStatus::Failed,
            }),
        }
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        let entry = self.tasks.read().await.get(task_id).cloned()?;
        let task = entry.lock().await;
        Some(task.clone())
    }

    pub async fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.get(task_id).await.map(|t| t.status)
    }

    /// Pop the next pending task, highest priority first. Ids whose task
    /// has left `Pending` in the meantime are skipped.
    pub async fn next_pending(&self) -> Option<Task> {
        loop {
            let id = self.pending.lock().pop_next()?;
            if let Some(task) = self.get(&id).await {
                if task.status == TaskStatus::Pending {
                    return Some(task);
                }
            }
        }
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.pending.lock().stats()
    }

    pub fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.read().await.len()
    }

    fn count_failure(&self, label: &'static str) {
        *self.failure_counts.lock().entry(label).or_insert(0) += 1;
    }

    /// Whether one failure kind has repeated past the escalation
    /// threshold, switching the hint from retry to change-approach.
    pub fn escalated(&self, label: &str) -> bool {
        self.failure_counts
            .lock()
            .get(label)
            .is_some_and(|&n| n > self.config.escalation_threshold)
    }

    /// Clear escalation counters, e.g. after the agent pool changed.
    pub fn reset_failure_counts(&self) {
        self.failure_counts.lock().clear();
    }

    async fn entry(&self, task_id: &str) -> Result<Arc<Mutex<Task>>> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    /// Apply a transition under the entry lock, enforcing the legal edges.
    fn transition(&self, task: &mut Task, to: TaskStatus) -> Result<TaskStatus> {
        let from = task.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidStateTransition {
                task_id: task.id.clone(),
                from,
                to,
            });
        }
        task.status = to;
        task.touch();
        Ok(from)
    }

    fn emit(&self, task_id: &str, old: Option<TaskStatus>, new: TaskStatus) {
        // A send only fails when nobody subscribes, which is fine.
        let _ = self.events.send(TaskEvent::new(task_id, old, new));
    }

    async fn ancestor_depth(&self, mut parent: Option<String>) -> usize {
        let mut depth = 0;
        while let Some(parent_id) = parent {
            depth += 1;
            if depth >= MAX_ANCESTRY {
                warn!(parent_id = %parent_id, "Ancestor chain too deep, treating as cycle");
                break;
            }
            parent = match self.tasks.read().await.get(&parent_id).cloned() {
                Some(entry) => entry.lock().await.parent_task.clone(),
                None => None,
            };
        }
        depth
    }

    async fn replace_subgoal(&self, parent_id: &str, old_id: &str, new_id: &str) {
        if let Some(entry) = self.tasks.read().await.get(parent_id).cloned() {
            let mut parent = entry.lock().await;
            if let Some(slot) = parent.subgoals.iter_mut().find(|id| *id == old_id) {
                *slot = new_id.to_string();
            }
        }
    }

    /// Walk up the parent chain settling any parent whose subgoals have
    /// all reached a terminal status: completed when every subgoal
    /// completed, failed as soon as one subgoal is terminally failed.
    ///
    /// Boxed because settling can fail a parent, and `fail` settles the
    /// next ancestor in turn.
    fn settle_ancestors<'a>(
        &'a self,
        first_parent: String,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.settle_ancestors_inner(first_parent))
    }

    async fn settle_ancestors_inner(&self, first_parent: String) -> Result<()> {
        let mut current = Some(first_parent);
        let mut hops = 0;

        while let Some(parent_id) = current.take() {
            hops += 1;
            if hops >= MAX_ANCESTRY {
                break;
            }

            let entry = match self.tasks.read().await.get(&parent_id).cloned() {
                Some(entry) => entry,
                None => break,
            };

            let (subgoal_ids, parent_status) = {
                let parent = entry.lock().await;
                (parent.subgoals.clone(), parent.status)
            };
            if subgoal_ids.is_empty() || parent_status.is_terminal() {
                break;
            }

            let mut results = Vec::with_capacity(subgoal_ids.len());
            let mut all_terminal = true;
            let mut any_failed = false;
            for id in &subgoal_ids {
                match self.get(id).await {
                    Some(sub) => {
                        if !sub.status.is_terminal() {
                            all_terminal = false;
                            break;
                        }
                        if sub.status == TaskStatus::Failed {
                            any_failed = true;
                        } else if let Some(result) = sub.result {
                            results.push(result);
                        }
                    }
                    None => {
                        // A cancelled-and-removed subgoal no longer gates
                        // its parent.
                        any_failed = true;
                    }
                }
            }
            if !all_terminal {
                break;
            }

            // Parents sit in Assigned while their subgoals run; walk the
            // legal edges rather than jumping states.
            let grandparent = {
                let parent = entry.lock().await;
                parent.parent_task.clone()
            };
            if parent_status == TaskStatus::Assigned {
                self.start(&parent_id).await?;
            }

            if any_failed {
                debug!(parent_id = %parent_id, "Subgoal terminally failed, failing parent");
                self.fail(&parent_id, FailureKind::Subgoal, "subgoal failed terminally")
                    .await?;
                // fail() settles the grandparent itself when terminal.
                break;
            }

            let combined = results.join("\n\n");
            let entry_snapshot = {
                let mut parent = entry.lock().await;
                self.transition(&mut parent, TaskStatus::Completed)?;
                parent.result = Some(combined);
                parent.clone()
            };
            self.emit(&parent_id, Some(TaskStatus::InProgress), TaskStatus::Completed);
            self.completed.fetch_add(1, Ordering::Relaxed);
            debug!(parent_id = %parent_id, "All subgoals completed, parent completed");

            if let Some(agent_id) = &entry_snapshot.assigned_agent {
                let shape = TaskShape::of(&entry_snapshot, now_millis());
                if let Err(e) = self
                    .incentive
                    .record_outcome(agent_id, &parent_id, 1.0, shape, true)
                {
                    warn!(parent_id = %parent_id, error = %e, "Failed to record parent outcome");
                }
            }

            current = grandparent;
        }
        Ok(())
    }

    /// Drop terminal tasks whose retention window has passed. Runs
    /// opportunistically on submission; there is no dedicated sweeper.
    async fn prune_expired(&self) {
        let cutoff = now_millis().saturating_sub(self.config.retention_ms);
        let mut expired = Vec::new();
        {
            let tasks = self.tasks.read().await;
            for (id, entry) in tasks.iter() {
                if let Ok(task) = entry.try_lock() {
                    if task.status.is_terminal() && task.updated_at < cutoff {
                        expired.push(id.clone());
                    }
                }
            }
        }
        if expired.is_empty() {
            return;
        }
        let mut tasks = self.tasks.write().await;
        for id in &expired {
            tasks.remove(id);
        }
        debug!(count = expired.len(), "Pruned archived tasks");
    }
}
