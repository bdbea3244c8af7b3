//! Task types for the coordination engine.

use crate::capability::Capability;
use serde::{Deserialize, Serialize};

/// Priority level for tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl TaskPriority {
    /// Priorities from highest to lowest, the order queues are drained in.
    pub const DESCENDING: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];
}

/// Current status of a task.
///
/// The only legal edges are Pending -> Assigned -> InProgress and then
/// InProgress -> Completed or InProgress -> Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Assigned)
                | (TaskStatus::Assigned, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
        )
    }
}

/// Why a task attempt failed.
///
/// `Cancelled` is terminal immediately; the other kinds are subject to the
/// task manager's bounded retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker agent returned an error.
    Execution,
    /// A collaborator call exceeded its timeout.
    Timeout,
    /// The caller cancelled the task while it was in progress.
    Cancelled,
    /// The decision maker could not produce a usable workflow.
    NoDecision,
    /// A subgoal failed terminally; the subgoal already exhausted its own
    /// retries, so the parent does not get another round.
    Subgoal,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Cancelled | FailureKind::Subgoal)
    }

    /// Whether the attempt reflects on the assigned agent's performance.
    /// Cancellations and subgoal cascades are not the agent's doing.
    pub fn is_agent_fault(&self) -> bool {
        matches!(
            self,
            FailureKind::Execution | FailureKind::Timeout | FailureKind::NoDecision
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::Execution => "execution",
            FailureKind::Timeout => "timeout",
            FailureKind::Cancelled => "cancelled",
            FailureKind::NoDecision => "no_decision",
            FailureKind::Subgoal => "subgoal_failed",
        }
    }
}

/// A unit of work tracked through the lifecycle state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID
    pub id: String,

    /// Human-readable task description
    pub description: String,

    /// Task priority
    pub priority: TaskPriority,

    /// Current status
    pub status: TaskStatus,

    /// Capabilities an agent must declare to be routable for this task
    #[serde(default)]
    pub required_capabilities: Vec<Capability>,

    /// Assigned agent (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,

    /// Parent task ID (for subgoal decomposition)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task: Option<String>,

    /// Ordered IDs of subgoal tasks created by decomposition
    #[serde(default)]
    pub subgoals: Vec<String>,

    /// Deadline (Unix millis); tasks without one are not time-bound
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline: Option<u64>,

    /// Final result once the task completes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    /// Zero-based attempt counter; bumped each time a failed task is
    /// resubmitted by the retry policy
    #[serde(default)]
    pub attempt: u32,

    /// Creation timestamp (Unix millis)
    pub created_at: u64,

    /// Last update timestamp (Unix millis)
    pub updated_at: u64,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        let now = now_millis();

        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            description: description.into(),
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            required_capabilities: Vec::new(),
            assigned_agent: None,
            parent_task: None,
            subgoals: Vec::new(),
            deadline: None,
            result: None,
            attempt: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.required_capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn with_deadline(mut self, deadline: u64) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_task = Some(parent_id.into());
        self
    }

    /// Milliseconds of slack until the deadline, measured from `now`.
    /// Returns zero for an already-passed deadline, None without one.
    pub fn deadline_slack(&self, now: u64) -> Option<u64> {
        self.deadline.map(|d| d.saturating_sub(now))
    }

    pub fn touch(&mut self) {
        self.updated_at = now_millis();
    }
}

/// Emitted on every lifecycle transition. `old_state` is `None` for the
/// transition that creates the task in `Pending`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub old_state: Option<TaskStatus>,
    pub new_state: TaskStatus,
    pub timestamp: u64,
}

impl TaskEvent {
    pub fn new(
        task_id: impl Into<String>,
        old_state: Option<TaskStatus>,
        new_state: TaskStatus,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            old_state,
            new_state,
            timestamp: now_millis(),
        }
    }
}

pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_creation() {
        let task = Task::new("Test task");

        assert!(task.id.starts_with("task_"));
        assert_eq!(task.description, "Test task");
        assert_eq!(task.priority, TaskPriority::Normal);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_agent.is_none());
        assert!(task.parent_task.is_none());
        assert!(task.subgoals.is_empty());
        assert_eq!(task.attempt, 0);
        assert!(task.created_at > 0);
    }

    #[test]
    fn test_task_builder_methods() {
        let task = Task::new("Summarize the quarterly report")
            .with_priority(TaskPriority::Critical)
            .with_capabilities([Capability::Summarization, Capability::Analysis])
            .with_deadline(1_999_999_999_999);

        assert_eq!(task.priority, TaskPriority::Critical);
        assert_eq!(
            task.required_capabilities,
            vec![Capability::Summarization, Capability::Analysis]
        );
        assert_eq!(task.deadline, Some(1_999_999_999_999));
    }

    #[test]
    fn test_task_priority_ordering() {
        assert!(TaskPriority::Critical > TaskPriority::High);
        assert!(TaskPriority::High > TaskPriority::Normal);
        assert!(TaskPriority::Normal > TaskPriority::Low);
    }

    #[test]
    fn test_task_unique_ids() {
        let task1 = Task::new("Task 1");
        let task2 = Task::new("Task 2");

        assert_ne!(task1.id, task2.id);
    }

    #[test]
    fn test_legal_transitions_only() {
        use TaskStatus::*;

        let all = [Pending, Assigned, InProgress, Completed, Failed];
        let legal = [
            (Pending, Assigned),
            (Assigned, InProgress),
            (InProgress, Completed),
            (InProgress, Failed),
        ];

        for from in all {
            for to in all {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "edge {:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Assigned.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_deadline_slack() {
        let task = Task::new("time-bound").with_deadline(10_000);
        assert_eq!(task.deadline_slack(4_000), Some(6_000));
        assert_eq!(task.deadline_slack(12_000), Some(0));
        assert_eq!(Task::new("open-ended").deadline_slack(4_000), None);
    }

    #[test]
    fn test_task_serialization() {
        let task = Task::new("Serialization test")
            .with_priority(TaskPriority::High)
            .with_capabilities([Capability::Research]);

        let json = serde_json::to_string(&task).unwrap();
        let deserialized: Task = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.description, task.description);
        assert_eq!(deserialized.priority, task.priority);
        assert_eq!(
            deserialized.required_capabilities,
            task.required_capabilities
        );
    }

    #[test]
    fn test_failure_kind_retry() {
        assert!(FailureKind::Execution.is_retryable());
        assert!(FailureKind::Timeout.is_retryable());
        assert!(FailureKind::NoDecision.is_retryable());
        assert!(!FailureKind::Cancelled.is_retryable());
        assert!(!FailureKind::Subgoal.is_retryable());
    }

    #[test]
    fn test_failure_kind_agent_fault() {
        assert!(FailureKind::Execution.is_agent_fault());
        assert!(FailureKind::Timeout.is_agent_fault());
        assert!(!FailureKind::Cancelled.is_agent_fault());
        assert!(!FailureKind::Subgoal.is_agent_fault());
    }
}
