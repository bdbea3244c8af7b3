//! Configuration for the engine components.
//!
//! Each component receives only its own section at construction; there is
//! no shared configuration object threaded through the system.

use serde::{Deserialize, Serialize};

/// Top-level configuration, one section per component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub task_manager: TaskManagerConfig,

    #[serde(default)]
    pub decision: DecisionConfig,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub incentive: IncentiveConfig,

    #[serde(default)]
    pub evolution: EvolutionConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file. Missing sections and fields
    /// fall back to their defaults.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskManagerConfig {
    /// Times a failed task is resubmitted before surfacing as terminal
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// How long terminal tasks stay queryable before being pruned
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,

    /// Repeats of one failure kind before the retry hint escalates to
    /// change-approach
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: u32,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retention_ms() -> u64 {
    3_600_000
}

fn default_escalation_threshold() -> u32 {
    3
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retention_ms: default_retention_ms(),
            escalation_threshold: default_escalation_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// MCTS iterations per search episode
    #[serde(default = "default_iteration_budget")]
    pub iteration_budget: u32,

    /// UCB exploration constant `c`; tuned at runtime by the evolution loop
    #[serde(default = "default_exploration_constant")]
    pub exploration_constant: f64,

    /// Largest decomposition width proposed (candidates split into 2..=K)
    #[serde(default = "default_max_subgoals")]
    pub max_subgoals: usize,

    /// Deepest nesting of decompositions below the search root
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Timeout for one evaluation-collaborator call
    #[serde(default = "default_evaluation_timeout_ms")]
    pub evaluation_timeout_ms: u64,
}

fn default_iteration_budget() -> u32 {
    100
}

fn default_exploration_constant() -> f64 {
    std::f64::consts::SQRT_2
}

fn default_max_subgoals() -> usize {
    4
}

fn default_max_depth() -> usize {
    2
}

fn default_evaluation_timeout_ms() -> u64 {
    5_000
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            iteration_budget: default_iteration_budget(),
            exploration_constant: default_exploration_constant(),
            max_subgoals: default_max_subgoals(),
            max_depth: default_max_depth(),
            evaluation_timeout_ms: default_evaluation_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Weight of the random jitter term in routing scores
    #[serde(default = "default_exploration_rate")]
    pub exploration_rate: f64,

    /// Seed for the jitter RNG; tests inject one for determinism
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_seed: Option<u64>,
}

fn default_exploration_rate() -> f64 {
    0.1
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            exploration_rate: default_exploration_rate(),
            jitter_seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncentiveConfig {
    /// EWMA decay: how much of the previous score each new sample keeps
    #[serde(default = "default_decay")]
    pub decay: f64,

    /// Samples retained per agent; older ones fall off the front
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_decay() -> f64 {
    0.9
}

fn default_history_limit() -> usize {
    100
}

impl Default for IncentiveConfig {
    fn default() -> Self {
        Self {
            decay: default_decay(),
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionConfig {
    /// Completed tasks between cycles (whichever trigger fires first wins)
    #[serde(default = "default_trigger_task_count")]
    pub trigger_task_count: u64,

    /// Wall-clock seconds between cycles
    #[serde(default = "default_trigger_interval_secs")]
    pub trigger_interval_secs: u64,

    /// Smoothing rate applied when folding fresh averages into weights
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,

    /// Lower bound for preference weights
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,

    /// Upper bound for preference weights, prevents preference collapse
    /// onto a single agent
    #[serde(default = "default_max_weight")]
    pub max_weight: f64,

    /// Bounds for the decision maker's exploration constant
    #[serde(default = "default_min_exploration")]
    pub min_exploration: f64,

    #[serde(default = "default_max_exploration")]
    pub max_exploration: f64,
}

fn default_trigger_task_count() -> u64 {
    25
}

fn default_trigger_interval_secs() -> u64 {
    300
}

fn default_learning_rate() -> f64 {
    0.1
}

fn default_min_weight() -> f64 {
    0.1
}

fn default_max_weight() -> f64 {
    5.0
}

fn default_min_exploration() -> f64 {
    0.5
}

fn default_max_exploration() -> f64 {
    3.0
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            trigger_task_count: default_trigger_task_count(),
            trigger_interval_secs: default_trigger_interval_secs(),
            learning_rate: default_learning_rate(),
            min_weight: default_min_weight(),
            max_weight: default_max_weight(),
            min_exploration: default_min_exploration(),
            max_exploration: default_max_exploration(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Timeout for one worker-agent execution call
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,

    /// Timeout for one knowledge-retrieval call
    #[serde(default = "default_retrieval_timeout_ms")]
    pub retrieval_timeout_ms: u64,
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

fn default_retrieval_timeout_ms() -> u64 {
    10_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: default_step_timeout_ms(),
            retrieval_timeout_ms: default_retrieval_timeout_ms(),
        }
    }
}
