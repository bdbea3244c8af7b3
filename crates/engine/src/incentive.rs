//! Performance scoring and the agent registry.
//!
//! The incentive model owns every `AgentProfile` and the append-only
//! ledger of `IncentiveRecord`s. Scores are always recomputed from the
//! full retained history, never kept as a running sum, so replaying the
//! same history produces the same score.

use crate::config::IncentiveConfig;
use conclave_common::{Capability, EngineError, Result, Task};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// One scored outcome, appended to the ledger and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncentiveRecord {
    pub agent_id: String,
    pub task_id: String,
    pub raw_score: f64,
    pub adjusted_score: f64,
    /// Set when the outcome's quality signal came from a timed-out or
    /// otherwise degraded evaluation
    pub low_confidence: bool,
    pub timestamp: u64,
}

/// One history entry inside an agent profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub task_id: String,
    pub score: f64,
    pub timestamp: u64,
}

/// Per-agent incentive state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: String,
    pub capabilities: Vec<Capability>,
    pub incentive_score: f64,
    pub performance_history: VecDeque<PerformanceSample>,
}

impl AgentProfile {
    fn new(agent_id: String, capabilities: Vec<Capability>) -> Self {
        Self {
            agent_id,
            capabilities,
            incentive_score: 0.0,
            performance_history: VecDeque::new(),
        }
    }
}

/// Routing view of one agent: id, declared tags, current score.
#[derive(Debug, Clone)]
pub struct AgentCandidate {
    pub agent_id: String,
    pub capabilities: Vec<Capability>,
    pub incentive_score: f64,
}

/// The task attributes that feed the complexity factor.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskShape {
    pub subgoal_count: usize,
    pub deadline_slack_ms: Option<u64>,
}

impl TaskShape {
    pub fn of(task: &Task, now: u64) -> Self {
        Self {
            subgoal_count: task.subgoals.len(),
            deadline_slack_ms: task.deadline_slack(now),
        }
    }
}

/// Rewards harder work more: grows with subgoal count and shrinks with
/// deadline slack. Always >= 1 for a plain task with no deadline.
pub fn complexity_factor(shape: TaskShape) -> f64 {
    const HOUR_MS: f64 = 3_600_000.0;

    let subgoal_term = 1.0 + 0.2 * shape.subgoal_count as f64;
    let deadline_term = match shape.deadline_slack_ms {
        Some(slack) => 1.0 + HOUR_MS / (slack as f64 + HOUR_MS),
        None => 1.0,
    };
    subgoal_term * deadline_term
}

/// Exponentially weighted moving average over the full history, oldest
/// sample first. Each new sample keeps `decay` of the previous score, so
/// stale performance fades instead of accumulating.
pub fn recompute_score(history: &VecDeque<PerformanceSample>, decay: f64) -> f64 {
    let mut score = 0.0;
    let mut seeded = false;
    for sample in history {
        if seeded {
            score = decay * score + (1.0 - decay) * sample.score;
        } else {
            score = sample.score;
            seeded = true;
        }
    }
    score
}

pub struct IncentiveModel {
    config: IncentiveConfig,
    agents: RwLock<HashMap<String, Arc<Mutex<AgentProfile>>>>,
    records: Mutex<Vec<IncentiveRecord>>,
}

impl IncentiveModel {
    pub fn new(config: IncentiveConfig) -> Self {
        Self {
            config,
            agents: RwLock::new(HashMap::new()),
            records: Mutex::new(Vec::new()),
        }
    }

    /// Register an agent, or update its declared capabilities if it is
    /// already known. An existing performance history is retained.
    pub fn register_agent(
        &self,
        agent_id: impl Into<String>,
        capabilities: impl IntoIterator<Item = Capability>,
    ) {
        let agent_id = agent_id.into();
        let capabilities: Vec<Capability> = capabilities.into_iter().collect();
        let mut agents = self.agents.write();

        match agents.get(&agent_id) {
            Some(existing) => {
                existing.lock().capabilities = capabilities;
                debug!(agent_id = %agent_id, "Updated agent capabilities");
            }
            None => {
                info!(agent_id = %agent_id, capabilities = ?capabilities, "Registered agent");
                agents.insert(
                    agent_id.clone(),
                    Arc::new(Mutex::new(AgentProfile::new(agent_id, capabilities))),
                );
            }
        }
    }

    pub fn deregister_agent(&self, agent_id: &str) -> bool {
        let removed = self.agents.write().remove(agent_id).is_some();
        if removed {
            info!(agent_id = %agent_id, "Deregistered agent");
        }
        removed
    }

    /// Score a completed (or failed) task outcome for an agent.
    ///
    /// `raw_score` must be finite; it is clamped to [-1, 1], adjusted by
    /// the complexity factor, appended to the ledger, and folded into the
    /// agent's recomputed incentive score.
    pub fn record_outcome(
        &self,
        agent_id: &str,
        task_id: &str,
        raw_score: f64,
        shape: TaskShape,
        low_confidence: bool,
    ) -> Result<IncentiveRecord> {
        if !raw_score.is_finite() {
            return Err(EngineError::InvalidTask(format!(
                "non-finite raw score for task {task_id}"
            )));
        }

        let profile = self
            .agents
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| EngineError::AgentNotFound(agent_id.to_string()))?;

        let raw_score = raw_score.clamp(-1.0, 1.0);
        let adjusted_score = raw_score * complexity_factor(shape);
        let record = IncentiveRecord {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            raw_score,
            adjusted_score,
            low_confidence,
            timestamp: conclave_common::now_millis(),
        };

        {
            let mut profile = profile.lock();
            profile.performance_history.push_back(PerformanceSample {
                task_id: task_id.to_string(),
                score: adjusted_score,
                timestamp: record.timestamp,
            });
            while profile.performance_history.len() > self.config.history_limit {
                profile.performance_history.pop_front();
            }
            profile.incentive_score =
                recompute_score(&profile.performance_history, self.config.decay);

            debug!(
                agent_id = %agent_id,
                task_id = %task_id,
                adjusted_score,
                incentive_score = profile.incentive_score,
                low_confidence,
                "Recorded outcome"
            );
        }

        self.records.lock().push(record.clone());
        Ok(record)
    }

    pub fn incentive_score(&self, agent_id: &str) -> Option<f64> {
        self.agents
            .read()
            .get(agent_id)
            .map(|p| p.lock().incentive_score)
    }

    pub fn profile(&self, agent_id: &str) -> Option<AgentProfile> {
        self.agents.read().get(agent_id).map(|p| p.lock().clone())
    }

    pub fn capabilities_of(&self, agent_id: &str) -> Option<Vec<Capability>> {
        self.agents
            .read()
            .get(agent_id)
            .map(|p| p.lock().capabilities.clone())
    }

    pub fn agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn agent_count(&self) -> usize {
        self.agents.read().len()
    }

    /// Agents whose declared tags intersect `required`, sorted by id so
    /// callers iterate deterministically. Agents with no intersection are
    /// excluded entirely.
    pub fn candidates_matching(&self, required: &[Capability]) -> Vec<AgentCandidate> {
        let agents = self.agents.read();
        let mut candidates: Vec<AgentCandidate> = agents
            .values()
            .filter_map(|p| {
                let profile = p.lock();
                let intersects = profile
                    .capabilities
                    .iter()
                    .any(|cap| required.contains(cap));
                intersects.then(|| AgentCandidate {
                    agent_id: profile.agent_id.clone(),
                    capabilities: profile.capabilities.clone(),
                    incentive_score: profile.incentive_score,
                })
            })
            .collect();
        candidates.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        candidates
    }

    /// Ledger entries from `cursor` onward, with the cursor to resume at.
    pub fn records_from(&self, cursor: usize) -> (Vec<IncentiveRecord>, usize) {
        let records = self.records.lock();
        let slice = records.get(cursor..).unwrap_or(&[]).to_vec();
        (slice, records.len())
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    /// Most recent ledger entry for an agent, if any.
    pub fn last_record_for(&self, agent_id: &str) -> Option<IncentiveRecord> {
        self.records
            .lock()
            .iter()
            .rev()
            .find(|r| r.agent_id == agent_id)
            .cloned()
    }
}
