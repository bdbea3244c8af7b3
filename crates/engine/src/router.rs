//! Preference-based agent selection.
//!
//! The router scores each candidate agent as
//! `incentive_score * weight_match + exploration_rate * jitter` and picks
//! the maximum. Agents whose declared tags do not intersect the task's
//! required tags are excluded before scoring; irrelevant capability is
//! never rewarded.

use crate::config::RouterConfig;
use crate::incentive::IncentiveModel;
use conclave_common::{Capability, EngineError, Result};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// The preference weighting consumed by the router.
///
/// Policies are immutable snapshots: the evolution loop builds a new one
/// and swaps it in whole. Readers hold an `Arc` to whichever snapshot was
/// current when they looked, so an in-flight routing decision is never
/// affected by a concurrent update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub preference_weights: HashMap<Capability, f64>,
    pub exploration_rate: f64,
}

impl RoutingPolicy {
    /// Uniform weights over the whole capability set.
    pub fn uniform(exploration_rate: f64) -> Self {
        Self {
            preference_weights: Capability::ALL.iter().map(|&c| (c, 1.0)).collect(),
            exploration_rate,
        }
    }

    pub fn weight(&self, capability: Capability) -> f64 {
        self.preference_weights
            .get(&capability)
            .copied()
            .unwrap_or(0.0)
    }
}

/// Single-writer, many-reader holder for the current policy snapshot.
pub struct PolicyCell {
    inner: RwLock<Arc<RoutingPolicy>>,
}

impl PolicyCell {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self {
            inner: RwLock::new(Arc::new(policy)),
        }
    }

    /// The current snapshot. Cheap: clones the Arc, not the policy.
    pub fn load(&self) -> Arc<RoutingPolicy> {
        self.inner.read().clone()
    }

    /// Atomically replace the snapshot.
    pub fn store(&self, policy: RoutingPolicy) {
        *self.inner.write() = Arc::new(policy);
    }
}

/// A routing decision: which agent, at what score, under which
/// (possibly relaxed) requirement set.
#[derive(Debug, Clone)]
pub struct RouteSelection {
    pub agent_id: String,
    pub score: f64,
    /// The tags actually used for matching; differs from the task's tags
    /// only when relaxation dropped one
    pub matched_against: Vec<Capability>,
    pub relaxed: bool,
}

pub struct AgentRouter {
    config: RouterConfig,
    policy: Arc<PolicyCell>,
    incentive: Arc<IncentiveModel>,
    rng: Mutex<StdRng>,
}

impl AgentRouter {
    pub fn new(config: RouterConfig, policy: Arc<PolicyCell>, incentive: Arc<IncentiveModel>) -> Self {
        let rng = match config.jitter_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            policy,
            incentive,
            rng: Mutex::new(rng),
        }
    }

    /// Number of registered agents that could serve `required`.
    pub fn candidate_count(&self, required: &[Capability]) -> usize {
        self.incentive.candidates_matching(required).len()
    }

    /// Select the best agent for the required tags.
    pub fn route(&self, required: &[Capability]) -> Result<RouteSelection> {
        self.route_against(required, false)
    }

    /// Select with one capability-relaxation step allowed: when no agent
    /// matches the full set, the lowest-weighted tag is dropped and the
    /// match is retried once. `extra_relaxation` widens the drop to two
    /// tags, used after repeated failures of the same kind.
    pub fn route_relaxed(
        &self,
        required: &[Capability],
        extra_relaxation: bool,
    ) -> Result<RouteSelection> {
        match self.route_against(required, false) {
            Ok(selection) => Ok(selection),
            Err(EngineError::NoAgentAvailable { .. }) => {
                let drop_count = if extra_relaxation { 2 } else { 1 };
                let relaxed = self.relax(required, drop_count);
                if relaxed.is_empty() {
                    return Err(EngineError::NoAgentAvailable {
                        required: required.to_vec(),
                    });
                }
                warn!(
                    required = ?required,
                    relaxed = ?relaxed,
                    "No exact capability match, retrying with relaxed requirements"
                );
                self.route_against(&relaxed, true)
            }
            Err(e) => Err(e),
        }
    }

    fn route_against(&self, required: &[Capability], relaxed: bool) -> Result<RouteSelection> {
        if required.is_empty() {
            return Err(EngineError::NoAgentAvailable { required: vec![] });
        }

        let candidates = self.incentive.candidates_matching(required);
        if candidates.is_empty() {
            return Err(EngineError::NoAgentAvailable {
                required: required.to_vec(),
            });
        }

        let policy = self.policy.load();
        let mut best: Option<RouteSelection> = None;

        // Candidates arrive sorted by id, so jitter draws line up with
        // agents deterministically under a fixed seed.
        let mut rng = self.rng.lock();
        for candidate in candidates {
            let weight_match: f64 = candidate
                .capabilities
                .iter()
                .filter(|cap| required.contains(cap))
                .map(|&cap| policy.weight(cap))
                .sum();
            let jitter: f64 = rng.gen();
            let score =
                candidate.incentive_score * weight_match + policy.exploration_rate * jitter;

            let better = match &best {
                Some(current) => score > current.score,
                None => true,
            };
            if better {
                best = Some(RouteSelection {
                    agent_id: candidate.agent_id,
                    score,
                    matched_against: required.to_vec(),
                    relaxed,
                });
            }
        }

        let selection = best.ok_or_else(|| EngineError::NoAgentAvailable {
            required: required.to_vec(),
        })?;
        debug!(
            agent_id = %selection.agent_id,
            score = selection.score,
            relaxed,
            "Routed task"
        );
        Ok(selection)
    }

    /// Drop the `drop_count` lowest-weighted required tags under the
    /// current policy, keeping at least one.
    fn relax(&self, required: &[Capability], drop_count: usize) -> Vec<Capability> {
        if required.len() <= 1 {
            return Vec::new();
        }
        let policy = self.policy.load();
        let mut ranked: Vec<Capability> = required.to_vec();
        ranked.sort_by(|a, b| {
            policy
                .weight(*a)
                .partial_cmp(&policy.weight(*b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let keep = required.len().saturating_sub(drop_count).max(1);
        let mut kept: Vec<Capability> = ranked.into_iter().rev().take(keep).collect();
        // Preserve the caller's original tag order
        kept.sort_by_key(|cap| required.iter().position(|r| r == cap));
        kept
    }

    pub fn exploration_rate(&self) -> f64 {
        self.config.exploration_rate
    }
}
