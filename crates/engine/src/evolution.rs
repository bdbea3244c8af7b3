//! The periodic policy-update loop.
//!
//! On each trigger the system snapshots the current routing policy and
//! the incentive ledger entries accumulated since the last successful
//! cycle, computes smoothed per-capability preference weights, retunes
//! the decision maker's exploration constant inversely to recent
//! success, and swaps the new policy in atomically. A failed computation
//! rolls back to the previous snapshot; coordination never stops on a
//! bad cycle.
//!
//! At most one cycle runs at a time. A trigger that fires while a cycle
//! is in flight is skipped, not queued.

use crate::analytics::Analytics;
use crate::config::EvolutionConfig;
use crate::decision::DecisionMaker;
use crate::incentive::{IncentiveModel, IncentiveRecord};
use crate::router::{PolicyCell, RoutingPolicy};
use conclave_common::{Capability, EngineError, Result, TaskEvent, TaskStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What one trigger did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// New policy swapped in.
    Updated,
    /// Another cycle was already in flight; this trigger was dropped.
    Skipped,
    /// No ledger entries since the last cycle; nothing to learn from.
    NoData,
    /// The update computation failed; the previous policy was retained.
    RolledBack,
}

pub struct SelfEvolvingSystem {
    config: EvolutionConfig,
    policy: Arc<PolicyCell>,
    incentive: Arc<IncentiveModel>,
    decision: Arc<DecisionMaker>,
    analytics: Arc<Analytics>,
    cycle_running: AtomicBool,
    /// Ledger index of the first record the next cycle consumes; only
    /// advanced when a cycle succeeds, so a failed cycle re-reads the
    /// same records
    cursor: parking_lot::Mutex<usize>,
    cycles_completed: AtomicU64,
}

impl SelfEvolvingSystem {
    pub fn new(
        config: EvolutionConfig,
        policy: Arc<PolicyCell>,
        incentive: Arc<IncentiveModel>,
        decision: Arc<DecisionMaker>,
        analytics: Arc<Analytics>,
    ) -> Self {
        Self {
            config,
            policy,
            incentive,
            decision,
            analytics,
            cycle_running: AtomicBool::new(false),
            cursor: parking_lot::Mutex::new(0),
            cycles_completed: AtomicU64::new(0),
        }
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    /// Run one update cycle now.
    pub fn run_cycle(&self) -> CycleOutcome {
        if self
            .cycle_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Evolution cycle already in flight, skipping trigger");
            return CycleOutcome::Skipped;
        }

        let outcome = match self.cycle_inner() {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(error = %e, "Evolution cycle failed, retaining previous policy");
                CycleOutcome::RolledBack
            }
        };
        self.cycle_running.store(false, Ordering::Release);
        outcome
    }

    fn cycle_inner(&self) -> Result<CycleOutcome> {
        let snapshot = self.policy.load();
        let start_cursor = *self.cursor.lock();
        let (records, next_cursor) = self.incentive.records_from(start_cursor);

        if records.is_empty() {
            debug!("No new incentive records since last cycle");
            return Ok(CycleOutcome::NoData);
        }

        let updated = self.compute_policy(&snapshot, &records)?;
        let exploration = self.compute_exploration(&records)?;

        // Swap order matters for observers: the policy is replaced in one
        // atomic store, then the search constant follows. In-flight
        // routing decisions keep the snapshot they already loaded.
        self.policy.store(updated);
        self.decision.set_exploration_constant(exploration);
        *self.cursor.lock() = next_cursor;
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);

        let summary = self.analytics.summary();
        info!(
            records = records.len(),
            exploration_constant = exploration,
            tasks_completed = summary.tasks_completed,
            tasks_failed = summary.tasks_failed,
            success_rate = summary.success_rate,
            avg_duration_ms = summary.avg_duration_ms,
            "Evolution cycle applied"
        );
        Ok(CycleOutcome::Updated)
    }

    /// Per-capability average adjusted score, smoothed against the
    /// previous weight and clamped to the configured band.
    fn compute_policy(
        &self,
        snapshot: &RoutingPolicy,
        records: &[IncentiveRecord],
    ) -> Result<RoutingPolicy> {
        let lr = self.config.learning_rate;
        if !lr.is_finite() {
            return Err(EngineError::Evolution("non-finite learning rate".into()));
        }

        let mut sums: HashMap<Capability, (f64, usize)> = HashMap::new();
        for record in records {
            // An agent deregistered since the record was written no
            // longer contributes to tag statistics.
            let Some(capabilities) = self.incentive.capabilities_of(&record.agent_id) else {
                continue;
            };
            for cap in capabilities {
                let slot = sums.entry(cap).or_insert((0.0, 0));
                slot.0 += record.adjusted_score;
                slot.1 += 1;
            }
        }

        let mut preference_weights = HashMap::with_capacity(Capability::ALL.len());
        for cap in Capability::ALL {
            let old = snapshot.weight(cap);
            let new = match sums.get(&cap) {
                Some((sum, n)) => {
                    let avg = sum / *n as f64;
                    self.analytics
                        .record_metric(format!("capability_{:?}_score", cap), avg);
                    old + lr * (avg - old)
                }
                None => old,
            };
            let clamped = new.clamp(self.config.min_weight, self.config.max_weight);
            if !clamped.is_finite() {
                return Err(EngineError::Evolution(format!(
                    "non-finite weight computed for {cap:?}"
                )));
            }
            preference_weights.insert(cap, clamped);
        }

        Ok(RoutingPolicy {
            preference_weights,
            exploration_rate: snapshot.exploration_rate,
        })
    }

    /// More exploration when recent outcomes are poor: the constant runs
    /// from `max_exploration` at total failure down to `min_exploration`
    /// at total success.
    fn compute_exploration(&self, records: &[IncentiveRecord]) -> Result<f64> {
        let avg =
            records.iter().map(|r| r.adjusted_score).sum::<f64>() / records.len() as f64;
        let success = ((avg + 1.0) / 2.0).clamp(0.0, 1.0);
        let c = self.config.max_exploration
            - (self.config.max_exploration - self.config.min_exploration) * success;
        if !c.is_finite() {
            return Err(EngineError::Evolution(
                "non-finite exploration constant computed".into(),
            ));
        }
        self.analytics.record_metric("recent_adjusted_score", avg);
        Ok(c)
    }

    /// Run the background trigger loop: a cycle every
    /// `trigger_interval_secs`, or sooner once `trigger_task_count`
    /// completions arrive, whichever happens first.
    pub fn spawn(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<TaskEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let period = Duration::from_secs(this.config.trigger_interval_secs.max(1));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick of a tokio interval fires immediately.
            interval.tick().await;

            let mut completed_since = 0u64;
            info!(
                period_secs = period.as_secs(),
                task_trigger = this.config.trigger_task_count,
                "Evolution loop started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        this.run_cycle();
                        completed_since = 0;
                    }
                    event = events.recv() => match event {
                        Ok(event) => {
                            if event.new_state == TaskStatus::Completed {
                                completed_since += 1;
                                if completed_since >= this.config.trigger_task_count {
                                    this.run_cycle();
                                    completed_since = 0;
                                    interval.reset();
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Evolution loop lagged behind the event stream");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Evolution loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecisionConfig, IncentiveConfig, RouterConfig};
    use crate::incentive::TaskShape;
    use crate::router::AgentRouter;
    use async_trait::async_trait;
    use conclave_common::{Evaluator, WorkflowState};

    struct NeutralEvaluator;

    #[async_trait]
    impl Evaluator for NeutralEvaluator {
        async fn evaluate(&self, _state: &WorkflowState) -> conclave_common::Result<f64> {
            Ok(0.5)
        }
    }

    fn system_with(config: EvolutionConfig) -> (SelfEvolvingSystem, Arc<IncentiveModel>, Arc<PolicyCell>) {
        let incentive = Arc::new(IncentiveModel::new(IncentiveConfig::default()));
        let policy = Arc::new(PolicyCell::new(RoutingPolicy::uniform(0.1)));
        let router = Arc::new(AgentRouter::new(
            RouterConfig {
                exploration_rate: 0.1,
                jitter_seed: Some(5),
            },
            policy.clone(),
            incentive.clone(),
        ));
        let decision = Arc::new(DecisionMaker::new(
            DecisionConfig::default(),
            Arc::new(NeutralEvaluator),
            router,
        ));
        let system = SelfEvolvingSystem::new(
            config,
            policy.clone(),
            incentive.clone(),
            decision,
            Arc::new(Analytics::new()),
        );
        (system, incentive, policy)
    }

    #[test]
    fn test_no_data_cycle() {
        let (system, _incentive, policy) = system_with(EvolutionConfig::default());
        let before = policy.load();

        assert_eq!(system.run_cycle(), CycleOutcome::NoData);
        let after = policy.load();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_weights_move_toward_recent_average() {
        let (system, incentive, policy) = system_with(EvolutionConfig::default());
        incentive.register_agent("agent-a", [Capability::Research]);
        for i in 0..5 {
            incentive
                .record_outcome(
                    "agent-a",
                    &format!("task_{i}"),
                    -1.0,
                    TaskShape::default(),
                    false,
                )
                .unwrap();
        }

        assert_eq!(system.run_cycle(), CycleOutcome::Updated);
        let updated = policy.load();
        // avg adjusted = -1.0, old weight 1.0, lr 0.1 => 0.8
        assert!((updated.weight(Capability::Research) - 0.8).abs() < 1e-9);
        // Tags nobody produced records for keep their old weight.
        assert!((updated.weight(Capability::Coding) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_weights_clamped_to_band() {
        let config = EvolutionConfig {
            learning_rate: 10.0,
            min_weight: 0.5,
            max_weight: 1.5,
            ..Default::default()
        };
        let (system, incentive, policy) = system_with(config);
        incentive.register_agent("agent-a", [Capability::Research]);
        incentive
            .record_outcome("agent-a", "task_0", -1.0, TaskShape::default(), false)
            .unwrap();

        assert_eq!(system.run_cycle(), CycleOutcome::Updated);
        assert!((policy.load().weight(Capability::Research) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_exploration_rises_when_outcomes_poor() {
        let (system, incentive, _policy) = system_with(EvolutionConfig::default());
        incentive.register_agent("agent-a", [Capability::Research]);
        incentive
            .record_outcome("agent-a", "task_0", -1.0, TaskShape::default(), false)
            .unwrap();

        assert_eq!(system.run_cycle(), CycleOutcome::Updated);
        let c = system.decision.exploration_constant();
        assert!((c - system.config.max_exploration).abs() < 1e-6);
    }

    #[test]
    fn test_exploration_falls_when_outcomes_good() {
        let (system, incentive, _policy) = system_with(EvolutionConfig::default());
        incentive.register_agent("agent-a", [Capability::Research]);
        incentive
            .record_outcome("agent-a", "task_0", 1.0, TaskShape::default(), false)
            .unwrap();

        assert_eq!(system.run_cycle(), CycleOutcome::Updated);
        let c = system.decision.exploration_constant();
        assert!((c - system.config.min_exploration).abs() < 1e-6);
    }

    #[test]
    fn test_failed_cycle_rolls_back() {
        let config = EvolutionConfig {
            learning_rate: f64::NAN,
            ..Default::default()
        };
        let (system, incentive, policy) = system_with(config);
        incentive.register_agent("agent-a", [Capability::Research]);
        incentive
            .record_outcome("agent-a", "task_0", 0.5, TaskShape::default(), false)
            .unwrap();

        let before = policy.load();
        assert_eq!(system.run_cycle(), CycleOutcome::RolledBack);
        let after = policy.load();

        // Exactly the pre-cycle snapshot, not a partial update.
        assert!(Arc::ptr_eq(&before, &after));
        // The failed cycle did not consume the records; a later cycle
        // (with a sane config) would still see them.
        assert_eq!(*system.cursor.lock(), 0);
    }

    #[test]
    fn test_overlapping_trigger_skipped() {
        let (system, _incentive, _policy) = system_with(EvolutionConfig::default());
        system.cycle_running.store(true, Ordering::Release);
        assert_eq!(system.run_cycle(), CycleOutcome::Skipped);
        system.cycle_running.store(false, Ordering::Release);
    }

    #[test]
    fn test_cursor_advances_on_success() {
        let (system, incentive, _policy) = system_with(EvolutionConfig::default());
        incentive.register_agent("agent-a", [Capability::Research]);
        incentive
            .record_outcome("agent-a", "task_0", 0.5, TaskShape::default(), false)
            .unwrap();

        assert_eq!(system.run_cycle(), CycleOutcome::Updated);
        // Same records are not consumed twice.
        assert_eq!(system.run_cycle(), CycleOutcome::NoData);
        assert_eq!(system.cycles_completed(), 1);
    }

    #[tokio::test]
    async fn test_spawned_loop_triggers_on_completions() {
        let config = EvolutionConfig {
            trigger_task_count: 2,
            trigger_interval_secs: 3600,
            ..Default::default()
        };
        let (system, incentive, policy) = system_with(config);
        incentive.register_agent("agent-a", [Capability::Research]);
        for i in 0..3 {
            incentive
                .record_outcome(
                    "agent-a",
                    &format!("task_{i}"),
                    -1.0,
                    TaskShape::default(),
                    false,
                )
                .unwrap();
        }

        let system = Arc::new(system);
        let (event_tx, event_rx) = broadcast::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = system.spawn(event_rx, shutdown_rx);

        for i in 0..2 {
            event_tx
                .send(TaskEvent::new(
                    format!("task_{i}"),
                    Some(TaskStatus::InProgress),
                    TaskStatus::Completed,
                ))
                .unwrap();
        }

        // Give the loop a moment to consume both events and cycle.
        for _ in 0..50 {
            if system.cycles_completed() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(system.cycles_completed(), 1);
        assert!((policy.load().weight(Capability::Research) - 0.8).abs() < 1e-9);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
