//! Integration tests driving the engine end-to-end with in-process
//! collaborator doubles. No model inference, workers, or stores are
//! involved, so these run anywhere.

use async_trait::async_trait;
use conclave_common::{
    now_millis, AgentExecutor, Capability, EngineError, Evaluator, ExecutionContext,
    ExecutionOutcome, FailureKind, KnowledgeStore, Passage, Task, TaskStatus, WorkflowState,
};
use conclave_engine::{
    Coordinator, CycleOutcome, DecisionConfig, DecisionMaker, EngineConfig, EvolutionConfig,
    ExecutionConfig, IncentiveModel, PolicyCell, RouterConfig, RoutingPolicy, TaskManagerConfig,
    TaskShape, UnifiedTaskManager,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Collaborator doubles
// ============================================================================

/// Scores single-step plans higher or lower than decompositions.
struct ScriptedEvaluator {
    direct_value: f64,
    decomposed_value: f64,
}

impl ScriptedEvaluator {
    fn favors_direct() -> Self {
        Self {
            direct_value: 0.9,
            decomposed_value: 0.2,
        }
    }

    fn favors_decomposition() -> Self {
        Self {
            direct_value: 0.2,
            decomposed_value: 0.9,
        }
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    async fn evaluate(&self, state: &WorkflowState) -> conclave_common::Result<f64> {
        Ok(if state.plan.len() > 1 {
            self.decomposed_value
        } else {
            self.direct_value
        })
    }
}

struct BrokenEvaluator;

#[async_trait]
impl Evaluator for BrokenEvaluator {
    async fn evaluate(&self, _state: &WorkflowState) -> conclave_common::Result<f64> {
        Err(EngineError::Execution("evaluation backend offline".into()))
    }
}

enum ExecutorScript {
    Succeed { quality: Option<f64> },
    AlwaysTimeout,
}

struct ScriptedExecutor {
    script: ExecutorScript,
    calls: AtomicUsize,
    agents_seen: Mutex<Vec<String>>,
    contexts_seen: Mutex<Vec<usize>>,
}

impl ScriptedExecutor {
    fn new(script: ExecutorScript) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            agents_seen: Mutex::new(Vec::new()),
            contexts_seen: Mutex::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        agent_id: &str,
        description: &str,
        context: &ExecutionContext,
    ) -> conclave_common::Result<ExecutionOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.agents_seen.lock().push(agent_id.to_string());
        self.contexts_seen.lock().push(context.passages.len());

        match &self.script {
            ExecutorScript::Succeed { quality } => Ok(ExecutionOutcome {
                result: format!("done: {description}"),
                quality_signal: *quality,
            }),
            ExecutorScript::AlwaysTimeout => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(ExecutionOutcome {
                    result: "too late".into(),
                    quality_signal: None,
                })
            }
        }
    }
}

struct StaticKnowledge;

#[async_trait]
impl KnowledgeStore for StaticKnowledge {
    async fn retrieve(&self, query: &str) -> conclave_common::Result<Vec<Passage>> {
        Ok(vec![Passage {
            content: format!("background on: {query}"),
            score: 0.7,
        }])
    }
}

// ============================================================================
// Harness
// ============================================================================

fn fast_config() -> EngineConfig {
    EngineConfig {
        decision: DecisionConfig {
            iteration_budget: 30,
            evaluation_timeout_ms: 1_000,
            ..Default::default()
        },
        router: RouterConfig {
            exploration_rate: 0.05,
            jitter_seed: Some(17),
        },
        execution: ExecutionConfig {
            step_timeout_ms: 50,
            retrieval_timeout_ms: 50,
        },
        ..Default::default()
    }
}

fn coordinator_with(
    config: EngineConfig,
    evaluator: Arc<dyn Evaluator>,
    executor: Arc<ScriptedExecutor>,
) -> Coordinator {
    Coordinator::new(config, evaluator, executor, Some(Arc::new(StaticKnowledge)))
}

/// Direct manager stack for tests that sequence transitions by hand.
fn manager_stack(
    evaluator: Arc<dyn Evaluator>,
) -> (Arc<UnifiedTaskManager>, Arc<IncentiveModel>) {
    let incentive = Arc::new(IncentiveModel::new(Default::default()));
    let policy = Arc::new(PolicyCell::new(RoutingPolicy::uniform(0.05)));
    let router = Arc::new(conclave_engine::AgentRouter::new(
        RouterConfig {
            exploration_rate: 0.05,
            jitter_seed: Some(23),
        },
        policy,
        incentive.clone(),
    ));
    let decision = Arc::new(DecisionMaker::new(
        DecisionConfig {
            iteration_budget: 20,
            ..Default::default()
        },
        evaluator,
        router.clone(),
    ));
    let manager = Arc::new(UnifiedTaskManager::new(
        TaskManagerConfig::default(),
        decision,
        router,
        incentive.clone(),
    ));
    (manager, incentive)
}

fn summarize_task() -> Task {
    Task::new("summarize X")
        .with_capabilities([Capability::Summarization])
        .with_deadline(now_millis() + 3_600_000)
}

// ============================================================================
// Assignment scenarios
// ============================================================================

#[tokio::test]
async fn test_assign_selects_matching_agent() {
    let (manager, incentive) = manager_stack(Arc::new(ScriptedEvaluator::favors_direct()));
    incentive.register_agent("agent-a", [Capability::Summarization]);
    incentive
        .record_outcome("agent-a", "warmup", 0.8, TaskShape::default(), false)
        .unwrap();

    let task = manager.submit(summarize_task()).await.unwrap();
    let agent = manager.assign(&task.id).await.unwrap();

    assert_eq!(agent, "agent-a");
    assert_eq!(manager.status(&task.id).await, Some(TaskStatus::Assigned));
    assert_eq!(
        manager.get(&task.id).await.unwrap().assigned_agent.as_deref(),
        Some("agent-a")
    );
}

#[tokio::test]
async fn test_assign_fails_without_matching_capability() {
    let (manager, incentive) = manager_stack(Arc::new(ScriptedEvaluator::favors_direct()));
    incentive.register_agent("coder", [Capability::Coding]);

    let task = manager.submit(summarize_task()).await.unwrap();
    let err = manager.assign(&task.id).await.unwrap_err();
    assert!(matches!(err, EngineError::NoAgentAvailable { .. }));
}

#[tokio::test]
async fn test_router_only_selects_intersecting_agents() {
    let (manager, incentive) = manager_stack(Arc::new(ScriptedEvaluator::favors_direct()));
    incentive.register_agent("researcher", [Capability::Research, Capability::Analysis]);
    incentive.register_agent("writer", [Capability::Writing]);
    incentive.register_agent("coder", [Capability::Coding, Capability::Debugging]);

    let cases: [(&[Capability], &[&str]); 3] = [
        (&[Capability::Research], &["researcher"]),
        (&[Capability::Writing, Capability::Analysis], &["researcher", "writer"]),
        (&[Capability::Debugging], &["coder"]),
    ];

    for (required, allowed) in cases {
        for _ in 0..10 {
            let task = manager
                .submit(Task::new("check routing").with_capabilities(required.iter().copied()))
                .await
                .unwrap();
            let agent = manager.assign(&task.id).await.unwrap();
            assert!(
                allowed.contains(&agent.as_str()),
                "agent {agent} routed for {required:?}"
            );
        }
    }
}

// ============================================================================
// End-to-end processing
// ============================================================================

#[tokio::test]
async fn test_process_end_to_end_success() {
    let executor = Arc::new(ScriptedExecutor::new(ExecutorScript::Succeed {
        quality: Some(0.8),
    }));
    let coordinator = coordinator_with(
        fast_config(),
        Arc::new(ScriptedEvaluator::favors_direct()),
        executor.clone(),
    );
    coordinator.register_agent("agent-a", [Capability::Summarization]);

    let task = coordinator.process(summarize_task()).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.result.unwrap().starts_with("done:"));
    assert_eq!(executor.call_count(), 1);
    // Retrieved knowledge was passed through to the worker.
    assert_eq!(executor.contexts_seen.lock().as_slice(), &[1]);
    // The outcome fed the incentive model.
    assert!(coordinator.incentive_score("agent-a").unwrap() > 0.0);
}

#[tokio::test]
async fn test_process_decomposes_and_completes_parent() {
    let executor = Arc::new(ScriptedExecutor::new(ExecutorScript::Succeed {
        quality: Some(0.9),
    }));
    let mut config = fast_config();
    // One level of decomposition keeps the executor call count equal to
    // the parent's subgoal count.
    config.decision.max_depth = 1;
    let coordinator = coordinator_with(
        config,
        Arc::new(ScriptedEvaluator::favors_decomposition()),
        executor.clone(),
    );
    coordinator.register_agent("agent-a", [Capability::Research]);
    coordinator.register_agent("agent-b", [Capability::Research]);

    let task = coordinator
        .process(Task::new("survey distributed consensus papers").with_capabilities([Capability::Research]))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert!(!task.subgoals.is_empty(), "expected a decomposition");
    // One execution per subgoal, none for the parent itself.
    assert_eq!(executor.call_count(), task.subgoals.len());

    for sub_id in &task.subgoals {
        let sub = coordinator.task(sub_id).await.unwrap();
        assert_eq!(sub.status, TaskStatus::Completed);
        assert_eq!(sub.parent_task.as_deref(), Some(task.id.as_str()));
    }
    // The parent aggregated its subgoal results.
    assert!(task.result.unwrap().contains("done:"));
}

#[tokio::test]
async fn test_worker_timeouts_exhaust_retries() {
    let executor = Arc::new(ScriptedExecutor::new(ExecutorScript::AlwaysTimeout));
    let coordinator = coordinator_with(
        fast_config(),
        Arc::new(ScriptedEvaluator::favors_direct()),
        executor.clone(),
    );
    coordinator.register_agent("agent-a", [Capability::Summarization]);

    let task = coordinator.process(summarize_task()).await.unwrap();

    // Initial attempt + 3 retries, then terminal failure with no fifth try.
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(executor.call_count(), 4);
    assert_eq!(task.attempt, 3);
    assert!(executor.agents_seen.lock().iter().all(|a| a == "agent-a"));

    // The last attempting agent carries a negative adjusted score.
    let profile = coordinator.agent_profile("agent-a").unwrap();
    assert!(profile.incentive_score < 0.0);
    let last = profile.performance_history.back().unwrap();
    assert!(last.score < 0.0);
}

#[tokio::test]
async fn test_decision_maker_outage_surfaces_typed_error() {
    let executor = Arc::new(ScriptedExecutor::new(ExecutorScript::Succeed {
        quality: None,
    }));
    let mut config = fast_config();
    config.decision.iteration_budget = 3;
    let coordinator = coordinator_with(config, Arc::new(BrokenEvaluator), executor.clone());
    coordinator.register_agent("agent-a", [Capability::Summarization]);

    let err = coordinator.process(summarize_task()).await.unwrap_err();
    assert!(matches!(err, EngineError::DecisionMakerUnavailable(_)));
    // Nothing was ever executed and the task did not linger.
    assert_eq!(executor.call_count(), 0);
}

#[tokio::test]
async fn test_cancel_pending_leaves_no_record() {
    let executor = Arc::new(ScriptedExecutor::new(ExecutorScript::Succeed {
        quality: None,
    }));
    let coordinator = coordinator_with(
        fast_config(),
        Arc::new(ScriptedEvaluator::favors_direct()),
        executor,
    );
    coordinator.register_agent("agent-a", [Capability::Summarization]);

    let task = coordinator.submit(summarize_task()).await.unwrap();
    coordinator.cancel(&task.id).await.unwrap();

    assert!(coordinator.task(&task.id).await.is_none());
    let profile = coordinator.agent_profile("agent-a").unwrap();
    assert!(profile.performance_history.is_empty());
}

// ============================================================================
// Evolution scenarios
// ============================================================================

#[tokio::test]
async fn test_evolution_updates_policy_from_outcomes() {
    let executor = Arc::new(ScriptedExecutor::new(ExecutorScript::Succeed {
        quality: Some(1.0),
    }));
    let mut config = fast_config();
    config.evolution = EvolutionConfig {
        learning_rate: 0.5,
        ..Default::default()
    };
    let coordinator = coordinator_with(
        config,
        Arc::new(ScriptedEvaluator::favors_direct()),
        executor,
    );
    coordinator.register_agent("agent-a", [Capability::Summarization]);

    for _ in 0..3 {
        coordinator.process(summarize_task()).await.unwrap();
    }

    let before = coordinator.policy_snapshot();
    assert_eq!(coordinator.evolve_now(), CycleOutcome::Updated);
    let after = coordinator.policy_snapshot();

    // Strong summarization outcomes pull the tag's weight up; the
    // adjusted scores exceed 1.0 through the deadline-tightness factor.
    assert!(
        after.weight(Capability::Summarization) > before.weight(Capability::Summarization)
    );
    // Untouched tags keep their previous weight.
    assert!(
        (after.weight(Capability::Coding) - before.weight(Capability::Coding)).abs() < 1e-9
    );
}

#[tokio::test]
async fn test_failed_evolution_cycle_keeps_routing_alive() {
    let executor = Arc::new(ScriptedExecutor::new(ExecutorScript::Succeed {
        quality: Some(0.9),
    }));
    let mut config = fast_config();
    config.evolution.learning_rate = f64::NAN;
    let coordinator = coordinator_with(
        config,
        Arc::new(ScriptedEvaluator::favors_direct()),
        executor,
    );
    coordinator.register_agent("agent-a", [Capability::Summarization]);

    coordinator.process(summarize_task()).await.unwrap();

    let before = coordinator.policy_snapshot();
    assert_eq!(coordinator.evolve_now(), CycleOutcome::RolledBack);
    let after = coordinator.policy_snapshot();
    assert!(Arc::ptr_eq(&before, &after), "policy must be the pre-cycle snapshot");

    // Routing still works against the retained snapshot.
    let task = coordinator.process(summarize_task()).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_background_loop_lifecycle() {
    let executor = Arc::new(ScriptedExecutor::new(ExecutorScript::Succeed {
        quality: Some(0.9),
    }));
    let mut config = fast_config();
    config.evolution.trigger_task_count = 1;
    config.evolution.trigger_interval_secs = 3_600;
    let coordinator = coordinator_with(
        config,
        Arc::new(ScriptedEvaluator::favors_direct()),
        executor,
    );
    coordinator.register_agent("agent-a", [Capability::Summarization]);
    coordinator.start_evolution();

    coordinator.process(summarize_task()).await.unwrap();

    // The completion event should trigger a cycle shortly.
    let mut cycles = 0;
    for _ in 0..50 {
        cycles = coordinator.introspect().await.evolution_cycles;
        if cycles > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cycles > 0, "background loop never cycled");

    coordinator.shutdown().await;
}

// ============================================================================
// State machine properties
// ============================================================================

/// Random transition sequences never produce an illegal edge: every
/// observed status change follows Pending -> Assigned -> InProgress ->
/// {Completed, Failed}, and every rejected call is a typed error.
#[tokio::test]
async fn test_random_transition_sequences_respect_state_machine() {
    for seed in 0..8u64 {
        let (manager, incentive) =
            manager_stack(Arc::new(ScriptedEvaluator::favors_direct()));
        incentive.register_agent("agent-a", [Capability::Summarization]);
        let mut rng = StdRng::seed_from_u64(seed);

        let mut task_id = manager.submit(summarize_task()).await.unwrap().id;
        let mut last_status = Some(TaskStatus::Pending);

        for _ in 0..40 {
            let op = rng.gen_range(0..5);
            let result: Result<(), EngineError> = match op {
                0 => manager.assign(&task_id).await.map(|_| ()),
                1 => manager.start(&task_id).await,
                2 => manager
                    .complete(
                        &task_id,
                        ExecutionOutcome {
                            result: "ok".into(),
                            quality_signal: Some(0.5),
                        },
                    )
                    .await
                    .map(|_| ()),
                3 => manager
                    .fail(&task_id, FailureKind::Execution, "induced")
                    .await
                    .map(|_| ()),
                _ => manager.cancel(&task_id).await,
            };

            if let Err(e) = &result {
                assert!(
                    matches!(
                        e,
                        EngineError::InvalidStateTransition { .. }
                            | EngineError::TaskNotFound(_)
                            | EngineError::NoAgentAvailable { .. }
                    ),
                    "unexpected error {e} for op {op}"
                );
            }

            let status = manager.status(&task_id).await;
            if let (Some(old), Some(new)) = (last_status, status) {
                if old != new {
                    assert!(
                        old.can_transition_to(new),
                        "observed illegal edge {old:?} -> {new:?} (op {op}, seed {seed})"
                    );
                }
            }
            last_status = status;

            // Terminal or removed: start over with a fresh task.
            if status.is_none() || status.is_some_and(|s| s.is_terminal()) {
                task_id = manager.submit(summarize_task()).await.unwrap().id;
                last_status = Some(TaskStatus::Pending);
            }
        }
    }
}

#[tokio::test]
async fn test_introspection_reflects_engine_state() {
    let executor = Arc::new(ScriptedExecutor::new(ExecutorScript::Succeed {
        quality: Some(0.7),
    }));
    let coordinator = coordinator_with(
        fast_config(),
        Arc::new(ScriptedEvaluator::favors_direct()),
        executor,
    );
    coordinator.register_agent("agent-a", [Capability::Summarization]);
    coordinator.register_agent("agent-b", [Capability::Coding]);

    coordinator.process(summarize_task()).await.unwrap();

    let report = coordinator.introspect().await;
    assert_eq!(report.registered_agents, vec!["agent-a", "agent-b"]);
    assert_eq!(report.analytics.tasks_completed, 1);
    assert_eq!(report.analytics.tasks_failed, 0);
    assert!(report.exploration_constant > 0.0);
    assert!(report.policy.weight(Capability::Summarization) > 0.0);
    assert_eq!(report.tracked_tasks, 1);
}
