//! Search-based workflow selection.
//!
//! Given a task, the decision maker runs a bounded Monte Carlo tree
//! search over candidate workflows: execute the description as a single
//! step, or decompose it into 2..=K ordered stages (recursively, up to a
//! depth limit). Candidate states are valued by the opaque evaluation
//! collaborator; a timed-out evaluation contributes a neutral 0.5 and is
//! flagged as low-confidence rather than hidden.
//!
//! The tree lives in an index-based arena and the search is an explicit
//! loop, so one episode is bounded in both depth and allocation and the
//! whole tree is dropped when the episode ends.

use crate::config::DecisionConfig;
use crate::router::AgentRouter;
use conclave_common::{EngineError, Evaluator, Result, Task, WorkflowState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The workflow chosen for a task.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowPlan {
    /// Execute the task description as one step.
    Direct,
    /// Split the task into ordered subgoal descriptions, each of which
    /// becomes its own task.
    Decompose { subgoals: Vec<String> },
}

/// Outcome of one search episode.
#[derive(Debug, Clone)]
pub struct Decision {
    pub plan: WorkflowPlan,
    /// Visits of the chosen root child; by construction no sibling saw more
    pub visits: u32,
    pub mean_value: f64,
    /// Evaluation calls that timed out or failed and were scored neutral
    pub low_confidence_samples: u32,
}

#[derive(Debug, Clone)]
enum Action {
    Direct,
    Decompose(Vec<String>),
}

/// One node in the search arena. `parent`/`children` are indices, never
/// owning references.
struct Node {
    state: WorkflowState,
    action: Option<Action>,
    parent: Option<usize>,
    children: Vec<usize>,
    expanded: bool,
    visits: u32,
    total_value: f64,
}

impl Node {
    fn mean_value(&self) -> f64 {
        if self.visits == 0 {
            0.0
        } else {
            self.total_value / self.visits as f64
        }
    }
}

struct SearchOutcome {
    nodes: Vec<Node>,
    best_child: usize,
    successes: u32,
    low_confidence: u32,
}

pub struct DecisionMaker {
    config: DecisionConfig,
    evaluator: Arc<dyn Evaluator>,
    router: Arc<AgentRouter>,
    /// UCB exploration constant as f64 bits; tuned by the evolution loop
    /// while searches are running
    exploration: AtomicU64,
}

impl DecisionMaker {
    pub fn new(config: DecisionConfig, evaluator: Arc<dyn Evaluator>, router: Arc<AgentRouter>) -> Self {
        let exploration = AtomicU64::new(config.exploration_constant.to_bits());
        Self {
            config,
            evaluator,
            router,
            exploration,
        }
    }

    pub fn exploration_constant(&self) -> f64 {
        f64::from_bits(self.exploration.load(Ordering::Relaxed))
    }

    pub fn set_exploration_constant(&self, c: f64) {
        self.exploration.store(c.to_bits(), Ordering::Relaxed);
        debug!(exploration_constant = c, "Updated exploration constant");
    }

    /// Choose a workflow for `task`. `ancestor_depth` counts how many
    /// decompositions already sit above this task, so nested subgoals
    /// respect the same overall depth limit as a single search.
    pub async fn plan(&self, task: &Task, ancestor_depth: usize) -> Result<Decision> {
        let outcome = self.search(task, ancestor_depth).await?;
        let chosen = &outcome.nodes[outcome.best_child];

        let plan = match chosen.action.as_ref() {
            Some(Action::Direct) | None => WorkflowPlan::Direct,
            Some(Action::Decompose(subgoals)) => WorkflowPlan::Decompose {
                subgoals: subgoals.clone(),
            },
        };

        info!(
            task_id = %task.id,
            plan = ?plan,
            visits = chosen.visits,
            mean_value = chosen.mean_value(),
            evaluations = outcome.successes,
            low_confidence = outcome.low_confidence,
            "Workflow chosen"
        );

        Ok(Decision {
            plan,
            visits: chosen.visits,
            mean_value: chosen.mean_value(),
            low_confidence_samples: outcome.low_confidence,
        })
    }

    async fn search(&self, task: &Task, ancestor_depth: usize) -> Result<SearchOutcome> {
        let mut nodes = vec![Node {
            state: WorkflowState {
                task_id: task.id.clone(),
                description: task.description.clone(),
                plan: Vec::new(),
                depth: ancestor_depth,
            },
            action: None,
            parent: None,
            children: Vec::new(),
            expanded: false,
            visits: 0,
            total_value: 0.0,
        }];
        let root = 0;
        let mut successes = 0u32;
        let mut low_confidence = 0u32;
        let eval_timeout = Duration::from_millis(self.config.evaluation_timeout_ms);

        for _ in 0..self.config.iteration_budget {
            // Selection: descend by UCB, taking any unvisited child first.
            let mut idx = root;
            loop {
                if !nodes[idx].children.is_empty() {
                    if let Some(&unvisited) = nodes[idx]
                        .children
                        .iter()
                        .find(|&&c| nodes[c].visits == 0)
                    {
                        idx = unvisited;
                        break;
                    }
                    idx = self.best_ucb_child(&nodes, idx);
                    continue;
                }

                // Expansion: add one unexpanded child per candidate action.
                if !nodes[idx].expanded {
                    nodes[idx].expanded = true;
                    let actions = self.candidate_actions(task, &nodes[idx]);
                    if !actions.is_empty() {
                        for action in actions {
                            let child = self.child_node(&nodes[idx], idx, action);
                            nodes.push(child);
                            let child_idx = nodes.len() - 1;
                            nodes[idx].children.push(child_idx);
                        }
                        idx = nodes[idx].children[0];
                    }
                }
                break;
            }

            // Evaluation: opaque collaborator call under a timeout. The
            // arena must not stay borrowed across the await.
            let state = nodes[idx].state.clone();
            let value = match tokio::time::timeout(eval_timeout, self.evaluator.evaluate(&state)).await
            {
                Ok(Ok(v)) if v.is_finite() => {
                    successes += 1;
                    v.clamp(0.0, 1.0)
                }
                Ok(Ok(v)) => {
                    warn!(task_id = %task.id, value = v, "Evaluator returned non-finite value");
                    low_confidence += 1;
                    0.5
                }
                Ok(Err(e)) => {
                    debug!(task_id = %task.id, error = %e, "Evaluation failed, scoring neutral");
                    low_confidence += 1;
                    0.5
                }
                Err(_) => {
                    debug!(
                        task_id = %task.id,
                        timeout_ms = self.config.evaluation_timeout_ms,
                        "Evaluation timed out, scoring neutral"
                    );
                    low_confidence += 1;
                    0.5
                }
            };

            // Backpropagation up to the root.
            let mut cursor = Some(idx);
            while let Some(i) = cursor {
                nodes[i].visits += 1;
                nodes[i].total_value += value;
                cursor = nodes[i].parent;
            }
        }

        if successes == 0 {
            return Err(EngineError::DecisionMakerUnavailable(format!(
                "all {} evaluations timed out or failed for task {}",
                self.config.iteration_budget, task.id
            )));
        }

        // Robust choice: highest visit count, ties broken by mean value.
        let best_child = nodes[root]
            .children
            .iter()
            .copied()
            .max_by(|&a, &b| {
                nodes[a]
                    .visits
                    .cmp(&nodes[b].visits)
                    .then_with(|| {
                        nodes[a]
                            .mean_value()
                            .partial_cmp(&nodes[b].mean_value())
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
            })
            .ok_or_else(|| {
                EngineError::DecisionMakerUnavailable(format!(
                    "search produced no candidate workflows for task {}",
                    task.id
                ))
            })?;

        Ok(SearchOutcome {
            nodes,
            best_child,
            successes,
            low_confidence,
        })
    }

    fn best_ucb_child(&self, nodes: &[Node], parent: usize) -> usize {
        let c = self.exploration_constant();
        let parent_visits = nodes[parent].visits.max(1) as f64;

        let mut best = nodes[parent].children[0];
        let mut best_score = f64::NEG_INFINITY;
        for &child in &nodes[parent].children {
            let visits = nodes[child].visits as f64;
            let score = nodes[child].mean_value() + c * (parent_visits.ln() / visits).sqrt();
            if score > best_score {
                best_score = score;
                best = child;
            }
        }
        best
    }

    fn child_node(&self, parent: &Node, parent_idx: usize, action: Action) -> Node {
        let state = match &action {
            Action::Direct => WorkflowState {
                task_id: parent.state.task_id.clone(),
                description: parent.state.description.clone(),
                plan: {
                    let mut plan = parent.state.plan.clone();
                    plan.push(parent.state.description.clone());
                    plan
                },
                depth: parent.state.depth,
            },
            Action::Decompose(subgoals) => WorkflowState {
                task_id: parent.state.task_id.clone(),
                // Deeper search refines the first stage; the chosen
                // workflow only ever commits the root child's action.
                description: subgoals[0].clone(),
                plan: {
                    let mut plan = parent.state.plan.clone();
                    plan.extend(subgoals.iter().cloned());
                    plan
                },
                depth: parent.state.depth + 1,
            },
        };
        Node {
            state,
            action: Some(action),
            parent: Some(parent_idx),
            children: Vec::new(),
            expanded: false,
            visits: 0,
            total_value: 0.0,
        }
    }

    /// Candidate actions for a node, in stable order: Direct first, then
    /// decompositions by increasing width. A node that already committed
    /// to Direct is terminal and yields no candidates.
    fn candidate_actions(&self, task: &Task, node: &Node) -> Vec<Action> {
        if matches!(node.action, Some(Action::Direct)) {
            return Vec::new();
        }

        let mut actions = vec![Action::Direct];

        // Decomposition only pays off when the registered pool can spread
        // the stages across more than one agent.
        let pool = self.router.candidate_count(&task.required_capabilities);
        if node.state.depth < self.config.max_depth && pool > 1 {
            for width in 2..=self.config.max_subgoals.max(2) {
                actions.push(Action::Decompose(stage_subgoals(
                    &node.state.description,
                    width,
                )));
            }
        }
        actions
    }
}

/// Ordered stage descriptions for a decomposition of `description` into
/// `parts` subgoals. Workers receive these verbatim.
fn stage_subgoals(description: &str, parts: usize) -> Vec<String> {
    (1..=parts)
        .map(|i| format!("Stage {i} of {parts}: {description}"))
        .collect()
}
