//! Phased, level-by-level rollout over the component graph.
//!
//! A phase walks the dependency levels in order. Every ready node of a
//! level runs concurrently on a bounded worker pool, and the next level
//! only starts once all nodes of the current one have finished. Nodes
//! whose dependencies failed are blocked without being invoked; nodes
//! whose dependencies are still converging are skipped until the next
//! reconciliation.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use itertools::Itertools;
use keel_dag::{DependencyGraph, GraphNode, NodeIndex};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

use crate::session::Session;
use crate::state::{ComponentState, NodeOutcome, Phase};
use crate::transition;

/// Aggregate result of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseResult {
    /// Every node succeeded or was disabled.
    Success,
    /// Nothing required failed, but some nodes still need time.
    Incomplete,
    /// A required node failed or was blocked.
    Failed,
}

impl PhaseResult {
    /// The worse of two results.
    #[must_use]
    pub const fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Failed, _) | (_, Self::Failed) => Self::Failed,
            (Self::Incomplete, _) | (_, Self::Incomplete) => Self::Incomplete,
            (Self::Success, Self::Success) => Self::Success,
        }
    }
}

impl fmt::Display for PhaseResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "SUCCESS",
            Self::Incomplete => "INCOMPLETE",
            Self::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

/// Outcome of every node in one phase, in level order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub result: PhaseResult,
    pub outcomes: Vec<(String, NodeOutcome)>,
}

impl PhaseReport {
    #[must_use]
    pub fn outcome(&self, component: &str) -> Option<&NodeOutcome> {
        self.outcomes
            .iter()
            .find(|(name, _)| name == component)
            .map(|(_, outcome)| outcome)
    }
}

/// Runs one phase over a dependency graph.
#[derive(Debug, Clone)]
pub struct PhaseExecutor {
    phase: Phase,
    concurrency: usize,
    presets: HashMap<String, NodeOutcome>,
}

impl PhaseExecutor {
    #[must_use]
    pub fn new(phase: Phase, concurrency: usize) -> Self {
        Self {
            phase,
            concurrency: concurrency.max(1),
            presets: HashMap::new(),
        }
    }

    /// Outcomes decided before the phase starts; those nodes are not invoked.
    #[must_use]
    pub fn with_presets(mut self, presets: HashMap<String, NodeOutcome>) -> Self {
        self.presets = presets;
        self
    }

    /// Drive `transition` over every node, level by level.
    pub async fn run<N, F, Fut>(&self, graph: &DependencyGraph<N>, transition: F) -> PhaseReport
    where
        N: GraphNode,
        F: Fn(&N) -> Fut,
        Fut: Future<Output = NodeOutcome> + Send + 'static,
    {
        let phase = self.phase;
        info!(
            phase = %phase,
            components = graph.len(),
            levels = graph.levels().len(),
            workers = self.concurrency,
            "Phase started"
        );

        let pool = Arc::new(Semaphore::new(self.concurrency));
        let mut outcomes: HashMap<NodeIndex, NodeOutcome> = HashMap::new();
        let mut halted = false;

        for (level, members) in graph.levels().iter().enumerate() {
            let mut workers = JoinSet::new();

            for &index in members {
                let Some(node) = graph.node(index) else {
                    continue;
                };
                if let Some(preset) = self.presets.get(node.name()) {
                    outcomes.insert(index, preset.clone());
                    continue;
                }
                if let Some(gated) = gate(graph, index, &outcomes, halted) {
                    debug!(
                        phase = %phase,
                        component = node.name(),
                        outcome = ?gated,
                        "Not invoked"
                    );
                    outcomes.insert(index, gated);
                    continue;
                }

                let pool = Arc::clone(&pool);
                let work = transition(node);
                workers.spawn(
                    async move {
                        let Ok(_permit) = pool.acquire_owned().await else {
                            return (index, NodeOutcome::failed("worker pool closed", 0));
                        };
                        (index, work.await)
                    }
                    .in_current_span(),
                );
            }

            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok((index, outcome)) => {
                        outcomes.insert(index, outcome);
                    }
                    Err(e) => error!(phase = %phase, level, error = %e, "Worker task aborted"),
                }
            }

            // A worker that panicked leaves no outcome behind.
            for &index in members {
                outcomes
                    .entry(index)
                    .or_insert_with(|| NodeOutcome::failed("worker task aborted", 0));
            }

            let failed_required = members
                .iter()
                .filter(|&&index| {
                    graph.node(index).is_some_and(GraphNode::is_required)
                        && outcomes.get(&index).is_some_and(NodeOutcome::is_fatal)
                })
                .filter_map(|&index| graph.name_of(index))
                .collect_vec();
            if !halted && !failed_required.is_empty() {
                warn!(
                    phase = %phase,
                    level,
                    failed = %failed_required.join(", "),
                    "Required component failed, halting later levels"
                );
                halted = true;
            }
        }

        let result = aggregate(graph, &outcomes);
        let outcomes = graph
            .levels()
            .iter()
            .flatten()
            .filter_map(|&index| {
                let name = graph.name_of(index)?;
                let outcome = outcomes.remove(&index)?;
                Some((name.to_string(), outcome))
            })
            .collect_vec();

        info!(phase = %phase, result = %result, "Phase finished");
        PhaseReport {
            phase,
            result,
            outcomes,
        }
    }
}

/// Run one phase with no presets.
pub async fn run_phase<N, F, Fut>(
    graph: &DependencyGraph<N>,
    phase: Phase,
    transition: F,
    concurrency: usize,
) -> PhaseReport
where
    N: GraphNode,
    F: Fn(&N) -> Fut,
    Fut: Future<Output = NodeOutcome> + Send + 'static,
{
    PhaseExecutor::new(phase, concurrency)
        .run(graph, transition)
        .await
}

/// Decide a node's outcome without invoking it, if its dependencies or the
/// phase state already settle it.
fn gate<N: GraphNode>(
    graph: &DependencyGraph<N>,
    index: NodeIndex,
    outcomes: &HashMap<NodeIndex, NodeOutcome>,
    halted: bool,
) -> Option<NodeOutcome> {
    let dependencies = graph.dependencies(index);

    let blockers = dependencies
        .iter()
        .copied()
        .filter(|dep| outcomes.get(dep).is_some_and(NodeOutcome::is_fatal))
        .filter_map(|dep| graph.name_of(dep))
        .map(str::to_string)
        .sorted()
        .collect_vec();
    if !blockers.is_empty() {
        return Some(NodeOutcome::Blocked { by: blockers });
    }

    let waiting = dependencies
        .iter()
        .copied()
        .filter(|dep| !outcomes.get(dep).is_some_and(NodeOutcome::is_satisfied))
        .filter_map(|dep| graph.name_of(dep))
        .sorted()
        .collect_vec();
    if !waiting.is_empty() {
        return Some(NodeOutcome::skipped(format!(
            "waiting on {}",
            waiting.join(", ")
        )));
    }

    halted.then(|| NodeOutcome::skipped("phase failed before this level"))
}

fn aggregate<N: GraphNode>(
    graph: &DependencyGraph<N>,
    outcomes: &HashMap<NodeIndex, NodeOutcome>,
) -> PhaseResult {
    let mut result = PhaseResult::Success;
    for (index, node) in graph.nodes() {
        match outcomes.get(&index) {
            Some(outcome) if outcome.is_fatal() && node.is_required() => {
                return PhaseResult::Failed;
            }
            Some(outcome) if outcome.is_waiting() => result = PhaseResult::Incomplete,
            None => result = PhaseResult::Incomplete,
            Some(_) => {}
        }
    }
    result
}

/// Hooks a controller can run after each phase.
///
/// Returning `Ok(false)` turns a successful phase into an incomplete one,
/// which requeues. Returning an error fails the phase.
#[async_trait]
pub trait PhaseHooks: Send + Sync {
    async fn after_deploy(
        &self,
        _session: &Session,
        _result: PhaseResult,
    ) -> keel_core::Result<bool> {
        Ok(true)
    }

    async fn after_verify(
        &self,
        _session: &Session,
        _result: PhaseResult,
    ) -> keel_core::Result<bool> {
        Ok(true)
    }
}

/// Hooks that accept every phase.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl PhaseHooks for NoHooks {}

/// What a rollout produced.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutReport {
    pub deploy: PhaseReport,
    /// Absent when the deploy phase failed.
    pub verify: Option<PhaseReport>,
    pub hook_errors: Vec<String>,
}

impl RolloutReport {
    /// Combined result: deploy failure dominates, otherwise the worse of both.
    #[must_use]
    pub fn result(&self) -> PhaseResult {
        self.verify
            .as_ref()
            .map_or(self.deploy.result, |verify| {
                self.deploy.result.combine(verify.result)
            })
    }
}

/// Runs the deploy phase then the verify phase for one session.
#[derive(Debug, Clone)]
pub struct RolloutManager {
    session: Arc<Session>,
}

impl RolloutManager {
    #[must_use]
    pub const fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Deploy every component, then verify unless the deploy phase failed.
    pub async fn rollout<H>(&self, hooks: &H) -> RolloutReport
    where
        H: PhaseHooks + ?Sized,
    {
        let config = self.session.config();
        let graph = self.session.graph();
        let mut hook_errors = Vec::new();

        let session = Arc::clone(&self.session);
        let mut deploy = PhaseExecutor::new(Phase::Deploy, config.deploy_workers)
            .run(graph, move |component| {
                let session = Arc::clone(&session);
                let component = component.clone();
                async move { transition::deploy(&session, &component).await }
            })
            .await;
        self.record(&deploy).await;

        deploy.result = apply_hook(
            "after_deploy",
            deploy.result,
            hooks.after_deploy(&self.session, deploy.result).await,
            &mut hook_errors,
        );

        if deploy.result == PhaseResult::Failed {
            info!(id = %self.session.id(), "Deploy failed, skipping verify");
            return RolloutReport {
                deploy,
                verify: None,
                hook_errors,
            };
        }

        let presets = deploy
            .outcomes
            .iter()
            .filter_map(|(name, outcome)| carried_into_verify(outcome).map(|o| (name.clone(), o)))
            .collect();

        let session = Arc::clone(&self.session);
        let mut verify = PhaseExecutor::new(Phase::Verify, config.verify_workers)
            .with_presets(presets)
            .run(graph, move |component| {
                let session = Arc::clone(&session);
                let component = component.clone();
                async move { transition::verify(&session, &component).await }
            })
            .await;
        self.record(&verify).await;

        verify.result = apply_hook(
            "after_verify",
            verify.result,
            hooks.after_verify(&self.session, verify.result).await,
            &mut hook_errors,
        );

        RolloutReport {
            deploy,
            verify: Some(verify),
            hook_errors,
        }
    }

    async fn record(&self, report: &PhaseReport) {
        for (name, outcome) in &report.outcomes {
            self.session.record(report.phase, name, outcome).await;
        }
    }
}

/// Deploy outcomes that settle a node's verify outcome up front.
fn carried_into_verify(deployed: &NodeOutcome) -> Option<NodeOutcome> {
    match deployed {
        NodeOutcome::Succeeded {
            state: ComponentState::Disabled,
            ..
        } => Some(NodeOutcome::succeeded(ComponentState::Disabled, 0)),
        outcome if outcome.is_fatal() => Some(outcome.clone()),
        outcome if outcome.is_waiting() => Some(NodeOutcome::skipped("not deployed")),
        _ => None,
    }
}

fn apply_hook(
    hook: &str,
    result: PhaseResult,
    verdict: keel_core::Result<bool>,
    hook_errors: &mut Vec<String>,
) -> PhaseResult {
    match verdict {
        Ok(true) => result,
        Ok(false) => {
            info!(hook, "Hook asked for another pass");
            result.combine(PhaseResult::Incomplete)
        }
        Err(e) => {
            warn!(hook, error = %e, "Hook failed");
            hook_errors.push(e.to_string());
            PhaseResult::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[derive(Debug, Clone)]
    struct Step {
        name: &'static str,
        required: bool,
    }

    impl GraphNode for Step {
        fn name(&self) -> &str {
            self.name
        }

        fn is_required(&self) -> bool {
            self.required
        }
    }

    fn graph(optional: &[&'static str]) -> DependencyGraph<Step> {
        let nodes = ["a", "b", "c", "d"]
            .into_iter()
            .map(|name| Step {
                name,
                required: !optional.contains(&name),
            })
            .collect();
        let edges = vec![
            keel_dag::Edge::new("b", "a"),
            keel_dag::Edge::new("c", "a"),
            keel_dag::Edge::new("d", "c"),
        ];
        DependencyGraph::build(nodes, edges).unwrap()
    }

    fn outcome_when(failing: &'static str) -> impl Fn(&Step) -> std::future::Ready<NodeOutcome> {
        move |step: &Step| {
            std::future::ready(if step.name == failing {
                NodeOutcome::failed("boom", 1)
            } else {
                NodeOutcome::succeeded(ComponentState::Deployed, 1)
            })
        }
    }

    #[test]
    fn test_combine_worst_wins() {
        use PhaseResult::*;
        assert_eq!(Success.combine(Success), Success);
        assert_eq!(Success.combine(Incomplete), Incomplete);
        assert_eq!(Incomplete.combine(Failed), Failed);
        assert_eq!(Failed.combine(Success), Failed);
    }

    #[tokio::test]
    async fn test_all_succeed() {
        let report = run_phase(&graph(&[]), Phase::Deploy, outcome_when("none"), 2).await;
        assert_eq!(report.result, PhaseResult::Success);
        let order = report
            .outcomes
            .iter()
            .map(|(n, _)| n.as_str())
            .collect_vec();
        assert_eq!(order, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_required_failure_blocks_dependents() {
        let report = run_phase(&graph(&[]), Phase::Deploy, outcome_when("a"), 2).await;
        assert_eq!(report.result, PhaseResult::Failed);
        assert_eq!(
            report.outcome("b"),
            Some(&NodeOutcome::Blocked {
                by: vec!["a".into()]
            })
        );
        assert_eq!(
            report.outcome("d"),
            Some(&NodeOutcome::Blocked {
                by: vec!["c".into()]
            })
        );
    }

    #[tokio::test]
    async fn test_optional_failure_does_not_fail_phase() {
        let report = run_phase(&graph(&["b"]), Phase::Deploy, outcome_when("b"), 2).await;
        assert_eq!(report.result, PhaseResult::Success);
        assert!(report.outcome("d").unwrap().is_satisfied());
    }

    #[tokio::test]
    async fn test_required_failure_halts_later_levels() {
        let report = run_phase(&graph(&[]), Phase::Deploy, outcome_when("b"), 2).await;
        assert_eq!(report.result, PhaseResult::Failed);
        assert_eq!(
            report.outcome("d"),
            Some(&NodeOutcome::skipped("phase failed before this level"))
        );
    }

    #[tokio::test]
    async fn test_waiting_dependency_skips_dependents() {
        let transition = |step: &Step| {
            std::future::ready(if step.name == "c" {
                NodeOutcome::not_ready("warming up", 1)
            } else {
                NodeOutcome::succeeded(ComponentState::Verified, 1)
            })
        };
        let report = run_phase(&graph(&[]), Phase::Verify, transition, 4).await;
        assert_eq!(report.result, PhaseResult::Incomplete);
        assert_eq!(
            report.outcome("d"),
            Some(&NodeOutcome::skipped("waiting on c"))
        );
        assert!(report.outcome("b").unwrap().is_satisfied());
    }

    #[tokio::test]
    async fn test_presets_are_not_invoked() {
        let presets = [("a".to_string(), NodeOutcome::failed("deploy failed", 3))]
            .into_iter()
            .collect();
        let report = PhaseExecutor::new(Phase::Verify, 2)
            .with_presets(presets)
            .run(&graph(&[]), outcome_when("none"))
            .await;
        assert_eq!(
            report.outcome("a"),
            Some(&NodeOutcome::failed("deploy failed", 3))
        );
        assert_eq!(report.result, PhaseResult::Failed);
    }

    #[test]
    fn test_hook_verdicts() {
        let mut errors = Vec::new();
        assert_eq!(
            apply_hook("h", PhaseResult::Success, Ok(false), &mut errors),
            PhaseResult::Incomplete
        );
        assert_eq!(
            apply_hook(
                "h",
                PhaseResult::Success,
                Err(keel_core::Error::hook_failed("h", "nope")),
                &mut errors
            ),
            PhaseResult::Failed
        );
        assert_eq!(errors.len(), 1);
    }
}
