//! End-to-end rollout scenarios against the in-memory cluster.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::indexing_slicing)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use keel_core::{Declaration, Manifest, PAUSE_ANNOTATION, ResourceIdentity, RolloutConfig};
use keel_dag::{DagError, DependencyGraph};
use keel_reconciler::{
    AccessError, ComponentRegistry, ComponentSpec, ComponentState, Controller, Error,
    InMemoryCluster, NodeOutcome, Phase, PhaseExecutor, PhaseHooks, PhaseResult, Readiness,
    Reconciler, ReconciliationSummary, RequeueReason, RequeueToken, Session,
};
use serde_json::json;

/// Controller that registers a fixed set of components.
struct Fixture {
    components: Vec<ComponentSpec>,
    fail_after_verify: bool,
}

impl Fixture {
    fn new(components: Vec<ComponentSpec>) -> Self {
        Self {
            components,
            fail_after_verify: false,
        }
    }
}

#[async_trait::async_trait]
impl PhaseHooks for Fixture {
    async fn after_verify(&self, _: &Session, _: PhaseResult) -> keel_core::Result<bool> {
        if self.fail_after_verify {
            return Err(keel_core::Error::hook_failed("after_verify", "smoke test failed"));
        }
        Ok(true)
    }
}

impl Controller for Fixture {
    fn setup(&self, _: &Declaration, registry: &mut ComponentRegistry) -> keel_core::Result<()> {
        for component in &self.components {
            registry.add(component.clone());
        }
        Ok(())
    }
}

fn config_map(name: &str) -> Manifest {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": "prod"},
        "data": {"owner": name}
    })
}

fn identity(name: &str) -> ResourceIdentity {
    ResourceIdentity::from_manifest(&config_map(name)).unwrap()
}

fn component(name: &str, after: &[&str]) -> keel_reconciler::ComponentBuilder {
    after.iter().fold(
        ComponentSpec::builder(name).manifests(vec![config_map(name)]),
        |builder, dep| builder.after(*dep),
    )
}

/// Components {a: [], b: [a], c: [a], d: [c]}.
fn diamond() -> Vec<ComponentSpec> {
    vec![
        component("a", &[]).build(),
        component("b", &["a"]).build(),
        component("c", &["a"]).build(),
        component("d", &["c"]).build(),
    ]
}

fn declaration() -> Declaration {
    Declaration::new(
        ResourceIdentity::new("example.dev/v1", "Platform", Some("prod".into()), "demo"),
        json!({"version": "1.0"}),
    )
}

fn fast_config() -> RolloutConfig {
    RolloutConfig {
        retry_backoff_ms: 1,
        max_retry_backoff_ms: 2,
        ..RolloutConfig::default()
    }
}

fn reconciler(
    controller: Fixture,
    cluster: &Arc<InMemoryCluster>,
    config: RolloutConfig,
) -> Reconciler {
    Reconciler::builder()
        .with_controller(Arc::new(controller))
        .with_cluster(Arc::clone(cluster) as Arc<dyn keel_reconciler::ClusterAccess>)
        .with_config(config)
        .build()
        .unwrap()
}

async fn reconcile(
    reconciler: &Reconciler,
    prior: Option<&RequeueToken>,
) -> ReconciliationSummary {
    reconciler.reconcile(declaration(), prior).await.unwrap()
}

// ---------------------------------------------------------------------------
// Level scheduling
// ---------------------------------------------------------------------------

/// Records start and end of each component call along with peak concurrency.
#[derive(Default)]
struct Tracker {
    events: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Tracker {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn position(&self, event: &str) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("{event} never happened"))
    }
}

fn tracking(
    tracker: &Arc<Tracker>,
) -> impl Fn(&ComponentSpec) -> BoxFuture<'static, NodeOutcome> {
    let tracker = Arc::clone(tracker);
    move |component: &ComponentSpec| {
        let tracker = Arc::clone(&tracker);
        let name = keel_dag::GraphNode::name(component).to_string();
        async move {
            let now = tracker.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            tracker.peak.fetch_max(now, Ordering::SeqCst);
            tracker.events.lock().unwrap().push(format!("start:{name}"));
            tokio::time::sleep(Duration::from_millis(20)).await;
            tracker.events.lock().unwrap().push(format!("end:{name}"));
            tracker.in_flight.fetch_sub(1, Ordering::SeqCst);
            NodeOutcome::succeeded(ComponentState::Deployed, 1)
        }
        .boxed()
    }
}

/// The diamond compiled the way a reconcile compiles it, through the registry.
fn diamond_graph() -> DependencyGraph<ComponentSpec> {
    let mut registry = ComponentRegistry::new();
    for component in diamond() {
        registry.add(component);
    }
    registry.into_graph(&declaration(), &fast_config()).unwrap()
}

#[test]
fn given_diamond_components_when_compiled_then_after_lists_become_edges() {
    let graph = diamond_graph();

    assert_eq!(
        graph.level_names(),
        vec![vec!["a"], vec!["b", "c"], vec!["d"]]
    );
}

#[test]
fn given_node_carried_dependencies_when_built_without_edges_then_single_level() {
    let graph = DependencyGraph::build(diamond(), Vec::new()).unwrap();

    assert_eq!(graph.level_names(), vec![vec!["a", "b", "c", "d"]]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn given_diamond_when_deploying_with_two_workers_then_siblings_overlap_after_root() {
    let graph = diamond_graph();

    let tracker = Arc::new(Tracker::default());
    let report = PhaseExecutor::new(Phase::Deploy, 2)
        .run(&graph, tracking(&tracker))
        .await;

    assert_eq!(report.result, PhaseResult::Success);
    let end_a = tracker.position("end:a");
    assert!(tracker.position("start:b") > end_a);
    assert!(tracker.position("start:c") > end_a);
    // b and c ran side by side.
    assert!(tracker.position("start:c") < tracker.position("end:b"));
    assert!(tracker.position("start:b") < tracker.position("end:c"));
    assert!(tracker.position("start:d") > tracker.position("end:c"));
    assert_eq!(tracker.peak.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn given_wide_level_when_running_then_pool_size_is_never_exceeded() {
    let nodes = (0..8)
        .map(|i| ComponentSpec::builder(format!("n{i}")).build())
        .collect();
    let graph = DependencyGraph::build(nodes, Vec::new()).unwrap();

    let tracker = Arc::new(Tracker::default());
    let report = PhaseExecutor::new(Phase::Deploy, 3)
        .run(&graph, tracking(&tracker))
        .await;

    assert_eq!(report.outcomes.len(), 8);
    assert!(tracker.peak.load(Ordering::SeqCst) <= 3);
}

// ---------------------------------------------------------------------------
// Failure propagation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn given_root_exhausts_retries_when_reconciling_then_dependents_blocked_and_verify_skipped() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster
        .fail_applies(
            &identity("a"),
            3,
            AccessError::unavailable("api server down"),
        )
        .await;
    let config = RolloutConfig {
        deploy_retry_ceiling: 3,
        ..fast_config()
    };
    let reconciler = reconciler(Fixture::new(diamond()), &cluster, config);

    let summary = reconcile(&reconciler, None).await;

    assert_eq!(summary.deploy, Some(PhaseResult::Failed));
    assert_eq!(summary.verify, None);
    assert_eq!(summary.result, Some(PhaseResult::Failed));
    assert_eq!(summary.state_of("a"), Some(ComponentState::Failed));
    assert_eq!(summary.record("a", Phase::Deploy).unwrap().attempts, 3);
    for name in ["b", "c", "d"] {
        assert_eq!(
            summary.state_of(name),
            Some(ComponentState::Blocked),
            "{name}"
        );
    }
    assert!(summary.records.iter().all(|r| r.phase == Phase::Deploy));
    assert_eq!(cluster.apply_log().await, vec![identity("a"); 3]);

    let requeue = summary.requeue.unwrap();
    assert_eq!(requeue.reason, RequeueReason::RolloutFailed);
}

#[tokio::test]
async fn given_optional_leaf_fails_when_reconciling_then_rollout_still_succeeds() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster
        .fail_applies(
            &identity("b"),
            1,
            AccessError::rejected(&identity("b"), "forbidden"),
        )
        .await;
    let components = vec![
        component("a", &[]).build(),
        component("b", &["a"]).optional().build(),
        component("c", &["a"]).build(),
    ];
    let reconciler = reconciler(Fixture::new(components), &cluster, fast_config());

    let summary = reconcile(&reconciler, None).await;

    assert_eq!(summary.deploy, Some(PhaseResult::Success));
    assert_eq!(summary.result, Some(PhaseResult::Success));
    assert_eq!(summary.state_of("b"), Some(ComponentState::Failed));
    assert_eq!(summary.state_of("c"), Some(ComponentState::Verified));
    assert!(summary.requeue.is_none());
}

#[tokio::test]
async fn given_failing_verify_hook_when_reconciling_then_result_failed_with_hook_error() {
    let cluster = Arc::new(InMemoryCluster::new());
    let fixture = Fixture {
        components: diamond(),
        fail_after_verify: true,
    };
    let reconciler = reconciler(fixture, &cluster, fast_config());

    let summary = reconcile(&reconciler, None).await;

    assert_eq!(summary.deploy, Some(PhaseResult::Success));
    assert_eq!(summary.verify, Some(PhaseResult::Failed));
    assert_eq!(summary.hook_errors.len(), 1);
    assert!(summary.hook_errors[0].contains("smoke test failed"));
}

// ---------------------------------------------------------------------------
// Readiness and requeue
// ---------------------------------------------------------------------------

fn ready_on_poll(
    n: u32,
    polls: &Arc<AtomicU32>,
) -> impl Fn(&Manifest) -> keel_core::Result<Readiness> + Send + Sync + 'static {
    let polls = Arc::clone(polls);
    move |_: &Manifest| -> keel_core::Result<Readiness> {
        if polls.fetch_add(1, Ordering::SeqCst) + 1 >= n {
            Ok(Readiness::Ready)
        } else {
            Ok(Readiness::not_ready("replicas starting"))
        }
    }
}

#[tokio::test]
async fn given_slow_component_when_requeued_then_verified_on_third_poll() {
    let cluster = Arc::new(InMemoryCluster::new());
    let polls = Arc::new(AtomicU32::new(0));
    let components = vec![
        component("a", &[]).build(),
        component("b", &["a"]).readiness(ready_on_poll(3, &polls)).build(),
    ];
    let config = RolloutConfig {
        verify_attempt_ceiling: 5,
        requeue_delay_secs: 15,
        ..fast_config()
    };
    let reconciler = reconciler(Fixture::new(components), &cluster, config);

    let first = reconcile(&reconciler, None).await;
    assert_eq!(first.deploy, Some(PhaseResult::Success));
    assert_eq!(first.verify, Some(PhaseResult::Incomplete));
    assert_eq!(first.state_of("a"), Some(ComponentState::Verified));
    assert_eq!(first.state_of("b"), Some(ComponentState::Verifying));
    let token = first.requeue.clone().unwrap();
    assert_eq!(token.reason, RequeueReason::NotReady);
    assert_eq!(token.delay, Duration::from_secs(15));
    assert_eq!(token.verify_attempts.get("b"), Some(&1));

    let second = reconcile(&reconciler, Some(&token)).await;
    assert_eq!(second.verify, Some(PhaseResult::Incomplete));
    let token = second.requeue.clone().unwrap();
    assert_eq!(token.verify_attempts.get("b"), Some(&2));

    let third = reconcile(&reconciler, Some(&token)).await;
    assert_eq!(third.verify, Some(PhaseResult::Success));
    assert_eq!(third.state_of("b"), Some(ComponentState::Verified));
    assert_eq!(third.record("b", Phase::Verify).unwrap().attempts, 3);
    assert!(third.is_converged());
    assert!(third.requeue.is_none());
    assert_eq!(polls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn given_component_never_ready_when_ceiling_reached_then_verify_fails() {
    let cluster = Arc::new(InMemoryCluster::new());
    let polls = Arc::new(AtomicU32::new(0));
    let components = vec![component("a", &[]).readiness(ready_on_poll(100, &polls)).build()];
    let config = RolloutConfig {
        verify_attempt_ceiling: 2,
        ..fast_config()
    };
    let reconciler = reconciler(Fixture::new(components), &cluster, config);

    let first = reconcile(&reconciler, None).await;
    assert_eq!(first.verify, Some(PhaseResult::Incomplete));

    let second = reconcile(&reconciler, first.requeue.as_ref()).await;
    assert_eq!(second.verify, Some(PhaseResult::Failed));
    assert_eq!(second.state_of("a"), Some(ComponentState::Failed));
    assert_eq!(second.requeue.unwrap().reason, RequeueReason::RolloutFailed);
}

#[tokio::test]
async fn given_dependency_not_ready_when_verifying_then_dependent_skipped() {
    let cluster = Arc::new(InMemoryCluster::new());
    let polls = Arc::new(AtomicU32::new(0));
    let components = vec![
        component("a", &[]).readiness(ready_on_poll(2, &polls)).build(),
        component("b", &["a"]).build(),
    ];
    let reconciler = reconciler(Fixture::new(components), &cluster, fast_config());

    let summary = reconcile(&reconciler, None).await;

    assert_eq!(summary.verify, Some(PhaseResult::Incomplete));
    let record = summary.record("b", Phase::Verify).unwrap();
    assert_eq!(record.error.as_deref(), Some("waiting on a"));
}

// ---------------------------------------------------------------------------
// Idempotence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn given_converged_declaration_when_resubmitted_then_no_apply_calls() {
    let cluster = Arc::new(InMemoryCluster::new());
    let reconciler = reconciler(Fixture::new(diamond()), &cluster, fast_config());

    let first = reconcile(&reconciler, None).await;
    assert!(first.is_converged());
    let applies = cluster.call_counts().apply;
    assert_eq!(applies, 4);

    let second = reconcile(&reconciler, None).await;
    assert!(second.is_converged());
    assert_eq!(cluster.call_counts().apply, applies);
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn given_drifted_object_when_reconciling_then_only_drift_is_patched() {
    let cluster = Arc::new(InMemoryCluster::new());
    let mut drifted = config_map("b");
    drifted["data"]["owner"] = json!("someone-else");
    drifted["data"]["extra"] = json!("kept");
    cluster.seed(drifted).await.unwrap();
    let reconciler = reconciler(Fixture::new(diamond()), &cluster, fast_config());

    let summary = reconcile(&reconciler, None).await;

    assert!(summary.is_converged());
    let stored = cluster.object(&identity("b")).await.unwrap();
    assert_eq!(stored["data"]["owner"], "b");
    assert_eq!(stored["data"]["extra"], "kept");
}

// ---------------------------------------------------------------------------
// Gatekeeping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn given_unsupported_version_when_strict_then_rejected_before_cluster_access() {
    let cluster = Arc::new(InMemoryCluster::new());
    let config = RolloutConfig {
        strict_versioning: true,
        supported_versions: vec!["2.0".into()],
        ..fast_config()
    };
    let reconciler = reconciler(Fixture::new(diamond()), &cluster, config);

    let result = reconciler.reconcile(declaration(), None).await;

    assert!(matches!(
        result,
        Err(Error::Core(keel_core::Error::UnsupportedVersion { .. }))
    ));
    assert_eq!(cluster.call_counts(), Default::default());
}

#[tokio::test]
async fn given_paused_declaration_when_reconciling_then_nothing_runs() {
    let cluster = Arc::new(InMemoryCluster::new());
    let reconciler = reconciler(Fixture::new(diamond()), &cluster, fast_config());

    let paused = declaration().with_annotation(PAUSE_ANNOTATION, "True");
    let summary = reconciler.reconcile(paused, None).await.unwrap();

    assert!(summary.paused);
    assert!(summary.records.is_empty());
    assert!(summary.requeue.is_none());
    assert_eq!(cluster.call_counts(), Default::default());
}

#[tokio::test]
async fn given_cyclic_components_when_reconciling_then_build_error() {
    let cluster = Arc::new(InMemoryCluster::new());
    let components = vec![component("a", &["b"]).build(), component("b", &["a"]).build()];
    let reconciler = reconciler(Fixture::new(components), &cluster, fast_config());

    let result = reconciler.reconcile(declaration(), None).await;

    match result {
        Err(Error::Build(DagError::CycleDetected(members))) => {
            assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
        }
        other => panic!("expected cycle, got {other:?}"),
    }
    assert_eq!(cluster.call_counts(), Default::default());
}

#[tokio::test]
async fn given_disabled_component_when_reconciling_then_resources_removed_and_dependents_proceed() {
    let cluster = Arc::new(InMemoryCluster::new());
    cluster.seed(config_map("c")).await.unwrap();
    let components = vec![
        component("a", &[]).build(),
        component("c", &["a"]).disabled_when(|_: &Declaration| true).build(),
        component("d", &["c"]).build(),
    ];
    let reconciler = reconciler(Fixture::new(components), &cluster, fast_config());

    let summary = reconcile(&reconciler, None).await;

    assert!(summary.is_converged());
    assert_eq!(summary.state_of("c"), Some(ComponentState::Disabled));
    assert_eq!(summary.state_of("d"), Some(ComponentState::Verified));
    assert!(cluster.object(&identity("c")).await.is_none());
    assert_eq!(cluster.call_counts().disable, 1);
}

#[tokio::test]
async fn given_precondition_not_met_when_reconciling_then_incomplete_not_failed() {
    let cluster = Arc::new(InMemoryCluster::new());
    let components = vec![
        component("a", &[]).build(),
        ComponentSpec::builder("b")
            .after("a")
            .renderer(|_: &Declaration| -> keel_core::Result<Vec<Manifest>> {
                Err(keel_core::Error::precondition_not_met("b", "tls secret not issued"))
            })
            .build(),
    ];
    let reconciler = reconciler(Fixture::new(components), &cluster, fast_config());

    let summary = reconcile(&reconciler, None).await;

    assert_eq!(summary.deploy, Some(PhaseResult::Incomplete));
    assert_eq!(summary.result, Some(PhaseResult::Incomplete));
    assert_eq!(summary.state_of("b"), Some(ComponentState::Pending));
    assert_eq!(summary.requeue.unwrap().reason, RequeueReason::NotReady);
}

#[tokio::test]
async fn given_outcome_log_when_serialized_then_states_are_uppercase() {
    let cluster = Arc::new(InMemoryCluster::new());
    let reconciler = reconciler(Fixture::new(diamond()), &cluster, fast_config());
    let summary = reconcile(&reconciler, None).await;

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["result"], "SUCCESS");
    let states: HashMap<String, String> = summary
        .records
        .iter()
        .filter(|r| r.phase == Phase::Verify)
        .map(|r| {
            let state = serde_json::to_value(r.state).unwrap();
            (r.component.clone(), state.as_str().unwrap().to_string())
        })
        .collect();
    assert!(states.values().all(|s| s == "VERIFIED"));
}
