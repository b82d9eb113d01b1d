//! Component state-machine transitions.
//!
//! Each transition drives one component through one phase and always
//! returns a [`NodeOutcome`]; node-local errors never escape.

use std::fmt;

use keel_core::{Manifest, ResourceIdentity};
use keel_dag::GraphNode;
use tracing::{debug, info, warn};

use crate::diff;
use crate::error::AccessError;
use crate::readiness::Readiness;
use crate::registry::ComponentSpec;
use crate::session::Session;
use crate::state::{ComponentState, FailureCause, NodeOutcome};

/// Deploy: render, diff against the cluster, apply what differs.
/// Components whose disable predicate holds are disabled instead.
pub async fn deploy(session: &Session, component: &ComponentSpec) -> NodeOutcome {
    let name = component.name();
    if component.is_disabled(session.declaration()) {
        return disable(session, component).await;
    }
    if let Err(e) = session.advance(name, ComponentState::Deploying).await {
        return NodeOutcome::failed(e, 0);
    }

    let manifests = match component.render(session.declaration()) {
        Ok(manifests) => manifests,
        Err(e) if e.is_expected() => {
            info!(component = name, reason = %e, "Deploy deferred");
            return deferred(session, name, e.to_string(), 0).await;
        }
        Err(e) => return fail(session, name, e, 0).await,
    };

    let mut attempts: u32 = 0;
    for desired in &manifests {
        let identity = match ResourceIdentity::from_manifest(desired) {
            Ok(identity) => identity,
            Err(e) => return fail(session, name, e, attempts).await,
        };
        let identity = &identity;
        let outcome = session
            .retry_policy()
            .run("apply", move || apply_once(session, identity, desired))
            .await;
        attempts = attempts.saturating_add(outcome.attempts);
        if let Err(e) = outcome.result {
            return cluster_failed(session, name, e, attempts).await;
        }
    }

    match session.advance(name, ComponentState::Deployed).await {
        Ok(()) => NodeOutcome::succeeded(ComponentState::Deployed, attempts),
        Err(e) => fail(session, name, e, attempts).await,
    }
}

/// Read, plan, and apply unless the plan is empty. The read happens inside
/// the retried unit so a conflict is retried against fresh state.
async fn apply_once(
    session: &Session,
    identity: &ResourceIdentity,
    desired: &Manifest,
) -> Result<(), AccessError> {
    let observed = session.cluster().get(identity).await?;
    let plan = diff::plan_with(desired, observed.as_ref(), session.merge_keys());
    if plan.is_noop() {
        debug!(resource = %identity, "Already converged");
        return Ok(());
    }
    debug!(resource = %identity, plan = plan.kind(), "Applying");
    session.cluster().apply(identity, &plan).await?;
    Ok(())
}

/// Verify: one readiness poll per resource. Not-ready polls accumulate
/// across requeues of the same generation; crossing the ceiling fails.
pub async fn verify(session: &Session, component: &ComponentSpec) -> NodeOutcome {
    let name = component.name();
    if component.is_disabled(session.declaration()) {
        return NodeOutcome::succeeded(ComponentState::Disabled, 0);
    }
    if let Err(e) = session.advance(name, ComponentState::Verifying).await {
        return NodeOutcome::failed(e, 0);
    }

    let polls = session.prior_verify_attempts_of(name).saturating_add(1);
    let manifests = match component.render(session.declaration()) {
        Ok(manifests) => manifests,
        Err(e) if e.is_expected() => return not_ready(session, name, e.to_string(), polls).await,
        Err(e) => return fail(session, name, e, polls).await,
    };

    for desired in &manifests {
        let identity = match ResourceIdentity::from_manifest(desired) {
            Ok(identity) => identity,
            Err(e) => return fail(session, name, e, polls).await,
        };
        let identity = &identity;
        let observed = session
            .retry_policy()
            .run("get", move || session.cluster().get(identity))
            .await;

        let observed = match observed.result {
            Ok(Some(observed)) => observed,
            Ok(None) => {
                return not_ready(session, name, format!("{identity} not found"), polls).await;
            }
            Err(e) => return cluster_failed(session, name, e, polls).await,
        };

        let check = session.readiness_for(component, &identity.kind);
        match check.is_ready(&observed) {
            Ok(Readiness::Ready) => debug!(component = name, resource = %identity, "Ready"),
            Ok(Readiness::NotReady(reason)) => {
                return not_ready(session, name, format!("{identity}: {reason}"), polls).await;
            }
            Err(e) => return fail(session, name, e, polls).await,
        }
    }

    match session.advance(name, ComponentState::Verified).await {
        Ok(()) => NodeOutcome::succeeded(ComponentState::Verified, polls),
        Err(e) => fail(session, name, e, polls).await,
    }
}

/// Disable: remove every owned resource, then mark the component disabled.
pub async fn disable(session: &Session, component: &ComponentSpec) -> NodeOutcome {
    let name = component.name();
    let manifests = match component.render(session.declaration()) {
        Ok(manifests) => manifests,
        Err(e) if e.is_expected() => return deferred(session, name, e.to_string(), 0).await,
        Err(e) => return fail(session, name, e, 0).await,
    };

    let mut attempts: u32 = 0;
    for desired in &manifests {
        let identity = match ResourceIdentity::from_manifest(desired) {
            Ok(identity) => identity,
            Err(e) => return fail(session, name, e, attempts).await,
        };
        let identity = &identity;
        let outcome = session
            .retry_policy()
            .run("disable", move || session.cluster().disable(identity))
            .await;
        attempts = attempts.saturating_add(outcome.attempts);
        if let Err(e) = outcome.result {
            return cluster_failed(session, name, e, attempts).await;
        }
    }

    info!(component = name, resources = manifests.len(), "Component disabled");
    match session.advance(name, ComponentState::Disabled).await {
        Ok(()) => NodeOutcome::succeeded(ComponentState::Disabled, attempts),
        Err(e) => fail(session, name, e, attempts).await,
    }
}

async fn fail(
    session: &Session,
    name: &str,
    error: impl fmt::Display + Send + Sync,
    attempts: u32,
) -> NodeOutcome {
    mark_failed(session, name, &error, attempts, FailureCause::Component).await;
    NodeOutcome::failed(error, attempts)
}

async fn cluster_failed(
    session: &Session,
    name: &str,
    error: AccessError,
    attempts: u32,
) -> NodeOutcome {
    mark_failed(session, name, &error, attempts, FailureCause::Cluster).await;
    NodeOutcome::cluster_failed(error, attempts)
}

async fn mark_failed(
    session: &Session,
    name: &str,
    error: &(dyn fmt::Display + Sync),
    attempts: u32,
    cause: FailureCause,
) {
    warn!(component = name, attempts, error = %error, ?cause, "Component failed");
    if let Err(e) = session.advance(name, ComponentState::Failed).await {
        debug!(component = name, error = %e, "State already terminal");
    }
}

/// Precondition not met during deploy: back to pending, try next time.
async fn deferred(session: &Session, name: &str, reason: String, attempts: u32) -> NodeOutcome {
    if let Err(e) = session.advance(name, ComponentState::Pending).await {
        debug!(component = name, error = %e, "Could not return to pending");
    }
    NodeOutcome::not_ready(reason, attempts)
}

async fn not_ready(session: &Session, name: &str, reason: String, polls: u32) -> NodeOutcome {
    let ceiling = session.config().verify_attempt_ceiling;
    if ceiling > 0 && polls >= ceiling {
        return fail(
            session,
            name,
            format!("not ready after {polls} polls: {reason}"),
            polls,
        )
        .await;
    }
    info!(component = name, polls, reason = %reason, "Not ready yet");
    NodeOutcome::not_ready(reason, polls)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::sync::Arc;

    use keel_core::{Declaration, Error, RolloutConfig};
    use keel_dag::DependencyGraph;
    use serde_json::json;

    use crate::cluster::{ClusterAccess, InMemoryCluster};

    fn config_map(name: &str) -> Manifest {
        json!({"apiVersion": "v1", "kind": "ConfigMap",
               "metadata": {"name": name, "namespace": "prod"}, "data": {"k": "v"}})
    }

    fn session_with(
        component: ComponentSpec,
        cluster: Arc<InMemoryCluster>,
        config: RolloutConfig,
    ) -> Session {
        let declaration = Declaration::new(
            ResourceIdentity::new("example.dev/v1", "Platform", Some("prod".into()), "demo"),
            json!({"version": "1.0"}),
        );
        let graph = DependencyGraph::build(vec![component], Vec::new()).unwrap();
        Session::new(declaration, graph, cluster, Arc::new(config))
    }

    fn fast_config() -> RolloutConfig {
        RolloutConfig {
            retry_backoff_ms: 1,
            max_retry_backoff_ms: 2,
            ..RolloutConfig::default()
        }
    }

    #[tokio::test]
    async fn test_deploy_creates_then_noops() {
        let cluster = Arc::new(InMemoryCluster::new());
        let component = ComponentSpec::builder("cfg")
            .manifests(vec![config_map("settings")])
            .build();

        let session = session_with(component.clone(), Arc::clone(&cluster), fast_config());
        let outcome = deploy(&session, &component).await;
        assert_eq!(outcome, NodeOutcome::succeeded(ComponentState::Deployed, 1));
        assert_eq!(cluster.call_counts().apply, 1);

        let again = session_with(component.clone(), Arc::clone(&cluster), fast_config());
        assert!(deploy(&again, &component).await.is_satisfied());
        assert_eq!(cluster.call_counts().apply, 1);
    }

    #[tokio::test]
    async fn test_deploy_exhausts_retries() {
        let cluster = Arc::new(InMemoryCluster::new());
        let manifest = config_map("settings");
        let id = ResourceIdentity::from_manifest(&manifest).unwrap();
        cluster
            .fail_applies(&id, 10, AccessError::unavailable("api down"))
            .await;
        let component = ComponentSpec::builder("cfg").manifests(vec![manifest]).build();

        let session = session_with(component.clone(), Arc::clone(&cluster), fast_config());
        let outcome = deploy(&session, &component).await;
        assert!(matches!(outcome, NodeOutcome::Failed { attempts: 3, .. }));
        assert_eq!(outcome.failure_cause(), Some(FailureCause::Cluster));
        assert_eq!(session.state_of("cfg").await, Some(ComponentState::Failed));
    }

    #[tokio::test]
    async fn test_precondition_defers() {
        let cluster = Arc::new(InMemoryCluster::new());
        let component = ComponentSpec::builder("app")
            .renderer(|_: &Declaration| -> keel_core::Result<Vec<Manifest>> {
                Err(Error::precondition_not_met("app", "password secret missing"))
            })
            .build();
        let session = session_with(component.clone(), cluster, fast_config());
        let outcome = deploy(&session, &component).await;
        assert!(matches!(outcome, NodeOutcome::NotReady { .. }));
        assert_eq!(session.state_of("app").await, Some(ComponentState::Pending));
    }

    #[tokio::test]
    async fn test_disabled_component_removes_resources() {
        let cluster = Arc::new(InMemoryCluster::new());
        let manifest = config_map("legacy");
        let id = cluster.seed(manifest.clone()).await.unwrap();
        let component = ComponentSpec::builder("legacy")
            .manifests(vec![manifest])
            .disabled_when(|_: &Declaration| true)
            .build();

        let session = session_with(component.clone(), Arc::clone(&cluster), fast_config());
        let outcome = deploy(&session, &component).await;
        assert_eq!(outcome, NodeOutcome::succeeded(ComponentState::Disabled, 1));
        assert!(cluster.get(&id).await.unwrap().is_none());
        assert_eq!(
            verify(&session, &component).await,
            NodeOutcome::succeeded(ComponentState::Disabled, 0)
        );
    }

    #[tokio::test]
    async fn test_verify_missing_object_is_not_ready() {
        let cluster = Arc::new(InMemoryCluster::new());
        let component = ComponentSpec::builder("cfg")
            .manifests(vec![config_map("settings")])
            .build();
        let session = session_with(component.clone(), cluster, fast_config());
        session.advance("cfg", ComponentState::Deploying).await.unwrap();
        session.advance("cfg", ComponentState::Deployed).await.unwrap();

        let outcome = verify(&session, &component).await;
        assert!(matches!(outcome, NodeOutcome::NotReady { attempts: 1, .. }));
    }

    #[tokio::test]
    async fn test_verify_ceiling_converts_to_failure() {
        let cluster = Arc::new(InMemoryCluster::new());
        cluster.seed(config_map("settings")).await.unwrap();
        let component = ComponentSpec::builder("cfg")
            .manifests(vec![config_map("settings")])
            .readiness(|_: &Manifest| -> keel_core::Result<Readiness> {
                Ok(Readiness::not_ready("never"))
            })
            .build();
        let config = RolloutConfig {
            verify_attempt_ceiling: 3,
            ..fast_config()
        };
        let session = session_with(component.clone(), cluster, config)
            .with_prior_verify_attempts([("cfg".to_string(), 2)].into_iter().collect());
        session.advance("cfg", ComponentState::Deploying).await.unwrap();
        session.advance("cfg", ComponentState::Deployed).await.unwrap();

        let outcome = verify(&session, &component).await;
        assert!(matches!(outcome, NodeOutcome::Failed { attempts: 3, .. }));
        assert_eq!(outcome.failure_cause(), Some(FailureCause::Component));
    }
}
