//! Per-reconciliation context.
//!
//! A [`Session`] is assembled once per reconciliation and handed to every
//! transition explicitly. Besides the immutable inputs it holds the live
//! lifecycle state of each component and an append-only outcome log. Only
//! the workers of the level currently executing touch either, and levels
//! are serialized by the rollout barrier.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use keel_core::{Declaration, ResourceIdentity, RolloutConfig};
use keel_dag::{DependencyGraph, GraphNode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use ulid::Ulid;

use crate::cluster::ClusterAccess;
use crate::diff::MergeKeys;
use crate::error::{Error, Result};
use crate::readiness::{ReadinessCheck, ReadinessRegistry};
use crate::registry::ComponentSpec;
use crate::requeue::RequeueToken;
use crate::retry::RetryPolicy;
use crate::rollout::PhaseResult;
use crate::state::{ComponentState, FailureCause, NodeOutcome, Phase};

/// Unique id of one reconciliation, sortable by start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReconciliationId(Ulid);

impl ReconciliationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ReconciliationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReconciliationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry of the outcome log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub component: String,
    pub phase: Phase,
    pub state: ComponentState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,
}

/// Per-reconciliation context threaded through every transition.
pub struct Session {
    id: ReconciliationId,
    declaration: Arc<Declaration>,
    graph: Arc<DependencyGraph<ComponentSpec>>,
    cluster: Arc<dyn ClusterAccess>,
    readiness: Arc<ReadinessRegistry>,
    config: Arc<RolloutConfig>,
    merge_keys: MergeKeys,
    retry: RetryPolicy,
    prior_verify_attempts: BTreeMap<String, u32>,
    states: Mutex<HashMap<String, ComponentState>>,
    log: Mutex<Vec<OutcomeRecord>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("declaration", self.declaration.identity())
            .field("components", &self.graph.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    #[must_use]
    pub fn new(
        declaration: Declaration,
        graph: DependencyGraph<ComponentSpec>,
        cluster: Arc<dyn ClusterAccess>,
        config: Arc<RolloutConfig>,
    ) -> Self {
        let states = graph
            .nodes()
            .map(|(_, c)| (c.name().to_string(), ComponentState::Pending))
            .collect();
        Self {
            id: ReconciliationId::new(),
            declaration: Arc::new(declaration),
            graph: Arc::new(graph),
            cluster,
            readiness: Arc::new(ReadinessRegistry::with_builtins()),
            merge_keys: MergeKeys::from_config(&config.merge_keys),
            retry: RetryPolicy::from_config(&config),
            config,
            prior_verify_attempts: BTreeMap::new(),
            states: Mutex::new(states),
            log: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: ReconciliationId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_readiness(mut self, readiness: Arc<ReadinessRegistry>) -> Self {
        self.readiness = readiness;
        self
    }

    /// Continue verify attempt counters carried by a requeue token.
    #[must_use]
    pub fn with_prior_verify_attempts(mut self, attempts: BTreeMap<String, u32>) -> Self {
        self.prior_verify_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn id(&self) -> ReconciliationId {
        self.id
    }

    #[must_use]
    pub fn declaration(&self) -> &Declaration {
        &self.declaration
    }

    #[must_use]
    pub fn graph(&self) -> &DependencyGraph<ComponentSpec> {
        &self.graph
    }

    #[must_use]
    pub fn cluster(&self) -> &dyn ClusterAccess {
        self.cluster.as_ref()
    }

    #[must_use]
    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    #[must_use]
    pub const fn merge_keys(&self) -> &MergeKeys {
        &self.merge_keys
    }

    #[must_use]
    pub const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    #[must_use]
    pub const fn prior_verify_attempts(&self) -> &BTreeMap<String, u32> {
        &self.prior_verify_attempts
    }

    /// Not-ready polls a component spent in earlier reconciliations.
    #[must_use]
    pub fn prior_verify_attempts_of(&self, component: &str) -> u32 {
        self.prior_verify_attempts
            .get(component)
            .copied()
            .unwrap_or(0)
    }

    /// Readiness check for a resource of a component: the component's
    /// override, else the check registered for its kind.
    #[must_use]
    pub fn readiness_for(&self, component: &ComponentSpec, kind: &str) -> Arc<dyn ReadinessCheck> {
        component
            .readiness_override()
            .unwrap_or_else(|| self.readiness.check_for(kind))
    }

    /// Move a component to `next`, refusing illegal lifecycle moves.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidTransition` if the move is not allowed from
    /// the current state.
    pub async fn advance(&self, component: &str, next: ComponentState) -> Result<()> {
        let mut states = self.states.lock().await;
        let current = states
            .get(component)
            .copied()
            .unwrap_or(ComponentState::Pending);
        if current != next && !current.can_transition_to(next) {
            return Err(Error::invalid_transition(component, current, next));
        }
        debug!(component, from = %current, to = %next, "State transition");
        states.insert(component.to_string(), next);
        Ok(())
    }

    pub async fn state_of(&self, component: &str) -> Option<ComponentState> {
        self.states.lock().await.get(component).copied()
    }

    /// Append a terminal phase outcome to the log.
    pub async fn record(&self, phase: Phase, component: &str, outcome: &NodeOutcome) {
        let state = outcome.state(phase);
        self.states.lock().await.insert(component.to_string(), state);
        self.log.lock().await.push(OutcomeRecord {
            component: component.to_string(),
            phase,
            state,
            attempts: outcome.attempts(),
            error: outcome.detail(),
            cause: outcome.failure_cause(),
        });
    }

    pub async fn records(&self) -> Vec<OutcomeRecord> {
        self.log.lock().await.clone()
    }
}

/// Everything a reconciliation hands back to its trigger.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationSummary {
    pub id: ReconciliationId,
    pub declaration: ResourceIdentity,
    pub generation: i64,
    /// Version the declaration asked for, if it names one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// The declaration carried the pause annotation; nothing ran.
    pub paused: bool,
    pub deploy: Option<PhaseResult>,
    pub verify: Option<PhaseResult>,
    /// Combined result of both phases.
    pub result: Option<PhaseResult>,
    pub records: Vec<OutcomeRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hook_errors: Vec<String>,
    pub requeue: Option<RequeueToken>,
}

impl ReconciliationSummary {
    /// Summary of a reconciliation skipped because of the pause annotation.
    #[must_use]
    pub fn paused(id: ReconciliationId, declaration: &Declaration) -> Self {
        Self {
            id,
            declaration: declaration.identity().clone(),
            generation: declaration.generation(),
            version: declaration.version().map(str::to_string),
            paused: true,
            deploy: None,
            verify: None,
            result: None,
            records: Vec::new(),
            hook_errors: Vec::new(),
            requeue: None,
        }
    }

    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.result == Some(PhaseResult::Success)
    }

    /// Outcome recorded for a component in a phase.
    #[must_use]
    pub fn record(&self, component: &str, phase: Phase) -> Option<&OutcomeRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.component == component && r.phase == phase)
    }

    /// Final state of a component, from its last record.
    #[must_use]
    pub fn state_of(&self, component: &str) -> Option<ComponentState> {
        self.records
            .iter()
            .rev()
            .find(|r| r.component == component)
            .map(|r| r.state)
    }
}
