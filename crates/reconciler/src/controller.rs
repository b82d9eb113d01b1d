//! Controller seam and the reconciliation entry point.

use std::sync::Arc;

use keel_core::{Declaration, Error as CoreError, RolloutConfig};
use tracing::{error, info, instrument, warn};

use crate::cluster::ClusterAccess;
use crate::error::Result;
use crate::readiness::ReadinessRegistry;
use crate::registry::ComponentRegistry;
use crate::requeue::RequeueToken;
use crate::rollout::{PhaseHooks, RolloutManager};
use crate::session::{ReconciliationId, ReconciliationSummary, Session};

/// Application-specific part of an operator: which components exist for a
/// declaration, plus optional post-phase hooks.
pub trait Controller: PhaseHooks {
    /// Register the components (and extra ordering edges) for `declaration`.
    ///
    /// # Errors
    ///
    /// Any error aborts the reconciliation before the cluster is touched.
    fn setup(
        &self,
        declaration: &Declaration,
        registry: &mut ComponentRegistry,
    ) -> keel_core::Result<()>;
}

/// Runs reconciliations for one controller against one cluster.
pub struct Reconciler {
    controller: Arc<dyn Controller>,
    cluster: Arc<dyn ClusterAccess>,
    readiness: Arc<ReadinessRegistry>,
    config: Arc<RolloutConfig>,
}

impl Reconciler {
    #[must_use]
    pub fn builder() -> ReconcilerBuilder {
        ReconcilerBuilder::new()
    }

    #[must_use]
    pub fn config(&self) -> &RolloutConfig {
        &self.config
    }

    /// Reconcile `declaration` once.
    ///
    /// `prior` is the requeue token returned by the previous reconciliation
    /// of the same declaration, if any.
    ///
    /// # Errors
    ///
    /// Fails without touching the cluster when the declaration's version is
    /// rejected, controller setup fails, or the component graph is invalid.
    /// Component-level failures are reported in the summary instead.
    pub async fn reconcile(
        &self,
        declaration: Declaration,
        prior: Option<&RequeueToken>,
    ) -> Result<ReconciliationSummary> {
        self.run(ReconciliationId::new(), declaration, prior).await
    }

    #[instrument(
        name = "reconcile",
        skip_all,
        fields(id = %id, declaration = %declaration.identity())
    )]
    async fn run(
        &self,
        id: ReconciliationId,
        declaration: Declaration,
        prior: Option<&RequeueToken>,
    ) -> Result<ReconciliationSummary> {
        let identity = declaration.identity().clone();
        let generation = declaration.generation();

        if declaration.is_paused() {
            info!("Execution paused by annotation");
            return Ok(ReconciliationSummary::paused(id, &declaration));
        }

        self.config
            .check_version(declaration.version())
            .inspect_err(|e| warn!(error = %e, "Version rejected"))?;

        let mut registry = ComponentRegistry::new();
        self.controller
            .setup(&declaration, &mut registry)
            .inspect_err(|e| error!(error = %e, "Setup failed"))?;

        let graph = registry
            .into_graph(&declaration, &self.config)
            .inspect_err(|e| error!(error = %e, "Invalid component graph"))?;
        info!(
            generation,
            components = graph.len(),
            levels = ?graph.level_names(),
            "Reconciliation started"
        );

        let version = declaration.version().map(str::to_string);
        let carried = prior
            .map(|token| token.carried_attempts(generation))
            .unwrap_or_default();
        let session = Arc::new(
            Session::new(
                declaration,
                graph,
                Arc::clone(&self.cluster),
                Arc::clone(&self.config),
            )
            .with_id(id)
            .with_readiness(Arc::clone(&self.readiness))
            .with_prior_verify_attempts(carried.clone()),
        );

        let report = RolloutManager::new(Arc::clone(&session))
            .rollout(self.controller.as_ref())
            .await;
        let result = report.result();
        let requeue = RequeueToken::for_rollout(
            result,
            &self.config,
            generation,
            carried,
            report.verify.as_ref(),
        );

        info!(
            result = %result,
            requeue_secs = requeue.as_ref().map(|t| t.delay.as_secs()),
            "Reconciliation finished"
        );

        Ok(ReconciliationSummary {
            id,
            declaration: identity,
            generation,
            version,
            paused: false,
            deploy: Some(report.deploy.result),
            verify: report.verify.as_ref().map(|v| v.result),
            result: Some(result),
            records: session.records().await,
            hook_errors: report.hook_errors,
            requeue,
        })
    }
}

/// Builder for [`Reconciler`].
pub struct ReconcilerBuilder {
    controller: Option<Arc<dyn Controller>>,
    cluster: Option<Arc<dyn ClusterAccess>>,
    readiness: Arc<ReadinessRegistry>,
    config: RolloutConfig,
}

impl ReconcilerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            controller: None,
            cluster: None,
            readiness: Arc::new(ReadinessRegistry::with_builtins()),
            config: RolloutConfig::default(),
        }
    }

    #[must_use]
    pub fn with_controller(mut self, controller: Arc<dyn Controller>) -> Self {
        self.controller = Some(controller);
        self
    }

    #[must_use]
    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterAccess>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Replace the kind-to-readiness table.
    #[must_use]
    pub fn with_readiness(mut self, readiness: ReadinessRegistry) -> Self {
        self.readiness = Arc::new(readiness);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: RolloutConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the controller or cluster is missing or the
    /// configuration does not validate.
    pub fn build(self) -> Result<Reconciler> {
        self.config.validate()?;
        let controller = self
            .controller
            .ok_or_else(|| CoreError::invalid_config("no controller set"))?;
        let cluster = self
            .cluster
            .ok_or_else(|| CoreError::invalid_config("no cluster access set"))?;
        Ok(Reconciler {
            controller,
            cluster,
            readiness: self.readiness,
            config: Arc::new(self.config),
        })
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
