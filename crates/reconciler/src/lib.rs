//! Dependency-ordered reconciliation of a governing declaration.
//!
//! A [`Controller`] registers the components a declaration needs. The
//! components are compiled into a dependency graph, then rolled out in two
//! phases:
//!
//! - **Deploy**: render each component, diff it against the cluster and apply
//!   only what differs.
//! - **Verify**: poll readiness of what was deployed.
//!
//! Each phase walks the graph level by level on a bounded worker pool. A
//! failed component blocks everything that depends on it; a component that
//! is not ready yet makes the reconciliation incomplete and produces a
//! [`RequeueToken`] for the trigger.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use keel_reconciler::{Controller, ComponentRegistry, ComponentSpec, InMemoryCluster,
//!     NoHooks, PhaseHooks, Reconciler};
//!
//! struct Platform;
//! impl PhaseHooks for Platform {}
//! impl Controller for Platform {
//!     fn setup(
//!         &self,
//!         _: &Declaration,
//!         registry: &mut ComponentRegistry,
//!     ) -> keel_core::Result<()> {
//!         registry.add(ComponentSpec::builder("db").build());
//!         registry.add(ComponentSpec::builder("api").after("db").build());
//!         Ok(())
//!     }
//! }
//!
//! let reconciler = Reconciler::builder()
//!     .with_controller(Arc::new(Platform))
//!     .with_cluster(Arc::new(InMemoryCluster::new()))
//!     .build()?;
//! let summary = reconciler.reconcile(declaration, None).await?;
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod cluster;
pub mod controller;
pub mod diff;
pub mod error;
pub mod readiness;
pub mod registry;
pub mod requeue;
pub mod retry;
pub mod rollout;
pub mod session;
pub mod state;
pub mod status;
pub mod transition;

pub use cluster::{AccessResult, CallCounts, ClusterAccess, InMemoryCluster};
pub use controller::{Controller, Reconciler, ReconcilerBuilder};
pub use diff::{MergeKeys, PatchOp, Plan};
pub use error::{AccessError, Error, Result};
pub use readiness::{Readiness, ReadinessCheck, ReadinessRegistry};
pub use registry::{ComponentBuilder, ComponentRegistry, ComponentSpec, Renderer, StaticManifests};
pub use requeue::{RequeueReason, RequeueToken};
pub use retry::RetryPolicy;
pub use rollout::{
    NoHooks, PhaseExecutor, PhaseHooks, PhaseReport, PhaseResult, RolloutManager, RolloutReport,
    run_phase,
};
pub use session::{OutcomeRecord, ReconciliationId, ReconciliationSummary, Session};
pub use state::{ComponentState, FailureCause, NodeOutcome, Phase};
pub use status::{
    ApplicationStatus, ComponentStatus, Condition, ConditionStatus, ReadyReason, ServiceState,
    UpdatingReason,
};
