//! Error types for the reconciler crate.

use keel_core::ResourceIdentity;
use keel_dag::DagError;
use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by the cluster-access collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccessError {
    /// The cluster API could not be reached.
    #[error("cluster unavailable: {reason}")]
    Unavailable { reason: String },

    /// Optimistic-concurrency conflict on an object.
    #[error("conflict on {resource}: {reason}")]
    Conflict {
        resource: ResourceIdentity,
        reason: String,
    },

    /// The cluster refused the request (validation, admission, permissions).
    #[error("request for {resource} rejected: {reason}")]
    Rejected {
        resource: ResourceIdentity,
        reason: String,
    },
}

impl AccessError {
    #[must_use]
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn conflict(resource: &ResourceIdentity, reason: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.clone(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn rejected(resource: &ResourceIdentity, reason: impl Into<String>) -> Self {
        Self::Rejected {
            resource: resource.clone(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same request may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Conflict { .. })
    }
}

/// Errors that abort a whole reconciliation before any cluster mutation.
///
/// Node-local failures never surface here; they are recorded per component
/// in the reconciliation summary instead.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Configuration or declaration rejected.
    #[error(transparent)]
    Core(#[from] keel_core::Error),

    /// The component graph could not be built.
    #[error("graph build failed: {0}")]
    Build(#[from] DagError),

    /// A component tried an illegal lifecycle move.
    #[error("component '{component}' cannot move from {from} to {to}")]
    InvalidTransition {
        component: String,
        from: String,
        to: String,
    },
}

impl Error {
    #[must_use]
    pub fn invalid_transition(
        component: impl Into<String>,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            component: component.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Whether the error is a graph build error.
    #[must_use]
    pub const fn is_build(&self) -> bool {
        matches!(self, Self::Build(_))
    }

    /// Whether the error is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Core(e) if e.is_configuration())
    }
}
