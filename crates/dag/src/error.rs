//! Graph build error types

use thiserror::Error;

/// Errors detected while compiling a dependency graph.
///
/// All of them are fatal for the reconciliation that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DagError {
    #[error("Duplicate component name: {0}")]
    DuplicateName(String),

    #[error("Invalid component name: {reason}")]
    InvalidName { reason: String },

    #[error("Edge {from} -> {to} references undeclared component '{missing}'")]
    DanglingReference {
        from: String,
        to: String,
        missing: String,
    },

    #[error("Self-edge on component: {0}")]
    SelfEdge(String),

    #[error("Cycle detected involving components: {0:?}")]
    CycleDetected(Vec<String>),
}

impl DagError {
    #[must_use]
    pub fn duplicate_name(name: impl Into<String>) -> Self {
        Self::DuplicateName(name.into())
    }

    #[must_use]
    pub fn invalid_name(reason: impl Into<String>) -> Self {
        Self::InvalidName {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn dangling_reference(
        from: impl Into<String>,
        to: impl Into<String>,
        missing: impl Into<String>,
    ) -> Self {
        Self::DanglingReference {
            from: from.into(),
            to: to.into(),
            missing: missing.into(),
        }
    }

    #[must_use]
    pub fn self_edge(name: impl Into<String>) -> Self {
        Self::SelfEdge(name.into())
    }

    #[must_use]
    pub const fn cycle_detected(members: Vec<String>) -> Self {
        Self::CycleDetected(members)
    }
}

/// Result type for graph operations
pub type DagResult<T> = std::result::Result<T, DagError>;
