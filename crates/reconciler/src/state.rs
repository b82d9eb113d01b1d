//! Component lifecycle states and per-phase outcomes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The two graph traversals of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Deploy,
    Verify,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Deploy => "deploy",
            Self::Verify => "verify",
        };
        write!(f, "{s}")
    }
}

/// Lifecycle state of one component within a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComponentState {
    Pending,
    Deploying,
    Deployed,
    Verifying,
    Verified,
    Failed,
    Blocked,
    Disabled,
}

impl ComponentState {
    /// Check if no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Verified | Self::Failed | Self::Blocked | Self::Disabled
        )
    }

    /// Check if the component can transition to the given state.
    ///
    /// `Deploying -> Pending` covers a precondition that is not met yet.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        use ComponentState::{
            Blocked, Deployed, Deploying, Disabled, Failed, Pending, Verified, Verifying,
        };
        if !self.is_terminal() && matches!(target, Failed | Blocked) {
            return true;
        }
        matches!(
            (self, target),
            (Pending, Deploying)
                | (Pending, Disabled)
                | (Deploying, Deployed)
                | (Deploying, Pending)
                | (Deployed, Verifying)
                | (Verifying, Verified)
        )
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Deploying => "DEPLOYING",
            Self::Deployed => "DEPLOYED",
            Self::Verifying => "VERIFYING",
            Self::Verified => "VERIFIED",
            Self::Failed => "FAILED",
            Self::Blocked => "BLOCKED",
            Self::Disabled => "DISABLED",
        };
        write!(f, "{s}")
    }
}

/// What a failed component ran into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The component itself: rendering, manifests, readiness checks or
    /// an exhausted verify ceiling.
    #[default]
    Component,
    /// Cluster access kept failing after retries.
    Cluster,
}

/// How a component ended one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum NodeOutcome {
    /// Reached `Deployed`, `Verified` or `Disabled`.
    Succeeded { state: ComponentState, attempts: u32 },
    /// Needs more time; drives a requeue, never a failure.
    NotReady { reason: String, attempts: u32 },
    /// Terminated unsuccessfully after retries.
    Failed {
        error: String,
        attempts: u32,
        #[serde(default)]
        cause: FailureCause,
    },
    /// Never started because a dependency failed or was blocked.
    Blocked { by: Vec<String> },
    /// Never started because a dependency is not ready or the phase stopped.
    Skipped { reason: String },
}

impl NodeOutcome {
    #[must_use]
    pub const fn succeeded(state: ComponentState, attempts: u32) -> Self {
        Self::Succeeded { state, attempts }
    }

    #[must_use]
    pub fn not_ready(reason: impl Into<String>, attempts: u32) -> Self {
        Self::NotReady {
            reason: reason.into(),
            attempts,
        }
    }

    #[must_use]
    pub fn failed(error: impl ToString, attempts: u32) -> Self {
        Self::Failed {
            error: error.to_string(),
            attempts,
            cause: FailureCause::Component,
        }
    }

    /// Failure caused by cluster access that outlasted its retries.
    #[must_use]
    pub fn cluster_failed(error: impl ToString, attempts: u32) -> Self {
        Self::Failed {
            error: error.to_string(),
            attempts,
            cause: FailureCause::Cluster,
        }
    }

    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    /// Dependents may proceed.
    #[must_use]
    pub const fn is_satisfied(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Dependents must be blocked.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::Blocked { .. })
    }

    /// Neither done nor failed.
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        matches!(self, Self::NotReady { .. } | Self::Skipped { .. })
    }

    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. }
            | Self::NotReady { attempts, .. }
            | Self::Failed { attempts, .. } => *attempts,
            Self::Blocked { .. } | Self::Skipped { .. } => 0,
        }
    }

    /// Lifecycle state the component is left in after `phase`.
    #[must_use]
    pub const fn state(&self, phase: Phase) -> ComponentState {
        match (self, phase) {
            (Self::Succeeded { state, .. }, _) => *state,
            (Self::NotReady { .. }, Phase::Verify) => ComponentState::Verifying,
            (Self::NotReady { .. } | Self::Skipped { .. }, _) => ComponentState::Pending,
            (Self::Failed { .. }, _) => ComponentState::Failed,
            (Self::Blocked { .. }, _) => ComponentState::Blocked,
        }
    }

    #[must_use]
    pub const fn failure_cause(&self) -> Option<FailureCause> {
        match self {
            Self::Failed { cause, .. } => Some(*cause),
            _ => None,
        }
    }

    /// Human-readable detail for anything but success.
    #[must_use]
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Succeeded { .. } => None,
            Self::NotReady { reason, .. } | Self::Skipped { reason } => Some(reason.clone()),
            Self::Failed { error, .. } => Some(error.clone()),
            Self::Blocked { by } => Some(format!("blocked by {}", by.join(", "))),
        }
    }
}
