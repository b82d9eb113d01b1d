//! Requeue signalling back to the trigger.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use keel_core::RolloutConfig;
use serde::{Deserialize, Serialize};

use crate::rollout::{PhaseReport, PhaseResult};
use crate::state::NodeOutcome;

/// Why another reconciliation is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequeueReason {
    /// Some components are still converging.
    NotReady,
    /// The rollout failed and should be retried later.
    RolloutFailed,
}

impl fmt::Display for RequeueReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotReady => write!(f, "not ready"),
            Self::RolloutFailed => write!(f, "rollout failed"),
        }
    }
}

/// Request to run the reconciliation again after `delay`.
///
/// The token carries the not-ready poll counters of the verify phase so the
/// next reconciliation of the same generation can enforce the verify ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeueToken {
    #[serde(with = "duration_secs")]
    pub delay: Duration,
    pub reason: RequeueReason,
    pub generation: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub verify_attempts: BTreeMap<String, u32>,
}

impl RequeueToken {
    #[must_use]
    pub const fn new(delay: Duration, reason: RequeueReason, generation: i64) -> Self {
        Self {
            delay,
            reason,
            generation,
            verify_attempts: BTreeMap::new(),
        }
    }

    /// Counters to continue from, or none if the declaration changed since.
    #[must_use]
    pub fn carried_attempts(&self, generation: i64) -> BTreeMap<String, u32> {
        if self.generation == generation {
            self.verify_attempts.clone()
        } else {
            BTreeMap::new()
        }
    }

    /// Token for a finished rollout; `None` once everything converged.
    #[must_use]
    pub fn for_rollout(
        result: PhaseResult,
        config: &RolloutConfig,
        generation: i64,
        carried: BTreeMap<String, u32>,
        verify: Option<&PhaseReport>,
    ) -> Option<Self> {
        let reason = match result {
            PhaseResult::Success => return None,
            PhaseResult::Incomplete => RequeueReason::NotReady,
            PhaseResult::Failed => RequeueReason::RolloutFailed,
        };

        let mut verify_attempts = carried;
        for (name, outcome) in verify.map(|r| r.outcomes.as_slice()).unwrap_or_default() {
            match outcome {
                NodeOutcome::NotReady { attempts, .. } => {
                    verify_attempts.insert(name.clone(), *attempts);
                }
                NodeOutcome::Succeeded { .. } | NodeOutcome::Failed { .. } => {
                    verify_attempts.remove(name);
                }
                NodeOutcome::Blocked { .. } | NodeOutcome::Skipped { .. } => {}
            }
        }

        Some(Self {
            delay: config.requeue_delay(),
            reason,
            generation,
            verify_attempts,
        })
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
