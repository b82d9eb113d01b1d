//! Readiness checks keyed by resource kind.
//!
//! A check inspects an observed object and answers whether it is ready.
//! Kinds without a registered check fall back to [`ExistenceCheck`]: the
//! object being there is enough.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use keel_core::{Error, Manifest, Result};
use serde_json::Value;

/// Answer of a readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(String),
}

impl Readiness {
    #[must_use]
    pub fn not_ready(reason: impl Into<String>) -> Self {
        Self::NotReady(reason.into())
    }

    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::NotReady(reason) => write!(f, "not ready: {reason}"),
        }
    }
}

/// Predicate over an observed object.
pub trait ReadinessCheck: Send + Sync {
    /// Inspect an observed object.
    ///
    /// # Errors
    ///
    /// Returns an error when the object is malformed in a way that will not
    /// fix itself; the component is then failed rather than requeued.
    fn is_ready(&self, observed: &Manifest) -> Result<Readiness>;
}

impl<F> ReadinessCheck for F
where
    F: Fn(&Manifest) -> Result<Readiness> + Send + Sync,
{
    fn is_ready(&self, observed: &Manifest) -> Result<Readiness> {
        self(observed)
    }
}

/// Ready as soon as the object exists.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExistenceCheck;

impl ReadinessCheck for ExistenceCheck {
    fn is_ready(&self, _observed: &Manifest) -> Result<Readiness> {
        Ok(Readiness::Ready)
    }
}

/// Ready when the latest condition of a type has status `True` (and,
/// optionally, a given reason).
#[derive(Debug, Clone)]
pub struct ConditionCheck {
    condition_type: String,
    reason: Option<String>,
}

impl ConditionCheck {
    #[must_use]
    pub fn new(condition_type: impl Into<String>) -> Self {
        Self {
            condition_type: condition_type.into(),
            reason: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

impl ReadinessCheck for ConditionCheck {
    fn is_ready(&self, observed: &Manifest) -> Result<Readiness> {
        let conditions = match observed.pointer("/status/conditions") {
            None | Some(Value::Null) => {
                return Ok(Readiness::not_ready("no status conditions reported"));
            }
            Some(Value::Array(conditions)) => conditions,
            Some(_) => {
                return Err(Error::readiness_failed(
                    object_name(observed),
                    "status.conditions is not a list",
                ));
            }
        };

        let Some(latest) = latest_condition(conditions, &self.condition_type) else {
            return Ok(Readiness::not_ready(format!(
                "condition {} not reported",
                self.condition_type
            )));
        };

        let status = latest.get("status").and_then(Value::as_str).unwrap_or("");
        if !status.eq_ignore_ascii_case("true") {
            return Ok(Readiness::not_ready(format!(
                "condition {} is {}",
                self.condition_type,
                if status.is_empty() { "unknown" } else { status }
            )));
        }

        if let Some(expected) = &self.reason {
            let reason = latest.get("reason").and_then(Value::as_str).unwrap_or("");
            if reason != expected {
                return Ok(Readiness::not_ready(format!(
                    "condition {} has reason '{reason}', waiting for '{expected}'",
                    self.condition_type
                )));
            }
        }

        Ok(Readiness::Ready)
    }
}

/// Ready when every inner check is ready. Reports the first that is not.
pub struct AllOf(Vec<Arc<dyn ReadinessCheck>>);

impl AllOf {
    #[must_use]
    pub fn new(checks: Vec<Arc<dyn ReadinessCheck>>) -> Self {
        Self(checks)
    }
}

impl ReadinessCheck for AllOf {
    fn is_ready(&self, observed: &Manifest) -> Result<Readiness> {
        for check in &self.0 {
            let readiness = check.is_ready(observed)?;
            if !readiness.is_ready() {
                return Ok(readiness);
            }
        }
        Ok(Readiness::Ready)
    }
}

/// Ready when `status.readyReplicas` has caught up with `status.replicas`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicaCheck;

impl ReadinessCheck for ReplicaCheck {
    fn is_ready(&self, observed: &Manifest) -> Result<Readiness> {
        let Some(wanted) = observed.pointer("/status/replicas").and_then(Value::as_i64) else {
            return Ok(Readiness::not_ready("replica count not reported"));
        };
        let ready = observed
            .pointer("/status/readyReplicas")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if ready == wanted {
            Ok(Readiness::Ready)
        } else {
            Ok(Readiness::not_ready(format!("{ready}/{wanted} replicas ready")))
        }
    }
}

/// Latest condition of a type by `lastTransitionTime`; entries without a
/// parseable timestamp sort first, later entries win ties.
fn latest_condition<'a>(conditions: &'a [Value], condition_type: &str) -> Option<&'a Value> {
    conditions
        .iter()
        .filter(|c| c.get("type").and_then(Value::as_str) == Some(condition_type))
        .max_by_key(|c| {
            c.get("lastTransitionTime")
                .and_then(Value::as_str)
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                .map(|t| t.with_timezone(&Utc))
        })
}

fn object_name(observed: &Manifest) -> String {
    keel_core::ResourceIdentity::from_manifest(observed)
        .map_or_else(|_| "object".to_string(), |id| id.to_string())
}

/// Capability lookup from kind to readiness check.
#[derive(Clone)]
pub struct ReadinessRegistry {
    checks: HashMap<String, Arc<dyn ReadinessCheck>>,
    fallback: Arc<dyn ReadinessCheck>,
}

impl Default for ReadinessRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for ReadinessRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&String> = self.checks.keys().collect();
        kinds.sort();
        f.debug_struct("ReadinessRegistry")
            .field("kinds", &kinds)
            .finish_non_exhaustive()
    }
}

impl ReadinessRegistry {
    /// Only the existence fallback.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            checks: HashMap::new(),
            fallback: Arc::new(ExistenceCheck),
        }
    }

    /// Checks for the common workload kinds.
    #[must_use]
    pub fn with_builtins() -> Self {
        Self::empty()
            .register("Pod", ConditionCheck::new("Ready"))
            .register("Job", ConditionCheck::new("Complete"))
            .register(
                "Deployment",
                AllOf::new(vec![
                    Arc::new(ConditionCheck::new("Available")),
                    Arc::new(
                        ConditionCheck::new("Progressing").with_reason("NewReplicaSetAvailable"),
                    ),
                ]),
            )
            .register("StatefulSet", ReplicaCheck)
    }

    #[must_use]
    pub fn register(
        mut self,
        kind: impl Into<String>,
        check: impl ReadinessCheck + 'static,
    ) -> Self {
        self.checks.insert(kind.into(), Arc::new(check));
        self
    }

    /// Check for a kind, or the fallback.
    #[must_use]
    pub fn check_for(&self, kind: &str) -> Arc<dyn ReadinessCheck> {
        self.checks
            .get(kind)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}
