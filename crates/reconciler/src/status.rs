//! Declaration status conditions.
//!
//! A declaration's status carries two conditions. `Ready` says whether the
//! components are up and verified; `Updating` says whether a rollout is
//! still moving and, if not, why it stopped. Every function here is pure:
//! callers pass the previous status and the current time, then write the
//! result back wherever the declaration's status lives.
//!
//! Updates follow a carry-forward rule. A condition the update does not
//! set keeps its previous reason and message, and a condition whose
//! status and reason are unchanged keeps its transition time.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::rollout::PhaseResult;
use crate::session::{OutcomeRecord, ReconciliationSummary};
use crate::state::{ComponentState, FailureCause, Phase};

pub const READY_CONDITION: &str = "Ready";
pub const UPDATING_CONDITION: &str = "Updating";

const INITIAL_ROLLOUT: &str = "Initial Rollout Started";
const VERIFY_COMPLETE: &str = "Verify Complete";
const ROLLOUT_COMPLETE: &str = "Rollout Complete";
const VERIFY_IN_PROGRESS: &str = "Verify InProgress";
const VERIFY_INCOMPLETE: &str = "Component verification incomplete";

/// Why the `Ready` condition has its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadyReason {
    Stable,
    Initializing,
    InProgress,
    ConfigError,
    Errored,
}

impl ReadyReason {
    /// `Ready` is true only once everything is verified.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Stable)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "Stable",
            Self::Initializing => "Initializing",
            Self::InProgress => "InProgress",
            Self::ConfigError => "ConfigError",
            Self::Errored => "Errored",
        }
    }

    fn parse(reason: &str) -> Option<Self> {
        [
            Self::Stable,
            Self::Initializing,
            Self::InProgress,
            Self::ConfigError,
            Self::Errored,
        ]
        .into_iter()
        .find(|r| r.as_str() == reason)
    }
}

impl fmt::Display for ReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the `Updating` condition has its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdatingReason {
    Stable,
    PreconditionWait,
    VerifyWait,
    ClusterError,
    Errored,
    VersionChange,
}

impl UpdatingReason {
    /// `Updating` is false when the rollout finished or gave up.
    #[must_use]
    pub const fn is_updating(self) -> bool {
        !matches!(self, Self::Stable | Self::ClusterError | Self::Errored)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "Stable",
            Self::PreconditionWait => "PreconditionWait",
            Self::VerifyWait => "VerifyWait",
            Self::ClusterError => "ClusterError",
            Self::Errored => "Errored",
            Self::VersionChange => "VersionChange",
        }
    }

    fn parse(reason: &str) -> Option<Self> {
        [
            Self::Stable,
            Self::PreconditionWait,
            Self::VerifyWait,
            Self::ClusterError,
            Self::Errored,
            Self::VersionChange,
        ]
        .into_iter()
        .find(|r| r.as_str() == reason)
    }
}

impl fmt::Display for UpdatingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }
}

/// One entry of `status.conditions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    fn same_state(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Component tallies of the latest rollout.
///
/// Disabled components are left out: they are not part of what runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    pub all_components: Vec<String>,
    pub deployed_components: Vec<String>,
    pub unverified_components: Vec<String>,
    pub failed_components: Vec<String>,
    /// `deployed/all`.
    pub deployed: String,
    /// `verified/all`.
    pub verified: String,
}

impl ComponentStatus {
    #[must_use]
    pub fn from_records(records: &[OutcomeRecord]) -> Self {
        let reached = |phase: Phase, state: ComponentState| -> BTreeSet<&str> {
            records
                .iter()
                .filter(|r| r.phase == phase && r.state == state)
                .map(|r| r.component.as_str())
                .collect()
        };
        let disabled = reached(Phase::Deploy, ComponentState::Disabled);
        let all: BTreeSet<&str> = records
            .iter()
            .map(|r| r.component.as_str())
            .filter(|name| !disabled.contains(name))
            .collect();
        let verified = reached(Phase::Verify, ComponentState::Verified);
        let deployed: BTreeSet<&str> = reached(Phase::Deploy, ComponentState::Deployed)
            .union(&verified)
            .copied()
            .collect();
        let failed: BTreeSet<&str> = all
            .iter()
            .copied()
            .filter(|name| {
                records
                    .iter()
                    .rev()
                    .find(|r| r.component == *name)
                    .is_some_and(|r| r.state == ComponentState::Failed)
            })
            .collect();

        let owned = |names: &BTreeSet<&str>| -> Vec<String> {
            names.iter().map(|n| (*n).to_string()).collect()
        };
        Self {
            deployed: format!("{}/{}", deployed.len(), all.len()),
            verified: format!("{}/{}", verified.len(), all.len()),
            all_components: owned(&all),
            unverified_components: owned(&deployed.difference(&verified).copied().collect()),
            deployed_components: owned(&deployed),
            failed_components: owned(&failed),
        }
    }
}

/// Overall state of a declaration, collapsed from its two conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceState {
    Completed,
    InProgress,
    Failed,
}

/// The status a reconciler maintains on a declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_status: Option<ComponentStatus>,
    /// Last version that verified completely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_version: Option<String>,
}

impl ApplicationStatus {
    /// Status at the start of a reconciliation.
    ///
    /// The first rollout (no ready reason yet, or nothing ever reconciled)
    /// is `Initializing`. A declaration asking for a different version than
    /// the one last reconciled starts a `VersionChange`. Anything else keeps
    /// the previous conditions.
    #[must_use]
    pub fn reconcile_started(
        previous: Option<&Self>,
        version: Option<&str>,
        now: DateTime<Utc>,
    ) -> Self {
        let reconciled = previous.and_then(|p| p.reconciled_version.as_deref());
        let prior_ready = previous.and_then(|p| p.condition(READY_CONDITION));
        let ready_message = prior_ready
            .map_or_else(|| INITIAL_ROLLOUT.to_string(), |c| c.message.clone());
        let mut update = StatusUpdate::default();

        update.ready = match (previous.and_then(Self::ready_reason), reconciled) {
            (Some(reason), Some(_)) => Some((reason, ready_message)),
            _ => Some((ReadyReason::Initializing, ready_message)),
        };

        if let (Some(old), Some(new)) = (reconciled, version) {
            if old != new {
                update.ready = update.ready.map(|(_, m)| (ReadyReason::InProgress, m));
                update.updating = Some((
                    UpdatingReason::VersionChange,
                    format!("Version Change Started: [{old}] -> [{new}]"),
                ));
            }
        }

        update.apply(previous, now)
    }

    /// Status after a reconciliation returned a summary.
    ///
    /// A paused reconciliation leaves the status as it was.
    #[must_use]
    pub fn reconcile_finished(
        previous: Option<&Self>,
        summary: &ReconciliationSummary,
        now: DateTime<Utc>,
    ) -> Self {
        if summary.paused {
            return previous.cloned().unwrap_or_default();
        }

        let mut update = StatusUpdate {
            components: Some(ComponentStatus::from_records(&summary.records)),
            ..StatusUpdate::default()
        };

        match summary.result {
            Some(PhaseResult::Success) => {
                update.ready = Some((ReadyReason::Stable, VERIFY_COMPLETE.to_string()));
                update.updating = Some((UpdatingReason::Stable, ROLLOUT_COMPLETE.to_string()));
                update.version = summary.version.clone();
            }
            Some(PhaseResult::Incomplete) => {
                let initializing = previous
                    .and_then(Self::ready_reason)
                    .is_none_or(|r| r == ReadyReason::Initializing);
                if !initializing {
                    update.ready =
                        Some((ReadyReason::InProgress, VERIFY_IN_PROGRESS.to_string()));
                }
                update.updating = Some(match waiting_precondition(&summary.records) {
                    Some(reason) => (UpdatingReason::PreconditionWait, reason),
                    None => (UpdatingReason::VerifyWait, VERIFY_INCOMPLETE.to_string()),
                });
            }
            Some(PhaseResult::Failed) => match cluster_failure(&summary.records) {
                Some(message) => {
                    update.updating = Some((UpdatingReason::ClusterError, message));
                }
                None => {
                    let message = failure_message(summary);
                    update.ready = Some((ReadyReason::Errored, message.clone()));
                    update.updating = Some((UpdatingReason::Errored, message));
                }
            },
            None => {}
        }

        update.apply(previous, now)
    }

    /// Status after a reconciliation was rejected before it touched the
    /// cluster.
    #[must_use]
    pub fn reconcile_failed(previous: Option<&Self>, error: &Error, now: DateTime<Utc>) -> Self {
        let message = error.to_string();
        let mut update = StatusUpdate::default();
        match error {
            e if e.is_configuration() => {
                update.ready = Some((ReadyReason::ConfigError, message.clone()));
                update.updating = Some((UpdatingReason::Errored, message));
            }
            Error::Core(e) if e.is_expected() => {
                update.updating = Some((UpdatingReason::PreconditionWait, message));
            }
            _ => {
                update.ready = Some((ReadyReason::Errored, message.clone()));
                update.updating = Some((UpdatingReason::Errored, message));
            }
        }
        update.apply(previous, now)
    }

    #[must_use]
    pub fn condition(&self, kind: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    #[must_use]
    pub fn ready_reason(&self) -> Option<ReadyReason> {
        self.condition(READY_CONDITION)
            .and_then(|c| ReadyReason::parse(&c.reason))
    }

    #[must_use]
    pub fn updating_reason(&self) -> Option<UpdatingReason> {
        self.condition(UPDATING_CONDITION)
            .and_then(|c| UpdatingReason::parse(&c.reason))
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready_reason().is_some_and(ReadyReason::is_ready)
    }

    #[must_use]
    pub fn is_updating(&self) -> bool {
        self.updating_reason()
            .is_some_and(UpdatingReason::is_updating)
    }

    #[must_use]
    pub fn service_state(&self) -> ServiceState {
        match (self.ready_reason(), self.updating_reason()) {
            (Some(ReadyReason::Stable), Some(UpdatingReason::Stable)) => ServiceState::Completed,
            (Some(ReadyReason::Errored | ReadyReason::ConfigError), _)
            | (_, Some(UpdatingReason::Errored | UpdatingReason::ClusterError)) => {
                ServiceState::Failed
            }
            _ => ServiceState::InProgress,
        }
    }

    /// Whether writing `self` over `other` changes anything besides
    /// transition times.
    #[must_use]
    pub fn differs_from(&self, other: &Self) -> bool {
        self.component_status != other.component_status
            || self.reconciled_version != other.reconciled_version
            || self.conditions.len() != other.conditions.len()
            || self
                .conditions
                .iter()
                .zip(&other.conditions)
                .any(|(a, b)| !a.same_state(b))
    }
}

/// Fields one transition sets; everything else carries forward.
#[derive(Default)]
struct StatusUpdate {
    ready: Option<(ReadyReason, String)>,
    updating: Option<(UpdatingReason, String)>,
    components: Option<ComponentStatus>,
    version: Option<String>,
}

impl StatusUpdate {
    fn apply(self, previous: Option<&ApplicationStatus>, now: DateTime<Utc>) -> ApplicationStatus {
        let prior = |kind: &str| previous.and_then(|p| p.condition(kind));
        let ready = self
            .ready
            .map(|(reason, message)| (reason.as_str(), reason.is_ready(), message))
            .or_else(|| carried(prior(READY_CONDITION)));
        let updating = self
            .updating
            .map(|(reason, message)| (reason.as_str(), reason.is_updating(), message))
            .or_else(|| carried(prior(UPDATING_CONDITION)));

        let conditions = [(READY_CONDITION, ready), (UPDATING_CONDITION, updating)]
            .into_iter()
            .filter_map(|(kind, fields)| {
                let (reason, status, message) = fields?;
                Some(condition(prior(kind), kind, reason, status, message, now))
            })
            .collect();

        ApplicationStatus {
            conditions,
            component_status: self
                .components
                .or_else(|| previous.and_then(|p| p.component_status.clone())),
            reconciled_version: self
                .version
                .or_else(|| previous.and_then(|p| p.reconciled_version.clone())),
        }
    }
}

fn carried(condition: Option<&Condition>) -> Option<(&str, bool, String)> {
    condition.map(|c| {
        (
            c.reason.as_str(),
            c.status == ConditionStatus::True,
            c.message.clone(),
        )
    })
}

fn condition(
    prior: Option<&Condition>,
    kind: &str,
    reason: &str,
    status: bool,
    message: String,
    now: DateTime<Utc>,
) -> Condition {
    let status = ConditionStatus::from(status);
    let last_transition_time = prior
        .filter(|p| p.status == status && p.reason == reason)
        .map_or(now, |p| p.last_transition_time);
    Condition {
        kind: kind.to_string(),
        status,
        reason: reason.to_string(),
        message,
        last_transition_time,
    }
}

/// First deferred deploy, which means a precondition is still unmet.
fn waiting_precondition(records: &[OutcomeRecord]) -> Option<String> {
    records
        .iter()
        .find(|r| r.phase == Phase::Deploy && r.state == ComponentState::Pending)
        .map(|r| match &r.error {
            Some(reason) => format!("{}: {reason}", r.component),
            None => format!("{} waiting on a precondition", r.component),
        })
}

/// First component that failed because the cluster kept refusing it.
fn cluster_failure(records: &[OutcomeRecord]) -> Option<String> {
    records
        .iter()
        .find(|r| r.cause == Some(FailureCause::Cluster))
        .map(|r| match &r.error {
            Some(error) => format!("{}: {error}", r.component),
            None => format!("{} failed against the cluster", r.component),
        })
}

fn failure_message(summary: &ReconciliationSummary) -> String {
    summary
        .records
        .iter()
        .find(|r| r.state == ComponentState::Failed)
        .map(|r| match &r.error {
            Some(error) => format!("{}: {error}", r.component),
            None => format!("{} failed", r.component),
        })
        .or_else(|| summary.hook_errors.first().cloned())
        .unwrap_or_else(|| "rollout failed".to_string())
}
