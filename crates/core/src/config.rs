//! Rollout configuration.
//!
//! Values come from a TOML or JSON file, then `KEEL_*` environment
//! variables override individual fields. Every field has a default, so an
//! empty file is a valid configuration.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::result::Result;

/// Configuration surface of the rollout engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Worker-pool size for the deploy phase.
    #[serde(default = "default_workers")]
    pub deploy_workers: usize,

    /// Worker-pool size for the verify phase.
    #[serde(default = "default_workers")]
    pub verify_workers: usize,

    /// Total attempts per cluster-access operation before the node fails.
    #[serde(default = "default_deploy_retry_ceiling")]
    pub deploy_retry_ceiling: u32,

    /// Initial backoff between attempts in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound on the backoff in milliseconds.
    #[serde(default = "default_max_retry_backoff_ms")]
    pub max_retry_backoff_ms: u64,

    /// Readiness polls a component may spend "not ready" before it is failed
    /// (0 = unbounded). Counted across requeues of the same generation.
    #[serde(default)]
    pub verify_attempt_ceiling: u32,

    /// Delay before an incomplete reconciliation is retried, in seconds.
    #[serde(default = "default_requeue_delay_secs")]
    pub requeue_delay_secs: u64,

    /// Reject declarations whose `spec.version` is not listed below.
    #[serde(default)]
    pub strict_versioning: bool,

    #[serde(default)]
    pub supported_versions: Vec<String>,

    /// Add edges from workloads to the components owning the ConfigMaps and
    /// Secrets they mount.
    #[serde(default = "default_true")]
    pub infer_reference_edges: bool,

    /// Extra list merge keys: dotted field path (or bare field name) to key field.
    #[serde(default)]
    pub merge_keys: BTreeMap<String, String>,
}

const fn default_workers() -> usize {
    8
}

const fn default_deploy_retry_ceiling() -> u32 {
    3
}

const fn default_retry_backoff_ms() -> u64 {
    100
}

const fn default_max_retry_backoff_ms() -> u64 {
    5_000
}

const fn default_requeue_delay_secs() -> u64 {
    10
}

const fn default_true() -> bool {
    true
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            deploy_workers: default_workers(),
            verify_workers: default_workers(),
            deploy_retry_ceiling: default_deploy_retry_ceiling(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            verify_attempt_ceiling: 0,
            requeue_delay_secs: default_requeue_delay_secs(),
            strict_versioning: false,
            supported_versions: Vec::new(),
            infer_reference_edges: default_true(),
            merge_keys: BTreeMap::new(),
        }
    }
}

impl RolloutConfig {
    /// Load configuration from a file. `.json` files are parsed as JSON,
    /// everything else as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;

        if path.extension().is_some_and(|e| e == "json") {
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(toml::from_str(&content)?)
        }
    }

    /// Defaults overridden by the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `KEEL_*` environment variables on top of this configuration.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable values are
    /// ignored and logged.
    #[must_use]
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            let value = raw.trim().parse().ok();
            if value.is_none() {
                debug!(key, value = %raw, "Ignoring unparseable override");
            }
            value
        }

        if let Some(v) = parsed("KEEL_DEPLOY_WORKERS", lookup("KEEL_DEPLOY_WORKERS")) {
            self.deploy_workers = v;
        }
        if let Some(v) = parsed("KEEL_VERIFY_WORKERS", lookup("KEEL_VERIFY_WORKERS")) {
            self.verify_workers = v;
        }
        if let Some(v) = parsed(
            "KEEL_DEPLOY_RETRY_CEILING",
            lookup("KEEL_DEPLOY_RETRY_CEILING"),
        ) {
            self.deploy_retry_ceiling = v;
        }
        if let Some(v) = parsed(
            "KEEL_VERIFY_ATTEMPT_CEILING",
            lookup("KEEL_VERIFY_ATTEMPT_CEILING"),
        ) {
            self.verify_attempt_ceiling = v;
        }
        if let Some(v) = parsed("KEEL_REQUEUE_DELAY_SECS", lookup("KEEL_REQUEUE_DELAY_SECS")) {
            self.requeue_delay_secs = v;
        }
        if let Some(v) = parsed("KEEL_STRICT_VERSIONING", lookup("KEEL_STRICT_VERSIONING")) {
            self.strict_versioning = v;
        }
        if let Some(raw) = lookup("KEEL_SUPPORTED_VERSIONS") {
            self.supported_versions = raw
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
        }
        self
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.deploy_workers == 0 {
            return Err(Error::invalid_config("deploy_workers must be at least 1"));
        }
        if self.verify_workers == 0 {
            return Err(Error::invalid_config("verify_workers must be at least 1"));
        }
        if self.deploy_retry_ceiling == 0 {
            return Err(Error::invalid_config(
                "deploy_retry_ceiling must be at least 1",
            ));
        }
        if self.max_retry_backoff_ms < self.retry_backoff_ms {
            return Err(Error::invalid_config(
                "max_retry_backoff_ms must not be below retry_backoff_ms",
            ));
        }
        if self.strict_versioning && self.supported_versions.is_empty() {
            return Err(Error::invalid_config(
                "strict_versioning requires supported_versions",
            ));
        }
        Ok(())
    }

    /// Reject a declaration version under strict versioning.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingVersion` or `Error::UnsupportedVersion`.
    pub fn check_version(&self, version: Option<&str>) -> Result<()> {
        if !self.strict_versioning {
            return Ok(());
        }
        let version = version.ok_or(Error::MissingVersion)?;
        if self.supported_versions.iter().any(|v| v == version) {
            Ok(())
        } else {
            Err(Error::unsupported_version(version, &self.supported_versions))
        }
    }

    #[must_use]
    pub const fn requeue_delay(&self) -> Duration {
        Duration::from_secs(self.requeue_delay_secs)
    }

    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    #[must_use]
    pub const fn max_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.max_retry_backoff_ms)
    }
}
