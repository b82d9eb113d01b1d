//! Core error types for keel operations.
//!
//! All errors are explicit, typed, and recoverable. Errors are `Clone` so
//! they can be recorded in a reconciliation summary and still be returned.

use std::path::PathBuf;

use thiserror::Error;

/// Core error type for keel operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    // Configuration errors (fatal, surfaced before any cluster mutation)
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("declaration version '{version}' is not supported (supported: {supported:?})")]
    UnsupportedVersion {
        version: String,
        supported: Vec<String>,
    },

    #[error("declaration has no spec.version but strict versioning is enabled")]
    MissingVersion,

    // Manifest errors
    #[error("invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    // Component errors
    #[error("failed to render component '{component}': {reason}")]
    RenderFailed { component: String, reason: String },

    #[error("precondition not met for component '{component}': {reason}")]
    PreconditionNotMet { component: String, reason: String },

    #[error("readiness check failed for {resource}: {reason}")]
    ReadinessFailed { resource: String, reason: String },

    #[error("controller setup failed: {reason}")]
    SetupFailed { reason: String },

    #[error("hook '{hook}' failed: {reason}")]
    HookFailed { hook: String, reason: String },

    // I/O and parsing errors
    #[error("failed to read file '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    #[error("JSON parse error: {reason}")]
    JsonParseFailed { reason: String },

    #[error("YAML parse error: {reason}")]
    YamlParseFailed { reason: String },

    #[error("TOML parse error: {reason}")]
    TomlParseFailed { reason: String },
}

impl Error {
    /// Create an invalid config error.
    #[must_use]
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create an unsupported version error.
    #[must_use]
    pub fn unsupported_version(version: impl Into<String>, supported: &[String]) -> Self {
        Self::UnsupportedVersion {
            version: version.into(),
            supported: supported.to_vec(),
        }
    }

    /// Create an invalid manifest error.
    #[must_use]
    pub fn invalid_manifest(reason: impl Into<String>) -> Self {
        Self::InvalidManifest {
            reason: reason.into(),
        }
    }

    /// Create a render failed error.
    #[must_use]
    pub fn render_failed(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RenderFailed {
            component: component.into(),
            reason: reason.into(),
        }
    }

    /// Create a precondition error. The engine treats it as "not yet", not as a failure.
    #[must_use]
    pub fn precondition_not_met(component: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PreconditionNotMet {
            component: component.into(),
            reason: reason.into(),
        }
    }

    /// Create a readiness check error.
    #[must_use]
    pub fn readiness_failed(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ReadinessFailed {
            resource: resource.into(),
            reason: reason.into(),
        }
    }

    /// Create a setup error.
    #[must_use]
    pub fn setup_failed(reason: impl Into<String>) -> Self {
        Self::SetupFailed {
            reason: reason.into(),
        }
    }

    /// Create a hook error.
    #[must_use]
    pub fn hook_failed(hook: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::HookFailed {
            hook: hook.into(),
            reason: reason.into(),
        }
    }

    /// Create a file read error.
    #[must_use]
    pub fn file_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error rejects the declaration as a whole.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. } | Self::UnsupportedVersion { .. } | Self::MissingVersion
        )
    }

    /// Whether this error is an expected "try again later" condition.
    #[must_use]
    pub const fn is_expected(&self) -> bool {
        matches!(self, Self::PreconditionNotMet { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonParseFailed {
            reason: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlParseFailed {
            reason: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::TomlParseFailed {
            reason: err.to_string(),
        }
    }
}
