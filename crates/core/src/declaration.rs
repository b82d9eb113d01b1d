//! The governing custom-resource instance driving one reconciliation.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::Error;
use crate::manifest::{Manifest, ResourceIdentity};
use crate::result::Result;

/// Annotation that suspends reconciliation of a declaration when set to `"true"`.
pub const PAUSE_ANNOTATION: &str = "keel.dev/pause-execution";

/// Desired-state document for the governing resource.
///
/// A declaration is an immutable snapshot: one is taken per reconciliation
/// and shared read-only by every component transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    identity: ResourceIdentity,
    generation: i64,
    resource_version: Option<String>,
    spec: Value,
    annotations: BTreeMap<String, String>,
}

impl Declaration {
    /// Create a declaration from its parts.
    #[must_use]
    pub fn new(identity: ResourceIdentity, spec: Value) -> Self {
        Self {
            identity,
            generation: 1,
            resource_version: None,
            spec,
            annotations: BTreeMap::new(),
        }
    }

    /// Parse a declaration from a full resource manifest.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidManifest` if the identity fields are missing.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self> {
        let identity = ResourceIdentity::from_manifest(manifest)?;
        let generation = manifest
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let resource_version = manifest
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(str::to_string);
        let annotations = match manifest.pointer("/metadata/annotations") {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect(),
            Some(_) => {
                return Err(Error::invalid_manifest(
                    "metadata.annotations must be a map",
                ));
            }
        };
        let spec = manifest.get("spec").cloned().unwrap_or(Value::Null);

        Ok(Self {
            identity,
            generation,
            resource_version,
            spec,
            annotations,
        })
    }

    #[must_use]
    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = generation;
        self
    }

    #[must_use]
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_resource_version(mut self, resource_version: impl Into<String>) -> Self {
        self.resource_version = Some(resource_version.into());
        self
    }

    #[must_use]
    pub const fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.identity.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.identity.namespace.as_deref()
    }

    #[must_use]
    pub const fn generation(&self) -> i64 {
        self.generation
    }

    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    #[must_use]
    pub const fn spec(&self) -> &Value {
        &self.spec
    }

    #[must_use]
    pub const fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    /// The declared application version, read from `spec.version`.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.spec.get("version").and_then(Value::as_str)
    }

    /// Whether the pause annotation is set.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.annotations
            .get(PAUSE_ANNOTATION)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}
