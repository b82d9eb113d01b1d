//! Manifest helpers and resource identities.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::result::Result;

/// A manifest is an arbitrary structured cluster object.
pub type Manifest = Value;

/// Address of a single cluster object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceIdentity {
    /// Create a new identity.
    #[must_use]
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace,
            name: name.into(),
        }
    }

    /// Extract the identity of a manifest from its `apiVersion`, `kind` and
    /// `metadata.{name,namespace}` fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidManifest` if any required field is missing or
    /// is not a string.
    pub fn from_manifest(manifest: &Manifest) -> Result<Self> {
        let api_version = required_str(manifest, "/apiVersion")?;
        let kind = required_str(manifest, "/kind")?;
        let name = required_str(manifest, "/metadata/name")?;
        let namespace = manifest
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

fn required_str<'a>(manifest: &'a Manifest, pointer: &str) -> Result<&'a str> {
    manifest
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::invalid_manifest(format!("missing string field '{pointer}'")))
}

/// Set `metadata.namespace` on a manifest when it has none.
pub fn default_namespace(manifest: &mut Manifest, namespace: &str) {
    let Some(metadata) = manifest.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };
    metadata
        .entry("namespace")
        .or_insert_with(|| Value::String(namespace.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identity_from_manifest() {
        let manifest = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "prod"}
        });
        let id = ResourceIdentity::from_manifest(&manifest).ok();
        assert_eq!(
            id,
            Some(ResourceIdentity::new(
                "apps/v1",
                "Deployment",
                Some("prod".to_string()),
                "web"
            ))
        );
    }

    #[test]
    fn test_identity_requires_name() {
        let manifest = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}});
        assert!(matches!(
            ResourceIdentity::from_manifest(&manifest),
            Err(Error::InvalidManifest { .. })
        ));
    }

    #[test]
    fn test_identity_display() {
        let cluster_scoped = ResourceIdentity::new("v1", "Namespace", None, "prod");
        assert_eq!(cluster_scoped.to_string(), "Namespace/prod");
        let namespaced = ResourceIdentity::new("v1", "Secret", Some("prod".into()), "db");
        assert_eq!(namespaced.to_string(), "Secret/prod/db");
    }

    #[test]
    fn test_default_namespace_keeps_existing() {
        let mut manifest = json!({"metadata": {"name": "a", "namespace": "keep"}});
        default_namespace(&mut manifest, "other");
        assert_eq!(manifest["metadata"]["namespace"], "keep");

        let mut bare = json!({"metadata": {"name": "a"}});
        default_namespace(&mut bare, "other");
        assert_eq!(bare["metadata"]["namespace"], "other");
    }
}
