//! Controller for declarations that list their components inline.
//!
//! ```yaml
//! apiVersion: keel.dev/v1
//! kind: Platform
//! metadata: {name: demo, namespace: prod}
//! spec:
//!   version: "1.0"
//!   components:
//!     - name: db
//!       manifests: [...]
//!     - name: api
//!       after: [db]
//!       optional: false
//!       disabled: false
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::Path;

use anyhow::{Context, Result};
use keel_core::{Declaration, Manifest, manifest::default_namespace};
use keel_reconciler::{ComponentRegistry, ComponentSpec, Controller, PhaseHooks};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
struct DeclaredComponent {
    name: String,
    #[serde(default)]
    after: Vec<String>,
    #[serde(default)]
    optional: bool,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    manifests: Vec<Manifest>,
}

/// Registers the components found under `spec.components`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclaredController;

impl PhaseHooks for DeclaredController {}

impl Controller for DeclaredController {
    fn setup(
        &self,
        declaration: &Declaration,
        registry: &mut ComponentRegistry,
    ) -> keel_core::Result<()> {
        let components = declaration
            .spec()
            .get("components")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        let components: Vec<DeclaredComponent> = serde_json::from_value(components)
            .map_err(|e| keel_core::Error::setup_failed(format!("spec.components: {e}")))?;

        for declared in components {
            registry.add(component(declared, declaration.namespace()));
        }
        Ok(())
    }
}

fn component(declared: DeclaredComponent, namespace: Option<&str>) -> ComponentSpec {
    let mut manifests = declared.manifests;
    if let Some(namespace) = namespace {
        for manifest in &mut manifests {
            default_namespace(manifest, namespace);
        }
    }

    let mut builder = ComponentSpec::builder(declared.name).manifests(manifests);
    for dependency in declared.after {
        builder = builder.after(dependency);
    }
    if declared.optional {
        builder = builder.optional();
    }
    if declared.disabled {
        builder = builder.disabled_when(|_: &Declaration| true);
    }
    builder.build()
}

/// Read a YAML or JSON document.
pub fn read_document(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn load_declaration(path: &Path) -> Result<Declaration> {
    let document = read_document(path)?;
    Declaration::from_manifest(&document)
        .with_context(|| format!("{} is not a valid declaration", path.display()))
}

/// Objects to seed the in-memory cluster with: a list, or a single object.
pub fn load_objects(path: &Path) -> Result<Vec<Manifest>> {
    match read_document(path)? {
        Value::Array(objects) => Ok(objects),
        Value::Null => Ok(Vec::new()),
        object => Ok(vec![object]),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::indexing_slicing)]

    use super::*;
    use keel_core::RolloutConfig;
    use std::io::Write;

    const PLATFORM: &str = r#"
apiVersion: keel.dev/v1
kind: Platform
metadata:
  name: demo
  namespace: prod
  generation: 2
spec:
  version: "1.0"
  components:
    - name: db
      manifests:
        - apiVersion: v1
          kind: ConfigMap
          metadata: {name: db-config}
          data: {size: small}
    - name: api
      after: [db]
      optional: true
    - name: legacy
      disabled: true
"#;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_declaration_from_yaml() {
        let file = write_temp(PLATFORM);
        let declaration = load_declaration(file.path()).unwrap();
        assert_eq!(declaration.kind(), "Platform");
        assert_eq!(declaration.generation(), 2);
        assert_eq!(declaration.version(), Some("1.0"));
    }

    #[test]
    fn test_setup_registers_components_in_order() {
        let file = write_temp(PLATFORM);
        let declaration = load_declaration(file.path()).unwrap();
        let mut registry = ComponentRegistry::new();
        DeclaredController.setup(&declaration, &mut registry).unwrap();

        assert_eq!(registry.names(), vec!["db", "api", "legacy"]);
        let graph = registry
            .into_graph(&declaration, &RolloutConfig::default())
            .unwrap();
        assert_eq!(graph.level_names(), vec![vec!["db", "legacy"], vec!["api"]]);
    }

    #[test]
    fn test_manifests_inherit_declaration_namespace() {
        let file = write_temp(PLATFORM);
        let declaration = load_declaration(file.path()).unwrap();
        let db: DeclaredComponent = serde_json::from_value(
            declaration.spec()["components"][0].clone(),
        )
        .unwrap();
        let spec = component(db, declaration.namespace());
        let rendered = spec.render(&declaration).unwrap();
        assert_eq!(rendered[0]["metadata"]["namespace"], "prod");
    }

    #[test]
    fn test_malformed_components_fail_setup() {
        let declaration = Declaration::new(
            keel_core::ResourceIdentity::new("keel.dev/v1", "Platform", None, "bad"),
            serde_json::json!({"components": [{"after": ["x"]}]}),
        );
        let result = DeclaredController.setup(&declaration, &mut ComponentRegistry::new());
        assert!(matches!(result, Err(keel_core::Error::SetupFailed { .. })));
    }

    #[test]
    fn test_load_objects_accepts_single_object() {
        let file = write_temp("apiVersion: v1\nkind: Secret\nmetadata: {name: creds}\n");
        assert_eq!(load_objects(file.path()).unwrap().len(), 1);
    }
}
