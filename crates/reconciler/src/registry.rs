//! Component registry.
//!
//! The controller's setup logic fills a [`ComponentRegistry`] for the
//! current declaration; the registry then compiles into the dependency
//! graph for this reconciliation.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use keel_core::{Declaration, Manifest, ResourceIdentity, Result, ResultExt, RolloutConfig};
use keel_dag::{DagResult, DependencyGraph, Edge, GraphNode};
use serde_json::Value;
use tracing::debug;

use crate::readiness::ReadinessCheck;

/// Produces the desired manifests of a component for a declaration.
pub trait Renderer: Send + Sync {
    /// Render desired manifests.
    ///
    /// # Errors
    ///
    /// `Error::PreconditionNotMet` defers the component to a later
    /// reconciliation; any other error fails it.
    fn render(&self, declaration: &Declaration) -> Result<Vec<Manifest>>;
}

impl<F> Renderer for F
where
    F: Fn(&Declaration) -> Result<Vec<Manifest>> + Send + Sync,
{
    fn render(&self, declaration: &Declaration) -> Result<Vec<Manifest>> {
        self(declaration)
    }
}

/// Fixed manifests, independent of the declaration.
#[derive(Debug, Clone, Default)]
pub struct StaticManifests(pub Vec<Manifest>);

impl Renderer for StaticManifests {
    fn render(&self, _declaration: &Declaration) -> Result<Vec<Manifest>> {
        Ok(self.0.clone())
    }
}

/// Predicate deciding whether a component should be removed instead of deployed.
pub type DisablePredicate = Arc<dyn Fn(&Declaration) -> bool + Send + Sync>;

/// A named, dependency-aware unit of managed resources.
#[derive(Clone)]
pub struct ComponentSpec {
    name: String,
    after: Vec<String>,
    required: bool,
    disable_when: Option<DisablePredicate>,
    renderer: Arc<dyn Renderer>,
    readiness: Option<Arc<dyn ReadinessCheck>>,
}

impl fmt::Debug for ComponentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentSpec")
            .field("name", &self.name)
            .field("after", &self.after)
            .field("required", &self.required)
            .field("has_disable_predicate", &self.disable_when.is_some())
            .field("has_readiness_override", &self.readiness.is_some())
            .finish_non_exhaustive()
    }
}

impl ComponentSpec {
    #[must_use]
    pub fn builder(name: impl Into<String>) -> ComponentBuilder {
        ComponentBuilder {
            spec: Self {
                name: name.into(),
                after: Vec::new(),
                required: true,
                disable_when: None,
                renderer: Arc::new(StaticManifests::default()),
                readiness: None,
            },
        }
    }

    #[must_use]
    pub fn after(&self) -> &[String] {
        &self.after
    }

    #[must_use]
    pub fn is_disabled(&self, declaration: &Declaration) -> bool {
        self.disable_when
            .as_ref()
            .is_some_and(|predicate| predicate(declaration))
    }

    /// Render manifests; a failure is reported against this component.
    ///
    /// # Errors
    ///
    /// Propagates renderer errors.
    pub fn render(&self, declaration: &Declaration) -> Result<Vec<Manifest>> {
        self.renderer.render(declaration)
    }

    #[must_use]
    pub fn readiness_override(&self) -> Option<Arc<dyn ReadinessCheck>> {
        self.readiness.clone()
    }
}

impl GraphNode for ComponentSpec {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_required(&self) -> bool {
        self.required
    }
}

/// Builder for [`ComponentSpec`].
pub struct ComponentBuilder {
    spec: ComponentSpec,
}

impl ComponentBuilder {
    /// Depend on another component. Repeats are harmless.
    #[must_use]
    pub fn after(mut self, dependency: impl Into<String>) -> Self {
        self.spec.after.push(dependency.into());
        self
    }

    /// Failures of this component do not fail the phase.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.spec.required = false;
        self
    }

    #[must_use]
    pub fn disabled_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Declaration) -> bool + Send + Sync + 'static,
    {
        self.spec.disable_when = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn manifests(mut self, manifests: Vec<Manifest>) -> Self {
        self.spec.renderer = Arc::new(StaticManifests(manifests));
        self
    }

    #[must_use]
    pub fn renderer(mut self, renderer: impl Renderer + 'static) -> Self {
        self.spec.renderer = Arc::new(renderer);
        self
    }

    #[must_use]
    pub fn readiness(mut self, check: impl ReadinessCheck + 'static) -> Self {
        self.spec.readiness = Some(Arc::new(check));
        self
    }

    #[must_use]
    pub fn build(self) -> ComponentSpec {
        self.spec
    }
}

/// Component declarations and extra edges for one reconciliation.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    components: Vec<ComponentSpec>,
    edges: Vec<Edge>,
}

impl ComponentRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component. Name clashes are reported when the graph is built.
    pub fn add(&mut self, component: ComponentSpec) -> &mut Self {
        self.components.push(component);
        self
    }

    /// Declare that `from` runs after `to`.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push(Edge::new(from, to));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.components.iter().map(GraphNode::name).collect()
    }

    /// All declared edges: each component's `after` list plus explicit ones.
    #[must_use]
    pub fn declared_edges(&self) -> Vec<Edge> {
        self.components
            .iter()
            .flat_map(|c| c.after.iter().map(|dep| Edge::new(c.name.clone(), dep.clone())))
            .chain(self.edges.iter().cloned())
            .collect()
    }

    /// Edges from components whose workloads mount a ConfigMap or Secret to
    /// the component that owns it. Components that fail to render are
    /// skipped here; the failure resurfaces in their deploy transition.
    ///
    /// A manifest without `metadata.namespace` lands in the declaration's
    /// namespace, on both the referencing and the owning side.
    #[must_use]
    pub fn inferred_edges(&self, declaration: &Declaration) -> Vec<Edge> {
        let default_namespace = declaration.namespace();
        let rendered: Vec<(&str, Vec<Manifest>)> = self
            .components
            .iter()
            .filter_map(|c| {
                c.render(declaration)
                    .ok_logged("rendering for reference inference")
                    .map(|manifests| (c.name.as_str(), manifests))
            })
            .collect();

        let owners: HashMap<ResourceIdentity, &str> = rendered
            .iter()
            .flat_map(|(name, manifests)| {
                manifests
                    .iter()
                    .filter(|m| is_referenceable(m))
                    .filter_map(|m| ResourceIdentity::from_manifest(m).ok())
                    .map(move |id| (reference_key(&id, default_namespace), *name))
            })
            .collect();

        let mut edges = BTreeSet::new();
        for (name, manifests) in &rendered {
            for manifest in manifests {
                let namespace = manifest
                    .pointer("/metadata/namespace")
                    .and_then(Value::as_str)
                    .or(default_namespace);
                for reference in referenced_objects(manifest, namespace) {
                    if let Some(owner) = owners.get(&reference).filter(|owner| *owner != name) {
                        edges.insert(Edge::new(*name, *owner));
                    }
                }
            }
        }

        debug!(count = edges.len(), "Inferred reference edges");
        edges.into_iter().collect()
    }

    /// Compile into the dependency graph for this reconciliation.
    ///
    /// # Errors
    ///
    /// Returns the graph build error (duplicate name, dangling reference,
    /// self-edge or cycle).
    pub fn into_graph(
        self,
        declaration: &Declaration,
        config: &RolloutConfig,
    ) -> DagResult<DependencyGraph<ComponentSpec>> {
        let mut edges = self.declared_edges();
        if config.infer_reference_edges {
            edges.extend(self.inferred_edges(declaration));
        }
        DependencyGraph::build(self.components, edges)
    }
}

const REFERENCEABLE_KINDS: [&str; 2] = ["ConfigMap", "Secret"];

fn is_referenceable(manifest: &Manifest) -> bool {
    manifest
        .get("kind")
        .and_then(Value::as_str)
        .is_some_and(|kind| REFERENCEABLE_KINDS.contains(&kind))
}

/// Identity used to match references; the api version is not part of a
/// reference, so it is blanked.
fn reference_key(id: &ResourceIdentity, default_namespace: Option<&str>) -> ResourceIdentity {
    let namespace = id
        .namespace
        .clone()
        .or_else(|| default_namespace.map(str::to_string));
    ResourceIdentity::new("", id.kind.clone(), namespace, id.name.clone())
}

fn reference(
    kind: &str,
    namespace: Option<&str>,
    name: Option<&Value>,
) -> Option<ResourceIdentity> {
    let name = name?.as_str()?;
    Some(ResourceIdentity::new(
        "",
        kind,
        namespace.map(str::to_string),
        name,
    ))
}

/// Pod specs inside a manifest: bare pods, workload templates, cron jobs.
fn pod_specs(manifest: &Manifest) -> Vec<&Value> {
    ["/spec/template/spec", "/spec/jobTemplate/spec/template/spec"]
        .iter()
        .filter_map(|pointer| manifest.pointer(pointer))
        .chain(
            (manifest.get("kind").and_then(Value::as_str) == Some("Pod"))
                .then(|| manifest.get("spec"))
                .flatten(),
        )
        .collect()
}

fn referenced_objects(manifest: &Manifest, namespace: Option<&str>) -> Vec<ResourceIdentity> {
    let mut found = Vec::new();
    for pod in pod_specs(manifest) {
        let volumes = pod.get("volumes").and_then(Value::as_array);
        for volume in volumes.into_iter().flatten() {
            found.extend(reference(
                "ConfigMap",
                namespace,
                volume.pointer("/configMap/name"),
            ));
            found.extend(reference(
                "Secret",
                namespace,
                volume.pointer("/secret/secretName"),
            ));
            let sources = volume.pointer("/projected/sources").and_then(Value::as_array);
            for source in sources.into_iter().flatten() {
                found.extend(reference(
                    "ConfigMap",
                    namespace,
                    source.pointer("/configMap/name"),
                ));
                found.extend(reference(
                    "Secret",
                    namespace,
                    source.pointer("/secret/name"),
                ));
            }
        }

        let containers = ["containers", "initContainers"]
            .iter()
            .filter_map(|field| pod.get(*field).and_then(Value::as_array))
            .flatten();
        for container in containers {
            let env_from = container.get("envFrom").and_then(Value::as_array);
            for source in env_from.into_iter().flatten() {
                found.extend(reference(
                    "ConfigMap",
                    namespace,
                    source.pointer("/configMapRef/name"),
                ));
                found.extend(reference(
                    "Secret",
                    namespace,
                    source.pointer("/secretRef/name"),
                ));
            }
            let env = container.get("env").and_then(Value::as_array);
            for var in env.into_iter().flatten() {
                found.extend(reference(
                    "ConfigMap",
                    namespace,
                    var.pointer("/valueFrom/configMapKeyRef/name"),
                ));
                found.extend(reference(
                    "Secret",
                    namespace,
                    var.pointer("/valueFrom/secretKeyRef/name"),
                ));
            }
        }
    }
    found
}
