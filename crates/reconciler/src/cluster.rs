//! Cluster-access collaborator.
//!
//! The engine only needs three operations against the cluster: read an
//! object, apply a [`Plan`] to it, and remove it. [`InMemoryCluster`]
//! implements them over a process-local object map; it backs dry runs and
//! doubles as the test fake.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use keel_core::{Manifest, ResourceIdentity};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::diff::{self, Plan};
use crate::error::AccessError;

/// Result of a cluster-access call.
pub type AccessResult<T> = std::result::Result<T, AccessError>;

/// Operations the engine performs against the cluster.
#[async_trait]
pub trait ClusterAccess: Send + Sync {
    /// Read an object; `Ok(None)` when it does not exist.
    async fn get(&self, identity: &ResourceIdentity) -> AccessResult<Option<Manifest>>;

    /// Apply a plan and return the stored object.
    async fn apply(&self, identity: &ResourceIdentity, plan: &Plan) -> AccessResult<Manifest>;

    /// Remove an object. Removing an absent object succeeds.
    async fn disable(&self, identity: &ResourceIdentity) -> AccessResult<()>;
}

/// Snapshot of how often each operation was called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub get: usize,
    pub apply: usize,
    pub disable: usize,
}

/// Process-local cluster.
#[derive(Debug, Default)]
pub struct InMemoryCluster {
    objects: RwLock<BTreeMap<ResourceIdentity, Manifest>>,
    scripted_failures: Mutex<HashMap<ResourceIdentity, VecDeque<AccessError>>>,
    apply_log: Mutex<Vec<ResourceIdentity>>,
    resource_version: AtomicU64,
    gets: AtomicUsize,
    applies: AtomicUsize,
    disables: AtomicUsize,
}

impl InMemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object as if it already existed in the cluster.
    ///
    /// # Errors
    ///
    /// Fails if the manifest has no valid identity.
    pub async fn seed(&self, manifest: Manifest) -> keel_core::Result<ResourceIdentity> {
        let identity = ResourceIdentity::from_manifest(&manifest)?;
        let stored = self.stamp(diff::normalized(&manifest));
        self.objects.write().await.insert(identity.clone(), stored);
        Ok(identity)
    }

    /// Current content of an object, bypassing the call counters.
    pub async fn object(&self, identity: &ResourceIdentity) -> Option<Manifest> {
        self.objects.read().await.get(identity).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    /// Replace the `status` of a stored object. Returns false if absent.
    pub async fn set_status(&self, identity: &ResourceIdentity, status: Value) -> bool {
        let mut objects = self.objects.write().await;
        let Some(Value::Object(object)) = objects.get_mut(identity) else {
            return false;
        };
        object.insert("status".to_string(), status);
        true
    }

    /// Make the next `count` applies of `identity` fail with `error`.
    pub async fn fail_applies(
        &self,
        identity: &ResourceIdentity,
        count: usize,
        error: AccessError,
    ) {
        let mut failures = self.scripted_failures.lock().await;
        let queue = failures.entry(identity.clone()).or_default();
        queue.extend(std::iter::repeat_n(error, count));
    }

    #[must_use]
    pub fn call_counts(&self) -> CallCounts {
        CallCounts {
            get: self.gets.load(Ordering::SeqCst),
            apply: self.applies.load(Ordering::SeqCst),
            disable: self.disables.load(Ordering::SeqCst),
        }
    }

    /// Identities passed to `apply`, in call order.
    pub async fn apply_log(&self) -> Vec<ResourceIdentity> {
        self.apply_log.lock().await.clone()
    }

    fn stamp(&self, mut manifest: Manifest) -> Manifest {
        let version = self
            .resource_version
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        if let Some(Value::Object(metadata)) = manifest.get_mut("metadata") {
            metadata.insert(
                "resourceVersion".to_string(),
                Value::String(version.to_string()),
            );
        }
        manifest
    }
}

#[async_trait]
impl ClusterAccess for InMemoryCluster {
    async fn get(&self, identity: &ResourceIdentity) -> AccessResult<Option<Manifest>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Ok(self.objects.read().await.get(identity).cloned())
    }

    async fn apply(&self, identity: &ResourceIdentity, plan: &Plan) -> AccessResult<Manifest> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.apply_log.lock().await.push(identity.clone());

        if let Some(error) = self
            .scripted_failures
            .lock()
            .await
            .get_mut(identity)
            .and_then(VecDeque::pop_front)
        {
            debug!(resource = %identity, error = %error, "Injected apply failure");
            return Err(error);
        }

        let mut objects = self.objects.write().await;
        let stored = match (plan, objects.get(identity)) {
            (Plan::Create(_), Some(_)) => {
                return Err(AccessError::conflict(identity, "object already exists"));
            }
            (Plan::Create(content), None) => self.stamp(content.clone()),
            (Plan::Patch(ops), Some(current)) => {
                let mut updated = current.clone();
                diff::apply_patch(&mut updated, ops)
                    .map_err(|e| AccessError::rejected(identity, e.to_string()))?;
                self.stamp(updated)
            }
            (Plan::NoOp, Some(current)) => return Ok(current.clone()),
            (Plan::Patch(_) | Plan::NoOp, None) => {
                return Err(AccessError::conflict(identity, "object no longer exists"));
            }
        };

        debug!(resource = %identity, plan = plan.kind(), "Applied plan");
        objects.insert(identity.clone(), stored.clone());
        Ok(stored)
    }

    async fn disable(&self, identity: &ResourceIdentity) -> AccessResult<()> {
        self.disables.fetch_add(1, Ordering::SeqCst);
        if self.objects.write().await.remove(identity).is_some() {
            debug!(resource = %identity, "Removed object");
        }
        Ok(())
    }
}
