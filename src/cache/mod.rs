//! Watch-fed, read-only local view of PVCs and VolumePopulators
//!
//! A [`Store`] holds the latest copy of every object of one kind, keyed by
//! namespace and name. It is written only by its informer task and read by
//! every worker. Readers clone an `Arc` under a short read lock and never
//! wait on the watch stream.

pub mod informer;
mod store;

pub use store::{ChangeHandler, Store};

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::DynamicObject;
use kube::{Resource, ResourceExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Identity of a cached object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.meta().namespace.clone(),
            name: obj.name_any(),
        }
    }
}

/// Renders the work queue key: `namespace/name`, or `name` for
/// cluster-scoped objects.
impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) if !ns.is_empty() => write!(f, "{}/{}", ns, self.name),
            _ => write!(f, "{}", self.name),
        }
    }
}

/// Split a work queue key into its namespace and name.
pub fn split_meta_namespace_key(key: &str) -> Result<(Option<&str>, &str)> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((None, *name)),
        [ns, name] if !name.is_empty() => Ok((Some(*ns), *name)),
        _ => Err(Error::InvalidKey(key.to_string())),
    }
}

/// A deleted object as seen by the change feed.
///
/// When a deletion is only noticed on relist, the final state is unknown
/// and all that is left is the last-known identity.
#[derive(Clone, Debug)]
pub enum DeletedObject<K> {
    Final(Arc<K>),
    Tombstone(ObjectKey),
}

/// A single change applied to a [`Store`]
#[derive(Clone, Debug)]
pub enum ChangeEvent<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(DeletedObject<K>),
}

impl<K: Resource> ChangeEvent<K> {
    /// Identity of the object this change is about
    pub fn object_key(&self) -> ObjectKey {
        match self {
            ChangeEvent::Added(obj) => ObjectKey::from_resource(obj.as_ref()),
            ChangeEvent::Updated { new, .. } => ObjectKey::from_resource(new.as_ref()),
            ChangeEvent::Deleted(DeletedObject::Final(obj)) => {
                ObjectKey::from_resource(obj.as_ref())
            }
            ChangeEvent::Deleted(DeletedObject::Tombstone(key)) => key.clone(),
        }
    }

    /// Work queue key for this change
    pub fn key(&self) -> String {
        self.object_key().to_string()
    }
}

/// Read access to cached PVCs
pub trait ClaimLister: Send + Sync {
    /// Fetch a PVC, or [`Error::NotFound`] if it is not cached.
    fn get_claim(&self, namespace: &str, name: &str) -> Result<Arc<PersistentVolumeClaim>>;
}

/// Read access to the cached VolumePopulator catalog
pub trait PopulatorLister: Send + Sync {
    /// List every cached VolumePopulator in its generic wire form.
    fn list_populators(&self) -> Result<Vec<Arc<DynamicObject>>>;
}

impl ClaimLister for Store<PersistentVolumeClaim> {
    fn get_claim(&self, namespace: &str, name: &str) -> Result<Arc<PersistentVolumeClaim>> {
        self.get(&ObjectKey::new(Some(namespace), name))
            .ok_or_else(|| Error::NotFound {
                kind: "PersistentVolumeClaim",
                key: format!("{}/{}", namespace, name),
            })
    }
}

impl PopulatorLister for Store<DynamicObject> {
    fn list_populators(&self) -> Result<Vec<Arc<DynamicObject>>> {
        Ok(self.list())
    }
}

/// Block until every store has completed its initial listing.
///
/// Returns `false` if shutdown was requested first.
pub async fn wait_for_cache_sync(
    cancel: &CancellationToken,
    handles: Vec<watch::Receiver<bool>>,
) -> bool {
    for mut handle in handles {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            synced = async { handle.wait_for(|synced| *synced).await.is_ok() } => {
                if !synced {
                    return false;
                }
            }
        }
    }
    true
}
