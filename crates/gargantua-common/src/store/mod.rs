//! Object store interface consumed by every reconciler
//!
//! The controllers only ever talk to the outside world through
//! [`ObjectStore`]: a typed, namespaced, optimistic-concurrency document store
//! with label selection and watch. Two implementations exist:
//!
//! - [`KubeStore`] talks to a Kubernetes API server through kube-rs.
//! - [`MemoryStore`] is an in-process API server with the same semantics,
//!   used by tests and local runs.

mod kubernetes;
mod memory;

pub use kubernetes::{KubeStore, KubeStoreProvider};
pub use memory::{MemoryApi, MemoryStore};

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::labels::LabelSelector;
use crate::names::generate_name;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::{Error, Result};

/// Fresh names tried before a create gives up on name collisions
pub const MAX_NAME_ATTEMPTS: usize = 5;

/// Anything the store can hold: a namespaced, serializable Kubernetes kind
pub trait StoreObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> StoreObject for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// What happens to dependents when their owner is removed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Propagation {
    /// Dependents are deleted after the owner is gone
    #[default]
    Background,
    /// Dependents lose their owner reference and survive
    Orphan,
}

/// Options for [`ObjectStore::delete`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Dependent handling
    pub propagation: Propagation,
}

impl DeleteOptions {
    /// Delete and leave dependents in place
    pub fn orphan() -> Self {
        Self {
            propagation: Propagation::Orphan,
        }
    }
}

/// One change observed on a watch stream
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent<K> {
    /// Object created or modified
    Applied(K),
    /// Object removed
    Deleted(K),
    /// Full snapshot; always the first event of a (re)started watch
    Restarted(Vec<K>),
}

/// Typed access to one resource kind in one namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore<K: StoreObject>: Send + Sync {
    /// Read one object
    async fn get(&self, name: &str) -> Result<K>;

    /// Read every object matching the selector
    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>>;

    /// Create an object; status is ignored
    async fn create(&self, obj: &K) -> Result<K>;

    /// Replace metadata and spec, guarded by the object's resource version
    async fn update(&self, obj: &K) -> Result<K>;

    /// Replace status, guarded by the object's resource version
    async fn update_status(&self, obj: &K) -> Result<K>;

    /// Request deletion; objects with finalizers linger until they are cleared
    async fn delete(&self, name: &str, options: &DeleteOptions) -> Result<()>;

    /// Stream changes, starting with a snapshot
    fn watch(&self, selector: &LabelSelector) -> BoxStream<'static, Result<WatchEvent<K>>>;
}

/// Hands out typed stores for one namespace
pub trait StoreProvider: Send + Sync {
    /// Namespace every store reads and writes
    fn namespace(&self) -> &str;

    /// Store for kind `K`
    fn store<K: StoreObject>(&self) -> Arc<dyn ObjectStore<K>>;
}

fn unchanged<K: Serialize>(before: &K, after: &K) -> bool {
    match (serde_json::to_value(before), serde_json::to_value(after)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Read, mutate and write back metadata and spec until the write lands.
///
/// The object is re-read on every attempt. When the mutation changes nothing
/// the store is not written and the current object is returned.
pub async fn update_with<K, F>(store: &dyn ObjectStore<K>, name: &str, mutate: F) -> Result<K>
where
    K: StoreObject,
    F: Fn(&mut K) + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(&RetryConfig::conflict(), "update", move || async move {
        let current = store.get(name).await?;
        let mut desired = current.clone();
        mutate(&mut desired);
        if unchanged(&current, &desired) {
            return Ok(current);
        }
        store.update(&desired).await
    })
    .await
}

/// Read, mutate and write back status until the write lands.
///
/// Same contract as [`update_with`], against the status subresource.
pub async fn update_status_with<K, F>(
    store: &dyn ObjectStore<K>,
    name: &str,
    mutate: F,
) -> Result<K>
where
    K: StoreObject,
    F: Fn(&mut K) + Sync,
{
    let mutate = &mutate;
    retry_on_conflict(
        &RetryConfig::conflict(),
        "update_status",
        move || async move {
            let current = store.get(name).await?;
            let mut desired = current.clone();
            mutate(&mut desired);
            if unchanged(&current, &desired) {
                return Ok(current);
            }
            store.update_status(&desired).await
        },
    )
    .await
}

/// Create `obj`, or return the existing object when the name is taken
pub async fn create_or_get<K: StoreObject>(store: &dyn ObjectStore<K>, obj: &K) -> Result<K> {
    match store.create(obj).await {
        Ok(created) => Ok(created),
        Err(e) if e.is_already_exists() => store.get(&obj.name_any()).await,
        Err(e) => Err(e),
    }
}

/// Create `obj` under a generated `base_name-xxxxxxxx` name
///
/// A collision draws a new suffix, up to [`MAX_NAME_ATTEMPTS`] times.
pub async fn create_with_generated_name<K: StoreObject>(
    store: &dyn ObjectStore<K>,
    obj: &K,
    base_name: &str,
) -> Result<K> {
    let mut obj = obj.clone();
    for _ in 0..MAX_NAME_ATTEMPTS {
        obj.meta_mut().name = Some(generate_name(base_name));
        match store.create(&obj).await {
            Ok(created) => return Ok(created),
            Err(e) if e.is_already_exists() => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Error::internal_with_context(
        base_name,
        format!("no free name after {MAX_NAME_ATTEMPTS} attempts"),
    ))
}

/// Remove a finalizer; a no-op when absent
///
/// Removing the last finalizer of an object being deleted completes the
/// deletion, so the object may be gone afterwards.
pub async fn remove_finalizer<K: StoreObject>(
    store: &dyn ObjectStore<K>,
    name: &str,
    finalizer: &str,
) -> Result<()> {
    let result = update_with(store, name, |obj: &mut K| {
        obj.finalizers_mut().retain(|f| f != finalizer);
    })
    .await;
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}
