use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use gargantua_common::labels::LabelSelector;
use gargantua_common::store::{DeleteOptions, ObjectStore, StoreObject, WatchEvent};
use gargantua_common::{Error, Result};

use super::Cache;

/// [`ObjectStore`] that answers reads from an informer cache
///
/// Writes and watches go straight to the backend. Reads may trail the
/// latest write; a write based on a trailing read fails with a conflict and
/// is retried by the conflict helpers.
pub struct CachedStore<K> {
    namespace: String,
    cache: Cache<K>,
    backend: Arc<dyn ObjectStore<K>>,
}

impl<K> Clone for CachedStore<K> {
    fn clone(&self) -> Self {
        Self {
            namespace: self.namespace.clone(),
            cache: self.cache.clone(),
            backend: self.backend.clone(),
        }
    }
}

impl<K: StoreObject> CachedStore<K> {
    /// Cache-backed view of `backend` in `namespace`
    pub fn new(
        namespace: impl Into<String>,
        cache: Cache<K>,
        backend: Arc<dyn ObjectStore<K>>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            cache,
            backend,
        }
    }
}

#[async_trait]
impl<K: StoreObject> ObjectStore<K> for CachedStore<K> {
    async fn get(&self, name: &str) -> Result<K> {
        self.cache
            .get(&self.namespace, name)
            .map(|obj| obj.as_ref().clone())
            .ok_or_else(|| Error::not_found(K::kind(&()), name))
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>> {
        Ok(self
            .cache
            .select(selector)
            .iter()
            .map(|obj| obj.as_ref().clone())
            .collect())
    }

    async fn create(&self, obj: &K) -> Result<K> {
        self.backend.create(obj).await
    }

    async fn update(&self, obj: &K) -> Result<K> {
        self.backend.update(obj).await
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        self.backend.update_status(obj).await
    }

    async fn delete(&self, name: &str, options: &DeleteOptions) -> Result<()> {
        self.backend.delete(name, options).await
    }

    fn watch(&self, selector: &LabelSelector) -> BoxStream<'static, Result<WatchEvent<K>>> {
        self.backend.watch(selector)
    }
}
