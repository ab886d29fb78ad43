//! Object store backed by a Kubernetes API server

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use super::{DeleteOptions, ObjectStore, Propagation, StoreObject, StoreProvider, WatchEvent};
use crate::labels::LabelSelector;
use crate::{Error, Result};

/// [`ObjectStore`] over `kube::Api` in one namespace
pub struct KubeStore<K> {
    api: Api<K>,
}

impl<K: StoreObject> KubeStore<K> {
    /// Store for kind `K` in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

fn list_params(selector: &LabelSelector) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(&selector.to_string())
    }
}

#[async_trait]
impl<K: StoreObject> ObjectStore<K> for KubeStore<K> {
    async fn get(&self, name: &str) -> Result<K> {
        Ok(self.api.get(name).await?)
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>> {
        Ok(self.api.list(&list_params(selector)).await?.items)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        Ok(self.api.create(&PostParams::default(), obj).await?)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        Ok(self
            .api
            .replace(&obj.name_any(), &PostParams::default(), obj)
            .await?)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        // Carrying the resource version keeps the merge patch a compare-and-swap
        let status = serde_json::to_value(obj)?
            .get("status")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let patch = json!({
            "metadata": { "resourceVersion": obj.resource_version() },
            "status": status,
        });
        Ok(self
            .api
            .patch_status(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn delete(&self, name: &str, options: &DeleteOptions) -> Result<()> {
        let params = DeleteParams {
            propagation_policy: Some(match options.propagation {
                Propagation::Background => PropagationPolicy::Background,
                Propagation::Orphan => PropagationPolicy::Orphan,
            }),
            ..DeleteParams::default()
        };
        self.api.delete(name, &params).await?;
        debug!(kind = %K::kind(&()), name = %name, "delete requested");
        Ok(())
    }

    fn watch(&self, selector: &LabelSelector) -> BoxStream<'static, Result<WatchEvent<K>>> {
        let mut config = watcher::Config::default();
        if !selector.is_empty() {
            config = config.labels(&selector.to_string());
        }

        // Fold the paged initial listing into one snapshot
        let mut initial: Option<Vec<K>> = None;
        watcher(self.api.clone(), config)
            .filter_map(move |event| {
                let out = match event {
                    Ok(watcher::Event::Init) => {
                        initial = Some(Vec::new());
                        None
                    }
                    Ok(watcher::Event::InitApply(obj)) => {
                        initial.get_or_insert_with(Vec::new).push(obj);
                        None
                    }
                    Ok(watcher::Event::InitDone) => Some(Ok(WatchEvent::Restarted(
                        initial.take().unwrap_or_default(),
                    ))),
                    Ok(watcher::Event::Apply(obj)) => Some(Ok(WatchEvent::Applied(obj))),
                    Ok(watcher::Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
                    Err(e) => Some(Err(Error::internal_with_context("watch", e.to_string()))),
                };
                futures::future::ready(out)
            })
            .boxed()
    }
}

/// Hands out [`KubeStore`]s sharing one client
#[derive(Clone)]
pub struct KubeStoreProvider {
    client: Client,
    namespace: String,
}

impl KubeStoreProvider {
    /// Provider for `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

impl StoreProvider for KubeStoreProvider {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn store<K: StoreObject>(&self) -> Arc<dyn ObjectStore<K>> {
        Arc::new(KubeStore::<K>::new(self.client.clone(), &self.namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_params_render_selector() {
        let params = list_params(&LabelSelector::everything().with("vmset", "pool"));
        assert_eq!(params.label_selector.as_deref(), Some("vmset=pool"));
        assert!(list_params(&LabelSelector::everything())
            .label_selector
            .is_none());
    }
}
