//! Fan-in from informer events to work queue keys
//!
//! Each controller queue is fed by one or more dispatch loops. A loop maps
//! every event of one kind to the keys it should wake, for example a VM
//! event to its own key on the provisioner queue and to its VMSet's key on
//! the VMSet queue.

use gargantua_common::names::object_key;
use gargantua_common::store::StoreObject;
use kube::ResourceExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::trace;

use crate::informer::InformerEvent;
use crate::queue::WorkQueue;

/// Feed `queue` with the keys `mapper` derives from each event
///
/// Returns when the informer closes the channel.
pub async fn dispatch<K, F>(
    mut events: UnboundedReceiver<InformerEvent<K>>,
    queue: WorkQueue,
    mapper: F,
) where
    K: StoreObject,
    F: Fn(&InformerEvent<K>) -> Vec<String> + Send,
{
    while let Some(event) = events.recv().await {
        for key in mapper(&event) {
            trace!(queue = %queue.name(), key = %key, "dispatch");
            queue.add(key);
        }
    }
}

/// Key of the event's own object
pub fn enqueue_self<K: StoreObject>(event: &InformerEvent<K>) -> Vec<String> {
    vec![key_of(event.object().as_ref())]
}

/// Key of a sibling object in the same namespace
pub fn key_for<K: StoreObject>(obj: &K, name: &str) -> String {
    object_key(&obj.namespace().unwrap_or_default(), name)
}

/// Keys of the objects an event's object points at through `related`
///
/// Both the new and the previous version are consulted, so an update that
/// moves a reference wakes the old target as well as the new one.
pub fn related_keys<K, F>(event: &InformerEvent<K>, related: F) -> Vec<String>
where
    K: StoreObject,
    F: Fn(&K) -> Option<String>,
{
    let mut keys: Vec<String> = std::iter::once(event.object())
        .chain(event.previous())
        .filter_map(|obj| {
            related(obj.as_ref())
                .filter(|name| !name.is_empty())
                .map(|name| key_for(obj.as_ref(), &name))
        })
        .collect();
    keys.dedup();
    keys
}

fn key_of<K: StoreObject>(obj: &K) -> String {
    object_key(&obj.namespace().unwrap_or_default(), &obj.name_any())
}
