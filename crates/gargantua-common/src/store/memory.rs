//! In-process object store with API server semantics
//!
//! Objects are kept as metadata plus the rest of their JSON body, keyed by
//! `(apiVersion/kind, name)`. The rules mirror a Kubernetes API server closely
//! enough that controllers cannot tell the difference:
//!
//! - every write bumps a global resource version; stale writes conflict
//! - `status` is a subresource: `create` and `update` ignore it,
//!   `update_status` only touches it
//! - a write that changes nothing is accepted without a new version
//! - deletion waits for finalizers, and finalizers cannot be added once
//!   deletion has started
//! - removing an object cascades to its dependents through owner uids

use std::collections::{BTreeMap, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use super::{DeleteOptions, ObjectStore, Propagation, StoreObject, StoreProvider, WatchEvent};
use crate::labels::LabelSelector;
use crate::{Error, Result};

const EVENT_BUFFER: usize = 4096;
const STATUS: &str = "status";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    kind: String,
    name: String,
}

#[derive(Clone, Debug)]
struct Entry {
    meta: ObjectMeta,
    body: Map<String, Value>,
}

#[derive(Clone, Debug)]
struct Change {
    kind: String,
    deleted: bool,
    entry: Entry,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Entry>,
    revision: u64,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

/// A single-namespace in-memory API server
///
/// Cloning is cheap and every clone sees the same objects.
#[derive(Clone)]
pub struct MemoryStore {
    namespace: String,
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<Change>,
}

impl MemoryStore {
    /// Empty store for `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            namespace: namespace.into(),
            state: Arc::new(Mutex::new(State::default())),
            events,
        }
    }

    /// Typed handle for kind `K`
    pub fn api<K: StoreObject>(&self) -> MemoryApi<K> {
        MemoryApi {
            store: self.clone(),
            _kind: PhantomData,
        }
    }

    /// Latest resource version handed out; unchanged means nothing was written
    pub fn revision(&self) -> u64 {
        self.state.lock().revision
    }

    /// Number of stored objects of every kind
    pub fn len(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, changes: Vec<Change>) {
        for change in changes {
            // No receivers is fine; nobody is watching yet
            let _ = self.events.send(change);
        }
    }
}

impl StoreProvider for MemoryStore {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn store<K: StoreObject>(&self) -> Arc<dyn super::ObjectStore<K>> {
        Arc::new(self.api::<K>())
    }
}

/// Typed view of a [`MemoryStore`]
pub struct MemoryApi<K> {
    store: MemoryStore,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for MemoryApi<K> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _kind: PhantomData,
        }
    }
}

fn kind_key<K: StoreObject>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn split<K: StoreObject>(obj: &K) -> Result<Entry> {
    let value = serde_json::to_value(obj)?;
    let Value::Object(mut body) = value else {
        return Err(Error::serialization_for_kind(
            K::kind(&()),
            "object did not serialize to a JSON map",
        ));
    };
    body.remove("apiVersion");
    body.remove("kind");
    body.remove("metadata");
    if body.get(STATUS).is_some_and(Value::is_null) {
        body.remove(STATUS);
    }
    Ok(Entry {
        meta: obj.meta().clone(),
        body,
    })
}

fn join<K: StoreObject>(entry: &Entry) -> Result<K> {
    let mut body = entry.body.clone();
    body.insert("apiVersion".into(), Value::String(K::api_version(&()).into_owned()));
    body.insert("kind".into(), Value::String(K::kind(&()).into_owned()));
    body.insert("metadata".into(), serde_json::to_value(&entry.meta)?);
    serde_json::from_value(Value::Object(body))
        .map_err(|e| Error::serialization_for_kind(K::kind(&()), e.to_string()))
}

fn labels_of(meta: &ObjectMeta) -> BTreeMap<String, String> {
    meta.labels.clone().unwrap_or_default()
}

fn finalizers_of(meta: &ObjectMeta) -> Vec<String> {
    meta.finalizers.clone().unwrap_or_default()
}

fn without_status(mut body: Map<String, Value>) -> Map<String, Value> {
    body.remove(STATUS);
    body
}

fn same_user_meta(a: &ObjectMeta, b: &ObjectMeta) -> bool {
    a.labels == b.labels
        && a.annotations == b.annotations
        && finalizers_of(a) == finalizers_of(b)
        && a.owner_references == b.owner_references
}

fn check_version(stored: &Entry, incoming: &ObjectMeta, kind: &str, name: &str) -> Result<()> {
    match &incoming.resource_version {
        Some(rv) if Some(rv) != stored.meta.resource_version.as_ref() => {
            Err(Error::conflict(kind, name))
        }
        _ => Ok(()),
    }
}

impl State {
    /// Remove an object and everything that depends on it
    fn remove(&mut self, key: Key, propagation: Propagation, changes: &mut Vec<Change>) {
        let mut pending = VecDeque::from([key]);
        while let Some(key) = pending.pop_front() {
            let Some(entry) = self.objects.remove(&key) else {
                continue;
            };
            let uid = entry.meta.uid.clone().unwrap_or_default();
            changes.push(Change {
                kind: key.kind.clone(),
                deleted: true,
                entry,
            });
            if uid.is_empty() {
                continue;
            }

            let dependents: Vec<Key> = self
                .objects
                .iter()
                .filter(|(_, e)| {
                    e.meta
                        .owner_references
                        .as_ref()
                        .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
                })
                .map(|(k, _)| k.clone())
                .collect();

            for dep in dependents {
                match propagation {
                    Propagation::Orphan => {
                        let revision = self.next_revision();
                        if let Some(e) = self.objects.get_mut(&dep) {
                            if let Some(refs) = e.meta.owner_references.as_mut() {
                                refs.retain(|r| r.uid != uid);
                            }
                            e.meta.resource_version = Some(revision);
                            changes.push(Change {
                                kind: dep.kind.clone(),
                                deleted: false,
                                entry: e.clone(),
                            });
                        }
                    }
                    Propagation::Background => {
                        let has_finalizers = self
                            .objects
                            .get(&dep)
                            .is_some_and(|e| !finalizers_of(&e.meta).is_empty());
                        if has_finalizers {
                            self.mark_deleting(&dep, changes);
                        } else {
                            pending.push_back(dep);
                        }
                    }
                }
            }
        }
    }

    fn mark_deleting(&mut self, key: &Key, changes: &mut Vec<Change>) {
        let revision = self.next_revision();
        if let Some(e) = self.objects.get_mut(key) {
            if e.meta.deletion_timestamp.is_none() {
                e.meta.deletion_timestamp = Some(Time(Utc::now()));
                e.meta.resource_version = Some(revision);
                changes.push(Change {
                    kind: key.kind.clone(),
                    deleted: false,
                    entry: e.clone(),
                });
            }
        }
    }
}

impl<K: StoreObject> MemoryApi<K> {
    fn key(&self, name: &str) -> Key {
        Key {
            kind: kind_key::<K>(),
            name: name.to_string(),
        }
    }

    /// Store an object exactly as given, status included
    ///
    /// Meant for seeding fixtures; the object gets a uid and a resource
    /// version like any created object.
    pub fn insert(&self, obj: &K) -> Result<K> {
        let mut entry = split(obj)?;
        let name = entry.meta.name.clone().unwrap_or_default();
        let mut state = self.store.state.lock();
        let key = self.key(&name);
        if state.objects.contains_key(&key) {
            return Err(Error::already_exists(K::kind(&()), name));
        }
        self.admit(&mut entry, &mut state);
        state.objects.insert(key, entry.clone());
        drop(state);
        self.store.publish(vec![Change {
            kind: kind_key::<K>(),
            deleted: false,
            entry: entry.clone(),
        }]);
        join(&entry)
    }

    fn admit(&self, entry: &mut Entry, state: &mut State) {
        entry.meta.namespace = Some(self.store.namespace.clone());
        entry.meta.uid = Some(uuid::Uuid::new_v4().to_string());
        entry.meta.creation_timestamp = Some(Time(Utc::now()));
        entry.meta.deletion_timestamp = None;
        entry.meta.generation = Some(1);
        entry.meta.resource_version = Some(state.next_revision());
    }

    fn snapshot(&self, state: &State, selector: &LabelSelector) -> Result<Vec<K>> {
        let kind = kind_key::<K>();
        state
            .objects
            .iter()
            .filter(|(k, e)| k.kind == kind && selector.matches(&labels_of(&e.meta)))
            .map(|(_, e)| join(e))
            .collect()
    }
}

#[async_trait]
impl<K: StoreObject> ObjectStore<K> for MemoryApi<K> {
    async fn get(&self, name: &str) -> Result<K> {
        let state = self.store.state.lock();
        match state.objects.get(&self.key(name)) {
            Some(entry) => join(entry),
            None => Err(Error::not_found(K::kind(&()), name)),
        }
    }

    async fn list(&self, selector: &LabelSelector) -> Result<Vec<K>> {
        let state = self.store.state.lock();
        self.snapshot(&state, selector)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let mut entry = split(obj)?;
        entry.body = without_status(entry.body);
        let name = entry.meta.name.clone().unwrap_or_default();
        if name.is_empty() {
            return Err(Error::validation_for(K::kind(&()), "metadata.name is required"));
        }

        let mut state = self.store.state.lock();
        let key = self.key(&name);
        if state.objects.contains_key(&key) {
            return Err(Error::already_exists(K::kind(&()), name));
        }
        self.admit(&mut entry, &mut state);
        state.objects.insert(key, entry.clone());
        drop(state);

        trace!(kind = %K::kind(&()), name = %name, "created");
        self.store.publish(vec![Change {
            kind: kind_key::<K>(),
            deleted: false,
            entry: entry.clone(),
        }]);
        join(&entry)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let incoming = split(obj)?;
        let name = incoming.meta.name.clone().unwrap_or_default();
        let kind = K::kind(&());

        let mut state = self.store.state.lock();
        let key = self.key(&name);
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(kind.as_ref(), &name))?;
        check_version(&stored, &incoming.meta, &kind, &name)?;

        let old_finalizers = finalizers_of(&stored.meta);
        let new_finalizers = finalizers_of(&incoming.meta);
        if stored.meta.deletion_timestamp.is_some()
            && new_finalizers.iter().any(|f| !old_finalizers.contains(f))
        {
            return Err(Error::validation_for(
                name,
                "finalizers cannot be added to an object being deleted",
            ));
        }

        let mut body = without_status(incoming.body);
        if let Some(status) = stored.body.get(STATUS) {
            body.insert(STATUS.into(), status.clone());
        }
        if body == stored.body && same_user_meta(&stored.meta, &incoming.meta) {
            return join(&stored);
        }

        let spec_changed = without_status(body.clone()) != without_status(stored.body.clone());
        let mut meta = stored.meta.clone();
        meta.labels = incoming.meta.labels;
        meta.annotations = incoming.meta.annotations;
        meta.finalizers = incoming.meta.finalizers;
        meta.owner_references = incoming.meta.owner_references;
        if spec_changed {
            meta.generation = Some(meta.generation.unwrap_or(0) + 1);
        }
        meta.resource_version = Some(state.next_revision());

        let entry = Entry { meta, body };
        let mut changes = Vec::new();
        if entry.meta.deletion_timestamp.is_some() && finalizers_of(&entry.meta).is_empty() {
            state.objects.insert(key.clone(), entry.clone());
            state.remove(key, Propagation::Background, &mut changes);
        } else {
            state.objects.insert(key, entry.clone());
            changes.push(Change {
                kind: kind_key::<K>(),
                deleted: false,
                entry: entry.clone(),
            });
        }
        drop(state);

        self.store.publish(changes);
        join(&entry)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let incoming = split(obj)?;
        let name = incoming.meta.name.clone().unwrap_or_default();
        let kind = K::kind(&());

        let mut state = self.store.state.lock();
        let key = self.key(&name);
        let stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(kind.as_ref(), &name))?;
        check_version(&stored, &incoming.meta, &kind, &name)?;

        let mut body = without_status(stored.body.clone());
        if let Some(status) = incoming.body.get(STATUS) {
            body.insert(STATUS.into(), status.clone());
        }
        if body == stored.body {
            return join(&stored);
        }

        let mut meta = stored.meta.clone();
        meta.resource_version = Some(state.next_revision());
        let entry = Entry { meta, body };
        state.objects.insert(key, entry.clone());
        drop(state);

        self.store.publish(vec![Change {
            kind: kind_key::<K>(),
            deleted: false,
            entry: entry.clone(),
        }]);
        join(&entry)
    }

    async fn delete(&self, name: &str, options: &DeleteOptions) -> Result<()> {
        let mut state = self.store.state.lock();
        let key = self.key(name);
        let Some(stored) = state.objects.get(&key) else {
            return Err(Error::not_found(K::kind(&()), name));
        };

        let mut changes = Vec::new();
        if finalizers_of(&stored.meta).is_empty() {
            state.remove(key, options.propagation, &mut changes);
        } else {
            state.mark_deleting(&key, &mut changes);
        }
        drop(state);

        trace!(kind = %K::kind(&()), name = %name, "delete requested");
        self.store.publish(changes);
        Ok(())
    }

    fn watch(&self, selector: &LabelSelector) -> BoxStream<'static, Result<WatchEvent<K>>> {
        // Snapshot and subscribe under one lock so no change falls in between
        let state = self.store.state.lock();
        let initial = self.snapshot(&state, selector);
        let receiver = self.store.events.subscribe();
        drop(state);

        let kind = kind_key::<K>();
        let selector = selector.clone();
        let changes = BroadcastStream::new(receiver).filter_map(move |change| {
            let event = match change {
                Ok(change) if change.kind == kind => {
                    if !selector.matches(&labels_of(&change.entry.meta)) {
                        None
                    } else if change.deleted {
                        Some(join(&change.entry).map(WatchEvent::Deleted))
                    } else {
                        Some(join(&change.entry).map(WatchEvent::Applied))
                    }
                }
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(missed)) => Some(Err(
                    Error::internal_with_context("watch", format!("watcher lagged by {missed} events")),
                )),
            };
            futures::future::ready(event)
        });

        stream::once(futures::future::ready(initial.map(WatchEvent::Restarted)))
            .chain(changes)
            .boxed()
    }
}
