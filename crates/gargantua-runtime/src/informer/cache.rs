//! Indexed local copy of one resource kind

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use gargantua_common::labels::LabelSelector;
use gargantua_common::names::object_key;
use gargantua_common::store::StoreObject;
use kube::ResourceExt;
use parking_lot::RwLock;

use super::InformerEvent;

type LabelIndex = HashMap<(String, String), BTreeSet<String>>;

struct CacheState<K> {
    objects: BTreeMap<String, Arc<K>>,
    by_label: LabelIndex,
}

impl<K> Default for CacheState<K> {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            by_label: HashMap::new(),
        }
    }
}

fn key_of<K: StoreObject>(obj: &K) -> String {
    object_key(&obj.namespace().unwrap_or_default(), &obj.name_any())
}

impl<K: StoreObject> CacheState<K> {
    fn index(&mut self, key: &str, obj: &K) {
        for (k, v) in obj.labels() {
            self.by_label
                .entry((k.clone(), v.clone()))
                .or_default()
                .insert(key.to_string());
        }
    }

    fn unindex(&mut self, key: &str, obj: &K) {
        for (k, v) in obj.labels() {
            let term = (k.clone(), v.clone());
            if let Some(keys) = self.by_label.get_mut(&term) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_label.remove(&term);
                }
            }
        }
    }

    fn insert(&mut self, obj: Arc<K>) -> Option<Arc<K>> {
        let key = key_of(obj.as_ref());
        let old = self.objects.insert(key.clone(), obj.clone());
        if let Some(old) = &old {
            self.unindex(&key, old);
        }
        self.index(&key, &obj);
        old
    }

    fn remove(&mut self, key: &str) -> Option<Arc<K>> {
        let old = self.objects.remove(key)?;
        self.unindex(key, &old);
        Some(old)
    }
}

/// Shared, label-indexed map of `namespace/name` to object
///
/// Cloning shares the same underlying map. Readers get `Arc`s and never see
/// a partially applied change.
pub struct Cache<K> {
    state: Arc<RwLock<CacheState<K>>>,
}

impl<K> Clone for Cache<K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<K: StoreObject> Default for Cache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StoreObject> Cache<K> {
    /// Empty cache
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(CacheState::default())),
        }
    }

    /// Store or replace an object, returning the event it amounts to
    pub fn insert(&self, obj: K) -> InformerEvent<K> {
        let new = Arc::new(obj);
        match self.state.write().insert(new.clone()) {
            Some(old) => InformerEvent::Updated { old, new },
            None => InformerEvent::Added(new),
        }
    }

    /// Drop an object; `None` when it was not cached
    pub fn remove(&self, obj: &K) -> Option<InformerEvent<K>> {
        self.state
            .write()
            .remove(&key_of(obj))
            .map(InformerEvent::Deleted)
    }

    /// Swap in a full snapshot and return the difference as events
    ///
    /// Objects missing from the snapshot come back as deletions, new ones as
    /// additions and the rest as updates.
    pub fn replace(&self, objects: Vec<K>) -> Vec<InformerEvent<K>> {
        let mut state = self.state.write();
        let mut stale: BTreeSet<String> = state.objects.keys().cloned().collect();
        let mut events = Vec::with_capacity(objects.len());

        for obj in objects {
            let new = Arc::new(obj);
            stale.remove(&key_of(new.as_ref()));
            events.push(match state.insert(new.clone()) {
                Some(old) => InformerEvent::Updated { old, new },
                None => InformerEvent::Added(new),
            });
        }
        for key in stale {
            if let Some(old) = state.remove(&key) {
                events.push(InformerEvent::Deleted(old));
            }
        }
        events
    }

    /// Look up by namespace and name
    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        self.state
            .read()
            .objects
            .get(&object_key(namespace, name))
            .cloned()
    }

    /// Every cached object, ordered by key
    pub fn list(&self) -> Vec<Arc<K>> {
        self.state.read().objects.values().cloned().collect()
    }

    /// Objects matching every term of `selector`, ordered by key
    pub fn select(&self, selector: &LabelSelector) -> Vec<Arc<K>> {
        let state = self.state.read();
        if selector.is_empty() {
            return state.objects.values().cloned().collect();
        }

        let mut candidates: Option<BTreeSet<String>> = None;
        for (k, v) in selector.terms() {
            let Some(keys) = state.by_label.get(&(k.to_string(), v.to_string())) else {
                return Vec::new();
            };
            candidates = Some(match candidates {
                None => keys.clone(),
                Some(current) => current.intersection(keys).cloned().collect(),
            });
        }

        candidates
            .unwrap_or_default()
            .iter()
            .filter_map(|key| state.objects.get(key).cloned())
            .collect()
    }

    /// Objects satisfying `predicate`, ordered by key
    pub fn find(&self, predicate: impl Fn(&K) -> bool) -> Vec<Arc<K>> {
        self.state
            .read()
            .objects
            .values()
            .filter(|obj| predicate(obj))
            .cloned()
            .collect()
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.state.read().objects.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
