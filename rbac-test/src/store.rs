//! An in-memory [`Store`] with API-server-like write semantics.

use ahash::AHashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use parking_lot::Mutex;
use rbac_controller_k8s_api::{labels::Map, ResourceExt};
use rbac_controller_k8s_rbac::store::{Error, Object, Result, Store};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};

/// Objects are stored as JSON keyed by kind, namespace and name. Every write
/// bumps a global resource version and `replace` rejects stale versions.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore(Arc<Mutex<State>>);

/// A delete call observed by the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Deleted {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
    pub grace_period_seconds: Option<u32>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    version: u64,
    conflicts: AHashMap<Key, usize>,
    timeouts: AHashMap<Key, usize>,
    writes: AHashMap<Key, usize>,
    deleted: Vec<Deleted>,
    after_list: AfterList,
}

type Hook = Box<dyn FnOnce(&MemoryStore) + Send>;

/// Callbacks run once, by kind, after a list call has read its objects.
#[derive(Default)]
struct AfterList(AHashMap<String, Vec<Hook>>);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Key {
    kind: String,
    namespace: String,
    name: String,
}

// === impl MemoryStore ===

impl MemoryStore {
    /// Stores `obj` as-is, assigning a uid and resource version.
    pub fn insert<K: Object>(&self, mut obj: K) -> K {
        let mut state = self.0.lock();
        let key = Key::of(&obj);
        if obj.meta().uid.is_none() {
            obj.meta_mut().uid = Some(format!("uid-{}-{}", key.kind, key.name));
        }
        state.version += 1;
        obj.meta_mut().resource_version = Some(state.version.to_string());
        let value = serde_json::to_value(&obj).expect("objects must serialize");
        state.objects.insert(key, value);
        obj
    }

    /// Reads an object without going through the async interface.
    pub fn fetch<K: Object>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let state = self.0.lock();
        state
            .objects
            .get(&Key::new::<K>(namespace, name))
            .map(|v| serde_json::from_value(v.clone()).expect("objects must deserialize"))
    }

    /// Lists every object of a kind.
    pub fn all<K: Object>(&self) -> Vec<K> {
        let kind = K::kind(&()).to_string();
        let state = self.0.lock();
        state
            .objects
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .map(|(_, v)| serde_json::from_value(v.clone()).expect("objects must deserialize"))
            .collect()
    }

    /// Fails the next `times` writes of the named object with a conflict.
    pub fn inject_conflicts<K: Object>(&self, namespace: Option<&str>, name: &str, times: usize) {
        self.0
            .lock()
            .conflicts
            .insert(Key::new::<K>(namespace, name), times);
    }

    /// Fails the next `times` writes of the named object with a timeout.
    pub fn inject_timeouts<K: Object>(&self, namespace: Option<&str>, name: &str, times: usize) {
        self.0
            .lock()
            .timeouts
            .insert(Key::new::<K>(namespace, name), times);
    }

    /// Counts create, replace and status calls made for the named object,
    /// including ones that failed.
    pub fn writes<K: Object>(&self, namespace: Option<&str>, name: &str) -> usize {
        self.0
            .lock()
            .writes
            .get(&Key::new::<K>(namespace, name))
            .copied()
            .unwrap_or(0)
    }

    /// Runs `f` once, right after the next list of `K` has read its
    /// objects, to stand in for a write racing that list.
    pub fn after_list<K: Object>(&self, f: impl FnOnce(&MemoryStore) + Send + 'static) {
        self.0
            .lock()
            .after_list
            .0
            .entry(K::kind(&()).to_string())
            .or_default()
            .push(Box::new(f));
    }

    pub fn deleted(&self) -> Vec<Deleted> {
        self.0.lock().deleted.clone()
    }

    fn write<K: Object>(
        &self,
        obj: &K,
        f: impl FnOnce(&mut State, Key, Value) -> Result<Value>,
    ) -> Result<K> {
        let mut state = self.0.lock();
        let key = Key::of(obj);
        *state.writes.entry(key.clone()).or_default() += 1;
        if take(&mut state.conflicts, &key) {
            return Err(Error::Conflict(format!("injected conflict for {}", key.name)));
        }
        if take(&mut state.timeouts, &key) {
            return Err(Error::Timeout(std::time::Duration::from_secs(5)));
        }

        let value = serde_json::to_value(obj)?;
        let stored = f(&mut state, key, value)?;
        Ok(serde_json::from_value(stored)?)
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        let state = self.0.lock();
        match state.objects.get(&Key::new::<K>(namespace, name)) {
            Some(v) => Ok(Some(serde_json::from_value(v.clone())?)),
            None => Ok(None),
        }
    }

    async fn list<K: Object>(&self, labels: &Map) -> Result<Vec<K>> {
        let kind = K::kind(&()).to_string();
        let (objects, hooks) = {
            let mut state = self.0.lock();
            let mut objects = Vec::new();
            for (key, value) in state.objects.iter().filter(|(k, _)| k.kind == kind) {
                let obj: K = serde_json::from_value(value.clone())?;
                let matches = labels
                    .iter()
                    .all(|(k, v)| obj.labels().get(k) == Some(v));
                if matches {
                    tracing::trace!(name = %key.name, "Listed");
                    objects.push(obj);
                }
            }
            let hooks = state.after_list.0.remove(&kind).unwrap_or_default();
            (objects, hooks)
        };

        for hook in hooks {
            hook(self);
        }
        Ok(objects)
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        self.write(obj, |state, key, mut value| {
            if state.objects.contains_key(&key) {
                return Err(Error::AlreadyExists(format!("{} already exists", key.name)));
            }
            state.version += 1;
            let meta = &mut value["metadata"];
            meta["resourceVersion"] = state.version.to_string().into();
            meta["uid"] = format!("uid-{}-{}", key.kind, key.name).into();
            state.objects.insert(key, value.clone());
            Ok(value)
        })
    }

    async fn replace<K: Object>(&self, obj: &K) -> Result<K> {
        self.write(obj, |state, key, mut value| {
            let existing = state.objects.get(&key).ok_or(Error::NotFound)?;
            let current = existing["metadata"]["resourceVersion"].clone();
            let requested = value["metadata"]["resourceVersion"].clone();
            if !requested.is_null() && requested != current {
                return Err(Error::Conflict(format!(
                    "{} has resource version {current}, not {requested}",
                    key.name
                )));
            }

            // Status is only written through the status subresource.
            match existing.get("status") {
                Some(status) => value["status"] = status.clone(),
                None => {
                    if let Some(obj) = value.as_object_mut() {
                        obj.remove("status");
                    }
                }
            }
            for field in ["uid", "deletionTimestamp", "creationTimestamp"] {
                if let Some(v) = existing["metadata"].get(field) {
                    value["metadata"][field] = v.clone();
                }
            }

            let finalized = value["metadata"].get("deletionTimestamp").is_some()
                && value["metadata"]["finalizers"]
                    .as_array()
                    .map_or(true, Vec::is_empty);
            if finalized {
                state.objects.remove(&key);
                return Ok(value);
            }

            state.version += 1;
            value["metadata"]["resourceVersion"] = state.version.to_string().into();
            state.objects.insert(key, value.clone());
            Ok(value)
        })
    }

    async fn update_status<K: Object>(&self, obj: &K) -> Result<()> {
        self.write(obj, |state, key, value| {
            let existing = state.objects.get_mut(&key).ok_or(Error::NotFound)?;
            existing["status"] = value.get("status").cloned().unwrap_or(Value::Null);
            state.version += 1;
            existing["metadata"]["resourceVersion"] = state.version.to_string().into();
            Ok(existing.clone())
        })?;
        Ok(())
    }

    async fn delete<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<()> {
        let key = Key::new::<K>(namespace, name);
        let mut guard = self.0.lock();
        let state = &mut *guard;
        let value = state.objects.get_mut(&key).ok_or(Error::NotFound)?;
        state.deleted.push(Deleted {
            kind: key.kind.clone(),
            namespace: namespace.map(Into::into),
            name: name.to_string(),
            grace_period_seconds,
        });

        let has_finalizers = value["metadata"]["finalizers"]
            .as_array()
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            let now = Time(chrono::Utc::now());
            value["metadata"]["deletionTimestamp"] = serde_json::to_value(now)?;
            return Ok(());
        }

        state.objects.remove(&key);
        // Namespaced objects are garbage collected with their namespace.
        if key.kind == "Namespace" {
            state.objects.retain(|k, _| k.namespace != key.name);
        }
        Ok(())
    }
}

// === impl AfterList ===

impl std::fmt::Debug for AfterList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.0.iter().map(|(kind, hooks)| (kind, hooks.len())))
            .finish()
    }
}

// === impl Key ===

impl Key {
    fn new<K: Object>(namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind: K::kind(&()).to_string(),
            namespace: if K::NAMESPACED {
                namespace.unwrap_or_default().to_string()
            } else {
                String::new()
            },
            name: name.to_string(),
        }
    }

    fn of<K: Object>(obj: &K) -> Self {
        Self::new::<K>(obj.namespace().as_deref(), &obj.name_any())
    }
}

fn take(injected: &mut AHashMap<Key, usize>, key: &Key) -> bool {
    match injected.get_mut(key) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}
