/*
 * Copyright (C) 2024 The FCM Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Resource store interface and the in-memory implementation used by tests
//! and single-process deployments.
//!
//! Objects travel as JSON documents with Kubernetes-style `metadata`. Every
//! write is checked against `metadata.resourceVersion`; a stale version is
//! rejected with [`StoreError::Conflict`]. Deletion is two-phase: objects that
//! still carry finalizers only receive a `deletionTimestamp` and disappear once
//! the last finalizer is removed. Removing an object deletes every object whose
//! controller reference points at it.

use crate::fcm::k8s::meta::{controller_of, LabelSelector, ObjectMeta};
use crate::fcm::util::clock::{Clock, SystemClock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

const WATCH_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound { kind: String, key: String },
    AlreadyExists { kind: String, key: String },
    Conflict { kind: String, key: String },
    Invalid(String),
    Serialization(String),
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, StoreError::AlreadyExists { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound { kind, key } => write!(f, "{} {} not found", kind, key),
            StoreError::AlreadyExists { kind, key } => {
                write!(f, "{} {} already exists", kind, key)
            }
            StoreError::Conflict { kind, key } => write!(
                f,
                "operation on {} {} rejected: the object has been modified",
                kind, key
            ),
            StoreError::Invalid(message) => write!(f, "invalid object: {}", message),
            StoreError::Serialization(message) => write!(f, "serialization failed: {}", message),
            StoreError::Unavailable(message) => write!(f, "store unavailable: {}", message),
        }
    }
}

impl Error for StoreError {}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Value),
    Modified(Value),
    Deleted(Value),
    /// The receiver fell behind and missed this many events.
    Lagged(u64),
}

impl WatchEvent {
    pub fn object(&self) -> Option<&Value> {
        match self {
            WatchEvent::Added(object) | WatchEvent::Modified(object) | WatchEvent::Deleted(object) => {
                Some(object)
            }
            WatchEvent::Lagged(_) => None,
        }
    }
}

/// Change notifications for one kind, optionally narrowed to a namespace.
pub struct Watch {
    namespace: Option<String>,
    receiver: broadcast::Receiver<WatchEvent>,
}

impl Watch {
    pub fn new(namespace: Option<String>, receiver: broadcast::Receiver<WatchEvent>) -> Self {
        Self {
            namespace,
            receiver,
        }
    }

    /// Returns `None` once the store dropped the channel.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if let (Some(namespace), Some(object)) = (self.namespace.as_deref(), event.object()) {
                        if object_namespace(object) != namespace {
                            continue;
                        }
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Some(WatchEvent::Lagged(missed))
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Strongly consistent object store with optimistic concurrency.
pub trait ResourceStore: Send + Sync {
    fn get(&self, kind: &str, namespace: &str, name: &str) -> Result<Value, StoreError>;

    fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<Value>, StoreError>;

    fn create(&self, kind: &str, object: Value) -> Result<Value, StoreError>;

    /// Replaces metadata and spec. The stored status is kept.
    fn update(&self, kind: &str, object: Value) -> Result<Value, StoreError>;

    /// Replaces only the status of the stored object.
    fn update_status(&self, kind: &str, object: Value) -> Result<Value, StoreError>;

    fn delete(&self, kind: &str, namespace: &str, name: &str) -> Result<(), StoreError>;

    fn watch(&self, kind: &str, namespace: Option<&str>) -> Watch;
}

pub fn object_meta(object: &Value) -> Result<ObjectMeta, StoreError> {
    let metadata = object
        .get("metadata")
        .cloned()
        .ok_or_else(|| StoreError::Invalid("object has no metadata".to_string()))?;
    serde_json::from_value(metadata).map_err(|err| StoreError::Serialization(err.to_string()))
}

pub fn object_namespace(object: &Value) -> &str {
    object
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn write_meta(object: &mut Value, meta: &ObjectMeta) -> Result<(), StoreError> {
    let encoded =
        serde_json::to_value(meta).map_err(|err| StoreError::Serialization(err.to_string()))?;
    match object.as_object_mut() {
        Some(map) => {
            map.insert("metadata".to_string(), encoded);
            Ok(())
        }
        None => Err(StoreError::Invalid("object is not a JSON map".to_string())),
    }
}

fn field(object: &Value, name: &str) -> Value {
    object.get(name).cloned().unwrap_or(Value::Null)
}

fn set_field(object: &mut Value, name: &str, value: Value) {
    if let Some(map) = object.as_object_mut() {
        if value.is_null() {
            map.remove(name);
        } else {
            map.insert(name.to_string(), value);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Create,
    Update,
    UpdateStatus,
    Delete,
}

struct Fault {
    operation: StoreOperation,
    kind: String,
    remaining: usize,
    error: StoreError,
}

type ObjectKey = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectKey, Value>,
    revision: u64,
    writes: u64,
    faults: Vec<Fault>,
}

impl State {
    fn next_revision(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }

    fn take_fault(&mut self, operation: StoreOperation, kind: &str) -> Option<StoreError> {
        let index = self
            .faults
            .iter()
            .position(|fault| fault.operation == operation && fault.kind == kind)?;
        let fault = &mut self.faults[index];
        fault.remaining -= 1;
        let error = fault.error.clone();
        if fault.remaining == 0 {
            self.faults.remove(index);
        }
        Some(error)
    }
}

pub struct InMemoryStore {
    state: Mutex<State>,
    channels: Mutex<HashMap<String, broadcast::Sender<WatchEvent>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            channels: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Number of writes that changed stored state.
    pub fn write_count(&self) -> u64 {
        self.lock_state().writes
    }

    /// Makes the next `times` calls of `operation` on `kind` fail with `error`.
    pub fn fail_next(&self, operation: StoreOperation, kind: &str, times: usize, error: StoreError) {
        if times == 0 {
            return;
        }
        self.lock_state().faults.push(Fault {
            operation,
            kind: kind.to_string(),
            remaining: times,
            error,
        });
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("resource store lock poisoned")
    }

    fn sender(&self, kind: &str) -> broadcast::Sender<WatchEvent> {
        let mut channels = self.channels.lock().expect("watch channel lock poisoned");
        channels
            .entry(kind.to_string())
            .or_insert_with(|| broadcast::channel(WATCH_BUFFER_SIZE).0)
            .clone()
    }

    fn emit(&self, kind: &str, event: WatchEvent) {
        // No receivers is not an error.
        let _ = self.sender(kind).send(event);
    }

    fn key(kind: &str, meta: &ObjectMeta) -> ObjectKey {
        (kind.to_string(), meta.namespace.clone(), meta.name.clone())
    }

    fn delete_locked(&self, state: &mut State, key: ObjectKey) -> Result<(), StoreError> {
        let existing = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: key.0.clone(),
                key: format!("{}/{}", key.1, key.2),
            })?;
        let mut meta = object_meta(&existing)?;

        if !meta.finalizers.is_empty() {
            if meta.deletion_timestamp.is_none() {
                meta.deletion_timestamp = Some(self.clock.now());
                meta.resource_version = Some(state.next_revision());
                let mut updated = existing;
                write_meta(&mut updated, &meta)?;
                state.objects.insert(key.clone(), updated.clone());
                state.writes += 1;
                self.emit(&key.0, WatchEvent::Modified(updated));
            }
            return Ok(());
        }

        self.remove_locked(state, key, existing, meta)
    }

    fn remove_locked(
        &self,
        state: &mut State,
        key: ObjectKey,
        mut last: Value,
        mut meta: ObjectMeta,
    ) -> Result<(), StoreError> {
        state.objects.remove(&key);
        state.writes += 1;
        if meta.deletion_timestamp.is_none() {
            meta.deletion_timestamp = Some(self.clock.now());
            write_meta(&mut last, &meta)?;
        }
        self.emit(&key.0, WatchEvent::Deleted(last));

        let Some(uid) = meta.uid else {
            return Ok(());
        };
        let dependents: Vec<ObjectKey> = state
            .objects
            .iter()
            .filter(|(_, object)| {
                object_meta(object)
                    .ok()
                    .and_then(|child| controller_of(&child).map(|owner| owner.uid == uid))
                    .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for dependent in dependents {
            match self.delete_locked(state, dependent) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn check_version(kind: &str, incoming: &ObjectMeta, existing: &ObjectMeta) -> Result<(), StoreError> {
        match incoming.resource_version.as_deref() {
            Some(version) if Some(version) != existing.resource_version.as_deref() => {
                Err(StoreError::Conflict {
                    kind: kind.to_string(),
                    key: existing.key(),
                })
            }
            _ => Ok(()),
        }
    }
}

impl ResourceStore for InMemoryStore {
    fn get(&self, kind: &str, namespace: &str, name: &str) -> Result<Value, StoreError> {
        let state = self.lock_state();
        state
            .objects
            .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.to_string(),
                key: format!("{}/{}", namespace, name),
            })
    }

    fn list(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: Option<&LabelSelector>,
    ) -> Result<Vec<Value>, StoreError> {
        let state = self.lock_state();
        let mut items = Vec::new();
        for ((object_kind, object_namespace, _), object) in state.objects.iter() {
            if object_kind != kind {
                continue;
            }
            if namespace.is_some_and(|namespace| namespace != object_namespace) {
                continue;
            }
            if let Some(selector) = selector {
                let meta = object_meta(object)?;
                if !selector.matches(&meta.labels) {
                    continue;
                }
            }
            items.push(object.clone());
        }
        Ok(items)
    }

    fn create(&self, kind: &str, mut object: Value) -> Result<Value, StoreError> {
        let mut state = self.lock_state();
        if let Some(error) = state.take_fault(StoreOperation::Create, kind) {
            return Err(error);
        }
        let mut meta = object_meta(&object)?;
        if meta.name.is_empty() {
            return Err(StoreError::Invalid("metadata.name is required".to_string()));
        }
        let key = Self::key(kind, &meta);
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: kind.to_string(),
                key: meta.key(),
            });
        }

        meta.uid = Some(format!("{:032x}", rand::random::<u128>()));
        meta.creation_timestamp = Some(self.clock.now());
        meta.deletion_timestamp = None;
        meta.generation = Some(1);
        meta.resource_version = Some(state.next_revision());
        write_meta(&mut object, &meta)?;

        state.objects.insert(key, object.clone());
        state.writes += 1;
        self.emit(kind, WatchEvent::Added(object.clone()));
        Ok(object)
    }

    fn update(&self, kind: &str, mut object: Value) -> Result<Value, StoreError> {
        let mut state = self.lock_state();
        if let Some(error) = state.take_fault(StoreOperation::Update, kind) {
            return Err(error);
        }
        let mut meta = object_meta(&object)?;
        let key = Self::key(kind, &meta);
        let existing = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.to_string(),
                key: meta.key(),
            })?;
        let existing_meta = object_meta(&existing)?;
        Self::check_version(kind, &meta, &existing_meta)?;

        meta.uid = existing_meta.uid.clone();
        meta.creation_timestamp = existing_meta.creation_timestamp;
        meta.deletion_timestamp = existing_meta.deletion_timestamp;
        meta.resource_version = existing_meta.resource_version.clone();
        let spec_changed = field(&object, "spec") != field(&existing, "spec");
        let generation = existing_meta.generation.unwrap_or(1);
        meta.generation = Some(if spec_changed { generation + 1 } else { generation });
        set_field(&mut object, "status", field(&existing, "status"));
        write_meta(&mut object, &meta)?;

        if meta.deletion_timestamp.is_some() && meta.finalizers.is_empty() {
            let result = object.clone();
            self.remove_locked(&mut state, key, object, meta)?;
            return Ok(result);
        }
        if object == existing {
            return Ok(existing);
        }

        meta.resource_version = Some(state.next_revision());
        write_meta(&mut object, &meta)?;
        state.objects.insert(key, object.clone());
        state.writes += 1;
        self.emit(kind, WatchEvent::Modified(object.clone()));
        Ok(object)
    }

    fn update_status(&self, kind: &str, object: Value) -> Result<Value, StoreError> {
        let mut state = self.lock_state();
        if let Some(error) = state.take_fault(StoreOperation::UpdateStatus, kind) {
            return Err(error);
        }
        let meta = object_meta(&object)?;
        let key = Self::key(kind, &meta);
        let existing = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: kind.to_string(),
                key: meta.key(),
            })?;
        let mut existing_meta = object_meta(&existing)?;
        Self::check_version(kind, &meta, &existing_meta)?;

        let mut updated = existing.clone();
        set_field(&mut updated, "status", field(&object, "status"));
        if updated == existing {
            return Ok(existing);
        }
        existing_meta.resource_version = Some(state.next_revision());
        write_meta(&mut updated, &existing_meta)?;
        state.objects.insert(key, updated.clone());
        state.writes += 1;
        self.emit(kind, WatchEvent::Modified(updated.clone()));
        Ok(updated)
    }

    fn delete(&self, kind: &str, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        if let Some(error) = state.take_fault(StoreOperation::Delete, kind) {
            return Err(error);
        }
        self.delete_locked(
            &mut state,
            (kind.to_string(), namespace.to_string(), name.to_string()),
        )
    }

    fn watch(&self, kind: &str, namespace: Option<&str>) -> Watch {
        Watch::new(namespace.map(str::to_string), self.sender(kind).subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(namespace: &str, name: &str) -> Value {
        json!({
            "metadata": {"name": name, "namespace": namespace},
            "spec": {"size": "a"},
        })
    }

    #[test]
    fn create_assigns_identity_and_rejects_duplicates() {
        let store = InMemoryStore::new();
        let created = store.create("Firewall", object("ns", "fw")).expect("create");
        let meta = object_meta(&created).expect("meta");
        assert!(meta.uid.is_some());
        assert!(meta.creation_timestamp.is_some());
        assert_eq!(meta.resource_version.as_deref(), Some("1"));

        let err = store
            .create("Firewall", object("ns", "fw"))
            .expect_err("duplicate");
        assert!(err.is_already_exists());
    }

    #[test]
    fn stale_resource_version_conflicts() {
        let store = InMemoryStore::new();
        let created = store.create("Firewall", object("ns", "fw")).expect("create");

        let mut first = created.clone();
        first["spec"]["size"] = json!("b");
        store.update("Firewall", first).expect("first update");

        let mut second = created;
        second["spec"]["size"] = json!("c");
        let err = store.update("Firewall", second).expect_err("conflict");
        assert!(err.is_conflict(), "{err}");
    }

    #[test]
    fn update_keeps_status_and_update_status_keeps_spec() {
        let store = InMemoryStore::new();
        let created = store.create("Firewall", object("ns", "fw")).expect("create");

        let mut status_write = created.clone();
        status_write["status"] = json!({"phase": "Running"});
        status_write["spec"]["size"] = json!("ignored");
        let stored = store.update_status("Firewall", status_write).expect("status");
        assert_eq!(stored["spec"]["size"], "a");
        assert_eq!(stored["status"]["phase"], "Running");

        let mut spec_write = stored.clone();
        spec_write["status"] = json!({"phase": "Crashing"});
        spec_write["spec"]["size"] = json!("b");
        let stored = store.update("Firewall", spec_write).expect("update");
        assert_eq!(stored["spec"]["size"], "b");
        assert_eq!(stored["status"]["phase"], "Running");
        assert_eq!(stored["metadata"]["generation"], 2);
    }

    #[test]
    fn unchanged_update_is_not_a_write() {
        let store = InMemoryStore::new();
        let created = store.create("Firewall", object("ns", "fw")).expect("create");
        let writes = store.write_count();
        let stored = store.update("Firewall", created.clone()).expect("update");
        assert_eq!(stored, created);
        assert_eq!(store.write_count(), writes);
    }

    #[test]
    fn finalizers_defer_removal() {
        let store = InMemoryStore::new();
        let mut value = object("ns", "fw");
        value["metadata"]["finalizers"] = json!(["guard"]);
        store.create("Firewall", value).expect("create");

        store.delete("Firewall", "ns", "fw").expect("delete");
        let pending = store.get("Firewall", "ns", "fw").expect("still present");
        let mut meta = object_meta(&pending).expect("meta");
        assert!(meta.is_being_deleted());

        meta.remove_finalizer("guard");
        let mut released = pending;
        write_meta(&mut released, &meta).expect("meta");
        store.update("Firewall", released).expect("release");
        assert!(store
            .get("Firewall", "ns", "fw")
            .expect_err("removed")
            .is_not_found());
    }

    #[test]
    fn removal_cascades_to_controlled_dependents() {
        let store = InMemoryStore::new();
        let parent = store.create("FirewallSet", object("ns", "set")).expect("set");
        let parent_meta = object_meta(&parent).expect("meta");

        let mut child = object("ns", "fw");
        child["metadata"]["ownerReferences"] = json!([{
            "apiVersion": "v2",
            "kind": "FirewallSet",
            "name": "set",
            "uid": parent_meta.uid.clone().expect("uid"),
            "controller": true,
        }]);
        store.create("Firewall", child).expect("child");
        store.create("Firewall", object("ns", "unrelated")).expect("other");

        store.delete("FirewallSet", "ns", "set").expect("delete");
        assert!(store.get("Firewall", "ns", "fw").is_err());
        assert!(store.get("Firewall", "ns", "unrelated").is_ok());
    }

    #[test]
    fn injected_faults_fire_once_per_count() {
        let store = InMemoryStore::new();
        store.fail_next(
            StoreOperation::Create,
            "Firewall",
            1,
            StoreError::Unavailable("etcd leader election".to_string()),
        );
        assert!(store.create("Firewall", object("ns", "a")).is_err());
        assert!(store.create("Firewall", object("ns", "a")).is_ok());
    }

    #[test]
    fn list_filters_namespace_and_selector() {
        let store = InMemoryStore::new();
        let mut labelled = object("ns", "a");
        labelled["metadata"]["labels"] = json!({"app": "fw"});
        store.create("Firewall", labelled).expect("a");
        store.create("Firewall", object("ns", "b")).expect("b");
        store.create("Firewall", object("other", "c")).expect("c");

        assert_eq!(store.list("Firewall", None, None).expect("all").len(), 3);
        assert_eq!(store.list("Firewall", Some("ns"), None).expect("ns").len(), 2);
        let selector = LabelSelector::from_labels([("app", "fw")]);
        let selected = store
            .list("Firewall", Some("ns"), Some(&selector))
            .expect("selected");
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0]["metadata"]["name"], "a");
    }

    #[tokio::test]
    async fn watch_delivers_namespace_scoped_events() {
        let store = InMemoryStore::new();
        let mut watch = store.watch("Firewall", Some("ns"));
        store.create("Firewall", object("other", "skip")).expect("other");
        store.create("Firewall", object("ns", "fw")).expect("fw");

        match watch.next().await {
            Some(WatchEvent::Added(object)) => assert_eq!(object["metadata"]["name"], "fw"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
