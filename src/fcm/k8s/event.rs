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

use super::meta::ObjectMeta;
use crate::fcm::logger::{log_info, log_warn};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::broadcast;

const DEFAULT_EVENT_RETENTION: usize = 1024;
const WATCH_BUFFER_SIZE: usize = 64;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl ObjectReference {
    pub fn from_meta(kind: &str, meta: &ObjectMeta) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
            uid: meta.uid.clone(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Normal => f.write_str("Normal"),
            EventType::Warning => f.write_str("Warning"),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Event {
    #[serde(rename = "involvedObject")]
    pub involved_object: ObjectReference,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Sink for observability events emitted against resources.
pub trait EventRecorder: Send + Sync {
    fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str);
}

/// Bounded in-process event history with live subscribers.
pub struct InMemoryEventRecorder {
    records: Mutex<VecDeque<Event>>,
    capacity: usize,
    sender: broadcast::Sender<Event>,
}

impl Default for InMemoryEventRecorder {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_RETENTION)
    }
}

impl InMemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_EVENT_RETENTION))),
            capacity: capacity.max(1),
            sender,
        }
    }

    pub fn list(&self) -> Vec<Event> {
        self.records
            .lock()
            .expect("event history lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Events recorded with the given reason, oldest first.
    pub fn with_reason(&self, reason: &str) -> Vec<Event> {
        self.list()
            .into_iter()
            .filter(|event| event.reason == reason)
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl EventRecorder for InMemoryEventRecorder {
    fn record(&self, object: &ObjectReference, event_type: EventType, reason: &str, message: &str) {
        let event = Event {
            involved_object: object.clone(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
        };

        let target = format!("{}/{}/{}", object.kind, object.namespace, object.name);
        let metadata = [("object", target.as_str()), ("reason", reason)];
        match event_type {
            EventType::Normal => log_info("events", message, &metadata),
            EventType::Warning => log_warn("events", message, &metadata),
        }

        {
            let mut records = self.records.lock().expect("event history lock poisoned");
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(event.clone());
        }
        let _ = self.sender.send(event);
    }
}
