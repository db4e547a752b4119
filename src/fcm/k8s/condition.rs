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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
    #[serde(rename = "lastUpdateTime")]
    pub last_update_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        kind: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            kind: kind.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: now,
            last_update_time: now,
        }
    }
}

/// Condition set with at most one entry per type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn get(&self, kind: &str) -> Option<&Condition> {
        self.0.iter().find(|condition| condition.kind == kind)
    }

    pub fn is_true(&self, kind: &str) -> bool {
        self.status(kind) == ConditionStatus::True
    }

    pub fn is_false(&self, kind: &str) -> bool {
        self.status(kind) == ConditionStatus::False
    }

    /// Missing conditions report `Unknown`.
    pub fn status(&self, kind: &str) -> ConditionStatus {
        self.get(kind)
            .map(|condition| condition.status)
            .unwrap_or(ConditionStatus::Unknown)
    }

    /// Replaces the entry of the same type. `last_transition_time` is carried
    /// over from the existing entry unless the status changed.
    pub fn set(&mut self, mut condition: Condition) {
        match self.0.iter_mut().find(|entry| entry.kind == condition.kind) {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                }
                *existing = condition;
            }
            None => self.0.push(condition),
        }
    }

    /// Like [`Conditions::set`], but leaves the entry untouched when status,
    /// reason and message are unchanged. Returns `true` if it wrote.
    pub fn set_if_changed(&mut self, condition: Condition) -> bool {
        let unchanged = self.get(&condition.kind).is_some_and(|existing| {
            existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message
        });
        if unchanged {
            return false;
        }
        self.set(condition);
        true
    }

    pub fn remove(&mut self, kind: &str) {
        self.0.retain(|condition| condition.kind != kind);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Condition> for Conditions {
    fn from_iter<T: IntoIterator<Item = Condition>>(iter: T) -> Self {
        let mut conditions = Conditions::default();
        for condition in iter {
            conditions.set(condition);
        }
        conditions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn transition_time_only_moves_on_status_change() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(30);
        let t2 = t0 + Duration::seconds(60);
        let mut conditions = Conditions::default();

        conditions.set(Condition::new("Ready", ConditionStatus::False, "Booting", "", t0));
        conditions.set(Condition::new("Ready", ConditionStatus::False, "StillBooting", "", t1));
        let ready = conditions.get("Ready").expect("ready condition");
        assert_eq!(ready.last_transition_time, t0);
        assert_eq!(ready.last_update_time, t1);
        assert_eq!(ready.reason, "StillBooting");

        conditions.set(Condition::new("Ready", ConditionStatus::True, "Up", "", t2));
        let ready = conditions.get("Ready").expect("ready condition");
        assert_eq!(ready.last_transition_time, t2);
        assert_eq!(conditions.len(), 1);
    }

    #[test]
    fn unchanged_conditions_are_not_rewritten() {
        let t0 = Utc::now();
        let mut conditions = Conditions::default();
        assert!(conditions.set_if_changed(Condition::new("Available", ConditionStatus::True, "Ready", "", t0)));
        let later = t0 + Duration::seconds(5);
        assert!(!conditions.set_if_changed(Condition::new("Available", ConditionStatus::True, "Ready", "", later)));
        assert_eq!(conditions.get("Available").map(|c| c.last_update_time), Some(t0));
        assert!(conditions.set_if_changed(Condition::new("Available", ConditionStatus::True, "Other", "", later)));
        assert_eq!(conditions.get("Available").map(|c| c.last_update_time), Some(later));
    }

    #[test]
    fn missing_condition_is_unknown() {
        let conditions = Conditions::default();
        assert_eq!(conditions.status("Provisioned"), ConditionStatus::Unknown);
        assert!(!conditions.is_true("Provisioned"));
        assert!(!conditions.is_false("Provisioned"));
    }

    #[test]
    fn serializes_as_plain_list() {
        let now = Utc::now();
        let conditions: Conditions =
            [Condition::new("Created", ConditionStatus::True, "", "", now)]
                .into_iter()
                .collect();
        let value = serde_json::to_value(&conditions).expect("serialize");
        assert!(value.is_array());
        assert_eq!(value[0]["type"], "Created");
        assert_eq!(value[0]["status"], "True");
    }
}
