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

use super::api::Resource;
use super::condition::Conditions;
use super::meta::ObjectMeta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

pub const API_VERSION: &str = "firewall.metal-stack.io/v2";

/// Guard token keeping deployments, sets and firewalls alive until their
/// children are drained.
pub const FINALIZER: &str = "firewall.metal-stack.io/firewall-controller-manager";

pub const ANNOTATION_REVISION: &str = "firewall.metal-stack.io/revision";
/// Requests a new set generation; removed once the deployment observed it.
pub const ANNOTATION_ROLL_SET: &str = "firewall.metal-stack.io/roll-set";
/// Marks an active maintenance window; removed once the deployment observed it.
pub const ANNOTATION_MAINTAIN: &str = "firewall.metal-stack.io/maintain";
/// Integer importance of a firewall when picking the most relevant one.
pub const ANNOTATION_WEIGHT: &str = "firewall.metal-stack.io/weight";

pub const CONDITION_CREATED: &str = "Created";
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_PROVISIONED: &str = "Provisioned";
pub const CONDITION_CONTROLLER_CONNECTED: &str = "ControllerConnected";
pub const CONDITION_SEED_CONNECTED: &str = "ControllerSeedConnected";
pub const CONDITION_DISTANCE_CONFIGURED: &str = "DistanceConfigured";
pub const CONDITION_MONITOR_DEPLOYED: &str = "MonitorDeployed";

/// Route preference announced by a firewall. Lower values attract traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Distance(pub u8);

impl Distance {
    pub const SHORTEST: Distance = Distance(0);
    pub const ROLLING: Distance = Distance(3);
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallSpec {
    pub size: String,
    pub image: String,
    #[serde(default)]
    pub partition: String,
    #[serde(default)]
    pub project: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<String>,
    /// Hash of the rendered machine userdata, when the caller tracks it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub userdata_hash: Option<String>,
    #[serde(default)]
    pub distance: Distance,
}

/// Labels and annotations copied onto every firewall of a set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateMeta {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallTemplateSpec {
    #[serde(default)]
    pub metadata: TemplateMeta,
    pub spec: FirewallSpec,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirewallPhase {
    #[default]
    Creating,
    Running,
    Crashing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Liveliness {
    Alive,
    Dead,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineLastEvent {
    pub event: String,
    #[serde(default)]
    pub message: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    pub machine_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default)]
    pub liveliness: Liveliness,
    #[serde(default)]
    pub crash_loop: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<MachineLastEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_at: Option<DateTime<Utc>>,
}

/// Values reported back by the agent running on the firewall.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_distance: Option<Distance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAllocation {
    pub network_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ips: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallStatus {
    #[serde(default)]
    pub phase: FirewallPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_status: Option<MachineStatus>,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_status: Option<ControllerStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_allocations: Vec<NetworkAllocation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Firewall {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: FirewallSpec,
    #[serde(default)]
    pub status: FirewallStatus,
}

impl Firewall {
    pub fn new(metadata: ObjectMeta, spec: FirewallSpec) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: <Self as Resource>::KIND.to_string(),
            metadata,
            spec,
            status: FirewallStatus::default(),
        }
    }

    /// Value of the weight annotation; unparsable or missing weights count as 0.
    pub fn weight(&self) -> i64 {
        self.metadata
            .annotation(ANNOTATION_WEIGHT)
            .and_then(|value| value.trim().parse::<i64>().ok())
            .unwrap_or(0)
    }

    pub fn running_image(&self) -> Option<&str> {
        self.status
            .machine_status
            .as_ref()
            .and_then(|status| status.image_id.as_deref())
    }
}

impl Resource for Firewall {
    const API_VERSION: &'static str = API_VERSION;
    const KIND: &'static str = "Firewall";
    type Status = FirewallStatus;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn status(&self) -> &FirewallStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut FirewallStatus {
        &mut self.status
    }
}
