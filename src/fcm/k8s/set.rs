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
use super::firewall::{Distance, FirewallTemplateSpec, API_VERSION};
use super::meta::{LabelSelector, ObjectMeta};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallSetSpec {
    pub replicas: i32,
    #[serde(default)]
    pub selector: LabelSelector,
    pub template: FirewallTemplateSpec,
    #[serde(default)]
    pub distance: Distance,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallSetStatus {
    #[serde(default)]
    pub target_replicas: i32,
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub progressing_replicas: i32,
    #[serde(default)]
    pub unhealthy_replicas: i32,
    #[serde(default)]
    pub observed_revision: i64,
    #[serde(default)]
    pub conditions: Conditions,
}

/// One generation of firewalls stamped out from a deployment template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallSet {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: FirewallSetSpec,
    #[serde(default)]
    pub status: FirewallSetStatus,
}

impl FirewallSet {
    pub fn new(metadata: ObjectMeta, spec: FirewallSetSpec) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: <Self as Resource>::KIND.to_string(),
            metadata,
            spec,
            status: FirewallSetStatus::default(),
        }
    }

    pub fn is_fully_ready(&self) -> bool {
        self.status.ready_replicas >= self.spec.replicas
    }
}

impl Resource for FirewallSet {
    const API_VERSION: &'static str = API_VERSION;
    const KIND: &'static str = "FirewallSet";
    type Status = FirewallSetStatus;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn status(&self) -> &FirewallSetStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut FirewallSetStatus {
        &mut self.status
    }
}
