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
use super::firewall::{FirewallTemplateSpec, API_VERSION};
use super::meta::{LabelSelector, ObjectMeta};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const CONDITION_AVAILABLE: &str = "Available";
pub const CONDITION_PROGRESSING: &str = "Progressing";

pub const REASON_NEW_SET_CREATED: &str = "NewFirewallSetCreated";
pub const REASON_SET_UPDATED: &str = "FirewallSetUpdated";
pub const REASON_NEW_SET_AVAILABLE: &str = "NewFirewallSetAvailable";
pub const REASON_PROGRESS_DEADLINE_EXCEEDED: &str = "ProgressDeadlineExceeded";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentStrategy {
    #[default]
    RollingUpdate,
    Recreate,
}

impl fmt::Display for DeploymentStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentStrategy::RollingUpdate => f.write_str("RollingUpdate"),
            DeploymentStrategy::Recreate => f.write_str("Recreate"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoUpdate {
    /// Roll to the latest image of the configured shorthand during maintenance.
    #[serde(default)]
    pub machine_image: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallDeploymentSpec {
    pub replicas: i32,
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default)]
    pub strategy: DeploymentStrategy,
    pub template: FirewallTemplateSpec,
    #[serde(default)]
    pub auto_update: AutoUpdate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallDeploymentStatus {
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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallDeployment {
    #[serde(rename = "apiVersion", default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: FirewallDeploymentSpec,
    #[serde(default)]
    pub status: FirewallDeploymentStatus,
}

impl FirewallDeployment {
    pub fn new(metadata: ObjectMeta, spec: FirewallDeploymentSpec) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: <Self as Resource>::KIND.to_string(),
            metadata,
            spec,
            status: FirewallDeploymentStatus::default(),
        }
    }
}

impl Resource for FirewallDeployment {
    const API_VERSION: &'static str = API_VERSION;
    const KIND: &'static str = "FirewallDeployment";
    type Status = FirewallDeploymentStatus;

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn status(&self) -> &FirewallDeploymentStatus {
        &self.status
    }

    fn status_mut(&mut self) -> &mut FirewallDeploymentStatus {
        &mut self.status
    }
}
