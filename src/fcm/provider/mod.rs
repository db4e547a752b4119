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

//! Provisioning API consumed by the controllers. Machines, images and
//! networks live in an external bare-metal inventory; the controllers only
//! need to look them up and, at the firewall level, allocate or free them.

pub mod cache;
pub mod memory;

pub use cache::ImageCache;
pub use memory::InMemoryProvider;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    NotFound(String),
    Unavailable(String),
    Invalid(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::NotFound(what) => write!(f, "{} not found", what),
            ProviderError::Unavailable(message) => {
                write!(f, "provisioning api unavailable: {}", message)
            }
            ProviderError::Invalid(message) => write!(f, "invalid request: {}", message),
        }
    }
}

impl Error for ProviderError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub hostname: String,
    pub project: String,
    pub partition: String,
    pub size: String,
    pub image: String,
    #[serde(default)]
    pub networks: Vec<String>,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineFilter {
    pub project: Option<String>,
    pub partition: Option<String>,
    pub hostname: Option<String>,
}

impl MachineFilter {
    pub fn matches(&self, machine: &Machine) -> bool {
        let matches = |wanted: &Option<String>, actual: &str| {
            wanted.as_deref().map_or(true, |wanted| wanted == actual)
        };
        matches(&self.project, &machine.project)
            && matches(&self.partition, &machine.partition)
            && matches(&self.hostname, &machine.hostname)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineAllocation {
    pub hostname: String,
    pub project: String,
    pub partition: String,
    pub size: String,
    pub image: String,
    pub networks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Fully qualified id, e.g. `firewall-ubuntu-3.0.20240503`.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkKind {
    External,
    Private,
    Underlay,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub kind: NetworkKind,
    #[serde(default)]
    pub prefixes: Vec<String>,
}

/// Bare-metal provisioning API. Calls block until the remote side answered.
pub trait MachineProvider: Send + Sync {
    fn find_machines(&self, filter: &MachineFilter) -> Result<Vec<Machine>, ProviderError>;
    fn allocate_machine(&self, allocation: &MachineAllocation) -> Result<Machine, ProviderError>;
    fn free_machine(&self, id: &str) -> Result<(), ProviderError>;
    /// Resolves an image shorthand such as `firewall-ubuntu-3.0` to the newest
    /// concrete image.
    fn find_latest_image(&self, shorthand: &str) -> Result<Image, ProviderError>;
    fn find_network(&self, id: &str) -> Result<Network, ProviderError>;
}
