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

pub mod api;
pub mod condition;
pub mod deployment;
pub mod event;
pub mod firewall;
pub mod meta;
pub mod scheme;
pub mod set;
pub mod store;

pub use api::{retry_on_conflict, Api, Resource};
pub use condition::{Condition, ConditionStatus, Conditions};
pub use deployment::{DeploymentStrategy, FirewallDeployment, FirewallDeploymentSpec};
pub use firewall::{Distance, Firewall, FirewallPhase, FirewallSpec, FirewallTemplateSpec};
pub use meta::{LabelSelector, ObjectMeta, OwnerReference};
pub use scheme::Scheme;
pub use set::{FirewallSet, FirewallSetSpec};
pub use store::{InMemoryStore, ResourceStore, StoreError};
