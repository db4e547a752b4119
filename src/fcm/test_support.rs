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

//! Fixtures shared by unit and integration tests.

#![allow(dead_code)]

use crate::fcm::config::ControllerConfig;
use crate::fcm::controller::reconcile::{Action, GenericReconciler, ReconcileContext};
use crate::fcm::controller::revision::revision;
use crate::fcm::controller::runtime::ControllerRuntime;
use crate::fcm::controller::set::{DynInfrastructureClient, DynMachineProvider, SetController};
use crate::fcm::controller::timeout::TimeoutController;
use crate::fcm::infrastructure::InMemoryInfrastructure;
use crate::fcm::k8s::condition::{Condition, ConditionStatus};
use crate::fcm::k8s::deployment::{FirewallDeployment, FirewallDeploymentSpec};
use crate::fcm::k8s::event::InMemoryEventRecorder;
use crate::fcm::k8s::firewall::{
    Firewall, FirewallPhase, FirewallSpec, FirewallStatus, FirewallTemplateSpec, MachineStatus,
    TemplateMeta, CONDITION_CONTROLLER_CONNECTED, CONDITION_PROVISIONED, CONDITION_READY,
    CONDITION_SEED_CONNECTED,
};
use crate::fcm::k8s::meta::{is_controlled_by, LabelSelector, ObjectMeta};
use crate::fcm::k8s::set::{FirewallSet, FirewallSetSpec};
use crate::fcm::k8s::{Api, InMemoryStore, Resource, Scheme};
use crate::fcm::provider::cache::ImageCache;
use crate::fcm::provider::memory::InMemoryProvider;
use crate::fcm::util::clock::Clock;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TEST_IMAGE: &str = "firewall-ubuntu-3.0";
pub const SELECTOR_LABEL: &str = "firewall.metal-stack.io/group";

/// Clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).expect("duration in range");
        *self.now.lock().expect("manual clock lock poisoned") += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().expect("manual clock lock poisoned") = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
                .single()
                .expect("valid start time"),
        )
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("manual clock lock poisoned")
    }
}

fn template(group: &str, size: &str) -> FirewallTemplateSpec {
    let mut metadata = TemplateMeta::default();
    metadata
        .labels
        .insert(SELECTOR_LABEL.to_string(), group.to_string());
    FirewallTemplateSpec {
        metadata,
        spec: FirewallSpec {
            size: size.to_string(),
            image: TEST_IMAGE.to_string(),
            partition: "partition-a".to_string(),
            project: "project-a".to_string(),
            networks: vec!["internet".to_string(), "shoot-private".to_string()],
            ..FirewallSpec::default()
        },
    }
}

pub fn firewall_set(namespace: &str, name: &str, replicas: i32, size: &str) -> FirewallSet {
    FirewallSet::new(
        ObjectMeta::new(namespace, name),
        FirewallSetSpec {
            replicas,
            selector: LabelSelector::from_labels([(SELECTOR_LABEL, name)]),
            template: template(name, size),
            ..FirewallSetSpec::default()
        },
    )
}

pub fn deployment(namespace: &str, name: &str, replicas: i32, size: &str) -> FirewallDeployment {
    FirewallDeployment::new(
        ObjectMeta::new(namespace, name),
        FirewallDeploymentSpec {
            replicas,
            selector: LabelSelector::from_labels([(SELECTOR_LABEL, name)]),
            template: template(name, size),
            ..FirewallDeploymentSpec::default()
        },
    )
}

/// Firewall matching the selector of `set` without an owner.
pub fn orphan_firewall(set: &FirewallSet, name: &str) -> Firewall {
    let mut meta = ObjectMeta::new(set.metadata.namespace.clone(), name);
    meta.labels = set.spec.template.metadata.labels.clone();
    Firewall::new(meta, set.spec.template.spec.clone())
}

/// Marks a firewall status as running with every health condition true.
pub fn running(status: &mut FirewallStatus, image: Option<&str>, at: DateTime<Utc>) {
    status.phase = FirewallPhase::Running;
    for kind in [
        CONDITION_PROVISIONED,
        CONDITION_READY,
        CONDITION_CONTROLLER_CONNECTED,
        CONDITION_SEED_CONNECTED,
    ] {
        status
            .conditions
            .set(Condition::new(kind, ConditionStatus::True, kind, "", at));
    }
    let machine = status.machine_status.get_or_insert_with(MachineStatus::default);
    machine.image_id = image.map(str::to_string);
    machine.allocated_at = Some(at);
}

/// In-memory store, provider and infrastructure wired into a runtime that
/// reads time from a [`ManualClock`].
pub struct TestEnv {
    pub clock: Arc<ManualClock>,
    pub store: Arc<InMemoryStore>,
    pub provider: Arc<InMemoryProvider>,
    pub infrastructure: Arc<InMemoryInfrastructure>,
    pub events: Arc<InMemoryEventRecorder>,
    pub runtime: Arc<ControllerRuntime>,
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let provider = Arc::new(InMemoryProvider::new());
        let infrastructure = Arc::new(InMemoryInfrastructure::new());
        let events = Arc::new(InMemoryEventRecorder::new());
        let image_cache = Arc::new(ImageCache::new(config.image_cache_ttl, clock.clone()));

        let runtime = ControllerRuntime::new(store.clone(), Scheme::firewall(), config)
            .with_clock(clock.clone())
            .with_event_recorder(events.clone());
        runtime.register_dependency(Arc::new(DynMachineProvider::new(provider.clone())));
        runtime.register_dependency(Arc::new(DynInfrastructureClient::new(
            infrastructure.clone(),
        )));
        runtime.register_dependency(image_cache);

        Self {
            clock,
            store,
            provider,
            infrastructure,
            events,
            runtime: Arc::new(runtime),
        }
    }

    pub fn context(&self) -> ReconcileContext<'_> {
        self.runtime.context()
    }

    pub fn api<R: Resource>(&self) -> Api<R> {
        Api::new(self.store.clone(), self.runtime.scheme()).expect("kind registered")
    }

    pub fn create<R: Resource>(&self, object: &R) -> R {
        self.api::<R>().create(object).expect("create object")
    }

    pub fn update<R: Resource>(&self, object: &R) -> R {
        self.api::<R>().update(object).expect("update object")
    }

    pub fn get<R: Resource>(&self, namespace: &str, name: &str) -> R {
        self.api::<R>().get(namespace, name).expect("get object")
    }

    pub fn get_opt<R: Resource>(&self, namespace: &str, name: &str) -> Option<R> {
        self.api::<R>().get_opt(namespace, name).expect("get object")
    }

    pub fn delete<R: Resource>(&self, namespace: &str, name: &str) {
        self.api::<R>().delete(namespace, name).expect("delete object");
    }

    /// Live firewalls controlled by `set`, oldest first.
    pub fn owned_firewalls(&self, set: &FirewallSet) -> Vec<Firewall> {
        let set = self.get::<FirewallSet>(&set.metadata.namespace, &set.metadata.name);
        let mut firewalls: Vec<Firewall> = self
            .api::<Firewall>()
            .list(Some(&set.metadata.namespace), None)
            .expect("list firewalls")
            .into_iter()
            .filter(|firewall| {
                is_controlled_by(&firewall.metadata, &set.metadata)
                    && !firewall.metadata.is_being_deleted()
            })
            .collect();
        firewalls.sort_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        firewalls
    }

    /// Live sets controlled by `deployment`, lowest revision first.
    pub fn owned_sets(&self, deployment: &FirewallDeployment) -> Vec<FirewallSet> {
        let mut sets: Vec<FirewallSet> = self
            .api::<FirewallSet>()
            .list(Some(&deployment.metadata.namespace), None)
            .expect("list sets")
            .into_iter()
            .filter(|set| {
                is_controlled_by(&set.metadata, &deployment.metadata)
                    && !set.metadata.is_being_deleted()
            })
            .collect();
        sets.sort_by_key(|set| revision(set).expect("valid revision"));
        sets
    }

    pub fn reconcile_set(&self, set: &FirewallSet) -> Action {
        GenericReconciler::new(SetController::new())
            .reconcile(&self.context(), &set.metadata.namespace, &set.metadata.name)
            .expect("set reconcile")
    }

    pub fn reconcile_timeouts(&self, set: &FirewallSet) -> Action {
        GenericReconciler::new(TimeoutController::new())
            .reconcile(&self.context(), &set.metadata.namespace, &set.metadata.name)
            .expect("timeout reconcile")
    }

    pub fn update_firewall_status(
        &self,
        firewall: &Firewall,
        update: impl FnOnce(&mut FirewallStatus),
    ) -> Firewall {
        let api = self.api::<Firewall>();
        let mut current = api
            .get(&firewall.metadata.namespace, &firewall.metadata.name)
            .expect("get firewall");
        update(&mut current.status);
        api.update_status(&current).expect("update firewall status")
    }

    /// Reports `firewall` as running and healthy, optionally with the image
    /// its machine booted.
    pub fn mark_ready(&self, firewall: &Firewall, image: Option<&str>) -> Firewall {
        let now = self.clock.now();
        self.update_firewall_status(firewall, |status| running(status, image, now))
    }
}
