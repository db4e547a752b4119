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

use fcm::fcm::controller::reconcile::{Action, GenericReconciler};
use fcm::fcm::controller::SetController;
use fcm::fcm::infrastructure::InfrastructureClient;
use fcm::fcm::k8s::condition::{Condition, ConditionStatus};
use fcm::fcm::k8s::firewall::{Firewall, NetworkAllocation, CONDITION_READY};
use fcm::fcm::k8s::meta::OwnerReference;
use fcm::fcm::k8s::set::FirewallSet;
use fcm::fcm::k8s::store::{StoreError, StoreOperation};
use fcm::fcm::provider::NetworkKind;
use fcm::fcm::test_support::{firewall_set, orphan_firewall, running, TestEnv};
use fcm::fcm::util::Clock;
use std::time::Duration;

const NAMESPACE: &str = "shoot";
const NAME: &str = "fw-set";

fn scale(env: &TestEnv, replicas: i32) {
    let mut set = env.get::<FirewallSet>(NAMESPACE, NAME);
    set.spec.replicas = replicas;
    env.update(&set);
}

#[test]
fn second_pass_without_changes_writes_nothing() {
    let env = TestEnv::new();
    let set = env.create(&firewall_set(NAMESPACE, NAME, 2, "n1-medium"));
    env.reconcile_set(&set);
    let firewalls = env.owned_firewalls(&set);
    let writes = env.store.write_count();

    env.reconcile_set(&set);

    assert_eq!(env.store.write_count(), writes);
    assert_eq!(env.owned_firewalls(&set), firewalls);
}

#[test]
fn replica_count_converges_after_failed_creates() {
    let env = TestEnv::new();
    let set = env.create(&firewall_set(NAMESPACE, NAME, 3, "n1-medium"));
    env.store.fail_next(
        StoreOperation::Create,
        "Firewall",
        1,
        StoreError::Unavailable("injected".to_string()),
    );

    let reconciler = GenericReconciler::new(SetController::new());
    reconciler
        .reconcile(&env.context(), NAMESPACE, NAME)
        .expect_err("create failure surfaces");
    assert!(env.owned_firewalls(&set).len() < 3);

    env.reconcile_set(&set);
    assert_eq!(env.owned_firewalls(&set).len(), 3);

    for replicas in [1, 0, 2] {
        scale(&env, replicas);
        env.reconcile_set(&set);
        assert_eq!(env.owned_firewalls(&set).len(), replicas as usize);
    }
}

#[test]
fn scale_down_keeps_the_newest_firewall() {
    let env = TestEnv::new();
    let set = env.create(&firewall_set(NAMESPACE, NAME, 1, "n1-medium"));
    env.reconcile_set(&set);
    for replicas in [2, 3] {
        env.clock.advance(Duration::from_secs(60));
        scale(&env, replicas);
        env.reconcile_set(&set);
    }
    let firewalls = env.owned_firewalls(&set);
    assert_eq!(firewalls.len(), 3);
    let newest = firewalls.last().expect("newest firewall").metadata.name.clone();

    scale(&env, 1);
    env.reconcile_set(&set);

    let survivors = env.owned_firewalls(&set);
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].metadata.name, newest);
}

#[test]
fn orphans_matching_the_selector_are_adopted() {
    let env = TestEnv::new();
    let set = env.create(&firewall_set(NAMESPACE, NAME, 1, "n1-medium"));
    env.create(&orphan_firewall(&set, "orphan"));

    env.reconcile_set(&set);

    let firewalls = env.owned_firewalls(&set);
    assert_eq!(firewalls.len(), 1);
    assert_eq!(firewalls[0].metadata.name, "orphan");
}

#[test]
fn orphans_being_deleted_are_not_adopted() {
    let env = TestEnv::new();
    let set = env.create(&firewall_set(NAMESPACE, NAME, 1, "n1-medium"));
    let mut leaving = orphan_firewall(&set, "leaving");
    leaving
        .metadata
        .finalizers
        .push("firewall.metal-stack.io/cleanup".to_string());
    env.create(&leaving);
    env.delete::<Firewall>(NAMESPACE, "leaving");

    env.reconcile_set(&set);

    let leaving = env.get::<Firewall>(NAMESPACE, "leaving");
    assert!(leaving.metadata.is_being_deleted());
    assert!(leaving.metadata.owner_references.is_empty());
    let firewalls = env.owned_firewalls(&set);
    assert_eq!(firewalls.len(), 1);
    assert_ne!(firewalls[0].metadata.name, "leaving");
}

#[test]
fn firewalls_referenced_by_another_owner_are_not_adopted() {
    let env = TestEnv::new();
    let set = env.create(&firewall_set(NAMESPACE, NAME, 1, "n1-medium"));
    let mut foreign = orphan_firewall(&set, "foreign");
    foreign.metadata.owner_references.push(OwnerReference {
        api_version: "v1".to_string(),
        kind: "Secret".to_string(),
        name: "credentials".to_string(),
        uid: "foreign-uid".to_string(),
        controller: None,
        block_owner_deletion: None,
    });
    env.create(&foreign);

    env.reconcile_set(&set);

    let foreign = env.get::<Firewall>(NAMESPACE, "foreign");
    assert_eq!(foreign.metadata.owner_references.len(), 1);
    assert_eq!(foreign.metadata.owner_references[0].uid, "foreign-uid");
    let firewalls = env.owned_firewalls(&set);
    assert_eq!(firewalls.len(), 1);
    assert_ne!(firewalls[0].metadata.name, "foreign");
}

#[test]
fn timed_out_firewalls_are_replaced() {
    let env = TestEnv::new();
    let set = env.create(&firewall_set(NAMESPACE, NAME, 2, "n1-medium"));
    env.reconcile_set(&set);
    let firewalls = env.owned_firewalls(&set);
    let start = env.clock.now();

    let broken = firewalls[0].clone();
    env.update_firewall_status(&broken, |status| {
        running(status, None, start);
        status.conditions.set(Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            "NotReady",
            "",
            start,
        ));
    });
    let degraded = firewalls[1].clone();
    let later = start + chrono::Duration::minutes(10);
    env.update_firewall_status(&degraded, |status| {
        running(status, None, start);
        status.conditions.set(Condition::new(
            CONDITION_READY,
            ConditionStatus::False,
            "NotReady",
            "",
            later,
        ));
    });

    let health_timeout = env.runtime.config().health_timeout;
    env.clock.advance(health_timeout + Duration::from_secs(1));
    let action = env.reconcile_timeouts(&set);

    let remaining = health_timeout - Duration::from_secs(10 * 60 + 1);
    assert_eq!(
        action,
        Action::RequeueAfter {
            after: remaining,
            reason: "firewall timeout pending".to_string()
        }
    );
    assert!(env.get_opt::<Firewall>(NAMESPACE, &broken.metadata.name).is_none());

    env.reconcile_set(&set);
    let firewalls = env.owned_firewalls(&set);
    assert_eq!(firewalls.len(), 2);
    assert!(firewalls.iter().any(|fw| fw.metadata.name == degraded.metadata.name));
}

#[test]
fn egress_addresses_follow_external_allocations() {
    let env = TestEnv::new();
    env.provider
        .add_network("internet", NetworkKind::External, &["185.1.2.0/24"]);
    env.provider
        .add_network("shoot-private", NetworkKind::Private, &["10.0.0.0/22"]);
    let set = env.create(&firewall_set(NAMESPACE, NAME, 1, "n1-medium"));
    env.reconcile_set(&set);

    let firewall = env.owned_firewalls(&set).remove(0);
    env.update_firewall_status(&firewall, |status| {
        status.network_allocations = vec![
            NetworkAllocation {
                network_id: "internet".to_string(),
                ips: vec!["185.1.2.3".to_string()],
            },
            NetworkAllocation {
                network_id: "shoot-private".to_string(),
                ips: vec!["10.0.0.5".to_string()],
            },
        ];
    });

    env.reconcile_set(&set);
    env.reconcile_set(&set);

    assert_eq!(
        env.infrastructure.egress_cidrs(NAMESPACE).expect("egress record"),
        vec!["185.1.2.3/32".to_string()]
    );
    assert_eq!(env.infrastructure.patch_count(), 1);
}

#[test]
fn deleting_a_set_drains_its_firewalls() {
    let env = TestEnv::new();
    let set = env.create(&firewall_set(NAMESPACE, NAME, 2, "n1-medium"));
    env.reconcile_set(&set);
    assert_eq!(env.owned_firewalls(&set).len(), 2);

    env.delete::<FirewallSet>(NAMESPACE, NAME);
    assert_eq!(env.reconcile_set(&set), Action::Done);

    assert!(env.get_opt::<FirewallSet>(NAMESPACE, NAME).is_none());
    assert!(env
        .api::<Firewall>()
        .list(Some(NAMESPACE), None)
        .expect("list firewalls")
        .is_empty());
}
