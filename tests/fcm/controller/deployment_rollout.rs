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
use fcm::fcm::controller::DeploymentController;
use fcm::fcm::k8s::condition::ConditionStatus;
use fcm::fcm::k8s::deployment::{
    DeploymentStrategy, FirewallDeployment, CONDITION_AVAILABLE, CONDITION_PROGRESSING,
    REASON_NEW_SET_AVAILABLE, REASON_PROGRESS_DEADLINE_EXCEEDED,
};
use fcm::fcm::k8s::firewall::{Distance, ANNOTATION_REVISION, ANNOTATION_ROLL_SET};
use fcm::fcm::k8s::set::FirewallSet;
use fcm::fcm::test_support::{deployment, TestEnv};
use std::time::Duration;

const NAMESPACE: &str = "shoot";
const NAME: &str = "fw";

struct Rollout {
    env: TestEnv,
    reconciler: GenericReconciler<DeploymentController>,
    deployment: FirewallDeployment,
}

impl Rollout {
    fn new(strategy: DeploymentStrategy, size: &str) -> Self {
        let env = TestEnv::new();
        let mut spec = deployment(NAMESPACE, NAME, 1, size);
        spec.spec.strategy = strategy;
        let deployment = env.create(&spec);
        Self {
            env,
            reconciler: GenericReconciler::new(DeploymentController::new()),
            deployment,
        }
    }

    fn reconcile(&self) -> Action {
        self.reconciler
            .reconcile(&self.env.context(), NAMESPACE, NAME)
            .expect("deployment reconcile")
    }

    fn sets(&self) -> Vec<FirewallSet> {
        self.env.owned_sets(&self.deployment)
    }

    fn stored(&self) -> FirewallDeployment {
        self.env.get::<FirewallDeployment>(NAMESPACE, NAME)
    }

    fn change_size(&self, size: &str) {
        let mut current = self.stored();
        current.spec.template.spec.size = size.to_string();
        self.env.update(&current);
    }

    fn wait_out_backoff(&self) {
        self.env
            .clock
            .advance(self.env.runtime.config().safety_backoff);
    }

    /// Runs the set controller and reports every firewall of `set` healthy.
    fn make_ready(&self, set: &FirewallSet) {
        self.env.reconcile_set(set);
        for firewall in self.env.owned_firewalls(set) {
            self.env.mark_ready(&firewall, None);
        }
        self.env.reconcile_set(set);
    }
}

fn revision_of(set: &FirewallSet) -> &str {
    set.metadata
        .annotation(ANNOTATION_REVISION)
        .expect("revision annotation")
}

#[test]
fn new_deployment_gets_one_set_with_one_firewall() {
    let rollout = Rollout::new(DeploymentStrategy::RollingUpdate, "n1-medium");
    assert_eq!(rollout.reconcile(), Action::Done);

    let sets = rollout.sets();
    assert_eq!(sets.len(), 1);
    assert_eq!(revision_of(&sets[0]), "0");

    rollout.env.reconcile_set(&sets[0]);
    assert_eq!(rollout.env.owned_firewalls(&sets[0]).len(), 1);
}

#[test]
fn size_change_rolls_out_and_promotes_the_new_generation() {
    let rollout = Rollout::new(DeploymentStrategy::RollingUpdate, "a");
    rollout.reconcile();
    let first = rollout.sets().remove(0);
    rollout.make_ready(&first);
    rollout.reconcile();
    assert!(rollout.stored().status.conditions.is_true(CONDITION_AVAILABLE));

    rollout.change_size("b");
    rollout.wait_out_backoff();
    rollout.reconcile();

    let sets = rollout.sets();
    assert_eq!(sets.len(), 2);
    let second = sets
        .iter()
        .find(|set| revision_of(set) == "1")
        .expect("revision 1")
        .clone();
    assert_eq!(second.spec.distance, Distance::ROLLING);
    assert_eq!(second.spec.template.spec.size, "b");

    rollout.reconcile();
    assert_eq!(rollout.sets().len(), 2, "old generation stays until the new one is ready");

    rollout.make_ready(&second);
    rollout.reconcile();

    let sets = rollout.sets();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].metadata.name, second.metadata.name);
    assert_eq!(sets[0].spec.distance, Distance::SHORTEST);

    let stored = rollout.stored();
    assert_eq!(stored.status.observed_revision, 1);
    assert_eq!(stored.status.ready_replicas, 1);
    let progressing = stored
        .status
        .conditions
        .get(CONDITION_PROGRESSING)
        .expect("progressing condition");
    assert_eq!(progressing.reason, REASON_NEW_SET_AVAILABLE);
}

#[test]
fn rapid_changes_never_leave_more_than_two_generations() {
    let rollout = Rollout::new(DeploymentStrategy::RollingUpdate, "size-0");
    rollout.reconcile();
    let oldest = rollout.sets().remove(0);

    for step in 1..=5 {
        rollout.change_size(&format!("size-{}", step));
        rollout.wait_out_backoff();
        rollout.reconcile();

        let sets = rollout.sets();
        assert!(sets.len() <= 2, "{} generations live after step {}", sets.len(), step);
        assert_eq!(sets[0].metadata.name, oldest.metadata.name);
        let newest = sets.last().expect("newest set");
        assert_eq!(revision_of(newest), step.to_string());
    }
}

#[test]
fn recreate_replaces_all_generations() {
    let rollout = Rollout::new(DeploymentStrategy::Recreate, "a");
    rollout.reconcile();
    let first = rollout.sets().remove(0);

    rollout.change_size("b");
    rollout.wait_out_backoff();
    rollout.reconcile();

    let sets = rollout.sets();
    assert_eq!(sets.len(), 1);
    assert_ne!(sets[0].metadata.name, first.metadata.name);
    assert_eq!(revision_of(&sets[0]), "1");
    assert_eq!(sets[0].spec.distance, Distance::SHORTEST);
    assert!(rollout.env.get_opt::<FirewallSet>(NAMESPACE, &first.metadata.name).is_none());
}

#[test]
fn deferred_creation_keeps_the_roll_request() {
    let rollout = Rollout::new(DeploymentStrategy::RollingUpdate, "a");
    rollout.reconcile();

    let mut current = rollout.stored();
    current
        .metadata
        .annotations
        .insert(ANNOTATION_ROLL_SET.to_string(), "true".to_string());
    rollout.env.update(&current);

    match rollout.reconcile() {
        Action::RequeueAfter { after, .. } => {
            assert!(after <= rollout.env.runtime.config().safety_backoff)
        }
        other => panic!("expected a deferred reconcile, got {:?}", other),
    }
    assert_eq!(rollout.sets().len(), 1);
    assert_eq!(
        rollout.stored().metadata.annotation(ANNOTATION_ROLL_SET),
        Some("true")
    );

    rollout.wait_out_backoff();
    rollout.reconcile();
    assert_eq!(rollout.sets().len(), 2);
    assert_eq!(rollout.stored().metadata.annotation(ANNOTATION_ROLL_SET), None);
}

#[test]
fn stalled_rollout_reports_the_progress_deadline() {
    let rollout = Rollout::new(DeploymentStrategy::RollingUpdate, "a");
    rollout.reconcile();
    rollout.env.clock.advance(
        rollout.env.runtime.config().progress_deadline + Duration::from_secs(1),
    );
    rollout.reconcile();

    let stored = rollout.stored();
    let progressing = stored
        .status
        .conditions
        .get(CONDITION_PROGRESSING)
        .expect("progressing condition");
    assert_eq!(progressing.status, ConditionStatus::False);
    assert_eq!(progressing.reason, REASON_PROGRESS_DEADLINE_EXCEEDED);
    assert_eq!(rollout.sets().len(), 1, "the deadline does not abort the rollout");
}
