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

//! Deployment controller.
//!
//! A deployment owns one or two generations of firewall sets. The newest
//! generation is the one whose template follows the deployment; an older one
//! is kept only while a rolling update is in flight and is pruned once the
//! newest generation is fully ready.

use crate::fcm::controller::reconcile::{Controller, ReconcileContext, ReconcileError};
use crate::fcm::controller::revision::{except, max_revision_of, min_revision_of, revision, set_revision};
use crate::fcm::controller::set::DynMachineProvider;
use crate::fcm::controller::status::most_important;
use crate::fcm::k8s::condition::{Condition, ConditionStatus};
use crate::fcm::k8s::deployment::{
    DeploymentStrategy, FirewallDeployment, CONDITION_AVAILABLE, CONDITION_PROGRESSING,
    REASON_NEW_SET_AVAILABLE, REASON_NEW_SET_CREATED, REASON_PROGRESS_DEADLINE_EXCEEDED,
    REASON_SET_UPDATED,
};
use crate::fcm::k8s::event::EventType;
use crate::fcm::k8s::firewall::{
    Distance, Firewall, FirewallTemplateSpec, ANNOTATION_MAINTAIN, ANNOTATION_ROLL_SET,
};
use crate::fcm::k8s::meta::{is_controlled_by, ObjectMeta, OwnerReference};
use crate::fcm::k8s::set::{FirewallSet, FirewallSetSpec};
use crate::fcm::k8s::{Api, Resource};
use crate::fcm::logger::{log_debug, log_info};
use crate::fcm::provider::cache::ImageCache;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

const COMPONENT: &str = "firewall-deployment";
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_REPLICAS: i32 = 1;

/// Rolls firewall sets for deployments.
///
/// The controller remembers when it last created a set for each deployment
/// and refuses to create another one inside the configured safety backoff.
#[derive(Debug, Default)]
pub struct DeploymentController {
    last_created: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl DeploymentController {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_backoff(&self, ctx: &ReconcileContext, key: &str) -> Result<(), ReconcileError> {
        let last = self
            .last_created
            .lock()
            .expect("set creation backoff lock poisoned")
            .get(key)
            .copied();
        let Some(last) = last else {
            return Ok(());
        };
        let backoff = ctx.config().safety_backoff;
        let elapsed = (ctx.now() - last).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= backoff {
            return Ok(());
        }
        let remaining = backoff - elapsed;
        let remaining_text = format!("{:?}", remaining);
        log_info(
            COMPONENT,
            "Delaying firewall set creation",
            &[("deployment", key), ("remaining", remaining_text.as_str())],
        );
        Err(ReconcileError::requeue(
            remaining,
            "firewall set creation is backing off",
        ))
    }

    fn create_set(
        &self,
        ctx: &ReconcileContext,
        api: &Api<FirewallSet>,
        deployment: &FirewallDeployment,
        revision: i64,
        distance: Distance,
    ) -> Result<FirewallSet, ReconcileError> {
        let key = deployment.metadata.key();
        self.check_backoff(ctx, &key)?;
        ctx.check_deadline()?;

        let created = api.create(&new_set(deployment, revision, distance))?;
        self.last_created
            .lock()
            .expect("set creation backoff lock poisoned")
            .insert(key.clone(), ctx.now());

        let revision = revision.to_string();
        let distance = distance.to_string();
        log_info(
            COMPONENT,
            "Created firewall set",
            &[
                ("deployment", key.as_str()),
                ("set", created.metadata.name.as_str()),
                ("revision", revision.as_str()),
                ("distance", distance.as_str()),
            ],
        );
        ctx.record_event(
            deployment,
            EventType::Normal,
            "Create",
            &format!("created firewall set {}", created.metadata.name),
        );
        Ok(created)
    }

    /// Whether the latest set no longer reflects the deployment and a new
    /// generation has to be rolled out.
    fn is_new_set_required(
        &self,
        ctx: &ReconcileContext,
        deployment: &FirewallDeployment,
        latest: &FirewallSet,
    ) -> Result<bool, ReconcileError> {
        let key = deployment.metadata.key();
        let desired = &deployment.spec.template.spec;
        let current = &latest.spec.template.spec;

        if deployment.metadata.annotation(ANNOTATION_ROLL_SET) == Some("true") {
            log_info(COMPONENT, "Set roll requested by annotation", &[("deployment", key.as_str())]);
            return Ok(true);
        }
        if desired.size != current.size {
            log_info(
                COMPONENT,
                "Firewall size changed",
                &[
                    ("deployment", key.as_str()),
                    ("from", current.size.as_str()),
                    ("to", desired.size.as_str()),
                ],
            );
            return Ok(true);
        }
        if in_maintenance(deployment) {
            if desired.image != current.image {
                log_info(
                    COMPONENT,
                    "Firewall image changed",
                    &[
                        ("deployment", key.as_str()),
                        ("from", current.image.as_str()),
                        ("to", desired.image.as_str()),
                    ],
                );
                return Ok(true);
            }
            if deployment.spec.auto_update.machine_image && newer_image_available(ctx, deployment, latest)? {
                return Ok(true);
            }
        }
        let desired_networks: BTreeSet<&str> = desired.networks.iter().map(String::as_str).collect();
        let current_networks: BTreeSet<&str> = current.networks.iter().map(String::as_str).collect();
        if desired_networks != current_networks {
            log_info(COMPONENT, "Firewall networks changed", &[("deployment", key.as_str())]);
            return Ok(true);
        }
        Ok(false)
    }

    fn rolling_update(
        &self,
        ctx: &ReconcileContext,
        api: &Api<FirewallSet>,
        deployment: &mut FirewallDeployment,
        sets: &[FirewallSet],
        next: i64,
    ) -> Result<FirewallSet, ReconcileError> {
        let created = self.create_set(ctx, api, deployment, next, Distance::ROLLING)?;
        set_progressing(ctx, deployment, ConditionStatus::True, REASON_NEW_SET_CREATED, &created);

        let oldest: Vec<&FirewallSet> = min_revision_of(sets)?.into_iter().collect();
        let intermediates = except(sets, &oldest);
        delete_sets(ctx, api, deployment, &intermediates)?;
        Ok(created)
    }

    fn recreate(
        &self,
        ctx: &ReconcileContext,
        api: &Api<FirewallSet>,
        deployment: &mut FirewallDeployment,
        sets: &[FirewallSet],
        next: i64,
    ) -> Result<FirewallSet, ReconcileError> {
        self.check_backoff(ctx, &deployment.metadata.key())?;
        delete_sets(ctx, api, deployment, sets)?;
        let created = self.create_set(ctx, api, deployment, next, Distance::SHORTEST)?;
        set_progressing(ctx, deployment, ConditionStatus::True, REASON_NEW_SET_CREATED, &created);
        Ok(created)
    }
}

fn in_maintenance(deployment: &FirewallDeployment) -> bool {
    deployment.metadata.annotation(ANNOTATION_MAINTAIN) == Some("true")
}

/// Compares the latest image of the template's shorthand with the image
/// running on the most important firewall of `latest`.
fn newer_image_available(
    ctx: &ReconcileContext,
    deployment: &FirewallDeployment,
    latest: &FirewallSet,
) -> Result<bool, ReconcileError> {
    let cache = ctx
        .dependency::<ImageCache>()
        .ok_or(ReconcileError::Dependency("image cache"))?;
    let provider = ctx
        .dependency::<DynMachineProvider>()
        .ok_or(ReconcileError::Dependency("machine provider"))?
        .get();
    let image = cache.latest_image(provider.as_ref(), &deployment.spec.template.spec.image)?;

    let firewalls: Vec<Firewall> = ctx
        .api::<Firewall>()?
        .list(Some(&latest.metadata.namespace), Some(&latest.spec.selector))?
        .into_iter()
        .filter(|firewall| is_controlled_by(&firewall.metadata, &latest.metadata))
        .collect();
    let Some(running) = most_important(&firewalls).and_then(Firewall::running_image) else {
        return Ok(false);
    };
    if running == image.id {
        return Ok(false);
    }
    log_info(
        COMPONENT,
        "Newer firewall image available",
        &[
            ("deployment", deployment.metadata.key().as_str()),
            ("running", running),
            ("latest", image.id.as_str()),
        ],
    );
    Ok(true)
}

/// Revision for the next generation of `deployment`. Sets still being
/// deleted and the last observed revision count as history, so a lineage
/// never hands out a number twice. Only a deployment without history starts
/// at 0.
fn next_revision(
    deployment: &FirewallDeployment,
    controlled: &[FirewallSet],
) -> Result<i64, ReconcileError> {
    let newest = match max_revision_of(controlled)? {
        Some(set) => Some(revision(set)?),
        None => None,
    };
    let observed = deployment
        .status
        .conditions
        .get(CONDITION_PROGRESSING)
        .map(|_| deployment.status.observed_revision);
    Ok(newest.max(observed).map_or(0, |revision| revision + 1))
}

fn validate(deployment: &FirewallDeployment) -> Result<(), ReconcileError> {
    let key = deployment.metadata.key();
    let spec = &deployment.spec;
    if !(0..=MAX_REPLICAS).contains(&spec.replicas) {
        return Err(ReconcileError::Validation(format!(
            "deployment {} requests {} replicas, at most {} is supported",
            key, spec.replicas, MAX_REPLICAS
        )));
    }
    if spec.selector.is_empty() {
        return Err(ReconcileError::Validation(format!(
            "deployment {} has an empty selector",
            key
        )));
    }
    if !spec.selector.matches(&spec.template.metadata.labels) {
        return Err(ReconcileError::Validation(format!(
            "selector of deployment {} does not match its template labels",
            key
        )));
    }
    if spec.template.spec.size.is_empty() || spec.template.spec.image.is_empty() {
        return Err(ReconcileError::Validation(format!(
            "deployment {} has no firewall size or image",
            key
        )));
    }
    Ok(())
}

/// Every set controlled by `deployment`, including those being deleted.
fn controlled_sets(
    api: &Api<FirewallSet>,
    deployment: &FirewallDeployment,
) -> Result<Vec<FirewallSet>, ReconcileError> {
    Ok(api
        .list(Some(&deployment.metadata.namespace), None)?
        .into_iter()
        .filter(|set| is_controlled_by(&set.metadata, &deployment.metadata))
        .collect())
}

fn set_template(deployment: &FirewallDeployment) -> FirewallTemplateSpec {
    let mut template = deployment.spec.template.clone();
    template.metadata.labels.extend(
        deployment
            .spec
            .selector
            .match_labels
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    template
}

fn new_set(deployment: &FirewallDeployment, revision: i64, distance: Distance) -> FirewallSet {
    let template = set_template(deployment);
    let mut meta = ObjectMeta::new(deployment.metadata.namespace.clone(), "");
    meta.generate_name = Some(format!("{}-", deployment.metadata.name));
    meta.labels = template.metadata.labels.clone();
    meta.owner_references.push(OwnerReference::controller(
        FirewallDeployment::API_VERSION,
        FirewallDeployment::KIND,
        &deployment.metadata,
    ));
    let mut set = FirewallSet::new(
        meta,
        FirewallSetSpec {
            replicas: deployment.spec.replicas,
            selector: deployment.spec.selector.clone(),
            template,
            distance,
        },
    );
    set_revision(&mut set, revision);
    set
}

fn delete_sets(
    ctx: &ReconcileContext,
    api: &Api<FirewallSet>,
    deployment: &FirewallDeployment,
    sets: &[FirewallSet],
) -> Result<(), ReconcileError> {
    let key = deployment.metadata.key();
    for set in sets {
        ctx.check_deadline()?;
        match api.delete(&set.metadata.namespace, &set.metadata.name) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => continue,
            Err(err) => return Err(err.into()),
        }
        log_info(
            COMPONENT,
            "Deleted firewall set",
            &[("deployment", key.as_str()), ("set", set.metadata.name.as_str())],
        );
        ctx.record_event(
            deployment,
            EventType::Normal,
            "Delete",
            &format!("deleted firewall set {}", set.metadata.name),
        );
    }
    Ok(())
}

/// Follows the deployment with the latest set. The image stays what the set
/// was created with; image changes only roll out through a new generation.
fn sync_latest(
    ctx: &ReconcileContext,
    api: &Api<FirewallSet>,
    deployment: &FirewallDeployment,
    latest: FirewallSet,
) -> Result<(FirewallSet, bool), ReconcileError> {
    let mut desired = latest.clone();
    desired.spec.replicas = deployment.spec.replicas;
    desired.spec.template = set_template(deployment);
    desired.spec.template.spec.image = latest.spec.template.spec.image.clone();
    if desired.spec == latest.spec {
        return Ok((latest, false));
    }
    ctx.check_deadline()?;
    let updated = api.update(&desired)?;
    log_debug(
        COMPONENT,
        "Synced firewall set from deployment",
        &[
            ("deployment", deployment.metadata.key().as_str()),
            ("set", updated.metadata.name.as_str()),
        ],
    );
    Ok((updated, true))
}

fn promote(
    ctx: &ReconcileContext,
    api: &Api<FirewallSet>,
    mut set: FirewallSet,
) -> Result<FirewallSet, ReconcileError> {
    if set.spec.distance == Distance::SHORTEST {
        return Ok(set);
    }
    ctx.check_deadline()?;
    set.spec.distance = Distance::SHORTEST;
    let promoted = api.update(&set)?;
    log_info(
        COMPONENT,
        "Promoted firewall set to shortest distance",
        &[("set", promoted.metadata.key().as_str())],
    );
    Ok(promoted)
}

fn set_progressing(
    ctx: &ReconcileContext,
    deployment: &mut FirewallDeployment,
    status: ConditionStatus,
    reason: &str,
    set: &FirewallSet,
) {
    let message = match reason {
        REASON_NEW_SET_CREATED => format!("created firewall set {}", set.metadata.name),
        REASON_SET_UPDATED => format!("updated firewall set {}", set.metadata.name),
        REASON_NEW_SET_AVAILABLE => format!("firewall set {} is available", set.metadata.name),
        _ => format!(
            "firewall set {} did not become ready within the progress deadline",
            set.metadata.name
        ),
    };
    deployment.status.conditions.set_if_changed(Condition::new(
        CONDITION_PROGRESSING,
        status,
        reason,
        message,
        ctx.now(),
    ));
}

fn progress_deadline_exceeded(ctx: &ReconcileContext, set: &FirewallSet) -> bool {
    let Some(created) = set.metadata.creation_timestamp else {
        return false;
    };
    (ctx.now() - created)
        .to_std()
        .is_ok_and(|elapsed| elapsed > ctx.config().progress_deadline)
}

/// Steady state: keep the latest set in sync and, once it is fully ready,
/// make it the preferred generation and drop the others.
fn sync_and_promote(
    ctx: &ReconcileContext,
    api: &Api<FirewallSet>,
    deployment: &mut FirewallDeployment,
    sets: &[FirewallSet],
    latest: FirewallSet,
) -> Result<FirewallSet, ReconcileError> {
    let (latest, updated) = sync_latest(ctx, api, deployment, latest)?;
    if updated {
        set_progressing(ctx, deployment, ConditionStatus::True, REASON_SET_UPDATED, &latest);
    }

    if !latest.is_fully_ready() {
        if progress_deadline_exceeded(ctx, &latest) {
            set_progressing(
                ctx,
                deployment,
                ConditionStatus::False,
                REASON_PROGRESS_DEADLINE_EXCEEDED,
                &latest,
            );
        }
        return Ok(latest);
    }

    let latest = promote(ctx, api, latest)?;
    let others = except(sets, &[&latest]);
    delete_sets(ctx, api, deployment, &others)?;
    set_progressing(ctx, deployment, ConditionStatus::True, REASON_NEW_SET_AVAILABLE, &latest);
    Ok(latest)
}

/// Drops the one-shot control annotations after they were acted upon.
fn clear_control_annotations(
    ctx: &ReconcileContext,
    deployment: &mut FirewallDeployment,
) -> Result<(), ReconcileError> {
    let mut cleared = deployment.clone();
    let roll = cleared.metadata.annotations.remove(ANNOTATION_ROLL_SET).is_some();
    let maintain = cleared.metadata.annotations.remove(ANNOTATION_MAINTAIN).is_some();
    if !roll && !maintain {
        return Ok(());
    }
    ctx.check_deadline()?;
    let updated = ctx.api::<FirewallDeployment>()?.update(&cleared)?;
    deployment.metadata = updated.metadata;
    log_debug(
        COMPONENT,
        "Cleared control annotations",
        &[("deployment", deployment.metadata.key().as_str())],
    );
    Ok(())
}

fn update_status(
    ctx: &ReconcileContext,
    deployment: &mut FirewallDeployment,
    latest: &FirewallSet,
) -> Result<(), ReconcileError> {
    let status = &mut deployment.status;
    status.target_replicas = deployment.spec.replicas;
    status.ready_replicas = latest.status.ready_replicas;
    status.progressing_replicas = latest.status.progressing_replicas;
    status.unhealthy_replicas = latest.status.unhealthy_replicas;
    status.observed_revision = revision(latest)?;

    let available = if status.ready_replicas >= deployment.spec.replicas {
        Condition::new(
            CONDITION_AVAILABLE,
            ConditionStatus::True,
            "MinimumReplicasAvailable",
            "deployment has minimum availability",
            ctx.now(),
        )
    } else {
        Condition::new(
            CONDITION_AVAILABLE,
            ConditionStatus::False,
            "MinimumReplicasUnavailable",
            format!(
                "{} of {} firewalls are ready",
                status.ready_replicas, deployment.spec.replicas
            ),
            ctx.now(),
        )
    };
    status.conditions.set_if_changed(available);
    Ok(())
}

impl Controller for DeploymentController {
    type Resource = FirewallDeployment;

    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn owned_kinds(&self) -> &'static [&'static str] {
        &[FirewallSet::KIND]
    }

    fn reconcile(
        &self,
        ctx: &ReconcileContext,
        deployment: &mut FirewallDeployment,
    ) -> Result<(), ReconcileError> {
        validate(deployment)?;
        let api = ctx.api::<FirewallSet>()?;
        let controlled = controlled_sets(&api, deployment)?;
        let next = next_revision(deployment, &controlled)?;
        let sets: Vec<FirewallSet> = controlled
            .into_iter()
            .filter(|set| !set.metadata.is_being_deleted())
            .collect();

        let latest = match max_revision_of(&sets)?.cloned() {
            None => {
                let created = self.create_set(ctx, &api, deployment, next, Distance::SHORTEST)?;
                set_progressing(ctx, deployment, ConditionStatus::True, REASON_NEW_SET_CREATED, &created);
                created
            }
            Some(latest) => {
                let required = self.is_new_set_required(ctx, deployment, &latest)?;
                match (deployment.spec.strategy, required) {
                    (_, false) => sync_and_promote(ctx, &api, deployment, &sets, latest)?,
                    (DeploymentStrategy::RollingUpdate, true) => {
                        self.rolling_update(ctx, &api, deployment, &sets, next)?
                    }
                    (DeploymentStrategy::Recreate, true) => {
                        self.recreate(ctx, &api, deployment, &sets, next)?
                    }
                }
            }
        };

        clear_control_annotations(ctx, deployment)?;
        update_status(ctx, deployment, &latest)
    }

    fn delete(
        &self,
        ctx: &ReconcileContext,
        deployment: &mut FirewallDeployment,
    ) -> Result<(), ReconcileError> {
        let api = ctx.api::<FirewallSet>()?;
        let sets = controlled_sets(&api, deployment)?;
        if sets.is_empty() {
            self.last_created
                .lock()
                .expect("set creation backoff lock poisoned")
                .remove(&deployment.metadata.key());
            return Ok(());
        }

        let live: Vec<FirewallSet> = sets
            .into_iter()
            .filter(|set| !set.metadata.is_being_deleted())
            .collect();
        delete_sets(ctx, &api, deployment, &live)?;

        let remaining = controlled_sets(&api, deployment)?.len();
        if remaining == 0 {
            return Ok(());
        }
        Err(ReconcileError::requeue(
            DRAIN_POLL_INTERVAL,
            format!("waiting for {} firewall sets to be deleted", remaining),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcm::controller::reconcile::{Action, GenericReconciler};
    use crate::fcm::k8s::firewall::ANNOTATION_REVISION;
    use crate::fcm::k8s::store::{StoreError, StoreOperation};
    use crate::fcm::test_support::{deployment, TestEnv};

    #[test]
    fn rejects_more_than_one_replica() {
        let env = TestEnv::new();
        env.create(&deployment("shoot", "fw", 2, "n1-medium"));
        let err = GenericReconciler::new(DeploymentController::new())
            .reconcile(&env.context(), "shoot", "fw")
            .expect_err("validation error");
        assert!(matches!(err, ReconcileError::Validation(_)));
    }

    #[test]
    fn first_reconcile_creates_revision_zero_with_shortest_distance() {
        let env = TestEnv::new();
        let deploy = env.create(&deployment("shoot", "fw", 1, "n1-medium"));
        GenericReconciler::new(DeploymentController::new())
            .reconcile(&env.context(), "shoot", "fw")
            .expect("reconcile");

        let sets = env.owned_sets(&deploy);
        assert_eq!(sets.len(), 1);
        let set = &sets[0];
        assert!(set.metadata.name.starts_with("fw-"));
        assert_eq!(set.metadata.annotation(ANNOTATION_REVISION), Some("0"));
        assert_eq!(set.spec.distance, Distance::SHORTEST);
        assert_eq!(set.spec.replicas, 1);

        let stored = env.get::<FirewallDeployment>("shoot", "fw");
        let progressing = stored
            .status
            .conditions
            .get(CONDITION_PROGRESSING)
            .expect("progressing condition");
        assert_eq!(progressing.reason, REASON_NEW_SET_CREATED);
        assert!(stored.status.conditions.is_false(CONDITION_AVAILABLE));
        assert_eq!(env.events.with_reason("Create").len(), 1);
    }

    #[test]
    fn roll_annotation_creates_a_new_generation_once() {
        let env = TestEnv::new();
        let deploy = env.create(&deployment("shoot", "fw", 1, "n1-medium"));
        let reconciler = GenericReconciler::new(DeploymentController::new());
        reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect("initial reconcile");

        let mut annotated = env.get::<FirewallDeployment>("shoot", "fw");
        annotated
            .metadata
            .annotations
            .insert(ANNOTATION_ROLL_SET.to_string(), "true".to_string());
        env.update(&annotated);
        env.clock.advance(env.runtime.config().safety_backoff);

        reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect("roll reconcile");
        let stored = env.get::<FirewallDeployment>("shoot", "fw");
        assert_eq!(stored.metadata.annotation(ANNOTATION_ROLL_SET), None);
        assert_eq!(env.owned_sets(&deploy).len(), 2);

        env.clock.advance(env.runtime.config().safety_backoff);
        reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect("steady reconcile");
        assert_eq!(env.owned_sets(&deploy).len(), 2);
    }

    #[test]
    fn creation_inside_the_backoff_window_is_deferred() {
        let env = TestEnv::new();
        env.create(&deployment("shoot", "fw", 1, "n1-medium"));
        let reconciler = GenericReconciler::new(DeploymentController::new());
        reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect("initial reconcile");

        let mut changed = env.get::<FirewallDeployment>("shoot", "fw");
        changed.spec.template.spec.size = "n1-large".to_string();
        env.update(&changed);
        env.clock.advance(Duration::from_secs(4));

        let action = reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect("deferred reconcile");
        match action {
            Action::RequeueAfter { after, .. } => {
                assert_eq!(after, env.runtime.config().safety_backoff - Duration::from_secs(4))
            }
            other => panic!("expected a requeue, got {:?}", other),
        }
    }

    #[test]
    fn newer_image_rolls_only_inside_maintenance() {
        let env = TestEnv::new();
        let mut spec = deployment("shoot", "fw", 1, "n1-medium");
        spec.spec.auto_update.machine_image = true;
        let deploy = env.create(&spec);
        let reconciler = GenericReconciler::new(DeploymentController::new());
        reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect("initial reconcile");
        let set = env.owned_sets(&deploy).remove(0);
        env.reconcile_set(&set);
        for firewall in env.owned_firewalls(&set) {
            env.mark_ready(&firewall, Some("firewall-ubuntu-3.0.20240101"));
        }
        env.provider
            .set_latest_image(&deploy.spec.template.spec.image, "firewall-ubuntu-3.0.20240501");
        env.clock.advance(env.runtime.config().safety_backoff);

        reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect("outside maintenance");
        assert_eq!(env.owned_sets(&deploy).len(), 1);

        let mut maintained = env.get::<FirewallDeployment>("shoot", "fw");
        maintained
            .metadata
            .annotations
            .insert(ANNOTATION_MAINTAIN.to_string(), "true".to_string());
        env.update(&maintained);
        reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect("inside maintenance");

        assert_eq!(env.owned_sets(&deploy).len(), 2);
        let stored = env.get::<FirewallDeployment>("shoot", "fw");
        assert_eq!(stored.metadata.annotation(ANNOTATION_MAINTAIN), None);
    }

    #[test]
    fn failed_recreate_resumes_at_the_next_revision() {
        let env = TestEnv::new();
        let mut spec = deployment("shoot", "fw", 1, "n1-medium");
        spec.spec.strategy = DeploymentStrategy::Recreate;
        let deploy = env.create(&spec);
        let reconciler = GenericReconciler::new(DeploymentController::new());
        reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect("initial reconcile");

        let mut changed = env.get::<FirewallDeployment>("shoot", "fw");
        changed.spec.template.spec.size = "n1-large".to_string();
        env.update(&changed);
        env.clock.advance(env.runtime.config().safety_backoff);
        env.store.fail_next(
            StoreOperation::Create,
            FirewallSet::KIND,
            1,
            StoreError::Unavailable("injected".to_string()),
        );

        let err = reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect_err("create fails after the old generation is gone");
        assert!(matches!(err, ReconcileError::Store(_)));
        assert!(env.owned_sets(&deploy).is_empty());

        reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect("retried reconcile");
        let sets = env.owned_sets(&deploy);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].metadata.annotation(ANNOTATION_REVISION), Some("1"));
        assert_eq!(sets[0].spec.template.spec.size, "n1-large");
        let stored = env.get::<FirewallDeployment>("shoot", "fw");
        assert_eq!(stored.status.observed_revision, 1);
    }

    #[test]
    fn network_order_is_ignored_but_a_new_network_rolls() {
        let env = TestEnv::new();
        let deploy = env.create(&deployment("shoot", "fw", 1, "n1-medium"));
        let reconciler = GenericReconciler::new(DeploymentController::new());
        reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect("initial reconcile");
        env.clock.advance(env.runtime.config().safety_backoff);

        let mut reordered = env.get::<FirewallDeployment>("shoot", "fw");
        reordered.spec.template.spec.networks.reverse();
        env.update(&reordered);
        reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect("reordered networks");
        let sets = env.owned_sets(&deploy);
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].metadata.annotation(ANNOTATION_REVISION), Some("0"));

        let mut extended = env.get::<FirewallDeployment>("shoot", "fw");
        extended
            .spec
            .template
            .spec
            .networks
            .push("storage".to_string());
        env.update(&extended);
        reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect("added network");
        let sets = env.owned_sets(&deploy);
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[1].metadata.annotation(ANNOTATION_REVISION), Some("1"));
        assert_eq!(sets[1].spec.distance, Distance::ROLLING);
        assert!(sets[1].spec.template.spec.networks.contains(&"storage".to_string()));
    }

    #[test]
    fn delete_drains_sets_before_releasing_the_guard() {
        let env = TestEnv::new();
        let deploy = env.create(&deployment("shoot", "fw", 1, "n1-medium"));
        let reconciler = GenericReconciler::new(DeploymentController::new());
        reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect("initial reconcile");
        let set = env.owned_sets(&deploy).remove(0);
        env.reconcile_set(&set);

        env.delete::<FirewallDeployment>("shoot", "fw");
        let action = reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect("drain");
        assert!(matches!(action, Action::RequeueAfter { .. }));
        assert!(env.get_opt::<FirewallDeployment>("shoot", "fw").is_some());

        env.reconcile_set(&set);
        reconciler
            .reconcile(&env.context(), "shoot", "fw")
            .expect("release");
        assert!(env.get_opt::<FirewallDeployment>("shoot", "fw").is_none());
    }
}
