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

use crate::fcm::controller::reconcile::{
    Controller, DependencyHandle, ReconcileContext, ReconcileError,
};
use crate::fcm::controller::revision::revision;
use crate::fcm::controller::status::count_replicas;
use crate::fcm::infrastructure::{egress_cidrs_of, InfrastructureClient};
use crate::fcm::k8s::condition::{Condition, ConditionStatus};
use crate::fcm::k8s::event::EventType;
use crate::fcm::k8s::firewall::{Firewall, FirewallSpec};
use crate::fcm::k8s::meta::{controller_of, ObjectMeta, OwnerReference};
use crate::fcm::k8s::set::FirewallSet;
use crate::fcm::k8s::{Api, Resource};
use crate::fcm::logger::{log_debug, log_info, log_warn};
use crate::fcm::provider::MachineProvider;
use crate::fcm::util::error::with_context;
use std::cmp::Reverse;
use std::error::Error;
use std::time::Duration;

const COMPONENT: &str = "firewall-set";
const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub const CONDITION_EGRESS_RECONCILED: &str = "EgressCIDRsReconciled";

pub type DynMachineProvider = DependencyHandle<dyn MachineProvider>;
pub type DynInfrastructureClient = DependencyHandle<dyn InfrastructureClient>;

/// Keeps the number of firewalls of a set at its replica count.
#[derive(Debug, Default)]
pub struct SetController;

impl SetController {
    pub fn new() -> Self {
        Self
    }
}

/// Firewalls selected by the set and controlled by it. Orphans are adopted
/// along the way; firewalls referenced by any other owner, or already being
/// deleted, are left alone.
fn claim_firewalls(
    ctx: &ReconcileContext,
    api: &Api<Firewall>,
    set: &FirewallSet,
) -> Result<Vec<Firewall>, ReconcileError> {
    let namespace = set.metadata.namespace.as_str();
    let set_uid = set.metadata.uid.as_deref().unwrap_or_default();
    let selected = api.list(Some(namespace), Some(&set.spec.selector))?;

    let mut owned = Vec::with_capacity(selected.len());
    for mut firewall in selected {
        match controller_of(&firewall.metadata) {
            Some(owner) if owner.uid == set_uid => owned.push(firewall),
            Some(_) => continue,
            None => {
                let referenced_elsewhere = firewall
                    .metadata
                    .owner_references
                    .iter()
                    .any(|reference| reference.uid != set_uid);
                if firewall.metadata.is_being_deleted() || referenced_elsewhere {
                    continue;
                }
                ctx.check_deadline()?;
                firewall.metadata.owner_references.push(OwnerReference::controller(
                    FirewallSet::API_VERSION,
                    FirewallSet::KIND,
                    &set.metadata,
                ));
                let adopted = api.update(&firewall)?;
                log_info(
                    COMPONENT,
                    "Adopted orphaned firewall",
                    &[
                        ("set", set.metadata.key().as_str()),
                        ("firewall", adopted.metadata.name.as_str()),
                    ],
                );
                owned.push(adopted);
            }
        }
    }
    Ok(owned)
}

fn desired_spec(set: &FirewallSet) -> FirewallSpec {
    let mut spec = set.spec.template.spec.clone();
    spec.distance = set.spec.distance;
    spec
}

fn new_firewall(set: &FirewallSet) -> Firewall {
    let template = &set.spec.template;
    let mut meta = ObjectMeta::new(set.metadata.namespace.clone(), "");
    meta.generate_name = Some(format!("{}-", set.metadata.name));
    meta.labels = template.metadata.labels.clone();
    meta.labels.extend(
        set.spec
            .selector
            .match_labels
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    meta.annotations = template.metadata.annotations.clone();
    meta.owner_references.push(OwnerReference::controller(
        FirewallSet::API_VERSION,
        FirewallSet::KIND,
        &set.metadata,
    ));
    Firewall::new(meta, desired_spec(set))
}

/// Returns `true` if the infrastructure record had to be patched.
fn sync_egress(
    provider: &dyn MachineProvider,
    infrastructure: &dyn InfrastructureClient,
    namespace: &str,
    firewalls: &[Firewall],
) -> Result<bool, Box<dyn Error + Send + Sync>> {
    let firewalls: Vec<&Firewall> = firewalls.iter().collect();
    let desired = egress_cidrs_of(&firewalls, provider)
        .map_err(|err| with_context(err, "resolving firewall networks"))?;
    let current = infrastructure
        .egress_cidrs(namespace)
        .map_err(|err| with_context(err, "reading egress CIDRs"))?;
    if current == desired {
        return Ok(false);
    }
    infrastructure
        .patch_egress_cidrs(namespace, &desired)
        .map_err(|err| with_context(err, "patching egress CIDRs"))?;
    Ok(true)
}

/// Publishes the egress addresses of `firewalls`. Failures only surface as a
/// condition on the set.
fn reconcile_egress(ctx: &ReconcileContext, set: &mut FirewallSet, firewalls: &[Firewall]) {
    let (Some(provider), Some(infrastructure)) = (
        ctx.dependency::<DynMachineProvider>(),
        ctx.dependency::<DynInfrastructureClient>(),
    ) else {
        return;
    };
    let provider = provider.get();
    let infrastructure = infrastructure.get();
    let namespace = set.metadata.namespace.clone();

    let outcome = sync_egress(
        provider.as_ref(),
        infrastructure.as_ref(),
        &namespace,
        firewalls,
    );

    let now = ctx.now();
    let condition = match outcome {
        Ok(patched) => {
            if patched {
                log_info(COMPONENT, "Updated egress CIDRs", &[("namespace", namespace.as_str())]);
            }
            Condition::new(
                CONDITION_EGRESS_RECONCILED,
                ConditionStatus::True,
                "Reconciled",
                "egress CIDRs are up to date",
                now,
            )
        }
        Err(err) => {
            let message = err.to_string();
            log_warn(
                COMPONENT,
                "Failed to reconcile egress CIDRs",
                &[("namespace", namespace.as_str()), ("error", message.as_str())],
            );
            Condition::new(
                CONDITION_EGRESS_RECONCILED,
                ConditionStatus::False,
                "Error",
                message,
                now,
            )
        }
    };
    set.status.conditions.set_if_changed(condition);
}

impl Controller for SetController {
    type Resource = FirewallSet;

    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn owned_kinds(&self) -> &'static [&'static str] {
        &[Firewall::KIND]
    }

    fn reconcile(&self, ctx: &ReconcileContext, set: &mut FirewallSet) -> Result<(), ReconcileError> {
        let api = ctx.api::<Firewall>()?;
        let set_key = set.metadata.key();
        let owned = claim_firewalls(ctx, &api, set)?;
        let (_, mut active): (Vec<Firewall>, Vec<Firewall>) = owned
            .into_iter()
            .partition(|firewall| firewall.metadata.is_being_deleted());

        let desired = desired_spec(set);
        for firewall in active.iter_mut() {
            if firewall.spec == desired {
                continue;
            }
            ctx.check_deadline()?;
            firewall.spec = desired.clone();
            *firewall = api.update(firewall)?;
            log_debug(
                COMPONENT,
                "Synced firewall spec from template",
                &[("set", set_key.as_str()), ("firewall", firewall.metadata.name.as_str())],
            );
        }

        let replicas = set.spec.replicas.max(0) as usize;
        if active.len() < replicas {
            for _ in active.len()..replicas {
                ctx.check_deadline()?;
                let created = api.create(&new_firewall(set))?;
                log_info(
                    COMPONENT,
                    "Created firewall",
                    &[("set", set_key.as_str()), ("firewall", created.metadata.name.as_str())],
                );
                ctx.record_event(
                    set,
                    EventType::Normal,
                    "Create",
                    &format!("created firewall {}", created.metadata.name),
                );
                active.push(created);
            }
        } else if active.len() > replicas {
            active.sort_by_key(|firewall| {
                (
                    Reverse(firewall.metadata.creation_timestamp),
                    firewall.metadata.name.clone(),
                )
            });
            for firewall in active.split_off(replicas) {
                ctx.check_deadline()?;
                match api.delete(&firewall.metadata.namespace, &firewall.metadata.name) {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => continue,
                    Err(err) => return Err(err.into()),
                }
                log_info(
                    COMPONENT,
                    "Deleted surplus firewall",
                    &[("set", set_key.as_str()), ("firewall", firewall.metadata.name.as_str())],
                );
                ctx.record_event(
                    set,
                    EventType::Normal,
                    "Delete",
                    &format!("deleted firewall {}", firewall.metadata.name),
                );
            }
        }

        let config = ctx.config();
        let counts = count_replicas(&active, config.create_timeout, config.health_timeout, ctx.now());
        set.status.target_replicas = set.spec.replicas;
        set.status.ready_replicas = counts.ready;
        set.status.progressing_replicas = counts.progressing;
        set.status.unhealthy_replicas = counts.unhealthy;
        set.status.observed_revision = revision(set)?;

        reconcile_egress(ctx, set, &active);
        Ok(())
    }

    fn delete(&self, ctx: &ReconcileContext, set: &mut FirewallSet) -> Result<(), ReconcileError> {
        let api = ctx.api::<Firewall>()?;
        let owned: Vec<Firewall> = api
            .list(Some(&set.metadata.namespace), None)?
            .into_iter()
            .filter(|firewall| {
                controller_of(&firewall.metadata)
                    .is_some_and(|owner| Some(owner.uid.as_str()) == set.metadata.uid.as_deref())
            })
            .collect();
        if owned.is_empty() {
            return Ok(());
        }

        for firewall in owned.iter().filter(|fw| !fw.metadata.is_being_deleted()) {
            ctx.check_deadline()?;
            match api.delete(&firewall.metadata.namespace, &firewall.metadata.name) {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
            ctx.record_event(
                set,
                EventType::Normal,
                "Delete",
                &format!("deleted firewall {}", firewall.metadata.name),
            );
        }

        let remaining = api
            .list(Some(&set.metadata.namespace), None)?
            .iter()
            .filter(|firewall| {
                controller_of(&firewall.metadata)
                    .is_some_and(|owner| Some(owner.uid.as_str()) == set.metadata.uid.as_deref())
            })
            .count();
        if remaining == 0 {
            return Ok(());
        }
        Err(ReconcileError::requeue(
            DRAIN_POLL_INTERVAL,
            format!("waiting for {} firewalls to be deleted", remaining),
        ))
    }
}
