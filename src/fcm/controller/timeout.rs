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

use crate::fcm::controller::reconcile::{Controller, ReconcileContext, ReconcileError};
use crate::fcm::controller::status::{evaluate, FirewallHealth};
use crate::fcm::k8s::event::EventType;
use crate::fcm::k8s::firewall::Firewall;
use crate::fcm::k8s::meta::is_controlled_by;
use crate::fcm::k8s::set::FirewallSet;
use crate::fcm::k8s::Resource;
use crate::fcm::logger::{log_info, log_warn};

const COMPONENT: &str = "firewall-timeout";

/// Deletes firewalls of a set that exceeded the create or health timeout and
/// wakes up again when the next pending timeout is due.
#[derive(Debug, Default)]
pub struct TimeoutController;

impl TimeoutController {
    pub fn new() -> Self {
        Self
    }
}

impl Controller for TimeoutController {
    type Resource = FirewallSet;

    fn name(&self) -> &'static str {
        COMPONENT
    }

    fn owned_kinds(&self) -> &'static [&'static str] {
        &[Firewall::KIND]
    }

    fn finalizer(&self) -> Option<&'static str> {
        None
    }

    fn skip_status_update(&self) -> bool {
        true
    }

    fn reconcile(&self, ctx: &ReconcileContext, set: &mut FirewallSet) -> Result<(), ReconcileError> {
        if set.metadata.is_being_deleted() {
            return Ok(());
        }
        let api = ctx.api::<Firewall>()?;
        let config = ctx.config();
        let now = ctx.now();
        let set_key = set.metadata.key();

        let mut next_timeout = None;
        for firewall in api.list(Some(&set.metadata.namespace), Some(&set.spec.selector))? {
            if !is_controlled_by(&firewall.metadata, &set.metadata)
                || firewall.metadata.is_being_deleted()
            {
                continue;
            }

            let evaluation = evaluate(&firewall, config.create_timeout, config.health_timeout, now);
            if evaluation.health.is_timeout() {
                ctx.check_deadline()?;
                match api.delete(&firewall.metadata.namespace, &firewall.metadata.name) {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => continue,
                    Err(err) => return Err(err.into()),
                }
                let reason = evaluation.health.to_string();
                log_warn(
                    COMPONENT,
                    "Deleted firewall after timeout",
                    &[
                        ("set", set_key.as_str()),
                        ("firewall", firewall.metadata.name.as_str()),
                        ("reason", reason.as_str()),
                    ],
                );
                ctx.record_event(
                    &firewall,
                    EventType::Warning,
                    "Delete",
                    &format!("deleting firewall {} because of {}", firewall.metadata.name, reason),
                );
                continue;
            }

            if matches!(
                evaluation.health,
                FirewallHealth::Unhealthy | FirewallHealth::Progressing
            ) {
                if let Some(timeout_in) = evaluation.timeout_in {
                    next_timeout = Some(match next_timeout {
                        Some(current) if current <= timeout_in => current,
                        _ => timeout_in,
                    });
                }
            }
        }

        match next_timeout {
            Some(after) => {
                let after_text = format!("{:?}", after);
                log_info(
                    COMPONENT,
                    "Scheduled next timeout check",
                    &[("set", set_key.as_str()), ("after", after_text.as_str())],
                );
                Err(ReconcileError::requeue(after, "firewall timeout pending"))
            }
            None => Ok(()),
        }
    }

    fn delete(&self, _: &ReconcileContext, _: &mut FirewallSet) -> Result<(), ReconcileError> {
        Ok(())
    }
}
