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

use crate::fcm::k8s::condition::Conditions;
use crate::fcm::k8s::firewall::{
    Firewall, FirewallPhase, CONDITION_CONTROLLER_CONNECTED, CONDITION_PROVISIONED,
    CONDITION_READY, CONDITION_SEED_CONNECTED,
};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallHealth {
    Ready,
    Progressing,
    Unhealthy,
    CreateTimeout,
    HealthTimeout,
}

impl FirewallHealth {
    pub fn is_timeout(self) -> bool {
        matches!(self, FirewallHealth::CreateTimeout | FirewallHealth::HealthTimeout)
    }
}

impl fmt::Display for FirewallHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            FirewallHealth::Ready => "Ready",
            FirewallHealth::Progressing => "Progressing",
            FirewallHealth::Unhealthy => "Unhealthy",
            FirewallHealth::CreateTimeout => "CreateTimeout",
            FirewallHealth::HealthTimeout => "HealthTimeout",
        };
        f.write_str(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub health: FirewallHealth,
    /// Time left until the firewall reaches a timeout, when one is pending.
    pub timeout_in: Option<Duration>,
}

impl Evaluation {
    fn new(health: FirewallHealth) -> Self {
        Self {
            health,
            timeout_in: None,
        }
    }

    fn pending(health: FirewallHealth, timeout_in: Duration) -> Self {
        Self {
            health,
            timeout_in: Some(timeout_in),
        }
    }
}

/// Classifies a firewall from its phase and conditions.
///
/// A creating firewall whose `Provisioned` condition is `False` (or absent,
/// measured from creation) times out after `create_timeout`; it is
/// progressing until then. A running firewall with any of `Ready`,
/// `ControllerConnected` or `ControllerSeedConnected` set to `False` is
/// unhealthy and times out once the oldest of those transitions is older than
/// `health_timeout`. Crashing firewalls are unhealthy. Everything else is
/// ready. A zero timeout disables the respective check.
pub fn evaluate(
    firewall: &Firewall,
    create_timeout: Duration,
    health_timeout: Duration,
    now: DateTime<Utc>,
) -> Evaluation {
    let conditions = &firewall.status.conditions;
    match firewall.status.phase {
        FirewallPhase::Creating => {
            if create_timeout.is_zero() || conditions.is_true(CONDITION_PROVISIONED) {
                return Evaluation::new(FirewallHealth::Progressing);
            }
            let since = match conditions.get(CONDITION_PROVISIONED) {
                Some(condition) if conditions.is_false(CONDITION_PROVISIONED) => {
                    Some(condition.last_transition_time)
                }
                Some(_) => None,
                None => firewall.metadata.creation_timestamp,
            };
            match since {
                Some(since) => timed(since, create_timeout, now, FirewallHealth::Progressing, FirewallHealth::CreateTimeout),
                None => Evaluation::new(FirewallHealth::Progressing),
            }
        }
        FirewallPhase::Running => match oldest_false(conditions) {
            Some(since) if !health_timeout.is_zero() => timed(
                since,
                health_timeout,
                now,
                FirewallHealth::Unhealthy,
                FirewallHealth::HealthTimeout,
            ),
            Some(_) => Evaluation::new(FirewallHealth::Unhealthy),
            None => Evaluation::new(FirewallHealth::Ready),
        },
        FirewallPhase::Crashing => Evaluation::new(FirewallHealth::Unhealthy),
    }
}

fn timed(
    since: DateTime<Utc>,
    timeout: Duration,
    now: DateTime<Utc>,
    pending: FirewallHealth,
    expired: FirewallHealth,
) -> Evaluation {
    let elapsed = (now - since).to_std().unwrap_or(Duration::ZERO);
    if elapsed > timeout {
        Evaluation::new(expired)
    } else {
        Evaluation::pending(pending, timeout - elapsed)
    }
}

fn oldest_false(conditions: &Conditions) -> Option<DateTime<Utc>> {
    [
        CONDITION_READY,
        CONDITION_CONTROLLER_CONNECTED,
        CONDITION_SEED_CONNECTED,
    ]
    .into_iter()
    .filter(|kind| conditions.is_false(kind))
    .filter_map(|kind| conditions.get(kind).map(|condition| condition.last_transition_time))
    .min()
}

/// Replica counters of a group of firewalls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaCounts {
    pub ready: i32,
    pub progressing: i32,
    pub unhealthy: i32,
}

impl ReplicaCounts {
    pub fn add(&mut self, health: FirewallHealth) {
        match health {
            FirewallHealth::Ready => self.ready += 1,
            FirewallHealth::Progressing => self.progressing += 1,
            FirewallHealth::Unhealthy | FirewallHealth::CreateTimeout | FirewallHealth::HealthTimeout => {
                self.unhealthy += 1
            }
        }
    }
}

pub fn count_replicas<'a>(
    firewalls: impl IntoIterator<Item = &'a Firewall>,
    create_timeout: Duration,
    health_timeout: Duration,
    now: DateTime<Utc>,
) -> ReplicaCounts {
    let mut counts = ReplicaCounts::default();
    for firewall in firewalls {
        counts.add(evaluate(firewall, create_timeout, health_timeout, now).health);
    }
    counts
}

/// The firewall whose state best represents a group: highest weight, then
/// connected and ready, then most recently ready, then most recently created.
pub fn most_important(firewalls: &[Firewall]) -> Option<&Firewall> {
    firewalls.iter().max_by(|a, b| importance(a, b))
}

fn importance(a: &Firewall, b: &Firewall) -> Ordering {
    a.weight()
        .cmp(&b.weight())
        .then_with(|| connected_and_ready(a).cmp(&connected_and_ready(b)))
        .then_with(|| ready_since(a).cmp(&ready_since(b)))
        .then_with(|| a.metadata.creation_timestamp.cmp(&b.metadata.creation_timestamp))
}

fn connected_and_ready(firewall: &Firewall) -> bool {
    let conditions = &firewall.status.conditions;
    conditions.is_true(CONDITION_CONTROLLER_CONNECTED) && conditions.is_true(CONDITION_READY)
}

fn ready_since(firewall: &Firewall) -> Option<DateTime<Utc>> {
    let conditions = &firewall.status.conditions;
    if !conditions.is_true(CONDITION_READY) {
        return None;
    }
    conditions
        .get(CONDITION_READY)
        .map(|condition| condition.last_transition_time)
}
