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

//! Egress side channel: the public source addresses of a tenant's firewalls
//! are published on the tenant's infrastructure record so that upstream
//! allow-lists can follow firewall replacements.

use crate::fcm::k8s::firewall::Firewall;
use crate::fcm::provider::{MachineProvider, NetworkKind, ProviderError};
use crate::fcm::util::error::new_error;
use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub trait InfrastructureClient: Send + Sync {
    fn egress_cidrs(&self, namespace: &str) -> Result<Vec<String>, Box<dyn Error + Send + Sync>>;

    fn patch_egress_cidrs(
        &self,
        namespace: &str,
        cidrs: &[String],
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Host CIDRs of every IP the given firewalls hold on external networks,
/// sorted and without duplicates.
pub fn egress_cidrs_of(
    firewalls: &[&Firewall],
    provider: &dyn MachineProvider,
) -> Result<Vec<String>, ProviderError> {
    let mut kinds: HashMap<String, NetworkKind> = HashMap::new();
    let mut cidrs = BTreeSet::new();
    for firewall in firewalls {
        for allocation in &firewall.status.network_allocations {
            let kind = match kinds.get(&allocation.network_id) {
                Some(kind) => *kind,
                None => {
                    let network = provider.find_network(&allocation.network_id)?;
                    kinds.insert(allocation.network_id.clone(), network.kind);
                    network.kind
                }
            };
            if kind != NetworkKind::External {
                continue;
            }
            for ip in &allocation.ips {
                let suffix = if ip.contains(':') { "/128" } else { "/32" };
                cidrs.insert(format!("{}{}", ip, suffix));
            }
        }
    }
    Ok(cidrs.into_iter().collect())
}

/// Infrastructure records held in process memory.
#[derive(Default)]
pub struct InMemoryInfrastructure {
    records: Mutex<HashMap<String, Vec<String>>>,
    patches: AtomicUsize,
    failures: AtomicUsize,
}

impl InMemoryInfrastructure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn patch_count(&self) -> usize {
        self.patches.load(Ordering::SeqCst)
    }

    /// Fails the next `calls` requests.
    pub fn fail_next(&self, calls: usize) {
        self.failures.store(calls, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let outcome = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            });
        match outcome {
            Ok(_) => Err(new_error("infrastructure record unavailable")),
            Err(_) => Ok(()),
        }
    }
}

impl InfrastructureClient for InMemoryInfrastructure {
    fn egress_cidrs(&self, namespace: &str) -> Result<Vec<String>, Box<dyn Error + Send + Sync>> {
        self.check_available()?;
        Ok(self
            .records
            .lock()
            .expect("infrastructure lock poisoned")
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    fn patch_egress_cidrs(
        &self,
        namespace: &str,
        cidrs: &[String],
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.check_available()?;
        self.records
            .lock()
            .expect("infrastructure lock poisoned")
            .insert(namespace.to_string(), cidrs.to_vec());
        self.patches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
