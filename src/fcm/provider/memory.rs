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

use super::{
    Image, Machine, MachineAllocation, MachineFilter, MachineProvider, Network, NetworkKind,
    ProviderError,
};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct Inventory {
    machines: BTreeMap<String, Machine>,
    images: HashMap<String, Image>,
    networks: HashMap<String, Network>,
    next_machine: u64,
    image_lookups: usize,
    unavailable: usize,
}

impl Inventory {
    fn check_available(&mut self) -> Result<(), ProviderError> {
        if self.unavailable > 0 {
            self.unavailable -= 1;
            return Err(ProviderError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

/// Provisioning API backed by process memory.
#[derive(Default)]
pub struct InMemoryProvider {
    inventory: Mutex<Inventory>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inventory> {
        self.inventory.lock().expect("provider inventory lock poisoned")
    }

    pub fn set_latest_image(&self, shorthand: &str, id: &str) {
        self.lock().images.insert(
            shorthand.to_string(),
            Image {
                id: id.to_string(),
                expiration: None,
            },
        );
    }

    pub fn add_network(&self, id: &str, kind: NetworkKind, prefixes: &[&str]) {
        self.lock().networks.insert(
            id.to_string(),
            Network {
                id: id.to_string(),
                kind,
                prefixes: prefixes.iter().map(|prefix| prefix.to_string()).collect(),
            },
        );
    }

    /// Number of `find_latest_image` calls that reached the inventory.
    pub fn image_lookups(&self) -> usize {
        self.lock().image_lookups
    }

    /// Fails the next `calls` requests with [`ProviderError::Unavailable`].
    pub fn fail_next(&self, calls: usize) {
        self.lock().unavailable = calls;
    }
}

impl MachineProvider for InMemoryProvider {
    fn find_machines(&self, filter: &MachineFilter) -> Result<Vec<Machine>, ProviderError> {
        let mut inventory = self.lock();
        inventory.check_available()?;
        Ok(inventory
            .machines
            .values()
            .filter(|machine| filter.matches(machine))
            .cloned()
            .collect())
    }

    fn allocate_machine(&self, allocation: &MachineAllocation) -> Result<Machine, ProviderError> {
        let mut inventory = self.lock();
        inventory.check_available()?;
        if allocation.size.is_empty() || allocation.image.is_empty() {
            return Err(ProviderError::Invalid(
                "size and image are required for an allocation".to_string(),
            ));
        }
        inventory.next_machine += 1;
        let machine = Machine {
            id: format!("machine-{:04}", inventory.next_machine),
            hostname: allocation.hostname.clone(),
            project: allocation.project.clone(),
            partition: allocation.partition.clone(),
            size: allocation.size.clone(),
            image: allocation.image.clone(),
            networks: allocation.networks.clone(),
            allocated_at: Utc::now(),
        };
        inventory
            .machines
            .insert(machine.id.clone(), machine.clone());
        Ok(machine)
    }

    fn free_machine(&self, id: &str) -> Result<(), ProviderError> {
        let mut inventory = self.lock();
        inventory.check_available()?;
        inventory
            .machines
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::NotFound(format!("machine {}", id)))
    }

    fn find_latest_image(&self, shorthand: &str) -> Result<Image, ProviderError> {
        let mut inventory = self.lock();
        inventory.check_available()?;
        inventory.image_lookups += 1;
        inventory
            .images
            .get(shorthand)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("image {}", shorthand)))
    }

    fn find_network(&self, id: &str) -> Result<Network, ProviderError> {
        let mut inventory = self.lock();
        inventory.check_available()?;
        inventory
            .networks
            .get(id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(format!("network {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation(hostname: &str) -> MachineAllocation {
        MachineAllocation {
            hostname: hostname.to_string(),
            project: "project-a".to_string(),
            partition: "fra-equ01".to_string(),
            size: "n1-medium-x86".to_string(),
            image: "firewall-ubuntu-3.0".to_string(),
            networks: vec!["internet".to_string()],
        }
    }

    #[test]
    fn allocated_machines_can_be_found_and_freed() {
        let provider = InMemoryProvider::new();
        let machine = provider.allocate_machine(&allocation("fw-1")).expect("allocate");
        provider.allocate_machine(&allocation("fw-2")).expect("allocate");

        let filter = MachineFilter {
            hostname: Some("fw-1".to_string()),
            ..Default::default()
        };
        let found = provider.find_machines(&filter).expect("find");
        assert_eq!(found, vec![machine.clone()]);

        provider.free_machine(&machine.id).expect("free");
        assert!(provider.find_machines(&filter).expect("find").is_empty());
        assert!(matches!(
            provider.free_machine(&machine.id),
            Err(ProviderError::NotFound(_))
        ));
    }

    #[test]
    fn allocation_requires_size_and_image() {
        let provider = InMemoryProvider::new();
        let mut request = allocation("fw-1");
        request.image.clear();
        assert!(matches!(
            provider.allocate_machine(&request),
            Err(ProviderError::Invalid(_))
        ));
    }

    #[test]
    fn injected_outage_is_transient() {
        let provider = InMemoryProvider::new();
        provider.add_network("internet", NetworkKind::External, &["185.1.2.0/24"]);
        provider.fail_next(1);
        assert!(matches!(
            provider.find_network("internet"),
            Err(ProviderError::Unavailable(_))
        ));
        assert_eq!(
            provider.find_network("internet").expect("network").kind,
            NetworkKind::External
        );
    }
}
