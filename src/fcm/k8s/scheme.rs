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

use super::api::Resource;
use super::deployment::FirewallDeployment;
use super::firewall::Firewall;
use super::set::FirewallSet;
use std::collections::BTreeMap;

/// Registry of the kinds a runtime may read and write.
///
/// Built once at startup and handed to every component that needs typed
/// access to the store.
#[derive(Debug, Clone, Default)]
pub struct Scheme {
    kinds: BTreeMap<&'static str, &'static str>,
}

impl Scheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheme with the deployment, set and firewall kinds registered.
    pub fn firewall() -> Self {
        let mut scheme = Scheme::new();
        scheme
            .register::<FirewallDeployment>()
            .register::<FirewallSet>()
            .register::<Firewall>();
        scheme
    }

    pub fn register<R: Resource>(&mut self) -> &mut Self {
        self.kinds.insert(R::KIND, R::API_VERSION);
        self
    }

    pub fn is_registered<R: Resource>(&self) -> bool {
        self.kinds.get(R::KIND) == Some(&R::API_VERSION)
    }

    pub fn api_version_for(&self, kind: &str) -> Option<&'static str> {
        self.kinds.get(kind).copied()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.kinds.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firewall_scheme_knows_all_three_kinds() {
        let scheme = Scheme::firewall();
        assert!(scheme.is_registered::<FirewallDeployment>());
        assert!(scheme.is_registered::<FirewallSet>());
        assert!(scheme.is_registered::<Firewall>());
        assert_eq!(
            scheme.kinds().collect::<Vec<_>>(),
            vec!["Firewall", "FirewallDeployment", "FirewallSet"]
        );
        assert_eq!(
            scheme.api_version_for("FirewallSet"),
            Some("firewall.metal-stack.io/v2")
        );
        assert!(!Scheme::new().is_registered::<Firewall>());
    }
}
