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

use super::{Image, MachineProvider, ProviderError};
use crate::fcm::util::clock::Clock;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

struct CachedImage {
    image: Image,
    fetched_at: DateTime<Utc>,
}

/// Short-lived cache in front of [`MachineProvider::find_latest_image`],
/// keyed by image shorthand. Shared by all deployment workers.
pub struct ImageCache {
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
    entries: RwLock<HashMap<String, CachedImage>>,
}

impl ImageCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(52)),
            clock,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn latest_image(
        &self,
        provider: &dyn MachineProvider,
        shorthand: &str,
    ) -> Result<Image, ProviderError> {
        let now = self.clock.now();
        {
            let entries = self.entries.read().expect("image cache lock poisoned");
            if let Some(cached) = entries.get(shorthand) {
                if now - cached.fetched_at < self.ttl {
                    return Ok(cached.image.clone());
                }
            }
        }

        let image = provider.find_latest_image(shorthand)?;
        self.entries.write().expect("image cache lock poisoned").insert(
            shorthand.to_string(),
            CachedImage {
                image: image.clone(),
                fetched_at: now,
            },
        );
        Ok(image)
    }

    pub fn invalidate(&self, shorthand: &str) {
        self.entries
            .write()
            .expect("image cache lock poisoned")
            .remove(shorthand);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fcm::provider::InMemoryProvider;
    use crate::fcm::test_support::ManualClock;

    #[test]
    fn lookups_are_cached_until_the_ttl_expires() {
        let clock = Arc::new(ManualClock::default());
        let provider = InMemoryProvider::new();
        provider.set_latest_image("firewall-ubuntu-3.0", "firewall-ubuntu-3.0.20240101");
        let cache = ImageCache::new(Duration::from_secs(300), clock.clone());

        let first = cache
            .latest_image(&provider, "firewall-ubuntu-3.0")
            .expect("first lookup");
        provider.set_latest_image("firewall-ubuntu-3.0", "firewall-ubuntu-3.0.20240201");
        clock.advance(Duration::from_secs(299));
        let cached = cache
            .latest_image(&provider, "firewall-ubuntu-3.0")
            .expect("cached lookup");
        assert_eq!(first, cached);
        assert_eq!(provider.image_lookups(), 1);

        clock.advance(Duration::from_secs(1));
        let refreshed = cache
            .latest_image(&provider, "firewall-ubuntu-3.0")
            .expect("refreshed lookup");
        assert_eq!(refreshed.id, "firewall-ubuntu-3.0.20240201");
        assert_eq!(provider.image_lookups(), 2);
    }

    #[test]
    fn failures_are_not_cached() {
        let clock = Arc::new(ManualClock::default());
        let provider = InMemoryProvider::new();
        let cache = ImageCache::new(Duration::from_secs(300), clock);

        assert!(cache.latest_image(&provider, "firewall-ubuntu-3.0").is_err());
        provider.set_latest_image("firewall-ubuntu-3.0", "firewall-ubuntu-3.0.20240101");
        assert!(cache.latest_image(&provider, "firewall-ubuntu-3.0").is_ok());
    }
}
