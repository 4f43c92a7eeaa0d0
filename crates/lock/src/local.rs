// Copyright 2024 RustFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::deadlock_detector::DeadlockDetector;
use crate::resource::ResourceRegistry;
use crate::types::{Identity, Weight};

/// Resources one transaction of an identity applied for
#[derive(Debug)]
struct Applied {
    /// Changes every time the identity is released
    session: u64,
    resources: BTreeSet<String>,
}

/// In-process backend: resource actors arbitrated by one deadlock detector.
///
/// Remembers every resource an identity applied for so that `release` can
/// hand all of them back at transaction end.
#[derive(Debug)]
pub struct LocalArbiter {
    registry: ResourceRegistry,
    applied: DashMap<Identity, Applied>,
    sessions: AtomicU64,
}

impl LocalArbiter {
    pub fn new(detector: Arc<DeadlockDetector>) -> Self {
        Self {
            registry: ResourceRegistry::new(detector),
            applied: DashMap::new(),
            sessions: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn detector(&self) -> &Arc<DeadlockDetector> {
        self.registry.detector()
    }

    /// Apply for one resource.
    ///
    /// A grant that lands after `release(identity)` belongs to no transaction
    /// and is handed straight back.
    pub async fn apply(&self, identity: Identity, resource: &str, weight: Weight, timeout: Duration) -> bool {
        let session = {
            let mut applied = self.applied.entry(identity).or_insert_with(|| Applied {
                session: self.sessions.fetch_add(1, Ordering::Relaxed),
                resources: BTreeSet::new(),
            });
            applied.resources.insert(resource.to_string());
            applied.session
        };

        let actor = self.registry.actor(resource);
        if !actor.apply(identity, weight, timeout).await {
            return false;
        }

        let tracked = self
            .applied
            .get(&identity)
            .map(|applied| (applied.session == session, applied.resources.contains(resource)));
        match tracked {
            Some((true, _)) => true,
            // a later transaction of the same identity applied for it too
            Some((false, true)) => false,
            _ => {
                debug!("Identity {} was released while applying for '{}', giving it back", identity, resource);
                actor.release(identity);
                false
            }
        }
    }

    /// Apply for `resources` one at a time in ascending order, stopping at the
    /// first failure. Already granted resources stay held until `release`.
    pub async fn apply_all<I>(&self, identity: Identity, resources: I, weight: Weight, timeout: Duration) -> bool
    where
        I: IntoIterator<Item = String>,
    {
        let resources: BTreeSet<String> = resources.into_iter().collect();
        for resource in &resources {
            if !self.apply(identity, resource, weight, timeout).await {
                debug!("Identity {} failed to apply for '{}'", identity, resource);
                return false;
            }
        }
        true
    }

    /// Resources `identity` currently owns
    pub fn owned(&self, identity: Identity) -> Vec<String> {
        let Some(applied) = self.applied.get(&identity) else {
            return Vec::new();
        };
        applied
            .resources
            .iter()
            .filter(|resource| {
                self.registry
                    .get(resource)
                    .is_some_and(|actor| actor.owner() == Some(identity))
            })
            .cloned()
            .collect()
    }

    /// Release every resource of `identity` and drop its wait-for relations
    pub fn release(&self, identity: Identity) -> bool {
        let applied = self.applied.remove(&identity).map(|(_, applied)| applied.resources);
        let mut released = false;
        for resource in applied.iter().flatten() {
            if let Some(actor) = self.registry.get(resource) {
                released |= actor.release(identity);
            }
        }
        // also clears stamps of requests that timed out or were rejected
        self.detector().remove_resource(identity);
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;

    fn arbiter() -> LocalArbiter {
        LocalArbiter::new(Arc::new(DeadlockDetector::new(&LockConfig::minimal().detector).unwrap()))
    }

    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_apply_all_and_release() {
        let arbiter = arbiter();
        let a = Identity::new(1);
        let rows = vec!["sku:2".to_string(), "sku:1".to_string()];
        assert!(arbiter.apply_all(a, rows, 1, LONG).await);
        assert_eq!(arbiter.owned(a), vec!["sku:1".to_string(), "sku:2".to_string()]);

        assert!(arbiter.release(a));
        assert!(arbiter.owned(a).is_empty());
        assert!(!arbiter.release(a));
        assert_eq!(arbiter.detector().stats().identities, 0);
    }

    #[tokio::test]
    async fn test_timed_out_request_does_not_block_after_release() {
        let arbiter = arbiter();
        let (a, b, c) = (Identity::new(1), Identity::new(2), Identity::new(3));
        assert!(arbiter.apply(a, "orders", 1, LONG).await);
        assert!(!arbiter.apply(b, "orders", 1, Duration::from_millis(30)).await);

        // b gives up its transaction, then a finishes
        arbiter.release(b);
        arbiter.release(a);
        assert!(arbiter.apply(c, "orders", 1, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_release_during_apply_gives_resource_back() {
        let arbiter = Arc::new(arbiter());
        let (a, b, c) = (Identity::new(1), Identity::new(2), Identity::new(3));
        assert!(arbiter.apply(a, "orders", 1, LONG).await);

        let waiter = arbiter.clone();
        let handle = tokio::spawn(async move { waiter.apply(b, "orders", 1, LONG).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!arbiter.release(b));
        assert!(arbiter.release(a));
        assert!(!handle.await.unwrap());

        assert_eq!(arbiter.registry().get("orders").unwrap().owner(), None);
        assert!(!arbiter.release(b));
        assert!(arbiter.apply(c, "orders", 1, Duration::from_millis(500)).await);
    }
}
