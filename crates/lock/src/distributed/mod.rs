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

pub mod instance;
pub mod keys;

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::DistributedConfig;
use crate::error::Result;
use crate::store::{LeaseStore, LockScript};
use crate::types::{Identity, Weight};

pub use instance::{HeldLease, LockInstance};
pub use keys::LockKeys;

/// Mutex, group and row locks over a shared lease store.
///
/// Every check-and-set runs as one store operation. Acquisitions poll every
/// `retry_interval` until they succeed or `timeout` elapses; contention and
/// store failures both end in `false`, never in an error.
#[derive(Debug)]
pub struct DistributedLockManager {
    store: Arc<dyn LeaseStore>,
    config: DistributedConfig,
    keys: LockKeys,
    /// Prefix of every mutex token written by this manager
    id: Uuid,
    instances: DashMap<Identity, Arc<LockInstance>>,
}

impl DistributedLockManager {
    pub fn new(store: Arc<dyn LeaseStore>, config: DistributedConfig) -> Self {
        Self {
            keys: LockKeys::new(config.key_prefix.clone()),
            store,
            config,
            id: Uuid::new_v4(),
            instances: DashMap::new(),
        }
    }

    pub fn config(&self) -> &DistributedConfig {
        &self.config
    }

    pub fn keys(&self) -> &LockKeys {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// Mutex token of `identity`, stable for the lifetime of this manager
    fn token(&self, identity: Identity) -> String {
        format!("{}:{}", self.id, identity)
    }

    /// Lease owner of `identity`, started on its first successful acquisition
    fn instance(&self, identity: Identity) -> Arc<LockInstance> {
        if let Some(instance) = self.instances.get(&identity) {
            if instance.is_active() {
                return instance.clone();
            }
        }
        let mut entry = self
            .instances
            .entry(identity)
            .or_insert_with(|| Arc::new(LockInstance::spawn(identity, self.store.clone(), &self.config)));
        if !entry.is_active() {
            *entry = Arc::new(LockInstance::spawn(identity, self.store.clone(), &self.config));
        }
        entry.clone()
    }

    /// Exclusive single-owner lock on `key`, reentrant for the same identity
    pub async fn acquire_mutex(&self, key: &str, identity: Identity, weight: Weight, timeout: Duration) -> bool {
        let store_key = self.keys.mutex(key);
        let token = self.token(identity);
        let ttl = self.config.lease_ttl;

        let (store, key_ref, token_ref) = (&self.store, store_key.as_str(), token.as_str());
        let acquired = self
            .retry(timeout, identity, key_ref, move || async move {
                if store.set_nx(key_ref, token_ref, ttl).await? {
                    return Ok(true);
                }
                store.extend(key_ref, token_ref, ttl).await
            })
            .await;
        if !acquired {
            return false;
        }

        debug!("Identity {} (weight {}) acquired mutex '{}'", identity, weight, key);
        self.track(identity, vec![HeldLease::Mutex { key: store_key, token }]).await
    }

    /// Shared lock on a whole group, excluded by a group writer
    pub async fn acquire_read(&self, group: &str, identity: Identity, weight: Weight, timeout: Duration) -> bool {
        let script = self
            .script(identity, weight)
            .require_empty_or_self(self.keys.group_write(group))
            .insert(self.keys.group_read(group));
        self.acquire_script(identity, &self.keys.group_read(group), script, timeout).await
    }

    /// Exclusive lock on a whole group, excluded by readers and other writers
    pub async fn acquire_write(&self, group: &str, identity: Identity, weight: Weight, timeout: Duration) -> bool {
        let script = self
            .script(identity, weight)
            .require_empty_or_self(self.keys.group_read(group))
            .require_empty_or_self(self.keys.group_write(group))
            .insert(self.keys.group_write(group));
        self.acquire_script(identity, &self.keys.group_write(group), script, timeout).await
    }

    /// Shared locks on rows of `group`; all ids or none
    pub async fn acquire_rows_read<S: AsRef<str>>(
        &self,
        group: &str,
        identity: Identity,
        weight: Weight,
        timeout: Duration,
        ids: &[S],
    ) -> bool {
        let mut script = self.row_script(group, identity, weight);
        for id in unique(ids) {
            script = script
                .require_empty_or_self(self.keys.row_write(group, id))
                .insert(self.keys.row_read(group, id));
        }
        self.acquire_script(identity, &self.keys.group_read(group), script, timeout).await
    }

    /// Exclusive locks on rows of `group`; all ids or none
    pub async fn acquire_rows_write<S: AsRef<str>>(
        &self,
        group: &str,
        identity: Identity,
        weight: Weight,
        timeout: Duration,
        ids: &[S],
    ) -> bool {
        let mut script = self.row_script(group, identity, weight);
        for id in unique(ids) {
            script = script
                .require_empty_or_self(self.keys.row_read(group, id))
                .require_empty_or_self(self.keys.row_write(group, id))
                .insert(self.keys.row_write(group, id));
        }
        self.acquire_script(identity, &self.keys.group_read(group), script, timeout).await
    }

    /// Release everything `identity` holds. Safe to call at any time.
    pub async fn release(&self, identity: Identity) -> bool {
        let Some((_, instance)) = self.instances.remove(&identity) else {
            return false;
        };
        let released = instance.release().await;
        debug!("Identity {} released {} leases", identity, released);
        true
    }

    /// Release every identity known to this manager
    pub async fn release_all(&self) {
        let identities: Vec<Identity> = self.instances.iter().map(|e| *e.key()).collect();
        futures::future::join_all(identities.into_iter().map(|identity| self.release(identity))).await;
    }

    /// Leases currently held by `identity`
    pub async fn held_keys(&self, identity: Identity) -> Vec<HeldLease> {
        let instance = self.instances.get(&identity).map(|e| e.clone());
        match instance {
            Some(instance) => instance.held().await,
            None => Vec::new(),
        }
    }

    pub fn active_identities(&self) -> usize {
        self.instances.len()
    }

    fn script(&self, identity: Identity, weight: Weight) -> LockScript {
        LockScript::new(identity.to_string(), weight.to_string(), self.config.lease_ttl)
    }

    /// Row locks first take the group read entry to keep a group writer out
    fn row_script(&self, group: &str, identity: Identity, weight: Weight) -> LockScript {
        self.script(identity, weight)
            .require_empty_or_self(self.keys.group_write(group))
            .insert(self.keys.group_read(group))
    }

    async fn acquire_script(&self, identity: Identity, label: &str, script: LockScript, timeout: Duration) -> bool {
        let (store, script_ref) = (&self.store, &script);
        let acquired = self.retry(timeout, identity, label, move || store.run_script(script_ref)).await;
        if !acquired {
            return false;
        }

        debug!("Identity {} acquired {} hash entries under '{}'", identity, script.inserts.len(), label);
        let leases = script
            .inserts
            .iter()
            .map(|key| HeldLease::Hash {
                key: key.clone(),
                field: script.field.clone(),
            })
            .collect();
        self.track(identity, leases).await
    }

    /// Register acquired leases with the owner task, undoing them if the
    /// identity was released in the meantime
    async fn track(&self, identity: Identity, leases: Vec<HeldLease>) -> bool {
        let instance = self.instance(identity);
        let mut tracked = true;
        for lease in &leases {
            if !instance.track(lease.clone()).await {
                tracked = false;
                break;
            }
        }
        if tracked {
            return true;
        }

        warn!("Identity {} was released while acquiring, dropping its new leases", identity);
        for lease in leases {
            let result = match &lease {
                HeldLease::Mutex { key, token } => self.store.delete_if(key, token).await,
                HeldLease::Hash { key, field } => self.store.hash_delete(key, field).await,
            };
            if let Err(e) = result {
                warn!("Failed to drop lease '{}': {}", lease.key(), e);
            }
        }
        false
    }

    async fn retry<F, Fut>(&self, timeout: Duration, identity: Identity, label: &str, mut attempt: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            match attempt().await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!("Lease store error while identity {} acquires '{}': {}", identity, label, e),
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("Identity {} timed out acquiring '{}'", identity, label);
                return false;
            }
            tokio::time::sleep(self.config.retry_interval.min(deadline - now)).await;
        }
    }
}

fn unique<S: AsRef<str>>(ids: &[S]) -> BTreeSet<&str> {
    ids.iter().map(AsRef::as_ref).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::store::MemoryLeaseStore;

    const SHORT: Duration = Duration::from_millis(60);
    const LONG: Duration = Duration::from_secs(2);

    fn manager() -> (Arc<MemoryLeaseStore>, DistributedLockManager) {
        let store = Arc::new(MemoryLeaseStore::new());
        let manager = DistributedLockManager::new(store.clone(), LockConfig::minimal().distributed);
        (store, manager)
    }

    #[tokio::test]
    async fn test_mutex_exclusion_and_reentry() {
        let (_, manager) = manager();
        let (a, b) = (Identity::new(1), Identity::new(2));

        assert!(manager.acquire_mutex("orders", a, 0, SHORT).await);
        assert!(manager.acquire_mutex("orders", a, 0, SHORT).await);
        assert!(!manager.acquire_mutex("orders", b, 0, SHORT).await);

        assert!(manager.release(a).await);
        assert!(manager.acquire_mutex("orders", b, 0, SHORT).await);
    }

    #[tokio::test]
    async fn test_read_write_exclusion() {
        let (_, manager) = manager();
        let (a, b, c) = (Identity::new(1), Identity::new(2), Identity::new(3));

        assert!(manager.acquire_read("orders", a, 0, SHORT).await);
        assert!(manager.acquire_read("orders", b, 0, SHORT).await);
        assert!(!manager.acquire_write("orders", c, 0, SHORT).await);

        manager.release(a).await;
        manager.release(b).await;
        assert!(manager.acquire_write("orders", c, 0, SHORT).await);
        assert!(!manager.acquire_read("orders", a, 0, SHORT).await);
        assert!(!manager.acquire_write("orders", b, 0, SHORT).await);
    }

    #[tokio::test]
    async fn test_own_read_upgrades_to_write() {
        let (_, manager) = manager();
        let a = Identity::new(1);
        assert!(manager.acquire_read("orders", a, 0, SHORT).await);
        assert!(manager.acquire_write("orders", a, 0, SHORT).await);
        assert_eq!(manager.held_keys(a).await.len(), 2);
    }

    #[tokio::test]
    async fn test_row_write_blocked_by_reader_takes_nothing() {
        let (store, manager) = manager();
        let (reader, writer) = (Identity::new(4), Identity::new(3));

        assert!(manager.acquire_rows_read("sku", reader, 0, SHORT, &["2"]).await);
        assert!(!manager.acquire_rows_write("sku", writer, 0, SHORT, &["1", "2"]).await);

        let keys = manager.keys().clone();
        assert!(store.hash_fields(&keys.row_write("sku", "1")).await.unwrap().is_empty());
        assert!(manager.held_keys(writer).await.is_empty());
    }

    #[tokio::test]
    async fn test_group_write_excludes_row_locks() {
        let (_, manager) = manager();
        let (a, b) = (Identity::new(1), Identity::new(2));

        assert!(manager.acquire_rows_write("sku", a, 0, SHORT, &["1"]).await);
        assert!(!manager.acquire_write("sku", b, 0, SHORT).await);
        manager.release(a).await;

        assert!(manager.acquire_write("sku", b, 0, SHORT).await);
        assert!(!manager.acquire_rows_read("sku", a, 0, SHORT, &["9"]).await);
    }

    #[tokio::test]
    async fn test_waiter_acquires_after_release() {
        let (_, manager) = manager();
        let manager = Arc::new(manager);
        let (a, b) = (Identity::new(1), Identity::new(2));
        assert!(manager.acquire_mutex("m", a, 0, SHORT).await);

        let waiter = manager.clone();
        let handle = tokio::spawn(async move { waiter.acquire_mutex("m", b, 0, LONG).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.release(a).await;

        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (store, manager) = manager();
        let a = Identity::new(1);
        assert!(!manager.release(a).await);

        assert!(manager.acquire_rows_write("sku", a, 0, SHORT, &["1", "2"]).await);
        assert!(manager.release(a).await);
        assert!(!manager.release(a).await);
        assert!(store.is_empty());
        assert_eq!(manager.active_identities(), 0);
    }

    #[tokio::test]
    async fn test_store_outage_is_a_failed_attempt() {
        let (store, manager) = manager();
        store.set_unavailable(true);
        assert!(!manager.acquire_mutex("m", Identity::new(1), 0, SHORT).await);

        store.set_unavailable(false);
        assert!(manager.acquire_mutex("m", Identity::new(1), 0, SHORT).await);
    }

    #[tokio::test]
    async fn test_duplicate_row_ids() {
        let (_, manager) = manager();
        let a = Identity::new(1);
        assert!(manager.acquire_rows_write("sku", a, 0, SHORT, &["1", "1"]).await);
        // group read entry plus one row entry
        assert_eq!(manager.held_keys(a).await.len(), 2);
    }

    #[tokio::test]
    async fn test_row_readers_share_ids() {
        let (store, manager) = manager();
        let (a, b, c) = (Identity::new(1), Identity::new(2), Identity::new(3));

        assert!(manager.acquire_rows_read("sku", a, 0, SHORT, &["1", "2"]).await);
        assert!(manager.acquire_rows_read("sku", b, 0, SHORT, &["2"]).await);
        let keys = manager.keys().clone();
        assert_eq!(
            store.hash_fields(&keys.row_read("sku", "2")).await.unwrap(),
            vec!["1".to_string(), "2".to_string()]
        );

        assert!(!manager.acquire_rows_write("sku", c, 0, SHORT, &["2"]).await);
        assert!(manager.acquire_rows_write("sku", c, 0, SHORT, &["3"]).await);
    }

    #[tokio::test]
    async fn test_failed_acquisitions_start_no_owner() {
        let (_, manager) = manager();
        assert!(manager.acquire_mutex("m", Identity::new(1), 0, SHORT).await);

        for id in 2..=20 {
            assert!(!manager.acquire_mutex("m", Identity::new(id), 0, Duration::from_millis(1)).await);
        }
        assert_eq!(manager.active_identities(), 1);
        assert!(!manager.release(Identity::new(2)).await);
    }

    #[tokio::test]
    async fn test_lapsed_group_lease_is_not_renewed_for_new_owner() {
        let (store, manager) = manager();
        let (a, b) = (Identity::new(1), Identity::new(2));
        let config = manager.config().clone();

        assert!(manager.acquire_write("g", a, 0, SHORT).await);
        store.set_unavailable(true);
        tokio::time::sleep(config.lease_ttl + Duration::from_millis(100)).await;
        store.set_unavailable(false);

        assert!(manager.acquire_write("g", b, 0, SHORT).await);
        tokio::time::sleep(config.renew_interval() * 2 + Duration::from_millis(50)).await;

        assert!(manager.held_keys(a).await.is_empty());
        assert_eq!(manager.held_keys(b).await.len(), 1);
        let keys = manager.keys().clone();
        assert_eq!(store.hash_fields(&keys.group_write("g")).await.unwrap(), vec!["2".to_string()]);
    }

    #[tokio::test]
    async fn test_mutex_keys_do_not_collide_with_groups() {
        let (_, manager) = manager();
        let (a, b) = (Identity::new(1), Identity::new(2));
        assert!(manager.acquire_read("x", a, 0, SHORT).await);
        assert!(manager.acquire_mutex("read:x", b, 0, SHORT).await);
    }
}

