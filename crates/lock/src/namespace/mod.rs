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

use std::sync::Arc;
use std::time::Duration;

use crate::{
    deadlock_detector::DeadlockDetector,
    distributed::DistributedLockManager,
    guard::TransactionLockGuard,
    local::LocalArbiter,
    types::{Identity, LockType, Weight, row_resource, table_resource},
};


/// Table and row locking over either backend
#[derive(Debug, Clone)]
pub enum NamespaceLock {
    /// Detector and resource actors of this process; every access is exclusive
    Local(Arc<LocalArbiter>),
    /// Leases in a store shared by many processes
    Distributed(Arc<DistributedLockManager>),
}

impl NamespaceLock {
    /// Create namespace lock backed by an in-process detector
    pub fn local(detector: Arc<DeadlockDetector>) -> Self {
        Self::Local(Arc::new(LocalArbiter::new(detector)))
    }

    /// Create namespace lock backed by a shared lease store
    pub fn distributed(manager: Arc<DistributedLockManager>) -> Self {
        Self::Distributed(manager)
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    /// Lock a whole table
    pub async fn apply_table(&self, identity: Identity, table: &str, lock_type: LockType, weight: Weight, timeout: Duration) -> bool {
        match self {
            Self::Local(arbiter) => arbiter.apply(identity, &table_resource(table), weight, timeout).await,
            Self::Distributed(manager) => match lock_type {
                LockType::Shared => manager.acquire_read(table, identity, weight, timeout).await,
                LockType::Exclusive => manager.acquire_write(table, identity, weight, timeout).await,
            },
        }
    }

    /// Lock rows of a table.
    ///
    /// The distributed backend takes all rows or none. The local backend
    /// applies row by row in ascending order and leaves granted rows held on
    /// failure until `release`.
    pub async fn apply_rows<S: AsRef<str> + Sync>(
        &self,
        identity: Identity,
        table: &str,
        row_ids: &[S],
        lock_type: LockType,
        weight: Weight,
        timeout: Duration,
    ) -> bool {
        match self {
            Self::Local(arbiter) => {
                let resources = row_ids.iter().map(|id| row_resource(table, id.as_ref()));
                arbiter.apply_all(identity, resources, weight, timeout).await
            }
            Self::Distributed(manager) => match lock_type {
                LockType::Shared => manager.acquire_rows_read(table, identity, weight, timeout, row_ids).await,
                LockType::Exclusive => manager.acquire_rows_write(table, identity, weight, timeout, row_ids).await,
            },
        }
    }

    /// Release everything `identity` holds. No-op when it holds nothing.
    pub async fn release(&self, identity: Identity) -> bool {
        match self {
            Self::Local(arbiter) => arbiter.release(identity),
            Self::Distributed(manager) => manager.release(identity).await,
        }
    }

    /// Guard that releases `identity` when dropped
    pub fn guard(&self, identity: Identity) -> TransactionLockGuard {
        TransactionLockGuard::new(identity, self.clone())
    }
}
