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

//! Synchronous forms of the distributed lock operations.
//!
//! Calls block the current thread on the given runtime handle, so they must
//! not be made from inside an async task of that runtime.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

use crate::distributed::{DistributedLockManager, HeldLease};
use crate::error::{LockError, Result};
use crate::types::{Identity, Weight};

#[derive(Debug, Clone)]
pub struct BlockingLockManager {
    inner: Arc<DistributedLockManager>,
    handle: Handle,
}

impl BlockingLockManager {
    pub fn new(inner: Arc<DistributedLockManager>, handle: Handle) -> Self {
        Self { inner, handle }
    }

    /// Wrap `inner` using the runtime of the calling thread
    pub fn from_current(inner: Arc<DistributedLockManager>) -> Result<Self> {
        let handle = Handle::try_current().map_err(|e| LockError::configuration(format!("no tokio runtime available: {e}")))?;
        Ok(Self::new(inner, handle))
    }

    pub fn inner(&self) -> &Arc<DistributedLockManager> {
        &self.inner
    }

    pub fn acquire_mutex(&self, key: &str, identity: Identity, weight: Weight, timeout: Duration) -> bool {
        self.handle.block_on(self.inner.acquire_mutex(key, identity, weight, timeout))
    }

    pub fn acquire_read(&self, group: &str, identity: Identity, weight: Weight, timeout: Duration) -> bool {
        self.handle.block_on(self.inner.acquire_read(group, identity, weight, timeout))
    }

    pub fn acquire_write(&self, group: &str, identity: Identity, weight: Weight, timeout: Duration) -> bool {
        self.handle.block_on(self.inner.acquire_write(group, identity, weight, timeout))
    }

    pub fn acquire_rows_read<S: AsRef<str>>(&self, group: &str, identity: Identity, weight: Weight, timeout: Duration, ids: &[S]) -> bool {
        self.handle
            .block_on(self.inner.acquire_rows_read(group, identity, weight, timeout, ids))
    }

    pub fn acquire_rows_write<S: AsRef<str>>(&self, group: &str, identity: Identity, weight: Weight, timeout: Duration, ids: &[S]) -> bool {
        self.handle
            .block_on(self.inner.acquire_rows_write(group, identity, weight, timeout, ids))
    }

    pub fn release(&self, identity: Identity) -> bool {
        self.handle.block_on(self.inner.release(identity))
    }

    pub fn held_keys(&self, identity: Identity) -> Vec<HeldLease> {
        self.handle.block_on(self.inner.held_keys(identity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::store::MemoryLeaseStore;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_blocking_forms() {
        let runtime = runtime();
        let manager = Arc::new(DistributedLockManager::new(
            Arc::new(MemoryLeaseStore::new()),
            LockConfig::minimal().distributed,
        ));
        let locks = BlockingLockManager::new(manager, runtime.handle().clone());
        let (a, b) = (Identity::new(1), Identity::new(2));
        let short = Duration::from_millis(50);

        assert!(locks.acquire_mutex("orders", a, 0, short));
        assert!(!locks.acquire_mutex("orders", b, 0, short));
        assert!(locks.acquire_rows_write("sku", a, 0, short, &["1", "2"]));
        assert!(!locks.acquire_rows_read("sku", b, 0, short, &["2"]));
        assert_eq!(locks.held_keys(a).len(), 4);

        assert!(locks.release(a));
        assert!(!locks.release(a));
        assert!(locks.acquire_write("orders", b, 0, short));
        assert!(!locks.acquire_read("orders", a, 0, short));
    }

    #[test]
    fn test_from_current_requires_runtime() {
        let manager = Arc::new(DistributedLockManager::new(
            Arc::new(MemoryLeaseStore::new()),
            LockConfig::minimal().distributed,
        ));
        assert!(BlockingLockManager::from_current(manager.clone()).is_err());

        let runtime = runtime();
        let _guard = runtime.enter();
        assert!(BlockingLockManager::from_current(manager).is_ok());
    }
}
