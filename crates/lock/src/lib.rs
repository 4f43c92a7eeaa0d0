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

// ============================================================================
// Core Module Declarations
// ============================================================================

// Application Layer Modules
pub mod guard;
pub mod namespace;

// Backends
pub mod blocking;
pub mod deadlock_detector;
pub mod distributed;
pub mod local;
pub mod resource;
pub mod store;

// Core Modules
pub mod config;
pub mod error;
pub mod types;

// ============================================================================
// Public API Exports
// ============================================================================

pub use crate::{
    blocking::BlockingLockManager,
    config::{DetectorConfig, DistributedConfig, LockConfig},
    deadlock_detector::{DeadlockDetector, DetectorStats, PendingApply},
    distributed::{DistributedLockManager, HeldLease},
    error::{LockError, Result},
    guard::TransactionLockGuard,
    local::LocalArbiter,
    namespace::NamespaceLock,
    resource::{ResourceActor, ResourceRegistry},
    store::{LeaseStore, LockScript, MemoryLeaseStore},
    types::{ApplyOutcome, ApplyRequest, ApplyResponse, Identity, LockType, VictimNotice, Weight, row_resource, table_resource},
};

// ============================================================================
// Version Information
// ============================================================================

/// Current version of the lock crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Global Detector
// ============================================================================

use once_cell::sync::OnceCell;
use std::sync::Arc;

static GLOBAL_DETECTOR: OnceCell<Arc<DeadlockDetector>> = OnceCell::new();

/// Process-wide detector, configured from the environment on first use
pub fn get_global_detector() -> Result<Arc<DeadlockDetector>> {
    GLOBAL_DETECTOR
        .get_or_try_init(|| {
            let config = LockConfig::from_env()?;
            DeadlockDetector::new(&config.detector).map(Arc::new)
        })
        .cloned()
}

/// Create a namespace lock on the process-wide detector
pub fn create_local_namespace_lock() -> Result<NamespaceLock> {
    Ok(NamespaceLock::local(get_global_detector()?))
}

/// Create a namespace lock over a shared lease store
pub fn create_distributed_namespace_lock(store: Arc<dyn LeaseStore>, config: &LockConfig) -> NamespaceLock {
    NamespaceLock::distributed(Arc::new(DistributedLockManager::new(store, config.distributed.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_detector_is_shared() {
        let a = get_global_detector().unwrap();
        let b = get_global_detector().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_running());
    }

    #[tokio::test]
    async fn test_create_namespace_locks() {
        assert!(create_local_namespace_lock().unwrap().is_local());
        let lock = create_distributed_namespace_lock(Arc::new(MemoryLeaseStore::new()), &LockConfig::minimal());
        assert!(!lock.is_local());
    }
}
