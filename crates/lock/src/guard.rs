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

use std::sync::LazyLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::namespace::NamespaceLock;
use crate::types::Identity;

#[derive(Debug)]
struct ReleaseJob {
    identity: Identity,
    lock: NamespaceLock,
}

#[derive(Debug)]
struct ReleaseRuntime {
    tx: Option<mpsc::Sender<ReleaseJob>>,
}

// Background worker draining releases of dropped guards
static RELEASE_RUNTIME: LazyLock<ReleaseRuntime> = LazyLock::new(|| {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return ReleaseRuntime { tx: None };
    };

    let (tx, mut rx) = mpsc::channel::<ReleaseJob>(4096);
    handle.spawn(async move {
        while let Some(job) = rx.recv().await {
            if job.lock.release(job.identity).await {
                debug!("Guard released identity {}", job.identity);
            }
        }
    });

    ReleaseRuntime { tx: Some(tx) }
});

/// Releases everything an identity holds when dropped.
///
/// The release itself runs on a background task, so dropping the guard never
/// blocks. Use [`release`](Self::release) to wait for it instead.
#[derive(Debug)]
pub struct TransactionLockGuard {
    identity: Identity,
    lock: NamespaceLock,
    disarmed: bool,
}

impl TransactionLockGuard {
    pub(crate) fn new(identity: Identity, lock: NamespaceLock) -> Self {
        Self {
            identity,
            lock,
            disarmed: false,
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn lock(&self) -> &NamespaceLock {
        &self.lock
    }

    /// Keep the locks when the guard is dropped
    pub fn disarm(&mut self) {
        self.disarmed = true;
    }

    pub fn is_disarmed(&self) -> bool {
        self.disarmed
    }

    /// Release now and wait for it to finish
    pub async fn release(mut self) -> bool {
        self.disarmed = true;
        self.lock.release(self.identity).await
    }

    fn release_in_background(&mut self) {
        if self.disarmed {
            return;
        }
        self.disarmed = true;

        let job = ReleaseJob {
            identity: self.identity,
            lock: self.lock.clone(),
        };
        let job = match RELEASE_RUNTIME.tx.as_ref() {
            Some(tx) => match tx.try_send(job) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(job)) | Err(mpsc::error::TrySendError::Closed(job)) => job,
            },
            None => job,
        };

        // worker unavailable, fall back to a detached task on the current runtime
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    job.lock.release(job.identity).await;
                });
            }
            Err(_) => warn!(
                "No tokio runtime to release identity {}, leases expire on their own and local locks stay held",
                job.identity
            ),
        }
    }
}

impl Drop for TransactionLockGuard {
    fn drop(&mut self) {
        self.release_in_background();
    }
}
