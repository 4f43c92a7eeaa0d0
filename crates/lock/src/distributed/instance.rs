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

//! Per-identity lease owner.
//!
//! One task per identity owns the set of held leases. Acquisitions report new
//! leases to it, it renews them on a fixed interval, and it deletes them all
//! on release. Nothing else touches the set.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::DistributedConfig;
use crate::store::LeaseStore;
use crate::types::Identity;

/// One lease held in the store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HeldLease {
    /// Single-owner value holding this identity's token
    Mutex { key: String, token: String },
    /// This identity's field in a TTL hash
    Hash { key: String, field: String },
}

impl HeldLease {
    pub fn key(&self) -> &str {
        match self {
            HeldLease::Mutex { key, .. } | HeldLease::Hash { key, .. } => key,
        }
    }
}

#[derive(Debug)]
enum Command {
    Track(HeldLease),
    Held(oneshot::Sender<Vec<HeldLease>>),
    Release(oneshot::Sender<usize>),
}

/// Handle to the lease owner task of one identity.
///
/// Dropping the handle without calling [`release`](Self::release) still
/// releases every lease once the task sees the channel close.
#[derive(Debug)]
pub struct LockInstance {
    identity: Identity,
    tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl LockInstance {
    pub fn spawn(identity: Identity, store: Arc<dyn LeaseStore>, config: &DistributedConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.command_buffer);
        let task = tokio::spawn(run(identity, store, config.clone(), rx));
        Self { identity, tx, task }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished() && !self.tx.is_closed()
    }

    /// Hand a freshly acquired lease to the owner. False once released.
    pub async fn track(&self, lease: HeldLease) -> bool {
        self.tx.send(Command::Track(lease)).await.is_ok()
    }

    pub async fn held(&self) -> Vec<HeldLease> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Held(reply)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Delete every held lease and stop renewing. Returns the number of
    /// leases released, 0 when already released.
    pub async fn release(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Release(reply)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

async fn run(identity: Identity, store: Arc<dyn LeaseStore>, config: DistributedConfig, mut rx: mpsc::Receiver<Command>) {
    let mut held: BTreeSet<HeldLease> = BTreeSet::new();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + config.renew_interval(), config.renew_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Track(lease)) => {
                    held.insert(lease);
                }
                Some(Command::Held(reply)) => {
                    let _ = reply.send(held.iter().cloned().collect());
                }
                Some(Command::Release(reply)) => {
                    let released = release_all(identity, store.as_ref(), &mut held).await;
                    let _ = reply.send(released);
                    break;
                }
                None => {
                    release_all(identity, store.as_ref(), &mut held).await;
                    break;
                }
            },
            _ = ticker.tick() => renew(identity, store.as_ref(), &config, &mut held).await,
        }
    }

    // refuse commands queued behind the release
    rx.close();
    debug!("Lock instance of identity {} stopped", identity);
}

async fn renew(identity: Identity, store: &dyn LeaseStore, config: &DistributedConfig, held: &mut BTreeSet<HeldLease>) {
    let mut lost = Vec::new();
    for lease in held.iter() {
        let renewed = match lease {
            HeldLease::Mutex { key, token } => store.extend(key, token, config.lease_ttl).await,
            HeldLease::Hash { key, field } => store.hash_extend(key, field, config.lease_ttl).await,
        };
        match renewed {
            Ok(true) => {}
            Ok(false) => lost.push(lease.clone()),
            Err(e) => warn!("Failed to renew lease '{}' of identity {}: {}", lease.key(), identity, e),
        }
    }

    for lease in lost {
        warn!("Lease '{}' of identity {} expired before renewal", lease.key(), identity);
        held.remove(&lease);
    }
}

async fn release_all(identity: Identity, store: &dyn LeaseStore, held: &mut BTreeSet<HeldLease>) -> usize {
    let count = held.len();
    for lease in std::mem::take(held) {
        let result = match &lease {
            HeldLease::Mutex { key, token } => store.delete_if(key, token).await,
            HeldLease::Hash { key, field } => store.hash_delete(key, field).await,
        };
        match result {
            Ok(true) => debug!("Identity {} released '{}'", identity, lease.key()),
            Ok(false) => debug!("Lease '{}' of identity {} already gone", lease.key(), identity),
            Err(e) => warn!("Failed to release lease '{}' of identity {}: {}", lease.key(), identity, e),
        }
    }
    count
}
