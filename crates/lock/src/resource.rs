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
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::deadlock_detector::DeadlockDetector;
use crate::types::{Identity, VictimNotice, Weight};

#[derive(Debug, Default)]
struct ActorState {
    owner: Option<Identity>,
    /// Identities with an `apply` in flight on this actor
    waiting: HashSet<Identity>,
    /// Waiting identities told to give up
    victims: HashSet<Identity>,
}

/// Ownership of one named resource.
///
/// The detector decides who is next in line; the actor holds the actual
/// owner and hands the resource over when the owner releases it.
#[derive(Debug)]
pub struct ResourceActor {
    name: String,
    detector: Arc<DeadlockDetector>,
    state: Mutex<ActorState>,
    notify: Notify,
}

impl ResourceActor {
    pub fn new(name: impl Into<String>, detector: Arc<DeadlockDetector>) -> Self {
        Self {
            name: name.into(),
            detector,
            state: Mutex::new(ActorState::default()),
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Option<Identity> {
        self.state.lock().owner
    }

    /// Whether the actor is unowned with nobody waiting on it
    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.owner.is_none() && state.waiting.is_empty()
    }

    /// Acquire the resource for `identity`.
    ///
    /// Returns false when `timeout` elapses, when the detector rejects the
    /// request to break a cycle, or when [`conflict_resolution`] names this
    /// identity while it waits. Reentrant for the current owner.
    ///
    /// [`conflict_resolution`]: Self::conflict_resolution
    pub async fn apply(&self, identity: Identity, weight: Weight, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        self.state.lock().waiting.insert(identity);

        let acquired = self.wait_for_grant(identity, weight, timeout).await && self.wait_for_owner(identity, deadline).await;

        let mut state = self.state.lock();
        state.waiting.remove(&identity);
        state.victims.remove(&identity);
        acquired
    }

    async fn wait_for_grant(&self, identity: Identity, weight: Weight, timeout: Duration) -> bool {
        let pending = self.detector.apply_request(identity, self.name.clone(), weight, timeout).wait();
        tokio::pin!(pending);

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.lock().victims.contains(&identity) {
                debug!("Identity {} gave up waiting for '{}'", identity, self.name);
                return false;
            }

            tokio::select! {
                response = &mut pending => {
                    return match response {
                        Ok(response) => {
                            debug!("Detector answered {:?} to identity {} on '{}'", response.outcome, identity, self.name);
                            response.granted()
                        }
                        Err(e) => {
                            warn!("Apply of identity {} on '{}' failed: {}", identity, self.name, e);
                            false
                        }
                    };
                }
                _ = &mut notified => {}
            }
        }
    }

    async fn wait_for_owner(&self, identity: Identity, deadline: tokio::time::Instant) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.victims.contains(&identity) {
                    return false;
                }
                match state.owner {
                    None => {
                        state.owner = Some(identity);
                        debug!("Identity {} now owns '{}'", identity, self.name);
                        return true;
                    }
                    Some(owner) if owner == identity => return true,
                    Some(_) => {}
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!("Identity {} timed out waiting for '{}'", identity, self.name);
                return false;
            }
        }
    }

    /// Give the resource up. No-op unless `identity` is the owner.
    pub fn release(&self, identity: Identity) -> bool {
        {
            let mut state = self.state.lock();
            if state.owner != Some(identity) {
                return false;
            }
            state.owner = None;
        }

        debug!("Identity {} released '{}'", identity, self.name);
        self.notify.notify_waiters();
        self.detector.remove_resource(identity);
        true
    }

    /// Make the in-flight `apply` of `identity` fail fast.
    ///
    /// Ignored when `identity` has nothing in flight here.
    pub fn conflict_resolution(&self, identity: Identity) -> bool {
        {
            let mut state = self.state.lock();
            if !state.waiting.contains(&identity) {
                return false;
            }
            state.victims.insert(identity);
        }

        self.notify.notify_waiters();
        true
    }
}

/// Resource actors addressed by name
#[derive(Debug)]
pub struct ResourceRegistry {
    detector: Arc<DeadlockDetector>,
    actors: Arc<DashMap<String, Arc<ResourceActor>>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceRegistry {
    /// Create the registry and start forwarding detector victims to actors.
    ///
    /// Must be called inside a tokio runtime for the forwarding to run.
    pub fn new(detector: Arc<DeadlockDetector>) -> Self {
        let actors: Arc<DashMap<String, Arc<ResourceActor>>> = Arc::new(DashMap::new());

        let forwarder = match tokio::runtime::Handle::try_current() {
            Ok(handle) => Some(handle.spawn(forward_victims(detector.subscribe_victims(), actors.clone()))),
            Err(_) => {
                warn!("No tokio runtime, victim notices will not reach resource actors");
                None
            }
        };

        Self {
            detector,
            actors,
            forwarder: Mutex::new(forwarder),
        }
    }

    pub fn detector(&self) -> &Arc<DeadlockDetector> {
        &self.detector
    }

    /// Actor for `name`, created on first use
    pub fn actor(&self, name: &str) -> Arc<ResourceActor> {
        if let Some(actor) = self.actors.get(name) {
            return actor.clone();
        }
        self.actors
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ResourceActor::new(name, self.detector.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ResourceActor>> {
        self.actors.get(name).map(|actor| actor.clone())
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}

impl Drop for ResourceRegistry {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.lock().take() {
            forwarder.abort();
        }
    }
}

async fn forward_victims(mut victims: broadcast::Receiver<VictimNotice>, actors: Arc<DashMap<String, Arc<ResourceActor>>>) {
    loop {
        match victims.recv().await {
            Ok(notice) => {
                for actor in actors.iter() {
                    if actor.conflict_resolution(notice.identity) {
                        debug!("Victim {} stopped waiting on '{}'", notice.identity, actor.name());
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Victim forwarder lagged, {} notices skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
