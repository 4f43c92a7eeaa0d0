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

//! In-process wait-for graph arbiter.
//!
//! Producers push apply requests onto a lock-free queue and get back a
//! [`PendingApply`]. A single sweep thread drains the queue, evaluates each
//! request against the [`WaitForGraph`] and answers it exactly once.

pub mod graph;
pub mod slots;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, warn};

use crate::config::DetectorConfig;
use crate::error::{LockError, Result};
use crate::types::{ApplyOutcome, ApplyRequest, ApplyResponse, Identity, VictimNotice, Weight};

pub use graph::{Evaluation, Verdict, WaitForGraph};

const SERVICE: &str = "deadlock-detector";

/// Detector counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorStats {
    pub sweeps: u64,
    pub granted: u64,
    pub timed_out: u64,
    pub victims: u64,
    pub abandoned: u64,
    pub failed: u64,
    pub identities: usize,
    pub resources: usize,
    pub identity_capacity: usize,
    pub resource_capacity: usize,
    pub waiting: usize,
}

#[derive(Debug)]
struct QueuedApply {
    request: ApplyRequest,
    reply: oneshot::Sender<ApplyResponse>,
}

#[derive(Debug)]
struct DetectorState {
    graph: WaitForGraph,
    /// Requests requeued during the current sweep
    waiting: VecDeque<QueuedApply>,
    stats: DetectorStats,
}

#[derive(Debug)]
struct DetectorInner {
    queue: SegQueue<QueuedApply>,
    state: Mutex<DetectorState>,
    shutdown: AtomicBool,
    responses: broadcast::Sender<ApplyResponse>,
    victims: broadcast::Sender<VictimNotice>,
    sweep_interval: Duration,
}

/// Future side of one apply request
#[derive(Debug)]
pub struct PendingApply {
    identity: Identity,
    resource: String,
    timeout: Duration,
    rx: oneshot::Receiver<ApplyResponse>,
}

impl PendingApply {
    /// Wait for the detector's decision
    pub async fn wait(self) -> Result<ApplyResponse> {
        self.rx.await.map_err(|_| LockError::shut_down(SERVICE))
    }

    /// Wait for the decision, reporting any refusal as an error
    pub async fn ensure_granted(self) -> Result<()> {
        let timeout = self.timeout;
        let response = self.wait().await?;
        match response.outcome {
            ApplyOutcome::Granted => Ok(()),
            ApplyOutcome::TimedOut => Err(LockError::timeout(response.resource, timeout)),
            ApplyOutcome::Victimized => Err(LockError::deadlock(response.identity, response.resource)),
            ApplyOutcome::Abandoned | ApplyOutcome::Failed => Err(LockError::internal(format!(
                "apply of identity {} on '{}' ended as {:?}",
                response.identity, response.resource, response.outcome
            ))),
        }
    }

    /// Wait at most `timeout`; `None` when the decision did not arrive in time
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Option<ApplyResponse>> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(response)) => Ok(Some(response)),
            Ok(Err(_)) => Err(LockError::shut_down(SERVICE)),
            Err(_) => Ok(None),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }
}

/// Wait-for graph deadlock detector
#[derive(Debug)]
pub struct DeadlockDetector {
    inner: Arc<DetectorInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeadlockDetector {
    /// Create the detector and start its sweep thread
    pub fn new(config: &DetectorConfig) -> Result<Self> {
        let (responses, _) = broadcast::channel(config.event_buffer);
        let (victims, _) = broadcast::channel(config.event_buffer);
        let inner = Arc::new(DetectorInner {
            queue: SegQueue::new(),
            state: Mutex::new(DetectorState {
                graph: WaitForGraph::new(config.initial_identities, config.initial_resources),
                waiting: VecDeque::new(),
                stats: DetectorStats::default(),
            }),
            shutdown: AtomicBool::new(false),
            responses,
            victims,
            sweep_interval: config.sweep_interval,
        });

        let worker_inner = inner.clone();
        let worker = std::thread::Builder::new()
            .name("txlock-detector".to_string())
            .spawn(move || run(worker_inner))
            .map_err(|e| LockError::internal(format!("failed to spawn detector thread: {e}")))?;

        Ok(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueue an apply request. Never blocks.
    pub fn apply_request(&self, identity: Identity, resource: impl Into<String>, weight: Weight, timeout: Duration) -> PendingApply {
        let request = ApplyRequest::new(identity, resource, weight, timeout);
        let (tx, rx) = oneshot::channel();
        let pending = PendingApply {
            identity,
            resource: request.resource.clone(),
            timeout,
            rx,
        };
        if self.inner.shutdown.load(Ordering::Acquire) {
            // dropping tx makes wait() report the shutdown
            return pending;
        }
        self.inner.queue.push(QueuedApply { request, reply: tx });
        if self.inner.shutdown.load(Ordering::Acquire) {
            // the worker may have drained the queue for the last time already
            drain(&self.inner);
        }
        pending
    }

    /// Clear every relation of `identity`. Safe to call repeatedly.
    pub fn remove_resource(&self, identity: Identity) {
        let removed = self.inner.state.lock().graph.remove_identity(identity);
        if removed {
            debug!("Removed wait-for relations of identity {}", identity);
        }
    }

    /// Every response, in resolution order
    pub fn subscribe(&self) -> broadcast::Receiver<ApplyResponse> {
        self.inner.responses.subscribe()
    }

    /// Every identity rejected to break a cycle
    pub fn subscribe_victims(&self) -> broadcast::Receiver<VictimNotice> {
        self.inner.victims.subscribe()
    }

    /// Current rightful holder of `resource`
    pub fn holder(&self, resource: &str) -> Option<Identity> {
        self.inner.state.lock().graph.holder(resource)
    }

    /// Tick of `identity` on `resource`, 0 when unrelated
    pub fn stamp(&self, identity: Identity, resource: &str) -> u64 {
        self.inner.state.lock().graph.stamp(identity, resource)
    }

    pub fn stats(&self) -> DetectorStats {
        let state = self.inner.state.lock();
        let (identity_capacity, resource_capacity) = state.graph.capacity();
        DetectorStats {
            identities: state.graph.identity_count(),
            resources: state.graph.resource_count(),
            identity_capacity,
            resource_capacity,
            waiting: self.inner.queue.len() + state.waiting.len(),
            ..state.stats.clone()
        }
    }

    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stop the sweep thread; pending requests resolve with a shutdown error
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("Detector thread panicked");
            }
        }
    }
}

impl Drop for DeadlockDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(inner: Arc<DetectorInner>) {
    debug!("Detector thread started");
    while !inner.shutdown.load(Ordering::Acquire) {
        sweep(&inner);
        std::thread::sleep(inner.sweep_interval);
    }

    // drop every reply sender so waiters observe the shutdown
    inner.state.lock().waiting.clear();
    drain(&inner);
    debug!("Detector thread stopped");
}

fn drain(inner: &DetectorInner) {
    while inner.queue.pop().is_some() {}
}

fn sweep(inner: &DetectorInner) {
    let mut state = inner.state.lock();
    let now = Instant::now();

    let pending = inner.queue.len();
    for _ in 0..pending {
        let Some(item) = inner.queue.pop() else {
            break;
        };
        process(inner, &mut state, item, now);
    }

    let waiting = std::mem::take(&mut state.waiting);
    for item in waiting {
        if state.graph.is_destroyed(&item.request.identity) {
            respond(inner, &mut state, item, ApplyOutcome::Victimized);
        } else {
            inner.queue.push(item);
        }
    }

    state.graph.clear_destroyed();
    state.stats.sweeps += 1;
}

fn process(inner: &DetectorInner, state: &mut DetectorState, item: QueuedApply, now: Instant) {
    if item.reply.is_closed() {
        state.stats.abandoned += 1;
        debug!(
            "Dropping abandoned request of identity {} for '{}'",
            item.request.identity, item.request.resource
        );
        return;
    }

    match state.graph.evaluate(&item.request, now) {
        Ok(Evaluation { verdict, victim }) => {
            if let Some(notice) = victim {
                state.stats.victims += 1;
                // no subscribers is fine
                let _ = inner.victims.send(notice);
            }
            match verdict {
                Verdict::Granted => respond(inner, state, item, ApplyOutcome::Granted),
                Verdict::Wait => state.waiting.push_back(item),
                Verdict::TimedOut => respond(inner, state, item, ApplyOutcome::TimedOut),
                Verdict::Victimized => respond(inner, state, item, ApplyOutcome::Victimized),
            }
        }
        Err(e) => {
            error!(
                "Wait-for graph invariant violated for identity {} on '{}': {}",
                item.request.identity, item.request.resource, e
            );
            respond(inner, state, item, ApplyOutcome::Failed);
        }
    }
}

fn respond(inner: &DetectorInner, state: &mut DetectorState, item: QueuedApply, outcome: ApplyOutcome) {
    match outcome {
        ApplyOutcome::Granted => state.stats.granted += 1,
        ApplyOutcome::TimedOut => state.stats.timed_out += 1,
        ApplyOutcome::Failed => state.stats.failed += 1,
        ApplyOutcome::Victimized | ApplyOutcome::Abandoned => {}
    }

    let response = ApplyResponse::new(item.request.identity, item.request.resource, outcome);
    debug!("Identity {} on '{}': {:?}", response.identity, response.resource, outcome);
    let _ = inner.responses.send(response.clone());
    if item.reply.send(response).is_err() {
        warn!("Apply response dropped, caller is gone");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;

    fn detector() -> DeadlockDetector {
        DeadlockDetector::new(&LockConfig::minimal().detector).unwrap()
    }

    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_grant_and_reentry() {
        let detector = detector();
        let first = detector.apply_request(Identity::new(1), "orders", 1, LONG).wait().await.unwrap();
        assert!(first.granted());
        let again = detector.apply_request(Identity::new(1), "orders", 1, LONG).wait().await.unwrap();
        assert!(again.granted());
    }

    #[tokio::test]
    async fn test_waiter_times_out() {
        let detector = detector();
        assert!(detector.apply_request(Identity::new(1), "orders", 1, LONG).wait().await.unwrap().granted());

        let response = detector
            .apply_request(Identity::new(2), "orders", 1, Duration::from_millis(30))
            .wait()
            .await
            .unwrap();
        assert_eq!(response.outcome, ApplyOutcome::TimedOut);
        assert_eq!(detector.stats().timed_out, 1);
    }

    #[tokio::test]
    async fn test_waiter_granted_after_remove() {
        let detector = detector();
        assert!(detector.apply_request(Identity::new(1), "orders", 1, LONG).wait().await.unwrap().granted());

        let pending = detector.apply_request(Identity::new(2), "orders", 1, LONG);
        tokio::time::sleep(Duration::from_millis(20)).await;
        detector.remove_resource(Identity::new(1));

        let response = pending.wait().await.unwrap();
        assert!(response.granted());
        assert_eq!(detector.holder("orders"), Some(Identity::new(2)));
    }

    #[tokio::test]
    async fn test_remove_resource_is_idempotent() {
        let detector = detector();
        detector.remove_resource(Identity::new(42));
        assert!(detector.apply_request(Identity::new(42), "t", 1, LONG).wait().await.unwrap().granted());
        detector.remove_resource(Identity::new(42));
        detector.remove_resource(Identity::new(42));
        assert_eq!(detector.stamp(Identity::new(42), "t"), 0);
        assert_eq!(detector.stats().identities, 0);
    }

    #[tokio::test]
    async fn test_responses_are_broadcast() {
        let detector = detector();
        let mut events = detector.subscribe();
        detector.apply_request(Identity::new(5), "orders", 1, LONG).wait().await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.identity, Identity::new(5));
        assert!(event.granted());
    }

    #[tokio::test]
    async fn test_deadlock_victim_is_reported() {
        let detector = detector();
        let mut victims = detector.subscribe_victims();

        assert!(detector.apply_request(Identity::new(1), "orders", 5, LONG).wait().await.unwrap().granted());
        let waiting = detector.apply_request(Identity::new(2), "orders", 9, LONG);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(detector.apply_request(Identity::new(2), "stock", 9, LONG).wait().await.unwrap().granted());

        let rejected = detector.apply_request(Identity::new(1), "stock", 5, LONG).wait().await.unwrap();
        assert_eq!(rejected.outcome, ApplyOutcome::Victimized);

        let notice = victims.recv().await.unwrap();
        assert_eq!(notice.identity, Identity::new(1));
        assert_eq!(notice.survivor, Identity::new(2));

        assert!(waiting.wait().await.unwrap().granted());
    }

    #[tokio::test]
    async fn test_pending_requests_of_victim_are_rejected() {
        let detector = detector();
        assert!(detector.apply_request(Identity::new(1), "a", 1, LONG).wait().await.unwrap().granted());
        assert!(detector.apply_request(Identity::new(2), "b", 9, LONG).wait().await.unwrap().granted());

        // 1 queues behind 2 on b, then 2 closes the cycle and wins on weight
        let victim_pending = detector.apply_request(Identity::new(1), "b", 1, LONG);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let survivor = detector.apply_request(Identity::new(2), "a", 9, LONG).wait().await.unwrap();
        assert!(survivor.granted());

        let response = victim_pending.wait().await.unwrap();
        assert_eq!(response.outcome, ApplyOutcome::Victimized);
    }

    #[tokio::test]
    async fn test_abandoned_request_is_dropped() {
        let detector = detector();
        assert!(detector.apply_request(Identity::new(1), "orders", 1, LONG).wait().await.unwrap().granted());
        let pending = detector.apply_request(Identity::new(2), "orders", 1, LONG);
        assert!(pending.wait_timeout(Duration::from_millis(20)).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(detector.stats().abandoned, 1);
    }

    #[tokio::test]
    async fn test_ensure_granted_maps_refusals() {
        let detector = detector();
        assert!(detector.apply_request(Identity::new(1), "orders", 1, LONG).ensure_granted().await.is_ok());

        let err = detector
            .apply_request(Identity::new(2), "orders", 1, Duration::from_millis(20))
            .ensure_granted()
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_shutdown_resolves_waiters() {
        let detector = detector();
        detector.shutdown();
        assert!(!detector.is_running());
        let result = detector.apply_request(Identity::new(1), "orders", 1, LONG).wait().await;
        assert!(matches!(result, Err(LockError::ShutDown { .. })));
    }

    #[tokio::test]
    async fn test_requests_racing_shutdown_resolve() {
        let detector = Arc::new(detector());
        let producers: Vec<_> = (0..4u64)
            .map(|t| {
                let detector = detector.clone();
                std::thread::spawn(move || {
                    (0..200u64)
                        .map(|i| detector.apply_request(Identity::new(t * 1000 + i), "orders", 1, LONG))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        std::thread::sleep(Duration::from_millis(2));
        detector.shutdown();

        for producer in producers {
            for pending in producer.join().unwrap() {
                let resolved = tokio::time::timeout(Duration::from_secs(1), pending.wait()).await;
                assert!(resolved.is_ok());
            }
        }
    }
}
