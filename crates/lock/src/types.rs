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

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Caller-supplied priority. Higher weight wins a conflict.
pub type Weight = i64;

static NEXT_IDENTITY: AtomicU64 = AtomicU64::new(1);

/// Opaque id of one logical transaction or session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(u64);

impl Identity {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate a process-unique identity for a new transaction
    pub fn next() -> Self {
        Self(NEXT_IDENTITY.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for Identity {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lock type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockType {
    /// Exclusive lock (write lock)
    Exclusive,
    /// Shared lock (read lock)
    Shared,
}

/// Resource name of a table-level lock
pub fn table_resource(table: &str) -> String {
    table.to_string()
}

/// Resource name of a row-level lock, `"<table>:<row-id>"`
pub fn row_resource(table: &str, row_id: &str) -> String {
    format!("{table}:{row_id}")
}

/// A request to the wait-for graph for one resource
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub identity: Identity,
    pub resource: String,
    pub weight: Weight,
    pub timeout: Duration,
    pub submitted_at: Instant,
}

impl ApplyRequest {
    pub fn new(identity: Identity, resource: impl Into<String>, weight: Weight, timeout: Duration) -> Self {
        Self {
            identity,
            resource: resource.into(),
            weight,
            timeout,
            submitted_at: Instant::now(),
        }
    }

    /// Whether the request has waited longer than its timeout
    pub fn has_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.submitted_at) > self.timeout
    }
}

/// How an apply request was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    /// Requester is the rightful holder of the resource
    Granted,
    /// Waited longer than the request timeout
    TimedOut,
    /// Rejected to break a wait-for cycle
    Victimized,
    /// Caller stopped waiting before the request was resolved
    Abandoned,
    /// Detector hit an internal invariant violation
    Failed,
}

/// Resolution of one apply request, delivered asynchronously
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResponse {
    pub identity: Identity,
    pub resource: String,
    pub outcome: ApplyOutcome,
}

impl ApplyResponse {
    pub fn new(identity: Identity, resource: impl Into<String>, outcome: ApplyOutcome) -> Self {
        Self {
            identity,
            resource: resource.into(),
            outcome,
        }
    }

    pub fn granted(&self) -> bool {
        self.outcome == ApplyOutcome::Granted
    }
}

/// Published when an identity is aborted to break a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VictimNotice {
    pub identity: Identity,
    /// Resource the victim was waiting for when the cycle was found
    pub resource: String,
    /// Identity the cycle was resolved in favour of
    pub survivor: Identity,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_display_and_order() {
        let a = Identity::new(3);
        let b = Identity::from(9);
        assert_eq!(a.to_string(), "3");
        assert!(a < b);
        assert_eq!(b.as_u64(), 9);
    }

    #[test]
    fn test_identity_next_is_unique() {
        let a = Identity::next();
        let b = Identity::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_resource_names() {
        assert_eq!(table_resource("orders"), "orders");
        assert_eq!(row_resource("sku", "2"), "sku:2");
    }

    #[test]
    fn test_request_expiry() {
        let request = ApplyRequest::new(Identity::new(1), "orders", 1, Duration::from_millis(10));
        assert!(!request.has_expired(request.submitted_at));
        assert!(request.has_expired(request.submitted_at + Duration::from_millis(11)));
    }

    #[test]
    fn test_response_granted() {
        let response = ApplyResponse::new(Identity::new(1), "orders", ApplyOutcome::Granted);
        assert!(response.granted());
        let response = ApplyResponse::new(Identity::new(1), "orders", ApplyOutcome::Victimized);
        assert!(!response.granted());
    }

    #[test]
    fn test_identity_serde_is_transparent() {
        let json = serde_json::to_string(&Identity::new(42)).unwrap();
        assert_eq!(json, "42");
    }
}
