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

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

pub use memory::MemoryLeaseStore;

/// Precondition on one TTL hash of a [`LockScript`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashCondition {
    /// The hash is absent, empty, or holds no field other than `field`
    EmptyOrOnly { key: String, field: String },
}

impl HashCondition {
    pub fn key(&self) -> &str {
        match self {
            HashCondition::EmptyOrOnly { key, .. } => key,
        }
    }
}

/// Atomic check-and-insert over TTL hashes.
///
/// If every condition holds, `field -> marker` is written into each insert
/// key and that hash's TTL is set to `ttl`. Otherwise nothing is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockScript {
    pub conditions: Vec<HashCondition>,
    pub inserts: Vec<String>,
    pub field: String,
    pub marker: String,
    pub ttl: Duration,
}

impl LockScript {
    pub fn new(field: impl Into<String>, marker: impl Into<String>, ttl: Duration) -> Self {
        Self {
            conditions: Vec::new(),
            inserts: Vec::new(),
            field: field.into(),
            marker: marker.into(),
            ttl,
        }
    }

    /// Require `key` to be empty or to hold only this script's field
    pub fn require_empty_or_self(mut self, key: impl Into<String>) -> Self {
        self.conditions.push(HashCondition::EmptyOrOnly {
            key: key.into(),
            field: self.field.clone(),
        });
        self
    }

    pub fn insert(mut self, key: impl Into<String>) -> Self {
        self.inserts.push(key.into());
        self
    }
}

/// Shared store of TTL leases.
///
/// Every method is one indivisible operation against the store. A backend
/// built on a remote key-value server maps `run_script` onto its server-side
/// scripting or transactions.
#[async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug {
    /// Set `key` to `token` with `ttl` if the key is absent
    async fn set_nx(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Reset the TTL of `key` if it still holds `token`
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` if it still holds `token`
    async fn delete_if(&self, key: &str, token: &str) -> Result<bool>;

    /// Run an atomic check-and-insert script, true when it applied
    async fn run_script(&self, script: &LockScript) -> Result<bool>;

    /// Reset the TTL of the hash at `key` if it still holds `field`
    async fn hash_extend(&self, key: &str, field: &str, ttl: Duration) -> Result<bool>;

    /// Remove `field` from the hash at `key`
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool>;

    /// Live fields of the hash at `key`
    async fn hash_fields(&self, key: &str) -> Result<Vec<String>>;

    /// Check if the store is reachable
    async fn is_online(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_builder() {
        let script = LockScript::new("7", "1", Duration::from_secs(1))
            .require_empty_or_self("write:orders")
            .insert("read:orders");
        assert_eq!(
            script.conditions,
            vec![HashCondition::EmptyOrOnly {
                key: "write:orders".to_string(),
                field: "7".to_string(),
            }]
        );
        assert_eq!(script.conditions[0].key(), "write:orders");
        assert_eq!(script.inserts, vec!["read:orders".to_string()]);
    }
}
