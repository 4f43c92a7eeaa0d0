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

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::{HashCondition, LeaseStore, LockScript};
use crate::error::{LockError, Result};

#[derive(Debug)]
enum Entry {
    Value {
        token: String,
        expires_at: Instant,
    },
    Hash {
        fields: HashMap<String, String>,
        expires_at: Instant,
    },
}

impl Entry {
    fn expires_at(&self) -> Instant {
        match self {
            Entry::Value { expires_at, .. } | Entry::Hash { expires_at, .. } => *expires_at,
        }
    }
}

/// In-process lease store.
///
/// One mutex over the whole keyspace makes every call atomic. Expired entries
/// are dropped lazily on access.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a store error until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.expires_at() > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(LockError::store("lease store unavailable"));
        }
        Ok(())
    }
}

fn purge(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) {
    if entries.get(key).is_some_and(|e| e.expires_at() <= now) {
        entries.remove(key);
    }
}

fn hash_allows(entries: &HashMap<String, Entry>, condition: &HashCondition) -> Result<bool> {
    match condition {
        HashCondition::EmptyOrOnly { key, field } => match entries.get(key) {
            None => Ok(true),
            Some(Entry::Hash { fields, .. }) => Ok(fields.keys().all(|f| f == field)),
            Some(Entry::Value { .. }) => Err(LockError::store(format!("key '{key}' holds a value, expected a hash"))),
        },
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn set_nx(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        purge(&mut entries, key, now);

        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry::Value {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        purge(&mut entries, key, now);

        match entries.get_mut(key) {
            Some(Entry::Value { token: held, expires_at }) if held == token => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if(&self, key: &str, token: &str) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        purge(&mut entries, key, now);

        match entries.get(key) {
            Some(Entry::Value { token: held, .. }) if held == token => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn run_script(&self, script: &LockScript) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        for key in script.conditions.iter().map(HashCondition::key).chain(script.inserts.iter().map(String::as_str)) {
            purge(&mut entries, key, now);
        }

        for condition in &script.conditions {
            if !hash_allows(&entries, condition)? {
                return Ok(false);
            }
        }
        if let Some(key) = script.inserts.iter().find(|k| matches!(entries.get(k.as_str()), Some(Entry::Value { .. }))) {
            return Err(LockError::store(format!("key '{key}' holds a value, expected a hash")));
        }

        let expires_at = now + script.ttl;
        for key in &script.inserts {
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry::Hash {
                fields: HashMap::new(),
                expires_at,
            });
            if let Entry::Hash { fields, expires_at: at } = entry {
                fields.insert(script.field.clone(), script.marker.clone());
                *at = expires_at;
            }
        }
        Ok(true)
    }

    async fn hash_extend(&self, key: &str, field: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        purge(&mut entries, key, now);

        match entries.get_mut(key) {
            Some(Entry::Hash { fields, expires_at }) if fields.contains_key(field) => {
                *expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        purge(&mut entries, key, now);

        let (removed, emptied) = match entries.get_mut(key) {
            Some(Entry::Hash { fields, .. }) => {
                let removed = fields.remove(field).is_some();
                (removed, fields.is_empty())
            }
            _ => (false, false),
        };
        if emptied {
            entries.remove(key);
        }
        Ok(removed)
    }

    async fn hash_fields(&self, key: &str) -> Result<Vec<String>> {
        self.check()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        purge(&mut entries, key, now);

        let mut fields: Vec<String> = match entries.get(key) {
            Some(Entry::Hash { fields, .. }) => fields.keys().cloned().collect(),
            _ => Vec::new(),
        };
        fields.sort();
        Ok(fields)
    }

    async fn is_online(&self) -> bool {
        !self.unavailable.load(Ordering::Acquire)
    }
}
