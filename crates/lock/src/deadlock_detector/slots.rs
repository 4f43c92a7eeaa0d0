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

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

use crate::error::{LockError, Result};

/// Bidirectional key <-> dense slot index map with a free list.
///
/// Freed slots are reused lowest-first. When no slot is free the capacity
/// doubles.
#[derive(Debug)]
pub struct SlotIndex<K> {
    by_key: HashMap<K, usize>,
    slots: Vec<Option<K>>,
    free: BTreeSet<usize>,
}

/// Result of [`SlotIndex::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub index: usize,
    /// Capacity before the insert, when the insert had to grow the table
    pub grew_from: Option<usize>,
}

impl<K: Hash + Eq + Clone> SlotIndex<K> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            by_key: HashMap::with_capacity(capacity),
            slots: vec![None; capacity],
            free: (0..capacity).collect(),
        }
    }

    pub fn get(&self, key: &K) -> Option<usize> {
        self.by_key.get(key).copied()
    }

    pub fn key(&self, index: usize) -> Option<&K> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// Resolve `key` to its slot, allocating one when absent
    pub fn insert(&mut self, key: K) -> Result<Slot> {
        if let Some(index) = self.by_key.get(&key) {
            return Ok(Slot {
                index: *index,
                grew_from: None,
            });
        }

        let mut grew_from = None;
        if self.free.is_empty() {
            let old = self.slots.len();
            let new = old.checked_mul(2).ok_or_else(|| LockError::internal("slot index capacity overflow"))?;
            self.slots.resize(new, None);
            self.free.extend(old..new);
            grew_from = Some(old);
        }

        let index = self
            .free
            .pop_first()
            .ok_or_else(|| LockError::internal("no free slot after growing the index table"))?;
        self.slots[index] = Some(key.clone());
        self.by_key.insert(key, index);

        Ok(Slot { index, grew_from })
    }

    pub fn remove(&mut self, key: &K) -> Option<usize> {
        let index = self.by_key.remove(key)?;
        self.slots[index] = None;
        self.free.insert(index);
        Some(index)
    }

    pub fn remove_index(&mut self, index: usize) -> Option<K> {
        let key = self.slots.get_mut(index)?.take()?;
        self.by_key.remove(&key);
        self.free.insert(index);
        Some(key)
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Occupied slots in ascending index order
    pub fn occupied(&self) -> impl Iterator<Item = (usize, &K)> {
        self.slots.iter().enumerate().filter_map(|(i, k)| k.as_ref().map(|k| (i, k)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_is_idempotent() {
        let mut slots = SlotIndex::with_capacity(4);
        let a = slots.insert("orders".to_string()).unwrap();
        let b = slots.insert("orders".to_string()).unwrap();
        assert_eq!(a.index, b.index);
        assert_eq!(slots.len(), 1);
    }

    #[test]
    fn test_growth_doubles() {
        let mut slots = SlotIndex::with_capacity(2);
        slots.insert(1u64).unwrap();
        slots.insert(2u64).unwrap();
        let third = slots.insert(3u64).unwrap();
        assert_eq!(third.grew_from, Some(2));
        assert_eq!(slots.capacity(), 4);
        assert_eq!(third.index, 2);
    }

    #[test]
    fn test_freed_slot_is_reused_lowest_first() {
        let mut slots = SlotIndex::with_capacity(4);
        for k in 0..4u64 {
            slots.insert(k).unwrap();
        }
        assert_eq!(slots.remove(&2), Some(2));
        assert_eq!(slots.remove(&1), Some(1));
        assert_eq!(slots.insert(10).unwrap().index, 1);
        assert_eq!(slots.insert(11).unwrap().index, 2);
        assert_eq!(slots.capacity(), 4);
    }

    #[test]
    fn test_remove_index() {
        let mut slots = SlotIndex::with_capacity(2);
        let slot = slots.insert("a").unwrap();
        assert_eq!(slots.remove_index(slot.index), Some("a"));
        assert!(slots.get(&"a").is_none());
        assert!(slots.remove_index(slot.index).is_none());
        assert!(slots.is_empty());
    }

    #[test]
    fn test_occupied_is_ordered() {
        let mut slots = SlotIndex::with_capacity(4);
        slots.insert('c').unwrap();
        slots.insert('a').unwrap();
        slots.insert('b').unwrap();
        slots.remove(&'a');
        let keys: Vec<_> = slots.occupied().map(|(i, k)| (i, *k)).collect();
        assert_eq!(keys, vec![(0, 'c'), (2, 'b')]);
    }
}
