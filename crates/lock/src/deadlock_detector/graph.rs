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

//! Timestamped identity x resource matrix.
//!
//! Cell `(i, r)` holds the tick at which identity `i` first touched resource
//! `r` (0 = no relation). On every column the smallest tick is the rightful
//! holder and larger ticks queue behind it, so `X` waits for `Y` on column
//! `c` exactly when `0 < m[Y][c] < m[X][c]`.

use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info};

use super::slots::SlotIndex;
use crate::error::{LockError, Result};
use crate::types::{ApplyRequest, Identity, VictimNotice, Weight};

/// Dense tick matrix, row-major, grown by copying into a larger buffer
#[derive(Debug)]
struct TickMatrix {
    rows: usize,
    cols: usize,
    cells: Vec<u64>,
}

impl TickMatrix {
    fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            cells: vec![0; rows * cols],
        }
    }

    #[inline]
    fn get(&self, row: usize, col: usize) -> u64 {
        self.cells[row * self.cols + col]
    }

    #[inline]
    fn set(&mut self, row: usize, col: usize, tick: u64) {
        self.cells[row * self.cols + col] = tick;
    }

    fn resize(&mut self, rows: usize, cols: usize) {
        if rows == self.rows && cols == self.cols {
            return;
        }
        let mut cells = vec![0; rows * cols];
        for row in 0..self.rows.min(rows) {
            let keep = self.cols.min(cols);
            let src = &self.cells[row * self.cols..row * self.cols + keep];
            cells[row * cols..row * cols + keep].copy_from_slice(src);
        }
        self.rows = rows;
        self.cols = cols;
        self.cells = cells;
    }

    /// Clear a row, returning the columns that were set
    fn clear_row(&mut self, row: usize) -> Vec<usize> {
        let start = row * self.cols;
        let mut touched = Vec::new();
        for (col, cell) in self.cells[start..start + self.cols].iter_mut().enumerate() {
            if *cell != 0 {
                touched.push(col);
                *cell = 0;
            }
        }
        touched
    }

    fn column_is_empty(&self, col: usize) -> bool {
        (0..self.rows).all(|row| self.get(row, col) == 0)
    }
}

/// Decision for one evaluated request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Granted,
    Wait,
    TimedOut,
    Victimized,
}

/// Outcome of [`WaitForGraph::evaluate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub verdict: Verdict,
    /// Set when a cycle was broken while evaluating the request
    pub victim: Option<VictimNotice>,
}

/// One edge of a wait-for cycle: `from` waits on `col` since `tick`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WaitEdge {
    from: usize,
    col: usize,
    tick: u64,
}

/// Wait-for graph over dense identity and resource slots
#[derive(Debug)]
pub struct WaitForGraph {
    identities: SlotIndex<Identity>,
    resources: SlotIndex<String>,
    matrix: TickMatrix,
    weights: Vec<Weight>,
    tick: u64,
    destroyed: HashSet<Identity>,
}

impl WaitForGraph {
    pub fn new(identity_capacity: usize, resource_capacity: usize) -> Self {
        let identities = SlotIndex::with_capacity(identity_capacity);
        let resources = SlotIndex::with_capacity(resource_capacity);
        let matrix = TickMatrix::new(identities.capacity(), resources.capacity());
        Self {
            weights: vec![0; identities.capacity()],
            identities,
            resources,
            matrix,
            tick: 0,
            destroyed: HashSet::new(),
        }
    }

    /// Evaluate one apply request against the graph.
    ///
    /// Stamps the request, breaks any wait-for cycle running through the
    /// requester, then decides between grant, wait and timeout.
    pub fn evaluate(&mut self, request: &ApplyRequest, now: Instant) -> Result<Evaluation> {
        if self.destroyed.contains(&request.identity) {
            return Ok(Evaluation {
                verdict: Verdict::Victimized,
                victim: None,
            });
        }

        let row = self.identities.insert(request.identity)?;
        let col = self.resources.insert(request.resource.clone())?;
        if row.grew_from.is_some() || col.grew_from.is_some() {
            self.matrix.resize(self.identities.capacity(), self.resources.capacity());
            self.weights.resize(self.identities.capacity(), 0);
            debug!(
                "Wait-for matrix grown to {}x{}",
                self.identities.capacity(),
                self.resources.capacity()
            );
        }
        let (row, col) = (row.index, col.index);

        self.weights[row] = request.weight;
        if self.matrix.get(row, col) == 0 {
            self.tick += 1;
            self.matrix.set(row, col, self.tick);
        }

        let mut victim = None;
        if let Some(cycle) = self.find_cycle(row, col) {
            let notice = self.break_cycle(&cycle)?;
            let requester_lost = notice.identity == request.identity;
            victim = Some(notice);
            if requester_lost {
                return Ok(Evaluation {
                    verdict: Verdict::Victimized,
                    victim,
                });
            }
        }

        let verdict = if self.holder_of(col) == Some(row) {
            Verdict::Granted
        } else if request.has_expired(now) {
            Verdict::TimedOut
        } else {
            Verdict::Wait
        };

        Ok(Evaluation { verdict, victim })
    }

    /// Clear every relation of `identity` and free its slot.
    ///
    /// Returns false if the identity had no relation.
    pub fn remove_identity(&mut self, identity: Identity) -> bool {
        let Some(row) = self.identities.remove(&identity) else {
            return false;
        };
        self.weights[row] = 0;
        for col in self.matrix.clear_row(row) {
            if self.matrix.column_is_empty(col) {
                self.resources.remove_index(col);
            }
        }
        true
    }

    pub fn is_destroyed(&self, identity: &Identity) -> bool {
        self.destroyed.contains(identity)
    }

    /// Forget the identities destroyed during the last sweep
    pub fn clear_destroyed(&mut self) {
        self.destroyed.clear();
    }

    /// Tick of `identity` on `resource`, 0 when unrelated
    pub fn stamp(&self, identity: Identity, resource: &str) -> u64 {
        match (self.identities.get(&identity), self.resources.get(&resource.to_string())) {
            (Some(row), Some(col)) => self.matrix.get(row, col),
            _ => 0,
        }
    }

    /// Current rightful holder of `resource`
    pub fn holder(&self, resource: &str) -> Option<Identity> {
        let col = self.resources.get(&resource.to_string())?;
        let row = self.holder_of(col)?;
        self.identities.key(row).copied()
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn capacity(&self) -> (usize, usize) {
        (self.identities.capacity(), self.resources.capacity())
    }

    fn holder_of(&self, col: usize) -> Option<usize> {
        self.identities
            .occupied()
            .filter(|(_, identity)| !self.destroyed.contains(identity))
            .map(|(row, _)| (row, self.matrix.get(row, col)))
            .filter(|(_, tick)| *tick > 0)
            .min_by_key(|(_, tick)| *tick)
            .map(|(row, _)| row)
    }

    /// Search for a wait-for cycle through `row`, which just touched `col`.
    ///
    /// First the pairwise scan: another resource `R` (ascending) held ahead
    /// of some identity `I` (ascending) that is itself ahead of `row` on
    /// `col`. Longer cycles fall back to a depth-first search over the same
    /// edges in the same order.
    fn find_cycle(&self, row: usize, col: usize) -> Option<Vec<WaitEdge>> {
        let own = self.matrix.get(row, col);
        for other_col in 0..self.matrix.cols {
            let held = self.matrix.get(row, other_col);
            if other_col == col || held == 0 {
                continue;
            }
            for (other, _) in self.identities.occupied() {
                if other == row {
                    continue;
                }
                let waits = self.matrix.get(other, other_col);
                let ahead = self.matrix.get(other, col);
                if waits > held && ahead > 0 && ahead < own {
                    return Some(vec![
                        WaitEdge { from: row, col, tick: own },
                        WaitEdge {
                            from: other,
                            col: other_col,
                            tick: waits,
                        },
                    ]);
                }
            }
        }

        let mut visited = vec![false; self.matrix.rows];
        visited[row] = true;
        let mut path = Vec::new();
        if self.search(row, row, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn search(&self, node: usize, target: usize, visited: &mut [bool], path: &mut Vec<WaitEdge>) -> bool {
        for col in 0..self.matrix.cols {
            let tick = self.matrix.get(node, col);
            if tick == 0 {
                continue;
            }
            for (next, _) in self.identities.occupied() {
                let ahead = self.matrix.get(next, col);
                if ahead == 0 || ahead >= tick {
                    continue;
                }
                path.push(WaitEdge { from: node, col, tick });
                if next == target {
                    return true;
                }
                if !visited[next] {
                    visited[next] = true;
                    if self.search(next, target, visited, path) {
                        return true;
                    }
                }
                path.pop();
            }
        }
        false
    }

    /// Pick and destroy the victim of a cycle.
    ///
    /// Lowest weight loses; on equal weight the later arrival (largest
    /// waiting tick) loses, so the pre-existing holder is kept.
    fn break_cycle(&mut self, cycle: &[WaitEdge]) -> Result<VictimNotice> {
        let (position, edge) = cycle
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                self.weights[a.from]
                    .cmp(&self.weights[b.from])
                    .then_with(|| b.tick.cmp(&a.tick))
            })
            .map(|(i, e)| (i, *e))
            .ok_or_else(|| LockError::internal("empty wait-for cycle"))?;
        let survivor_row = cycle[(position + 1) % cycle.len()].from;

        let identity = self.identity_at(edge.from)?;
        let survivor = self.identity_at(survivor_row)?;
        let resource = self
            .resources
            .key(edge.col)
            .cloned()
            .ok_or_else(|| LockError::internal(format!("cycle runs through free resource slot {}", edge.col)))?;

        info!(
            "Deadlock between {} identities: rejecting {} (weight {}) on '{}' in favour of {} (weight {})",
            cycle.len(),
            identity,
            self.weights[edge.from],
            resource,
            survivor,
            self.weights[survivor_row]
        );

        self.destroyed.insert(identity);
        self.remove_identity(identity);

        Ok(VictimNotice {
            identity,
            resource,
            survivor,
        })
    }

    fn identity_at(&self, row: usize) -> Result<Identity> {
        self.identities
            .key(row)
            .copied()
            .ok_or_else(|| LockError::internal(format!("cycle runs through free identity slot {row}")))
    }
}
