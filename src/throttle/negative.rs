//! Negative Cache
//!
//! Per-cell suppression window after a failed or empty fetch. Entries expire
//! on their own; the maintenance task purges the dead ones.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::cache::GridCell;

/// Shortest window ever recorded
const MIN_WINDOW: Duration = Duration::from_secs(1);

/// Cell -> suppressed until
#[derive(Debug, Default)]
pub struct NegativeCache {
    cells: DashMap<GridCell, Instant>,
}

impl NegativeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress a cell for `ttl` (at least one second). An existing later
    /// expiry is kept.
    pub fn suppress(&self, cell: GridCell, ttl: Duration) -> Instant {
        let target = Instant::now() + ttl.max(MIN_WINDOW);
        let mut slot = self.cells.entry(cell).or_insert(target);
        if *slot < target {
            *slot = target;
        }
        *slot
    }

    /// Time left for a cell, `None` when it is not suppressed
    pub fn remaining(&self, cell: GridCell) -> Option<Duration> {
        let until = *self.cells.get(&cell)?;
        let left = until.saturating_duration_since(Instant::now());
        (!left.is_zero()).then_some(left)
    }

    /// Lift the suppression of a cell
    pub fn clear_cell(&self, cell: GridCell) {
        self.cells.remove(&cell);
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.cells.len();
        self.cells.retain(|_, until| *until > now);
        before - self.cells.len()
    }

    /// Remove everything; returns the previous size
    pub fn clear(&self) -> usize {
        let before = self.cells.len();
        self.cells.clear();
        before
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
