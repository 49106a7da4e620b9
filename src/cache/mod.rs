//! Spatial Cache
//!
//! Grid-indexed cache of reverse-geocoding results with TTL and capacity
//! eviction.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             CacheStore                                    │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  entries: BTreeMap<EntryId, CacheEntry>   (insertion order)               │
//! │  index:   SpatialIndex  GridCell -> [EntryId]  (≤ per_cell_max per cell)  │
//! │                                                                           │
//! │  find(lat, lon, filter):                                                  │
//! │     cell ──▶ 3x3 neighbors ──▶ box pre-filter ──▶ haversine < radius      │
//! └──────────────────────────────────────────────────────────────────────────┘
//!                 │ effective_ts = max(created_at, last access)
//!                 ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           HotnessTracker                                  │
//! │  "lat,lon" -> last access (persisted separately)                          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Eviction
//!
//! - TTL: entries whose effective timestamp is older than the TTL
//! - Capacity: above `max_entries`, one sort-and-trim down to `low_watermark`
//! - Per cell: above `per_cell_max`, the oldest entries of that cell

mod entry;
mod hotness;
mod index;
pub mod language;
#[cfg(test)]
mod proptest;
pub mod quantize;
mod store;

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

pub use entry::CacheEntry;
pub use hotness::HotnessTracker;
pub use index::{EntryId, SpatialIndex};
pub use language::{InvalidLanguage, LanguageTag};
pub use quantize::{CoordinateError, GridCell};
pub use store::{CacheHit, CacheStore, LanguageFilter, LoadReport, MatchKind};

/// Change tracking for a persisted document.
///
/// Every change bumps the revision. A save records the revision it
/// serialized; changes made while the save was in flight keep the state
/// dirty.
#[derive(Debug, Default, Clone)]
pub struct DirtyState {
    revision: u64,
    saved_revision: u64,
    last_change: Option<Instant>,
}

impl DirtyState {
    /// Record a change
    pub fn mark(&mut self) {
        self.revision += 1;
        self.last_change = Some(Instant::now());
    }

    pub fn is_dirty(&self) -> bool {
        self.revision != self.saved_revision
    }

    /// Current revision, to be passed to `saved` once persisted
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Time since the last unsaved change
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.last_change
            .filter(|_| self.is_dirty())
            .map(|at| now.saturating_duration_since(at))
    }

    /// Record a successful save of `revision`
    pub fn saved(&mut self, revision: u64) {
        if revision > self.saved_revision {
            self.saved_revision = revision;
        }
    }
}

/// Oldest timestamp still within `ttl` of `now`; `None` when nothing can
/// be that old.
pub(crate) fn cutoff(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_sub_signed(ttl))
}
