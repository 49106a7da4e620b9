//! Cache Store
//!
//! Owns the cache entries and the spatial index over them. All methods are
//! synchronous and expect the caller to hold the store lock; the hotness
//! tracker is passed in wherever eviction needs effective timestamps.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::entry::CacheEntry;
use super::hotness::HotnessTracker;
use super::index::{EntryId, SpatialIndex};
use super::language::LanguageTag;
use super::quantize::{haversine_m, validate, within_box, GridCell};
use super::{cutoff, DirtyState};
use crate::config::CacheConfig;

/// Language constraint of a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageFilter<'a> {
    /// Lowercase first token must match (`pt-br`)
    Simple(&'a str),
    /// Primary subtag must match (`pt`)
    Primary(&'a str),
    /// Any language
    Any,
}

/// How a hit matched the requested language
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Fallback,
}

/// A confirmed cache hit
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub distance_m: f64,
    pub kind: MatchKind,
}

/// Outcome of loading a persisted cache document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: usize,
    pub migrated: usize,
    pub trimmed: usize,
}

/// Cache entries plus their spatial index
#[derive(Debug)]
pub struct CacheStore {
    entries: BTreeMap<EntryId, CacheEntry>,
    index: SpatialIndex,
    next_id: EntryId,
    config: CacheConfig,
    dirty: DirtyState,
}

impl CacheStore {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: BTreeMap::new(),
            index: SpatialIndex::new(),
            next_id: 0,
            config,
            dirty: DirtyState::default(),
        }
    }

    /// Restore from a persisted document.
    ///
    /// Malformed entries are skipped, legacy entries get their derived
    /// language fields, and the per-cell cap is applied. The store is
    /// marked dirty when anything had to change.
    pub fn load(
        config: CacheConfig,
        doc: &serde_json::Value,
        hotness: &HotnessTracker,
    ) -> (Self, LoadReport) {
        let mut store = Self::new(config);
        let mut report = LoadReport::default();

        let items = doc.as_array().map(Vec::as_slice).unwrap_or_default();
        for item in items {
            let mut entry: CacheEntry = match serde_json::from_value(item.clone()) {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping malformed cache entry: {}", e);
                    report.skipped += 1;
                    continue;
                }
            };
            if validate(entry.lat, entry.lon).is_err() {
                report.skipped += 1;
                continue;
            }
            if entry.migrate() {
                report.migrated += 1;
            }
            store.push(entry);
            report.loaded += 1;
        }

        report.trimmed = store.enforce_per_cell_cap(hotness);
        if report.migrated > 0 || report.skipped > 0 || report.trimmed > 0 {
            store.dirty.mark();
        }
        if report.skipped > 0 {
            warn!("Skipped {} unreadable cache entries", report.skipped);
        }
        (store, report)
    }

    /// Persistable form (array of entries, oldest first)
    pub fn to_document(&self) -> serde_json::Value {
        serde_json::Value::Array(
            self.entries
                .values()
                .filter_map(|e| serde_json::to_value(e).ok())
                .collect(),
        )
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Closest entry within the cache radius that passes `filter`.
    pub fn find(&self, lat: f64, lon: f64, filter: LanguageFilter<'_>) -> Option<CacheHit> {
        let radius = self.config.radius_m;
        let mut best: Option<(&CacheEntry, f64)> = None;

        for id in self.index.candidates(GridCell::of(lat, lon)) {
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            let matches = match filter {
                LanguageFilter::Simple(simple) => entry.simple() == simple,
                LanguageFilter::Primary(primary) => entry.primary() == Some(primary),
                LanguageFilter::Any => true,
            };
            if !matches || !within_box(lat, lon, entry.lat, entry.lon, radius) {
                continue;
            }

            let d = haversine_m(lat, lon, entry.lat, entry.lon);
            if d == 0.0 {
                best = Some((entry, d));
                break;
            }
            if d < radius && best.map_or(true, |(_, bd)| d < bd) {
                best = Some((entry, d));
            }
        }

        best.map(|(entry, distance_m)| CacheHit {
            entry: entry.clone(),
            distance_m,
            kind: MatchKind::Exact,
        })
    }

    /// Language-aware lookup: exact language, then (unless `strict`)
    /// primary subtag, then any language.
    pub fn lookup(&self, lat: f64, lon: f64, language: &LanguageTag, strict: bool) -> Option<CacheHit> {
        if let Some(hit) = self.find(lat, lon, LanguageFilter::Simple(language.simple())) {
            return Some(hit);
        }
        if strict {
            return None;
        }
        self.find(lat, lon, LanguageFilter::Primary(language.primary()))
            .or_else(|| self.find(lat, lon, LanguageFilter::Any))
            .map(|hit| CacheHit {
                kind: MatchKind::Fallback,
                ..hit
            })
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    fn push(&mut self, entry: CacheEntry) -> EntryId {
        let id = self.next_id;
        self.next_id += 1;
        self.index.insert(entry.cell(), id);
        self.entries.insert(id, entry);
        id
    }

    fn remove(&mut self, id: EntryId) -> Option<CacheEntry> {
        let entry = self.entries.remove(&id)?;
        self.index.remove(entry.cell(), id);
        Some(entry)
    }

    /// Insert a freshly fetched entry, then enforce the per-cell cap of its
    /// cell and the global capacity. Returns the number of evicted entries.
    pub fn insert(&mut self, entry: CacheEntry, hotness: &HotnessTracker) -> usize {
        let cell = entry.cell();
        self.push(entry);
        let mut evicted = self.trim_cell(cell, hotness);
        evicted += self.enforce_cap(hotness);
        self.dirty.mark();
        evicted
    }

    /// Ids of a set ordered oldest first by effective timestamp, ties by
    /// insertion order.
    fn oldest_first(&self, ids: &[EntryId], hotness: &HotnessTracker) -> Vec<EntryId> {
        let mut keyed: Vec<(DateTime<Utc>, EntryId)> = ids
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| (hotness.effective_ts(e), *id)))
            .collect();
        keyed.sort();
        keyed.into_iter().map(|(_, id)| id).collect()
    }

    fn trim_cell(&mut self, cell: GridCell, hotness: &HotnessTracker) -> usize {
        let max = self.config.per_cell_max;
        let ids = self.index.cell(&cell);
        if ids.len() <= max {
            return 0;
        }
        let ordered = self.oldest_first(&ids.to_vec(), hotness);
        let excess = ordered.len().saturating_sub(max);
        for id in &ordered[..excess] {
            self.remove(*id);
        }
        debug!("Cell {} over cap, evicted {}", cell, excess);
        excess
    }

    /// Apply the per-cell cap to every cell
    pub fn enforce_per_cell_cap(&mut self, hotness: &HotnessTracker) -> usize {
        let cells = self.index.overfull(self.config.per_cell_max);
        let evicted: usize = cells.into_iter().map(|c| self.trim_cell(c, hotness)).sum();
        if evicted > 0 {
            self.dirty.mark();
        }
        evicted
    }

    /// Remove entries whose effective timestamp is older than the TTL
    pub fn prune_expired(&mut self, hotness: &HotnessTracker, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = cutoff(now, self.config.ttl) else {
            return 0;
        };
        let expired: Vec<EntryId> = self
            .entries
            .iter()
            .filter(|(_, e)| hotness.effective_ts(e) < cutoff)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.remove(*id);
        }
        if !expired.is_empty() {
            self.dirty.mark();
        }
        expired.len()
    }

    /// Above `max_entries`, keep only the `low_watermark` most recently
    /// effective entries.
    pub fn enforce_cap(&mut self, hotness: &HotnessTracker) -> usize {
        if self.entries.len() <= self.config.max_entries {
            return 0;
        }
        let ids: Vec<EntryId> = self.entries.keys().copied().collect();
        let ordered = self.oldest_first(&ids, hotness);
        let excess = ordered.len().saturating_sub(self.config.low_watermark);
        for id in &ordered[..excess] {
            self.remove(*id);
        }
        self.dirty.mark();
        debug!(
            "Capacity eviction removed {} entries, {} left",
            excess,
            self.entries.len()
        );
        excess
    }

    /// Full eviction pass: TTL, then capacity, then per-cell cap
    pub fn maintain(&mut self, hotness: &HotnessTracker, now: DateTime<Utc>) -> usize {
        self.prune_expired(hotness, now)
            + self.enforce_cap(hotness)
            + self.enforce_per_cell_cap(hotness)
    }

    /// Remove every entry; returns the previous size
    pub fn clear(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.clear();
        self.index.clear();
        self.dirty.mark();
        before
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of non-empty grid cells
    pub fn index_cells(&self) -> usize {
        self.index.cell_count()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn dirty(&self) -> &DirtyState {
        &self.dirty
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.is_dirty()
    }

    /// Record a successful save of the state at `revision`
    pub fn mark_saved(&mut self, revision: u64) {
        self.dirty.saved(revision);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::quantize::M_PER_DEG_LAT;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    const MADRID: (f64, f64) = (40.4168, -3.7038);

    fn lang(tag: &str) -> LanguageTag {
        LanguageTag::parse(Some(tag), "en").unwrap()
    }

    fn entry(lat: f64, lon: f64, tag: &str, created_at: DateTime<Utc>) -> CacheEntry {
        CacheEntry::new(lat, lon, json!({"address": {"city": "X"}}), &lang(tag), created_at)
    }

    fn small_config() -> CacheConfig {
        CacheConfig {
            max_entries: 10,
            low_watermark: 8,
            per_cell_max: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_find_exact_and_nearby() {
        let hot = HotnessTracker::new();
        let mut store = CacheStore::new(CacheConfig::default());
        store.insert(entry(MADRID.0, MADRID.1, "es", Utc::now()), &hot);

        let hit = store.find(MADRID.0, MADRID.1, LanguageFilter::Simple("es")).unwrap();
        assert_eq!(hit.distance_m, 0.0);

        // ~15 m north, quantized
        let lat = crate::cache::quantize::quantize(MADRID.0 + 15.0 / M_PER_DEG_LAT);
        let hit = store.find(lat, MADRID.1, LanguageFilter::Simple("es")).unwrap();
        assert!(hit.distance_m > 10.0 && hit.distance_m < 20.0);

        // ~50 m north is out of radius
        let lat = crate::cache::quantize::quantize(MADRID.0 + 50.0 / M_PER_DEG_LAT);
        assert!(store.find(lat, MADRID.1, LanguageFilter::Any).is_none());
    }

    #[test]
    fn test_closest_entry_wins() {
        let hot = HotnessTracker::new();
        let mut store = CacheStore::new(CacheConfig::default());
        store.insert(entry(10.0002, 20.0, "en", Utc::now()), &hot);
        store.insert(entry(10.0001, 20.0, "en", Utc::now()), &hot);

        let hit = store.find(10.0, 20.0, LanguageFilter::Any).unwrap();
        assert_eq!(hit.entry.lat, 10.0001);
    }

    #[test]
    fn test_language_fallback_order() {
        let hot = HotnessTracker::new();
        let mut store = CacheStore::new(CacheConfig::default());
        store.insert(entry(10.0, 20.0, "pt-PT", Utc::now()), &hot);

        let exact = store.lookup(10.0, 20.0, &lang("pt-PT"), false).unwrap();
        assert_eq!(exact.kind, MatchKind::Exact);

        let primary = store.lookup(10.0, 20.0, &lang("pt-BR"), false).unwrap();
        assert_eq!(primary.kind, MatchKind::Fallback);
        assert_eq!(primary.entry.lang, "pt-PT,pt,en");

        let any = store.lookup(10.0, 20.0, &lang("de"), false).unwrap();
        assert_eq!(any.kind, MatchKind::Fallback);

        assert!(store.lookup(10.0, 20.0, &lang("de"), true).is_none());
    }

    #[test]
    fn test_boundary_entry_found_from_neighbor_cell() {
        let hot = HotnessTracker::new();
        let mut store = CacheStore::new(CacheConfig::default());
        store.insert(entry(10.0001, 20.0001, "en", Utc::now()), &hot);

        let hit = store.find(10.0, 20.0, LanguageFilter::Simple("en")).unwrap();
        assert!(hit.distance_m < 20.0);
        assert_ne!(GridCell::of(10.0, 20.0), hit.entry.cell());
    }

    #[test]
    fn test_per_cell_cap_removes_oldest_from_store() {
        let hot = HotnessTracker::new();
        let mut store = CacheStore::new(small_config());
        let now = Utc::now();
        for (i, tag) in ["en", "es", "fr", "de"].iter().enumerate() {
            let created = now - ChronoDuration::minutes(10 - i as i64);
            store.insert(entry(10.0, 20.0, tag, created), &hot);
        }

        assert_eq!(store.len(), 3);
        assert!(store.find(10.0, 20.0, LanguageFilter::Simple("en")).is_none());
        assert!(store.find(10.0, 20.0, LanguageFilter::Simple("de")).is_some());
    }

    #[test]
    fn test_capacity_eviction_keeps_newest() {
        let hot = HotnessTracker::new();
        let mut store = CacheStore::new(small_config());
        let now = Utc::now();
        for i in 0..11 {
            let created = now - ChronoDuration::minutes(100 - i);
            store.insert(entry(10.0 + i as f64 * 0.01, 20.0, "en", created), &hot);
        }

        assert_eq!(store.len(), 8);
        let oldest_kept = store.entries().map(|e| e.created_at).min().unwrap();
        assert_eq!(oldest_kept, now - ChronoDuration::minutes(97));
    }

    #[test]
    fn test_hotness_protects_from_capacity_eviction() {
        let mut hot = HotnessTracker::new();
        let mut store = CacheStore::new(small_config());
        let now = Utc::now();
        let oldest = entry(50.0, 20.0, "en", now - ChronoDuration::days(1));
        hot.touch(oldest.hot_key(), now);
        store.insert(oldest, &hot);
        for i in 0..10 {
            store.insert(entry(10.0 + i as f64 * 0.01, 20.0, "en", now - ChronoDuration::hours(1)), &hot);
        }

        assert_eq!(store.len(), 8);
        assert!(store.find(50.0, 20.0, LanguageFilter::Any).is_some());
    }

    #[test]
    fn test_ttl_prune_respects_hotness() {
        let mut hot = HotnessTracker::new();
        let mut store = CacheStore::new(CacheConfig::default());
        let now = Utc::now();
        let stale = now - ChronoDuration::days(7);

        let kept = entry(10.0, 20.0, "en", stale);
        hot.touch(kept.hot_key(), now - ChronoDuration::days(1));
        store.insert(kept, &hot);
        store.insert(entry(30.0, 20.0, "en", stale), &hot);
        store.insert(entry(40.0, 20.0, "en", now), &hot);

        assert_eq!(store.prune_expired(&hot, now), 1);
        assert_eq!(store.len(), 2);
        assert!(store.find(30.0, 20.0, LanguageFilter::Any).is_none());
        assert_eq!(store.index_cells(), 2);
    }

    #[test]
    fn test_load_migrates_and_skips() {
        let doc = json!([
            {"lat": 1.0, "lon": 2.0, "address": {}, "ts": "2024-05-01T10:00:00+00:00", "lang": "es,en"},
            {"lat": "north", "lon": 2.0},
            {"lat": 91.0, "lon": 2.0, "address": {}, "ts": "2024-05-01T10:00:00+00:00"},
            {"lat": 3.0, "lon": 4.0, "address": {}, "ts": "2024-05-01T10:00:00+00:00",
             "lang": "en", "lang_primary": "en", "lang_simple": "en"}
        ]);
        let hot = HotnessTracker::new();
        let (store, report) = CacheStore::load(CacheConfig::default(), &doc, &hot);

        assert_eq!(
            report,
            LoadReport {
                loaded: 2,
                skipped: 2,
                migrated: 1,
                trimmed: 0
            }
        );
        assert!(store.is_dirty());
        assert!(store.find(1.0, 2.0, LanguageFilter::Primary("es")).is_some());
    }

    #[test]
    fn test_clean_load_is_not_dirty() {
        let hot = HotnessTracker::new();
        let mut source = CacheStore::new(CacheConfig::default());
        source.insert(entry(1.0, 2.0, "en", Utc::now()), &hot);

        let (store, report) = CacheStore::load(CacheConfig::default(), &source.to_document(), &hot);
        assert_eq!(report.loaded, 1);
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_clear() {
        let hot = HotnessTracker::new();
        let mut store = CacheStore::new(CacheConfig::default());
        store.insert(entry(1.0, 2.0, "en", Utc::now()), &hot);
        assert_eq!(store.clear(), 1);
        assert!(store.is_empty());
        assert_eq!(store.index_cells(), 0);
        assert!(store.is_dirty());
    }
}
