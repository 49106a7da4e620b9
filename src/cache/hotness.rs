//! Hotness Tracker
//!
//! Last access time per quantized location. A hit refreshes the hotness of
//! the entry it served, which keeps popular entries alive past their TTL
//! without rewriting the entries themselves. Persisted as its own document.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::entry::CacheEntry;
use super::DirtyState;

/// Location key -> last access time
#[derive(Debug, Default)]
pub struct HotnessTracker {
    map: HashMap<String, DateTime<Utc>>,
    dirty: DirtyState,
}

impl HotnessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from a persisted document, skipping unparseable timestamps
    pub fn from_document(doc: &serde_json::Value) -> Self {
        let mut map = HashMap::new();
        if let Some(obj) = doc.as_object() {
            for (key, value) in obj {
                let parsed = value
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|ts| ts.with_timezone(&Utc));
                match parsed {
                    Some(ts) => {
                        map.insert(key.clone(), ts);
                    }
                    None => debug!("Dropping hotness entry {} with bad timestamp", key),
                }
            }
        }
        Self {
            map,
            dirty: DirtyState::default(),
        }
    }

    /// Persistable form (`{"lat,lon": "rfc3339"}`)
    pub fn to_document(&self) -> serde_json::Value {
        let sorted: BTreeMap<&String, String> = self
            .map
            .iter()
            .map(|(k, v)| (k, v.to_rfc3339()))
            .collect();
        serde_json::json!(sorted)
    }

    /// Record an access
    pub fn touch(&mut self, key: String, now: DateTime<Utc>) {
        self.map.insert(key, now);
        self.dirty.mark();
    }

    pub fn get(&self, key: &str) -> Option<DateTime<Utc>> {
        self.map.get(key).copied()
    }

    /// Later of the creation time and the last access of an entry
    pub fn effective_ts(&self, entry: &CacheEntry) -> DateTime<Utc> {
        match self.get(&entry.hot_key()) {
            Some(hot) if hot > entry.created_at => hot,
            _ => entry.created_at,
        }
    }

    /// Drop accesses older than `ttl`; returns how many were removed
    pub fn prune(&mut self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let Some(cutoff) = super::cutoff(now, ttl) else {
            return 0;
        };
        let before = self.map.len();
        self.map.retain(|_, ts| *ts >= cutoff);
        let removed = before - self.map.len();
        if removed > 0 {
            self.dirty.mark();
        }
        removed
    }

    /// Remove everything; returns the previous size
    pub fn clear(&mut self) -> usize {
        let before = self.map.len();
        self.map.clear();
        self.dirty.mark();
        before
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::language::LanguageTag;
    use serde_json::json;

    fn entry_at(created_at: DateTime<Utc>) -> CacheEntry {
        let lang = LanguageTag::parse(Some("en"), "en").unwrap();
        CacheEntry::new(10.0, 20.0, json!({}), &lang, created_at)
    }

    #[test]
    fn test_effective_ts_takes_later() {
        let now = Utc::now();
        let entry = entry_at(now - chrono::Duration::days(3));
        let mut hot = HotnessTracker::new();
        assert_eq!(hot.effective_ts(&entry), entry.created_at);

        hot.touch(entry.hot_key(), now);
        assert_eq!(hot.effective_ts(&entry), now);
        assert!(hot.is_dirty());

        // An access older than creation never moves the entry back
        hot.touch(entry.hot_key(), now - chrono::Duration::days(10));
        assert_eq!(hot.effective_ts(&entry), entry.created_at);
    }

    #[test]
    fn test_prune() {
        let now = Utc::now();
        let mut hot = HotnessTracker::new();
        hot.touch("a".into(), now - chrono::Duration::days(7));
        hot.touch("b".into(), now - chrono::Duration::days(1));
        let revision = hot.dirty().revision();
        hot.mark_saved(revision);
        assert!(!hot.is_dirty());

        assert_eq!(hot.prune(now, Duration::from_secs(6 * 86_400)), 1);
        assert!(hot.is_dirty());
        assert!(hot.get("a").is_none());
        assert!(hot.get("b").is_some());
    }

    #[test]
    fn test_document_roundtrip_skips_bad_values() {
        let doc = json!({
            "1.0000,2.0000": "2024-05-01T10:00:00+00:00",
            "3.0000,4.0000": "yesterday",
            "5.0000,6.0000": 17
        });
        let hot = HotnessTracker::from_document(&doc);
        assert_eq!(hot.len(), 1);
        assert!(!hot.is_dirty());

        let back = hot.to_document();
        assert!(back["1.0000,2.0000"].as_str().unwrap().starts_with("2024-05-01T10:00:00"));
    }
}
