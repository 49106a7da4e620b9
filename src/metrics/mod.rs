//! Service Metrics
//!
//! In-process counters behind the diagnostics report, mirrored into the
//! default Prometheus registry for the `/metrics` endpoint.
//!
//! The in-process counters can be reset by an operator; the Prometheus
//! mirrors are monotonic and never reset.

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntCounterVec, IntGauge};
use tracing::warn;

// =============================================================================
// Prometheus mirrors
// =============================================================================

struct Exported {
    lookups: IntCounterVec,
    queued: IntCounter,
    busy: IntCounter,
    fetches: IntCounter,
    fetch_failures: IntCounterVec,
    cache_entries: IntGauge,
    hot_entries: IntGauge,
    negative_cells: IntGauge,
    pending_fetches: IntGauge,
}

impl Exported {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            lookups: prometheus::register_int_counter_vec!(
                "geocache_lookups_total",
                "Cache lookups by result",
                &["result"]
            )?,
            queued: prometheus::register_int_counter!(
                "geocache_queued_total",
                "Misses answered as queued"
            )?,
            busy: prometheus::register_int_counter!(
                "geocache_busy_total",
                "Misses rejected because the fetch backlog was full"
            )?,
            fetches: prometheus::register_int_counter!(
                "geocache_upstream_fetches_total",
                "Upstream fetches performed"
            )?,
            fetch_failures: prometheus::register_int_counter_vec!(
                "geocache_upstream_failures_total",
                "Failed upstream fetches by code",
                &["code"]
            )?,
            cache_entries: prometheus::register_int_gauge!(
                "geocache_cache_entries",
                "Entries in the spatial cache"
            )?,
            hot_entries: prometheus::register_int_gauge!(
                "geocache_hotness_entries",
                "Locations with a recorded last access"
            )?,
            negative_cells: prometheus::register_int_gauge!(
                "geocache_negative_cells",
                "Grid cells currently suppressed"
            )?,
            pending_fetches: prometheus::register_int_gauge!(
                "geocache_pending_fetches",
                "Upstream fetches in flight or queued"
            )?,
        })
    }
}

static EXPORTED: Lazy<Option<Exported>> = Lazy::new(|| match Exported::register() {
    Ok(exported) => Some(exported),
    Err(e) => {
        warn!("Prometheus metrics unavailable: {}", e);
        None
    }
});

fn exported() -> Option<&'static Exported> {
    EXPORTED.as_ref()
}

// =============================================================================
// In-process counters
// =============================================================================

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub queued: u64,
    pub busy: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
    /// Mean distance of cache hits in meters
    pub avg_hit_distance_m: Option<f64>,
}

impl MetricsSnapshot {
    /// hits / (hits + misses), 0 before the first lookup
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Lookup and fetch counters of one service
#[derive(Debug, Default)]
pub struct ServiceMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    // Hit distances in millimeters
    hit_distance_mm: AtomicU64,
    queued: AtomicU64,
    busy: AtomicU64,
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, distance_m: f64, fallback: bool) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        let mm = (distance_m.max(0.0) * 1_000.0).round() as u64;
        self.hit_distance_mm.fetch_add(mm, Ordering::Relaxed);
        if let Some(m) = exported() {
            let result = if fallback { "hit_fallback" } else { "hit" };
            m.lookups.with_label_values(&[result]).inc();
        }
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = exported() {
            m.lookups.with_label_values(&["miss"]).inc();
        }
    }

    pub fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = exported() {
            m.queued.inc();
        }
    }

    pub fn record_busy(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = exported() {
            m.busy.inc();
        }
    }

    pub fn record_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = exported() {
            m.fetches.inc();
        }
    }

    pub fn record_failure(&self, code: &str) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
        if let Some(m) = exported() {
            m.fetch_failures.with_label_values(&[code]).inc();
        }
    }

    /// Publish the current sizes to the Prometheus gauges
    pub fn set_sizes(&self, cache_len: usize, hot_len: usize, neg_cells: usize, pending: usize) {
        if let Some(m) = exported() {
            m.cache_entries.set(cache_len as i64);
            m.hot_entries.set(hot_len as i64);
            m.negative_cells.set(neg_cells as i64);
            m.pending_fetches.set(pending as i64);
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let hits = self.hits();
        let total_mm = self.hit_distance_mm.load(Ordering::Relaxed);
        MetricsSnapshot {
            hits,
            misses: self.misses(),
            queued: self.queued.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            avg_hit_distance_m: (hits > 0).then(|| total_mm as f64 / 1_000.0 / hits as f64),
        }
    }

    /// Zero every in-process counter
    pub fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.hit_distance_mm,
            &self.queued,
            &self.busy,
            &self.fetches,
            &self.fetch_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Render the default registry in the Prometheus text format
pub fn render() -> String {
    use prometheus::Encoder;

    // Touch the mirrors so they show up before the first lookup
    let _ = exported();
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
