//! Request and response types of the geocoding service

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use super::error::{whole_seconds, LookupError};

// =============================================================================
// Requests
// =============================================================================

/// A reverse lookup
#[derive(Debug, Clone, Default)]
pub struct LookupRequest {
    pub lat: f64,
    pub lon: f64,
    /// BCP-47 tag; the configured default when absent
    pub language: Option<String>,
    /// Upstream zoom, ignored outside 10..=18
    pub zoom: Option<u8>,
    /// Skip the cache lookup (privileged callers only)
    pub force_refresh: bool,
    /// Do not fall back to entries in another language
    pub strict_language: bool,
    /// Answer a miss as queued instead of waiting for the fetch
    pub non_blocking: bool,
    /// Caller identity handed to the authorizer
    pub principal: Option<String>,
}

impl LookupRequest {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            ..Default::default()
        }
    }

    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn zoom(mut self, zoom: u8) -> Self {
        self.zoom = Some(zoom);
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn strict_language(mut self) -> Self {
        self.strict_language = true;
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.non_blocking = true;
        self
    }

    pub fn principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }
}

/// Part of the state a reset clears
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    Cache,
    Hotness,
    Negative,
    Backoff,
    Metrics,
    All,
}

impl ResetScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetScope::Cache => "cache",
            ResetScope::Hotness => "hot",
            ResetScope::Negative => "neg",
            ResetScope::Backoff => "backoff",
            ResetScope::Metrics => "metrics",
            ResetScope::All => "all",
        }
    }

    /// Whether this scope clears `part`
    pub fn covers(&self, part: ResetScope) -> bool {
        *self == ResetScope::All || *self == part
    }
}

impl FromStr for ResetScope {
    type Err = LookupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cache" => Ok(ResetScope::Cache),
            "hot" | "hotness" => Ok(ResetScope::Hotness),
            "neg" | "negative" => Ok(ResetScope::Negative),
            "backoff" => Ok(ResetScope::Backoff),
            "metrics" => Ok(ResetScope::Metrics),
            "all" => Ok(ResetScope::All),
            _ => Err(LookupError::InvalidReset(s.to_string())),
        }
    }
}

impl fmt::Display for ResetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ResetScope {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Where an answer came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    /// Cached entry in the requested language
    Hit,
    /// Cached entry in another language
    HitFallback,
    /// Fresh upstream result
    Fetched,
}

impl Provenance {
    /// Value of the `X-Cache` header
    pub fn cache_status(&self) -> &'static str {
        match self {
            Provenance::Hit => "hit",
            Provenance::HitFallback => "hit-fallback",
            Provenance::Fetched => "miss",
        }
    }
}

/// A resolved address
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeocodeResponse {
    /// Quantized coordinates
    pub lat: f64,
    pub lon: f64,
    /// Coordinates as requested
    pub query_lat: f64,
    pub query_lon: f64,
    pub address: serde_json::Value,
    pub source: Provenance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<DateTime<Utc>>,
    pub lang: String,
    /// Language of the cached entry, set on fallback hits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang_cached: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_distance_m: Option<f64>,
    /// False when the upstream had no address for this location
    pub cacheable: bool,
}

impl GeocodeResponse {
    pub fn meta(&self) -> ResponseMeta {
        ResponseMeta {
            cache: self.source.cache_status(),
            language: self.lang.clone(),
            hit_distance_m: self.hit_distance_m,
            ..Default::default()
        }
    }
}

/// A miss answered before its fetch completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTicket {
    pub eta: Duration,
    pub pending: usize,
}

impl QueueTicket {
    /// Seconds until the answer is likely cached (at least 1)
    pub fn retry_after(&self) -> u64 {
        whole_seconds(self.eta)
    }
}

/// Result of a lookup that did not fail
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Ready(GeocodeResponse),
    Queued(QueueTicket),
}

impl LookupOutcome {
    pub fn meta(&self) -> ResponseMeta {
        match self {
            LookupOutcome::Ready(response) => response.meta(),
            LookupOutcome::Queued(ticket) => ResponseMeta {
                cache: "miss",
                retry_after: Some(ticket.retry_after()),
                queue_eta: Some(ticket.eta.as_secs()),
                pending: Some(ticket.pending),
                ..Default::default()
            },
        }
    }

    pub fn response(&self) -> Option<&GeocodeResponse> {
        match self {
            LookupOutcome::Ready(response) => Some(response),
            LookupOutcome::Queued(_) => None,
        }
    }
}

/// Transport metadata of an answer, rendered as HTTP headers by the server
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseMeta {
    /// `hit`, `hit-fallback` or `miss`
    pub cache: &'static str,
    pub language: String,
    pub hit_distance_m: Option<f64>,
    pub retry_after: Option<u64>,
    pub queue_eta: Option<u64>,
    pub pending: Option<usize>,
}

/// What a reset cleared
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResetReport {
    pub action: ResetScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_len_before: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hot_len_before: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neg_len_before: Option<usize>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub backoff_cleared: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub metrics_cleared: bool,
}

/// Operator view of the service state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub hits: u64,
    #[serde(rename = "miss")]
    pub misses: u64,
    pub hit_rate: f64,
    pub cache_len: usize,
    pub index_cells: usize,
    pub hot_len: usize,
    pub store_dirty: bool,
    pub hot_dirty: bool,
    pub neg_cells: usize,
    #[serde(rename = "pending_misses")]
    pub pending: usize,
    /// Seconds
    pub backlog_eta: u64,
    /// Seconds since the last rate limiter slot
    pub rl_age: Option<f64>,
    /// Seconds
    pub backoff_remaining: u64,
    pub avg_hit_distance_m: Option<f64>,
    pub avg_rate_limit_wait_s: Option<f64>,
    #[serde(rename = "bp_202")]
    pub queued: u64,
    #[serde(rename = "bp_429")]
    pub busy: u64,
    pub upstream_fetches: u64,
    pub upstream_failures: u64,
    pub cfg_rl_min_interval: f64,
    pub cfg_radius_m: f64,
    pub cfg_per_cell_max: usize,
    pub cfg_max_entries: usize,
    pub cfg_max_pending_misses: usize,
    pub cfg_nom_email: Option<String>,
    pub lang: String,
}

/// Round to `places` decimals
pub(crate) fn round_to(x: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (x * factor).round() / factor
}
