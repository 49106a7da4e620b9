//! Service Configuration
//!
//! Typed configuration for every tunable of the geocoding cache, resolved
//! once at startup. Each section has validated defaults; a YAML file can
//! override any subset of fields and the CLI can override the most commonly
//! tuned ones on top of that.
//!
//! Durations are written as human strings in YAML (`"6d"`, `"900s"`,
//! `"1500ms"`, `"1h30m"`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Defaults
// =============================================================================

/// Default upstream reverse geocoding endpoint
pub const DEFAULT_UPSTREAM_URL: &str = "https://nominatim.openstreetmap.org/reverse";

/// Minimum allowed spacing between upstream calls
pub const MIN_RATE_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Sections
// =============================================================================

/// Spatial cache sizing and retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries whose effective timestamp is older than this are evicted
    #[serde(with = "duration_str")]
    pub ttl: Duration,
    /// Maximum hit distance in meters
    pub radius_m: f64,
    /// Hard cap on stored entries (crossing it triggers eviction)
    pub max_entries: usize,
    /// Entry count eviction trims down to
    pub low_watermark: usize,
    /// Maximum entries per grid cell
    pub per_cell_max: usize,
    /// Hotness records older than this are dropped
    #[serde(with = "duration_str")]
    pub hotness_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(6 * 86_400),
            radius_m: 20.0,
            max_entries: 10_000,
            low_watermark: 8_000,
            per_cell_max: 64,
            hotness_ttl: Duration::from_secs(6 * 86_400),
        }
    }
}

/// Global outbound rate limit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Minimum spacing between upstream calls
    #[serde(with = "duration_str")]
    pub min_interval: Duration,
    /// Upper bound of the random delay added to a non-zero wait
    #[serde(with = "duration_str")]
    pub jitter_max: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            jitter_max: Duration::from_millis(300),
        }
    }
}

/// Negative caching and global backoff windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Per-cell suppression after a failed fetch (also the default backoff)
    #[serde(with = "duration_str")]
    pub negative_ttl: Duration,
    /// Per-cell suppression after a response without a usable address
    #[serde(with = "duration_str")]
    pub no_data_ttl: Duration,
    /// Ceiling for any global suspension
    #[serde(with = "duration_str")]
    pub max_backoff: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            negative_ttl: Duration::from_secs(120),
            no_data_ttl: Duration::from_secs(30),
            max_backoff: Duration::from_secs(900),
        }
    }
}

/// Queueing and load shedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Pending fetch count at which new misses are rejected as busy
    pub max_pending: usize,
    /// Queue ETA above which misses are answered as queued
    #[serde(with = "duration_str")]
    pub auto_queue_eta: Duration,
    /// Retry hint returned with busy rejections
    #[serde(with = "duration_str")]
    pub busy_retry_after: Duration,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_pending: 250,
            auto_queue_eta: Duration::from_secs(2),
            busy_retry_after: Duration::from_secs(1),
        }
    }
}

/// Upstream geocoder request shaping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Reverse geocoding endpoint
    pub url: String,
    /// Hard timeout per call
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    /// Maximum accepted response body
    pub max_body_bytes: usize,
    /// Contact address sent as `email` and in the User-Agent
    pub contact_email: Option<String>,
    /// User-Agent product token
    pub user_agent: String,
    /// Optional Referer header
    pub referer: Option<String>,
    /// Zoom used when the request does not carry one
    pub default_zoom: u8,
    /// Language used when the request does not carry one
    pub default_language: String,
    /// Keep only a fixed set of address keys from the upstream payload
    pub compact_address: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_UPSTREAM_URL.to_string(),
            timeout: Duration::from_secs(15),
            max_body_bytes: 2_000_000,
            contact_email: None,
            user_agent: "geocache/1.0".to_string(),
            referer: None,
            default_zoom: 18,
            default_language: "en".to_string(),
            compact_address: true,
        }
    }
}

impl UpstreamConfig {
    /// Contact email, dropped when it does not look like an address
    pub fn contact(&self) -> Option<&str> {
        self.contact_email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty() && e.contains('@'))
    }
}

/// Persistence and maintenance cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Period of the background maintenance task
    #[serde(with = "duration_str")]
    pub maintenance_interval: Duration,
    /// Minimum time between two physical writes of the cache document
    #[serde(with = "duration_str")]
    pub cache_flush_interval: Duration,
    /// Minimum time between two physical writes of the hotness document
    #[serde(with = "duration_str")]
    pub hotness_flush_interval: Duration,
    /// Quiet period after the last cache change before it is written
    #[serde(with = "duration_str")]
    pub cache_save_delay: Duration,
    /// Quiet period after the last hotness change before it is written
    #[serde(with = "duration_str")]
    pub hotness_save_delay: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            maintenance_interval: Duration::from_secs(60),
            cache_flush_interval: Duration::from_secs(6 * 3600),
            hotness_flush_interval: Duration::from_secs(3 * 3600),
            cache_save_delay: Duration::from_secs(15 * 60),
            hotness_save_delay: Duration::from_secs(2 * 3600),
        }
    }
}

/// Access control
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Reject every non-privileged caller
    pub privileged_only: bool,
}

// =============================================================================
// Root
// =============================================================================

/// Complete service configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodeConfig {
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub backoff: BackoffConfig,
    pub backpressure: BackpressureConfig,
    pub upstream: UpstreamConfig,
    pub persistence: PersistenceConfig,
    pub access: AccessConfig,
}

impl GeocodeConfig {
    /// Load a configuration from a YAML file, filling missing fields with defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&raw)
    }

    /// Parse a YAML document
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let cache = &self.cache;
        if cache.max_entries == 0 {
            return Err(Error::Config("cache.max_entries must be greater than 0".into()));
        }
        if cache.low_watermark == 0 || cache.low_watermark > cache.max_entries {
            return Err(Error::Config(format!(
                "cache.low_watermark must be in 1..={}",
                cache.max_entries
            )));
        }
        if cache.per_cell_max == 0 {
            return Err(Error::Config("cache.per_cell_max must be at least 1".into()));
        }
        if !(cache.radius_m.is_finite() && cache.radius_m > 0.0) {
            return Err(Error::Config("cache.radius_m must be a positive number".into()));
        }
        if self.rate_limit.min_interval < MIN_RATE_INTERVAL {
            return Err(Error::Config(format!(
                "rate_limit.min_interval must be at least {:?}",
                MIN_RATE_INTERVAL
            )));
        }
        if self.backpressure.max_pending == 0 {
            return Err(Error::Config("backpressure.max_pending must be at least 1".into()));
        }
        if self.backoff.max_backoff.is_zero() {
            return Err(Error::Config("backoff.max_backoff must be greater than 0".into()));
        }
        if !(10..=18).contains(&self.upstream.default_zoom) {
            return Err(Error::Config("upstream.default_zoom must be in 10..=18".into()));
        }
        if self.upstream.max_body_bytes == 0 {
            return Err(Error::Config("upstream.max_body_bytes must be greater than 0".into()));
        }
        if self.upstream.timeout.is_zero() {
            return Err(Error::Config("upstream.timeout must be greater than 0".into()));
        }
        if self.persistence.maintenance_interval.is_zero() {
            return Err(Error::Config(
                "persistence.maintenance_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Duration parsing
// =============================================================================

/// Parse a duration string such as `"30s"`, `"6d"`, `"1h30m"` or `"250ms"`
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier_ms = match c {
            'm' | 'M' if matches!(chars.peek(), Some('s') | Some('S')) => {
                chars.next();
                1
            }
            'd' | 'D' => 86_400_000,
            'h' | 'H' => 3_600_000,
            'm' | 'M' => 60_000,
            's' | 'S' => 1_000,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total_ms += num * multiplier_ms;
    }

    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_ms += num * 1_000;
    }

    Ok(Duration::from_millis(total_ms))
}

/// Render a duration in the format accepted by [`parse_duration`]
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1_000 != 0 {
        format!("{}ms", ms)
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
