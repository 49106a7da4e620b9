//! Geocoder Client
//!
//! Builds Nominatim-style reverse requests, sends them through the
//! `HttpClient` port and classifies the reply.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use super::outcome::{FetchFailure, FetchOutcome};
use crate::cache::LanguageTag;
use crate::config::UpstreamConfig;
use crate::domain::ports::{HttpClient, HttpReply, HttpRequest, TransportError};

/// Share of non-critical upstream anomalies that get logged
const LOG_SAMPLE_RATE: f64 = 0.1;

/// Longest `Retry-After` hint taken at face value
const MAX_RETRY_AFTER_SECS: u64 = 86_400;

/// Address keys kept by compaction
const ADDRESS_KEYS: &[&str] = &[
    "house_number",
    "road",
    "neighbourhood",
    "suburb",
    "hamlet",
    "quarter",
    "borough",
    "village",
    "town",
    "city",
    "city_district",
    "municipality",
    "county",
    "state_district",
    "state",
    "state_code",
    "postcode",
    "country",
    "country_code",
];

/// Top-level keys kept by compaction
const TOP_LEVEL_KEYS: &[&str] = &["display_name", "place_id", "osm_type", "osm_id", "class", "type"];

/// One reverse lookup to perform
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Unquantized query latitude
    pub lat: f64,
    /// Unquantized query longitude
    pub lon: f64,
    pub zoom: Option<u8>,
    pub language: LanguageTag,
}

/// Client for the reverse geocoding endpoint
pub struct GeocoderClient {
    http: Arc<dyn HttpClient>,
    config: UpstreamConfig,
}

impl std::fmt::Debug for GeocoderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeocoderClient")
            .field("url", &self.config.url)
            .field("timeout", &self.config.timeout)
            .finish()
    }
}

impl GeocoderClient {
    pub fn new(http: Arc<dyn HttpClient>, config: UpstreamConfig) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    /// Build the outbound request
    pub fn build_request(&self, req: &FetchRequest) -> HttpRequest {
        let contact = self.config.contact();
        let zoom = req.zoom.unwrap_or(self.config.default_zoom);

        let mut query = vec![
            ("format".to_string(), "json".to_string()),
            ("lat".to_string(), format!("{:.8}", req.lat)),
            ("lon".to_string(), format!("{:.8}", req.lon)),
            ("zoom".to_string(), zoom.to_string()),
            ("addressdetails".to_string(), "1".to_string()),
            ("accept-language".to_string(), req.language.request().to_string()),
        ];
        if let Some(email) = contact {
            query.push(("email".to_string(), email.to_string()));
        }

        let mut headers = vec![
            (
                "User-Agent".to_string(),
                format!("{} ({})", self.config.user_agent, contact.unwrap_or("no-contact")),
            ),
            ("Accept-Language".to_string(), req.language.header().to_string()),
            ("Accept".to_string(), "application/json".to_string()),
        ];
        if let Some(referer) = &self.config.referer {
            headers.push(("Referer".to_string(), referer.clone()));
        }

        HttpRequest {
            url: self.config.url.clone(),
            query,
            headers,
            timeout: self.config.timeout,
            max_body_bytes: self.config.max_body_bytes,
        }
    }

    /// Perform the lookup and classify the reply
    #[instrument(skip(self, req), fields(lat = req.lat, lon = req.lon, lang = req.language.request()))]
    pub async fn fetch(&self, req: &FetchRequest) -> FetchOutcome {
        let request = self.build_request(req);
        match self.http.get(request).await {
            Ok(reply) => self.classify(reply, Utc::now()),
            Err(TransportError::Timeout(after)) => {
                debug!("Upstream timed out after {:?}", after);
                FetchOutcome::Failed(FetchFailure::Timeout(after))
            }
            Err(TransportError::Failed(reason)) => {
                if sampled() {
                    warn!("Upstream transport failure: {}", reason);
                }
                FetchOutcome::Failed(FetchFailure::Transport(reason))
            }
        }
    }

    /// Map a raw reply to an outcome
    pub fn classify(&self, reply: HttpReply, now: DateTime<Utc>) -> FetchOutcome {
        let retry_after = reply
            .retry_after
            .as_deref()
            .and_then(|v| parse_retry_after(v, now));

        let failure = match reply.status {
            200 => None,
            429 => Some(FetchFailure::RateLimited { retry_after }),
            500..=599 => Some(FetchFailure::Unavailable {
                status: reply.status,
                retry_after,
            }),
            status => Some(FetchFailure::HttpStatus {
                status,
                retry_after,
            }),
        };
        if let Some(failure) = failure {
            debug!("Upstream replied {}", failure);
            return FetchOutcome::Failed(failure);
        }

        let limit = self.config.max_body_bytes;
        if reply.content_length.is_some_and(|len| len > limit as u64) {
            warn!("Upstream payload too large: {:?} bytes", reply.content_length);
            return FetchOutcome::Failed(FetchFailure::PayloadTooLarge { limit });
        }

        let content_type = reply.content_type.clone().unwrap_or_default();
        if !content_type.to_ascii_lowercase().contains("application/json") {
            if sampled() {
                let preview = String::from_utf8_lossy(&reply.body[..reply.body.len().min(300)]);
                warn!(
                    "Upstream non-JSON 200: Content-Type={} preview={:?}",
                    content_type,
                    preview.trim()
                );
            }
            return FetchOutcome::Failed(FetchFailure::InvalidContentType(content_type));
        }

        if reply.truncated || reply.body.len() > limit {
            warn!("Upstream payload exceeded {} bytes", limit);
            return FetchOutcome::Failed(FetchFailure::PayloadTooLarge { limit });
        }

        let raw: Value = match serde_json::from_slice(&reply.body) {
            Ok(raw) => raw,
            Err(e) => {
                if sampled() {
                    warn!("Upstream invalid JSON: {}", e);
                }
                return FetchOutcome::Failed(FetchFailure::InvalidPayload(e.to_string()));
            }
        };
        let Value::Object(raw) = raw else {
            return FetchOutcome::Failed(FetchFailure::InvalidPayload(
                "expected a JSON object".to_string(),
            ));
        };
        if let Some(error) = raw.get("error") {
            warn!("Upstream returned error: {}", error);
            let message = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
            return FetchOutcome::Failed(FetchFailure::UpstreamError(message));
        }

        let data = if self.config.compact_address {
            compact(&raw)
        } else {
            Value::Object(raw)
        };

        if has_address(&data) {
            FetchOutcome::Address(data)
        } else {
            FetchOutcome::NoData(data)
        }
    }
}

fn sampled() -> bool {
    rand::random::<f64>() < LOG_SAMPLE_RATE
}

fn has_address(data: &Value) -> bool {
    match data.get("address") {
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

/// Keep the stable top-level keys and a fixed set of address keys
pub fn compact(raw: &Map<String, Value>) -> Value {
    let mut out = Map::new();
    for key in TOP_LEVEL_KEYS {
        out.insert((*key).to_string(), raw.get(*key).cloned().unwrap_or(Value::Null));
    }

    let mut address = Map::new();
    if let Some(Value::Object(src)) = raw.get("address") {
        for key in ADDRESS_KEYS {
            match src.get(*key) {
                Some(Value::Null) | None => {}
                Some(value) => {
                    address.insert((*key).to_string(), value.clone());
                }
            }
        }
    }
    out.insert("address".to_string(), Value::Object(address));
    Value::Object(out)
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
///
/// Dates in the past (or right now) still yield one second. Hints are capped
/// at one day.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    let secs = match value.parse::<u64>() {
        Ok(secs) => secs,
        Err(_) => {
            let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
            (at - now).num_seconds().max(1) as u64
        }
    };
    Some(Duration::from_secs(secs.min(MAX_RETRY_AFTER_SECS)))
}
