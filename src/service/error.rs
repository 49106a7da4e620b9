//! Lookup Errors
//!
//! The client-visible failure taxonomy. Every variant has a stable
//! machine-readable code, an HTTP status class and, where it makes sense,
//! a retry hint.

use std::time::Duration;

use thiserror::Error;

use crate::upstream::FetchFailure;

/// Why a lookup, reset or diagnostics request failed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LookupError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid reset scope {0:?}")]
    InvalidReset(String),

    #[error("forbidden")]
    Forbidden,

    /// Upstream answered 429; all traffic is suspended for `retry_after`
    #[error("rate limited by the geocoder")]
    RateLimited { retry_after: Duration },

    /// Upstream answered 5xx
    #[error("geocoder unavailable (HTTP {status})")]
    UpstreamUnavailable {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("geocoder returned HTTP {status}")]
    UpstreamHttp {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("geocoder payload too large")]
    PayloadTooLarge,

    #[error("geocoder returned {0:?} instead of JSON")]
    InvalidContentType(String),

    #[error("invalid geocoder payload: {0}")]
    InvalidPayload(String),

    #[error("geocoder error: {0}")]
    UpstreamError(String),

    #[error("geocoder timed out")]
    UpstreamTimeout,

    /// Global backoff or per-cell suppression is active
    #[error("temporarily unavailable")]
    TemporarilyUnavailable { retry_after: Duration },

    /// The fetch backlog is full
    #[error("busy: {pending} fetches pending")]
    Busy {
        retry_after: Duration,
        eta: Duration,
        pending: usize,
    },
}

impl LookupError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            LookupError::InvalidInput(_) => "bad_input",
            LookupError::InvalidReset(_) => "invalid_reset",
            LookupError::Forbidden => "forbidden",
            LookupError::RateLimited { .. } => "rate_limited",
            LookupError::UpstreamUnavailable { .. } => "upstream_unavailable",
            LookupError::UpstreamHttp { .. } => "upstream_http_error",
            LookupError::PayloadTooLarge => "payload_too_large",
            LookupError::InvalidContentType(_) => "invalid_content_type",
            LookupError::InvalidPayload(_) => "invalid_payload",
            LookupError::UpstreamError(_) => "upstream_error",
            LookupError::UpstreamTimeout => "upstream_timeout",
            LookupError::TemporarilyUnavailable { .. } => "temporarily_unavailable",
            LookupError::Busy { .. } => "busy",
        }
    }

    /// HTTP status the error maps to
    pub fn status_class(&self) -> u16 {
        match self {
            LookupError::InvalidInput(_) | LookupError::InvalidReset(_) => 400,
            LookupError::Forbidden => 403,
            LookupError::RateLimited { .. } => 429,
            LookupError::UpstreamHttp { .. }
            | LookupError::PayloadTooLarge
            | LookupError::InvalidContentType(_)
            | LookupError::InvalidPayload(_)
            | LookupError::UpstreamError(_) => 502,
            LookupError::UpstreamUnavailable { .. }
            | LookupError::TemporarilyUnavailable { .. }
            | LookupError::Busy { .. } => 503,
            LookupError::UpstreamTimeout => 504,
        }
    }

    /// Retry hint in whole seconds (at least 1)
    pub fn retry_after(&self) -> Option<u64> {
        let hint = match self {
            LookupError::RateLimited { retry_after }
            | LookupError::TemporarilyUnavailable { retry_after }
            | LookupError::Busy { retry_after, .. } => Some(*retry_after),
            LookupError::UpstreamUnavailable { retry_after, .. }
            | LookupError::UpstreamHttp { retry_after, .. } => *retry_after,
            _ => None,
        };
        hint.map(whole_seconds)
    }
}

impl From<FetchFailure> for LookupError {
    fn from(failure: FetchFailure) -> Self {
        match failure {
            FetchFailure::RateLimited { retry_after } => LookupError::RateLimited {
                retry_after: retry_after.unwrap_or(Duration::from_secs(1)),
            },
            FetchFailure::Unavailable {
                status,
                retry_after,
            } => LookupError::UpstreamUnavailable {
                status,
                retry_after,
            },
            FetchFailure::HttpStatus {
                status,
                retry_after,
            } => LookupError::UpstreamHttp {
                status,
                retry_after,
            },
            FetchFailure::PayloadTooLarge { .. } => LookupError::PayloadTooLarge,
            FetchFailure::InvalidContentType(ct) => LookupError::InvalidContentType(ct),
            FetchFailure::InvalidPayload(reason) => LookupError::InvalidPayload(reason),
            FetchFailure::UpstreamError(reason) | FetchFailure::Transport(reason) => {
                LookupError::UpstreamError(reason)
            }
            FetchFailure::Timeout(_) => LookupError::UpstreamTimeout,
        }
    }
}

/// Round a wait up to whole seconds, never below one
pub(crate) fn whole_seconds(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}
