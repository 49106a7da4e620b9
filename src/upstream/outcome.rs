//! Typed fetch outcomes
//!
//! Every reply of the geocoder, including transport failures, ends up as a
//! [`FetchOutcome`]. The coordinator decides from it which throttling state
//! to update; the service maps it to the client-visible error taxonomy.

use std::time::Duration;

/// Result of one upstream fetch
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Payload with a usable address (cacheable)
    Address(serde_json::Value),
    /// Valid reply without a usable address (not cacheable)
    NoData(serde_json::Value),
    /// The fetch failed
    Failed(FetchFailure),
}

/// Why a fetch failed
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FetchFailure {
    /// HTTP 429
    #[error("upstream rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// HTTP 5xx
    #[error("upstream unavailable: HTTP {status}")]
    Unavailable {
        status: u16,
        retry_after: Option<Duration>,
    },

    /// Any other non-200 status
    #[error("upstream returned HTTP {status}")]
    HttpStatus {
        status: u16,
        retry_after: Option<Duration>,
    },

    #[error("upstream payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("unexpected content type {0:?}")]
    InvalidContentType(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The geocoder answered with an `error` object
    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("upstream timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport failure: {0}")]
    Transport(String),
}

impl FetchFailure {
    /// Server-provided retry hint, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchFailure::RateLimited { retry_after }
            | FetchFailure::Unavailable { retry_after, .. }
            | FetchFailure::HttpStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether the failure signals systemic trouble and should suspend all
    /// upstream traffic
    pub fn triggers_backoff(&self) -> bool {
        matches!(
            self,
            FetchFailure::RateLimited { .. } | FetchFailure::Unavailable { .. }
        )
    }
}
