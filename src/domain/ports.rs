//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the abstractions the caching engine depends on.
//! Infrastructure adapters implement these traits to provide concrete
//! storage, transport and authorization.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │   DocumentStore  │   HttpClient   │   Authorizer     │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │ JsonFileStore │ ReqwestHttpClient │ StaticToken...   │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

// =============================================================================
// Persistence Port
// =============================================================================

/// The two independently persisted documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Document {
    /// The list of cache entries
    Cache,
    /// The hotness map (last access per location)
    Hotness,
}

impl Document {
    /// Stable storage key of the document.
    pub fn key(&self) -> &'static str {
        match self {
            Document::Cache => "geocache_entries",
            Document::Hotness => "geocache_hotness",
        }
    }
}

impl std::fmt::Display for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Port for durable key-value document storage.
///
/// Documents are loaded and saved independently; a missing document loads as
/// `None`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load a document.
    async fn load(&self, document: Document) -> Result<Option<serde_json::Value>>;

    /// Replace a document.
    async fn save(&self, document: Document, value: serde_json::Value) -> Result<()>;
}

// =============================================================================
// HTTP Transport Port
// =============================================================================

/// Outbound GET request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    /// Hard deadline for the whole exchange
    pub timeout: Duration,
    /// Body bytes read at most; larger bodies are reported as truncated
    pub max_body_bytes: usize,
}

/// Response of an outbound request.
#[derive(Debug, Clone, Default)]
pub struct HttpReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub retry_after: Option<String>,
    pub body: Bytes,
    /// The body exceeded `max_body_bytes` and was cut
    pub truncated: bool,
}

impl HttpReply {
    /// Build a JSON reply (mostly for tests and mocks)
    pub fn json(status: u16, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status,
            content_type: Some("application/json; charset=utf-8".to_string()),
            content_length: Some(body.len() as u64),
            retry_after: None,
            body,
            truncated: false,
        }
    }

    /// Attach a `Retry-After` header value
    pub fn with_retry_after(mut self, value: impl Into<String>) -> Self {
        self.retry_after = Some(value.into());
        self
    }
}

/// Transport-level failure of an outbound request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    /// The request exceeded its deadline
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Connection, TLS or protocol failure
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Port for the HTTP client used to reach the geocoder.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform a GET request.
    async fn get(&self, request: HttpRequest) -> std::result::Result<HttpReply, TransportError>;
}

// =============================================================================
// Authorization Port
// =============================================================================

/// Port deciding whether a caller is privileged.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Returns true when the principal may use privileged operations.
    async fn is_privileged(&self, principal: Option<&str>) -> bool;
}
