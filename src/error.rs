//! Error types for the geocoding cache service
//!
//! Infrastructure faults (storage, serialization, HTTP client construction,
//! configuration) live here. Client-visible lookup failures use
//! [`crate::service::LookupError`] instead.

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the geocoding cache service
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("Failed to parse configuration file: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// HTTP client construction error
    #[error("HTTP client error: {0}")]
    HttpClient(#[source] reqwest::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistent document store error
    #[error("Storage error for document {document}: {reason}")]
    Storage { document: String, reason: String },

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}
