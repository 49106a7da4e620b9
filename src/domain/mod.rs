//! Domain Layer
//!
//! Trait abstractions for the collaborators the caching engine talks to.
//!
//! # Usage
//!
//! ```ignore
//! use geocache::domain::{DocumentStore, HttpClient, Authorizer};
//!
//! // Use traits for dependency injection
//! let service = GeocodeService::builder(config)
//!     .store(Arc::new(JsonFileStore::new(dir)))
//!     .http(Arc::new(ReqwestHttpClient::new()?))
//!     .build();
//! ```

pub mod ports;

pub use ports::{
    Authorizer, Document, DocumentStore, HttpClient, HttpReply, HttpRequest, TransportError,
};
