//! Infrastructure Adapters
//!
//! Concrete implementations of the ports in [`crate::domain::ports`].
//!
//! | Port            | Adapter                 | Backing                        |
//! |-----------------|-------------------------|--------------------------------|
//! | `DocumentStore` | `JsonFileStore`         | one JSON file per document     |
//! | `DocumentStore` | `InMemoryDocumentStore` | `DashMap`, for tests           |
//! | `HttpClient`    | `ReqwestHttpClient`     | pooled reqwest client, rustls  |
//! | `Authorizer`    | `StaticTokenAuthorizer` | fixed set of bearer tokens     |
//! | `Authorizer`    | `AllowAll`              | every caller is privileged     |
//!
//! ```ignore
//! use geocache::adapters::{JsonFileStore, ReqwestHttpClient};
//!
//! let service = GeocodeService::builder(config)
//!     .store(Arc::new(JsonFileStore::new("/var/lib/geocache")))
//!     .http(Arc::new(ReqwestHttpClient::new()?))
//!     .build()?;
//! ```

mod auth;
mod file_store;
mod memory_store;
mod reqwest_client;

pub use auth::{AllowAll, StaticTokenAuthorizer};
pub use file_store::JsonFileStore;
pub use memory_store::{InMemoryDocumentStore, StoreStats};
pub use reqwest_client::ReqwestHttpClient;
