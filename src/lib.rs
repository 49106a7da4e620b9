//! geocache - Spatial caching front for reverse geocoding
//!
//! Turns (latitude, longitude) pairs into addresses by fronting a
//! rate-limited, Nominatim-compatible geocoder. Bursty location traffic is
//! absorbed by a grid-indexed spatial cache, per-cell request coalescing, a
//! global rate limiter with backoff, negative caching and adaptive
//! backpressure.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         GeocodeService                            │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌──────────────┐   ┌────────────────────────┐  │
//! │  │   cache    │   │  coordinator │   │        throttle         │  │
//! │  │ store/index│   │ inflight/    │──▶│ rate limit / backoff /  │  │
//! │  │ hotness    │   │ backpressure │   │ negative cache          │  │
//! │  └────────────┘   └──────────────┘   └────────────────────────┘  │
//! │         ▲                 │                        │              │
//! │         │                 ▼                        ▼              │
//! │  ┌────────────┐   ┌──────────────┐                                │
//! │  │persistence │   │   upstream   │                                │
//! │  └────────────┘   └──────────────┘                                │
//! └──────────────────────────────────────────────────────────────────┘
//!          │ DocumentStore        │ HttpClient        Authorizer
//!          ▼                      ▼
//!      adapters (JSON files, reqwest, static tokens)
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Infrastructure adapters implementing domain ports
//! - [`cache`] - Quantization, language tags, spatial index, store, hotness
//! - [`config`] - Typed configuration with YAML loading
//! - [`coordinator`] - Per-cell fetch coalescing and backpressure
//! - [`domain`] - Ports (traits) for storage, HTTP and authorization
//! - [`error`] - Infrastructure error types
//! - [`metrics`] - Counters and Prometheus exposition
//! - [`persistence`] - Startup load and debounced flushes
//! - [`server`] - hyper HTTP front
//! - [`service`] - The lookup, reset and diagnostics operations
//! - [`throttle`] - Rate limiter, global backoff, negative cache
//! - [`upstream`] - Geocoder request building and reply classification

pub mod adapters;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod persistence;
pub mod server;
pub mod service;
pub mod throttle;
pub mod upstream;

// Re-export commonly used types
pub use config::GeocodeConfig;
pub use error::{Error, Result};
pub use service::{
    GeocodeResponse, GeocodeService, LookupError, LookupOutcome, LookupRequest, Provenance,
    ResetScope,
};
