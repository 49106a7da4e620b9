//! Upstream Geocoder
//!
//! Request shaping and reply classification for a Nominatim-compatible
//! reverse geocoding endpoint. Nothing here touches shared state; throttling
//! decisions are taken by the caller from the returned [`FetchOutcome`].

mod client;
mod outcome;

pub use client::{compact, parse_retry_after, FetchRequest, GeocoderClient};
pub use outcome::{FetchFailure, FetchOutcome};
