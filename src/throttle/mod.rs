//! Upstream Throttling
//!
//! Everything that keeps the geocoder from being hammered:
//!
//! - [`RateLimiter`]: global minimum interval between upstream calls
//! - [`BackoffController`]: global suspension after 429/5xx
//! - [`NegativeCache`]: per-cell suppression after failed or empty fetches

mod backoff;
mod negative;
mod rate_limit;

pub use backoff::{throttle_window, BackoffController};
pub use negative::NegativeCache;
pub use rate_limit::{RateLimitStats, RateLimiter};
