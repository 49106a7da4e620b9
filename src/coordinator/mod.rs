//! Miss Coordination
//!
//! - [`InflightCoordinator`]: one upstream fetch per grid cell, shared by
//!   every concurrent miss for that cell
//! - [`Backpressure`]: busy / queued / wait decision from the fetch backlog

mod backpressure;
mod inflight;

pub use backpressure::{Backpressure, Decision};
pub use inflight::{Admission, InflightCoordinator, SharedOutcome};
