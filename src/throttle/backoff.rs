//! Global Backoff
//!
//! A single "suspend until" instant set when the upstream signals systemic
//! trouble (429 or 5xx). While it is in the future no request reaches the
//! upstream. Writes only ever extend the window.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::info;

/// Backoff window after an explicit upstream throttle.
///
/// `max(hint, default)` plus up to 10% jitter, capped at `max`. Below the cap
/// the window never ends before the hint.
pub fn throttle_window(hint: Option<Duration>, default: Duration, max: Duration) -> Duration {
    let base = hint.unwrap_or(default).max(default).min(max);
    let jitter = base.mul_f64(rand::random::<f64>() * 0.1);
    base.saturating_add(jitter).min(max)
}

/// Global suspension window
#[derive(Debug)]
pub struct BackoffController {
    until: Mutex<Option<Instant>>,
    max: Duration,
}

impl BackoffController {
    pub fn new(max: Duration) -> Self {
        Self {
            until: Mutex::new(None),
            max,
        }
    }

    /// Suspend for `duration` (capped), unless a later suspension is
    /// already in place. Returns the effective end.
    pub fn extend(&self, duration: Duration) -> Instant {
        let target = Instant::now() + duration.min(self.max);
        let mut until = self.until.lock();
        let effective = match *until {
            Some(current) if current > target => current,
            _ => target,
        };
        *until = Some(effective);
        info!(
            "Upstream backoff active for {:?}",
            effective.saturating_duration_since(Instant::now())
        );
        effective
    }

    /// Time left in the window, `None` when not suspended
    pub fn remaining(&self) -> Option<Duration> {
        let until = (*self.until.lock())?;
        let left = until.saturating_duration_since(Instant::now());
        (!left.is_zero()).then_some(left)
    }

    pub fn clear(&self) {
        *self.until.lock() = None;
    }
}
