//! Global Rate Limiter
//!
//! One serialized gate in front of the upstream provider. Each caller
//! reserves the next free slot (`max(now, last + interval)`) inside a short
//! critical section, then sleeps outside of it until the slot comes up.
//! Reservations are therefore handed out in FIFO order and consecutive
//! upstream calls are at least `min_interval` apart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::config::RateLimitConfig;

/// Cumulative wait statistics
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateLimitStats {
    pub waits: u64,
    pub total_wait: Duration,
}

impl RateLimitStats {
    /// Mean reserved wait, if anything waited yet
    pub fn average(&self) -> Option<Duration> {
        (self.waits > 0).then(|| self.total_wait / self.waits as u32)
    }
}

/// Minimum-interval gate with random jitter
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    jitter_max: Duration,
    last_slot: Mutex<Option<Instant>>,
    waits: AtomicU64,
    wait_micros: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            min_interval: config.min_interval,
            jitter_max: config.jitter_max,
            last_slot: Mutex::new(None),
            waits: AtomicU64::new(0),
            wait_micros: AtomicU64::new(0),
        }
    }

    /// Reserve the next slot and return how long the caller must wait for it
    pub fn reserve(&self) -> Duration {
        let now = Instant::now();
        let mut last = self.last_slot.lock();
        let slot = match *last {
            Some(prev) => (prev + self.min_interval).max(now),
            None => now,
        };
        *last = Some(slot);
        slot - now
    }

    /// Wait for a slot. Returns the reserved wait (without jitter).
    pub async fn acquire(&self) -> Duration {
        let wait = self.reserve();
        if !wait.is_zero() {
            let jitter = self.jitter();
            trace!(?wait, ?jitter, "Rate limiter delaying upstream call");
            tokio::time::sleep(wait + jitter).await;
        }
        self.waits.fetch_add(1, Ordering::Relaxed);
        self.wait_micros
            .fetch_add(wait.as_micros() as u64, Ordering::Relaxed);
        wait
    }

    fn jitter(&self) -> Duration {
        if self.jitter_max.is_zero() {
            return Duration::ZERO;
        }
        self.jitter_max.mul_f64(rand::random::<f64>())
    }

    /// Time until `pending` queued fetches have all passed the gate
    pub fn eta(&self, pending: usize) -> Duration {
        let backlog = self.min_interval.saturating_mul(pending as u32);
        match *self.last_slot.lock() {
            Some(last) => backlog.saturating_sub(Instant::now().saturating_duration_since(last)),
            None => Duration::ZERO,
        }
    }

    /// Time since the last reserved slot (zero while it is still ahead)
    pub fn age(&self) -> Option<Duration> {
        self.last_slot
            .lock()
            .map(|last| Instant::now().saturating_duration_since(last))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            waits: self.waits.load(Ordering::Relaxed),
            total_wait: Duration::from_micros(self.wait_micros.load(Ordering::Relaxed)),
        }
    }

    pub fn reset_stats(&self) {
        self.waits.store(0, Ordering::Relaxed);
        self.wait_micros.store(0, Ordering::Relaxed);
    }
}
