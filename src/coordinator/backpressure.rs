//! Backpressure Policy
//!
//! Decides what a cache miss does given the current fetch backlog:
//! reject it, answer it as queued, or wait for the fetch.

use std::time::Duration;

use crate::config::BackpressureConfig;

/// What to do with a miss
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Backlog full: reject without touching any state
    Busy { retry_after: Duration },
    /// Start or join the fetch in the background and answer right away
    Queue { eta: Duration },
    /// Start or join the fetch and wait for its outcome
    Wait,
}

/// Backlog thresholds
#[derive(Debug, Clone)]
pub struct Backpressure {
    max_pending: usize,
    auto_queue_eta: Duration,
    busy_retry_after: Duration,
}

impl Backpressure {
    pub fn new(config: &BackpressureConfig) -> Self {
        Self {
            max_pending: config.max_pending,
            auto_queue_eta: config.auto_queue_eta,
            busy_retry_after: config.busy_retry_after,
        }
    }

    /// Decide for a miss.
    ///
    /// `pending` is the number of fetches in flight, `eta` the time until
    /// the rate limiter has worked through them.
    pub fn decide(&self, pending: usize, eta: Duration, non_blocking: bool) -> Decision {
        if pending >= self.max_pending {
            return Decision::Busy {
                retry_after: self.busy_retry_after,
            };
        }
        if non_blocking || eta >= self.auto_queue_eta {
            return Decision::Queue { eta };
        }
        Decision::Wait
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Backpressure {
        Backpressure::new(&BackpressureConfig::default())
    }

    #[test]
    fn test_busy_at_ceiling() {
        let decision = policy().decide(250, Duration::ZERO, false);
        assert_eq!(
            decision,
            Decision::Busy {
                retry_after: Duration::from_secs(1)
            }
        );
        // The ceiling wins over non-blocking
        assert!(matches!(
            policy().decide(400, Duration::ZERO, true),
            Decision::Busy { .. }
        ));
    }

    #[test]
    fn test_queue_when_non_blocking_or_slow() {
        assert_eq!(
            policy().decide(0, Duration::ZERO, true),
            Decision::Queue { eta: Duration::ZERO }
        );
        let eta = Duration::from_secs(2);
        assert_eq!(policy().decide(3, eta, false), Decision::Queue { eta });
    }

    #[test]
    fn test_wait_when_backlog_is_short() {
        assert_eq!(
            policy().decide(1, Duration::from_millis(1_999), false),
            Decision::Wait
        );
    }
}
