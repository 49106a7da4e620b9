//! geocache Integration Tests
//!
//! End-to-end lookups through `GeocodeService` with in-memory adapters and a
//! scripted upstream:
//! - Spatial hits, neighbor cells and radius misses
//! - Coalescing, rate limiting and backpressure
//! - Upstream throttling and recovery
//! - Capacity eviction with hotness protection
//! - Persistence across restarts

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;

use geocache::adapters::{AllowAll, InMemoryDocumentStore, JsonFileStore};
use geocache::domain::ports::{HttpClient, HttpReply, HttpRequest, TransportError};
use geocache::{
    GeocodeConfig, GeocodeService, LookupError, LookupOutcome, LookupRequest, Provenance,
};

// =============================================================================
// Scripted upstream
// =============================================================================

/// Upstream mock that answers every call with the same reply (or transport
/// failure) after `delay` and records when each call arrived.
struct ScriptedUpstream {
    reply: Mutex<HttpReply>,
    failure: Mutex<Option<TransportError>>,
    delay: Duration,
    calls: Mutex<Vec<Instant>>,
}

impl ScriptedUpstream {
    fn new(reply: HttpReply) -> Arc<Self> {
        Self::with_delay(reply, Duration::ZERO)
    }

    fn with_delay(reply: HttpReply, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(reply),
            failure: Mutex::new(None),
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn set_reply(&self, reply: HttpReply) {
        *self.reply.lock() = reply;
    }

    fn set_failure(&self, failure: Option<TransportError>) {
        *self.failure.lock() = failure;
    }

    fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl HttpClient for ScriptedUpstream {
    async fn get(&self, _request: HttpRequest) -> Result<HttpReply, TransportError> {
        self.calls.lock().push(Instant::now());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(failure) = self.failure.lock().clone() {
            return Err(failure);
        }
        let reply = self.reply.lock().clone();
        Ok(reply)
    }
}

fn madrid() -> HttpReply {
    HttpReply::json(
        200,
        json!({
            "display_name": "Puerta del Sol, Centro, Madrid, España",
            "address": {
                "road": "Puerta del Sol",
                "city": "Madrid",
                "country": "España",
                "country_code": "es"
            }
        })
        .to_string(),
    )
}

fn fast_config() -> GeocodeConfig {
    let mut config = GeocodeConfig::default();
    config.rate_limit.min_interval = Duration::from_millis(100);
    config.rate_limit.jitter_max = Duration::ZERO;
    config
}

fn service(config: GeocodeConfig, upstream: Arc<ScriptedUpstream>) -> GeocodeService {
    GeocodeService::builder(config)
        .store(Arc::new(InMemoryDocumentStore::new()))
        .http(upstream)
        .authorizer(Arc::new(AllowAll))
        .build()
        .unwrap()
}

fn ready(outcome: LookupOutcome) -> geocache::GeocodeResponse {
    match outcome {
        LookupOutcome::Ready(response) => response,
        LookupOutcome::Queued(ticket) => panic!("expected an answer, got {:?}", ticket),
    }
}

// =============================================================================
// Spatial cache
// =============================================================================

mod spatial_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_nearby_hits_and_radius_miss() {
        let upstream = ScriptedUpstream::new(madrid());
        let svc = service(fast_config(), upstream.clone());

        let fetched = ready(
            svc.lookup(LookupRequest::new(40.4168, -3.7038).language("es"))
                .await
                .unwrap(),
        );
        assert_eq!(fetched.source, Provenance::Fetched);
        assert_eq!(fetched.address["address"]["city"], "Madrid");

        // Same point
        let hit = ready(
            svc.lookup(LookupRequest::new(40.4168, -3.7038).language("es"))
                .await
                .unwrap(),
        );
        assert_eq!(hit.source, Provenance::Hit);
        assert_eq!(hit.hit_distance_m, Some(0.0));

        // About 14 m north-east, in a diagonal neighbor cell
        let hit = ready(
            svc.lookup(LookupRequest::new(40.41692, -3.70372).language("es"))
                .await
                .unwrap(),
        );
        assert_eq!(hit.source, Provenance::Hit);
        let distance = hit.hit_distance_m.unwrap();
        assert!(distance > 13.0 && distance < 15.0, "distance {}", distance);
        assert_eq!(upstream.calls(), 1);

        // About 55 m north: outside the radius
        let miss = ready(
            svc.lookup(LookupRequest::new(40.41727, -3.7038).language("es"))
                .await
                .unwrap(),
        );
        assert_eq!(miss.source, Provenance::Fetched);
        assert_eq!(upstream.calls(), 2);

        let stats = svc.metrics().snapshot();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_eviction_keeps_recent_and_hot_entries() {
        let mut config = fast_config();
        config.cache.max_entries = 10;
        config.cache.low_watermark = 5;
        let upstream = ScriptedUpstream::new(madrid());
        let svc = service(config, upstream.clone());
        let point = |i: usize| LookupRequest::new(41.0 + i as f64 * 0.001, 2.0);

        for i in 0..10 {
            svc.lookup(point(i)).await.unwrap();
        }
        // Touch the oldest entry so it counts as recent
        let hit = ready(svc.lookup(point(0)).await.unwrap());
        assert_eq!(hit.source, Provenance::Hit);

        // Crossing the cap trims to the low watermark
        svc.lookup(point(10)).await.unwrap();
        let diag = svc.diagnostics(None, None).await.unwrap();
        assert_eq!(diag.cache_len, 5);
        assert_eq!(upstream.calls(), 11);

        for i in [0, 7, 8, 9, 10] {
            let response = ready(svc.lookup(point(i)).await.unwrap());
            assert_eq!(response.source, Provenance::Hit, "point {}", i);
        }
        assert_eq!(upstream.calls(), 11);

        let evicted = ready(svc.lookup(point(6)).await.unwrap());
        assert_eq!(evicted.source, Provenance::Fetched);
        assert_eq!(upstream.calls(), 12);
    }
}

// =============================================================================
// Coalescing, rate limiting and backpressure
// =============================================================================

mod flow_control_tests {
    use futures::future::join_all;
    use tokio_test::{assert_pending, assert_ready, task};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_fetch() {
        let upstream = ScriptedUpstream::with_delay(madrid(), Duration::from_millis(500));
        let svc = service(fast_config(), upstream.clone());
        let request = LookupRequest::new(40.4168, -3.7038);

        let mut first = task::spawn(svc.lookup(request.clone()));
        assert_pending!(first.poll());
        assert_eq!(svc.pending(), 1);

        let joined = join_all((0..9).map(|_| svc.lookup(request.clone()))).await;
        let first = ready(assert_ready!(first.poll()).unwrap());

        assert_eq!(upstream.calls(), 1);
        assert_eq!(first.source, Provenance::Fetched);
        for outcome in joined {
            let response = ready(outcome.unwrap());
            assert_eq!(response.source, Provenance::Fetched);
            assert_eq!(response.cached_at, first.cached_at);
        }
        assert_eq!(svc.pending(), 0);

        let stats = svc.metrics().snapshot();
        assert_eq!(stats.misses, 10);
        assert_eq!(stats.fetches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_calls_are_spaced() {
        let mut config = fast_config();
        config.rate_limit.min_interval = Duration::from_secs(1);
        config.backpressure.auto_queue_eta = Duration::from_secs(3600);
        let upstream = ScriptedUpstream::new(madrid());
        let svc = service(config, upstream.clone());

        let start = Instant::now();
        let results = join_all(
            (0..5).map(|i| svc.lookup(LookupRequest::new(48.85 + i as f64 * 0.01, 2.35))),
        )
        .await;
        assert!(results.iter().all(|r| r.is_ok()));

        let times = upstream.call_times();
        assert_eq!(times.len(), 5);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
        let span = times[4] - start;
        assert!(span >= Duration::from_secs(4) && span < Duration::from_millis(4_500));

        let diag = svc.diagnostics(None, None).await.unwrap();
        assert_eq!(diag.upstream_fetches, 5);
        assert!(diag.avg_rate_limit_wait_s.unwrap() > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_ceiling_rejects_excess_misses() {
        let upstream = ScriptedUpstream::with_delay(madrid(), Duration::from_millis(50));
        let svc = service(fast_config(), upstream.clone());

        let mut queued = 0;
        let mut busy = 0;
        for i in 0..300 {
            let request = LookupRequest::new(-33.0 - i as f64 * 0.001, 151.0).non_blocking();
            match svc.lookup(request).await {
                Ok(LookupOutcome::Queued(ticket)) => {
                    queued += 1;
                    assert!(ticket.retry_after() >= 1);
                }
                Err(LookupError::Busy { pending, .. }) => {
                    busy += 1;
                    assert_eq!(pending, 250);
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert_eq!(queued, 250);
        assert_eq!(busy, 50);

        while svc.pending() > 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(upstream.calls(), 250);

        let diag = svc.diagnostics(None, None).await.unwrap();
        assert_eq!(diag.cache_len, 250);
        assert_eq!(diag.queued, 250);
        assert_eq!(diag.busy, 50);
        assert_eq!(diag.misses, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_wait_is_answered_as_queued() {
        let mut config = fast_config();
        config.rate_limit.min_interval = Duration::from_secs(5);
        config.backpressure.auto_queue_eta = Duration::from_secs(2);
        let upstream = ScriptedUpstream::with_delay(madrid(), Duration::from_secs(10));
        let svc = service(config, upstream.clone());

        // A blocking caller holds the only slot of the current interval
        let first = tokio::spawn({
            let svc = svc.clone();
            async move { svc.lookup(LookupRequest::new(40.4168, -3.7038)).await }
        });
        while upstream.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The next miss would wait about 5 s for its slot, so it is queued
        // even though the caller did not ask for non-blocking
        let paris = LookupRequest::new(48.8566, 2.3522);
        let ticket = match svc.lookup(paris.clone()).await.unwrap() {
            LookupOutcome::Queued(ticket) => ticket,
            other => panic!("expected a queue ticket, got {:?}", other),
        };
        assert!(ticket.eta >= Duration::from_secs(2));
        assert_eq!(ticket.pending, 2);

        let first = ready(first.await.unwrap().unwrap());
        assert_eq!(first.source, Provenance::Fetched);

        // The background fetch fills the cache on its own
        while svc.pending() > 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(upstream.calls(), 2);
        let hit = ready(svc.lookup(paris).await.unwrap());
        assert_eq!(hit.source, Provenance::Hit);
        assert_eq!(upstream.calls(), 2);
        assert_eq!(svc.metrics().snapshot().misses, 2);
    }
}

// =============================================================================
// Upstream throttling
// =============================================================================

mod throttling_tests {
    use assert_matches::assert_matches;
    use futures::future::join_all;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_throttle_reply_suspends_upstream() {
        let upstream = ScriptedUpstream::new(
            HttpReply::json(429, r#"{"error":"Too Many Requests"}"#).with_retry_after("60"),
        );
        let svc = service(fast_config(), upstream.clone());

        let err = svc
            .lookup(LookupRequest::new(51.5074, -0.1278))
            .await
            .unwrap_err();
        assert_matches!(err, LookupError::RateLimited { retry_after } if retry_after >= Duration::from_secs(60));
        assert_eq!(err.code(), "rate_limited");

        // Another location fails fast without reaching the upstream
        let err = svc
            .lookup(LookupRequest::new(52.52, 13.405))
            .await
            .unwrap_err();
        assert_matches!(err, LookupError::TemporarilyUnavailable { .. });
        assert_eq!(upstream.calls(), 1);
        assert!(svc.backoff_remaining().is_some());

        // Operators can lift the suspension
        upstream.set_reply(madrid());
        svc.reset("backoff", None).await.unwrap();
        svc.reset("neg", None).await.unwrap();
        let response = ready(svc.lookup(LookupRequest::new(51.5074, -0.1278)).await.unwrap());
        assert_eq!(response.source, Provenance::Fetched);
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_never_ends_before_retry_after() {
        let upstream = ScriptedUpstream::new(
            HttpReply::json(429, r#"{"error":"Too Many Requests"}"#).with_retry_after("600"),
        );
        let svc = service(fast_config(), upstream.clone());

        let err = svc
            .lookup(LookupRequest::new(51.5074, -0.1278))
            .await
            .unwrap_err();
        assert_matches!(err, LookupError::RateLimited { retry_after } if retry_after >= Duration::from_secs(600));

        upstream.set_reply(madrid());
        tokio::time::advance(Duration::from_secs(599)).await;

        let err = svc
            .lookup(LookupRequest::new(48.8566, 2.3522))
            .await
            .unwrap_err();
        assert_matches!(err, LookupError::TemporarilyUnavailable { .. });
        assert_eq!(err.code(), "temporarily_unavailable");
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_retry_after_is_capped() {
        let upstream = ScriptedUpstream::new(
            HttpReply::json(429, r#"{"error":"Too Many Requests"}"#)
                .with_retry_after("18446744073709551615"),
        );
        let config = fast_config();
        let max_backoff = config.backoff.max_backoff;
        let svc = service(config, upstream.clone());

        let results = join_all(
            (0..20).map(|i| svc.lookup(LookupRequest::new(51.5 + i as f64 * 0.01, -0.12))),
        )
        .await;
        assert_eq!(upstream.calls(), 1);
        for result in results {
            match result.unwrap_err() {
                LookupError::RateLimited { retry_after }
                | LookupError::TemporarilyUnavailable { retry_after } => {
                    assert!(retry_after <= max_backoff, "{:?}", retry_after);
                }
                other => panic!("unexpected error {:?}", other),
            }
        }

        let remaining = svc.backoff_remaining().unwrap();
        assert!(remaining <= max_backoff);
        tokio::time::advance(max_backoff).await;
        assert!(svc.backoff_remaining().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_suspends_every_cell() {
        let upstream = ScriptedUpstream::new(HttpReply::json(503, "{}"));
        let svc = service(fast_config(), upstream.clone());

        let err = svc
            .lookup(LookupRequest::new(51.5074, -0.1278))
            .await
            .unwrap_err();
        assert_matches!(err, LookupError::UpstreamUnavailable { status: 503, .. });
        assert_eq!(err.code(), "upstream_unavailable");
        assert_eq!(err.status_class(), 503);
        assert!(svc.backoff_remaining().is_some());

        upstream.set_reply(madrid());
        for (lat, lon) in [(51.5074, -0.1278), (48.8566, 2.3522)] {
            let err = svc.lookup(LookupRequest::new(lat, lon)).await.unwrap_err();
            assert_matches!(err, LookupError::TemporarilyUnavailable { .. });
        }
        assert_eq!(upstream.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_only_suppresses_its_cell() {
        let upstream = ScriptedUpstream::new(madrid());
        upstream.set_failure(Some(TransportError::Timeout(Duration::from_secs(15))));
        let svc = service(fast_config(), upstream.clone());

        let err = svc
            .lookup(LookupRequest::new(51.5074, -0.1278))
            .await
            .unwrap_err();
        assert_matches!(err, LookupError::UpstreamTimeout);
        assert_eq!(err.code(), "upstream_timeout");
        assert_eq!(err.status_class(), 504);
        assert!(svc.backoff_remaining().is_none());

        let err = svc
            .lookup(LookupRequest::new(51.5074, -0.1278))
            .await
            .unwrap_err();
        assert_matches!(err, LookupError::TemporarilyUnavailable { .. });
        assert_eq!(upstream.calls(), 1);

        let diag = svc.diagnostics(None, None).await.unwrap();
        assert_eq!(diag.cache_len, 0);

        // Other cells still reach the upstream
        upstream.set_failure(None);
        let response = ready(svc.lookup(LookupRequest::new(48.8566, 2.3522)).await.unwrap());
        assert_eq!(response.source, Provenance::Fetched);
        assert_eq!(upstream.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_result_is_suppressed_per_cell() {
        let upstream =
            ScriptedUpstream::new(HttpReply::json(200, r#"{"error":"Unable to geocode"}"#));
        let svc = service(fast_config(), upstream.clone());

        let err = svc.lookup(LookupRequest::new(0.0, -30.0)).await.unwrap_err();
        assert_matches!(err, LookupError::UpstreamError(_));

        let err = svc.lookup(LookupRequest::new(0.0, -30.0)).await.unwrap_err();
        assert_matches!(err, LookupError::TemporarilyUnavailable { .. });
        assert_eq!(upstream.calls(), 1);

        // Unrelated cells are not affected
        upstream.set_reply(madrid());
        svc.lookup(LookupRequest::new(10.0, 10.0)).await.unwrap();
        assert_eq!(upstream.calls(), 2);
    }
}

// =============================================================================
// Persistence
// =============================================================================

mod persistence_tests {
    use super::*;

    fn file_backed(dir: &std::path::Path, upstream: Arc<ScriptedUpstream>) -> GeocodeService {
        GeocodeService::builder(fast_config())
            .store(Arc::new(JsonFileStore::new(dir)))
            .http(upstream)
            .authorizer(Arc::new(AllowAll))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        let upstream = ScriptedUpstream::new(madrid());
        let svc = file_backed(dir.path(), upstream.clone());
        let report = svc.start().await;
        assert_eq!(report.loaded, 0);
        assert!(svc.is_ready());

        svc.lookup(LookupRequest::new(40.4168, -3.7038).language("es"))
            .await
            .unwrap();
        svc.lookup(LookupRequest::new(40.4168, -3.7038).language("es"))
            .await
            .unwrap();
        let flushed = svc.shutdown().await.unwrap();
        assert!(flushed.cache_saved);
        assert!(flushed.hotness_saved);
        assert!(!svc.is_ready());

        let upstream = ScriptedUpstream::new(HttpReply::json(500, "{}"));
        let restarted = file_backed(dir.path(), upstream.clone());
        let report = restarted.start().await;
        assert_eq!(report.loaded, 1);

        let hit = ready(
            restarted
                .lookup(LookupRequest::new(40.4168, -3.7038).language("es"))
                .await
                .unwrap(),
        );
        assert_eq!(hit.source, Provenance::Hit);
        assert_eq!(hit.lang, "es,en");
        assert_eq!(upstream.calls(), 0);

        let diag = restarted.diagnostics(None, None).await.unwrap();
        assert_eq!(diag.hot_len, 1);
        restarted.shutdown().await.unwrap();
    }
}
