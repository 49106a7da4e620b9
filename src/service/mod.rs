//! Geocoding Service
//!
//! The single context object owning every piece of shared state: the spatial
//! cache, hotness map, throttling state, inflight registry, persistence and
//! counters. Cloning a [`GeocodeService`] is cheap; all clones share state.
//!
//! # Lookup flow
//!
//! ```text
//!  LookupRequest
//!       │ language, authorization, coordinate validation
//!       ▼
//!  quantize ──▶ CacheStore::lookup ──hit──▶ touch hotness ──▶ Ready(hit)
//!       │ miss
//!       ▼
//!  backoff / negative cache active? ──yes──▶ TemporarilyUnavailable
//!       │ no
//!       ▼
//!  eviction pass ──▶ Backpressure::decide(pending, eta)
//!       │
//!       ├── Busy  ──▶ Busy (no state change)
//!       ├── Queue ──▶ start/join fetch in background ──▶ Queued(ticket)
//!       └── Wait  ──▶ start/join fetch ──▶ await shared outcome ──▶ Ready
//!
//!  fetch task: rate limiter ──▶ GeocoderClient::fetch ──▶ apply outcome
//!              (insert entry | negative cache | global backoff)
//! ```

mod error;
mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub use error::LookupError;
pub use types::{
    Diagnostics, GeocodeResponse, LookupOutcome, LookupRequest, Provenance, QueueTicket,
    ResetReport, ResetScope, ResponseMeta,
};

use crate::adapters::{InMemoryDocumentStore, ReqwestHttpClient, StaticTokenAuthorizer};
use crate::cache::quantize::{quantize, validate};
use crate::cache::{CacheEntry, CacheStore, GridCell, HotnessTracker, LanguageTag, LoadReport, MatchKind};
use crate::config::GeocodeConfig;
use crate::coordinator::{Admission, Backpressure, Decision, InflightCoordinator};
use crate::domain::ports::{Authorizer, Document, DocumentStore, HttpClient};
use crate::error::Result;
use crate::metrics::ServiceMetrics;
use crate::persistence::{FlushReport, Persistence};
use crate::throttle::{throttle_window, BackoffController, NegativeCache, RateLimiter};
use crate::upstream::{FetchFailure, FetchOutcome, FetchRequest, GeocoderClient};
use types::round_to;

/// Zoom levels passed through to the geocoder
const ZOOM_RANGE: std::ops::RangeInclusive<u8> = 10..=18;

/// What a fetch resolved to, as seen by every caller that joined it
#[derive(Debug, Clone)]
enum Completion {
    /// The address was cached
    Cached(CacheEntry),
    /// Valid reply without an address
    Empty {
        address: serde_json::Value,
        language: String,
    },
    Failed(LookupError),
}

impl From<JoinError> for Completion {
    fn from(e: JoinError) -> Self {
        Completion::Failed(LookupError::UpstreamError(format!("fetch task aborted: {}", e)))
    }
}

struct Inner {
    config: GeocodeConfig,
    store: RwLock<CacheStore>,
    hotness: RwLock<HotnessTracker>,
    negative: NegativeCache,
    backoff: BackoffController,
    rate_limiter: RateLimiter,
    inflight: InflightCoordinator<Completion>,
    backpressure: Backpressure,
    upstream: GeocoderClient,
    authorizer: Arc<dyn Authorizer>,
    persistence: Persistence,
    metrics: ServiceMetrics,
    ready: AtomicBool,
    shutdown: CancellationToken,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// Reverse geocoding front with a spatial cache
#[derive(Clone)]
pub struct GeocodeService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GeocodeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeocodeService")
            .field("upstream", &self.inner.upstream)
            .field("inflight", &self.inner.inflight)
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`GeocodeService`]
pub struct GeocodeServiceBuilder {
    config: GeocodeConfig,
    documents: Option<Arc<dyn DocumentStore>>,
    http: Option<Arc<dyn HttpClient>>,
    authorizer: Option<Arc<dyn Authorizer>>,
}

impl GeocodeServiceBuilder {
    /// Durable storage for the cache and hotness documents (in-memory when unset)
    pub fn store(mut self, documents: Arc<dyn DocumentStore>) -> Self {
        self.documents = Some(documents);
        self
    }

    /// HTTP transport for the geocoder (reqwest when unset)
    pub fn http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    /// Privilege check (nobody is privileged when unset)
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn build(self) -> Result<GeocodeService> {
        let config = self.config;
        config.validate()?;

        let http = match self.http {
            Some(http) => http,
            None => Arc::new(ReqwestHttpClient::new()?),
        };
        let documents = self
            .documents
            .unwrap_or_else(|| Arc::new(InMemoryDocumentStore::new()));
        let authorizer = self
            .authorizer
            .unwrap_or_else(|| Arc::new(StaticTokenAuthorizer::new(Vec::<String>::new())));

        let inner = Inner {
            store: RwLock::new(CacheStore::new(config.cache.clone())),
            hotness: RwLock::new(HotnessTracker::new()),
            negative: NegativeCache::new(),
            backoff: BackoffController::new(config.backoff.max_backoff),
            rate_limiter: RateLimiter::new(&config.rate_limit),
            inflight: InflightCoordinator::new(),
            backpressure: Backpressure::new(&config.backpressure),
            upstream: GeocoderClient::new(http, config.upstream.clone()),
            authorizer,
            persistence: Persistence::new(documents, config.persistence.clone()),
            metrics: ServiceMetrics::new(),
            ready: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            maintenance: Mutex::new(None),
            config,
        };
        Ok(GeocodeService {
            inner: Arc::new(inner),
        })
    }
}

impl GeocodeService {
    pub fn builder(config: GeocodeConfig) -> GeocodeServiceBuilder {
        GeocodeServiceBuilder {
            config,
            documents: None,
            http: None,
            authorizer: None,
        }
    }

    pub fn config(&self) -> &GeocodeConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &ServiceMetrics {
        &self.inner.metrics
    }

    /// True once the persisted state is loaded and until shutdown
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Restore the persisted cache and hotness documents
    pub async fn load(&self) -> LoadReport {
        let inner = &self.inner;
        let restored = inner
            .persistence
            .load(inner.config.cache.clone(), inner.config.cache.hotness_ttl)
            .await;
        {
            let mut store = inner.store.write();
            let mut hotness = inner.hotness.write();
            *store = restored.store;
            *hotness = restored.hotness;
        }
        if restored.hot_pruned > 0 {
            debug!("Pruned {} stale hotness records at startup", restored.hot_pruned);
        }
        inner.ready.store(true, Ordering::Release);
        restored.report
    }

    /// Load persisted state and spawn the maintenance task
    pub async fn start(&self) -> LoadReport {
        let report = self.load().await;
        let service = self.clone();
        let handle = tokio::spawn(async move { service.run_maintenance().await });
        *self.inner.maintenance.lock() = Some(handle);
        info!(
            "Geocoding cache started (maintenance every {:?})",
            self.inner.config.persistence.maintenance_interval
        );
        report
    }

    async fn run_maintenance(self) {
        let mut tick = interval(self.inner.config.persistence.maintenance_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.maintenance_tick().await {
                        error!("Maintenance flush failed: {}", e);
                    }
                }
                _ = self.inner.shutdown.cancelled() => {
                    info!("Maintenance task shutting down");
                    break;
                }
            }
        }
    }

    /// One maintenance pass: purge expired suppressions, evict, prune
    /// hotness and write back the documents that are due.
    #[instrument(skip(self))]
    pub async fn maintenance_tick(&self) -> Result<FlushReport> {
        let inner = &self.inner;
        let purged = inner.negative.purge_expired();
        let (evicted, pruned) = self.evict(Utc::now());
        self.publish_sizes();

        let report = inner
            .persistence
            .flush(&inner.store, &inner.hotness, false)
            .await?;
        debug!(
            purged,
            evicted,
            pruned,
            cache_saved = report.cache_saved,
            hotness_saved = report.hotness_saved,
            "Maintenance pass complete"
        );
        Ok(report)
    }

    /// Stop the maintenance task and write every dirty document
    pub async fn shutdown(&self) -> Result<FlushReport> {
        let inner = &self.inner;
        inner.shutdown.cancel();
        let handle = inner.maintenance.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Maintenance task ended abnormally: {}", e);
            }
        }
        inner.ready.store(false, Ordering::Release);

        let report = inner
            .persistence
            .flush(&inner.store, &inner.hotness, true)
            .await?;
        info!(
            "Final flush complete (cache: {}, hotness: {})",
            report.cache_saved, report.hotness_saved
        );
        Ok(report)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Resolve a coordinate to an address.
    #[instrument(skip(self, request), fields(lat = request.lat, lon = request.lon))]
    pub async fn lookup(
        &self,
        request: LookupRequest,
    ) -> std::result::Result<LookupOutcome, LookupError> {
        let inner = &self.inner;
        let language = self.language(request.language.as_deref())?;

        let privileged = inner
            .authorizer
            .is_privileged(request.principal.as_deref())
            .await;
        if inner.config.access.privileged_only && !privileged {
            return Err(LookupError::Forbidden);
        }

        validate(request.lat, request.lon)
            .map_err(|e| LookupError::InvalidInput(e.to_string()))?;
        let lat = quantize(request.lat);
        let lon = quantize(request.lon);
        let zoom = request.zoom.filter(|z| ZOOM_RANGE.contains(z));
        let force = request.force_refresh && privileged;

        if !force {
            if let Some(response) = self.serve_cached(&request, lat, lon, &language) {
                return Ok(LookupOutcome::Ready(response));
            }
        }

        let cell = GridCell::of(lat, lon);
        self.check_suppressed(cell)?;

        inner.metrics.record_miss();
        self.evict(Utc::now());

        let pending = inner.inflight.pending();
        let eta = inner.rate_limiter.eta(pending);
        let fetch = FetchRequest {
            lat: request.lat,
            lon: request.lon,
            zoom,
            language,
        };

        match inner.backpressure.decide(pending, eta, request.non_blocking) {
            Decision::Busy { retry_after } => {
                inner.metrics.record_busy();
                debug!(pending, ?eta, "Fetch backlog full");
                Err(LookupError::Busy {
                    retry_after,
                    eta,
                    pending,
                })
            }
            Decision::Queue { eta } => {
                let admission = self.admit(cell, lat, lon, fetch);
                inner.metrics.record_queued();
                debug!(
                    started = admission.is_started(),
                    ?eta,
                    "Miss answered as queued"
                );
                Ok(LookupOutcome::Queued(QueueTicket {
                    eta,
                    pending: inner.inflight.pending(),
                }))
            }
            Decision::Wait => {
                let completion = self.admit(cell, lat, lon, fetch).outcome().await;
                self.respond(completion, &request, lat, lon)
            }
        }
    }

    fn language(&self, raw: Option<&str>) -> std::result::Result<LanguageTag, LookupError> {
        LanguageTag::parse(raw, &self.inner.config.upstream.default_language)
            .map_err(|e| LookupError::InvalidInput(e.to_string()))
    }

    fn serve_cached(
        &self,
        request: &LookupRequest,
        lat: f64,
        lon: f64,
        language: &LanguageTag,
    ) -> Option<GeocodeResponse> {
        let inner = &self.inner;
        let hit = inner
            .store
            .read()
            .lookup(lat, lon, language, request.strict_language)?;

        let fallback = hit.kind == MatchKind::Fallback;
        inner.metrics.record_hit(hit.distance_m, fallback);
        inner.hotness.write().touch(hit.entry.hot_key(), Utc::now());
        debug!(distance_m = hit.distance_m, fallback, "Cache hit");

        let entry = hit.entry;
        let lang = if entry.lang.is_empty() {
            language.param().to_string()
        } else {
            entry.lang
        };
        Some(GeocodeResponse {
            lat,
            lon,
            query_lat: request.lat,
            query_lon: request.lon,
            address: entry.address,
            source: if fallback {
                Provenance::HitFallback
            } else {
                Provenance::Hit
            },
            cached_at: Some(entry.created_at),
            lang_cached: fallback.then(|| lang.clone()),
            lang,
            hit_distance_m: Some(round_to(hit.distance_m, 3)),
            cacheable: true,
        })
    }

    /// Fail fast while the upstream is suspended globally or for this cell
    fn check_suppressed(&self, cell: GridCell) -> std::result::Result<(), LookupError> {
        let inner = &self.inner;
        let wait = [inner.backoff.remaining(), inner.negative.remaining(cell)]
            .into_iter()
            .flatten()
            .max();
        match wait {
            Some(retry_after) => Err(LookupError::TemporarilyUnavailable { retry_after }),
            None => Ok(()),
        }
    }

    /// TTL and capacity eviction plus hotness pruning
    fn evict(&self, now: DateTime<Utc>) -> (usize, usize) {
        let inner = &self.inner;
        let mut store = inner.store.write();
        let mut hotness = inner.hotness.write();
        let evicted = store.maintain(&hotness, now);
        let pruned = hotness.prune(now, inner.config.cache.hotness_ttl);
        (evicted, pruned)
    }

    fn admit(&self, cell: GridCell, lat: f64, lon: f64, fetch: FetchRequest) -> Admission<Completion> {
        let service = self.clone();
        self.inner.inflight.start_or_join(cell, move || async move {
            service.fetch_and_apply(cell, lat, lon, fetch).await
        })
    }

    async fn fetch_and_apply(
        &self,
        cell: GridCell,
        lat: f64,
        lon: f64,
        fetch: FetchRequest,
    ) -> Completion {
        let inner = &self.inner;
        let waited = inner.rate_limiter.acquire().await;

        // A throttle reply may have arrived while this fetch was queued
        if let Some(retry_after) = inner.backoff.remaining() {
            debug!(%cell, "Dropping queued fetch, upstream backoff active");
            return Completion::Failed(LookupError::TemporarilyUnavailable { retry_after });
        }

        inner.metrics.record_fetch();
        debug!(%cell, ?waited, "Fetching from upstream");
        let outcome = inner.upstream.fetch(&fetch).await;
        self.apply(cell, lat, lon, &fetch.language, outcome)
    }

    fn apply(
        &self,
        cell: GridCell,
        lat: f64,
        lon: f64,
        language: &LanguageTag,
        outcome: FetchOutcome,
    ) -> Completion {
        let inner = &self.inner;
        match outcome {
            FetchOutcome::Address(address) => {
                let entry = CacheEntry::new(lat, lon, address, language, Utc::now());
                let evicted = {
                    let mut store = inner.store.write();
                    let hotness = inner.hotness.read();
                    store.insert(entry.clone(), &hotness)
                };
                inner.negative.clear_cell(cell);
                debug!(%cell, evicted, "Cached upstream result");
                Completion::Cached(entry)
            }
            FetchOutcome::NoData(address) => {
                inner
                    .negative
                    .suppress(cell, inner.config.backoff.no_data_ttl);
                debug!(%cell, "Upstream has no address here");
                Completion::Empty {
                    address,
                    language: language.param().to_string(),
                }
            }
            FetchOutcome::Failed(failure) => {
                let err = self.suppress_after(cell, failure);
                inner.metrics.record_failure(err.code());
                Completion::Failed(err)
            }
        }
    }

    /// Record the suppression a failed fetch calls for
    fn suppress_after(&self, cell: GridCell, failure: FetchFailure) -> LookupError {
        let inner = &self.inner;
        let cfg = &inner.config.backoff;
        let window = match &failure {
            FetchFailure::RateLimited { retry_after } => {
                throttle_window(*retry_after, cfg.negative_ttl, cfg.max_backoff)
            }
            other => other
                .retry_after()
                .unwrap_or(cfg.negative_ttl)
                .min(cfg.max_backoff),
        };
        inner.negative.suppress(cell, window);

        if failure.triggers_backoff() {
            inner.backoff.extend(window);
            warn!(%cell, ?window, "Suspending upstream traffic: {}", failure);
        } else {
            debug!(%cell, ?window, "Fetch failed: {}", failure);
        }

        match failure {
            FetchFailure::RateLimited { .. } => LookupError::RateLimited {
                retry_after: window,
            },
            other => LookupError::from(other),
        }
    }

    fn respond(
        &self,
        completion: Completion,
        request: &LookupRequest,
        lat: f64,
        lon: f64,
    ) -> std::result::Result<LookupOutcome, LookupError> {
        let (address, cached_at, lang, cacheable) = match completion {
            Completion::Cached(entry) => (entry.address, Some(entry.created_at), entry.lang, true),
            Completion::Empty { address, language } => (address, None, language, false),
            Completion::Failed(err) => return Err(err),
        };
        Ok(LookupOutcome::Ready(GeocodeResponse {
            lat,
            lon,
            query_lat: request.lat,
            query_lon: request.lon,
            address,
            source: Provenance::Fetched,
            cached_at,
            lang,
            lang_cached: None,
            hit_distance_m: None,
            cacheable,
        }))
    }

    // =========================================================================
    // Operator endpoints
    // =========================================================================

    /// Clear part of the state. `scope` is one of
    /// `cache|hot|hotness|neg|negative|backoff|metrics|all`.
    #[instrument(skip(self, principal))]
    pub async fn reset(
        &self,
        scope: &str,
        principal: Option<&str>,
    ) -> std::result::Result<ResetReport, LookupError> {
        let inner = &self.inner;
        if !inner.authorizer.is_privileged(principal).await {
            return Err(LookupError::Forbidden);
        }
        let scope: ResetScope = scope.parse()?;

        let mut report = ResetReport {
            action: scope,
            cache_len_before: None,
            hot_len_before: None,
            neg_len_before: None,
            backoff_cleared: false,
            metrics_cleared: false,
        };

        if scope.covers(ResetScope::Cache) {
            report.cache_len_before = Some(inner.store.write().clear());
            inner.persistence.request_flush(Document::Cache);
        }
        if scope.covers(ResetScope::Hotness) {
            report.hot_len_before = Some(inner.hotness.write().clear());
            inner.persistence.request_flush(Document::Hotness);
        }
        if scope.covers(ResetScope::Negative) {
            report.neg_len_before = Some(inner.negative.clear());
        }
        if scope.covers(ResetScope::Backoff) {
            inner.backoff.clear();
            report.backoff_cleared = true;
        }
        if scope.covers(ResetScope::Metrics) {
            inner.metrics.reset();
            inner.rate_limiter.reset_stats();
            report.metrics_cleared = true;
        }

        info!("Reset {}", scope);
        Ok(report)
    }

    /// Snapshot of counters, sizes and effective configuration
    pub async fn diagnostics(
        &self,
        principal: Option<&str>,
        language: Option<&str>,
    ) -> std::result::Result<Diagnostics, LookupError> {
        let inner = &self.inner;
        if !inner.authorizer.is_privileged(principal).await {
            return Err(LookupError::Forbidden);
        }
        let language = self.language(language)?;

        let counters = inner.metrics.snapshot();
        let (cache_len, index_cells, store_dirty) = {
            let store = inner.store.read();
            (store.len(), store.index_cells(), store.is_dirty())
        };
        let (hot_len, hot_dirty) = {
            let hotness = inner.hotness.read();
            (hotness.len(), hotness.is_dirty())
        };
        let pending = inner.inflight.pending();
        let rate_stats = inner.rate_limiter.stats();

        Ok(Diagnostics {
            hits: counters.hits,
            misses: counters.misses,
            hit_rate: round_to(counters.hit_rate(), 4),
            cache_len,
            index_cells,
            hot_len,
            store_dirty,
            hot_dirty,
            neg_cells: inner.negative.len(),
            pending,
            backlog_eta: inner.rate_limiter.eta(pending).as_secs(),
            rl_age: inner.rate_limiter.age().map(|age| round_to(age.as_secs_f64(), 3)),
            backoff_remaining: inner
                .backoff
                .remaining()
                .map(|left| left.as_secs())
                .unwrap_or(0),
            avg_hit_distance_m: counters.avg_hit_distance_m.map(|d| round_to(d, 3)),
            avg_rate_limit_wait_s: rate_stats
                .average()
                .map(|wait| round_to(wait.as_secs_f64(), 3)),
            queued: counters.queued,
            busy: counters.busy,
            upstream_fetches: counters.fetches,
            upstream_failures: counters.fetch_failures,
            cfg_rl_min_interval: inner.rate_limiter.min_interval().as_secs_f64(),
            cfg_radius_m: inner.config.cache.radius_m,
            cfg_per_cell_max: inner.config.cache.per_cell_max,
            cfg_max_entries: inner.config.cache.max_entries,
            cfg_max_pending_misses: inner.backpressure.max_pending(),
            cfg_nom_email: inner.config.upstream.contact().map(str::to_string),
            lang: language.param().to_string(),
        })
    }

    /// Push current sizes to the exported gauges
    pub fn publish_sizes(&self) {
        let inner = &self.inner;
        let cache_len = inner.store.read().len();
        let hot_len = inner.hotness.read().len();
        inner.metrics.set_sizes(
            cache_len,
            hot_len,
            inner.negative.len(),
            inner.inflight.pending(),
        );
    }

    /// Number of fetches running or waiting for the rate limiter
    pub fn pending(&self) -> usize {
        self.inner.inflight.pending()
    }

    /// Remaining global backoff
    pub fn backoff_remaining(&self) -> Option<Duration> {
        self.inner.backoff.remaining()
    }
}
