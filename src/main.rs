//! geocache server
//!
//! Reverse geocoding cache in front of a Nominatim-compatible upstream.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            geocache                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    hyper     │───▶│   Geocode    │───▶│   Upstream   │       │
//! │  │   server     │    │   Service    │    │  (Nominatim) │       │
//! │  └──────────────┘    └──────┬───────┘    └──────────────┘       │
//! │                             ▼                                    │
//! │                      ┌──────────────┐                            │
//! │                      │ JSON files   │                            │
//! │                      │ (data dir)   │                            │
//! │                      └──────────────┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use geocache::adapters::{AllowAll, JsonFileStore, ReqwestHttpClient, StaticTokenAuthorizer};
use geocache::config::format_duration;
use geocache::domain::ports::Authorizer;
use geocache::{server, GeocodeConfig, GeocodeService};

// =============================================================================
// CLI Arguments
// =============================================================================

/// geocache - Spatial caching front for reverse geocoding
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP bind address
    #[arg(long, env = "GEOCACHE_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Directory holding the persisted cache and hotness documents
    #[arg(long, env = "GEOCACHE_DATA_DIR", default_value = "./data")]
    data_dir: String,

    /// YAML configuration file
    #[arg(long, env = "GEOCACHE_CONFIG")]
    config: Option<String>,

    /// Bearer tokens accepted as privileged principals (comma separated)
    #[arg(long, env = "GEOCACHE_ADMIN_TOKENS", value_delimiter = ',')]
    admin_tokens: Vec<String>,

    /// Contact email sent to the upstream
    #[arg(long, env = "NOMINATIM_EMAIL")]
    contact_email: Option<String>,

    /// Upstream reverse endpoint
    #[arg(long, env = "NOMINATIM_URL")]
    upstream_url: Option<String>,

    /// Minimum spacing between upstream requests in milliseconds
    #[arg(long, env = "GEOCACHE_RL_MIN_INTERVAL_MS")]
    min_interval_ms: Option<u64>,

    /// Outstanding miss ceiling before requests are rejected as busy
    #[arg(long, env = "GEOCACHE_MAX_PENDING")]
    max_pending: Option<usize>,

    /// Treat every caller as privileged
    #[arg(long, env = "GEOCACHE_ALLOW_ALL")]
    allow_all: bool,

    /// Restrict lookups to privileged principals
    #[arg(long, env = "GEOCACHE_PRIVILEGED_ONLY")]
    privileged_only: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Load the configuration file (or defaults) and apply command line overrides
    fn geocode_config(&self) -> anyhow::Result<GeocodeConfig> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading configuration from {}", path);
                GeocodeConfig::from_yaml_file(path)
                    .with_context(|| format!("Failed to load configuration from {}", path))?
            }
            None => GeocodeConfig::default(),
        };

        if let Some(email) = &self.contact_email {
            config.upstream.contact_email = Some(email.clone());
        }
        if let Some(url) = &self.upstream_url {
            config.upstream.url = url.clone();
        }
        if let Some(ms) = self.min_interval_ms {
            config.rate_limit.min_interval = Duration::from_millis(ms);
        }
        if let Some(max_pending) = self.max_pending {
            config.backpressure.max_pending = max_pending;
        }
        if self.privileged_only {
            config.access.privileged_only = true;
        }

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args.geocode_config().context("Invalid configuration")?;

    info!("Starting geocache");
    info!("  Upstream: {}", config.upstream.url);
    info!(
        "  Rate limit: one request per {}",
        format_duration(config.rate_limit.min_interval)
    );
    info!(
        "  Cache: radius {} m, ttl {}, max {} entries",
        config.cache.radius_m,
        format_duration(config.cache.ttl),
        config.cache.max_entries
    );
    info!("  Max pending misses: {}", config.backpressure.max_pending);
    info!("  Data directory: {}", args.data_dir);
    if config.upstream.contact_email.is_none() {
        warn!("No contact email configured; public Nominatim instances may refuse requests");
    }

    let authorizer: Arc<dyn Authorizer> = if args.allow_all {
        warn!("Every caller is treated as privileged");
        Arc::new(AllowAll)
    } else {
        if args.admin_tokens.is_empty() {
            warn!("No admin tokens configured; reset and diagnostics are unavailable");
        }
        Arc::new(StaticTokenAuthorizer::new(args.admin_tokens.iter()))
    };

    let service = GeocodeService::builder(config)
        .store(Arc::new(JsonFileStore::new(&args.data_dir)))
        .http(Arc::new(
            ReqwestHttpClient::new().context("Failed to create upstream HTTP client")?,
        ))
        .authorizer(authorizer)
        .build()
        .context("Failed to build geocoding service")?;

    let report = service.start().await;
    info!("Service ready with {} cached entries", report.loaded);

    let listener = server::bind(&args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    let shutdown = CancellationToken::new();
    let server_handle = {
        let service = service.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server::serve(listener, service, shutdown).await {
                error!("HTTP server error: {}", e);
            }
        })
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");

    shutdown.cancel();
    if let Err(e) = server_handle.await {
        error!("HTTP server task failed: {}", e);
    }
    service
        .shutdown()
        .await
        .context("Final flush failed")?;

    info!("geocache shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=info".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
