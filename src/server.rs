//! HTTP Front
//!
//! Plain hyper http1 server exposing the service:
//!
//! | Path                  | Purpose                                        |
//! |-----------------------|------------------------------------------------|
//! | `/api/reverse_geocode`| lookup, `reset=<scope>`, `metrics=1`           |
//! | `/healthz`            | liveness                                       |
//! | `/readyz`             | 200 once persisted state is loaded             |
//! | `/metrics`            | Prometheus text exposition                     |
//!
//! Lookup query parameters: `lat`, `lon`, `lang`, `zoom`, `force=1`,
//! `lang_strict=1`, `nowait=1`. The caller principal is the bearer token of
//! the `Authorization` header.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cache::quantize::parse_coordinate;
use crate::error::{Error, Result};
use crate::metrics;
use crate::service::{GeocodeService, LookupError, LookupOutcome, LookupRequest, ResponseMeta};

/// Lookup endpoint path
pub const LOOKUP_PATH: &str = "/api/reverse_geocode";

const X_CACHE: &str = "x-cache";
const X_CACHE_DIST: &str = "x-cache-dist-m";
const X_QUEUE_ETA: &str = "x-queue-eta";
const X_PENDING: &str = "x-pending-misses";

const EXPOSED_HEADERS: &str =
    "Retry-After, X-Cache, X-Cache-Dist-M, X-Queue-ETA, X-Pending-Misses, Content-Language";

// =============================================================================
// Server loop
// =============================================================================

/// Bind `addr`
pub async fn bind(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Config(format!("Invalid listen address {}: {}", addr, e)))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    info!("Listening on {}", addr);
    Ok(listener)
}

/// Accept connections until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    service: GeocodeService,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted
                .map_err(|e| Error::Internal(format!("Accept error: {}", e)))?,
            _ = shutdown.cancelled() => {
                info!("HTTP server shutting down");
                return Ok(());
            }
        };

        let io = TokioIo::new(stream);
        let service = service.clone();
        tokio::spawn(async move {
            let handler = service_fn(move |req: Request<hyper::body::Incoming>| {
                let service = service.clone();
                async move { Ok::<_, Infallible>(handle(&service, req).await) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                debug!("Connection from {} ended with error: {}", peer, e);
            }
        });
    }
}

// =============================================================================
// Routing
// =============================================================================

/// Route one request
pub async fn handle<B>(service: &GeocodeService, req: Request<B>) -> Response<Full<Bytes>> {
    let (parts, _body) = req.into_parts();
    if parts.method != Method::GET && parts.method != Method::HEAD {
        return text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }
    match parts.uri.path() {
        "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
        "/readyz" if service.is_ready() => text(StatusCode::OK, "ok"),
        "/readyz" => text(StatusCode::SERVICE_UNAVAILABLE, "loading"),
        "/metrics" => {
            service.publish_sizes();
            let mut response = text(StatusCode::OK, metrics::render());
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        LOOKUP_PATH => {
            let params = parse_query(parts.uri.query().unwrap_or_default());
            let principal = bearer_token(&parts.headers);
            reverse_geocode(service, params, principal).await
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn reverse_geocode(
    service: &GeocodeService,
    params: HashMap<String, String>,
    principal: Option<String>,
) -> Response<Full<Bytes>> {
    let lang = params.get("lang").map(|l| l.trim()).filter(|l| !l.is_empty());
    let flag = |name: &str| params.get(name).map(String::as_str) == Some("1");

    if let Some(scope) = params.get("reset") {
        return match service.reset(scope, principal.as_deref()).await {
            Ok(report) => json_response(StatusCode::OK, &report, None),
            Err(e) => error_response(&e),
        };
    }
    if flag("metrics") {
        return match service.diagnostics(principal.as_deref(), lang).await {
            Ok(diagnostics) => json_response(StatusCode::OK, &diagnostics, None),
            Err(e) => error_response(&e),
        };
    }

    let coordinate = |name: &str| {
        let raw = params.get(name).map(String::as_str).unwrap_or_default();
        parse_coordinate(raw).map_err(|e| LookupError::InvalidInput(format!("{}: {}", name, e)))
    };
    let (lat, lon) = match (coordinate("lat"), coordinate("lon")) {
        (Ok(lat), Ok(lon)) => (lat, lon),
        (Err(e), _) | (_, Err(e)) => return error_response(&e),
    };

    let request = LookupRequest {
        lat,
        lon,
        language: lang.map(str::to_string),
        zoom: params.get("zoom").and_then(|z| z.trim().parse().ok()),
        force_refresh: flag("force"),
        strict_language: flag("lang_strict"),
        non_blocking: flag("nowait"),
        principal,
    };

    match service.lookup(request).await {
        Ok(outcome) => {
            let meta = outcome.meta();
            match outcome {
                LookupOutcome::Ready(response) => {
                    json_response(StatusCode::OK, &response, Some(&meta))
                }
                LookupOutcome::Queued(ticket) => {
                    let body = json!({
                        "error": "queued",
                        "retry_after": ticket.retry_after(),
                        "eta": ticket.eta.as_secs(),
                        "pending": ticket.pending,
                    });
                    json_response(StatusCode::ACCEPTED, &body, Some(&meta))
                }
            }
        }
        Err(e) => error_response(&e),
    }
}

// =============================================================================
// Response helpers
// =============================================================================

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

fn json_response<T: serde::Serialize>(
    status: StatusCode,
    body: &T,
    meta: Option<&ResponseMeta>,
) -> Response<Full<Bytes>> {
    let bytes = match serde_json::to_vec(body) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            return text(StatusCode::INTERNAL_SERVER_ERROR, "internal error");
        }
    };
    let mut response = text(status, bytes);
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::VARY, HeaderValue::from_static("Accept-Language"));
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSED_HEADERS),
    );
    if let Some(meta) = meta {
        apply_meta(headers, meta);
    }
    response
}

fn apply_meta(headers: &mut HeaderMap, meta: &ResponseMeta) {
    headers.insert(X_CACHE, HeaderValue::from_static(meta.cache));
    // Only the preferred language; the fallback list stays in the body
    let primary = meta.language.split(',').next().unwrap_or_default().trim();
    if !primary.is_empty() {
        if let Ok(lang) = HeaderValue::from_str(primary) {
            headers.insert(header::CONTENT_LANGUAGE, lang);
        }
    }
    if let Some(distance) = meta.hit_distance_m {
        if let Ok(value) = HeaderValue::from_str(&format!("{:.3}", distance)) {
            headers.insert(X_CACHE_DIST, value);
        }
    }
    if let Some(retry_after) = meta.retry_after {
        headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    }
    if let Some(eta) = meta.queue_eta {
        headers.insert(X_QUEUE_ETA, HeaderValue::from(eta));
    }
    if let Some(pending) = meta.pending {
        headers.insert(X_PENDING, HeaderValue::from(pending));
    }
}

fn error_response(err: &LookupError) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(err.status_class()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut body = json!({
        "error": err.code(),
        "message": err.to_string(),
    });
    let mut meta = ResponseMeta {
        cache: "miss",
        retry_after: err.retry_after(),
        ..Default::default()
    };
    if let Some(retry_after) = meta.retry_after {
        body["retry_after"] = json!(retry_after);
    }
    if let LookupError::Busy { eta, pending, .. } = err {
        body["eta"] = json!(eta.as_secs());
        body["pending"] = json!(pending);
        meta.queue_eta = Some(eta.as_secs());
        meta.pending = Some(*pending);
    }
    json_response(status, &body, Some(&meta))
}

// =============================================================================
// Request helpers
// =============================================================================

/// Decode a query string; the last occurrence of a key wins
pub fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            let key = urlencoding::decode(&key.replace('+', " ")).ok()?.into_owned();
            let value = urlencoding::decode(&value.replace('+', " ")).ok()?.into_owned();
            Some((key, value))
        })
        .collect()
}

/// Bearer token of the `Authorization` header
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    (scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty())
        .then(|| token.trim().to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use http_body_util::BodyExt;

    use super::*;
    use crate::adapters::StaticTokenAuthorizer;
    use crate::config::GeocodeConfig;
    use crate::domain::ports::{HttpClient, HttpReply, HttpRequest, TransportError};

    struct Madrid(AtomicUsize);

    #[async_trait]
    impl HttpClient for Madrid {
        async fn get(
            &self,
            _request: HttpRequest,
        ) -> std::result::Result<HttpReply, TransportError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(HttpReply::json(
                200,
                r#"{"display_name":"Madrid","address":{"city":"Madrid"}}"#,
            ))
        }
    }

    fn service() -> GeocodeService {
        GeocodeService::builder(GeocodeConfig::default())
            .http(Arc::new(Madrid(AtomicUsize::new(0))))
            .authorizer(Arc::new(StaticTokenAuthorizer::new(["s3cret"])))
            .build()
            .unwrap()
    }

    fn get(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    async fn body_json(response: Response<Full<Bytes>>) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_parse_query() {
        let params = parse_query("lat=40%2C4168&lon=-3.7038&lang=pt_BR&flag&x=a+b");
        assert_eq!(params["lat"], "40,4168");
        assert_eq!(params["lon"], "-3.7038");
        assert_eq!(params["lang"], "pt_BR");
        assert_eq!(params["flag"], "");
        assert_eq!(params["x"], "a b");
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("s3cret"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_headers() {
        let svc = service();
        let uri = "/api/reverse_geocode?lat=40.4168&lon=-3.7038&lang=es";

        let miss = handle(&svc, get(uri)).await;
        assert_eq!(miss.status(), StatusCode::OK);
        assert_eq!(miss.headers()[X_CACHE], "miss");
        assert_eq!(miss.headers()[header::CACHE_CONTROL], "no-store");
        assert_eq!(miss.headers()[header::CONTENT_LANGUAGE], "es");

        let hit = handle(&svc, get(uri)).await;
        assert_eq!(hit.headers()[X_CACHE], "hit");
        assert_eq!(hit.headers()[X_CACHE_DIST], "0.000");
        let body = body_json(hit).await;
        assert_eq!(body["source"], "hit");
        assert_eq!(body["lang"], "es,en");
        assert_eq!(body["address"]["address"]["city"], "Madrid");
    }

    #[tokio::test]
    async fn test_bad_coordinates() {
        let svc = service();
        let response = handle(&svc, get("/api/reverse_geocode?lat=abc&lon=1")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "bad_input");

        let response = handle(&svc, get("/api/reverse_geocode?lat=95&lon=1")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_operator_endpoints_need_token() {
        let svc = service();
        let response = handle(&svc, get("/api/reverse_geocode?metrics=1")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let request = Request::builder()
            .uri("/api/reverse_geocode?reset=neg")
            .header(header::AUTHORIZATION, "Bearer s3cret")
            .body(())
            .unwrap();
        let response = handle(&svc, request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["action"], "neg");

        let request = Request::builder()
            .uri("/api/reverse_geocode?reset=bogus")
            .header(header::AUTHORIZATION, "Bearer s3cret")
            .body(())
            .unwrap();
        assert_eq!(handle(&svc, request).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_probes() {
        let svc = service();
        assert_eq!(handle(&svc, get("/healthz")).await.status(), StatusCode::OK);
        assert_eq!(
            handle(&svc, get("/readyz")).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        svc.load().await;
        assert_eq!(handle(&svc, get("/readyz")).await.status(), StatusCode::OK);
        assert_eq!(handle(&svc, get("/nope")).await.status(), StatusCode::NOT_FOUND);

        let metrics = handle(&svc, get("/metrics")).await;
        assert_eq!(metrics.status(), StatusCode::OK);
    }
}
