//! Reqwest HTTP Client Adapter
//!
//! Implements the `HttpClient` port with `reqwest`. The body is read chunk by
//! chunk and cut at `max_body_bytes`, so an oversized payload never lands in
//! memory whole.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::Client;
use tracing::trace;

use crate::domain::ports::{HttpClient, HttpReply, HttpRequest, TransportError};
use crate::error::{Error, Result};

/// Connect timeout for the upstream connection pool.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// HTTP client adapter backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    /// Create a new client.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(Error::HttpClient)?;
        Ok(Self { client })
    }

    async fn exchange(&self, request: HttpRequest) -> std::result::Result<HttpReply, TransportError> {
        let mut builder = self.client.get(&request.url).query(&request.query);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let mut response = builder.send().await.map_err(|e| map_error(e, request.timeout))?;

        let status = response.status().as_u16();
        let header = |name| {
            response
                .headers()
                .get(name)
                .and_then(|v: &reqwest::header::HeaderValue| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header(CONTENT_TYPE);
        let retry_after = header(RETRY_AFTER);
        let content_length = response.content_length();

        let mut body = BytesMut::new();
        let mut truncated = false;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| map_error(e, request.timeout))?
        {
            if body.len() + chunk.len() > request.max_body_bytes {
                let room = request.max_body_bytes.saturating_sub(body.len());
                body.extend_from_slice(&chunk[..room]);
                truncated = true;
                break;
            }
            body.extend_from_slice(&chunk);
        }

        trace!(status, bytes = body.len(), truncated, "Upstream reply read");

        Ok(HttpReply {
            status,
            content_type,
            content_length,
            retry_after,
            body: body.freeze(),
            truncated,
        })
    }
}

fn map_error(error: reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Failed(error.to_string())
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, request: HttpRequest) -> std::result::Result<HttpReply, TransportError> {
        let timeout = request.timeout;
        match tokio::time::timeout(timeout, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}
