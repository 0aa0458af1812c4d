//! HTTP transport implementation.
//!
//! This module provides an HTTP-based transport for the sync engine.
//! The actual HTTP client is abstracted via a trait so tests and embedders
//! can substitute their own; [`ReqwestClient`] is the stock implementation.

use crate::error::{SyncError, SyncResult};
use crate::transport::{check_status, SyncTransport};
use recsync_protocol::{BatchRequest, ReadRequest, ReadResponse, WriteResponse};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// An outgoing POST request.
#[derive(Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Full URL without query string.
    pub url: String,
    /// Bearer token, `None` when anonymous.
    pub bearer: Option<String>,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// `text/plain` body.
    pub body: String,
}

impl std::fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequest")
            .field("url", &self.url)
            .field("bearer", &self.bearer.as_ref().map(|_| "[REDACTED]"))
            .field("query", &self.query)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// A received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body text.
    pub body: String,
}

/// HTTP client abstraction.
///
/// Returns `Err` only when no response was received at all.
pub trait HttpClient: Send + Sync + 'static {
    /// Sends a POST request.
    fn post(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, String>> + Send;
}

/// HTTP-based sync transport.
#[derive(Debug)]
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the sync server (e.g., "https://sync.example.com").
    base_url: String,
    /// HTTP client implementation.
    client: C,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post_to(
        &self,
        table: &str,
        op: &str,
        credential: &str,
        version: u32,
        view: &str,
    ) -> HttpRequest {
        HttpRequest {
            url: format!("{}/{}/{}", self.base_url, table, op),
            bearer: (!credential.is_empty()).then(|| credential.to_string()),
            query: vec![
                ("version".to_string(), version.to_string()),
                ("view".to_string(), view.to_string()),
            ],
            body: String::new(),
        }
    }

    async fn send(&self, request: HttpRequest) -> SyncResult<String> {
        let url = request.url.clone();
        let response = self
            .client
            .post(request)
            .await
            .map_err(SyncError::transport_retryable)?;
        debug!(url = %url, status = response.status, "sync request answered");
        check_status(response.status, response.body)
    }

    fn batch(&self, request: &BatchRequest, op: &str) -> HttpRequest {
        let mut http = self.post_to(
            &request.table,
            op,
            &request.credential,
            request.version,
            &request.view,
        );
        http.body = request.batch.encode();
        http
    }
}

impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    async fn create_or_update(&self, request: &BatchRequest) -> SyncResult<WriteResponse> {
        let body = self.send(self.batch(request, "create_update")).await?;
        Ok(WriteResponse::parse(&body)?)
    }

    async fn delete(&self, request: &BatchRequest) -> SyncResult<()> {
        self.send(self.batch(request, "delete")).await?;
        Ok(())
    }

    async fn read(&self, request: &ReadRequest) -> SyncResult<ReadResponse> {
        let mut http = self.post_to(
            &request.table,
            "read",
            &request.credential,
            request.version,
            &request.view,
        );
        http.query
            .push(("last_timestamp".to_string(), request.last_timestamp_param()));
        let body = self.send(http).await?;
        Ok(ReadResponse::parse(&body)?)
    }
}

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with a per-request timeout.
    pub fn new(timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        let mut builder = self
            .client
            .post(&request.url)
            .query(&request.query)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(request.body);
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| e.to_string())?;
        Ok(HttpResponse { status, body })
    }
}
