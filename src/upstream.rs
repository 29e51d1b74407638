//! Pooled HTTP client for the service runtimes
//!
//! Connections to each runtime are kept alive and reused between requests.

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Error type for upstream calls
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// Connection refused, reset, DNS failure and the like
    #[error("{0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// The upstream request could not be built
    #[error("invalid upstream request: {0}")]
    RequestBuild(#[from] hyper::http::Error),
}

/// Statistics for upstream calls
#[derive(Debug, Default)]
pub struct UpstreamStats {
    pub total_requests: AtomicU64,
    pub failed_requests: AtomicU64,
}

impl UpstreamStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per service runtime
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A request body forwarded to a runtime, with its content type
#[derive(Debug, Clone)]
pub struct ForwardedBody {
    pub bytes: Bytes,
    pub content_type: HeaderValue,
}

/// Pooled client forwarding requests to service runtimes
pub struct UpstreamClient {
    client: Client<HttpConnector, BoxBody<Bytes, hyper::Error>>,
    stats: Arc<UpstreamStats>,
    config: PoolConfig,
}

impl UpstreamClient {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(UpstreamStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<UpstreamStats> {
        Arc::clone(&self.stats)
    }

    /// Send a request to `url`
    ///
    /// Only the `Authorization` header and, when present, the body with its
    /// content type are forwarded.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        authorization: Option<HeaderValue>,
        body: Option<ForwardedBody>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, UpstreamError> {
        let mut builder = Request::builder().method(method).uri(url);

        if let Some(value) = authorization {
            builder = builder.header(AUTHORIZATION, value);
        }

        let body = match body {
            Some(forwarded) => {
                builder = builder.header(CONTENT_TYPE, forwarded.content_type);
                Full::new(forwarded.bytes)
                    .map_err(|never| match never {})
                    .boxed()
            }
            None => Empty::<Bytes>::new().map_err(|never| match never {}).boxed(),
        };

        let request = builder.body(body)?;

        self.stats.record_request();
        let response = match self.client.request(request).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}
