use crate::error::{error_response, route_not_found, GatewayErrorCode};
use crate::routing::{RouteMatch, RoutingTable};
use crate::upstream::{ForwardedBody, PoolConfig, UpstreamClient, UpstreamError, UpstreamStats};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Content type assumed for a forwarded body that declares none
const DEFAULT_BODY_CONTENT_TYPE: &str = "application/json";

/// State shared by every connection; the routing table is never mutated
struct RouterState {
    table: Arc<RoutingTable>,
    upstream: UpstreamClient,
    upstream_timeout: Option<Duration>,
}

/// The HTTP front of the gateway
pub struct GatewayServer {
    listener: TcpListener,
    state: Arc<RouterState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    /// Bind the listener; requests are served once [`run`](Self::run) is awaited
    pub async fn bind(
        addr: SocketAddr,
        table: Arc<RoutingTable>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> std::io::Result<Self> {
        Self::with_pool_config(addr, table, shutdown_rx, PoolConfig::default(), None).await
    }

    pub async fn with_pool_config(
        addr: SocketAddr,
        table: Arc<RoutingTable>,
        shutdown_rx: watch::Receiver<bool>,
        pool_config: PoolConfig,
        upstream_timeout: Option<Duration>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(RouterState {
                table,
                upstream: UpstreamClient::new(pool_config),
                upstream_timeout,
            }),
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn upstream_stats(&self) -> Arc<UpstreamStats> {
        self.state.upstream.stats()
    }

    /// Accept connections until shutdown is signalled
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(
            addr = %addr,
            routes = self.state.table.len(),
            pool_max_idle = self.state.upstream.config().max_idle_per_host,
            "Gateway listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, state).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<RouterState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<RouterState>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Only used to correlate log lines, never forwarded
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = req.method().clone();
    let normalized_method = method.as_str().to_lowercase();
    let url = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    debug!(request_id, method = %method, url, client = %client_addr, "Incoming request");

    let endpoint = match state.table.resolve(&normalized_method, req.uri().path()) {
        RouteMatch::Found { endpoint, params } => {
            debug!(
                request_id,
                template = %endpoint.template,
                params = ?params,
                "Route matched"
            );
            endpoint
        }
        RouteMatch::NotFound => {
            info!(request_id, method = %method, url, "No route for request");
            return Ok(route_not_found(method.as_str(), &url));
        }
    };

    let upstream_url = endpoint.upstream_url(&url);
    info!(
        request_id,
        service = %endpoint.service,
        method = %method,
        url,
        upstream = %upstream_url,
        "Mapped request"
    );

    let authorization = req.headers().get(AUTHORIZATION).cloned();
    let body = if forwards_body(&normalized_method) {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_BODY_CONTENT_TYPE));
        let bytes = req.into_body().collect().await?.to_bytes();
        Some(ForwardedBody {
            bytes,
            content_type,
        })
    } else {
        None
    };

    let call = state
        .upstream
        .send(method.clone(), &upstream_url, authorization, body);

    let result = match state.upstream_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    request_id,
                    service = %endpoint.service,
                    timeout_secs = timeout.as_secs(),
                    "Upstream request timed out"
                );
                return Ok(error_response(
                    GatewayErrorCode::UpstreamTimeout,
                    format!(
                        "Upstream service '{}' at {} did not respond within {} seconds",
                        endpoint.service,
                        endpoint.target_host,
                        timeout.as_secs()
                    ),
                ));
            }
        },
        None => call.await,
    };

    match result {
        Ok(response) => {
            debug!(request_id, status = %response.status(), "Upstream responded");
            Ok(relay_response(response))
        }
        Err(UpstreamError::RequestBuild(e)) => {
            error!(request_id, upstream = %upstream_url, error = %e, "Failed to build upstream request");
            Ok(error_response(
                GatewayErrorCode::InternalError,
                format!("Could not forward request to {}", upstream_url),
            ))
        }
        Err(e) => {
            let detail = error_chain(&e);
            error!(
                request_id,
                service = %endpoint.service,
                upstream = %upstream_url,
                error = %detail,
                "Upstream unavailable"
            );
            Ok(error_response(
                GatewayErrorCode::UpstreamUnavailable,
                format!(
                    "Upstream service '{}' at {} is unavailable: {}",
                    endpoint.service, endpoint.target_host, detail
                ),
            ))
        }
    }
}

/// Methods whose request body is forwarded upstream
fn forwards_body(method: &str) -> bool {
    matches!(method, "post" | "put" | "patch")
}

/// Keep the upstream status, content type and body; drop everything else
fn relay_response(
    upstream: Response<BoxBody<Bytes, hyper::Error>>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let (parts, body) = upstream.into_parts();
    let mut response = Response::new(body);
    *response.status_mut() = parts.status;
    if let Some(content_type) = parts.headers.get(CONTENT_TYPE) {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, content_type.clone());
    }
    response
}

/// Render an error with all of its sources, e.g. `client error (Connect): tcp connect error: ...`
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
