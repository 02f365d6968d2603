//! HTTP Reverse Proxy for local server forwarding
//!
//! The tunnel process forwards the relay's traffic to this proxy rather than
//! to the user's service directly, so every exchange can be measured. The
//! proxy:
//! - forwards requests with streamed bodies to `localhost:<target port>`
//! - strips hop-by-hop headers in both directions
//! - rewrites `Host` and appends the `X-Forwarded-*` chain
//! - hands WebSocket upgrades to [`crate::websocket`]
//! - reports one [`HttpRequest`] per exchange, including failed ones (502)

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::error::Error as StdError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics::HttpRequest;
use crate::stats::StatsTracker;
use crate::websocket::{self, WebSocketRegistry};

/// Headers that only apply to a single transport hop
pub const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PORT: &str = "x-forwarded-port";

/// Public traffic always reaches the relay over TLS on 443
const PUBLIC_PORT: &str = "443";

/// Proxy errors
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Failed to bind proxy listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("Invalid target address: {0}")]
    InvalidTarget(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Host the user's service listens on
    pub target_host: String,
    /// Port the user's service listens on
    pub target_port: u16,
    /// Address the proxy listens on
    pub bind_host: IpAddr,
    /// Port to try first; 0 lets the OS choose
    pub preferred_port: u16,
}

impl ProxyConfig {
    /// Proxy in front of `localhost:<target_port>`
    pub fn for_target(target_port: u16) -> Self {
        Self {
            target_host: "localhost".to_string(),
            target_port,
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            preferred_port: preferred_proxy_port(target_port),
        }
    }

    /// `host:port` of the user's service
    pub fn target_authority(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

/// Port the proxy tries first for a given target port
///
/// Offset from the target so the two are easy to tell apart; 0 (ephemeral)
/// when the offset would not fit.
pub fn preferred_proxy_port(target_port: u16) -> u16 {
    target_port.checked_add(10_000).unwrap_or(0)
}

/// Forwarding target resolved once at startup
#[derive(Debug)]
pub(crate) struct Target {
    pub(crate) authority: String,
    pub(crate) host_header: HeaderValue,
}

#[derive(Clone)]
struct ProxyState {
    target: Arc<Target>,
    client: Client<HttpConnector, Body>,
    stats: Arc<StatsTracker>,
    events: mpsc::UnboundedSender<HttpRequest>,
    websockets: WebSocketRegistry,
}

/// Running local reverse proxy
pub struct LocalProxy {
    local_addr: SocketAddr,
    websockets: WebSocketRegistry,
    server: JoinHandle<()>,
}

impl LocalProxy {
    /// Bind the listener and start serving
    ///
    /// Returns the proxy and the stream of completed-request records.
    pub async fn start(
        config: ProxyConfig,
        stats: Arc<StatsTracker>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HttpRequest>), ProxyError> {
        let authority = config.target_authority();
        let host_header = HeaderValue::from_str(&authority)
            .map_err(|_| ProxyError::InvalidTarget(authority.clone()))?;

        let listener = bind_listener(config.bind_host, config.preferred_port).await?;
        let local_addr = listener.local_addr().map_err(ProxyError::Bind)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let websockets = WebSocketRegistry::default();

        let state = ProxyState {
            target: Arc::new(Target {
                authority,
                host_header,
            }),
            client: Client::builder(TokioExecutor::new()).build_http(),
            stats,
            events: events_tx,
            websockets: websockets.clone(),
        };

        let app = Router::new().fallback(proxy_handler).with_state(state);

        let server = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service).await {
                error!("Proxy server error: {}", e);
            }
        });

        info!(
            "Local proxy listening on {} -> {}",
            local_addr,
            config.target_authority()
        );

        Ok((
            Self {
                local_addr,
                websockets,
                server,
            },
            events_rx,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Number of WebSockets currently relayed
    pub fn active_websockets(&self) -> usize {
        self.websockets.len()
    }

    /// Stop accepting connections
    ///
    /// Connections already accepted keep running until they finish or fail.
    pub fn stop(&self) {
        if !self.server.is_finished() {
            debug!("Stopping local proxy on {}", self.local_addr);
        }
        self.server.abort();
    }
}

impl Drop for LocalProxy {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Bind the preferred port, falling back to an OS-chosen one
pub async fn bind_listener(host: IpAddr, preferred_port: u16) -> Result<TcpListener, ProxyError> {
    if preferred_port != 0 {
        match TcpListener::bind((host, preferred_port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => warn!(
                "Port {} already in use ({}), finding available port...",
                preferred_port, e
            ),
        }
    }

    TcpListener::bind((host, 0)).await.map_err(ProxyError::Bind)
}

async fn proxy_handler(
    State(state): State<ProxyState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    if is_websocket_upgrade(request.headers()) {
        return websocket::handle_upgrade(request, state.target.clone(), state.websockets.clone())
            .await;
    }
    state.forward(peer, request).await
}

impl ProxyState {
    async fn forward(&self, peer: SocketAddr, request: Request) -> Response {
        let started = Instant::now();
        let timestamp = Utc::now();
        let in_flight = self.stats.mark_in_flight();

        let method = request.method().clone();
        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        debug!("📤 Proxying {} {} to {}", method, path, self.target.authority);

        let (parts, body) = request.into_parts();
        let headers = forwarded_request_headers(&parts.headers, peer.ip(), &self.target.host_header);

        let result = self.send_upstream(method.clone(), &path, headers, body).await;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let response = match result {
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                sanitize_response_headers(&mut parts.headers);

                // Count the request as open until the body has been streamed
                let body = body.map_frame(move |frame| {
                    let _ = &in_flight;
                    frame
                });
                Response::from_parts(parts, Body::new(body))
            }
            Err(e) => {
                warn!("Proxy error for {} {}: {}", method, path, e);
                in_flight.complete();
                bad_gateway(&e)
            }
        };

        let status = response.status();
        debug!(
            "📥 Response {} {} -> {} ({:.1}ms)",
            method,
            path,
            status.as_u16(),
            duration_ms
        );

        let _ = self.events.send(HttpRequest {
            timestamp,
            method: method.to_string(),
            path,
            status_code: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            duration_ms,
        });

        response
    }

    async fn send_upstream(
        &self,
        method: Method,
        path: &str,
        headers: HeaderMap,
        body: Body,
    ) -> Result<hyper::Response<hyper::body::Incoming>, ProxyError> {
        let uri: Uri = format!("http://{}{}", self.target.authority, path)
            .parse()
            .map_err(|e| ProxyError::InvalidRequest(format!("Bad request target {}: {}", path, e)))?;

        let mut request = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .version(Version::HTTP_11)
            .body(body)
            .map_err(|e| ProxyError::InvalidRequest(format!("Failed to build request: {}", e)))?;
        *request.headers_mut() = headers;

        self.client
            .request(request)
            .await
            .map_err(|e| ProxyError::RequestFailed(error_chain(&e)))
    }
}

fn bad_gateway(error: &ProxyError) -> Response {
    (
        StatusCode::BAD_GATEWAY,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("Bad Gateway: {}\n", error),
    )
        .into_response()
}

/// Render an error with its sources, e.g. "client error (Connect): Connection refused"
fn error_chain(error: &dyn StdError) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Whether the request asks for a WebSocket upgrade
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::UPGRADE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("websocket"))
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();

    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
    for name in &named {
        headers.remove(name.as_str());
    }
}

/// Headers sent to the local service for a plain HTTP request
pub fn forwarded_request_headers(
    inbound: &HeaderMap,
    client_ip: IpAddr,
    target_host: &HeaderValue,
) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);

    headers.insert(header::HOST, target_host.clone());

    let client = client_ip.to_string();
    let prior: Vec<&str> = inbound
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();
    let forwarded_for = if prior.is_empty() {
        client
    } else {
        format!("{}, {}", prior.join(", "), client)
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    let proto = inbound
        .get(X_FORWARDED_PROTO)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("https"));
    headers.insert(X_FORWARDED_PROTO, proto);

    if let Some(original_host) = inbound.get(header::HOST) {
        headers.insert(X_FORWARDED_HOST, original_host.clone());
    }
    headers.insert(X_FORWARDED_PORT, HeaderValue::from_static(PUBLIC_PORT));

    // An encoded response could not be re-exposed consistently
    headers.remove(header::ACCEPT_ENCODING);

    headers
}

/// Clean up response headers before they go back through the tunnel
///
/// The body may already have been decoded in transit, so a stale
/// `Content-Encoding` or `Content-Length` would break clients.
pub fn sanitize_response_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
    headers.remove(header::CONTENT_ENCODING);
    headers.remove(header::CONTENT_LENGTH);
}
