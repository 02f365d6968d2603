//! WebSocket relay between the tunnel and the local service
//!
//! The downstream socket is upgraded first and the upstream connection is
//! opened afterwards. Messages that arrive from downstream in the meantime
//! are held in an [`UpstreamGate`] and flushed in arrival order once the
//! upstream handshake completes.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::http_proxy::{strip_hop_by_hop, Target};

/// Close code sent downstream when the upstream side fails
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Handshake headers owned by each hop's own WebSocket handshake
const HANDSHAKE_HEADERS: [&str; 6] = [
    "host",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-protocol",
    "sec-websocket-accept",
];

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Holds downstream messages until the upstream connection is open
#[derive(Debug)]
pub enum UpstreamGate<M> {
    /// Upstream still connecting; messages wait in arrival order
    Pending(VecDeque<M>),
    /// Upstream open; messages pass straight through
    Open,
}

impl<M> UpstreamGate<M> {
    pub fn new() -> Self {
        UpstreamGate::Pending(VecDeque::new())
    }

    /// Returns the message if it may be sent now, queues it otherwise
    pub fn push(&mut self, message: M) -> Option<M> {
        match self {
            UpstreamGate::Pending(queue) => {
                queue.push_back(message);
                None
            }
            UpstreamGate::Open => Some(message),
        }
    }

    /// Switch to passthrough, returning the queued messages oldest first
    ///
    /// The caller must send all of them before handing over any message
    /// pushed afterwards.
    pub fn open(&mut self) -> VecDeque<M> {
        match std::mem::replace(self, UpstreamGate::Open) {
            UpstreamGate::Pending(queue) => queue,
            UpstreamGate::Open => VecDeque::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, UpstreamGate::Open)
    }

    /// Number of messages waiting
    pub fn queued(&self) -> usize {
        match self {
            UpstreamGate::Pending(queue) => queue.len(),
            UpstreamGate::Open => 0,
        }
    }
}

impl<M> Default for UpstreamGate<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Relayed socket as seen by observers
#[derive(Debug, Clone)]
pub struct TrackedSocket {
    pub path: String,
    pub opened_at: DateTime<Utc>,
}

/// Relayed WebSockets currently alive
#[derive(Debug, Clone, Default)]
pub struct WebSocketRegistry {
    sockets: Arc<Mutex<HashMap<u64, TrackedSocket>>>,
    next_id: Arc<AtomicU64>,
}

impl WebSocketRegistry {
    /// Register a socket; it is removed when the returned guard drops
    fn track(&self, path: &str) -> TrackedGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sockets().insert(
            id,
            TrackedSocket {
                path: path.to_string(),
                opened_at: Utc::now(),
            },
        );
        TrackedGuard {
            id,
            registry: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.sockets().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets().is_empty()
    }

    pub fn list(&self) -> Vec<TrackedSocket> {
        self.sockets().values().cloned().collect()
    }

    fn sockets(&self) -> MutexGuard<'_, HashMap<u64, TrackedSocket>> {
        self.sockets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct TrackedGuard {
    id: u64,
    registry: WebSocketRegistry,
}

impl Drop for TrackedGuard {
    fn drop(&mut self) {
        self.registry.sockets().remove(&self.id);
    }
}

/// Everything needed to open the upstream half
#[derive(Debug, Clone)]
struct UpstreamRequest {
    url: String,
    path: String,
    headers: HeaderMap,
    protocols: Vec<String>,
}

impl UpstreamRequest {
    async fn connect(&self) -> Result<UpstreamSocket, tokio_tungstenite::tungstenite::Error> {
        let mut request = self.url.as_str().into_client_request()?;

        let handshake = request.headers_mut();
        for name in self.headers.keys() {
            handshake.remove(name);
        }
        handshake.extend(self.headers.clone());

        if !self.protocols.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.protocols.join(", ")) {
                handshake.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
            }
        }

        let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
        Ok(socket)
    }
}

/// Subprotocols requested by the client, in order
pub fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Headers forwarded on the upstream handshake
///
/// Drops hop-by-hop and handshake headers (the upstream handshake makes its
/// own) and points `Host` at the local service.
pub fn websocket_forward_headers(inbound: &HeaderMap, target_host: &HeaderValue) -> HeaderMap {
    let mut headers = inbound.clone();
    strip_hop_by_hop(&mut headers);
    for name in HANDSHAKE_HEADERS {
        headers.remove(name);
    }
    headers.insert(header::HOST, target_host.clone());
    headers
}

/// Upgrade the downstream request and relay it to the local service
pub(crate) async fn handle_upgrade(
    request: Request,
    target: Arc<Target>,
    registry: WebSocketRegistry,
) -> Response {
    let (mut parts, _body) = request.into_parts();

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let protocols = requested_protocols(&parts.headers);
    let upstream = UpstreamRequest {
        url: format!("ws://{}{}", target.authority, path),
        path,
        headers: websocket_forward_headers(&parts.headers, &target.host_header),
        protocols,
    };

    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => {
            debug!("Rejected WebSocket upgrade for {}: {}", upstream.path, rejection);
            return rejection.into_response();
        }
    };

    let upgrade = if upstream.protocols.is_empty() {
        upgrade
    } else {
        upgrade.protocols(upstream.protocols.clone())
    };

    info!("🔌 WebSocket upgrade for {}", upstream.path);
    upgrade.on_upgrade(move |socket| relay(socket, upstream, registry))
}

async fn relay(downstream: WebSocket, upstream: UpstreamRequest, registry: WebSocketRegistry) {
    let _tracked = registry.track(&upstream.path);
    let (mut down_tx, mut down_rx) = downstream.split();
    let mut gate = UpstreamGate::new();

    let connect = upstream.connect();
    tokio::pin!(connect);

    let upstream_socket = loop {
        tokio::select! {
            result = &mut connect => match result {
                Ok(socket) => break socket,
                Err(e) => {
                    warn!("WebSocket upstream connect failed for {}: {}", upstream.path, e);
                    let _ = down_tx
                        .send(close_message(CLOSE_INTERNAL_ERROR, "upstream connection failed"))
                        .await;
                    return;
                }
            },
            message = down_rx.next() => match message {
                Some(Ok(Message::Close(_))) | None => {
                    debug!("WebSocket {} closed before upstream opened", upstream.path);
                    return;
                }
                Some(Ok(message)) => {
                    if let Some(message) = to_upstream(message) {
                        // Still connecting, so this always queues
                        let _ = gate.push(message);
                    }
                }
                Some(Err(e)) => {
                    debug!("WebSocket {} downstream error: {}", upstream.path, e);
                    return;
                }
            },
        }
    };

    debug!(
        "WebSocket upstream open for {}, flushing {} queued message(s)",
        upstream.path,
        gate.queued()
    );

    let (mut up_tx, mut up_rx) = upstream_socket.split();
    for message in gate.open() {
        if let Err(e) = up_tx.send(message).await {
            warn!("WebSocket {} flush failed: {}", upstream.path, e);
            let _ = down_tx
                .send(close_message(CLOSE_INTERNAL_ERROR, "upstream error"))
                .await;
            return;
        }
    }

    loop {
        tokio::select! {
            message = down_rx.next() => match message {
                Some(Ok(Message::Close(frame))) => {
                    let frame = frame.map(close_to_upstream);
                    let _ = up_tx.send(UpstreamMessage::Close(frame)).await;
                    break;
                }
                Some(Ok(message)) => {
                    let Some(message) = to_upstream(message).and_then(|m| gate.push(m)) else {
                        continue;
                    };
                    if let Err(e) = up_tx.send(message).await {
                        warn!("WebSocket {} upstream send failed: {}", upstream.path, e);
                        let _ = down_tx
                            .send(close_message(CLOSE_INTERNAL_ERROR, "upstream error"))
                            .await;
                        break;
                    }
                }
                Some(Err(e)) => {
                    debug!("WebSocket {} downstream error: {}", upstream.path, e);
                    let _ = up_tx.close().await;
                    break;
                }
                None => {
                    let _ = up_tx.close().await;
                    break;
                }
            },
            message = up_rx.next() => match message {
                Some(Ok(UpstreamMessage::Close(frame))) => {
                    let frame = frame.map(close_to_downstream);
                    let _ = down_tx.send(Message::Close(frame)).await;
                    break;
                }
                Some(Ok(message)) => {
                    let Some(message) = to_downstream(message) else {
                        continue;
                    };
                    if down_tx.send(message).await.is_err() {
                        let _ = up_tx.close().await;
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!("WebSocket {} upstream error: {}", upstream.path, e);
                    let _ = down_tx
                        .send(close_message(CLOSE_INTERNAL_ERROR, "upstream error"))
                        .await;
                    break;
                }
                None => {
                    let _ = down_tx
                        .send(close_message(CLOSE_INTERNAL_ERROR, "upstream closed"))
                        .await;
                    break;
                }
            },
        }
    }

    debug!("WebSocket relay for {} finished", upstream.path);
}

/// Data frames only; control frames are answered per hop
fn to_upstream(message: Message) -> Option<UpstreamMessage> {
    match message {
        Message::Text(text) => Some(UpstreamMessage::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(UpstreamMessage::Binary(data.to_vec())),
        _ => None,
    }
}

fn to_downstream(message: UpstreamMessage) -> Option<Message> {
    match message {
        UpstreamMessage::Text(text) => Some(Message::Text(text.into())),
        UpstreamMessage::Binary(data) => Some(Message::Binary(data.into())),
        _ => None,
    }
}

fn close_to_upstream(frame: CloseFrame) -> UpstreamCloseFrame<'static> {
    UpstreamCloseFrame {
        code: CloseCode::from(frame.code),
        reason: Cow::Owned(frame.reason.as_str().to_owned()),
    }
}

fn close_to_downstream(frame: UpstreamCloseFrame<'_>) -> CloseFrame {
    CloseFrame {
        code: u16::from(frame.code),
        reason: frame.reason.into_owned().into(),
    }
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}
