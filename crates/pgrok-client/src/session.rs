//! Tunnel session orchestration
//!
//! Wires the local proxy, the control-channel process and the statistics
//! together. All state updates go through a single event loop task, so
//! tunnel lines are applied strictly in the order they were read.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::checksum::derive_remote_port;
use crate::config::{parse_port, ConfigError, RelayConfig, Subdomain, ValidationError};
use crate::http_proxy::{LocalProxy, ProxyConfig, ProxyError};
use crate::metrics::{HttpRequest, LogEntry, RequestLog, SessionEvent, DEFAULT_LOG_CAPACITY};
use crate::stats::{ConnectionStats, StatsTracker};
use crate::tunnel_process::{TunnelCommand, TunnelEvent, TunnelProcess, TunnelProcessError};
use crate::tunnel_state::TunnelState;

/// How often a statistics snapshot is republished
pub const STATS_INTERVAL: Duration = Duration::from_secs(1);

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Tunnel(#[from] TunnelProcessError),
}

/// Per-run session inputs
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub subdomain: Subdomain,
    pub local_port: u16,
    pub proxy: ProxyConfig,
    /// Transport program override and its leading arguments
    pub transport: Option<(String, Vec<String>)>,
    pub log_capacity: usize,
}

impl SessionOptions {
    pub fn new(subdomain: Subdomain, local_port: u16) -> Self {
        Self {
            subdomain,
            local_port,
            proxy: ProxyConfig::for_target(local_port),
            transport: None,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }

    /// Validate raw command-line inputs
    pub fn from_args(subdomain: &str, local_port: &str) -> Result<Self, ValidationError> {
        let subdomain = Subdomain::parse(subdomain)?;
        let local_port = parse_port(local_port)?;
        Ok(Self::new(subdomain, local_port))
    }

    /// Run a different program in place of `ssh`
    pub fn with_transport<I, S>(mut self, program: impl Into<String>, leading_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.transport = Some((
            program.into(),
            leading_args.into_iter().map(Into::into).collect(),
        ));
        self
    }
}

/// A running tunnel session
pub struct Session {
    subdomain: Subdomain,
    expected_url: String,
    remote_port: u16,
    proxy: LocalProxy,
    tunnel: TunnelProcess,
    stats: Arc<StatsTracker>,
    requests: Arc<Mutex<RequestLog>>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Receiver<TunnelState>,
    exited: watch::Receiver<bool>,
    ticker: JoinHandle<()>,
    event_loop: JoinHandle<()>,
    shut_down: bool,
}

impl Session {
    /// Start the proxy, then the control channel, then the event loop
    pub async fn start(options: SessionOptions, relay: &RelayConfig) -> Result<Self, SessionError> {
        let stats = Arc::new(StatsTracker::new());

        let (proxy, requests_rx) = LocalProxy::start(options.proxy.clone(), stats.clone()).await?;

        let remote_port = derive_remote_port(options.subdomain.as_str());
        debug!(
            "Subdomain {} maps to remote port {}",
            options.subdomain, remote_port
        );

        let mut command = TunnelCommand::new(
            relay.destination(),
            options.subdomain.as_str(),
            remote_port,
            proxy.port(),
        )
        .with_key(relay.key_path.clone());
        if let Some((program, args)) = &options.transport {
            command = command.with_program(program.clone(), args.clone());
        }

        // Proxy shuts down on drop if this fails
        let (tunnel, tunnel_rx) = TunnelProcess::spawn(command)?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(TunnelState::new());
        let (exited_tx, exited_rx) = watch::channel(false);
        let requests = Arc::new(Mutex::new(RequestLog::new(options.log_capacity)));

        let event_loop = tokio::spawn(
            EventLoop {
                state: state_tx,
                exited: exited_tx,
                events: events.clone(),
                stats: stats.clone(),
                requests: requests.clone(),
            }
            .run(tunnel_rx, requests_rx),
        );
        let ticker = tokio::spawn(publish_stats(stats.clone(), events.clone()));

        let expected_url = relay.public_url(&options.subdomain);
        info!(
            "Session {} started: proxy {} -> localhost:{}, remote port {}",
            options.subdomain,
            proxy.local_addr(),
            options.local_port,
            remote_port
        );

        Ok(Self {
            subdomain: options.subdomain,
            expected_url,
            remote_port,
            proxy,
            tunnel,
            stats,
            requests,
            events,
            state: state_rx,
            exited: exited_rx,
            ticker,
            event_loop,
            shut_down: false,
        })
    }

    /// Receive state changes, completed requests and statistics
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Follow the tunnel state; the current value is readable immediately
    pub fn watch_state(&self) -> watch::Receiver<TunnelState> {
        self.state.clone()
    }

    pub fn state(&self) -> TunnelState {
        self.state.borrow().clone()
    }

    /// Whether the control-channel process has exited
    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Resolves once the control-channel process has exited
    pub async fn tunnel_exited(&self) {
        let mut exited = self.exited.clone();
        // Err means the event loop is gone, which only happens on shutdown
        let _ = exited.wait_for(|exited| *exited).await;
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats.snapshot()
    }

    /// The `limit` most recent requests, newest first
    pub fn recent_requests(&self, limit: usize) -> Vec<LogEntry> {
        lock_log(&self.requests).recent(limit)
    }

    pub fn subdomain(&self) -> &Subdomain {
        &self.subdomain
    }

    /// URL the relay is expected to publish
    pub fn expected_url(&self) -> &str {
        &self.expected_url
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy.local_addr()
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn active_websockets(&self) -> usize {
        self.proxy.active_websockets()
    }

    pub fn tunnel_pid(&self) -> Option<u32> {
        self.tunnel.pid()
    }

    /// Tear everything down
    ///
    /// Stops the statistics timer, terminates the control channel, then
    /// stops the proxy. Each step runs regardless of the others; calling it
    /// again does nothing.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        info!("Shutting down session {}", self.subdomain);
        self.ticker.abort();
        self.tunnel.terminate();
        self.proxy.stop();
        self.event_loop.abort();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock_log(log: &Mutex<RequestLog>) -> MutexGuard<'_, RequestLog> {
    log.lock().unwrap_or_else(|e| e.into_inner())
}

async fn publish_stats(stats: Arc<StatsTracker>, events: broadcast::Sender<SessionEvent>) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;
        let _ = events.send(SessionEvent::Stats(stats.snapshot()));
    }
}

/// Single owner of the tunnel state and the request log
struct EventLoop {
    state: watch::Sender<TunnelState>,
    exited: watch::Sender<bool>,
    events: broadcast::Sender<SessionEvent>,
    stats: Arc<StatsTracker>,
    requests: Arc<Mutex<RequestLog>>,
}

impl EventLoop {
    async fn run(
        self,
        mut tunnel: mpsc::UnboundedReceiver<TunnelEvent>,
        mut requests: mpsc::UnboundedReceiver<HttpRequest>,
    ) {
        let mut tunnel_open = true;
        let mut proxy_open = true;

        loop {
            tokio::select! {
                event = tunnel.recv(), if tunnel_open => match event {
                    Some(event) => self.on_tunnel_event(event),
                    None => tunnel_open = false,
                },
                request = requests.recv(), if proxy_open => match request {
                    Some(request) => self.on_request(request),
                    None => proxy_open = false,
                },
                else => break,
            }
        }

        debug!("Session event loop finished");
    }

    fn on_tunnel_event(&self, event: TunnelEvent) {
        // Process exit is terminal
        if *self.exited.borrow() {
            debug!(?event, "Ignoring tunnel event after exit");
            return;
        }

        let changed = self.state.send_if_modified(|state| {
            let next = match &event {
                TunnelEvent::Line(line) => state.apply_line(line),
                TunnelEvent::Exited(code) => state.exited(*code),
            };
            if next == *state {
                return false;
            }
            *state = next;
            true
        });

        if changed {
            let state = self.state.borrow().clone();
            info!(status = %state.status, url = ?state.url, "Tunnel state changed");
            let _ = self.events.send(SessionEvent::State(state));
        }

        if matches!(event, TunnelEvent::Exited(_)) {
            self.exited.send_replace(true);
        }
    }

    fn on_request(&self, request: HttpRequest) {
        self.stats.record_request(request.duration_ms);
        let entry = lock_log(&self.requests).push(request);

        let _ = self.events.send(SessionEvent::Request(entry));
        let _ = self.events.send(SessionEvent::Stats(self.stats.snapshot()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel_state::{CertStatus, TunnelStatus};
    use chrono::Utc;

    struct Harness {
        tunnel: mpsc::UnboundedSender<TunnelEvent>,
        requests: mpsc::UnboundedSender<HttpRequest>,
        state: watch::Receiver<TunnelState>,
        exited: watch::Receiver<bool>,
        events: broadcast::Receiver<SessionEvent>,
        log: Arc<Mutex<RequestLog>>,
        stats: Arc<StatsTracker>,
        task: JoinHandle<()>,
    }

    fn harness() -> Harness {
        let (tunnel_tx, tunnel_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TunnelState::new());
        let (exited_tx, exited_rx) = watch::channel(false);
        let (events_tx, events_rx) = broadcast::channel(64);
        let log = Arc::new(Mutex::new(RequestLog::new(10)));
        let stats = Arc::new(StatsTracker::new());

        let task = tokio::spawn(
            EventLoop {
                state: state_tx,
                exited: exited_tx,
                events: events_tx,
                stats: stats.clone(),
                requests: log.clone(),
            }
            .run(tunnel_rx, requests_rx),
        );

        Harness {
            tunnel: tunnel_tx,
            requests: requests_tx,
            state: state_rx,
            exited: exited_rx,
            events: events_rx,
            log,
            stats,
            task,
        }
    }

    fn request(status_code: u16, duration_ms: f64) -> HttpRequest {
        HttpRequest {
            timestamp: Utc::now(),
            method: "GET".to_string(),
            path: "/".to_string(),
            status_code,
            status_text: String::new(),
            duration_ms,
        }
    }

    #[tokio::test]
    async fn test_lines_are_applied_in_order() {
        let mut h = harness();
        for line in [
            "Provisioning TLS certificate for demo.example.com",
            "TLS certificate ready.",
            "pgrok tunnel active: https://demo.example.com",
        ] {
            h.tunnel.send(TunnelEvent::Line(line.to_string())).unwrap();
        }

        let mut statuses = Vec::new();
        for _ in 0..3 {
            match h.events.recv().await.unwrap() {
                SessionEvent::State(state) => statuses.push((state.status, state.cert_status)),
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(
            statuses,
            vec![
                (TunnelStatus::ProvisioningTls, CertStatus::Pending),
                (TunnelStatus::ProvisioningTls, CertStatus::Ready),
                (TunnelStatus::Online, CertStatus::Ready),
            ]
        );
        assert_eq!(
            h.state.borrow().url.as_deref(),
            Some("https://demo.example.com")
        );
    }

    #[tokio::test]
    async fn test_error_line_then_exit() {
        let mut h = harness();
        h.tunnel
            .send(TunnelEvent::Line("Connecting...".to_string()))
            .unwrap();
        h.tunnel
            .send(TunnelEvent::Line("Error: relay refused".to_string()))
            .unwrap();

        match h.events.recv().await.unwrap() {
            SessionEvent::State(state) => {
                assert_eq!(state.error.as_deref(), Some("Error: relay refused"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!*h.exited.borrow());

        h.tunnel.send(TunnelEvent::Exited(Some(1))).unwrap();
        match h.events.recv().await.unwrap() {
            SessionEvent::State(state) => {
                assert_eq!(state.status, TunnelStatus::Error);
                assert_eq!(
                    state.error.as_deref(),
                    Some("Tunnel process exited with code 1")
                );
            }
            other => panic!("unexpected event {:?}", other),
        }
        h.exited.wait_for(|exited| *exited).await.unwrap();
    }

    #[tokio::test]
    async fn test_events_after_exit_are_ignored() {
        let mut h = harness();
        h.tunnel.send(TunnelEvent::Exited(Some(1))).unwrap();
        h.tunnel
            .send(TunnelEvent::Line(
                "pgrok tunnel active: https://x.example.com".to_string(),
            ))
            .unwrap();
        h.tunnel.send(TunnelEvent::Exited(None)).unwrap();
        drop(h.tunnel);
        drop(h.requests);

        tokio::time::timeout(Duration::from_secs(1), h.task)
            .await
            .unwrap()
            .unwrap();

        let state = h.state.borrow().clone();
        assert_eq!(state.status, TunnelStatus::Error);
        assert!(state.url.is_none());
        assert_eq!(
            state.error.as_deref(),
            Some("Tunnel process exited with code 1")
        );

        let mut states = 0;
        while let Ok(event) = h.events.try_recv() {
            if matches!(event, SessionEvent::State(_)) {
                states += 1;
            }
        }
        assert_eq!(states, 1);
    }

    #[tokio::test]
    async fn test_requests_feed_stats_and_log() {
        let mut h = harness();
        h.requests.send(request(200, 12.0)).unwrap();
        h.requests.send(request(502, 3.0)).unwrap();

        match h.events.recv().await.unwrap() {
            SessionEvent::Request(entry) => assert_eq!(entry.id, 1),
            other => panic!("unexpected event {:?}", other),
        }
        match h.events.recv().await.unwrap() {
            SessionEvent::Stats(stats) => assert_eq!(stats.total_requests, 1),
            other => panic!("unexpected event {:?}", other),
        }
        match h.events.recv().await.unwrap() {
            SessionEvent::Request(entry) => assert_eq!(entry.request.status_code, 502),
            other => panic!("unexpected event {:?}", other),
        }

        assert_eq!(lock_log(&h.log).len(), 2);
        assert_eq!(h.stats.snapshot().total_requests, 2);
    }

    #[tokio::test]
    async fn test_loop_ends_when_sources_close() {
        let h = harness();
        drop(h.tunnel);
        drop(h.requests);
        tokio::time::timeout(Duration::from_secs(1), h.task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_options_from_args() {
        let options = SessionOptions::from_args("demo", "3000").unwrap();
        assert_eq!(options.subdomain.as_str(), "demo");
        assert_eq!(options.local_port, 3000);
        assert_eq!(options.proxy.preferred_port, 13000);
        assert_eq!(options.proxy.target_authority(), "localhost:3000");

        assert!(matches!(
            SessionOptions::from_args("Demo", "3000"),
            Err(ValidationError::InvalidSubdomain(_))
        ));
        assert!(matches!(
            SessionOptions::from_args("demo", "70000"),
            Err(ValidationError::InvalidPort(_))
        ));
    }
}
