//! pgrok client library - tunnel session core
//!
//! Runs a local reverse proxy in front of the user's service, keeps an `ssh`
//! control channel to the relay open, and aggregates request statistics.

pub mod checksum;
pub mod config;
pub mod http_proxy;
pub mod line_splitter;
pub mod metrics;
pub mod session;
pub mod stats;
pub mod tunnel_process;
pub mod tunnel_state;
pub mod websocket;

pub use checksum::{cksum, derive_remote_port};
pub use config::{parse_port, ConfigError, RelayConfig, Subdomain, ValidationError};
pub use http_proxy::{LocalProxy, ProxyConfig, ProxyError};
pub use metrics::{HttpRequest, LogEntry, RequestLog, SessionEvent};
pub use session::{Session, SessionError, SessionOptions};
pub use stats::{ConnectionStats, InFlight, StatsTracker};
pub use tunnel_process::{TunnelCommand, TunnelEvent, TunnelProcess, TunnelProcessError};
pub use tunnel_state::{CertStatus, TunnelState, TunnelStatus};
pub use websocket::WebSocketRegistry;
