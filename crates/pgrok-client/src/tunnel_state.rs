//! Tunnel status derived from the relay controller's output
//!
//! The controller speaks plain text. Each line is matched against a handful
//! of markers; [`TunnelState::apply_line`] is a pure function so the rules
//! can be tested without a process.

use serde::{Deserialize, Serialize};

const PROVISIONING_MARKER: &str = "Provisioning TLS certificate";
const CERT_READY_LINE: &str = "TLS certificate ready.";
const CERT_WARNING_MARKER: &str = "Warning: TLS certificate not yet ready";
const ACTIVE_MARKER: &str = "pgrok tunnel active:";
const ERROR_MARKER: &str = "Error:";

/// Tunnel lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    #[default]
    Connecting,
    ProvisioningTls,
    Online,
    Error,
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TunnelStatus::Connecting => "connecting",
            TunnelStatus::ProvisioningTls => "provisioning TLS",
            TunnelStatus::Online => "online",
            TunnelStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// Certificate status reported by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertStatus {
    #[default]
    Pending,
    Ready,
    Warning,
}

/// Live state of the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TunnelState {
    pub status: TunnelStatus,
    pub url: Option<String>,
    pub cert_status: CertStatus,
    pub error: Option<String>,
}

impl TunnelState {
    /// Initial state: connecting, certificate pending
    pub fn new() -> Self {
        Self::default()
    }

    /// State after one more line of controller output
    ///
    /// Unrecognized lines leave the state untouched.
    pub fn apply_line(&self, line: &str) -> TunnelState {
        let line = line.trim_end();
        let mut next = self.clone();

        if line.starts_with(PROVISIONING_MARKER) {
            next.status = TunnelStatus::ProvisioningTls;
            next.cert_status = CertStatus::Pending;
        } else if line == CERT_READY_LINE {
            next.cert_status = CertStatus::Ready;
        } else if line.starts_with(CERT_WARNING_MARKER) {
            next.cert_status = CertStatus::Warning;
        } else if let Some(url) = line.strip_prefix(ACTIVE_MARKER) {
            next.status = TunnelStatus::Online;
            next.url = Some(url.trim().to_string());
        } else if line.starts_with(ERROR_MARKER) {
            next.status = TunnelStatus::Error;
            next.error = Some(line.to_string());
        }

        next
    }

    /// State after the tunnel process exited
    ///
    /// `code` is `None` when the process was killed by a signal.
    pub fn exited(&self, code: Option<i32>) -> TunnelState {
        let message = match code {
            Some(code) => format!("Tunnel process exited with code {}", code),
            None => "Tunnel process terminated by signal".to_string(),
        };

        TunnelState {
            status: TunnelStatus::Error,
            error: Some(message),
            ..self.clone()
        }
    }

    pub fn is_online(&self) -> bool {
        self.status == TunnelStatus::Online
    }
}
