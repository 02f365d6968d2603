//! Terminal observer for a running session
//!
//! Prints the tunnel state as it changes and one line per completed
//! request. Releasing the display prints a statistics summary.

use chrono::Local;
use pgrok_client::{
    CertStatus, ConnectionStats, LogEntry, Session, SessionEvent, TunnelState, TunnelStatus,
};
use std::io::Write;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

pub struct Dashboard {
    task: JoinHandle<std::io::Stdout>,
    stop: oneshot::Sender<()>,
}

impl Dashboard {
    /// Print the session header and start following its events
    pub fn attach(session: &Session, local_port: u16) -> Self {
        println!("pgrok {}", env!("GIT_TAG"));
        println!();
        println!(
            "  Forwarding  {} -> localhost:{}",
            session.expected_url(),
            local_port
        );
        println!(
            "  Proxy       {} (relay port {})",
            session.proxy_addr(),
            session.remote_port()
        );
        println!();
        println!("{}", format_state(&session.state()));

        let (stop, stopped) = oneshot::channel();
        Self {
            task: tokio::spawn(follow(session.subscribe(), stopped, std::io::stdout())),
            stop,
        }
    }

    /// Print what is still queued, then show the final statistics
    pub async fn release(self, stats: &ConnectionStats) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            tracing::debug!("Dashboard task ended abnormally: {}", e);
        }
        println!();
        println!("{}", format_summary(stats));
    }
}

/// Write one line per state change and completed request until stopped
///
/// Events already queued when the stop signal arrives are still written.
async fn follow<W: Write>(
    mut events: broadcast::Receiver<SessionEvent>,
    mut stop: oneshot::Receiver<()>,
    mut out: W,
) -> W {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => write_event(&mut out, &event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Dashboard skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = &mut stop => {
                loop {
                    match events.try_recv() {
                        Ok(event) => write_event(&mut out, &event),
                        Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
                break;
            }
        }
    }
    out
}

fn write_event<W: Write>(out: &mut W, event: &SessionEvent) {
    let line = match event {
        SessionEvent::State(state) => format_state(state),
        SessionEvent::Request(entry) => format_request(entry),
        SessionEvent::Stats(_) => return,
    };
    let _ = writeln!(out, "{}", line);
}

pub fn format_state(state: &TunnelState) -> String {
    let cert = match state.cert_status {
        CertStatus::Pending => "",
        CertStatus::Ready => " (TLS ready)",
        CertStatus::Warning => " (TLS not yet ready)",
    };

    match state.status {
        TunnelStatus::Connecting => "Connecting to relay...".to_string(),
        TunnelStatus::ProvisioningTls => format!("Provisioning TLS certificate...{}", cert),
        TunnelStatus::Online => format!(
            "✅ Online: {}{}",
            state.url.as_deref().unwrap_or("(no url)"),
            cert
        ),
        TunnelStatus::Error => format!(
            "❌ {}",
            state.error.as_deref().unwrap_or("Tunnel error")
        ),
    }
}

/// `HH:MM:SS METHOD PATH STATUS STATUS_TEXT DURATIONms`
pub fn format_request(entry: &LogEntry) -> String {
    let request = &entry.request;
    format!(
        "{} {} {} {} {} {:.0}ms",
        request
            .timestamp
            .with_timezone(&Local)
            .format("%H:%M:%S"),
        request.method,
        request.path,
        request.status_code,
        request.status_text,
        request.duration_ms
    )
}

pub fn format_summary(stats: &ConnectionStats) -> String {
    format!(
        "Requests: {} total, {:.2}/s (1m), {:.2}/s (5m), p50 {:.2}ms, p90 {:.2}ms",
        stats.total_requests, stats.rate_1m, stats.rate_5m, stats.p50_ms, stats.p90_ms
    )
}
