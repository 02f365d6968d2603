//! Completed-request records
//!
//! The proxy emits one [`HttpRequest`] per forwarded exchange. The session
//! keeps the most recent ones in a [`RequestLog`] for observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::stats::ConnectionStats;
use crate::tunnel_state::TunnelState;

/// Default number of requests kept in the log
pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// One completed (or failed) forwarded HTTP exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// When the request was received
    pub timestamp: DateTime<Utc>,
    /// Request method (GET, POST, etc.)
    pub method: String,
    /// Request path including the query string
    pub path: String,
    /// Response status code (502 when forwarding failed)
    pub status_code: u16,
    /// Canonical reason phrase for the status code
    pub status_text: String,
    /// Time until the response headers arrived, in milliseconds
    pub duration_ms: f64,
}

impl HttpRequest {
    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }
}

/// Log entry with the identifier assigned by the log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    #[serde(flatten)]
    pub request: HttpRequest,
}

/// Bounded in-memory request log, oldest entries dropped first
#[derive(Debug)]
pub struct RequestLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_id: u64,
}

impl RequestLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY)),
            capacity,
            next_id: 1,
        }
    }

    /// Append a request, returning the stored entry
    pub fn push(&mut self, request: HttpRequest) -> LogEntry {
        let entry = LogEntry {
            id: self.next_id,
            request,
        };
        self.next_id += 1;

        self.entries.push_back(entry.clone());
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }

        entry
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries from oldest to newest
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// The `limit` most recent entries, newest first
    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for RequestLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

/// Update published by a running session
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Tunnel state changed
    State(TunnelState),
    /// A forwarded request completed
    Request(LogEntry),
    /// Periodic statistics snapshot
    Stats(ConnectionStats),
}
