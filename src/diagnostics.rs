//! In-memory diagnostic log for `--print-logs`
//!
//! A second tracing layer writes every debug line here. On shutdown the
//! buffer is saved to a temp file and echoed to stdout.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;

/// Lines kept before the oldest are dropped
pub const MAX_LINES: usize = 5000;

/// Bounded, shared line buffer
#[derive(Debug, Clone)]
pub struct DiagnosticBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl DiagnosticBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::new())),
            capacity,
        }
    }

    fn lines(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push_line(&self, line: impl Into<String>) {
        let mut lines = self.lines();
        lines.push_back(line.into());
        while lines.len() > self.capacity {
            lines.pop_front();
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines().iter().cloned().collect()
    }

    /// Write the buffer to `<temp>/pgrok-<subdomain>-<unix-ts>.log`
    pub fn save(&self, subdomain: &str) -> io::Result<PathBuf> {
        let path = std::env::temp_dir().join(format!(
            "pgrok-{}-{}.log",
            subdomain,
            chrono::Utc::now().timestamp()
        ));

        let mut contents = self.snapshot().join("\n");
        contents.push('\n');
        std::fs::write(&path, contents)?;
        Ok(path)
    }
}

impl Default for DiagnosticBuffer {
    fn default() -> Self {
        Self::new(MAX_LINES)
    }
}

impl<'a> MakeWriter<'a> for DiagnosticBuffer {
    type Writer = LineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter {
            buffer: self.clone(),
            pending: Vec::new(),
        }
    }
}

/// Collects one formatted event and stores it line by line when dropped
pub struct LineWriter {
    buffer: DiagnosticBuffer,
    pending: Vec<u8>,
}

impl Write for LineWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        let text = String::from_utf8_lossy(&self.pending);
        for line in text.lines().filter(|l| !l.is_empty()) {
            self.buffer.push_line(line);
        }
    }
}
