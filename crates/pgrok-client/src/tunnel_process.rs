//! Control-channel process supervision
//!
//! One `ssh` process per session carries the reverse forward from the relay
//! to the local proxy and runs the relay-side controller. Its stdout and
//! stderr are read as plain pipes, split into lines and published, in the
//! order they were read, as [`TunnelEvent`]s. [`TunnelEvent::Exited`] is
//! always the last event.

use futures_util::future::join_all;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::line_splitter::LineSplitter;

/// Default transport program
pub const DEFAULT_PROGRAM: &str = "ssh";

/// Relay-side controller started by the remote command
pub const REMOTE_CONTROLLER: &str = "/usr/local/bin/pgrok-tunnel";

const READ_BUFFER_SIZE: usize = 4096;

const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Tunnel process errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelProcessError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to capture {0} of tunnel process")]
    MissingPipe(&'static str),
}

/// Output of the tunnel process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// One non-blank line from stdout or stderr
    Line(String),
    /// Process exited; `None` when killed by a signal
    Exited(Option<i32>),
}

/// How to launch the control channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelCommand {
    /// Transport program, `ssh` unless overridden
    pub program: String,
    /// Arguments placed before the transport flags (for wrapper programs)
    pub program_args: Vec<String>,
    /// `user@host` of the relay
    pub destination: String,
    /// Identity file passed with `-i`
    pub key_path: Option<PathBuf>,
    /// Relay-side port forwarded back to the proxy
    pub remote_port: u16,
    /// Local proxy port the forward points at
    pub proxy_port: u16,
    /// Subdomain requested from the relay controller
    pub subdomain: String,
}

impl TunnelCommand {
    pub fn new(
        destination: impl Into<String>,
        subdomain: impl Into<String>,
        remote_port: u16,
        proxy_port: u16,
    ) -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            program_args: Vec::new(),
            destination: destination.into(),
            key_path: None,
            remote_port,
            proxy_port,
            subdomain: subdomain.into(),
        }
    }

    /// Use an identity file
    pub fn with_key(mut self, key_path: Option<PathBuf>) -> Self {
        self.key_path = key_path;
        self
    }

    /// Replace the transport program
    pub fn with_program<I, S>(mut self, program: impl Into<String>, leading_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.program = program.into();
        self.program_args = leading_args.into_iter().map(Into::into).collect();
        self
    }

    /// Command line run on the relay
    pub fn remote_command(&self) -> String {
        format!(
            "PGROK_NONINTERACTIVE=1 {} {} {}",
            REMOTE_CONTROLLER, self.subdomain, self.remote_port
        )
    }

    /// `-R` forward specification
    pub fn forward_spec(&self) -> String {
        format!("{}:localhost:{}", self.remote_port, self.proxy_port)
    }

    /// Full argument list after the program name
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.program_args.iter().map(OsString::from).collect();

        // No pty: the output is read as plain pipes
        args.push("-T".into());
        for option in [
            "ServerAliveInterval=30",
            "ServerAliveCountMax=3",
            "ConnectTimeout=10",
            "ExitOnForwardFailure=yes",
            "LogLevel=ERROR",
        ] {
            args.push("-o".into());
            args.push(option.into());
        }

        if let Some(key) = &self.key_path {
            args.push("-i".into());
            args.push(key.into());
        }

        args.push("-R".into());
        args.push(self.forward_spec().into());
        args.push(self.destination.clone().into());
        args.push(self.remote_command().into());
        args
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Handle to the running control-channel process
#[derive(Debug)]
pub struct TunnelProcess {
    pid: Option<u32>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl TunnelProcess {
    /// Start the process and its output readers
    pub fn spawn(
        command: TunnelCommand,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TunnelEvent>), TunnelProcessError> {
        info!(
            program = %command.program,
            destination = %command.destination,
            remote_port = command.remote_port,
            proxy_port = command.proxy_port,
            "Starting tunnel process"
        );

        let mut child = command
            .to_command()
            .spawn()
            .map_err(|source| TunnelProcessError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(TunnelProcessError::MissingPipe("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(TunnelProcessError::MissingPipe("stderr"))?;

        let pid = child.id();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();

        let readers = vec![
            tokio::spawn(read_lines("stdout", stdout, events_tx.clone())),
            tokio::spawn(read_lines("stderr", stderr, events_tx.clone())),
        ];
        tokio::spawn(supervise(child, kill_rx, readers, events_tx));

        Ok((
            Self {
                pid,
                kill: Mutex::new(Some(kill_tx)),
            },
            events_rx,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Kill the process; later calls do nothing
    pub fn terminate(&self) {
        let sender = self
            .kill
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(sender) = sender {
            debug!(pid = ?self.pid, "Terminating tunnel process");
            // Err means the supervisor already saw the exit
            let _ = sender.send(());
        }
    }
}

async fn read_lines<R>(
    stream: &'static str,
    mut reader: R,
    events: mpsc::UnboundedSender<TunnelEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    publish(stream, line, &events);
                }
            }
            Err(e) => {
                warn!("Failed to read tunnel {}: {}", stream, e);
                break;
            }
        }
    }

    if let Some(line) = splitter.finish() {
        publish(stream, line, &events);
    }
    debug!("Tunnel {} reader finished", stream);
}

fn publish(stream: &'static str, line: String, events: &mpsc::UnboundedSender<TunnelEvent>) {
    if line.trim().is_empty() {
        return;
    }
    debug!(stream, "{}", line);
    let _ = events.send(TunnelEvent::Line(line));
}

async fn supervise(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    events: mpsc::UnboundedSender<TunnelEvent>,
) {
    // A dropped handle also kills the process
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill => None,
    };

    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                warn!("Failed to kill tunnel process: {}", e);
            }
            child.wait().await
        }
    };

    let code = match status {
        Ok(status) => {
            info!(?status, "Tunnel process exited");
            status.code()
        }
        Err(e) => {
            warn!("Failed to wait for tunnel process: {}", e);
            None
        }
    };

    // Every line is delivered before the exit, unless a leftover child
    // keeps the pipes open
    let aborts: Vec<_> = readers.iter().map(|r| r.abort_handle()).collect();
    if tokio::time::timeout(READER_DRAIN_TIMEOUT, join_all(readers))
        .await
        .is_err()
    {
        warn!("Tunnel output still open after exit, closing readers");
        for abort in aborts {
            abort.abort();
        }
    }
    let _ = events.send(TunnelEvent::Exited(code));
}
