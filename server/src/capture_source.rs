//! Lifecycle of the child capture process.
//!
//! Owns the process handle exclusively: the window loop reads lines through
//! [`CaptureSource::read_line`] and the coordinator starts/stops the child
//! through this type only.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::InterfaceInfo;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// How long the child gets to prove it started before we inspect its exit.
const STARTUP_PROBE: Duration = Duration::from_millis(200);
/// Cap on reading stderr from a child that died during the probe.
const STARTUP_STDERR_TIMEOUT: Duration = Duration::from_millis(1500);
/// Graceful terminate allowance before the force kill.
const STOP_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture already running")]
    AlreadyRunning,
    #[error("capture tool not found; install Wireshark/tshark")]
    ToolMissing,
    #[error("failed to start capture on interface {interface}: {stderr}")]
    StartupFailed { interface: String, stderr: String },
    #[error("capture I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of one deadline-bounded read.
#[derive(Debug)]
pub enum ReadOutcome {
    Line(String),
    /// The deadline passed with no data; a normal condition, callers loop.
    Timeout,
    Eof,
}

struct ChildHandles {
    child: Child,
    reader: BufReader<ChildStdout>,
}

pub struct CaptureSource {
    tool: String,
    handles: Mutex<Option<ChildHandles>>,
    parse_errors: AtomicU64,
}

impl CaptureSource {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            handles: Mutex::new(None),
            parse_errors: AtomicU64::new(0),
        }
    }

    /// The `-e` field list, in wire order. `packet::FIELD_COUNT` must match
    /// this list.
    const FIELDS: [&'static str; 32] = [
        "frame.number",
        "frame.time_epoch",
        "ip.src",
        "ip.dst",
        "frame.len",
        "_ws.col.Protocol",
        "_ws.col.Info",
        "tcp.stream",
        "udp.stream",
        "tcp.analysis.ack_rtt",
        "tcp.analysis.retransmission",
        "tcp.analysis.fast_retransmission",
        "tcp.analysis.spurious_retransmission",
        "rtp.ssrc",
        "rtp.seq",
        "ip.proto",
        "ipv6.src",
        "ipv6.dst",
        "rtp.timestamp",
        "rtp.p_type",
        "ipv6.nxt",
        "tcp.len",
        "udp.length",
        "tcp.srcport",
        "tcp.dstport",
        "udp.srcport",
        "udp.dstport",
        "dns.qry.name",
        "dns.a",
        "dns.aaaa",
        "tls.handshake.extensions_server_name",
        "quic.tls.handshake.extensions_server_name",
    ];

    fn command(&self, interface: &str) -> Command {
        let mut cmd = Command::new(&self.tool);
        cmd.arg("-i").arg(interface).arg("-T").arg("fields").arg("-l");
        for field in Self::FIELDS {
            cmd.arg("-e").arg(field);
        }
        cmd.arg("-E")
            .arg("separator=|")
            .arg("-E")
            .arg("occurrence=f")
            .arg("-E")
            .arg("header=n")
            .arg("-E")
            .arg("quote=n");
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Launch the child on `interface`. Fails with `AlreadyRunning` when a
    /// process is live, `ToolMissing` when the binary is absent and
    /// `StartupFailed` when the child exits inside the startup probe.
    pub async fn start(&self, interface: &str) -> Result<(), CaptureError> {
        let mut guard = self.handles.lock().await;
        if guard.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }

        tracing::info!("Starting capture on interface {}", interface);
        let mut child = self.command(interface).spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CaptureError::ToolMissing
            } else {
                CaptureError::Io(e)
            }
        })?;

        tokio::time::sleep(STARTUP_PROBE).await;

        if let Some(status) = child.try_wait()? {
            let stderr = match child.stderr.take() {
                Some(mut pipe) => {
                    let mut buf = String::new();
                    match timeout(STARTUP_STDERR_TIMEOUT, pipe.read_to_string(&mut buf)).await {
                        Ok(Ok(_)) => buf.trim().to_string(),
                        _ => "unknown error".to_string(),
                    }
                }
                None => "unknown error".to_string(),
            };
            tracing::error!("Capture child exited during startup ({}): {}", status, stderr);
            return Err(CaptureError::StartupFailed {
                interface: interface.to_string(),
                stderr,
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("child stdout not piped"))?;
        *guard = Some(ChildHandles {
            child,
            reader: BufReader::new(stdout),
        });
        tracing::info!("Capture started on interface {}", interface);
        Ok(())
    }

    /// Read one output line with a deadline. Timeout is a normal outcome.
    pub async fn read_line(&self, deadline: Duration) -> ReadOutcome {
        let mut guard = self.handles.lock().await;
        let handles = match guard.as_mut() {
            Some(h) => h,
            None => return ReadOutcome::Eof,
        };
        let mut line = String::new();
        match timeout(deadline, handles.reader.read_line(&mut line)).await {
            Err(_) => ReadOutcome::Timeout,
            Ok(Ok(0)) => ReadOutcome::Eof,
            Ok(Ok(_)) => ReadOutcome::Line(line.trim_end().to_string()),
            Ok(Err(e)) => {
                tracing::warn!("Error reading capture output: {}", e);
                ReadOutcome::Eof
            }
        }
    }

    /// Stop the child: graceful terminate, bounded wait, then force kill.
    /// Returns `false` when no process was running (idempotent).
    pub async fn stop(&self) -> bool {
        let mut guard = self.handles.lock().await;
        let Some(mut handles) = guard.take() else {
            tracing::info!("Capture was not running");
            return false;
        };

        terminate(&handles.child);
        match timeout(STOP_GRACE, handles.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!("Capture terminated gracefully ({})", status);
            }
            Ok(Err(e)) => {
                tracing::warn!("Error waiting for capture child: {}", e);
            }
            Err(_) => {
                tracing::warn!("Capture did not terminate in {:?}, force killing", STOP_GRACE);
                if let Err(e) = handles.child.kill().await {
                    tracing::warn!("Force kill failed: {}", e);
                }
            }
        }
        true
    }

    /// Count of lines that failed to parse this session.
    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn parse_errors(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    pub fn reset_parse_errors(&self) {
        self.parse_errors.store(0, Ordering::Relaxed);
    }

    /// Enumerate capture interfaces via the tool's `-D` listing. Falls back
    /// to a single default entry when the tool is unavailable.
    pub async fn list_interfaces(&self) -> Vec<InterfaceInfo> {
        let output = Command::new(&self.tool).arg("-D").output().await;
        match output {
            Ok(out) => {
                let stdout = String::from_utf8_lossy(&out.stdout);
                let interfaces: Vec<InterfaceInfo> =
                    stdout.lines().filter_map(parse_interface_line).collect();
                tracing::info!("Found {} capture interfaces", interfaces.len());
                if interfaces.is_empty() {
                    vec![default_interface()]
                } else {
                    interfaces
                }
            }
            Err(e) => {
                tracing::warn!("Failed to enumerate interfaces: {}", e);
                vec![default_interface()]
            }
        }
    }
}

fn default_interface() -> InterfaceInfo {
    InterfaceInfo {
        id: "1".to_string(),
        name: "Default Interface".to_string(),
        full_path: "1".to_string(),
    }
}

#[cfg(unix)]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

/// Parse one `-D` listing line: `"<index>. <device-path> (<name>?)"`.
fn parse_interface_line(line: &str) -> Option<InterfaceInfo> {
    let line = line.trim();
    let dot = line.find(". ")?;
    let id = line[..dot].trim();
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let rest = line[dot + 2..].trim();
    let (full_path, name) = match (rest.rfind(" ("), rest.ends_with(')')) {
        (Some(open), true) => {
            let path = rest[..open].trim();
            let descriptive = rest[open + 2..rest.len() - 1].trim();
            (path, if descriptive.is_empty() { path } else { descriptive })
        }
        _ => (rest, rest),
    };
    if full_path.is_empty() {
        return None;
    }
    Some(InterfaceInfo {
        id: id.to_string(),
        name: name.to_string(),
        full_path: full_path.to_string(),
    })
}
