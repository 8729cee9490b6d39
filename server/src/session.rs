//! Session lifecycle state machine.
//!
//! `Idle → Running → Stopping → Reporting → Idle`. Transitions are
//! serialized behind one async mutex; the `is_resetting` and
//! `is_generating_summary` flags gate subscriber admission and new start
//! commands while the tail of a session is still being processed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use common::ServerMessage;
use tokio::sync::{mpsc, Mutex};

use crate::metrics_engine::process_window;
use crate::state::{AppState, SessionState};
use crate::window::collect_window;

/// Grace between confirming capture stop and building the report, so the
/// in-flight window can publish.
const STOP_REPORT_GRACE: Duration = Duration::from_millis(500);
/// Settling time during an auto-stop reset.
const AUTO_STOP_GRACE: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Running,
    Stopping,
    Reporting,
}

pub struct Coordinator {
    status: Mutex<SessionStatus>,
    is_resetting: AtomicBool,
    is_generating_summary: AtomicBool,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(SessionStatus::Idle),
            is_resetting: AtomicBool::new(false),
            is_generating_summary: AtomicBool::new(false),
        }
    }

    pub async fn status(&self) -> SessionStatus {
        *self.status.lock().await
    }

    pub async fn is_running(&self) -> bool {
        self.status().await == SessionStatus::Running
    }

    pub fn resetting(&self) -> bool {
        self.is_resetting.load(Ordering::SeqCst)
    }

    pub fn generating_summary(&self) -> bool {
        self.is_generating_summary.load(Ordering::SeqCst)
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle a start command. Rejected while a report is still generating or
/// whenever the machine is not Idle.
pub async fn start_capture(state: &AppState, interface: &str) -> (bool, String) {
    if state.coordinator.generating_summary() {
        tracing::info!("Start rejected: summary generation in progress");
        return (
            false,
            "Please wait, the previous session's summary is still being generated.".to_string(),
        );
    }

    let mut status = state.coordinator.status.lock().await;
    if *status != SessionStatus::Idle {
        return (false, "Capture already running".to_string());
    }

    match state.capture.start(interface).await {
        Ok(()) => {
            let mut session = state.session.write().await;
            *session = SessionState::new();
            session.session_start = Some(Instant::now());
            session.snapshot.metrics.status = "running".to_string();
            drop(session);
            state.capture.reset_parse_errors();

            *status = SessionStatus::Running;
            drop(status);

            spawn_window_loop(state.clone());
            (true, format!("Capture started on interface {}", interface))
        }
        Err(e) => {
            tracing::warn!("Capture start failed: {}", e);
            (false, e.to_string())
        }
    }
}

/// The per-window pass: batch, compute, broadcast. One logical pass per
/// window keeps snapshots in wall-clock order.
fn spawn_window_loop(state: AppState) {
    tokio::spawn(async move {
        let window_duration = Duration::from_secs_f64(state.config.capture.window_secs);
        let read_timeout = Duration::from_secs_f64(state.config.capture.read_timeout_secs);

        loop {
            if !state.coordinator.is_running().await {
                break;
            }

            let window = collect_window(
                &state.capture,
                &state.coordinator,
                window_duration,
                read_timeout,
            )
            .await;

            // A window interrupted by a stop is abandoned unpublished.
            if !state.coordinator.is_running().await {
                break;
            }

            let hit_eof = window.eof;
            let update = {
                let mut session = state.session.write().await;
                process_window(
                    &mut session,
                    &window,
                    state.config.capture.window_secs,
                    &state.own_addrs,
                );
                ServerMessage::Update {
                    snapshot: session.snapshot.clone(),
                    new_packets: session.last_window_packets.clone(),
                    new_geolocations: std::mem::take(&mut session.new_geolocations),
                }
            };
            state.hub.broadcast(&update);

            if hit_eof {
                // The child went away; keep the window cadence instead of
                // spinning on instant EOF reads.
                tokio::time::sleep(window_duration).await;
            }
        }
        tracing::debug!("Window loop finished");
    });
}

/// Handle the slow half of a stop command in the background. The caller
/// has already sent the immediate ack; this sends the terminal
/// `command_response` (with the report) to the requesting subscriber and
/// then resets.
pub async fn stop_and_report(
    state: AppState,
    duration: Option<f64>,
    reply: mpsc::UnboundedSender<ServerMessage>,
) {
    {
        let mut status = state.coordinator.status.lock().await;
        if *status != SessionStatus::Running {
            let _ = reply.send(ServerMessage::CommandResponse {
                command: "stop_capture".to_string(),
                success: false,
                message: "Capture is not running".to_string(),
                summary: None,
            });
            return;
        }
        *status = SessionStatus::Stopping;
    }

    if let Some(duration) = duration {
        state.session.write().await.session_duration_final = Some(duration);
        tracing::info!("Client reported session duration: {}s", duration);
    }

    let stopped = state.capture.stop().await;
    let parse_errors = state.capture.parse_errors();
    if parse_errors > 0 {
        tracing::info!("Session dropped {} unparseable capture lines", parse_errors);
    }

    // Let the in-flight window observe the state change and wind down.
    tokio::time::sleep(STOP_REPORT_GRACE).await;

    {
        let mut status = state.coordinator.status.lock().await;
        *status = SessionStatus::Reporting;
    }
    state.session.write().await.snapshot.metrics.status = "stopped".to_string();

    let should_summarize = stopped && state.session.read().await.windows_observed > 0;
    let summary = if should_summarize {
        state
            .coordinator
            .is_generating_summary
            .store(true, Ordering::SeqCst);
        let report = crate::report_builder::generate_report(&state).await;
        state
            .coordinator
            .is_generating_summary
            .store(false, Ordering::SeqCst);
        Some(report)
    } else {
        if !stopped {
            tracing::info!("Summary skipped: capture was not running");
        } else {
            tracing::info!("Summary skipped: no windows were observed");
        }
        None
    };

    let message = if stopped {
        "Capture stopped successfully".to_string()
    } else {
        "Capture was not running".to_string()
    };
    let _ = reply.send(ServerMessage::CommandResponse {
        command: "stop_capture".to_string(),
        success: stopped,
        message,
        summary,
    });

    reset(&state).await;
    tracing::info!("State reset for next session");
}

/// Auto-stop when the last subscriber disconnects while Running. Nobody is
/// left to receive a report, so none is generated.
pub async fn auto_stop(state: AppState) {
    tracing::info!("Last subscriber disconnected, stopping capture");
    state.coordinator.is_resetting.store(true, Ordering::SeqCst);

    {
        let mut status = state.coordinator.status.lock().await;
        if *status != SessionStatus::Running {
            state.coordinator.is_resetting.store(false, Ordering::SeqCst);
            return;
        }
        *status = SessionStatus::Stopping;
    }
    state.capture.stop().await;
    tokio::time::sleep(AUTO_STOP_GRACE).await;

    reset(&state).await;
    state.coordinator.is_resetting.store(false, Ordering::SeqCst);
    tracing::info!("Reset complete, ready for new connections");
}

/// Swap in a freshly constructed session record and return to Idle.
async fn reset(state: &AppState) {
    state.coordinator.is_resetting.store(true, Ordering::SeqCst);
    {
        let mut session = state.session.write().await;
        *session = SessionState::new();
    }
    state.capture.reset_parse_errors();
    {
        let mut status = state.coordinator.status.lock().await;
        *status = SessionStatus::Idle;
    }
    state.coordinator.is_resetting.store(false, Ordering::SeqCst);
}
