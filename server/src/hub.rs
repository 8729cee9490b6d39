//! Subscriber registry and the dashboard command protocol.
//!
//! Each WebSocket subscriber gets an unbounded channel; broadcast walks
//! the registry and drops any subscriber whose channel has gone away, so
//! one dead connection never blocks the rest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use common::{ClientCommand, ServerMessage};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::session;
use crate::state::AppState;

/// Poll interval while waiting out a reset in progress.
const RESET_WAIT: Duration = Duration::from_millis(100);

pub struct Hub {
    subscribers: parking_lot::Mutex<HashMap<u64, mpsc::UnboundedSender<ServerMessage>>>,
    next_id: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            subscribers: parking_lot::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add(&self, sender: mpsc::UnboundedSender<ServerMessage>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, sender);
        id
    }

    pub fn remove(&self, id: u64) {
        self.subscribers.lock().remove(&id);
    }

    pub fn count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Send one message to every subscriber; failed sends deregister the
    /// subscriber and never block the others.
    pub fn broadcast(&self, message: &ServerMessage) {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|id, sender| {
            if sender.send(message.clone()).is_ok() {
                true
            } else {
                tracing::info!("Dropping dead subscriber {}", id);
                false
            }
        });
        let dropped = before - subscribers.len();
        if dropped > 0 {
            tracing::info!("Cleaned up {} disconnected subscribers", dropped);
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| subscriber_session(socket, state))
}

async fn subscriber_session(socket: WebSocket, state: AppState) {
    // Hold new subscribers at the door while a reset is in progress.
    while state.coordinator.resetting() {
        tokio::time::sleep(RESET_WAIT).await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = state.hub.add(tx.clone());
    tracing::info!("Subscriber {} connected. Total: {}", id, state.hub.count());

    // Initial state precedes any update for this subscriber.
    let interfaces = state.capture.list_interfaces().await;
    let initial = {
        let session = state.session.read().await;
        ServerMessage::InitialState {
            snapshot: session.snapshot.clone(),
            packets: session.last_window_packets.clone(),
            interfaces,
        }
    };
    let _ = tx.send(initial);

    let (mut sink, mut stream) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialize server message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let recv_tx = tx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = stream.next().await {
            match msg {
                Message::Text(text) => {
                    handle_command(&recv_state, &recv_tx, text.as_str()).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.hub.remove(id);
    tracing::info!(
        "Subscriber {} session ended. Total: {}",
        id,
        state.hub.count()
    );

    if state.hub.count() == 0 && state.coordinator.is_running().await {
        session::auto_stop(state.clone()).await;
    }
}

async fn handle_command(
    state: &AppState,
    reply: &mpsc::UnboundedSender<ServerMessage>,
    text: &str,
) {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            tracing::debug!("Unparseable subscriber command: {}", e);
            let _ = reply.send(ServerMessage::Error {
                message: format!("Unknown command: {}", text.trim()),
            });
            return;
        }
    };

    match command {
        ClientCommand::GetInterfaces => {
            let interfaces = state.capture.list_interfaces().await;
            let _ = reply.send(ServerMessage::InterfacesResponse { interfaces });
        }
        ClientCommand::StartCapture { interface } => {
            let interface = interface.unwrap_or_else(|| "1".to_string());
            let (success, message) = session::start_capture(state, &interface).await;
            let _ = reply.send(ServerMessage::CommandResponse {
                command: "start_capture".to_string(),
                success,
                message,
                summary: None,
            });
        }
        ClientCommand::StopCapture { duration } => {
            // Immediate ack; the terminal response arrives once the report
            // is ready.
            let _ = reply.send(ServerMessage::StopCaptureAck {
                success: true,
                message: "Capture stopped successfully".to_string(),
            });
            tokio::spawn(session::stop_and_report(
                state.clone(),
                duration,
                reply.clone(),
            ));
        }
        ClientCommand::GetStatus => {
            let metrics = state.session.read().await.snapshot.metrics.clone();
            let _ = reply.send(ServerMessage::StatusResponse { metrics });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::OwnAddresses;

    fn app_state() -> AppState {
        AppState::new(Config::default(), OwnAddresses::from_addrs(&["10.0.0.1"]))
    }

    #[test]
    fn test_broadcast_removes_dead_subscribers() {
        let hub = Hub::new();
        let (alive_tx, mut alive_rx) = mpsc::unbounded_channel();
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        drop(dead_rx);
        hub.add(alive_tx);
        hub.add(dead_tx);
        assert_eq!(hub.count(), 2);

        hub.broadcast(&ServerMessage::Error {
            message: "ping".to_string(),
        });
        assert_eq!(hub.count(), 1);
        assert!(alive_rx.try_recv().is_ok());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let hub = Hub::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = hub.add(tx);
        hub.remove(id);
        hub.remove(id);
        assert_eq!(hub.count(), 0);
    }

    #[tokio::test]
    async fn test_get_status_returns_metrics() {
        let state = app_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_command(&state, &tx, r#"{"command": "get_status"}"#).await;
        match rx.recv().await.unwrap() {
            ServerMessage::StatusResponse { metrics } => {
                assert_eq!(metrics.status, "stopped");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_command_yields_error() {
        let state = app_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_command(&state, &tx, r#"{"command": "reboot"}"#).await;
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerMessage::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_stop_sends_ack_then_failure_for_idle_session() {
        let state = app_state();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle_command(&state, &tx, r#"{"command": "stop_capture"}"#).await;

        // The ack always comes first.
        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerMessage::StopCaptureAck { success: true, .. }
        ));
        // Idle session: the terminal response reports failure.
        match rx.recv().await.unwrap() {
            ServerMessage::CommandResponse {
                command, success, ..
            } => {
                assert_eq!(command, "stop_capture");
                assert!(!success);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
