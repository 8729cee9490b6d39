//! Fixed wall-clock batching of parsed packets.
//!
//! One [`Window`] accumulates packets for the configured duration D and is
//! then moved to the metrics engine; a fresh one is allocated for the next
//! pass.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use common::PacketSummary;

use crate::capture_source::{CaptureSource, ReadOutcome};
use crate::packet::{FlowKey, PacketRecord};
use crate::session::Coordinator;

#[derive(Debug, Default)]
pub struct Window {
    /// Flow-stream key to packets of that stream, in arrival order.
    pub streams: HashMap<FlowKey, Vec<PacketRecord>>,
    /// Display rows in global arrival order.
    pub history: Vec<PacketSummary>,
    /// True when the capture source reported end of stream.
    pub eof: bool,
}

impl Window {
    pub fn push(&mut self, pkt: PacketRecord) {
        self.history.push(pkt.summary());
        self.streams.entry(pkt.flow_key()).or_default().push(pkt);
    }

    pub fn packet_count(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

/// Read lines from the capture source until the window duration elapses,
/// the session leaves Running, or the source reports EOF. Read timeouts
/// are a normal condition and keep the loop going so stop requests are
/// observed within one deadline period.
pub async fn collect_window(
    capture: &CaptureSource,
    coordinator: &Coordinator,
    window_duration: Duration,
    read_timeout: Duration,
) -> Window {
    let started = Instant::now();
    let mut window = Window::default();

    while started.elapsed() < window_duration {
        if !coordinator.is_running().await {
            break;
        }
        match capture.read_line(read_timeout).await {
            ReadOutcome::Timeout => continue,
            ReadOutcome::Eof => {
                window.eof = true;
                break;
            }
            ReadOutcome::Line(line) => {
                if line.is_empty() {
                    continue;
                }
                match PacketRecord::parse(&line) {
                    Some(pkt) => window.push(pkt),
                    None => capture.record_parse_error(),
                }
            }
        }
    }

    window
}
