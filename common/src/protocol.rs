use crate::metrics::{
    EncryptionComposition, GeolocationRecord, InterfaceInfo, IpComposition, OverallMetrics,
    PacketSummary, ProtocolMetrics, SessionReport, TopTalkerEntry,
};
use serde::{Deserialize, Serialize};

/// Commands a dashboard subscriber may send over the message channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientCommand {
    GetInterfaces,
    StartCapture {
        #[serde(default)]
        interface: Option<String>,
    },
    StopCapture {
        #[serde(default)]
        duration: Option<f64>,
    },
    GetStatus,
}

/// Everything a broadcast carries besides the packet list: the overall
/// record, all per-dimension records, the compositions and the top talkers.
///
/// Flattened into both `initial_state` and `update` so the two messages
/// stay field-compatible.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub metrics: OverallMetrics,
    #[serde(rename = "packets_Per_Second")]
    pub packets_per_second: f64,
    pub tcp_metrics: ProtocolMetrics,
    pub rtp_metrics: ProtocolMetrics,
    pub udp_metrics: ProtocolMetrics,
    pub quic_metrics: ProtocolMetrics,
    pub dns_metrics: ProtocolMetrics,
    pub igmp_metrics: ProtocolMetrics,
    pub ipv4_metrics: ProtocolMetrics,
    pub ipv6_metrics: ProtocolMetrics,
    pub ip_composition: IpComposition,
    pub encryption_composition: EncryptionComposition,
    pub top_talkers: Vec<TopTalkerEntry>,
}

/// Messages the server sends to subscribers. Each variant carries a distinct
/// JSON representation with a "type" tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    InterfacesResponse {
        interfaces: Vec<InterfaceInfo>,
    },
    InitialState {
        #[serde(flatten)]
        snapshot: MetricsSnapshot,
        packets: Vec<PacketSummary>,
        interfaces: Vec<InterfaceInfo>,
    },
    Update {
        #[serde(flatten)]
        snapshot: MetricsSnapshot,
        new_packets: Vec<PacketSummary>,
        new_geolocations: Vec<GeolocationRecord>,
    },
    CommandResponse {
        command: String,
        success: bool,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<SessionReport>,
    },
    StopCaptureAck {
        success: bool,
        message: String,
    },
    StatusResponse {
        metrics: OverallMetrics,
    },
    Error {
        message: String,
    },
}
