use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metrics record published for a single protocol dimension (tcp, udp, rtp,
/// quic, dns, igmp, ipv4, ipv6).
///
/// The throughput fields are per-window rates in bits per second; the
/// `_peak` / `_avg` fields are maintained across the whole session. The
/// latency/retransmission fields are only populated for TCP and the
/// jitter/loss fields only for RTP; all other dimensions leave them unset
/// so they never appear on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProtocolMetrics {
    pub inbound_packets: u64,
    pub outbound_packets: u64,
    pub packets_per_second: f64,

    // Bits per second over the capture window
    pub inbound_throughput: f64,
    pub outbound_throughput: f64,
    pub inbound_throughput_peak: f64,
    pub inbound_throughput_avg: f64,
    pub outbound_throughput_peak: f64,
    pub outbound_throughput_avg: f64,

    // TCP only: weighted ack-RTT latency in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_peak: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_avg: Option<f64>,

    // RTP only: RFC 3550 jitter in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_peak: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_avg: Option<f64>,

    // TCP: cumulative retransmissions; RTP: cumulative sequence-gap loss
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_loss: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_loss_percentage: Option<f64>,
}

/// Session-wide metrics record carried in every update.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct OverallMetrics {
    pub inbound_throughput: f64,
    pub outbound_throughput: f64,
    pub inbound_throughput_peak: f64,
    pub inbound_throughput_avg: f64,
    pub outbound_throughput_peak: f64,
    pub outbound_throughput_avg: f64,

    // Application-layer useful bits per second (headers and retransmitted
    // payload excluded)
    pub inbound_goodput: f64,
    pub outbound_goodput: f64,
    pub inbound_goodput_peak: f64,
    pub inbound_goodput_avg: f64,
    pub outbound_goodput_peak: f64,
    pub outbound_goodput_avg: f64,

    pub latency: f64,
    pub jitter: f64,
    pub packet_loss_count: u64,
    pub packet_loss_percent: f64,
    pub packets_per_second: f64,

    /// "running" or "stopped"
    pub status: String,
    /// ISO-8601 timestamp of the last engine pass
    pub last_update: Option<String>,
    pub protocol_distribution: BTreeMap<String, u64>,
    #[serde(rename = "streamCount")]
    pub stream_count: usize,
    #[serde(rename = "totalPackets")]
    pub total_packets: usize,
}

/// IPv4/IPv6 split: per-window counts plus cumulative counts, with
/// percentages always derived from the cumulative sums.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct IpComposition {
    pub ipv4_packets: u64,
    pub ipv6_packets: u64,
    pub ipv4_packets_cumulative: u64,
    pub ipv6_packets_cumulative: u64,
    pub total_packets: u64,
    pub ipv4_percentage: f64,
    pub ipv6_percentage: f64,
}

/// Encrypted/unencrypted split, same window/cumulative shape as
/// [`IpComposition`].
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EncryptionComposition {
    pub encrypted_packets: u64,
    pub unencrypted_packets: u64,
    pub encrypted_packets_cumulative: u64,
    pub unencrypted_packets_cumulative: u64,
    pub total_packets: u64,
    pub encrypted_percentage: f64,
    pub unencrypted_percentage: f64,
}

/// Wire form of one top-talkers row: `[src, dst, packets, bytes]` with the
/// byte count rendered as a string.
pub type TopTalkerEntry = (String, String, u64, String);

/// Application descriptor produced by the app detector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppInfo {
    pub app: String,
    pub category: String,
}

impl AppInfo {
    pub fn unknown() -> Self {
        Self {
            app: "Unknown".to_string(),
            category: "Other".to_string(),
        }
    }
}

impl Default for AppInfo {
    fn default() -> Self {
        Self::unknown()
    }
}

/// One geolocation enrichment result, annotated with whatever was learned
/// passively about the address (reverse DNS name, observed DNS name, app).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeolocationRecord {
    pub ip: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub city: String,
    pub country: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<AppInfo>,
}

/// Display row for one captured packet, formatted once at parse time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PacketSummary {
    pub no: String,
    pub time: String,
    pub source: String,
    pub destination: String,
    pub protocol: String,
    pub length: String,
    pub info: String,
}

/// A capture interface as enumerated by the capture tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub id: String,
    pub name: String,
    pub full_path: String,
}

/// End-of-session analytical report.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionReport {
    pub summary: String,
    pub breakdown: Vec<ReportSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportSection {
    pub protocol: String,
    #[serde(rename = "keyMetrics")]
    pub key_metrics: String,
    pub observations: String,
}
