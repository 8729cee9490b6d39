//! Parsed capture-tool output lines and per-packet classification.
//!
//! One line of the child process output becomes one [`PacketRecord`]. Every
//! field is optional: an empty column is an absent value, and a column that
//! fails numeric conversion is treated as absent rather than as an error.

use chrono::{Local, TimeZone};
use common::PacketSummary;

/// Number of `-e` fields in the capture command template. Lines with fewer
/// columns are unparseable and get dropped.
pub const FIELD_COUNT: usize = 32;

/// Protocol categories used for the distribution and the per-dimension
/// metrics records. Closed set; every packet maps to exactly one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolCategory {
    Tcp,
    Udp,
    Rtp,
    Quic,
    Dns,
    Tls,
    Igmp,
    Others,
}

impl ProtocolCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolCategory::Tcp => "TCP",
            ProtocolCategory::Udp => "UDP",
            ProtocolCategory::Rtp => "RTP",
            ProtocolCategory::Quic => "QUIC",
            ProtocolCategory::Dns => "DNS",
            ProtocolCategory::Tls => "TLS",
            ProtocolCategory::Igmp => "IGMP",
            ProtocolCategory::Others => "Others",
        }
    }

    /// First match wins: exact transport names, then RTP/SRTP, then the
    /// TLS and IGMP substring tests.
    pub fn from_label(label: Option<&str>) -> Self {
        let label = match label {
            Some(l) if !l.is_empty() => l.trim().to_uppercase(),
            _ => return ProtocolCategory::Others,
        };
        match label.as_str() {
            "TCP" => ProtocolCategory::Tcp,
            "UDP" => ProtocolCategory::Udp,
            "QUIC" => ProtocolCategory::Quic,
            "DNS" => ProtocolCategory::Dns,
            "RTP" | "SRTP" => ProtocolCategory::Rtp,
            other if other.contains("TLS") => ProtocolCategory::Tls,
            other if other.contains("IGMP") => ProtocolCategory::Igmp,
            _ => ProtocolCategory::Others,
        }
    }
}

/// Map IP protocol numbers to transport names; used to tie-break stream
/// classification when the protocol label is absent or application-level.
pub fn ip_proto_name(proto: u8) -> Option<&'static str> {
    match proto {
        6 => Some("tcp"),
        17 => Some("udp"),
        1 => Some("icmp"),
        2 => Some("igmp"),
        47 => Some("gre"),
        50 => Some("esp"),
        51 => Some("ah"),
        _ => None,
    }
}

/// Grouping key for a flow stream: `(category, discriminator)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub category: String,
    pub discriminator: String,
}

impl FlowKey {
    fn new(category: &str, discriminator: &str) -> Self {
        Self {
            category: category.to_string(),
            discriminator: discriminator.to_string(),
        }
    }
}

/// One packet record as emitted by the capture tool, fields in command
/// order. Absence is distinct from zero throughout.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketRecord {
    pub frame_number: Option<u64>,
    pub time_epoch: Option<f64>,
    pub ip_src: Option<String>,
    pub ip_dst: Option<String>,
    pub frame_len: Option<u64>,
    pub protocol: Option<String>,
    pub info: Option<String>,
    pub tcp_stream: Option<String>,
    pub udp_stream: Option<String>,
    pub tcp_ack_rtt: Option<f64>,
    pub tcp_retransmission: bool,
    pub tcp_fast_retransmission: bool,
    pub tcp_spurious_retransmission: bool,
    pub rtp_ssrc: Option<String>,
    pub rtp_seq: Option<u16>,
    pub ip_proto: Option<u8>,
    pub ipv6_src: Option<String>,
    pub ipv6_dst: Option<String>,
    pub rtp_timestamp: Option<u32>,
    pub rtp_payload_type: Option<u8>,
    pub ipv6_nxt: Option<u8>,
    pub tcp_len: Option<u64>,
    pub udp_length: Option<u64>,
    pub tcp_srcport: Option<u16>,
    pub tcp_dstport: Option<u16>,
    pub udp_srcport: Option<u16>,
    pub udp_dstport: Option<u16>,
    pub dns_query: Option<String>,
    pub dns_a: Option<String>,
    pub dns_aaaa: Option<String>,
    pub tls_sni: Option<String>,
    pub quic_sni: Option<String>,
}

fn opt_str(field: &str) -> Option<String> {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn opt_num<T: std::str::FromStr>(field: &str) -> Option<T> {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse().ok()
}

/// Flag columns print "1" when the analysis flag fired; anything empty or
/// "0" is unset.
fn flag(field: &str) -> bool {
    let trimmed = field.trim();
    !trimmed.is_empty() && trimmed != "0"
}

impl PacketRecord {
    /// Parse one separator-delimited output line. Returns `None` when the
    /// line does not have the expected column count; individual field
    /// conversion failures degrade to absent values instead.
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < FIELD_COUNT {
            return None;
        }
        Some(Self {
            frame_number: opt_num(parts[0]),
            time_epoch: opt_num(parts[1]),
            ip_src: opt_str(parts[2]),
            ip_dst: opt_str(parts[3]),
            frame_len: opt_num(parts[4]),
            protocol: opt_str(parts[5]),
            info: opt_str(parts[6]),
            tcp_stream: opt_str(parts[7]),
            udp_stream: opt_str(parts[8]),
            tcp_ack_rtt: opt_num(parts[9]),
            tcp_retransmission: flag(parts[10]),
            tcp_fast_retransmission: flag(parts[11]),
            tcp_spurious_retransmission: flag(parts[12]),
            rtp_ssrc: opt_str(parts[13]),
            rtp_seq: opt_num(parts[14]),
            ip_proto: opt_num(parts[15]),
            ipv6_src: opt_str(parts[16]),
            ipv6_dst: opt_str(parts[17]),
            rtp_timestamp: opt_num(parts[18]),
            rtp_payload_type: opt_num(parts[19]),
            ipv6_nxt: opt_num(parts[20]),
            tcp_len: opt_num(parts[21]),
            udp_length: opt_num(parts[22]),
            tcp_srcport: opt_num(parts[23]),
            tcp_dstport: opt_num(parts[24]),
            udp_srcport: opt_num(parts[25]),
            udp_dstport: opt_num(parts[26]),
            dns_query: opt_str(parts[27]),
            dns_a: opt_str(parts[28]),
            dns_aaaa: opt_str(parts[29]),
            tls_sni: opt_str(parts[30]),
            quic_sni: opt_str(parts[31]),
        })
    }

    /// Render back to a capture line; inverse of [`PacketRecord::parse`]
    /// for synthetic test input.
    #[cfg(test)]
    pub fn render(&self) -> String {
        fn s<T: ToString>(v: &Option<T>) -> String {
            v.as_ref().map(|x| x.to_string()).unwrap_or_default()
        }
        fn f(v: bool) -> &'static str {
            if v {
                "1"
            } else {
                ""
            }
        }
        [
            s(&self.frame_number),
            s(&self.time_epoch),
            s(&self.ip_src),
            s(&self.ip_dst),
            s(&self.frame_len),
            s(&self.protocol),
            s(&self.info),
            s(&self.tcp_stream),
            s(&self.udp_stream),
            s(&self.tcp_ack_rtt),
            f(self.tcp_retransmission).to_string(),
            f(self.tcp_fast_retransmission).to_string(),
            f(self.tcp_spurious_retransmission).to_string(),
            s(&self.rtp_ssrc),
            s(&self.rtp_seq),
            s(&self.ip_proto),
            s(&self.ipv6_src),
            s(&self.ipv6_dst),
            s(&self.rtp_timestamp),
            s(&self.rtp_payload_type),
            s(&self.ipv6_nxt),
            s(&self.tcp_len),
            s(&self.udp_length),
            s(&self.tcp_srcport),
            s(&self.tcp_dstport),
            s(&self.udp_srcport),
            s(&self.udp_dstport),
            s(&self.dns_query),
            s(&self.dns_a),
            s(&self.dns_aaaa),
            s(&self.tls_sni),
            s(&self.quic_sni),
        ]
        .join("|")
    }

    /// Source address, IPv4 column first.
    pub fn src_addr(&self) -> Option<&str> {
        self.ip_src.as_deref().or(self.ipv6_src.as_deref())
    }

    /// Destination address, IPv4 column first.
    pub fn dst_addr(&self) -> Option<&str> {
        self.ip_dst.as_deref().or(self.ipv6_dst.as_deref())
    }

    /// Destination port from whichever transport populated one.
    pub fn dst_port(&self) -> Option<u16> {
        self.tcp_dstport.or(self.udp_dstport)
    }

    pub fn category(&self) -> ProtocolCategory {
        ProtocolCategory::from_label(self.protocol.as_deref())
    }

    /// Flow-stream key. The IP protocol number (and the IPv6 next-header)
    /// tie-break when the label is an application protocol riding the
    /// transport.
    pub fn flow_key(&self) -> FlowKey {
        let label = self
            .protocol
            .as_deref()
            .map(|p| p.trim().to_lowercase())
            .unwrap_or_default();
        let by_proto = self.ip_proto.and_then(ip_proto_name);
        let by_nxt = self.ipv6_nxt.and_then(ip_proto_name);

        let is_tcp = label == "tcp" || by_proto == Some("tcp") || by_nxt == Some("tcp");
        let is_udp = by_proto == Some("udp") || by_nxt == Some("udp");

        if is_tcp {
            if let Some(stream) = &self.tcp_stream {
                return FlowKey::new("tcp", stream);
            }
        }
        if is_udp {
            if label.to_uppercase().contains("RTP") {
                if let Some(ssrc) = &self.rtp_ssrc {
                    return FlowKey::new("rtp", ssrc);
                }
            }
            if let Some(stream) = &self.udp_stream {
                return FlowKey::new("udp", stream);
            }
        }
        if label.to_uppercase().contains("RTP") {
            if let Some(ssrc) = &self.rtp_ssrc {
                return FlowKey::new("rtp", ssrc);
            }
        }
        let category = if label.is_empty() {
            "n/a".to_string()
        } else {
            label
        };
        FlowKey {
            category,
            discriminator: "misc".to_string(),
        }
    }

    /// Display row, formatted once at parse time so broadcasts never
    /// re-parse.
    pub fn summary(&self) -> PacketSummary {
        let time = match self.time_epoch {
            Some(epoch) => {
                let secs = epoch.floor() as i64;
                let millis = ((epoch - epoch.floor()) * 1000.0) as u32;
                match Local.timestamp_opt(secs, millis * 1_000_000) {
                    chrono::LocalResult::Single(dt) => dt.format("%H:%M:%S%.3f").to_string(),
                    _ => epoch.to_string(),
                }
            }
            None => "N/A".to_string(),
        };
        let na = || "N/A".to_string();
        PacketSummary {
            no: self
                .frame_number
                .map(|n| n.to_string())
                .unwrap_or_else(na),
            time,
            source: self.src_addr().map(str::to_string).unwrap_or_else(na),
            destination: self.dst_addr().map(str::to_string).unwrap_or_else(na),
            protocol: self.protocol.clone().unwrap_or_else(na),
            length: self
                .frame_len
                .map(|l| l.to_string())
                .unwrap_or_else(|| "0".to_string()),
            info: self.info.clone().unwrap_or_else(na),
        }
    }
}
