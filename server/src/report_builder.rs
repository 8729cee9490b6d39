//! End-of-session report generation.
//!
//! Pre-aggregates the cumulative session state into a structured payload
//! (no history arrays are consulted), hands it to the external text
//! generator, and falls back to a deterministic prose rendering of the
//! same numbers when the generator is unavailable or misbehaves.

use std::collections::BTreeMap;

use common::{ReportSection, SessionReport};
use serde::Serialize;

use crate::state::{AppState, SessionState};

const GENERATOR_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-flash-latest:generateContent";

/// Raw bits to a human-readable rate with the best unit.
pub fn format_throughput(bits: f64) -> String {
    const GBPS: f64 = 1_000_000_000.0;
    const MBPS: f64 = 1_000_000.0;
    const KBPS: f64 = 1_000.0;
    if bits == 0.0 {
        "0.0 bps".to_string()
    } else if bits >= GBPS {
        format!("{} Gbps", round2(bits / GBPS))
    } else if bits >= MBPS {
        format!("{} Mbps", round2(bits / MBPS))
    } else if bits >= KBPS {
        format!("{} Kbps", round2(bits / KBPS))
    } else {
        format!("{} bps", round2(bits))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Serialize)]
pub struct ReportData {
    session_duration_seconds: f64,
    overall_throughput: OverallBlock,
    ip_composition: IpBlock,
    encryption_composition: EncryptionBlock,
    protocol_data: BTreeMap<String, ProtocolBlock>,
}

#[derive(Debug, Serialize)]
struct OverallBlock {
    total_packets: u64,
    average_pps: String,
    average_inbound_throughput: String,
    average_outbound_throughput: String,
    average_inbound_goodput: String,
    average_outbound_goodput: String,
}

#[derive(Debug, Serialize)]
struct IpBlock {
    total_packets: u64,
    ipv4_packets: u64,
    ipv6_packets: u64,
    ipv4_percentage: f64,
    ipv6_percentage: f64,
}

#[derive(Debug, Serialize)]
struct EncryptionBlock {
    total_packets: u64,
    encrypted_packets: u64,
    unencrypted_packets: u64,
    encrypted_percentage: f64,
    unencrypted_percentage: f64,
}

#[derive(Debug, Serialize)]
struct ProtocolBlock {
    total_packets: u64,
    average_pps: String,
    average_inbound_throughput: String,
    average_outbound_throughput: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    average_latency: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_retransmissions: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retransmission_percentage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    average_jitter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_packet_loss: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    packet_loss_percentage: Option<String>,
}

/// Read the report payload straight off the running aggregators and
/// composition counters.
pub fn build_report_data(session: &SessionState) -> ReportData {
    let duration = session.session_duration_secs().max(0.0);
    let distribution = &session.protocol_distribution;
    let total_packets: u64 = distribution.values().sum();

    let pps = |count: u64| {
        if duration > 0.0 {
            format!("{} PPS", round2(count as f64 / duration))
        } else {
            "0 PPS".to_string()
        }
    };

    let overall_throughput = OverallBlock {
        total_packets,
        average_pps: pps(total_packets),
        average_inbound_throughput: format_throughput(session.agg.overall.inbound_avg()),
        average_outbound_throughput: format_throughput(session.agg.overall.outbound_avg()),
        average_inbound_goodput: format_throughput(session.agg.goodput.inbound_avg()),
        average_outbound_goodput: format_throughput(session.agg.goodput.outbound_avg()),
    };

    let ip = &session.snapshot.ip_composition;
    let ip_composition = IpBlock {
        total_packets: ip.ipv4_packets_cumulative + ip.ipv6_packets_cumulative,
        ipv4_packets: ip.ipv4_packets_cumulative,
        ipv6_packets: ip.ipv6_packets_cumulative,
        ipv4_percentage: round2(ip.ipv4_percentage),
        ipv6_percentage: round2(ip.ipv6_percentage),
    };

    let enc = &session.snapshot.encryption_composition;
    let encryption_composition = EncryptionBlock {
        total_packets: enc.encrypted_packets_cumulative + enc.unencrypted_packets_cumulative,
        encrypted_packets: enc.encrypted_packets_cumulative,
        unencrypted_packets: enc.unencrypted_packets_cumulative,
        encrypted_percentage: round2(enc.encrypted_percentage),
        unencrypted_percentage: round2(enc.unencrypted_percentage),
    };

    let mut protocol_data = BTreeMap::new();
    let dims: [(&str, &crate::state::RateAggregate); 6] = [
        ("TCP", &session.agg.tcp),
        ("RTP", &session.agg.rtp),
        ("UDP", &session.agg.udp),
        ("QUIC", &session.agg.quic),
        ("DNS", &session.agg.dns),
        ("IGMP", &session.agg.igmp),
    ];
    for (name, agg) in dims {
        let count = distribution.get(name).copied().unwrap_or(0);
        let mut block = ProtocolBlock {
            total_packets: count,
            average_pps: pps(count),
            average_inbound_throughput: format_throughput(agg.inbound_avg()),
            average_outbound_throughput: format_throughput(agg.outbound_avg()),
            average_latency: None,
            total_retransmissions: None,
            retransmission_percentage: None,
            average_jitter: None,
            total_packet_loss: None,
            packet_loss_percentage: None,
        };
        if name == "TCP" {
            block.average_latency = Some(format!("{} ms", round2(session.agg.tcp_latency.avg())));
            block.total_retransmissions = Some(session.tcp_retrans_total);
            block.retransmission_percentage = Some(format!(
                "{} %",
                round2(
                    session.tcp_retrans_total as f64 * 100.0
                        / session.tcp_packets_total.max(1) as f64
                )
            ));
        }
        if name == "RTP" {
            block.average_jitter = Some(format!("{} ms", round2(session.agg.rtp_jitter.avg())));
            block.total_packet_loss = Some(session.rtp_loss_total);
            block.packet_loss_percentage = Some(format!(
                "{} %",
                round2(
                    session.rtp_loss_total as f64 * 100.0
                        / (session.rtp_expected_total + session.rtp_loss_total).max(1) as f64
                )
            ));
        }
        protocol_data.insert(name.to_string(), block);
    }

    ReportData {
        session_duration_seconds: round2(duration),
        overall_throughput,
        ip_composition,
        encryption_composition,
        protocol_data,
    }
}

/// Generate the session report. Absent API key yields a disabled notice;
/// a failing generator yields the deterministic fallback rendering.
pub async fn generate_report(state: &AppState) -> SessionReport {
    let data = {
        let session = state.session.read().await;
        build_report_data(&session)
    };

    let Some(api_key) = std::env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty()) else {
        tracing::info!("GEMINI_API_KEY not configured, report generation disabled");
        return SessionReport {
            summary: "AI summary is unavailable. API key is not configured.".to_string(),
            breakdown: vec![],
        };
    };

    match call_generator(&data, &api_key).await {
        Ok(report) => report,
        Err(e) => {
            tracing::warn!("Report generator failed ({}), using fallback report", e);
            fallback_report(&data)
        }
    }
}

fn prompt(data: &ReportData) -> String {
    let payload = serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string());
    format!(
        "You are an expert network analyst who formats pre-calculated data into a JSON report.\n\
         Your entire response MUST be a single, valid JSON object with \"summary\" and \"breakdown\" keys.\n\
         \n\
         INSTRUCTIONS:\n\
         1. summary: write a one-paragraph overview of the network session based on the provided data.\n\
         2. breakdown: a JSON array whose objects each have three keys: protocol, keyMetrics, observations.\n\
         3. protocol: the metric category name (e.g. \"Overall Throughput\", \"IP Composition\", \"TCP\").\n\
         4. keyMetrics: a single multi-line string of 'Key: Value' lines, keeping the units already present in the data.\n\
         5. observations: one concise sentence with a key insight for that category.\n\
         6. Generate a breakdown object for every category in the data, even when its packet count is 0.\n\
         7. Do NOT perform any calculations; only format the provided numbers.\n\
         \n\
         Pre-Calculated Data for Formatting:\n{}",
        payload
    )
}

async fn call_generator(data: &ReportData, api_key: &str) -> Result<SessionReport, String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| e.to_string())?;

    let body = serde_json::json!({
        "contents": [{ "parts": [{ "text": prompt(data) }] }]
    });
    let response = client
        .post(format!("{}?key={}", GENERATOR_URL, api_key))
        .json(&body)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("generator returned {}", response.status()));
    }
    let value: serde_json::Value = response.json().await.map_err(|e| e.to_string())?;
    let text = value["candidates"][0]["content"]["parts"][0]["text"]
        .as_str()
        .ok_or("no text in generator response")?;

    parse_report_json(text).ok_or_else(|| "no valid JSON object in generator response".to_string())
}

/// Generators wrap their JSON in prose or code fences; take the outermost
/// object.
fn parse_report_json(text: &str) -> Option<SessionReport> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Deterministic rendering of the payload, used when the generator is
/// unreachable or returns garbage.
fn fallback_report(data: &ReportData) -> SessionReport {
    let overall = &data.overall_throughput;
    let ip = &data.ip_composition;
    let enc = &data.encryption_composition;

    let summary = format!(
        "The capture session lasted {} seconds and observed {} packets ({}). \
         Average inbound throughput was {} ({} goodput) and average outbound throughput \
         was {} ({} goodput). {}% of packets were encrypted and {}% used IPv4.",
        data.session_duration_seconds,
        overall.total_packets,
        overall.average_pps,
        overall.average_inbound_throughput,
        overall.average_inbound_goodput,
        overall.average_outbound_throughput,
        overall.average_outbound_goodput,
        enc.encrypted_percentage,
        ip.ipv4_percentage,
    );

    let mut breakdown = vec![
        ReportSection {
            protocol: "Overall Throughput".to_string(),
            key_metrics: format!(
                "Total Packets: {}\nAverage PPS: {}\nAverage Inbound Throughput: {}\n\
                 Average Outbound Throughput: {}\nAverage Inbound Goodput: {}\n\
                 Average Outbound Goodput: {}",
                overall.total_packets,
                overall.average_pps,
                overall.average_inbound_throughput,
                overall.average_outbound_throughput,
                overall.average_inbound_goodput,
                overall.average_outbound_goodput,
            ),
            observations: "Totals are aggregated over the whole session.".to_string(),
        },
        ReportSection {
            protocol: "IP Composition".to_string(),
            key_metrics: format!(
                "Total IP Packets: {}\nTotal IPv4 Packets: {} ({}%)\nTotal IPv6 Packets: {} ({}%)",
                ip.total_packets,
                ip.ipv4_packets,
                ip.ipv4_percentage,
                ip.ipv6_packets,
                ip.ipv6_percentage,
            ),
            observations: if ip.ipv4_percentage >= ip.ipv6_percentage {
                "Traffic was predominantly IPv4.".to_string()
            } else {
                "Traffic was predominantly IPv6.".to_string()
            },
        },
        ReportSection {
            protocol: "Encryption Composition".to_string(),
            key_metrics: format!(
                "Total Encrypted Packets: {} ({}%)\nTotal Unencrypted Packets: {} ({}%)",
                enc.encrypted_packets,
                enc.encrypted_percentage,
                enc.unencrypted_packets,
                enc.unencrypted_percentage,
            ),
            observations: if enc.encrypted_percentage >= 50.0 {
                "Most observed traffic was encrypted.".to_string()
            } else {
                "Most observed traffic was unencrypted.".to_string()
            },
        },
    ];

    for (name, block) in &data.protocol_data {
        let mut lines = format!(
            "Total Packets: {}\nAverage PPS: {}\nAverage Inbound Throughput: {}\n\
             Average Outbound Throughput: {}",
            block.total_packets,
            block.average_pps,
            block.average_inbound_throughput,
            block.average_outbound_throughput,
        );
        if let (Some(latency), Some(retrans), Some(pct)) = (
            &block.average_latency,
            &block.total_retransmissions,
            &block.retransmission_percentage,
        ) {
            lines.push_str(&format!(
                "\nAverage Latency: {}\nTotal Retransmissions: {}\nRetransmission Percentage: {}",
                latency, retrans, pct
            ));
        }
        if let (Some(jitter), Some(loss), Some(pct)) = (
            &block.average_jitter,
            &block.total_packet_loss,
            &block.packet_loss_percentage,
        ) {
            lines.push_str(&format!(
                "\nAverage Jitter: {}\nTotal Packet Loss: {}\nPacket Loss Percentage: {}",
                jitter, loss, pct
            ));
        }
        breakdown.push(ReportSection {
            protocol: name.clone(),
            key_metrics: lines,
            observations: format!(
                "{} accounted for {} packets during the session.",
                name, block.total_packets
            ),
        });
    }

    SessionReport { summary, breakdown }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SessionState;

    #[test]
    fn test_format_throughput_units() {
        assert_eq!(format_throughput(0.0), "0.0 bps");
        assert_eq!(format_throughput(512.0), "512 bps");
        assert_eq!(format_throughput(8_000.0), "8 Kbps");
        assert_eq!(format_throughput(8_000_000.0), "8 Mbps");
        assert_eq!(format_throughput(2_500_000_000.0), "2.5 Gbps");
    }

    #[test]
    fn test_report_data_reads_aggregators_only() {
        let mut session = SessionState::new();
        session.session_duration_final = Some(10.0);
        session.agg.overall.observe(80_000_000.0, 40_000_000.0, 10.0);
        session.agg.tcp.observe(80_000_000.0, 40_000_000.0, 10.0);
        session.agg.tcp_latency.observe(40.0);
        session.tcp_packets_total = 1000;
        session.tcp_retrans_total = 20;
        *session.protocol_distribution.get_mut("TCP").unwrap() = 1000;

        let data = build_report_data(&session);
        assert_eq!(data.session_duration_seconds, 10.0);
        assert_eq!(data.overall_throughput.total_packets, 1000);
        assert_eq!(data.overall_throughput.average_pps, "100 PPS");
        assert_eq!(data.overall_throughput.average_inbound_throughput, "8 Mbps");
        let tcp = &data.protocol_data["TCP"];
        assert_eq!(tcp.average_latency.as_deref(), Some("40 ms"));
        assert_eq!(tcp.total_retransmissions, Some(20));
        assert_eq!(tcp.retransmission_percentage.as_deref(), Some("2 %"));
    }

    #[test]
    fn test_fallback_report_contains_numbers() {
        let mut session = SessionState::new();
        session.session_duration_final = Some(5.0);
        session.agg.overall.observe(40_000_000.0, 0.0, 5.0);
        *session.protocol_distribution.get_mut("UDP").unwrap() = 500;
        let data = build_report_data(&session);

        let report = fallback_report(&data);
        assert!(report.summary.contains("500 packets"));
        assert!(report.summary.contains("8 Mbps"));
        // Overall + IP + Encryption + six protocols.
        assert_eq!(report.breakdown.len(), 9);
        assert!(report
            .breakdown
            .iter()
            .any(|section| section.protocol == "UDP" && section.key_metrics.contains("500")));
    }

    #[test]
    fn test_parse_report_json_extracts_wrapped_object() {
        let text = "Here you go:\n```json\n{\"summary\": \"fine\", \"breakdown\": []}\n```";
        let report = parse_report_json(text).unwrap();
        assert_eq!(report.summary, "fine");
        assert!(parse_report_json("no json here").is_none());
    }
}
