//! Per-window metrics computation and the cumulative aggregator updates.
//!
//! Consumes a closed [`Window`] and produces a fresh snapshot of every
//! metrics record. Per-packet field problems drop that packet's
//! contribution silently; an empty window zeroes the per-window fields
//! while leaving all cumulative state untouched.

use common::{EncryptionComposition, IpComposition, OverallMetrics, ProtocolMetrics};

use crate::app_detector::detect_application;
use crate::packet::{PacketRecord, ProtocolCategory};
use crate::state::{OwnAddresses, RateAggregate, SessionState};
use crate::window::Window;

pub const IPV4_HEADER: u64 = 20;
pub const IPV6_HEADER: u64 = 40;
pub const UDP_HEADER: u64 = 8;
pub const RTP_HEADER: u64 = 12;

/// Labels whose presence marks a packet as encrypted traffic.
const ENCRYPTED_MARKERS: [&str; 18] = [
    "TLS", "SSL", "DTLS", "QUIC", "SSH", "IPSEC", "ESP", "AH", "HTTPS", "SKYPE", "SMTPS",
    "IMAPS", "POP3S", "FTPS", "SFTP", "SRTP", "LDAPS", "DNSSEC",
];

/// RTP clock rates worth snapping a dynamic estimate to.
const KNOWN_CLOCK_RATES: [f64; 6] = [8000.0, 16000.0, 22050.0, 44100.0, 48000.0, 90000.0];

/// Dynamic detection considers at most this many buffered packets.
const CLOCK_DETECTION_PACKETS: usize = 5;

/// Static payload-type table (RFC 3551 assignments).
pub fn payload_clock_rate(payload_type: u8) -> Option<u32> {
    match payload_type {
        0 | 3 | 4 | 5 | 7 | 8 | 9 | 12 | 13 | 15 | 18 => Some(8000),
        6 => Some(16000),
        10 | 11 => Some(44100),
        16 => Some(11025),
        17 => Some(22050),
        14 | 26 | 31 | 32 | 33 | 34 => Some(90000),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DetectionSample {
    pub arrival: f64,
    pub rtp_ts: u32,
}

/// RFC 3550 interarrival-jitter state for one SSRC. The clock rate freezes
/// once determined.
#[derive(Debug, Default, Clone)]
pub struct JitterState {
    pub jitter: f64,
    pub prev_transit: Option<i64>,
    pub clock_rate: Option<u32>,
    pub detection: Vec<DetectionSample>,
}

/// Estimate the clock rate from the first valid consecutive pair of
/// buffered packets, snapping to the nearest known rate within 15%
/// tolerance; out-of-tolerance estimates fall back on magnitude.
pub fn detect_dynamic_clock_rate(samples: &[DetectionSample]) -> Option<u32> {
    for pair in samples.windows(2).take(CLOCK_DETECTION_PACKETS - 1) {
        let time_diff = pair[1].arrival - pair[0].arrival;
        let ts_diff = pair[1].rtp_ts as i64 - pair[0].rtp_ts as i64;
        if time_diff <= 0.0 || ts_diff <= 0 {
            continue;
        }
        let rate = ts_diff as f64 / time_diff;
        let snapped = KNOWN_CLOCK_RATES
            .iter()
            .filter(|known| ((rate - **known).abs() / **known) < 0.15)
            .min_by(|a, b| {
                (rate - **a)
                    .abs()
                    .partial_cmp(&(rate - **b).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        return Some(match snapped {
            Some(known) => *known as u32,
            None if rate < 20000.0 => 8000,
            None => 90000,
        });
    }
    None
}

/// A retransmission for loss/goodput purposes: flagged and not spurious.
fn is_retransmission(pkt: &PacketRecord) -> bool {
    (pkt.tcp_retransmission || pkt.tcp_fast_retransmission) && !pkt.tcp_spurious_retransmission
}

fn is_encrypted(label: &str) -> bool {
    let upper = label.to_uppercase();
    ENCRYPTED_MARKERS.iter().any(|marker| upper.contains(marker))
}

/// Application-layer payload bytes of one packet, per the goodput rules.
fn goodput_bytes(pkt: &PacketRecord, category: ProtocolCategory) -> u64 {
    let ip_header = if pkt.ipv6_src.is_some() || pkt.ipv6_dst.is_some() {
        IPV6_HEADER
    } else {
        IPV4_HEADER
    };
    match category {
        ProtocolCategory::Tcp | ProtocolCategory::Tls => {
            if is_retransmission(pkt) {
                0
            } else {
                pkt.tcp_len.unwrap_or(0)
            }
        }
        ProtocolCategory::Udp | ProtocolCategory::Quic | ProtocolCategory::Dns => {
            pkt.udp_length.unwrap_or(0).saturating_sub(UDP_HEADER)
        }
        ProtocolCategory::Rtp => pkt
            .udp_length
            .unwrap_or(0)
            .saturating_sub(UDP_HEADER + RTP_HEADER),
        ProtocolCategory::Igmp | ProtocolCategory::Others => {
            pkt.frame_len.unwrap_or(0).saturating_sub(ip_header)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
    Neither,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
    Unknown,
}

/// Attribute one packet to a direction and address family against the
/// own-address sets.
fn attribute(pkt: &PacketRecord, own: &OwnAddresses) -> (Direction, Family) {
    if let Some(src) = pkt.src_addr() {
        if own.contains(src) {
            let family = if own.v4.contains(src) { Family::V4 } else { Family::V6 };
            return (Direction::Outbound, family);
        }
    }
    if let Some(dst) = pkt.dst_addr() {
        if own.contains(dst) {
            let family = if own.v4.contains(dst) { Family::V4 } else { Family::V6 };
            return (Direction::Inbound, family);
        }
    }
    let family = if pkt.ip_src.is_some() || pkt.ip_dst.is_some() {
        Family::V4
    } else if pkt.ipv6_src.is_some() || pkt.ipv6_dst.is_some() {
        Family::V6
    } else {
        Family::Unknown
    };
    (Direction::Neither, family)
}

#[derive(Debug, Default, Clone, Copy)]
struct DirTally {
    in_bytes: u64,
    out_bytes: u64,
    in_pkts: u64,
    out_pkts: u64,
    pkts: u64,
}

impl DirTally {
    fn add(&mut self, direction: Direction, bytes: u64) {
        self.pkts += 1;
        match direction {
            Direction::Inbound => {
                self.in_bytes += bytes;
                self.in_pkts += 1;
            }
            Direction::Outbound => {
                self.out_bytes += bytes;
                self.out_pkts += 1;
            }
            Direction::Neither => {}
        }
    }
}

/// Everything measured over one window before it folds into the
/// aggregators.
#[derive(Debug, Default)]
struct WindowTally {
    overall: DirTally,
    tcp: DirTally,
    udp: DirTally,
    rtp: DirTally,
    quic: DirTally,
    dns: DirTally,
    igmp: DirTally,
    ipv4: DirTally,
    ipv6: DirTally,

    goodput_in_bytes: u64,
    goodput_out_bytes: u64,

    encrypted: u64,
    unencrypted: u64,
    ipv4_pkts: u64,
    ipv6_pkts: u64,

    start_time: f64,
    end_time: f64,

    weighted_latency: f64,
    latency_weight: u64,
    tcp_retrans: u64,
    tcp_packets: u64,

    rtp_loss: u64,
    rtp_packets: u64,
    weighted_jitter: f64,
    jitter_weight: u64,
}

impl WindowTally {
    fn new() -> Self {
        Self {
            start_time: f64::INFINITY,
            end_time: 0.0,
            ..Default::default()
        }
    }

    fn observe_arrival(&mut self, epoch: Option<f64>) {
        if let Some(t) = epoch {
            if t > 0.0 {
                self.start_time = self.start_time.min(t);
                self.end_time = self.end_time.max(t);
            }
        }
    }

    fn wall_duration(&self) -> f64 {
        if self.start_time.is_finite() && self.end_time > self.start_time {
            self.end_time - self.start_time
        } else {
            0.0
        }
    }
}

/// Updates every packet contributes regardless of which stream branch it
/// sits in.
fn common_packet_update(
    tally: &mut WindowTally,
    state: &mut SessionState,
    pkt: &PacketRecord,
    own: &OwnAddresses,
) {
    let category = pkt.category();
    let (direction, family) = attribute(pkt, own);
    let bytes = pkt.frame_len.unwrap_or(0);

    tally.observe_arrival(pkt.time_epoch);
    tally.overall.add(direction, bytes);

    match category {
        ProtocolCategory::Tcp | ProtocolCategory::Tls => tally.tcp.add(direction, bytes),
        ProtocolCategory::Udp => tally.udp.add(direction, bytes),
        ProtocolCategory::Rtp => tally.rtp.add(direction, bytes),
        ProtocolCategory::Quic => tally.quic.add(direction, bytes),
        ProtocolCategory::Dns => tally.dns.add(direction, bytes),
        ProtocolCategory::Igmp => tally.igmp.add(direction, bytes),
        ProtocolCategory::Others => {}
    }
    match family {
        Family::V4 => {
            tally.ipv4.add(direction, bytes);
            tally.ipv4_pkts += 1;
        }
        Family::V6 => {
            tally.ipv6.add(direction, bytes);
            tally.ipv6_pkts += 1;
        }
        Family::Unknown => {}
    }

    // Exactly one category increment per packet.
    *state
        .protocol_distribution
        .entry(category.as_str().to_string())
        .or_insert(0) += 1;

    let goodput = goodput_bytes(pkt, category);
    match direction {
        Direction::Inbound => tally.goodput_in_bytes += goodput,
        Direction::Outbound => tally.goodput_out_bytes += goodput,
        Direction::Neither => {}
    }

    if is_encrypted(pkt.protocol.as_deref().unwrap_or("")) {
        tally.encrypted += 1;
    } else {
        tally.unencrypted += 1;
    }

    // Top talkers record traffic this host originated.
    if let (Some(src), Some(dst)) = (pkt.src_addr(), pkt.dst_addr()) {
        if own.contains(src) && !dst.is_empty() {
            let entry = state
                .top_talkers
                .entry((src.to_string(), dst.to_string()))
                .or_default();
            entry.packets += 1;
            entry.bytes += bytes;
        }
    }

    // Passively learned names for enrichment annotation.
    if let Some(query) = &pkt.dns_query {
        for answers in [&pkt.dns_a, &pkt.dns_aaaa].into_iter().flatten() {
            for ip in answers.split(',') {
                let ip = ip.trim();
                if !ip.is_empty() {
                    state.dns_names.insert(ip.to_string(), query.clone());
                }
            }
        }
    }
    if let Some(sni) = pkt.tls_sni.as_ref().or(pkt.quic_sni.as_ref()) {
        if let Some(dst) = pkt.dst_addr() {
            state.dns_names.insert(dst.to_string(), sni.clone());
        }
    }

    let app = detect_application(pkt, &mut state.ip_to_app);
    let remote = match direction {
        Direction::Outbound => pkt.dst_addr(),
        Direction::Inbound => pkt.src_addr(),
        Direction::Neither => None,
    };
    if let Some(remote) = remote {
        let remote = remote.to_string();
        state.observe_remote(&remote, &app);
    }
}

fn rtp_stream_update(
    tally: &mut WindowTally,
    jitter_state: &mut JitterState,
    packets: &[PacketRecord],
) {
    let mut last_seq: Option<u16> = None;

    for pkt in packets {
        // Sequence-gap loss with wraparound. Reorders and duplicates are
        // not loss and leave last_seq alone, so a late packet cannot
        // distort the gap to its successor.
        if let Some(seq) = pkt.rtp_seq {
            match last_seq {
                None => last_seq = Some(seq),
                Some(last) if seq > last => {
                    tally.rtp_loss += (seq - last - 1) as u64;
                    last_seq = Some(seq);
                }
                Some(last) if seq < last && (last - seq) > 32768 => {
                    tally.rtp_loss += (65536 - last as u64 - 1) + seq as u64;
                    last_seq = Some(seq);
                }
                Some(_) => {}
            }
        }

        let (Some(rtp_ts), Some(arrival), Some(_)) = (pkt.rtp_timestamp, pkt.time_epoch, pkt.rtp_seq)
        else {
            continue;
        };
        if arrival <= 0.0 {
            continue;
        }

        if jitter_state.clock_rate.is_none() {
            if jitter_state.detection.len() < CLOCK_DETECTION_PACKETS {
                jitter_state.detection.push(DetectionSample { arrival, rtp_ts });
            }
            if let Some(pt) = pkt.rtp_payload_type {
                if let Some(rate) = payload_clock_rate(pt) {
                    jitter_state.clock_rate = Some(rate);
                }
            }
            // Dynamic detection waits for the full buffer. The first
            // consecutive pair can carry a zero timestamp delta (one frame
            // split across packets), and committing the 8000 fallback that
            // early would freeze the wrong rate for the whole stream.
            if jitter_state.clock_rate.is_none()
                && jitter_state.detection.len() >= CLOCK_DETECTION_PACKETS
            {
                jitter_state.clock_rate =
                    Some(detect_dynamic_clock_rate(&jitter_state.detection).unwrap_or(8000));
            }
        }

        if let Some(rate) = jitter_state.clock_rate {
            let transit = (arrival * rate as f64).floor() as i64 - rtp_ts as i64;
            if let Some(prev) = jitter_state.prev_transit {
                let d = (transit - prev).abs() as f64;
                jitter_state.jitter += (d - jitter_state.jitter) / 16.0;
            }
            jitter_state.prev_transit = Some(transit);
        }
    }

    tally.rtp_packets += packets.len() as u64;

    if jitter_state.jitter > 0.0 {
        if let Some(rate) = jitter_state.clock_rate {
            let jitter_ms = jitter_state.jitter / rate as f64 * 1000.0;
            let weight = packets.len() as u64;
            tally.weighted_jitter += jitter_ms * weight as f64;
            tally.jitter_weight += weight;
        }
    }
}

fn tcp_stream_update(tally: &mut WindowTally, packets: &[PacketRecord]) {
    let mut rtt_sum_ms = 0.0;
    let mut rtt_count = 0u64;

    for pkt in packets {
        if is_retransmission(pkt) {
            tally.tcp_retrans += 1;
        }
        if let Some(rtt) = pkt.tcp_ack_rtt {
            if rtt > 0.0 {
                rtt_sum_ms += rtt * 1000.0;
                rtt_count += 1;
            }
        }
    }

    tally.tcp_packets += packets.len() as u64;

    if rtt_count > 0 {
        let stream_avg = rtt_sum_ms / rtt_count as f64;
        let weight = packets.len() as u64;
        tally.weighted_latency += stream_avg * weight as f64;
        tally.latency_weight += weight;
    }
}

fn dimension_metrics(tally: &DirTally, agg: &RateAggregate, duration: f64) -> ProtocolMetrics {
    ProtocolMetrics {
        inbound_packets: tally.in_pkts,
        outbound_packets: tally.out_pkts,
        packets_per_second: tally.pkts as f64 / duration,
        inbound_throughput: tally.in_bytes as f64 * 8.0 / duration,
        outbound_throughput: tally.out_bytes as f64 * 8.0 / duration,
        inbound_throughput_peak: agg.inbound_peak,
        inbound_throughput_avg: agg.inbound_avg(),
        outbound_throughput_peak: agg.outbound_peak,
        outbound_throughput_avg: agg.outbound_avg(),
        ..Default::default()
    }
}

/// Process one closed window: update cumulative state and publish a fresh
/// snapshot into the session record.
pub fn process_window(
    state: &mut SessionState,
    window: &Window,
    configured_window_secs: f64,
    own: &OwnAddresses,
) {
    state.windows_observed += 1;

    if window.is_empty() {
        // Zero the per-window fields, preserve every cumulative value.
        publish_snapshot(state, &WindowTally::new(), configured_window_secs, 0, 0);
        state.last_window_packets.clear();
        return;
    }

    let mut tally = WindowTally::new();

    // The engine takes the streams map by reference and walks each stream
    // in arrival order; the map order itself carries no meaning.
    for (key, packets) in &window.streams {
        match key.category.as_str() {
            "tcp" => {
                for pkt in packets {
                    common_packet_update(&mut tally, state, pkt, own);
                }
                tcp_stream_update(&mut tally, packets);
            }
            "rtp" => {
                for pkt in packets {
                    common_packet_update(&mut tally, state, pkt, own);
                }
                let mut jitter_state = state
                    .jitter_states
                    .remove(&key.discriminator)
                    .unwrap_or_default();
                rtp_stream_update(&mut tally, &mut jitter_state, packets);
                state
                    .jitter_states
                    .insert(key.discriminator.clone(), jitter_state);
            }
            _ => {
                for pkt in packets {
                    common_packet_update(&mut tally, state, pkt, own);
                }
            }
        }
    }

    let duration = tally.wall_duration().max(configured_window_secs);

    // Fold the window into the running aggregators.
    state.agg.overall.observe(
        tally.overall.in_bytes as f64 * 8.0,
        tally.overall.out_bytes as f64 * 8.0,
        duration,
    );
    state.agg.goodput.observe(
        tally.goodput_in_bytes as f64 * 8.0,
        tally.goodput_out_bytes as f64 * 8.0,
        duration,
    );
    for (dim, agg) in [
        (&tally.tcp, &mut state.agg.tcp),
        (&tally.udp, &mut state.agg.udp),
        (&tally.rtp, &mut state.agg.rtp),
        (&tally.quic, &mut state.agg.quic),
        (&tally.dns, &mut state.agg.dns),
        (&tally.igmp, &mut state.agg.igmp),
        (&tally.ipv4, &mut state.agg.ipv4),
        (&tally.ipv6, &mut state.agg.ipv6),
    ] {
        agg.observe(dim.in_bytes as f64 * 8.0, dim.out_bytes as f64 * 8.0, duration);
    }

    let window_latency = if tally.latency_weight > 0 {
        tally.weighted_latency / tally.latency_weight as f64
    } else {
        0.0
    };
    state.agg.tcp_latency.observe(window_latency);

    let window_jitter = if tally.jitter_weight > 0 {
        tally.weighted_jitter / tally.jitter_weight as f64
    } else {
        0.0
    };
    state.agg.rtp_jitter.observe(window_jitter);

    state.tcp_packets_total += tally.tcp_packets;
    state.tcp_retrans_total += tally.tcp_retrans;
    state.rtp_expected_total += tally.rtp_packets;
    state.rtp_loss_total += tally.rtp_loss;

    let stream_count = window.streams.len();
    let total_packets = window.packet_count();
    publish_snapshot(state, &tally, duration, stream_count, total_packets);
    state.last_window_packets = window.history.clone();
}

/// Build the outgoing snapshot from the window tally plus cumulative state.
fn publish_snapshot(
    state: &mut SessionState,
    tally: &WindowTally,
    duration: f64,
    stream_count: usize,
    total_packets: usize,
) {
    let window_latency = if tally.latency_weight > 0 {
        tally.weighted_latency / tally.latency_weight as f64
    } else {
        0.0
    };
    let window_jitter = if tally.jitter_weight > 0 {
        tally.weighted_jitter / tally.jitter_weight as f64
    } else {
        0.0
    };

    let mut tcp = dimension_metrics(&tally.tcp, &state.agg.tcp, duration);
    tcp.latency = Some(window_latency);
    tcp.latency_peak = Some(state.agg.tcp_latency.peak);
    tcp.latency_avg = Some(state.agg.tcp_latency.avg());
    tcp.packet_loss = Some(state.tcp_retrans_total);
    tcp.packet_loss_percentage = Some(
        state.tcp_retrans_total as f64 * 100.0 / state.tcp_packets_total.max(1) as f64,
    );

    let mut rtp = dimension_metrics(&tally.rtp, &state.agg.rtp, duration);
    rtp.jitter = Some(window_jitter);
    rtp.jitter_peak = Some(state.agg.rtp_jitter.peak);
    rtp.jitter_avg = Some(state.agg.rtp_jitter.avg());
    rtp.packet_loss = Some(state.rtp_loss_total);
    rtp.packet_loss_percentage = Some(
        state.rtp_loss_total as f64 * 100.0
            / (state.rtp_expected_total + state.rtp_loss_total).max(1) as f64,
    );

    // Compositions fold window counts into cumulative ones; percentages
    // always derive from the cumulative sums.
    let prev = &state.snapshot.ip_composition;
    let ipv4_cumulative = prev.ipv4_packets_cumulative + tally.ipv4_pkts;
    let ipv6_cumulative = prev.ipv6_packets_cumulative + tally.ipv6_pkts;
    let ip_total = ipv4_cumulative + ipv6_cumulative;
    let ip_composition = IpComposition {
        ipv4_packets: tally.ipv4_pkts,
        ipv6_packets: tally.ipv6_pkts,
        ipv4_packets_cumulative: ipv4_cumulative,
        ipv6_packets_cumulative: ipv6_cumulative,
        total_packets: ip_total,
        ipv4_percentage: percentage(ipv4_cumulative, ip_total),
        ipv6_percentage: percentage(ipv6_cumulative, ip_total),
    };

    let prev = &state.snapshot.encryption_composition;
    let encrypted_cumulative = prev.encrypted_packets_cumulative + tally.encrypted;
    let unencrypted_cumulative = prev.unencrypted_packets_cumulative + tally.unencrypted;
    let enc_total = encrypted_cumulative + unencrypted_cumulative;
    let encryption_composition = EncryptionComposition {
        encrypted_packets: tally.encrypted,
        unencrypted_packets: tally.unencrypted,
        encrypted_packets_cumulative: encrypted_cumulative,
        unencrypted_packets_cumulative: unencrypted_cumulative,
        total_packets: enc_total,
        encrypted_percentage: percentage(encrypted_cumulative, enc_total),
        unencrypted_percentage: percentage(unencrypted_cumulative, enc_total),
    };

    let top_talkers = state.top_talkers_snapshot();
    let combined_loss = state.tcp_retrans_total + state.rtp_loss_total;
    let combined_expected =
        state.tcp_packets_total + state.rtp_expected_total + state.rtp_loss_total;

    let metrics = OverallMetrics {
        inbound_throughput: tally.overall.in_bytes as f64 * 8.0 / duration,
        outbound_throughput: tally.overall.out_bytes as f64 * 8.0 / duration,
        inbound_throughput_peak: state.agg.overall.inbound_peak,
        inbound_throughput_avg: state.agg.overall.inbound_avg(),
        outbound_throughput_peak: state.agg.overall.outbound_peak,
        outbound_throughput_avg: state.agg.overall.outbound_avg(),
        inbound_goodput: tally.goodput_in_bytes as f64 * 8.0 / duration,
        outbound_goodput: tally.goodput_out_bytes as f64 * 8.0 / duration,
        inbound_goodput_peak: state.agg.goodput.inbound_peak,
        inbound_goodput_avg: state.agg.goodput.inbound_avg(),
        outbound_goodput_peak: state.agg.goodput.outbound_peak,
        outbound_goodput_avg: state.agg.goodput.outbound_avg(),
        latency: window_latency,
        jitter: window_jitter,
        packet_loss_count: combined_loss,
        packet_loss_percent: combined_loss as f64 * 100.0 / combined_expected.max(1) as f64,
        packets_per_second: total_packets as f64 / duration,
        status: "running".to_string(),
        last_update: Some(chrono::Local::now().to_rfc3339()),
        protocol_distribution: state.protocol_distribution.clone(),
        stream_count,
        total_packets,
    };

    state.snapshot = common::MetricsSnapshot {
        metrics,
        packets_per_second: total_packets as f64 / duration,
        tcp_metrics: tcp,
        rtp_metrics: rtp,
        udp_metrics: dimension_metrics(&tally.udp, &state.agg.udp, duration),
        quic_metrics: dimension_metrics(&tally.quic, &state.agg.quic, duration),
        dns_metrics: dimension_metrics(&tally.dns, &state.agg.dns, duration),
        igmp_metrics: dimension_metrics(&tally.igmp, &state.agg.igmp, duration),
        ipv4_metrics: dimension_metrics(&tally.ipv4, &state.agg.ipv4, duration),
        ipv6_metrics: dimension_metrics(&tally.ipv6, &state.agg.ipv6, duration),
        ip_composition,
        encryption_composition,
        top_talkers,
    };
}

fn percentage(part: u64, total: u64) -> f64 {
    if total > 0 {
        part as f64 * 100.0 / total as f64
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::FIELD_COUNT;
    use crate::window::Window;

    const OWN_V4: &str = "10.0.0.1";
    const OWN_V6: &str = "2001:db8::10";

    fn own() -> OwnAddresses {
        OwnAddresses::from_addrs(&[OWN_V4, OWN_V6])
    }

    fn line(fill: impl FnOnce(&mut Vec<String>)) -> PacketRecord {
        let mut parts = vec![String::new(); FIELD_COUNT];
        fill(&mut parts);
        PacketRecord::parse(&parts.join("|")).unwrap()
    }

    fn tls_outbound(frame: u64, at: f64, rtt: Option<f64>) -> PacketRecord {
        line(|p| {
            p[0] = frame.to_string();
            p[1] = format!("{:.6}", at);
            p[2] = OWN_V4.to_string();
            p[3] = "93.184.216.34".to_string();
            p[4] = "1000".to_string();
            p[5] = "TLSv1.3".to_string();
            p[7] = "0".to_string();
            if let Some(rtt) = rtt {
                p[9] = format!("{:.6}", rtt);
            }
            p[15] = "6".to_string();
            p[21] = "940".to_string();
        })
    }

    fn rtp_inbound(frame: u64, at: f64, seq: u16, payload_type: u8, rtp_ts: u32) -> PacketRecord {
        line(|p| {
            p[0] = frame.to_string();
            p[1] = format!("{:.6}", at);
            p[2] = "1.2.3.4".to_string();
            p[3] = OWN_V4.to_string();
            p[4] = "180".to_string();
            p[5] = "RTP".to_string();
            p[8] = "1".to_string();
            p[13] = "0x1234".to_string();
            p[14] = seq.to_string();
            p[15] = "17".to_string();
            p[18] = rtp_ts.to_string();
            p[19] = payload_type.to_string();
            p[22] = "160".to_string();
        })
    }

    fn udp_packet(frame: u64, src: &str, dst: &str, v6: bool) -> PacketRecord {
        line(|p| {
            p[0] = frame.to_string();
            p[1] = format!("{:.6}", 1000.0 + frame as f64 * 0.001);
            if v6 {
                p[16] = src.to_string();
                p[17] = dst.to_string();
                p[20] = "17".to_string();
            } else {
                p[2] = src.to_string();
                p[3] = dst.to_string();
                p[15] = "17".to_string();
            }
            p[4] = "500".to_string();
            p[5] = "UDP".to_string();
            p[8] = if v6 { "2" } else { "1" }.to_string();
            p[22] = "480".to_string();
        })
    }

    /// E1: pure outbound burst over one TCP stream labeled TLS.
    #[test]
    fn test_outbound_https_burst() {
        let mut state = SessionState::new();
        let mut window = Window::default();
        for i in 0..1500u64 {
            let at = 1000.0 + i as f64 * (1.5 / 1500.0);
            window.push(tls_outbound(i + 1, at, Some(0.040)));
        }
        process_window(&mut state, &window, 1.5, &own());

        let snap = &state.snapshot;
        let expected_bps = 1500.0 * 1000.0 * 8.0 / 1.5;
        assert!((snap.metrics.outbound_throughput - expected_bps).abs() / expected_bps < 0.01);
        assert_eq!(snap.metrics.inbound_throughput, 0.0);
        assert!((snap.tcp_metrics.latency.unwrap() - 40.0).abs() < 1e-9);
        assert_eq!(snap.encryption_composition.encrypted_percentage, 100.0);
        assert_eq!(state.protocol_distribution["TLS"], 1500);
        assert_eq!(state.protocol_distribution["TCP"], 0);
        assert_eq!(snap.top_talkers.len(), 1);
        assert_eq!(
            snap.top_talkers[0],
            (
                OWN_V4.to_string(),
                "93.184.216.34".to_string(),
                1500,
                "1500000".to_string()
            )
        );
        // TLS bytes ride the tcp dimension.
        assert!(snap.tcp_metrics.outbound_throughput > 0.0);
        assert_eq!(snap.tcp_metrics.packet_loss, Some(0));
    }

    /// E2: inbound RTP with skipped sequence numbers.
    #[test]
    fn test_inbound_rtp_with_loss() {
        let mut state = SessionState::new();
        let mut window = Window::default();
        let mut frame = 0;
        for seq in 1..=510u16 {
            // Skip ten sequence numbers spread over the stream.
            if seq % 50 == 0 {
                continue;
            }
            frame += 1;
            let at = 1000.0 + frame as f64 * 0.02;
            window.push(rtp_inbound(frame, at, seq, 0, seq as u32 * 160));
        }
        process_window(&mut state, &window, 1.5, &own());

        assert_eq!(state.rtp_loss_total, 10);
        let pct = state.snapshot.rtp_metrics.packet_loss_percentage.unwrap();
        assert!((pct - 10.0 * 100.0 / 510.0).abs() < 0.01);
        // Payload type 0 resolves the clock immediately.
        assert_eq!(state.jitter_states["0x1234"].clock_rate, Some(8000));
    }

    /// E3: mixed IPv4 inbound and IPv6 outbound UDP.
    #[test]
    fn test_mixed_families() {
        let mut state = SessionState::new();
        let mut window = Window::default();
        for i in 0..100 {
            window.push(udp_packet(i, "1.2.3.4", OWN_V4, false));
        }
        for i in 100..200 {
            window.push(udp_packet(i, OWN_V6, "2001:db8::99", true));
        }
        process_window(&mut state, &window, 1.5, &own());

        let snap = &state.snapshot;
        assert_eq!(snap.ip_composition.ipv4_packets, 100);
        assert_eq!(snap.ip_composition.ipv6_packets, 100);
        assert_eq!(snap.ip_composition.ipv4_percentage, 50.0);
        assert_eq!(snap.ip_composition.ipv6_percentage, 50.0);
        assert_eq!(
            snap.udp_metrics.inbound_throughput,
            snap.udp_metrics.outbound_throughput
        );
        assert_eq!(snap.ipv4_metrics.inbound_packets, 100);
        assert_eq!(snap.ipv6_metrics.outbound_packets, 100);
    }

    /// Boundary 9: wraparound gaps.
    #[test]
    fn test_rtp_sequence_wraparound() {
        let mut tally = WindowTally::new();
        let mut jitter = JitterState::default();
        let packets: Vec<PacketRecord> = [65530u16, 65535, 0, 2]
            .iter()
            .enumerate()
            .map(|(i, seq)| rtp_inbound(i as u64, 1000.0 + i as f64 * 0.02, *seq, 0, 160))
            .collect();
        rtp_stream_update(&mut tally, &mut jitter, &packets);
        assert_eq!(tally.rtp_loss, 5);
    }

    /// Boundary 10: reordered packets do not decrement loss.
    #[test]
    fn test_rtp_reorder_not_counted() {
        let mut tally = WindowTally::new();
        let mut jitter = JitterState::default();
        let packets: Vec<PacketRecord> = [100u16, 102, 101, 103]
            .iter()
            .enumerate()
            .map(|(i, seq)| rtp_inbound(i as u64, 1000.0 + i as f64 * 0.02, *seq, 0, 160))
            .collect();
        rtp_stream_update(&mut tally, &mut jitter, &packets);
        assert_eq!(tally.rtp_loss, 1);
    }

    /// Boundary 11: static payload type resolves immediately; a dynamic
    /// estimate snaps to the nearest in-tolerance rate.
    #[test]
    fn test_clock_rate_detection() {
        assert_eq!(payload_clock_rate(0), Some(8000));
        assert_eq!(payload_clock_rate(14), Some(90000));

        // Δts/Δt = 950/0.02 = 47500 → 48000 (1% off, within tolerance).
        let samples = [
            DetectionSample { arrival: 0.00, rtp_ts: 0 },
            DetectionSample { arrival: 0.02, rtp_ts: 950 },
        ];
        assert_eq!(detect_dynamic_clock_rate(&samples), Some(48000));

        // Out of tolerance everywhere: magnitude fallback.
        let slow = [
            DetectionSample { arrival: 0.0, rtp_ts: 0 },
            DetectionSample { arrival: 1.0, rtp_ts: 11000 },
        ];
        assert_eq!(detect_dynamic_clock_rate(&slow), Some(8000));
        let fast = [
            DetectionSample { arrival: 0.0, rtp_ts: 0 },
            DetectionSample { arrival: 1.0, rtp_ts: 70000 },
        ];
        assert_eq!(detect_dynamic_clock_rate(&fast), Some(90000));
    }

    /// Boundary 12: spurious retransmissions are excluded from the
    /// retransmission count and included in goodput.
    #[test]
    fn test_spurious_retransmission() {
        let mut state = SessionState::new();
        let mut window = Window::default();
        let mut spurious = tls_outbound(1, 1000.0, None);
        spurious.tcp_retransmission = true;
        spurious.tcp_spurious_retransmission = true;
        let real = {
            let mut p = tls_outbound(2, 1000.1, None);
            p.tcp_retransmission = true;
            p
        };
        window.push(spurious);
        window.push(real);
        process_window(&mut state, &window, 1.5, &own());

        assert_eq!(state.tcp_retrans_total, 1);
        // One 940-byte payload survived into goodput (the spurious one).
        assert_eq!(
            state.snapshot.metrics.outbound_goodput,
            940.0 * 8.0 / 1.5
        );
    }

    /// Boundary 13: a transit packet counts in distribution and
    /// encryption but not in throughput or top talkers.
    #[test]
    fn test_transit_packet_attribution() {
        let mut state = SessionState::new();
        let mut window = Window::default();
        window.push(udp_packet(1, "8.8.8.8", "9.9.9.9", false));
        process_window(&mut state, &window, 1.5, &own());

        assert_eq!(state.protocol_distribution["UDP"], 1);
        assert_eq!(state.snapshot.encryption_composition.total_packets, 1);
        assert_eq!(state.snapshot.metrics.inbound_throughput, 0.0);
        assert_eq!(state.snapshot.metrics.outbound_throughput, 0.0);
        assert!(state.snapshot.top_talkers.is_empty());
    }

    /// Invariant 1: the distribution delta equals the window packet count.
    #[test]
    fn test_distribution_accounts_every_packet() {
        let mut state = SessionState::new();
        let mut window = Window::default();
        window.push(udp_packet(1, "8.8.8.8", "9.9.9.9", false));
        window.push(tls_outbound(2, 1000.0, None));
        window.push(rtp_inbound(3, 1000.1, 5, 0, 800));
        process_window(&mut state, &window, 1.5, &own());

        let total: u64 = state.protocol_distribution.values().sum();
        assert_eq!(total, 3);
        // Family-classified packets never exceed the distribution total.
        let ip = &state.snapshot.ip_composition;
        assert!(ip.ipv4_packets_cumulative + ip.ipv6_packets_cumulative <= total);
    }

    /// Invariant 3: encryption percentages sum to 100 once packets exist.
    #[test]
    fn test_encryption_percentages() {
        let mut state = SessionState::new();
        assert_eq!(
            state.snapshot.encryption_composition.encrypted_percentage
                + state.snapshot.encryption_composition.unencrypted_percentage,
            0.0
        );
        let mut window = Window::default();
        window.push(udp_packet(1, "8.8.8.8", "9.9.9.9", false));
        window.push(tls_outbound(2, 1000.0, None));
        process_window(&mut state, &window, 1.5, &own());
        let enc = &state.snapshot.encryption_composition;
        assert_eq!(enc.encrypted_percentage + enc.unencrypted_percentage, 100.0);
    }

    /// Property 8: an empty window zeroes per-window fields and keeps
    /// cumulative state.
    #[test]
    fn test_empty_window_preserves_cumulative() {
        let mut state = SessionState::new();
        let mut window = Window::default();
        window.push(tls_outbound(1, 1000.0, Some(0.040)));
        process_window(&mut state, &window, 1.5, &own());
        let peak_before = state.snapshot.metrics.outbound_throughput_peak;
        assert!(peak_before > 0.0);

        process_window(&mut state, &Window::default(), 1.5, &own());
        let snap = &state.snapshot;
        assert_eq!(snap.metrics.outbound_throughput, 0.0);
        assert_eq!(snap.metrics.total_packets, 0);
        assert_eq!(snap.metrics.outbound_throughput_peak, peak_before);
        assert_eq!(state.protocol_distribution["TLS"], 1);
        assert!(snap.metrics.last_update.is_some());
        assert_eq!(state.windows_observed, 2);
    }

    /// Invariant 4: peak >= avg after positive samples.
    #[test]
    fn test_peak_dominates_avg() {
        let mut state = SessionState::new();
        for i in 0..3 {
            let mut window = Window::default();
            for f in 0..(10 * (i + 1)) {
                window.push(tls_outbound(f, 1000.0 + f as f64 * 0.01, None));
            }
            process_window(&mut state, &window, 1.5, &own());
        }
        let agg = &state.agg.overall;
        assert!(agg.outbound_peak >= agg.outbound_avg());
    }

    /// Jitter clock rate stays frozen across windows.
    #[test]
    fn test_jitter_state_survives_windows() {
        let mut state = SessionState::new();
        let mut window = Window::default();
        for i in 0..5u64 {
            let at = 1000.0 + i as f64 * 0.02;
            window.push(rtp_inbound(i + 1, at, (i + 1) as u16, 96, i as u32 * 950));
        }
        process_window(&mut state, &window, 1.5, &own());
        let rate = state.jitter_states["0x1234"].clock_rate;
        assert_eq!(rate, Some(48000));

        let mut window = Window::default();
        window.push(rtp_inbound(6, 1001.00, 6, 96, 48950));
        process_window(&mut state, &window, 1.5, &own());
        assert_eq!(state.jitter_states["0x1234"].clock_rate, rate);
        assert_eq!(state.jitter_states.len(), 1);
    }

    /// The detection buffer keeps filling past a bad first pair: a zero
    /// timestamp delta (one frame split across packets) must not freeze
    /// the 8000 fallback.
    #[test]
    fn test_clock_rate_waits_for_full_buffer() {
        let mut state = SessionState::new();
        let mut window = Window::default();
        // First two packets share an RTP timestamp; the later pairs pace
        // 1800 ticks per 20 ms, i.e. 90 kHz.
        let samples = [(1000.00, 0u32), (1000.01, 0), (1000.03, 1800), (1000.05, 3600), (1000.07, 5400)];
        for (i, (at, ts)) in samples.iter().enumerate() {
            window.push(rtp_inbound(i as u64 + 1, *at, i as u16 + 1, 96, *ts));
        }
        process_window(&mut state, &window, 1.5, &own());
        assert_eq!(state.jitter_states["0x1234"].clock_rate, Some(90000));
    }

    /// Undetermined until the buffer fills; a full buffer with no valid
    /// consecutive pair falls back to 8000.
    #[test]
    fn test_clock_rate_fallback_needs_full_buffer() {
        let mut state = SessionState::new();
        let mut window = Window::default();
        window.push(rtp_inbound(1, 1000.00, 1, 96, 4000));
        window.push(rtp_inbound(2, 1000.02, 2, 96, 4000));
        process_window(&mut state, &window, 1.5, &own());
        assert_eq!(state.jitter_states["0x1234"].clock_rate, None);

        let mut window = Window::default();
        for i in 3..=5u64 {
            window.push(rtp_inbound(i, 1000.0 + i as f64 * 0.02, i as u16, 96, 4000));
        }
        process_window(&mut state, &window, 1.5, &own());
        assert_eq!(state.jitter_states["0x1234"].clock_rate, Some(8000));
    }
}
