//! Shared application state and the session-scoped mutable record.
//!
//! All cumulative counters live in [`SessionState`], which the coordinator
//! owns behind one `RwLock`. Reset swaps in a freshly constructed value
//! instead of zeroing fields one by one. The window task is the only
//! writer of the metric fields; the hub and enrichment worker read.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use common::{AppInfo, GeolocationRecord, MetricsSnapshot, PacketSummary};
use tokio::sync::RwLock;

use crate::capture_source::CaptureSource;
use crate::config::Config;
use crate::hub::Hub;
use crate::metrics_engine::JitterState;
use crate::session::Coordinator;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub capture: Arc<CaptureSource>,
    pub coordinator: Arc<Coordinator>,
    pub session: Arc<RwLock<SessionState>>,
    pub hub: Arc<Hub>,
    pub own_addrs: Arc<OwnAddresses>,
}

impl AppState {
    pub fn new(config: Config, own_addrs: OwnAddresses) -> Self {
        let capture = Arc::new(CaptureSource::new(config.capture.tool.clone()));
        Self {
            config: Arc::new(config),
            capture,
            coordinator: Arc::new(Coordinator::new()),
            session: Arc::new(RwLock::new(SessionState::new())),
            hub: Arc::new(Hub::new()),
            own_addrs: Arc::new(own_addrs),
        }
    }
}

/// Addresses bound to this host's interfaces, discovered at startup.
/// Direction attribution and the top-talkers filter depend on these sets.
#[derive(Debug, Default, Clone)]
pub struct OwnAddresses {
    pub all: HashSet<String>,
    pub v4: HashSet<String>,
    pub v6: HashSet<String>,
}

impl OwnAddresses {
    pub fn discover() -> Self {
        let mut own = OwnAddresses::default();
        for iface in pnet_datalink::interfaces() {
            for network in iface.ips {
                match network.ip() {
                    IpAddr::V4(v4) => {
                        own.v4.insert(v4.to_string());
                        own.all.insert(v4.to_string());
                    }
                    IpAddr::V6(v6) => {
                        own.v6.insert(v6.to_string());
                        own.all.insert(v6.to_string());
                    }
                }
            }
        }
        tracing::info!(
            "Discovered {} own addresses ({} IPv4, {} IPv6)",
            own.all.len(),
            own.v4.len(),
            own.v6.len()
        );
        own
    }

    #[cfg(test)]
    pub fn from_addrs(addrs: &[&str]) -> Self {
        let mut own = OwnAddresses::default();
        for addr in addrs {
            own.all.insert((*addr).to_string());
            match addr.parse::<IpAddr>() {
                Ok(IpAddr::V4(_)) => {
                    own.v4.insert((*addr).to_string());
                }
                Ok(IpAddr::V6(_)) => {
                    own.v6.insert((*addr).to_string());
                }
                Err(_) => {}
            }
        }
        own
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.all.contains(addr)
    }
}

/// Throughput aggregator for one dimension. Sums are bits, peaks are bits
/// per second; `avg = sum / duration`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RateAggregate {
    pub inbound_bits: f64,
    pub outbound_bits: f64,
    pub inbound_peak: f64,
    pub outbound_peak: f64,
    pub duration_secs: f64,
}

impl RateAggregate {
    pub fn observe(&mut self, inbound_bits: f64, outbound_bits: f64, window_secs: f64) {
        self.inbound_bits += inbound_bits;
        self.outbound_bits += outbound_bits;
        self.duration_secs += window_secs;
        let inbound_bps = inbound_bits / window_secs;
        let outbound_bps = outbound_bits / window_secs;
        if inbound_bps > self.inbound_peak {
            self.inbound_peak = inbound_bps;
        }
        if outbound_bps > self.outbound_peak {
            self.outbound_peak = outbound_bps;
        }
    }

    pub fn inbound_avg(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.inbound_bits / self.duration_secs
        } else {
            0.0
        }
    }

    pub fn outbound_avg(&self) -> f64 {
        if self.duration_secs > 0.0 {
            self.outbound_bits / self.duration_secs
        } else {
            0.0
        }
    }
}

/// Latency/jitter aggregator; positive samples only, `avg = sum / count`.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SampleAggregate {
    pub sum: f64,
    pub count: u64,
    pub peak: f64,
}

impl SampleAggregate {
    pub fn observe(&mut self, sample: f64) {
        if sample <= 0.0 {
            return;
        }
        self.sum += sample;
        self.count += 1;
        if sample > self.peak {
            self.peak = sample;
        }
    }

    pub fn avg(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }
}

/// One running aggregator per dimension, exclusively written by the window
/// task.
#[derive(Debug, Default, Clone)]
pub struct Aggregates {
    pub overall: RateAggregate,
    pub goodput: RateAggregate,
    pub tcp: RateAggregate,
    pub udp: RateAggregate,
    pub rtp: RateAggregate,
    pub quic: RateAggregate,
    pub dns: RateAggregate,
    pub igmp: RateAggregate,
    pub ipv4: RateAggregate,
    pub ipv6: RateAggregate,
    pub tcp_latency: SampleAggregate,
    pub rtp_jitter: SampleAggregate,
}

#[derive(Debug, Default, Clone)]
pub struct TalkerCounters {
    pub packets: u64,
    pub bytes: u64,
}

/// Per-remote-address observation. A later non-Unknown, non-Web descriptor
/// replaces an earlier Unknown or Web one.
#[derive(Debug, Clone)]
pub struct RemoteIpStats {
    pub packets: u64,
    pub app: AppInfo,
}

/// All state of one capture session. Dropped wholesale on reset.
pub struct SessionState {
    /// Snapshot published to subscribers after the latest window.
    pub snapshot: MetricsSnapshot,
    /// Display rows for the most recent window, in arrival order.
    pub last_window_packets: Vec<PacketSummary>,
    /// Cumulative per-category packet counts.
    pub protocol_distribution: BTreeMap<String, u64>,
    pub agg: Aggregates,
    /// RFC 3550 per-SSRC jitter state; the clock rate freezes once set.
    pub jitter_states: HashMap<String, JitterState>,

    pub tcp_packets_total: u64,
    pub tcp_retrans_total: u64,
    pub rtp_expected_total: u64,
    pub rtp_loss_total: u64,

    pub top_talkers: HashMap<(String, String), TalkerCounters>,
    pub queried_public_ips: HashSet<String>,
    pub new_geolocations: Vec<GeolocationRecord>,
    pub ip_to_app: HashMap<String, AppInfo>,
    pub remote_ip_stats: HashMap<String, RemoteIpStats>,
    /// Passively observed DNS/SNI names per remote address.
    pub dns_names: HashMap<String, String>,

    pub session_start: Option<Instant>,
    pub windows_observed: u64,
    /// Duration reported by the stopping client, preferred over wall clock.
    pub session_duration_final: Option<f64>,
}

impl SessionState {
    pub fn new() -> Self {
        let mut snapshot = MetricsSnapshot::default();
        snapshot.metrics.status = "stopped".to_string();
        let mut distribution = BTreeMap::new();
        for category in ["TCP", "UDP", "RTP", "QUIC", "DNS", "TLS", "IGMP", "Others"] {
            distribution.insert(category.to_string(), 0);
        }
        snapshot.metrics.protocol_distribution = distribution.clone();
        Self {
            snapshot,
            last_window_packets: Vec::new(),
            protocol_distribution: distribution,
            agg: Aggregates::default(),
            jitter_states: HashMap::new(),
            tcp_packets_total: 0,
            tcp_retrans_total: 0,
            rtp_expected_total: 0,
            rtp_loss_total: 0,
            top_talkers: HashMap::new(),
            queried_public_ips: HashSet::new(),
            new_geolocations: Vec::new(),
            ip_to_app: HashMap::new(),
            remote_ip_stats: HashMap::new(),
            dns_names: HashMap::new(),
            session_start: None,
            windows_observed: 0,
            session_duration_final: None,
        }
    }

    /// Session duration in seconds; the client-reported value wins when
    /// present.
    pub fn session_duration_secs(&self) -> f64 {
        if let Some(duration) = self.session_duration_final {
            if duration > 0.0 {
                return duration;
            }
        }
        self.session_start
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Record a remote-side observation, applying the promotion rule.
    pub fn observe_remote(&mut self, addr: &str, app: &AppInfo) {
        let entry = self
            .remote_ip_stats
            .entry(addr.to_string())
            .or_insert_with(|| RemoteIpStats {
                packets: 0,
                app: app.clone(),
            });
        entry.packets += 1;
        let weak = entry.app.app == "Unknown" || entry.app.category == "Web";
        let strong = app.app != "Unknown" && app.category != "Web";
        if weak && strong {
            entry.app = app.clone();
        }
    }

    /// Top-7 talkers by byte count, wire-shaped.
    pub fn top_talkers_snapshot(&self) -> Vec<common::TopTalkerEntry> {
        let mut entries: Vec<_> = self.top_talkers.iter().collect();
        entries.sort_by(|a, b| b.1.bytes.cmp(&a.1.bytes));
        entries
            .into_iter()
            .take(7)
            .map(|((src, dst), counters)| {
                (
                    src.clone(),
                    dst.clone(),
                    counters.packets,
                    counters.bytes.to_string(),
                )
            })
            .collect()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_aggregate_avg_and_peak() {
        let mut agg = RateAggregate::default();
        agg.observe(12_000_000.0, 0.0, 1.5); // 8 Mbps in
        agg.observe(3_000_000.0, 0.0, 1.5); // 2 Mbps in
        assert_eq!(agg.inbound_peak, 8_000_000.0);
        assert_eq!(agg.inbound_avg(), 15_000_000.0 / 3.0);
        assert!(agg.inbound_peak >= agg.inbound_avg());
        assert_eq!(agg.outbound_peak, 0.0);
    }

    #[test]
    fn test_sample_aggregate_ignores_non_positive() {
        let mut agg = SampleAggregate::default();
        agg.observe(40.0);
        agg.observe(0.0);
        agg.observe(-3.0);
        agg.observe(20.0);
        assert_eq!(agg.count, 2);
        assert_eq!(agg.avg(), 30.0);
        assert_eq!(agg.peak, 40.0);
    }

    #[test]
    fn test_remote_promotion_rule() {
        let mut state = SessionState::new();
        state.observe_remote("1.2.3.4", &AppInfo::unknown());
        state.observe_remote(
            "1.2.3.4",
            &AppInfo {
                app: "HTTPS".to_string(),
                category: "Web".to_string(),
            },
        );
        // A Web-category descriptor is not strong enough to promote.
        assert_eq!(state.remote_ip_stats["1.2.3.4"].app.app, "Unknown");

        state.observe_remote(
            "1.2.3.4",
            &AppInfo {
                app: "Netflix".to_string(),
                category: "Video".to_string(),
            },
        );
        assert_eq!(state.remote_ip_stats["1.2.3.4"].app.app, "Netflix");
        assert_eq!(state.remote_ip_stats["1.2.3.4"].packets, 3);

        // A strong descriptor is never demoted.
        state.observe_remote("1.2.3.4", &AppInfo::unknown());
        assert_eq!(state.remote_ip_stats["1.2.3.4"].app.app, "Netflix");
    }

    #[test]
    fn test_top_talkers_sorted_and_capped() {
        let mut state = SessionState::new();
        for i in 0..10u64 {
            state.top_talkers.insert(
                ("10.0.0.1".to_string(), format!("1.2.3.{}", i)),
                TalkerCounters {
                    packets: i,
                    bytes: i * 100,
                },
            );
        }
        let snapshot = state.top_talkers_snapshot();
        assert_eq!(snapshot.len(), 7);
        assert_eq!(snapshot[0].1, "1.2.3.9");
        assert_eq!(snapshot[0].3, "900");
        assert!(snapshot.windows(2).all(|w| {
            w[0].3.parse::<u64>().unwrap() >= w[1].3.parse::<u64>().unwrap()
        }));
    }

    #[test]
    fn test_own_addresses_from_addrs() {
        let own = OwnAddresses::from_addrs(&["10.0.0.1", "2001:db8::1"]);
        assert!(own.contains("10.0.0.1"));
        assert!(own.v4.contains("10.0.0.1"));
        assert!(own.v6.contains("2001:db8::1"));
        assert!(!own.contains("8.8.8.8"));
    }
}
