//! Geolocation and reverse-DNS enrichment of observed public addresses.
//!
//! A background task wakes every two seconds, finds public remote
//! addresses the session has not queried yet, and resolves them through
//! the static database or the rate-limited external service. Results are
//! queued on the session and drained by the next broadcast. Failures drop
//! the record silently; the address stays in the queried set.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use common::GeolocationRecord;
use serde::Deserialize;
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::geo_db;
use crate::state::AppState;

/// Worker wake-up cadence.
const SCAN_INTERVAL: Duration = Duration::from_secs(2);
/// Minimum spacing between external API calls (~45 requests/minute).
const MIN_CALL_SPACING: Duration = Duration::from_millis(23);
/// External geolocation call timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);
/// Reverse-DNS lookup timeout.
const RDNS_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Deserialize)]
struct GeoApiResponse {
    status: String,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    query: Option<String>,
}

/// Public per RFC 1918/5735/4193: not private, loopback, link-local,
/// multicast, or otherwise reserved.
pub fn is_public_ip(addr: &str) -> bool {
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_documentation()
                || v4.is_unspecified()
                || is_reserved_v4(&v4)
                || is_ietf_special_v4(&v4))
        }
        Ok(IpAddr::V6(v6)) => {
            !(v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || is_unique_local(&v6)
                || is_unicast_link_local(&v6))
        }
        Err(_) => false,
    }
}

/// 240.0.0.0/4, the RFC 1112 reserved block. The limited-broadcast
/// address inside it is tested separately.
fn is_reserved_v4(v4: &Ipv4Addr) -> bool {
    v4.octets()[0] & 0xf0 == 0xf0 && !v4.is_broadcast()
}

/// 192.0.0.0/24 (IETF protocol assignments) and 198.18.0.0/15
/// (benchmarking), the RFC 5735 special blocks the std predicates miss.
fn is_ietf_special_v4(v4: &Ipv4Addr) -> bool {
    let octets = v4.octets();
    (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
}

/// fc00::/7
fn is_unique_local(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

/// fe80::/10
fn is_unicast_link_local(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

/// Monotonic last-call rate limiter for the single external client.
struct RateLimiter {
    last_call: Option<Instant>,
    spacing: Duration,
}

impl RateLimiter {
    fn new(spacing: Duration) -> Self {
        Self {
            last_call: None,
            spacing,
        }
    }

    async fn acquire(&mut self) {
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.spacing {
                tokio::time::sleep(self.spacing - elapsed).await;
            }
        }
        self.last_call = Some(Instant::now());
    }
}

pub fn spawn_enrichment_worker(state: AppState) {
    tokio::spawn(async move {
        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());
        let client = match reqwest::Client::builder().timeout(HTTP_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => {
                tracing::error!("Enrichment worker disabled, HTTP client failed: {}", e);
                return;
            }
        };
        let mut limiter = RateLimiter::new(MIN_CALL_SPACING);

        loop {
            tokio::time::sleep(SCAN_INTERVAL).await;

            if !state.coordinator.is_running().await {
                continue;
            }

            let candidates = collect_candidates(&state).await;
            for ip in candidates {
                let hostname = reverse_lookup(&resolver, &ip).await;
                let record = match geo_db::lookup(&ip) {
                    Some(geo) => GeolocationRecord {
                        ip: ip.clone(),
                        latitude: Some(geo.lat),
                        longitude: Some(geo.lon),
                        city: geo.city.to_string(),
                        country: geo.country.to_string(),
                        hostname,
                        dns_name: None,
                        app: None,
                    },
                    None => {
                        limiter.acquire().await;
                        match fetch_geolocation(&client, &ip).await {
                            Some(mut record) => {
                                record.hostname = hostname;
                                record
                            }
                            // The address stays queried so it is not
                            // retried every scan.
                            None => continue,
                        }
                    }
                };

                let mut record = record;
                let mut session = state.session.write().await;
                record.dns_name = session.dns_names.get(&ip).cloned();
                record.app = session
                    .remote_ip_stats
                    .get(&ip)
                    .map(|stats| stats.app.clone())
                    .or_else(|| session.ip_to_app.get(&ip).cloned());
                session.new_geolocations.push(record);
            }
        }
    });
}

/// Distinct remote addresses from the latest window that are public, not
/// ours, and not yet queried. Marks them queried.
async fn collect_candidates(state: &AppState) -> Vec<String> {
    let mut session = state.session.write().await;
    let mut candidates = Vec::new();
    let packets = session.last_window_packets.clone();
    for summary in &packets {
        for addr in [&summary.source, &summary.destination] {
            if addr == "N/A" || !is_public_ip(addr) {
                continue;
            }
            if state.own_addrs.contains(addr) || session.queried_public_ips.contains(addr) {
                continue;
            }
            session.queried_public_ips.insert(addr.clone());
            candidates.push(addr.clone());
        }
    }
    candidates
}

async fn reverse_lookup(resolver: &TokioAsyncResolver, ip: &str) -> Option<String> {
    let addr: IpAddr = ip.parse().ok()?;
    match tokio::time::timeout(RDNS_TIMEOUT, resolver.reverse_lookup(addr)).await {
        Ok(Ok(response)) => response
            .iter()
            .next()
            .map(|name| name.to_utf8().trim_end_matches('.').to_string()),
        Ok(Err(_)) | Err(_) => None,
    }
}

async fn fetch_geolocation(client: &reqwest::Client, ip: &str) -> Option<GeolocationRecord> {
    let url = format!(
        "http://ip-api.com/json/{}?fields=status,lat,lon,city,country,query",
        ip
    );
    let response = match client.get(&url).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::debug!("Geolocation fetch failed for {}: {}", ip, e);
            return None;
        }
    };
    if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
        tracing::warn!("Rate limited by geolocation service, skipping {}", ip);
        return None;
    }
    if !response.status().is_success() {
        return None;
    }
    let body: GeoApiResponse = match response.json().await {
        Ok(body) => body,
        Err(e) => {
            tracing::debug!("Bad geolocation response for {}: {}", ip, e);
            return None;
        }
    };
    if body.status != "success" {
        tracing::debug!("Geolocation lookup unsuccessful for {}", ip);
        return None;
    }
    Some(GeolocationRecord {
        ip: body.query.unwrap_or_else(|| ip.to_string()),
        latitude: body.lat,
        longitude: body.lon,
        city: body.city.unwrap_or_else(|| "Unknown".to_string()),
        country: body.country.unwrap_or_else(|| "Unknown".to_string()),
        hostname: None,
        dns_name: None,
        app: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::state::OwnAddresses;
    use common::PacketSummary;

    #[test]
    fn test_public_ip_classification() {
        assert!(is_public_ip("93.184.216.34"));
        assert!(is_public_ip("2606:4700::6810:84e5"));
        assert!(!is_public_ip("10.0.0.1"));
        assert!(!is_public_ip("192.168.1.20"));
        assert!(!is_public_ip("127.0.0.1"));
        assert!(!is_public_ip("169.254.0.5"));
        assert!(!is_public_ip("224.0.0.251"));
        assert!(!is_public_ip("fe80::1"));
        assert!(!is_public_ip("fd00::1"));
        assert!(!is_public_ip("::1"));
        assert!(!is_public_ip("N/A"));
        assert!(!is_public_ip("not-an-address"));
    }

    #[test]
    fn test_reserved_ranges_are_not_public() {
        // 240.0.0.0/4 reserved block, including its edges.
        assert!(!is_public_ip("240.0.0.1"));
        assert!(!is_public_ip("250.1.2.3"));
        assert!(!is_public_ip("255.255.255.255"));
        // IETF protocol assignments and benchmarking blocks.
        assert!(!is_public_ip("192.0.0.8"));
        assert!(!is_public_ip("198.18.0.1"));
        assert!(!is_public_ip("198.19.255.254"));
        // Immediate neighbors of those blocks stay public.
        assert!(is_public_ip("192.0.1.1"));
        assert!(is_public_ip("198.17.255.255"));
        assert!(is_public_ip("198.20.0.1"));
        assert!(!is_public_ip("239.255.255.255"));
        assert!(is_public_ip("223.255.255.255"));
    }

    #[tokio::test]
    async fn test_rate_limiter_spaces_calls() {
        let mut limiter = RateLimiter::new(Duration::from_millis(23));
        let started = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(23));
    }

    #[tokio::test]
    async fn test_collect_candidates_filters_and_marks() {
        let state = AppState::new(Config::default(), OwnAddresses::from_addrs(&["10.0.0.1"]));
        {
            let mut session = state.session.write().await;
            session.last_window_packets = vec![PacketSummary {
                no: "1".to_string(),
                time: "12:00:00.000".to_string(),
                source: "10.0.0.1".to_string(),
                destination: "93.184.216.34".to_string(),
                protocol: "TCP".to_string(),
                length: "60".to_string(),
                info: "N/A".to_string(),
            }];
        }

        let first = collect_candidates(&state).await;
        assert_eq!(first, vec!["93.184.216.34".to_string()]);

        // Already queried: the second scan yields nothing.
        let second = collect_candidates(&state).await;
        assert!(second.is_empty());
    }
}
