//! Application detection from domain patterns and destination ports.
//!
//! Pure lookups over two static tables plus a session-scoped IP cache.
//! Precedence per packet: TLS SNI, QUIC SNI, DNS query name (answers feed
//! the IP cache), cached IP (dst then src), destination port, Unknown.

use std::collections::HashMap;

use common::AppInfo;

use crate::packet::PacketRecord;

/// Ordered substring patterns; the first hit wins, so more specific
/// patterns sit above the generic ones that would shadow them.
const DOMAIN_PATTERNS: &[(&str, &str, &str)] = &[
    // Social media
    ("facebook", "Facebook", "Social Media"),
    ("fbcdn", "Facebook", "Social Media"),
    ("instagram", "Instagram", "Social Media"),
    ("twitter", "Twitter/X", "Social Media"),
    ("twimg", "Twitter/X", "Social Media"),
    ("linkedin", "LinkedIn", "Social Media"),
    ("reddit", "Reddit", "Social Media"),
    ("tiktok", "TikTok", "Social Media"),
    ("snapchat", "Snapchat", "Social Media"),
    ("pinterest", "Pinterest", "Social Media"),
    // Video
    ("youtube", "YouTube", "Video"),
    ("ytimg", "YouTube", "Video"),
    ("googlevideo", "YouTube", "Video"),
    ("netflix", "Netflix", "Video"),
    ("nflxvideo", "Netflix", "Video"),
    ("twitch", "Twitch", "Video"),
    ("ttvnw", "Twitch", "Video"),
    ("primevideo", "Prime Video", "Video"),
    ("hulu", "Hulu", "Video"),
    ("disneyplus", "Disney+", "Video"),
    ("vimeo", "Vimeo", "Video"),
    // Messaging
    ("whatsapp", "WhatsApp", "Messaging"),
    ("telegram", "Telegram", "Messaging"),
    ("discord", "Discord", "Messaging"),
    ("signal.org", "Signal", "Messaging"),
    ("slack", "Slack", "Messaging"),
    ("teams.microsoft", "Microsoft Teams", "Messaging"),
    ("zoom.us", "Zoom", "Messaging"),
    ("skype", "Skype", "Messaging"),
    // Music
    ("spotify", "Spotify", "Music"),
    ("scdn.co", "Spotify", "Music"),
    ("soundcloud", "SoundCloud", "Music"),
    ("music.apple", "Apple Music", "Music"),
    // Gaming
    ("steam", "Steam", "Gaming"),
    ("epicgames", "Epic Games", "Gaming"),
    ("riotgames", "Riot Games", "Gaming"),
    ("minecraft", "Minecraft", "Gaming"),
    ("xboxlive", "Xbox Live", "Gaming"),
    ("playstation", "PlayStation", "Gaming"),
    // Shopping
    ("amazon", "Amazon", "Shopping"),
    ("ebay", "eBay", "Shopping"),
    ("aliexpress", "AliExpress", "Shopping"),
    ("flipkart", "Flipkart", "Shopping"),
    // Finance
    ("paypal", "PayPal", "Finance"),
    ("stripe", "Stripe", "Finance"),
    // Development
    ("github", "GitHub", "Development"),
    ("gitlab", "GitLab", "Development"),
    ("stackoverflow", "Stack Overflow", "Development"),
    ("docker", "Docker", "Development"),
    ("npmjs", "npm", "Development"),
    ("crates.io", "crates.io", "Development"),
    // Cloud
    ("amazonaws", "AWS", "Cloud"),
    ("azure", "Microsoft Azure", "Cloud"),
    ("googleapis", "Google Cloud", "Cloud"),
    ("googleusercontent", "Google Cloud", "Cloud"),
    ("icloud", "iCloud", "Cloud"),
    ("dropbox", "Dropbox", "Cloud"),
    // CDN
    ("cloudflare", "Cloudflare", "CDN"),
    ("akamai", "Akamai", "CDN"),
    ("fastly", "Fastly", "CDN"),
    ("cloudfront", "CloudFront", "CDN"),
    // Search / general (kept below the specific Google properties)
    ("google", "Google", "Web"),
    ("bing", "Bing", "Web"),
    ("duckduckgo", "DuckDuckGo", "Web"),
    ("wikipedia", "Wikipedia", "Web"),
    ("apple.com", "Apple", "Web"),
    ("microsoft", "Microsoft", "Web"),
    ("mozilla", "Mozilla", "Web"),
];

/// Destination-port fallback, least accurate strategy.
fn port_app(port: u16) -> Option<(&'static str, &'static str)> {
    let info = match port {
        20 => ("FTP-DATA", "File Transfer"),
        21 => ("FTP", "File Transfer"),
        22 => ("SSH", "Remote Access"),
        23 => ("Telnet", "Remote Access"),
        25 => ("SMTP", "Email"),
        53 => ("DNS", "Network"),
        67 => ("DHCP-Server", "Network"),
        68 => ("DHCP-Client", "Network"),
        80 => ("HTTP", "Web"),
        110 => ("POP3", "Email"),
        123 => ("NTP", "Network"),
        143 => ("IMAP", "Email"),
        161 => ("SNMP", "Network"),
        179 => ("BGP", "Routing"),
        389 => ("LDAP", "Network Services"),
        443 => ("HTTPS", "Web"),
        445 => ("SMB", "File Sharing"),
        465 => ("SMTPS", "Email"),
        514 => ("Syslog", "Logging"),
        587 => ("SMTP-TLS", "Email"),
        631 => ("IPP", "Printing"),
        636 => ("LDAPS", "Network Services"),
        873 => ("Rsync", "File Transfer"),
        993 => ("IMAPS", "Email"),
        995 => ("POP3S", "Email"),
        1080 => ("SOCKS", "Proxy"),
        1194 => ("OpenVPN", "VPN"),
        2049 => ("NFS", "File Sharing"),
        2375 => ("Docker", "Container"),
        2376 => ("Docker-TLS", "Container"),
        3000 => ("Development-HTTP", "Development"),
        3128 => ("Squid-Proxy", "Proxy"),
        3306 => ("MySQL", "Database"),
        3389 => ("RDP", "Remote Access"),
        5432 => ("PostgreSQL", "Database"),
        5671 => ("AMQPS", "Message Queue"),
        5672 => ("AMQP", "Message Queue"),
        5900 => ("VNC", "Remote Access"),
        6379 => ("Redis", "Cache"),
        6667 => ("IRC", "Messaging"),
        8000 => ("HTTP-ALT", "Web"),
        8080 => ("HTTP-PROXY", "Web"),
        8443 => ("HTTPS-ALT", "Web"),
        9418 => ("Git", "Development"),
        25565 => ("Minecraft", "Gaming"),
        27017 => ("MongoDB", "Database"),
        50051 => ("gRPC", "Development"),
        _ => return None,
    };
    Some(info)
}

/// Case-insensitive substring match over the ordered pattern list.
pub fn identify_app_from_domain(domain: &str) -> Option<AppInfo> {
    if domain.is_empty() {
        return None;
    }
    let lower = domain.to_lowercase();
    DOMAIN_PATTERNS
        .iter()
        .find(|(pattern, _, _)| lower.contains(pattern))
        .map(|(_, app, category)| AppInfo {
            app: (*app).to_string(),
            category: (*category).to_string(),
        })
}

pub fn identify_app_from_port(port: u16) -> Option<AppInfo> {
    port_app(port).map(|(app, category)| AppInfo {
        app: app.to_string(),
        category: category.to_string(),
    })
}

fn cache_domain_mapping(cache: &mut HashMap<String, AppInfo>, ip: Option<&str>, domain: &str) {
    let Some(ip) = ip else { return };
    if let Some(info) = identify_app_from_domain(domain) {
        cache.insert(ip.to_string(), info);
    }
}

/// Identify the application behind one packet, updating the IP→app cache
/// from SNI hosts and DNS answers along the way.
pub fn detect_application(pkt: &PacketRecord, cache: &mut HashMap<String, AppInfo>) -> AppInfo {
    if let Some(sni) = &pkt.tls_sni {
        if let Some(info) = identify_app_from_domain(sni) {
            cache_domain_mapping(cache, pkt.dst_addr(), sni);
            return info;
        }
    }

    if let Some(sni) = &pkt.quic_sni {
        if let Some(info) = identify_app_from_domain(sni) {
            cache_domain_mapping(cache, pkt.dst_addr(), sni);
            return info;
        }
    }

    if let Some(query) = &pkt.dns_query {
        if let Some(info) = identify_app_from_domain(query) {
            for answers in [&pkt.dns_a, &pkt.dns_aaaa].into_iter().flatten() {
                for ip in answers.split(',') {
                    let ip = ip.trim();
                    if !ip.is_empty() {
                        cache.insert(ip.to_string(), info.clone());
                    }
                }
            }
            return info;
        }
    }

    for addr in [pkt.dst_addr(), pkt.src_addr()].into_iter().flatten() {
        if let Some(info) = cache.get(addr) {
            return info.clone();
        }
    }

    if let Some(port) = pkt.dst_port() {
        if let Some(info) = identify_app_from_port(port) {
            return info;
        }
    }

    AppInfo::unknown()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::FIELD_COUNT;

    fn packet(fill: impl FnOnce(&mut Vec<String>)) -> PacketRecord {
        let mut parts = vec![String::new(); FIELD_COUNT];
        fill(&mut parts);
        PacketRecord::parse(&parts.join("|")).unwrap()
    }

    #[test]
    fn test_domain_match_is_case_insensitive() {
        let info = identify_app_from_domain("edge-star.FACEBOOK.com").unwrap();
        assert_eq!(info.app, "Facebook");
    }

    #[test]
    fn test_specific_pattern_wins_over_generic_google() {
        let info = identify_app_from_domain("r3---sn.googlevideo.com").unwrap();
        assert_eq!(info.app, "YouTube");
    }

    #[test]
    fn test_port_fallback() {
        let pkt = packet(|p| {
            p[3] = "1.2.3.4".to_string();
            p[24] = "443".to_string();
        });
        let mut cache = HashMap::new();
        let info = detect_application(&pkt, &mut cache);
        assert_eq!(info.app, "HTTPS");
        assert_eq!(info.category, "Web");
    }

    #[test]
    fn test_dns_answers_populate_cache() {
        let dns = packet(|p| {
            p[27] = "static.netflix.com".to_string();
            p[28] = "45.57.11.1,45.57.11.2".to_string();
        });
        let mut cache = HashMap::new();
        let info = detect_application(&dns, &mut cache);
        assert_eq!(info.app, "Netflix");

        let later = packet(|p| {
            p[2] = "10.0.0.1".to_string();
            p[3] = "45.57.11.2".to_string();
        });
        let info = detect_application(&later, &mut cache);
        assert_eq!(info.app, "Netflix");
    }

    #[test]
    fn test_sni_wins_over_ip_cache() {
        let dns = packet(|p| {
            p[27] = "example.google.com".to_string();
            p[28] = "1.2.3.4".to_string();
        });
        let mut cache = HashMap::new();
        detect_application(&dns, &mut cache);

        let tls = packet(|p| {
            p[3] = "1.2.3.4".to_string();
            p[30] = "www.facebook.com".to_string();
        });
        let info = detect_application(&tls, &mut cache);
        assert_eq!(info.app, "Facebook");
        // The SNI hit also repoints the cache entry.
        assert_eq!(cache.get("1.2.3.4").unwrap().app, "Facebook");
    }

    #[test]
    fn test_unknown_default() {
        let pkt = packet(|_| {});
        let mut cache = HashMap::new();
        assert_eq!(detect_application(&pkt, &mut cache), AppInfo::unknown());
    }
}
