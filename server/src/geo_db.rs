//! Static geolocation records for well-known public addresses.
//!
//! Lookups here short-circuit the external geolocation service for the
//! anycast resolvers and CDN frontends that dominate real captures.

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StaticGeo {
    pub city: &'static str,
    pub country: &'static str,
    pub lat: f64,
    pub lon: f64,
}

const STATIC_GEO_DB: &[(&str, StaticGeo)] = &[
    // Google
    ("8.8.8.8", StaticGeo { city: "Mountain View", country: "US", lat: 37.386, lon: -122.084 }),
    ("8.8.4.4", StaticGeo { city: "Mountain View", country: "US", lat: 37.386, lon: -122.084 }),
    ("142.250.185.46", StaticGeo { city: "Mountain View", country: "US", lat: 37.386, lon: -122.084 }),
    ("142.251.41.14", StaticGeo { city: "Mountain View", country: "US", lat: 37.386, lon: -122.084 }),
    ("172.217.164.46", StaticGeo { city: "Mountain View", country: "US", lat: 37.386, lon: -122.084 }),
    // Cloudflare
    ("1.1.1.1", StaticGeo { city: "Los Angeles", country: "US", lat: 34.053, lon: -118.243 }),
    ("1.0.0.1", StaticGeo { city: "Los Angeles", country: "US", lat: 34.053, lon: -118.243 }),
    ("104.16.132.229", StaticGeo { city: "Los Angeles", country: "US", lat: 34.053, lon: -118.243 }),
    ("104.16.133.229", StaticGeo { city: "Los Angeles", country: "US", lat: 34.053, lon: -118.243 }),
    // AWS
    ("52.84.42.1", StaticGeo { city: "N. Virginia", country: "US", lat: 38.946, lon: -77.456 }),
    ("52.85.81.194", StaticGeo { city: "N. Virginia", country: "US", lat: 38.946, lon: -77.456 }),
    ("52.36.0.0", StaticGeo { city: "Oregon", country: "US", lat: 43.835, lon: -120.554 }),
    ("54.239.28.30", StaticGeo { city: "California", country: "US", lat: 36.778, lon: -119.417 }),
    // Azure
    ("13.77.161.179", StaticGeo { city: "Chicago", country: "US", lat: 41.878, lon: -87.630 }),
    ("40.76.4.15", StaticGeo { city: "New York", country: "US", lat: 40.748, lon: -73.968 }),
    ("13.104.214.148", StaticGeo { city: "Seattle", country: "US", lat: 47.609, lon: -122.333 }),
    // Facebook
    ("31.13.64.1", StaticGeo { city: "Dublin", country: "IE", lat: 53.350, lon: -6.260 }),
    ("31.13.65.1", StaticGeo { city: "Dublin", country: "IE", lat: 53.350, lon: -6.260 }),
    ("157.240.241.35", StaticGeo { city: "San Jose", country: "US", lat: 37.339, lon: -121.895 }),
    ("31.13.68.60", StaticGeo { city: "Amsterdam", country: "NL", lat: 52.370, lon: 4.895 }),
    // Akamai
    ("23.200.0.1", StaticGeo { city: "New York", country: "US", lat: 40.748, lon: -73.968 }),
    ("72.246.0.1", StaticGeo { city: "London", country: "GB", lat: 51.507, lon: -0.128 }),
    ("23.55.0.1", StaticGeo { city: "Tokyo", country: "JP", lat: 35.676, lon: 139.650 }),
    // Fastly
    ("151.101.1.140", StaticGeo { city: "San Francisco", country: "US", lat: 37.775, lon: -122.419 }),
    ("151.101.65.140", StaticGeo { city: "Washington", country: "US", lat: 38.897, lon: -77.036 }),
    ("151.101.129.140", StaticGeo { city: "London", country: "GB", lat: 51.507, lon: -0.128 }),
    // Netflix
    ("52.89.214.238", StaticGeo { city: "Oregon", country: "US", lat: 43.835, lon: -120.554 }),
    ("52.38.235.39", StaticGeo { city: "Virginia", country: "US", lat: 38.946, lon: -77.456 }),
    // Twitter
    ("104.244.42.129", StaticGeo { city: "San Francisco", country: "US", lat: 37.775, lon: -122.419 }),
    ("104.244.42.193", StaticGeo { city: "San Francisco", country: "US", lat: 37.775, lon: -122.419 }),
    // GitHub
    ("140.82.114.3", StaticGeo { city: "San Francisco", country: "US", lat: 37.775, lon: -122.419 }),
    ("140.82.113.3", StaticGeo { city: "San Francisco", country: "US", lat: 37.775, lon: -122.419 }),
    ("140.82.112.3", StaticGeo { city: "San Francisco", country: "US", lat: 37.775, lon: -122.419 }),
    // Dropbox
    ("199.47.216.1", StaticGeo { city: "San Francisco", country: "US", lat: 37.775, lon: -122.419 }),
    ("108.160.162.1", StaticGeo { city: "San Francisco", country: "US", lat: 37.775, lon: -122.419 }),
    // Quad9 / OpenDNS resolvers
    ("9.9.9.9", StaticGeo { city: "Berkeley", country: "US", lat: 37.871, lon: -122.272 }),
    ("208.67.222.222", StaticGeo { city: "San Francisco", country: "US", lat: 37.775, lon: -122.419 }),
];

pub fn lookup(ip: &str) -> Option<&'static StaticGeo> {
    STATIC_GEO_DB
        .iter()
        .find(|(known, _)| *known == ip)
        .map(|(_, geo)| geo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_resolver_hit() {
        let geo = lookup("8.8.8.8").unwrap();
        assert_eq!(geo.city, "Mountain View");
        assert_eq!(geo.country, "US");
    }

    #[test]
    fn test_unknown_address_miss() {
        assert!(lookup("203.0.113.7").is_none());
    }
}
