//! Numeric address classification: private ranges, reserved space, and the
//! local country range table.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

// (network, prefix length)
const PRIVATE_V4: &[(u32, u32)] = &[
    (0x0A00_0000, 8),  // 10.0.0.0/8
    (0xAC10_0000, 12), // 172.16.0.0/12
    (0xC0A8_0000, 16), // 192.168.0.0/16
    (0x7F00_0000, 8),  // 127.0.0.0/8
    (0xA9FE_0000, 16), // 169.254.0.0/16
];

// Special-purpose space that never maps to a country
const RESERVED_V4: &[(u32, u32)] = &[
    (0x0000_0000, 8),  // 0.0.0.0/8
    (0x6440_0000, 10), // 100.64.0.0/10
    (0xC000_0200, 24), // 192.0.2.0/24
    (0xC612_0000, 15), // 198.18.0.0/15
    (0xC633_6400, 24), // 198.51.100.0/24
    (0xCB00_7100, 24), // 203.0.113.0/24
    (0xE000_0000, 4),  // 224.0.0.0/4
    (0xF000_0000, 4),  // 240.0.0.0/4
];

fn in_block(ip: u32, network: u32, prefix: u32) -> bool {
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    ip & mask == network & mask
}

/// Parses a client key into an address. Accepts a bare address or
/// `addr:port`; IPv4-mapped IPv6 addresses are unwrapped to IPv4.
pub fn parse_client(key: &str) -> Option<IpAddr> {
    let key = key.trim();
    let addr = key
        .parse::<IpAddr>()
        .ok()
        .or_else(|| key.parse::<SocketAddr>().ok().map(|s| s.ip()))?;
    Some(match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 => v4,
    })
}

/// RFC1918, loopback and link-local.
pub fn is_private(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let ip = u32::from(*v4);
            PRIVATE_V4.iter().any(|&(net, prefix)| in_block(ip, net, prefix))
        }
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v6(v6: &Ipv6Addr) -> bool {
    let first = v6.segments()[0];
    v6.is_loopback()
        || first & 0xFFC0 == 0xFE80 // fe80::/10
        || first & 0xFE00 == 0xFC00 // fc00::/7
}

/// Documentation, CGNAT, benchmarking, multicast and other non-routable
/// IPv4 space.
pub fn is_reserved(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let ip = u32::from(*v4);
            RESERVED_V4.iter().any(|&(net, prefix)| in_block(ip, net, prefix))
        }
        IpAddr::V6(v6) => v6.is_unspecified() || v6.is_multicast(),
    }
}

/// Inclusive IPv4 range mapped to a country, as written in `staticRanges`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub country: String,
}

impl StaticRange {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr, country: &str) -> Self {
        Self {
            start,
            end,
            country: country.to_string(),
        }
    }

    fn contains(&self, ip: u32) -> bool {
        u32::from(self.start) <= ip && ip <= u32::from(self.end)
    }
}

/// Coarse offline table, only consulted once every remote provider failed.
#[derive(Debug, Clone, Default)]
pub struct RangeTable {
    ranges: Vec<StaticRange>,
}

impl RangeTable {
    pub fn new(ranges: Vec<StaticRange>) -> Self {
        Self { ranges }
    }

    pub fn builtin() -> Self {
        Self::new(vec![
            StaticRange::new(Ipv4Addr::new(36, 64, 0, 0), Ipv4Addr::new(36, 95, 255, 255), "ID"),
            StaticRange::new(Ipv4Addr::new(165, 21, 0, 0), Ipv4Addr::new(165, 21, 255, 255), "SG"),
            StaticRange::new(Ipv4Addr::new(175, 136, 0, 0), Ipv4Addr::new(175, 143, 255, 255), "MY"),
            StaticRange::new(Ipv4Addr::new(8, 8, 8, 0), Ipv4Addr::new(8, 8, 8, 255), "US"),
            StaticRange::new(Ipv4Addr::new(1, 1, 1, 0), Ipv4Addr::new(1, 1, 1, 255), "AU"),
        ])
    }

    // Entries from config take precedence over the built-in ones
    pub fn with_overrides(extra: &[StaticRange]) -> Self {
        let mut ranges = extra.to_vec();
        ranges.extend(Self::builtin().ranges);
        Self::new(ranges)
    }

    pub fn lookup(&self, addr: &IpAddr) -> Option<&str> {
        let IpAddr::V4(v4) = addr else {
            return None;
        };
        let ip = u32::from(*v4);
        self.ranges
            .iter()
            .find(|r| r.contains(ip))
            .map(|r| r.country.as_str())
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
