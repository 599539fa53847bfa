//! Raw TCP port probing: technique classification, the concurrent probe
//! dispatcher, full-connect probing and TTL based OS guessing.

pub mod classify;
pub mod connect;
pub mod dispatch;
pub mod os;

pub use classify::{classify, is_filtering_icmp};
pub use connect::{tcp_connect, ConnectOutcome};
pub use dispatch::{
    ack_scan, fin_scan, null_scan, scan_port, scan_ports, syn_scan, xmas_scan, BatchSummary,
    PortResult,
};

use anyhow::{anyhow, Context, Result};
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::ops::RangeInclusive;

/// Ports named by a comma-separated list of single ports and inclusive
/// `low-high` ranges, yielded lazily in the order given. Overlapping parts
/// yield their shared ports more than once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRange {
    parts: Vec<RangeInclusive<u16>>,
}

impl PortRange {
    pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
        self.parts.iter().flat_map(|r| r.clone())
    }
}

impl IntoIterator for PortRange {
    type Item = u16;
    type IntoIter = std::iter::Flatten<std::vec::IntoIter<RangeInclusive<u16>>>;

    fn into_iter(self) -> Self::IntoIter {
        self.parts.into_iter().flatten()
    }
}

/// Parse a port specification such as `"22,80,443,8000-8010"`.
pub fn parse_range(spec: &str) -> Result<PortRange> {
    let mut parts = Vec::new();
    for part in spec.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let s: u16 = start.trim().parse().with_context(|| format!("invalid port range: {}", part))?;
            let e: u16 = end.trim().parse().with_context(|| format!("invalid port range: {}", part))?;
            if s > e {
                return Err(anyhow!("invalid port range: {}", part));
            }
            parts.push(s..=e);
        } else {
            let p: u16 = part.parse().with_context(|| format!("invalid port: {}", part))?;
            parts.push(p..=p);
        }
    }
    Ok(PortRange { parts })
}

/// Resolve a target to the IPv4 address probes are sent to.
pub fn resolve_target(host: &str) -> Result<Ipv4Addr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    (host, 0u16)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve: {}", host))?
        .find_map(|sa| match sa.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| anyhow!("no IPv4 address for {}", host))
}
