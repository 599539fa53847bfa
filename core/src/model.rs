//! Probe shapes, probe outcomes and the port-state vocabulary.

use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// TCP header flag bits.
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub const SYN_ACK: u8 = SYN | ACK;
    pub const RST_ACK: u8 = RST | ACK;
}

/// Reachability state stored for a host/port pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortStatus {
    Open,
    Closed,
    Filtered,
    OpenFiltered,
    /// ACK probing reached the port: something answered, so no filter dropped it.
    NotFiltered,
}

impl PortStatus {
    pub const ALL: [PortStatus; 5] = [
        PortStatus::Open,
        PortStatus::Closed,
        PortStatus::Filtered,
        PortStatus::OpenFiltered,
        PortStatus::NotFiltered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PortStatus::Open => "open",
            PortStatus::Closed => "closed",
            PortStatus::Filtered => "filtered",
            PortStatus::OpenFiltered => "open|filtered",
            PortStatus::NotFiltered => "no-filtered",
        }
    }
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown port status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for PortStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PortStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// Raw-packet probing technique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Technique {
    Syn,
    Null,
    Fin,
    Xmas,
    Ack,
}

impl Technique {
    /// Flags carried by the probe packet.
    pub fn flags(&self) -> u8 {
        use tcp_flags::*;
        match self {
            Technique::Syn => SYN,
            Technique::Null => 0,
            Technique::Fin => FIN,
            Technique::Xmas => FIN | PSH | URG,
            Technique::Ack => ACK,
        }
    }

    /// Prefix of the reason codes this technique writes. SYN reasons carry none.
    pub fn reason_prefix(&self) -> Option<&'static str> {
        match self {
            Technique::Syn => None,
            Technique::Null => Some("null-scan"),
            Technique::Fin => Some("fin-scan"),
            Technique::Xmas => Some("xmas-scan"),
            Technique::Ack => Some("ack-scan"),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Technique::Syn => "syn",
            Technique::Null => "null",
            Technique::Fin => "fin",
            Technique::Xmas => "xmas",
            Technique::Ack => "ack",
        }
    }
}

impl fmt::Display for Technique {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Source ports are drawn from this window so replies are easy to tell apart
/// from the host's own traffic.
pub const SOURCE_PORTS: std::ops::RangeInclusive<u16> = 54000..=55000;

/// One crafted IPv4/TCP segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpProbe {
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
    pub seq: u32,
    pub ack: u32,
}

impl TcpProbe {
    /// Fresh probe with a random source port and initial sequence number.
    pub fn new(dst: Ipv4Addr, dst_port: u16, flags: u8) -> Self {
        let mut rng = thread_rng();
        TcpProbe {
            dst,
            src_port: rng.gen_range(SOURCE_PORTS),
            dst_port,
            flags,
            seq: rng.gen(),
            ack: 0,
        }
    }

    /// Follow-up segment on the same flow.
    pub fn follow_up(&self, flags: u8, seq: u32, ack: u32) -> Self {
        TcpProbe { flags, seq, ack, ..*self }
    }
}

/// TCP segment received in answer to a probe.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TcpReply {
    pub flags: u8,
    pub ttl: u8,
    pub seq: u32,
    pub ack: u32,
    pub payload: Vec<u8>,
}

/// What came back for one probe after all retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    NoResponse,
    TcpReply(TcpReply),
    IcmpReply { icmp_type: u8, code: u8, ttl: u8 },
}

impl ProbeOutcome {
    pub fn tcp(flags: u8, ttl: u8) -> Self {
        ProbeOutcome::TcpReply(TcpReply { flags, ttl, ..TcpReply::default() })
    }

    pub fn ttl(&self) -> Option<u8> {
        match self {
            ProbeOutcome::NoResponse => None,
            ProbeOutcome::TcpReply(r) => Some(r.ttl),
            ProbeOutcome::IcmpReply { ttl, .. } => Some(*ttl),
        }
    }

    pub fn tcp_flags(&self) -> Option<u8> {
        match self {
            ProbeOutcome::TcpReply(r) => Some(r.flags),
            _ => None,
        }
    }

    pub fn is_syn_ack(&self) -> bool {
        self.tcp_flags() == Some(tcp_flags::SYN_ACK)
    }
}

/// Verdict for one port produced by one technique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub status: PortStatus,
    pub reason: String,
}

impl Classification {
    pub fn new(status: PortStatus, reason: impl Into<String>) -> Self {
        Classification { status, reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for st in PortStatus::ALL {
            assert_eq!(st.as_str().parse::<PortStatus>().unwrap(), st);
        }
        assert!("half-open".parse::<PortStatus>().is_err());
    }

    #[test]
    fn xmas_lights_fin_psh_urg() {
        assert_eq!(Technique::Xmas.flags(), 0x29);
        assert_eq!(Technique::Null.flags(), 0);
    }

    #[test]
    fn fresh_probe_uses_source_window() {
        let p = TcpProbe::new(Ipv4Addr::LOCALHOST, 22, tcp_flags::SYN);
        assert!(SOURCE_PORTS.contains(&p.src_port));
        let rst = p.follow_up(tcp_flags::RST, 7, 0);
        assert_eq!(rst.src_port, p.src_port);
        assert_eq!(rst.dst_port, 22);
    }
}
