//! Maps a probe outcome to a port status and reason code, per technique.

use recon_core::{tcp_flags, Classification, PortStatus, ProbeOutcome, Technique};

pub const ICMP_DEST_UNREACHABLE: u8 = 3;

/// Destination-unreachable codes that mean a filter dropped the probe: host,
/// protocol and port unreachable plus the administratively prohibited family.
pub const FILTERING_ICMP_CODES: [u8; 6] = [1, 2, 3, 9, 10, 13];

pub fn is_filtering_icmp(icmp_type: u8, code: u8) -> bool {
    icmp_type == ICMP_DEST_UNREACHABLE && FILTERING_ICMP_CODES.contains(&code)
}

/// `None` means the response says nothing about the port and the stored
/// record must stay as it is.
pub fn classify(technique: Technique, outcome: &ProbeOutcome) -> Option<Classification> {
    match technique {
        Technique::Syn => classify_syn(outcome),
        Technique::Null | Technique::Fin | Technique::Xmas => {
            classify_stealth(technique, outcome, PortStatus::OpenFiltered, PortStatus::Closed)
        }
        Technique::Ack => {
            classify_stealth(technique, outcome, PortStatus::Filtered, PortStatus::NotFiltered)
        }
    }
}

fn classify_syn(outcome: &ProbeOutcome) -> Option<Classification> {
    let verdict = match outcome {
        ProbeOutcome::NoResponse => (PortStatus::Filtered, "no-response"),
        ProbeOutcome::TcpReply(r) => match r.flags {
            tcp_flags::RST => (PortStatus::Closed, "tcp-reset"),
            tcp_flags::RST_ACK => (PortStatus::Closed, "tcp-rst"),
            tcp_flags::SYN_ACK => (PortStatus::Open, "tcp-syn-ack"),
            _ => return None,
        },
        ProbeOutcome::IcmpReply { icmp_type, code, .. } if is_filtering_icmp(*icmp_type, *code) => {
            (PortStatus::Filtered, "icmp-unreachable")
        }
        ProbeOutcome::IcmpReply { .. } => return None,
    };
    Some(Classification::new(verdict.0, verdict.1))
}

/// NULL, FIN, XMAS and ACK share one shape: silence, a bare RST, or a filtering ICMP.
fn classify_stealth(
    technique: Technique,
    outcome: &ProbeOutcome,
    on_silence: PortStatus,
    on_reset: PortStatus,
) -> Option<Classification> {
    let (status, suffix) = match outcome {
        ProbeOutcome::NoResponse => (on_silence, "no-response"),
        ProbeOutcome::TcpReply(r) if r.flags == tcp_flags::RST => (on_reset, "tcp-reset"),
        ProbeOutcome::IcmpReply { icmp_type, code, .. } if is_filtering_icmp(*icmp_type, *code) => {
            (PortStatus::Filtered, "icmp-unreachable")
        }
        _ => return None,
    };
    let reason = match technique.reason_prefix() {
        Some(prefix) => format!("{}-{}", prefix, suffix),
        None => suffix.to_string(),
    };
    Some(Classification::new(status, reason))
}
