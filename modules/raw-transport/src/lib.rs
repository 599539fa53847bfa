//! Raw IPv4 packet transport built on pnet layer-3 channels.
//!
//! Every exchange opens its own TCP and ICMP receive channels before the
//! probe leaves, so early replies are not missed. Needs raw socket privilege.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use log::{debug, trace};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::tcp::{self, MutableTcpPacket, TcpPacket};
use pnet::packet::Packet;
use pnet::transport::{ipv4_packet_iter, transport_channel, TransportChannelType, TransportSender};
use rand::Rng;
use recon_core::{PacketTransport, ProbeOutcome, TcpProbe, TcpReply};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::{Duration, Instant};

const IPV4_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
pub const SEGMENT_LEN: usize = IPV4_HEADER_LEN + TCP_HEADER_LEN;
const ICMP_HEADER_LEN: usize = 8;
const OUTGOING_TTL: u8 = 64;
const WINDOW: u16 = 1024;
const CHANNEL_BUFFER: usize = 4096;
const POLL: Duration = Duration::from_millis(20);

/// Source address the kernel would route `target` from.
pub fn local_ipv4_for(target: Ipv4Addr) -> Result<Ipv4Addr> {
    let sock = UdpSocket::bind("0.0.0.0:0").context("bind probe socket")?;
    sock.connect((target, 53)).with_context(|| format!("no route to {}", target))?;
    match sock.local_addr()?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        other => bail!("route to {} uses non-IPv4 source {}", target, other),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RawTransport {
    source: Ipv4Addr,
}

impl RawTransport {
    pub fn new(source: Ipv4Addr) -> Self {
        RawTransport { source }
    }

    /// Transport whose source address is the one routing to `target`.
    pub fn for_target(target: Ipv4Addr) -> Result<Self> {
        Ok(RawTransport::new(local_ipv4_for(target)?))
    }

    pub fn source(&self) -> Ipv4Addr {
        self.source
    }
}

/// Write the IPv4 and TCP headers of `probe` into `buf`, checksums included.
pub fn build_segment(buf: &mut [u8; SEGMENT_LEN], source: Ipv4Addr, probe: &TcpProbe) -> Result<()> {
    {
        let mut ip = MutableIpv4Packet::new(&mut buf[..]).ok_or_else(|| anyhow!("ipv4 buffer too small"))?;
        ip.set_version(4);
        ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
        ip.set_total_length(SEGMENT_LEN as u16);
        ip.set_identification(rand::thread_rng().gen());
        ip.set_flags(Ipv4Flags::DontFragment);
        ip.set_ttl(OUTGOING_TTL);
        ip.set_next_level_protocol(IpNextHeaderProtocols::Tcp);
        ip.set_source(source);
        ip.set_destination(probe.dst);
    }
    {
        let mut seg = MutableTcpPacket::new(&mut buf[IPV4_HEADER_LEN..]).ok_or_else(|| anyhow!("tcp buffer too small"))?;
        seg.set_source(probe.src_port);
        seg.set_destination(probe.dst_port);
        seg.set_sequence(probe.seq);
        seg.set_acknowledgement(probe.ack);
        seg.set_data_offset((TCP_HEADER_LEN / 4) as u8);
        seg.set_flags(probe.flags.into());
        seg.set_window(WINDOW);
        seg.set_checksum(0);
        let sum = tcp::ipv4_checksum(&seg.to_immutable(), &source, &probe.dst);
        seg.set_checksum(sum);
    }
    let mut ip = MutableIpv4Packet::new(&mut buf[..]).ok_or_else(|| anyhow!("ipv4 buffer too small"))?;
    let sum = ipv4::checksum(&ip.to_immutable());
    ip.set_checksum(sum);
    Ok(())
}

/// A TCP segment from the probed port back to the probe's source port.
pub fn match_tcp(pkt: &Ipv4Packet<'_>, probe: &TcpProbe) -> Option<ProbeOutcome> {
    if pkt.get_source() != probe.dst || pkt.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
        return None;
    }
    let seg = TcpPacket::new(pkt.payload())?;
    if seg.get_source() != probe.dst_port || seg.get_destination() != probe.src_port {
        return None;
    }
    Some(ProbeOutcome::TcpReply(TcpReply {
        flags: seg.get_flags() as u8,
        ttl: pkt.get_ttl(),
        seq: seg.get_sequence(),
        ack: seg.get_acknowledgement(),
        payload: seg.payload().to_vec(),
    }))
}

/// An ICMP error quoting a datagram of the probe's flow.
pub fn match_icmp(pkt: &Ipv4Packet<'_>, probe: &TcpProbe) -> Option<ProbeOutcome> {
    if pkt.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
        return None;
    }
    let icmp = pkt.payload();
    let quoted = icmp.get(ICMP_HEADER_LEN..)?;
    let ihl = usize::from(*quoted.first()? & 0x0f) * 4;
    let ports = quoted.get(ihl..ihl + 4)?;
    let dst = quoted.get(16..20)?;
    if quoted.get(9) != Some(&6) || dst != probe.dst.octets() {
        return None;
    }
    let src_port = u16::from_be_bytes([ports[0], ports[1]]);
    let dst_port = u16::from_be_bytes([ports[2], ports[3]]);
    if src_port != probe.src_port || dst_port != probe.dst_port {
        return None;
    }
    Some(ProbeOutcome::IcmpReply { icmp_type: icmp[0], code: icmp[1], ttl: pkt.get_ttl() })
}

fn send_segment(tx: &mut TransportSender, source: Ipv4Addr, probe: &TcpProbe) -> Result<()> {
    let mut buf = [0u8; SEGMENT_LEN];
    build_segment(&mut buf, source, probe)?;
    let pkt = Ipv4Packet::new(&buf).ok_or_else(|| anyhow!("ipv4 packet view"))?;
    tx.send_to(pkt, IpAddr::V4(probe.dst))
        .with_context(|| format!("send to {}:{}", probe.dst, probe.dst_port))?;
    trace!("sent flags {:#04x} {}:{} -> {}:{}", probe.flags, source, probe.src_port, probe.dst, probe.dst_port);
    Ok(())
}

fn open(protocol: pnet::packet::ip::IpNextHeaderProtocol) -> Result<(TransportSender, pnet::transport::TransportReceiver)> {
    transport_channel(CHANNEL_BUFFER, TransportChannelType::Layer3(protocol))
        .with_context(|| format!("open raw {:?} channel (requires root)", protocol))
}

fn exchange(source: Ipv4Addr, probe: TcpProbe, timeout: Duration, retries: u32) -> Result<ProbeOutcome> {
    let (mut tx, mut tcp_rx) = open(IpNextHeaderProtocols::Tcp)?;
    let (_icmp_tx, mut icmp_rx) = open(IpNextHeaderProtocols::Icmp)?;
    let mut tcp_iter = ipv4_packet_iter(&mut tcp_rx);
    let mut icmp_iter = ipv4_packet_iter(&mut icmp_rx);

    for attempt in 0..=retries {
        send_segment(&mut tx, source, &probe)?;
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some((pkt, _)) = tcp_iter.next_with_timeout(POLL)? {
                if let Some(reply) = match_tcp(&pkt, &probe) {
                    return Ok(reply);
                }
            }
            if let Some((pkt, _)) = icmp_iter.next_with_timeout(POLL)? {
                if let Some(reply) = match_icmp(&pkt, &probe) {
                    return Ok(reply);
                }
            }
        }
        debug!("{}:{} silent after attempt {}", probe.dst, probe.dst_port, attempt + 1);
    }
    Ok(ProbeOutcome::NoResponse)
}

#[async_trait]
impl PacketTransport for RawTransport {
    async fn send_and_wait(&self, probe: &TcpProbe, timeout: Duration, retries: u32) -> Result<ProbeOutcome> {
        let (source, probe) = (self.source, *probe);
        tokio::task::spawn_blocking(move || exchange(source, probe, timeout, retries))
            .await
            .context("raw exchange task")?
    }

    async fn send(&self, probe: &TcpProbe) -> Result<()> {
        let (source, probe) = (self.source, *probe);
        tokio::task::spawn_blocking(move || {
            let (mut tx, _rx) = open(IpNextHeaderProtocols::Tcp)?;
            send_segment(&mut tx, source, &probe)
        })
        .await
        .context("raw send task")?
    }
}
