//! Full three-way handshake over the packet transport, with an optional
//! banner read before the connection is torn down.

use anyhow::Result;
use log::{debug, warn};
use recon_core::{
    tcp_flags, HostPortWrite, PacketTransport, PortStatus, ProbeOutcome, ResultStore, ScanOptions,
    TcpProbe, TCP,
};
use std::net::Ipv4Addr;

pub const REASON_SYNACK: &str = "tcp-conn-synack";
pub const REASON_RESET: &str = "tcp-conn-reset";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Handshake completed; `banner` holds whatever the service sent first.
    Established { banner: Option<Vec<u8>> },
    Refused,
    NoResponse,
}

/// Connect to `target:port`, record the open or closed verdict and return
/// what happened. Silence leaves the store untouched.
pub async fn tcp_connect(
    transport: &dyn PacketTransport,
    store: &dyn ResultStore,
    target: Ipv4Addr,
    port: u16,
    opts: &ScanOptions,
) -> Result<ConnectOutcome> {
    let syn = TcpProbe::new(target, port, tcp_flags::SYN);
    let reply = match transport.send_and_wait(&syn, opts.timeout, opts.retries).await {
        Ok(ProbeOutcome::TcpReply(reply)) => reply,
        Ok(other) => {
            debug!("connect {}:{}: {:?}", target, port, other);
            return Ok(ConnectOutcome::NoResponse);
        }
        Err(e) => {
            warn!("connect {}:{} failed: {:#}", target, port, e);
            return Ok(ConnectOutcome::NoResponse);
        }
    };

    let address = target.to_string();
    match reply.flags {
        tcp_flags::SYN_ACK => {
            write_status(store, &address, port, PortStatus::Open, REASON_SYNACK)?;
            let ack = syn.follow_up(tcp_flags::ACK, reply.ack, reply.seq.wrapping_add(1));
            let banner = match transport.send_and_wait(&ack, opts.banner_timeout, 0).await {
                Ok(ProbeOutcome::TcpReply(data)) if !data.payload.is_empty() => Some(data.payload),
                Ok(_) => None,
                Err(e) => {
                    debug!("no banner from {}:{}: {:#}", target, port, e);
                    None
                }
            };
            if opts.teardown {
                let rst = ack.follow_up(tcp_flags::RST, ack.seq, 0);
                if let Err(e) = transport.send(&rst).await {
                    debug!("reset to {}:{} not sent: {:#}", target, port, e);
                }
            }
            Ok(ConnectOutcome::Established { banner })
        }
        tcp_flags::RST | tcp_flags::RST_ACK => {
            write_status(store, &address, port, PortStatus::Closed, REASON_RESET)?;
            Ok(ConnectOutcome::Refused)
        }
        other => {
            debug!("connect {}:{}: unexpected flags {:#04x}", target, port, other);
            Ok(ConnectOutcome::NoResponse)
        }
    }
}

fn write_status(
    store: &dyn ResultStore,
    address: &str,
    port: u16,
    status: PortStatus,
    reason: &str,
) -> Result<()> {
    let host_id = store.upsert_host(address, None)?;
    let port_id = store.upsert_port(port, TCP)?;
    store.upsert_host_port(&HostPortWrite {
        host_id,
        port_id,
        status,
        reason,
        service_id: None,
        banner: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::mock::ScriptedTransport;
    use recon_core::tcp_flags::*;
    use recon_core::TcpReply;
    use results_sqlite::Db;

    const TARGET: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 10);

    fn seg(flags: u8, seq: u32, ack: u32, payload: &[u8]) -> ProbeOutcome {
        ProbeOutcome::TcpReply(TcpReply { flags, ttl: 64, seq, ack, payload: payload.to_vec() })
    }

    #[tokio::test]
    async fn handshake_reads_banner_and_resets() {
        let transport = ScriptedTransport::new()
            .reply(22, SYN, seg(SYN_ACK, 1000, 77, b""))
            .reply(22, ACK, seg(PSH | ACK, 1001, 77, b"SSH-2.0-OpenSSH_8.9\r\n"));
        let db = Db::open_in_memory().unwrap();
        let out = tcp_connect(&transport, &db, TARGET, 22, &ScanOptions::default()).await.unwrap();

        assert_eq!(out, ConnectOutcome::Established { banner: Some(b"SSH-2.0-OpenSSH_8.9\r\n".to_vec()) });
        let rec = db.port_record("192.0.2.10", 22).unwrap().unwrap();
        assert_eq!((rec.status, rec.reason.as_str()), (PortStatus::Open, REASON_SYNACK));

        let acks = transport.sent_with_flags(ACK);
        assert_eq!(acks.len(), 1);
        assert_eq!((acks[0].seq, acks[0].ack), (77, 1001));
        let rsts = transport.sent_with_flags(RST);
        assert_eq!(rsts.len(), 1);
        assert_eq!(rsts[0].seq, 77);
    }

    #[tokio::test]
    async fn silent_service_gives_no_banner_and_teardown_can_be_skipped() {
        let transport = ScriptedTransport::new().reply(80, SYN, seg(SYN_ACK, 5, 6, b""));
        let db = Db::open_in_memory().unwrap();
        let opts = ScanOptions { teardown: false, ..ScanOptions::default() };
        let out = tcp_connect(&transport, &db, TARGET, 80, &opts).await.unwrap();

        assert_eq!(out, ConnectOutcome::Established { banner: None });
        assert!(transport.sent_with_flags(RST).is_empty());
    }

    #[tokio::test]
    async fn reset_means_refused() {
        let transport = ScriptedTransport::new().reply(23, SYN, seg(RST_ACK, 0, 0, b""));
        let db = Db::open_in_memory().unwrap();
        let out = tcp_connect(&transport, &db, TARGET, 23, &ScanOptions::default()).await.unwrap();

        assert_eq!(out, ConnectOutcome::Refused);
        let rec = db.port_record("192.0.2.10", 23).unwrap().unwrap();
        assert_eq!((rec.status, rec.reason.as_str()), (PortStatus::Closed, REASON_RESET));
    }

    #[tokio::test]
    async fn silence_writes_nothing() {
        let transport = ScriptedTransport::new().fail(25);
        let db = Db::open_in_memory().unwrap();
        assert_eq!(
            tcp_connect(&transport, &db, TARGET, 24, &ScanOptions::default()).await.unwrap(),
            ConnectOutcome::NoResponse
        );
        assert_eq!(
            tcp_connect(&transport, &db, TARGET, 25, &ScanOptions::default()).await.unwrap(),
            ConnectOutcome::NoResponse
        );
        assert!(db.port_record("192.0.2.10", 24).unwrap().is_none());
        assert!(db.port_record("192.0.2.10", 25).unwrap().is_none());
    }
}
