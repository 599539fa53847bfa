use crate::rules::{RuleSet, ServiceMatch};
use anyhow::Result;
use futures::stream::{self, StreamExt};
use log::{debug, info};
use port_scan::os::record_banner_os_hint;
use port_scan::{tcp_connect, ConnectOutcome};
use recon_core::{HostPortWrite, PacketTransport, PortStatus, ResultStore, ScanOptions, TCP};
use std::net::Ipv4Addr;

pub const REASON_VERSION: &str = "tcp-conn-scan";

/// Store an identified service for `address:port`: the service row, an open
/// record carrying the banner, and the banner's OS hint if it named one.
pub fn record_match(
    store: &dyn ResultStore,
    address: &str,
    port: u16,
    found: &ServiceMatch,
    banner: &[u8],
) -> Result<()> {
    let host_id = store.upsert_host(address, None)?;
    let port_id = store.upsert_port(port, TCP)?;
    let version = found.info.version_string();
    let service_id = store.upsert_service(&found.service, Some(version.as_str()).filter(|v| !v.is_empty()))?;
    store.upsert_host_port(&HostPortWrite {
        host_id,
        port_id,
        status: PortStatus::Open,
        reason: REASON_VERSION,
        service_id: Some(service_id),
        banner: Some(banner),
    })?;
    if let Some(os) = found.info.os() {
        record_banner_os_hint(store, host_id, os, &found.service)?;
    }
    Ok(())
}

/// Connect to one port, read its banner and try to name the service.
/// `None` covers every way of not getting there: no connection, no banner,
/// no rule matched.
pub async fn version_scan(
    transport: &dyn PacketTransport,
    store: &dyn ResultStore,
    rules: &RuleSet,
    target: Ipv4Addr,
    port: u16,
    opts: &ScanOptions,
) -> Result<Option<ServiceMatch>> {
    let banner = match tcp_connect(transport, store, target, port, opts).await? {
        ConnectOutcome::Established { banner: Some(banner) } => banner,
        other => {
            debug!("version scan {}:{}: {:?}", target, port, other);
            return Ok(None);
        }
    };
    let Some(found) = rules.identify(&banner) else {
        debug!("version scan {}:{}: no rule matched {} byte banner", target, port, banner.len());
        return Ok(None);
    };
    record_match(store, &target.to_string(), port, &found, &banner)?;
    info!("{}:{} is {} {}", target, port, found.service, found.info.version_string());
    Ok(Some(found))
}

/// Version scan of several ports, `opts.concurrency` at a time. Returns the
/// ports that were identified, in completion order.
pub async fn version_scan_ports<I>(
    transport: &dyn PacketTransport,
    store: &dyn ResultStore,
    rules: &RuleSet,
    target: Ipv4Addr,
    ports: I,
    opts: &ScanOptions,
) -> Result<Vec<(u16, ServiceMatch)>>
where
    I: IntoIterator<Item = u16>,
{
    let results: Vec<Result<Option<(u16, ServiceMatch)>>> = stream::iter(ports)
        .map(|port| async move {
            let found = version_scan(transport, store, rules, target, port, opts).await?;
            Ok::<_, anyhow::Error>(found.map(|m| (port, m)))
        })
        .buffer_unordered(opts.concurrency.max(1))
        .collect()
        .await;
    let mut found = Vec::new();
    for r in results {
        found.extend(r?);
    }
    Ok(found)
}
