//! One full pass over a target: SYN sweep, banner identification, HTTP
//! header probing, evasion probing of filtered ports, then the report.
//!
//! Steps run one after another and each starts from what the store holds
//! after the previous one.

use anyhow::Result;
use futures::stream::{self, StreamExt};
use log::info;
use port_scan::{scan_port, syn_scan};
use recon_core::{HttpProbe, PacketTransport, PortStatus, ResultStore, ScanOptions, Technique};
use service_probes::{version_scan_ports, RuleSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use web_surface::{http_version_probe, record_http_service, HTTP_PORTS};

/// Evasion techniques tried on every filtered port, in this order.
pub const EVASION_ORDER: [Technique; 4] = [Technique::Null, Technique::Xmas, Technique::Fin, Technique::Ack];

/// What each step touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepCounts {
    pub probed: usize,
    pub open: usize,
    pub identified: usize,
    pub http: usize,
    pub evasion: usize,
}

pub struct FullScan {
    transport: Arc<dyn PacketTransport>,
    store: Arc<dyn ResultStore>,
    http: Arc<dyn HttpProbe>,
    rules: Arc<RuleSet>,
    options: ScanOptions,
}

impl FullScan {
    pub fn new(
        transport: Arc<dyn PacketTransport>,
        store: Arc<dyn ResultStore>,
        http: Arc<dyn HttpProbe>,
        rules: Arc<RuleSet>,
        options: ScanOptions,
    ) -> Self {
        FullScan { transport, store, http, rules, options }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Run every step against `target` and return the stored report for it.
    pub async fn run<I>(&self, target: Ipv4Addr, ports: I) -> Result<String>
    where
        I: IntoIterator<Item = u16>,
    {
        let (report, counts) = self.run_counted(target, ports).await?;
        info!("full scan of {} finished: {:?}", target, counts);
        Ok(report)
    }

    pub async fn run_counted<I>(&self, target: Ipv4Addr, ports: I) -> Result<(String, StepCounts)>
    where
        I: IntoIterator<Item = u16>,
    {
        let address = target.to_string();
        let mut counts = StepCounts::default();

        info!("step 1: syn sweep of {}", address);
        let batch = syn_scan(self.transport.clone(), self.store.as_ref(), target, ports, &self.options).await?;
        counts.probed = batch.results.len();

        let open = self.ports_with(&address, |s| s == PortStatus::Open)?;
        counts.open = open.len();
        info!("step 2: identifying {} open ports", open.len());
        counts.identified = self.identify(target, &open).await?;

        let candidates: Vec<u16> = self
            .store
            .query_ports(&address)?
            .into_iter()
            .filter(|p| p.status == PortStatus::Open && p.service_name.is_none() && HTTP_PORTS.contains(&p.port))
            .map(|p| p.port)
            .collect();
        info!("step 3: http probing {} ports", candidates.len());
        counts.http = self.http_probe(&address, &candidates).await?;

        let filtered = self.ports_with(&address, |s| s == PortStatus::Filtered)?;
        info!("step 4: evasion probing {} filtered ports", filtered.len());
        counts.evasion = self.evade(target, &filtered).await?;

        info!("step 5: report");
        Ok((self.store.report(&address)?, counts))
    }

    fn ports_with(&self, address: &str, keep: impl Fn(PortStatus) -> bool) -> Result<Vec<u16>> {
        let mut ports: Vec<u16> = self
            .store
            .query_ports(address)?
            .into_iter()
            .filter(|p| keep(p.status))
            .map(|p| p.port)
            .collect();
        ports.sort_unstable();
        Ok(ports)
    }

    async fn identify(&self, target: Ipv4Addr, ports: &[u16]) -> Result<usize> {
        let found = version_scan_ports(
            self.transport.as_ref(),
            self.store.as_ref(),
            &self.rules,
            target,
            ports.iter().copied(),
            &self.options,
        )
        .await?;
        Ok(found.len())
    }

    async fn http_probe(&self, address: &str, ports: &[u16]) -> Result<usize> {
        let mut found = 0;
        for &port in ports {
            if let Some(summary) = http_version_probe(self.http.as_ref(), address, port, self.options.http_timeout).await {
                record_http_service(self.store.as_ref(), address, port, &summary)?;
                found += 1;
            }
        }
        Ok(found)
    }

    async fn evade(&self, target: Ipv4Addr, ports: &[u16]) -> Result<usize> {
        let results: Vec<Result<()>> = stream::iter(ports.iter().copied())
            .map(|port| async move {
                // Each technique overwrites the previous one's record for this port.
                for technique in EVASION_ORDER {
                    scan_port(self.transport.clone(), self.store.as_ref(), target, port, technique, &self.options).await?;
                }
                Ok::<_, anyhow::Error>(())
            })
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;
        let done = results.len();
        for r in results {
            r?;
        }
        Ok(done)
    }
}
