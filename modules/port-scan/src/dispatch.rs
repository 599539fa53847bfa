//! Concurrent probe dispatch for one target.
//!
//! Each port gets its own task; tasks report back through a channel with a
//! typed completion that names the port it belongs to, so results are
//! processed in whatever order they finish. All store writes happen on the
//! collecting side, one completion at a time.

use crate::classify::classify;
use crate::os;
use anyhow::Result;
use log::{debug, info, warn};
use recon_core::{
    tcp_flags, Classification, HostId, HostPortWrite, PacketTransport, PortStatus, ProbeOutcome,
    ResultStore, ScanOptions, TcpProbe, Technique, TCP,
};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

/// One finished probe.
#[derive(Debug)]
struct PortOutcome {
    port: u16,
    outcome: ProbeOutcome,
    transport_error: bool,
}

/// What one port came to within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortResult {
    pub port: u16,
    /// `None` when the response left the stored record untouched.
    pub classification: Option<Classification>,
    pub transport_error: bool,
    /// Still outstanding when the batch deadline passed.
    pub expired: bool,
}

/// Per-port results of a batch in completion order.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub results: Vec<PortResult>,
}

impl BatchSummary {
    pub fn count(&self, status: PortStatus) -> usize {
        self.results
            .iter()
            .filter(|r| r.classification.as_ref().map(|c| c.status) == Some(status))
            .count()
    }

    pub fn transport_errors(&self) -> usize {
        self.results.iter().filter(|r| r.transport_error).count()
    }

    pub fn expired(&self) -> usize {
        self.results.iter().filter(|r| r.expired).count()
    }

    pub fn ignored(&self) -> usize {
        self.results.iter().filter(|r| r.classification.is_none()).count()
    }
}

/// Probe every port in `ports` with `technique` and record each verdict.
///
/// At most `opts.concurrency` probes are in flight. A transport failure counts
/// as no response for that port only. The call returns once every probe has
/// completed, or once `opts.deadline` passes, in which case the ports still
/// outstanding are recorded as unanswered.
pub async fn scan_ports<I>(
    transport: Arc<dyn PacketTransport>,
    store: &dyn ResultStore,
    target: Ipv4Addr,
    ports: I,
    technique: Technique,
    opts: &ScanOptions,
) -> Result<BatchSummary>
where
    I: IntoIterator<Item = u16>,
{
    let address = target.to_string();
    let host_id = store.upsert_host(&address, None)?;

    let sem = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let (tx, mut rx) = mpsc::channel::<PortOutcome>(opts.concurrency.max(1));
    let mut pending: HashMap<u16, usize> = HashMap::new();
    let mut workers = Workers(Vec::new());

    for port in ports {
        *pending.entry(port).or_default() += 1;
        let tx = tx.clone();
        let sem = sem.clone();
        let transport = transport.clone();
        let (timeout, retries) = (opts.timeout, opts.retries);
        workers.0.push(tokio::spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else { return };
            let done = probe_port(transport.as_ref(), target, port, technique, timeout, retries).await;
            let _ = tx.send(done).await;
        }));
    }
    drop(tx);
    info!("{} scan of {}: {} probes dispatched", technique, address, workers.0.len());

    let mut batch = Batch { store, host_id, technique, ttl_seen: HashSet::new(), summary: BatchSummary::default() };
    let deadline = opts.deadline.map(|d| tokio::time::Instant::now() + d);
    loop {
        let next = match deadline {
            Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                Ok(next) => next,
                Err(_) => {
                    warn!("{} scan of {}: deadline passed with probes outstanding", technique, address);
                    break;
                }
            },
            None => rx.recv().await,
        };
        let Some(done) = next else { break };
        settle(&mut pending, done.port);
        batch.record(done)?;
    }

    workers.abort();
    // Completions that raced the deadline still count.
    while let Ok(done) = rx.try_recv() {
        settle(&mut pending, done.port);
        batch.record(done)?;
    }
    for (port, n) in pending {
        for _ in 0..n {
            batch.record_expired(port)?;
        }
    }

    let summary = batch.summary;
    info!(
        "{} scan of {} done: {} open, {} closed, {} filtered, {} transport errors",
        technique,
        address,
        summary.count(PortStatus::Open),
        summary.count(PortStatus::Closed),
        summary.count(PortStatus::Filtered),
        summary.transport_errors()
    );
    Ok(summary)
}

/// Spawned probe tasks; aborted when the batch ends, including on an early
/// return through `?`.
struct Workers(Vec<JoinHandle<()>>);

impl Workers {
    fn abort(&self) {
        for h in &self.0 {
            h.abort();
        }
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.abort();
    }
}

fn settle(pending: &mut HashMap<u16, usize>, port: u16) {
    if let Some(n) = pending.get_mut(&port) {
        *n -= 1;
        if *n == 0 {
            pending.remove(&port);
        }
    }
}

async fn probe_port(
    transport: &dyn PacketTransport,
    target: Ipv4Addr,
    port: u16,
    technique: Technique,
    timeout: Duration,
    retries: u32,
) -> PortOutcome {
    let probe = TcpProbe::new(target, port, technique.flags());
    let (outcome, transport_error) = match transport.send_and_wait(&probe, timeout, retries).await {
        Ok(outcome) => (outcome, false),
        Err(e) => {
            warn!("{} probe to {}:{} failed: {:#}", technique, target, port, e);
            (ProbeOutcome::NoResponse, true)
        }
    };
    if technique == Technique::Syn {
        if let ProbeOutcome::TcpReply(reply) = &outcome {
            if reply.flags == tcp_flags::SYN_ACK {
                // Tear the half-open connection down.
                let rst = probe.follow_up(tcp_flags::RST, reply.ack, 0);
                if let Err(e) = transport.send(&rst).await {
                    debug!("reset to {}:{} not sent: {:#}", target, port, e);
                }
            }
        }
    }
    debug!("{} {}:{} -> {:?}", technique, target, port, outcome);
    PortOutcome { port, outcome, transport_error }
}

struct Batch<'a> {
    store: &'a dyn ResultStore,
    host_id: HostId,
    technique: Technique,
    ttl_seen: HashSet<u16>,
    summary: BatchSummary,
}

impl Batch<'_> {
    fn record(&mut self, done: PortOutcome) -> Result<()> {
        let port_id = self.store.upsert_port(done.port, TCP)?;
        if self.technique == Technique::Syn
            && done.outcome.is_syn_ack()
            && self.ttl_seen.insert(done.port)
        {
            os::record_ttl_guess(self.store, self.host_id, done.outcome.ttl())?;
        }
        let classification = classify(self.technique, &done.outcome);
        match &classification {
            Some(c) => self.store.upsert_host_port(&HostPortWrite {
                host_id: self.host_id,
                port_id,
                status: c.status,
                reason: &c.reason,
                service_id: None,
                banner: None,
            })?,
            None => debug!("{} {}: response ignored", self.technique, done.port),
        }
        self.summary.results.push(PortResult {
            port: done.port,
            classification,
            transport_error: done.transport_error,
            expired: false,
        });
        Ok(())
    }

    fn record_expired(&mut self, port: u16) -> Result<()> {
        self.record(PortOutcome { port, outcome: ProbeOutcome::NoResponse, transport_error: false })?;
        if let Some(last) = self.summary.results.last_mut() {
            last.expired = true;
        }
        Ok(())
    }
}

/// SYN scan over a set of ports.
pub async fn syn_scan<I>(
    transport: Arc<dyn PacketTransport>,
    store: &dyn ResultStore,
    target: Ipv4Addr,
    ports: I,
    opts: &ScanOptions,
) -> Result<BatchSummary>
where
    I: IntoIterator<Item = u16>,
{
    scan_ports(transport, store, target, ports, Technique::Syn, opts).await
}

/// Probe a single port with `technique`.
pub async fn scan_port(
    transport: Arc<dyn PacketTransport>,
    store: &dyn ResultStore,
    target: Ipv4Addr,
    port: u16,
    technique: Technique,
    opts: &ScanOptions,
) -> Result<Option<Classification>> {
    let summary = scan_ports(transport, store, target, [port], technique, opts).await?;
    Ok(summary.results.into_iter().next().and_then(|r| r.classification))
}

pub async fn null_scan(
    transport: Arc<dyn PacketTransport>,
    store: &dyn ResultStore,
    target: Ipv4Addr,
    port: u16,
    opts: &ScanOptions,
) -> Result<Option<Classification>> {
    scan_port(transport, store, target, port, Technique::Null, opts).await
}

pub async fn fin_scan(
    transport: Arc<dyn PacketTransport>,
    store: &dyn ResultStore,
    target: Ipv4Addr,
    port: u16,
    opts: &ScanOptions,
) -> Result<Option<Classification>> {
    scan_port(transport, store, target, port, Technique::Fin, opts).await
}

pub async fn xmas_scan(
    transport: Arc<dyn PacketTransport>,
    store: &dyn ResultStore,
    target: Ipv4Addr,
    port: u16,
    opts: &ScanOptions,
) -> Result<Option<Classification>> {
    scan_port(transport, store, target, port, Technique::Xmas, opts).await
}

pub async fn ack_scan(
    transport: Arc<dyn PacketTransport>,
    store: &dyn ResultStore,
    target: Ipv4Addr,
    port: u16,
    opts: &ScanOptions,
) -> Result<Option<Classification>> {
    scan_port(transport, store, target, port, Technique::Ack, opts).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::mock::ScriptedTransport;
    use recon_core::tcp_flags::*;
    use recon_core::{OsGuess, OsGuessRow, PortId, PortRecord, PortSummary, ServiceId, TcpReply};
    use results_sqlite::Db;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TARGET: Ipv4Addr = Ipv4Addr::new(10, 9, 8, 7);

    fn status_of(db: &Db, port: u16) -> Option<(PortStatus, String)> {
        db.port_record("10.9.8.7", port).unwrap().map(|r| (r.status, r.reason))
    }

    fn syn_ack(ttl: u8, ack: u32) -> ProbeOutcome {
        ProbeOutcome::TcpReply(TcpReply { flags: SYN_ACK, ttl, seq: 500, ack, payload: Vec::new() })
    }

    #[tokio::test]
    async fn syn_batch_classifies_every_response_shape() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .reply(22, SYN, syn_ack(64, 4242))
                .reply(23, SYN, ProbeOutcome::tcp(RST, 64))
                .reply(24, SYN, ProbeOutcome::tcp(RST_ACK, 64))
                .reply(26, SYN, ProbeOutcome::IcmpReply { icmp_type: 3, code: 10, ttl: 250 })
                .reply(27, SYN, ProbeOutcome::IcmpReply { icmp_type: 3, code: 0, ttl: 250 })
                .fail(28),
        );
        let db = Db::open_in_memory().unwrap();
        let summary = syn_scan(transport.clone(), &db, TARGET, 22..=28, &ScanOptions::default())
            .await
            .unwrap();

        assert_eq!(summary.results.len(), 7);
        assert_eq!(status_of(&db, 22), Some((PortStatus::Open, "tcp-syn-ack".into())));
        assert_eq!(status_of(&db, 23), Some((PortStatus::Closed, "tcp-reset".into())));
        assert_eq!(status_of(&db, 24), Some((PortStatus::Closed, "tcp-rst".into())));
        assert_eq!(status_of(&db, 25), Some((PortStatus::Filtered, "no-response".into())));
        assert_eq!(status_of(&db, 26), Some((PortStatus::Filtered, "icmp-unreachable".into())));
        assert_eq!(status_of(&db, 27), None);
        assert_eq!(status_of(&db, 28), Some((PortStatus::Filtered, "no-response".into())));
        assert_eq!(summary.transport_errors(), 1);
        assert_eq!(summary.ignored(), 1);

        let resets = transport.sent_with_flags(RST);
        assert_eq!(resets.len(), 1);
        assert_eq!(resets[0].dst_port, 22);
        assert_eq!(resets[0].seq, 4242);

        let guesses = db.os_guesses("10.9.8.7").unwrap();
        assert_eq!(guesses.len(), 1);
        assert_eq!(guesses[0].os_name, "Linux/Unix");
        assert_eq!(guesses[0].notes, "Observed TTL: 64");
    }

    #[tokio::test]
    async fn completions_are_matched_to_their_own_port() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .reply(1000, SYN, syn_ack(128, 1))
                .delay(1000, Duration::from_millis(150))
                .reply(1001, SYN, ProbeOutcome::tcp(RST, 128)),
        );
        let db = Db::open_in_memory().unwrap();
        let summary = syn_scan(transport, &db, TARGET, [1000, 1001], &ScanOptions::default())
            .await
            .unwrap();

        let order: Vec<u16> = summary.results.iter().map(|r| r.port).collect();
        assert_eq!(order, vec![1001, 1000]);
        assert_eq!(status_of(&db, 1000).unwrap().0, PortStatus::Open);
        assert_eq!(status_of(&db, 1001).unwrap().0, PortStatus::Closed);
    }

    #[tokio::test]
    async fn deadline_turns_stragglers_into_timeouts() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .reply(80, SYN, syn_ack(64, 1))
                .delay(80, Duration::from_secs(30))
                .reply(81, SYN, ProbeOutcome::tcp(RST, 64)),
        );
        let db = Db::open_in_memory().unwrap();
        let opts = ScanOptions { deadline: Some(Duration::from_millis(100)), ..ScanOptions::default() };
        let summary = syn_scan(transport, &db, TARGET, [80, 81], &opts).await.unwrap();

        assert_eq!(summary.expired(), 1);
        assert_eq!(status_of(&db, 80), Some((PortStatus::Filtered, "no-response".into())));
        assert_eq!(status_of(&db, 81).unwrap().0, PortStatus::Closed);
    }

    #[tokio::test]
    async fn concurrency_of_one_still_finishes_the_batch() {
        let transport = Arc::new(ScriptedTransport::new());
        let db = Db::open_in_memory().unwrap();
        let opts = ScanOptions { concurrency: 1, ..ScanOptions::default() };
        let summary = syn_scan(transport.clone(), &db, TARGET, 1..=40, &opts).await.unwrap();
        assert_eq!(summary.count(PortStatus::Filtered), 40);
        assert_eq!(transport.sent().len(), 40);
    }

    /// Counts OS-guess writes on the way to a real store.
    struct CountingStore {
        inner: Db,
        os_writes: AtomicUsize,
        broken: bool,
    }

    impl ResultStore for CountingStore {
        fn upsert_host(&self, a: &str, h: Option<&str>) -> Result<HostId> {
            self.inner.upsert_host(a, h)
        }
        fn upsert_port(&self, n: u16, p: &str) -> Result<PortId> {
            self.inner.upsert_port(n, p)
        }
        fn upsert_service(&self, n: &str, v: Option<&str>) -> Result<ServiceId> {
            self.inner.upsert_service(n, v)
        }
        fn upsert_host_port(&self, w: &HostPortWrite<'_>) -> Result<()> {
            if self.broken {
                anyhow::bail!("disk full");
            }
            self.inner.upsert_host_port(w)
        }
        fn upsert_os_guess(&self, h: HostId, g: &OsGuess) -> Result<bool> {
            self.os_writes.fetch_add(1, Ordering::SeqCst);
            self.inner.upsert_os_guess(h, g)
        }
        fn query_ports(&self, a: &str) -> Result<Vec<PortSummary>> {
            self.inner.query_ports(a)
        }
        fn port_record(&self, a: &str, p: u16) -> Result<Option<PortRecord>> {
            self.inner.port_record(a, p)
        }
        fn os_guesses(&self, a: &str) -> Result<Vec<OsGuessRow>> {
            self.inner.os_guesses(a)
        }
        fn report(&self, a: &str) -> Result<String> {
            self.inner.report(a)
        }
        fn clear(&self) -> Result<()> {
            self.inner.clear()
        }
    }

    #[tokio::test]
    async fn one_ttl_guess_per_port_even_when_listed_twice() {
        let transport = Arc::new(
            ScriptedTransport::new().reply(443, SYN, syn_ack(120, 9)).reply(8443, SYN, syn_ack(120, 9)),
        );
        let store = CountingStore { inner: Db::open_in_memory().unwrap(), os_writes: AtomicUsize::new(0), broken: false };
        syn_scan(transport, &store, TARGET, [443, 443, 8443], &ScanOptions::default()).await.unwrap();

        assert_eq!(store.os_writes.load(Ordering::SeqCst), 2);
        let guesses = store.inner.os_guesses("10.9.8.7").unwrap();
        assert_eq!(guesses.len(), 1);
        assert_eq!(guesses[0].os_name, "Windows");
    }

    #[tokio::test]
    async fn single_port_techniques_overwrite_the_record() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .reply(8080, 0, ProbeOutcome::tcp(RST, 64))
                .reply(8080, ACK, ProbeOutcome::tcp(RST, 64)),
        );
        let db = Db::open_in_memory().unwrap();
        let opts = ScanOptions::default();
        let t: Arc<dyn PacketTransport> = transport;

        let c = null_scan(t.clone(), &db, TARGET, 8080, &opts).await.unwrap().unwrap();
        assert_eq!((c.status, c.reason.as_str()), (PortStatus::Closed, "null-scan-tcp-reset"));
        xmas_scan(t.clone(), &db, TARGET, 8080, &opts).await.unwrap();
        assert_eq!(status_of(&db, 8080), Some((PortStatus::OpenFiltered, "xmas-scan-no-response".into())));
        fin_scan(t.clone(), &db, TARGET, 8080, &opts).await.unwrap();
        ack_scan(t, &db, TARGET, 8080, &opts).await.unwrap();
        assert_eq!(status_of(&db, 8080), Some((PortStatus::NotFiltered, "ack-scan-tcp-reset".into())));
    }

    #[tokio::test]
    async fn store_failure_stops_the_remaining_workers() {
        let mut transport = ScriptedTransport::new();
        for port in 1..=10 {
            transport = transport.delay(port, Duration::from_millis(50));
        }
        let transport = Arc::new(transport);
        let store = CountingStore { inner: Db::open_in_memory().unwrap(), os_writes: AtomicUsize::new(0), broken: true };
        let opts = ScanOptions { concurrency: 1, ..ScanOptions::default() };

        assert!(syn_scan(transport.clone(), &store, TARGET, 1..=10, &opts).await.is_err());
        let sent_at_failure = transport.sent().len();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(transport.sent().len(), sent_at_failure);
        assert!(sent_at_failure <= 2);
    }
}
