//! Scripted collaborators for exercising the engine without raw sockets.

use crate::model::{ProbeOutcome, TcpProbe};
use crate::net::{HttpHeaders, HttpProbe, PacketTransport};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Answers each probe from a table keyed by destination port and probe flags.
/// Anything not scripted goes unanswered.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: HashMap<(u16, u8), ProbeOutcome>,
    delays: HashMap<u16, Duration>,
    failing: HashSet<u16>,
    sent: Mutex<Vec<TcpProbe>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, port: u16, flags: u8, outcome: ProbeOutcome) -> Self {
        self.replies.insert((port, flags), outcome);
        self
    }

    /// Hold answers for `port` back by `delay`.
    pub fn delay(mut self, port: u16, delay: Duration) -> Self {
        self.delays.insert(port, delay);
        self
    }

    /// Make every exchange with `port` fail at the transport level.
    pub fn fail(mut self, port: u16) -> Self {
        self.failing.insert(port);
        self
    }

    /// Every packet handed to the transport, in submission order.
    pub fn sent(&self) -> Vec<TcpProbe> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn sent_with_flags(&self, flags: u8) -> Vec<TcpProbe> {
        self.sent().into_iter().filter(|p| p.flags == flags).collect()
    }

    fn record(&self, probe: &TcpProbe) {
        if let Ok(mut s) = self.sent.lock() {
            s.push(*probe);
        }
    }
}

#[async_trait]
impl PacketTransport for ScriptedTransport {
    async fn send_and_wait(
        &self,
        probe: &TcpProbe,
        _timeout: Duration,
        _retries: u32,
    ) -> Result<ProbeOutcome> {
        self.record(probe);
        if let Some(d) = self.delays.get(&probe.dst_port) {
            tokio::time::sleep(*d).await;
        }
        if self.failing.contains(&probe.dst_port) {
            return Err(anyhow!("scripted failure on port {}", probe.dst_port));
        }
        Ok(self
            .replies
            .get(&(probe.dst_port, probe.flags))
            .cloned()
            .unwrap_or(ProbeOutcome::NoResponse))
    }

    async fn send(&self, probe: &TcpProbe) -> Result<()> {
        self.record(probe);
        Ok(())
    }
}

/// Serves fixed headers per URL; unknown URLs fail like a refused connection.
#[derive(Default)]
pub struct StaticHttp {
    pages: HashMap<String, HttpHeaders>,
    requested: Mutex<Vec<String>>,
}

impl StaticHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(mut self, url: &str, headers: &[(&str, &str)]) -> Self {
        let headers = headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        self.pages.insert(url.to_string(), headers);
        self
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl HttpProbe for StaticHttp {
    async fn get(&self, url: &str, _timeout: Duration) -> Result<HttpHeaders> {
        if let Ok(mut r) = self.requested.lock() {
            r.push(url.to_string());
        }
        self.pages.get(url).cloned().ok_or_else(|| anyhow!("connection refused: {url}"))
    }
}
