//! Network capabilities the engine consumes but does not implement itself.

use crate::model::{ProbeOutcome, TcpProbe};
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Raw packet send/receive.
#[async_trait]
pub trait PacketTransport: Send + Sync {
    /// Send `probe`, waiting up to `timeout` per transmission and resending up to
    /// `retries` times while unanswered. An unanswered probe is `Ok(NoResponse)`;
    /// `Err` is reserved for failures of the transport itself.
    async fn send_and_wait(
        &self,
        probe: &TcpProbe,
        timeout: Duration,
        retries: u32,
    ) -> Result<ProbeOutcome>;

    /// Fire-and-forget transmission.
    async fn send(&self, probe: &TcpProbe) -> Result<()>;
}

/// Response header name/value pairs in arrival order.
pub type HttpHeaders = Vec<(String, String)>;

#[async_trait]
pub trait HttpProbe: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpHeaders>;
}
