//! Result store contract and the rows it exchanges.

use crate::model::PortStatus;
use anyhow::Result;
use serde::{Deserialize, Serialize};

pub type HostId = i64;
pub type PortId = i64;
pub type ServiceId = i64;

/// Full replacement of the record kept for one host/port pair.
#[derive(Debug, Clone)]
pub struct HostPortWrite<'a> {
    pub host_id: HostId,
    pub port_id: PortId,
    pub status: PortStatus,
    pub reason: &'a str,
    pub service_id: Option<ServiceId>,
    pub banner: Option<&'a [u8]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsGuess {
    pub os_name: String,
    pub method: String,
    pub confidence: Option<String>,
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSummary {
    pub port: u16,
    pub status: PortStatus,
    pub service_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRecord {
    pub port: u16,
    pub protocol: String,
    pub status: PortStatus,
    pub reason: String,
    pub service_name: Option<String>,
    pub service_version: Option<String>,
    pub banner: Option<Vec<u8>>,
    pub scan_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsGuessRow {
    pub os_name: String,
    pub method: String,
    pub confidence: String,
    pub notes: String,
}

/// Durable scan results. Every write is atomic per logical row and safe to call
/// from concurrent tasks.
pub trait ResultStore: Send + Sync {
    /// Host id for `address`, creating the host on first reference. A supplied
    /// hostname refreshes hostname and last-seen time.
    fn upsert_host(&self, address: &str, hostname: Option<&str>) -> Result<HostId>;
    fn upsert_port(&self, number: u16, protocol: &str) -> Result<PortId>;
    fn upsert_service(&self, name: &str, version: Option<&str>) -> Result<ServiceId>;
    /// Overwrites any earlier record for the same host/port pair.
    fn upsert_host_port(&self, write: &HostPortWrite<'_>) -> Result<()>;
    /// Appends a guess unless it repeats the host's most recent one.
    /// Returns whether a row was written.
    fn upsert_os_guess(&self, host_id: HostId, guess: &OsGuess) -> Result<bool>;

    fn query_ports(&self, address: &str) -> Result<Vec<PortSummary>>;
    fn port_record(&self, address: &str, port: u16) -> Result<Option<PortRecord>>;
    fn os_guesses(&self, address: &str) -> Result<Vec<OsGuessRow>>;
    /// Human-readable summary of the open and filtered ports of `address`.
    fn report(&self, address: &str) -> Result<String>;
    fn clear(&self) -> Result<()>;
}
