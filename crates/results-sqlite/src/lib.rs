//! SQLite-backed result store.

mod open;
mod models;
mod insert;
mod query;
mod report;
mod schema;

pub use open::Db;
pub use models::*;

use anyhow::Result;
use recon_core::ResultStore;

impl ResultStore for Db {
    fn upsert_host(&self, address: &str, hostname: Option<&str>) -> Result<HostId> {
        Db::upsert_host(self, address, hostname)
    }

    fn upsert_port(&self, number: u16, protocol: &str) -> Result<PortId> {
        Db::upsert_port(self, number, protocol)
    }

    fn upsert_service(&self, name: &str, version: Option<&str>) -> Result<ServiceId> {
        Db::upsert_service(self, name, version)
    }

    fn upsert_host_port(&self, write: &HostPortWrite<'_>) -> Result<()> {
        Db::upsert_host_port(self, write)
    }

    fn upsert_os_guess(&self, host_id: HostId, guess: &OsGuess) -> Result<bool> {
        Db::upsert_os_guess(self, host_id, guess)
    }

    fn query_ports(&self, address: &str) -> Result<Vec<PortSummary>> {
        Db::query_ports(self, address)
    }

    fn port_record(&self, address: &str, port: u16) -> Result<Option<PortRecord>> {
        Db::port_record(self, address, port)
    }

    fn os_guesses(&self, address: &str) -> Result<Vec<OsGuessRow>> {
        Db::os_guesses(self, address)
    }

    fn report(&self, address: &str) -> Result<String> {
        Db::report(self, address)
    }

    fn clear(&self) -> Result<()> {
        Db::clear(self)
    }
}
