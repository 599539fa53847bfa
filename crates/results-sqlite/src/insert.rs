use crate::models::{now_rfc3339, UNKNOWN_CONFIDENCE};
use crate::{Db, HostId, HostPortWrite, OsGuess, PortId, ServiceId};
use anyhow::Result;
use log::info;
use rusqlite::{params, OptionalExtension};

impl Db {
    pub fn upsert_host(&self, address: &str, hostname: Option<&str>) -> Result<HostId> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO hosts(address,hostname,last_seen) VALUES (?,?,?)
                 ON CONFLICT(address) DO UPDATE SET hostname=excluded.hostname, last_seen=excluded.last_seen
                 WHERE excluded.hostname IS NOT NULL",
                params![address, hostname, now_rfc3339()],
            )?;
            let id: HostId =
                tx.query_row("SELECT id FROM hosts WHERE address=?", [address], |r| r.get(0))?;
            tx.commit()?;
            Ok(id)
        })
    }

    pub fn upsert_port(&self, number: u16, protocol: &str) -> Result<PortId> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO ports(port,protocol) VALUES (?,?) ON CONFLICT(port,protocol) DO NOTHING",
                params![number as i64, protocol],
            )?;
            let id: PortId = tx.query_row(
                "SELECT id FROM ports WHERE port=? AND protocol=?",
                params![number as i64, protocol],
                |r| r.get(0),
            )?;
            tx.commit()?;
            Ok(id)
        })
    }

    /// `version` takes part in identity: the same name with another version is
    /// another service row.
    pub fn upsert_service(&self, name: &str, version: Option<&str>) -> Result<ServiceId> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO services(name,version) VALUES (?,?) ON CONFLICT DO NOTHING",
                params![name, version],
            )?;
            let id: ServiceId = tx.query_row(
                "SELECT id FROM services WHERE name=? AND version IS ?",
                params![name, version],
                |r| r.get(0),
            )?;
            tx.commit()?;
            Ok(id)
        })
    }

    pub fn upsert_host_port(&self, w: &HostPortWrite<'_>) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO host_ports(host_id,port_id,status,reason,service_id,banner,scan_time) VALUES (?,?,?,?,?,?,?)
                 ON CONFLICT(host_id,port_id) DO UPDATE SET status=excluded.status, reason=excluded.reason, service_id=excluded.service_id, banner=excluded.banner, scan_time=excluded.scan_time",
                params![w.host_id, w.port_id, w.status.as_str(), w.reason, w.service_id, w.banner, now_rfc3339()],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Most recent means highest row id for the host.
    pub fn upsert_os_guess(&self, host_id: HostId, guess: &OsGuess) -> Result<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let latest: Option<(String, String)> = tx
                .query_row(
                    "SELECT os_name, method FROM os_guesses WHERE host_id=? ORDER BY id DESC LIMIT 1",
                    [host_id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            if let Some((os_name, method)) = latest {
                if os_name == guess.os_name && method == guess.method {
                    return Ok(false);
                }
            }
            tx.execute(
                "INSERT INTO os_guesses(host_id,os_name,method,confidence,notes) VALUES (?,?,?,?,?)",
                params![
                    host_id,
                    guess.os_name,
                    guess.method,
                    guess.confidence.as_deref().unwrap_or(UNKNOWN_CONFIDENCE),
                    guess.notes
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    /// Empty every table, dependents first.
    pub fn clear(&self) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute_batch(
                "DELETE FROM host_ports; DELETE FROM os_guesses; DELETE FROM services; DELETE FROM ports; DELETE FROM hosts;",
            )?;
            tx.commit()?;
            info!("result store cleared");
            Ok(())
        })
    }
}
