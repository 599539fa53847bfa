use crate::{Db, OsGuessRow, PortRecord, PortSummary};
use anyhow::{Context, Result};
use recon_core::PortStatus;
use rusqlite::{params, OptionalExtension};

impl Db {
    /// Every port recorded for `address`, ascending.
    pub fn query_ports(&self, address: &str) -> Result<Vec<PortSummary>> {
        let rows: Vec<(i64, String, Option<String>)> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.port, hp.status, s.name
                 FROM host_ports hp
                 JOIN hosts h ON hp.host_id = h.id
                 JOIN ports p ON hp.port_id = p.id
                 LEFT JOIN services s ON hp.service_id = s.id
                 WHERE h.address = ?
                 ORDER BY p.port",
            )?;
            let rows = stmt
                .query_map([address], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        rows.into_iter()
            .map(|(port, status, service_name)| -> Result<PortSummary> {
                Ok(PortSummary { port: port as u16, status: parse_status(&status)?, service_name })
            })
            .collect()
    }

    pub fn port_record(&self, address: &str, port: u16) -> Result<Option<PortRecord>> {
        type Raw = (String, String, String, Option<String>, Option<String>, Option<Vec<u8>>, String);
        let raw: Option<Raw> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT p.protocol, hp.status, hp.reason, s.name, s.version, hp.banner, hp.scan_time
                     FROM host_ports hp
                     JOIN hosts h ON hp.host_id = h.id
                     JOIN ports p ON hp.port_id = p.id
                     LEFT JOIN services s ON hp.service_id = s.id
                     WHERE h.address = ? AND p.port = ?",
                    params![address, port as i64],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?)),
                )
                .optional()?)
        })?;
        raw.map(|(protocol, status, reason, service_name, service_version, banner, scan_time)| -> Result<PortRecord> {
            Ok(PortRecord {
                port,
                protocol,
                status: parse_status(&status)?,
                reason,
                service_name,
                service_version,
                banner,
                scan_time,
            })
        })
        .transpose()
    }

    /// Guesses for `address` in insertion order.
    pub fn os_guesses(&self, address: &str) -> Result<Vec<OsGuessRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT g.os_name, g.method, g.confidence, g.notes
                 FROM os_guesses g
                 JOIN hosts h ON g.host_id = h.id
                 WHERE h.address = ?
                 ORDER BY g.id",
            )?;
            let rows = stmt
                .query_map([address], |r| {
                    Ok(OsGuessRow {
                        os_name: r.get(0)?,
                        method: r.get(1)?,
                        confidence: r.get(2)?,
                        notes: r.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

fn parse_status(s: &str) -> Result<PortStatus> {
    s.parse::<PortStatus>().context("corrupt host_ports row")
}
