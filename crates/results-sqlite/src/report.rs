use crate::Db;
use anyhow::Result;
use std::fmt::Write;

impl Db {
    /// Text summary for one address: its open and filtered ports, then any OS guesses.
    pub fn report(&self, address: &str) -> Result<String> {
        type Row = (i64, String, String, String, Option<String>, Option<String>, Option<Vec<u8>>);
        let rows: Vec<Row> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.port, p.protocol, hp.status, hp.reason, s.name, s.version, hp.banner
                 FROM host_ports hp
                 JOIN hosts h ON hp.host_id = h.id
                 JOIN ports p ON hp.port_id = p.id
                 LEFT JOIN services s ON hp.service_id = s.id
                 WHERE h.address = ? AND hp.status IN ('open', 'filtered')
                 ORDER BY p.port",
            )?;
            let rows = stmt
                .query_map([address], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?, r.get(6)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;

        let mut out = String::new();
        writeln!(out, "Scan Report for [{}]", address)?;
        writeln!(out, "PORT\tSTATE\t(REASON)\tSERVICE")?;
        for (port, protocol, status, reason, name, version, banner) in rows {
            let service = match (name, version) {
                (Some(n), Some(v)) => format!("{} {}", n, v),
                (Some(n), None) => n,
                (None, _) => "Unknown Service".to_string(),
            };
            write!(out, "{}/{} - {} ({}) - {}", port, protocol, status, reason, service)?;
            if let Some(b) = banner.filter(|b| !b.is_empty()) {
                write!(out, " | Banner: {}", String::from_utf8_lossy(&b).trim_end())?;
            }
            out.push('\n');
        }

        let guesses = self.os_guesses(address)?;
        if !guesses.is_empty() {
            out.push_str("\nOS Guesses:\n");
            for g in guesses {
                writeln!(
                    out,
                    "- OS: {}, Method: {}, Confidence: {}, Notes: {}",
                    g.os_name, g.method, g.confidence, g.notes
                )?;
            }
        }
        Ok(out)
    }
}
