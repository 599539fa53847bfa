use crate::schema::MIG_0001_INIT;
use anyhow::{anyhow, Context, Result};
use log::debug;
use rusqlite::Connection;
use std::sync::Mutex;

/// Store handle. The connection sits behind a mutex so concurrent probe tasks
/// serialise their writes; each upsert runs in its own transaction.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open_or_create(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("opening result store {}", path.display()))?;
        apply_pragmas(&conn)?;
        migrate(&conn)?;
        Ok(Db { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", &"ON")?;
        migrate(&conn)?;
        Ok(Db { conn: Mutex::new(conn) })
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().map_err(|_| anyhow!("result store lock poisoned"))?;
        f(&mut guard)
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", &"WAL")?;
    conn.pragma_update(None, "synchronous", &"NORMAL")?;
    conn.pragma_update(None, "foreign_keys", &"ON")?;
    conn.pragma_update(None, "busy_timeout", &5000i64)?;
    Ok(())
}

fn migrate(conn: &Connection) -> Result<()> {
    // single migration: create everything when `hosts` is missing
    let exists: i64 = conn.query_row(
        "SELECT COUNT(1) FROM sqlite_master WHERE type='table' AND name='hosts'",
        [],
        |r| r.get(0),
    )?;
    if exists == 0 {
        debug!("creating result schema");
        conn.execute_batch(MIG_0001_INIT)?;
    }
    Ok(())
}
