//! Canonical DDL for the snapshot database.
//!
//! Applied only by `cwarden store init` and tests. The daemon validates that
//! these tables exist and refuses to start otherwise.

use rusqlite::Connection;

use crate::core::errors::Result;

/// Tables the daemon requires at startup.
pub const REQUIRED_TABLES: [&str; 3] = ["batches", "process_snapshots", "container_snapshots"];

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS batches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_utc TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS process_snapshots (
    batch_id INTEGER NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
    pid INTEGER NOT NULL CHECK (pid >= 0),
    name TEXT NOT NULL,
    cmdline TEXT NOT NULL,
    vsz_kb INTEGER NOT NULL,
    rss_kb INTEGER NOT NULL,
    memory_percent REAL NOT NULL,
    cpu_percent REAL NOT NULL,
    utime_ticks INTEGER NOT NULL,
    stime_ticks INTEGER NOT NULL,
    PRIMARY KEY (batch_id, pid)
);

CREATE TABLE IF NOT EXISTS container_snapshots (
    batch_id INTEGER NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
    container_id TEXT NOT NULL CHECK (length(container_id) > 0),
    cgroup_path TEXT NOT NULL,
    rss_kb INTEGER NOT NULL,
    cpu_jiffies INTEGER NOT NULL,
    procs INTEGER NOT NULL,
    PRIMARY KEY (batch_id, container_id)
);

CREATE INDEX IF NOT EXISTS idx_batches_ts ON batches(ts_utc);
";

/// Create any missing tables. Idempotent.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Names from [`REQUIRED_TABLES`] that do not exist in `conn`.
pub fn missing_tables(conn: &Connection) -> Result<Vec<&'static str>> {
    let mut stmt =
        conn.prepare_cached("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
    let mut missing = Vec::new();
    for table in REQUIRED_TABLES {
        let count: i64 = stmt.query_row([table], |row| row.get(0))?;
        if count == 0 {
            missing.push(table);
        }
    }
    Ok(missing)
}
