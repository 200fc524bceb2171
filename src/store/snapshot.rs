//! Durable per-cycle snapshots keyed by a monotonically increasing batch id.
//!
//! Each `record_*` call runs in its own transaction with one cached upsert
//! statement: either every row of the call lands or none does. Process and
//! container rows are independent transactions.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;

use crate::core::errors::{CwError, Result};
use crate::monitor::telemetry::{ContainerRecord, ProcessRecord};
use crate::store::schema;

/// One row of `cwarden store batches`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub id: i64,
    pub ts_utc: String,
    pub processes: u64,
    pub containers: u64,
}

/// Snapshot database handle. Opened once and owned by the daemon.
pub struct SnapshotStore {
    conn: Connection,
    path: PathBuf,
}

impl SnapshotStore {
    /// Open an existing database and validate its schema.
    ///
    /// Never creates the file or any table: a missing table is
    /// [`CwError::MissingSchema`].
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| CwError::Store {
            context: "open",
            details: format!("{}: {err}", path.display()),
        })?;
        apply_pragmas(&conn)?;
        if let Some(table) = schema::missing_tables(&conn)?.first() {
            return Err(CwError::MissingSchema {
                table: (*table).to_string(),
            });
        }
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Create the database (and parent directory) and apply the canonical schema.
    pub fn initialize(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| CwError::io(parent, source))?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        apply_pragmas(&conn)?;
        schema::apply_schema(&conn)?;
        drop(conn);
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ──────────────────── batches ────────────────────

    /// Insert a batch stamped with the current UTC time.
    pub fn create_batch(&self) -> Result<i64> {
        self.create_batch_at(Utc::now())
    }

    pub fn create_batch_at(&self, ts: DateTime<Utc>) -> Result<i64> {
        let stamp = ts.to_rfc3339_opts(SecondsFormat::Secs, true);
        self.conn
            .prepare_cached("INSERT INTO batches (ts_utc) VALUES (?1)")
            .and_then(|mut stmt| stmt.execute(params![stamp]))
            .map_err(|err| store_error("create batch", &err))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Newest batches first, with per-table row counts.
    pub fn recent_batches(&self, limit: u32) -> Result<Vec<BatchSummary>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT b.id, b.ts_utc,
                    (SELECT COUNT(*) FROM process_snapshots p WHERE p.batch_id = b.id),
                    (SELECT COUNT(*) FROM container_snapshots c WHERE c.batch_id = b.id)
             FROM batches b ORDER BY b.id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(BatchSummary {
                    id: row.get(0)?,
                    ts_utc: row.get(1)?,
                    processes: row.get(2)?,
                    containers: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ──────────────────── snapshots ────────────────────

    /// Upsert all process rows for `batch_id` in one transaction.
    pub fn record_processes(&mut self, batch_id: i64, processes: &[ProcessRecord]) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .map_err(|err| store_error("begin process snapshot", &err))?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO process_snapshots (
                    batch_id, pid, name, cmdline, vsz_kb, rss_kb,
                    memory_percent, cpu_percent, utime_ticks, stime_ticks
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            )?;
            for p in processes {
                stmt.execute(params![
                    batch_id,
                    p.pid,
                    p.name,
                    p.cmdline,
                    p.vsz_kb,
                    p.rss_kb,
                    p.memory_percent,
                    p.cpu_percent,
                    p.utime_ticks,
                    p.stime_ticks,
                ])
                .map_err(|err| store_error("insert process snapshot", &err))?;
            }
        }
        tx.commit()
            .map_err(|err| store_error("commit process snapshot", &err))?;
        Ok(processes.len())
    }

    /// Upsert all container rows for `batch_id` in one transaction.
    pub fn record_containers(
        &mut self,
        batch_id: i64,
        containers: &[ContainerRecord],
    ) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .map_err(|err| store_error("begin container snapshot", &err))?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO container_snapshots (
                    batch_id, container_id, cgroup_path, rss_kb, cpu_jiffies, procs
                ) VALUES (?1,?2,?3,?4,?5,?6)",
            )?;
            for c in containers {
                stmt.execute(params![
                    batch_id,
                    c.container_id,
                    c.cgroup_path,
                    c.rss_kb,
                    c.cpu_jiffies,
                    c.procs,
                ])
                .map_err(|err| store_error("insert container snapshot", &err))?;
            }
        }
        tx.commit()
            .map_err(|err| store_error("commit container snapshot", &err))?;
        Ok(containers.len())
    }

    /// Drop every snapshot and batch row and restart batch ids at 1.
    pub fn reset(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM process_snapshots;
             DELETE FROM container_snapshots;
             DELETE FROM batches;",
        )
        .map_err(|err| store_error("reset", &err))?;
        let has_sequence: i64 = tx.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'sqlite_sequence'",
            [],
            |row| row.get(0),
        )?;
        if has_sequence > 0 {
            tx.execute("DELETE FROM sqlite_sequence WHERE name = 'batches'", [])?;
        }
        tx.commit().map_err(|err| store_error("commit reset", &err))?;
        Ok(())
    }

    // ──────────────────── lookups ────────────────────

    pub fn process_row(&self, batch_id: i64, pid: i64) -> Result<Option<ProcessRecord>> {
        let row = self
            .conn
            .prepare_cached(
                "SELECT pid, name, cmdline, vsz_kb, rss_kb, memory_percent,
                        cpu_percent, utime_ticks, stime_ticks
                 FROM process_snapshots WHERE batch_id = ?1 AND pid = ?2",
            )?
            .query_row(params![batch_id, pid], |row| {
                Ok(ProcessRecord {
                    pid: row.get(0)?,
                    name: row.get(1)?,
                    cmdline: row.get(2)?,
                    vsz_kb: row.get(3)?,
                    rss_kb: row.get(4)?,
                    memory_percent: row.get(5)?,
                    cpu_percent: row.get(6)?,
                    utime_ticks: row.get(7)?,
                    stime_ticks: row.get(8)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn container_rows(&self, batch_id: i64) -> Result<Vec<ContainerRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT container_id, cgroup_path, rss_kb, cpu_jiffies, procs
             FROM container_snapshots WHERE batch_id = ?1 ORDER BY container_id",
        )?;
        let rows = stmt
            .query_map(params![batch_id], |row| {
                Ok(ContainerRecord {
                    container_id: row.get(0)?,
                    cgroup_path: row.get(1)?,
                    rss_kb: row.get(2)?,
                    cpu_jiffies: row.get(3)?,
                    procs: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn store_error(context: &'static str, err: &rusqlite::Error) -> CwError {
    CwError::Store {
        context,
        details: err.to_string(),
    }
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        eprintln!("[CW-STORE] WARNING: requested WAL mode but got '{mode}'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, SnapshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::initialize(&dir.path().join("snap.db")).unwrap();
        (dir, store)
    }

    fn process(pid: i64, name: &str, rss_kb: u64) -> ProcessRecord {
        ProcessRecord {
            pid,
            name: name.to_string(),
            cmdline: format!("/usr/bin/{name}"),
            rss_kb,
            ..ProcessRecord::default()
        }
    }

    fn container(id: &str) -> ContainerRecord {
        ContainerRecord {
            container_id: id.to_string(),
            cgroup_path: format!("/system.slice/docker-{id}.scope"),
            rss_kb: 2048,
            cpu_jiffies: 10,
            procs: 1,
        }
    }

    #[test]
    fn open_without_schema_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.db");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE batches (id INTEGER PRIMARY KEY, ts_utc TEXT);")
            .unwrap();
        match SnapshotStore::open(&path) {
            Err(CwError::MissingSchema { table }) => assert_eq!(table, "process_snapshots"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("store opened without schema"),
        }
    }

    #[test]
    fn open_never_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.db");
        assert!(SnapshotStore::open(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn batch_ids_increase() {
        let (_dir, store) = temp_store();
        let first = store.create_batch().unwrap();
        let second = store.create_batch().unwrap();
        assert_eq!(first, 1);
        assert!(second > first);
    }

    #[test]
    fn process_upsert_replaces_row() {
        let (_dir, mut store) = temp_store();
        let batch = store.create_batch().unwrap();
        store.record_processes(batch, &[process(42, "nginx", 100)]).unwrap();
        store.record_processes(batch, &[process(42, "nginx", 900)]).unwrap();

        let row = store.process_row(batch, 42).unwrap().expect("row");
        assert_eq!(row.rss_kb, 900);
        let summary = &store.recent_batches(5).unwrap()[0];
        assert_eq!(summary.processes, 1);
    }

    #[test]
    fn failing_row_rolls_back_whole_call() {
        let (_dir, mut store) = temp_store();
        let batch = store.create_batch().unwrap();
        let rows = [process(1, "init", 10), process(-5, "bogus", 10)];
        let err = store.record_processes(batch, &rows).expect_err("check constraint");
        assert_eq!(err.code(), "CW-2102");
        assert!(store.process_row(batch, 1).unwrap().is_none());
    }

    #[test]
    fn container_failure_does_not_touch_process_rows() {
        let (_dir, mut store) = temp_store();
        let batch = store.create_batch().unwrap();
        store.record_processes(batch, &[process(7, "dockerd", 1)]).unwrap();
        assert!(
            store
                .record_containers(batch, &[container("abc"), container("")])
                .is_err()
        );
        assert!(store.container_rows(batch).unwrap().is_empty());
        assert!(store.process_row(batch, 7).unwrap().is_some());
    }

    #[test]
    fn unknown_batch_is_rejected() {
        let (_dir, mut store) = temp_store();
        assert!(store.record_containers(99, &[container("abc")]).is_err());
    }

    #[test]
    fn reset_clears_rows_and_sequence() {
        let (_dir, mut store) = temp_store();
        for _ in 0..3 {
            let batch = store.create_batch().unwrap();
            store.record_containers(batch, &[container("abc")]).unwrap();
        }
        store.reset().unwrap();
        assert!(store.recent_batches(10).unwrap().is_empty());
        assert_eq!(store.create_batch().unwrap(), 1);
    }

    #[test]
    fn recent_batches_newest_first_with_counts() {
        let (_dir, mut store) = temp_store();
        let first = store.create_batch().unwrap();
        let second = store.create_batch().unwrap();
        store
            .record_containers(second, &[container("a"), container("b")])
            .unwrap();
        let batches = store.recent_batches(10).unwrap();
        assert_eq!(batches[0].id, second);
        assert_eq!(batches[0].containers, 2);
        assert_eq!(batches[1].id, first);
        assert_eq!(batches[1].containers, 0);
        assert_eq!(store.recent_batches(1).unwrap().len(), 1);
    }
}
