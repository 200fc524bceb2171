//! Daemon state file for `cwarden status`.
//!
//! `state.json` is rewritten after every cycle and on each phase transition.
//! Writes go to `state.json.tmp` first and are renamed into place, so a reader
//! never sees a half-written document.

#![allow(missing_docs)]

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{CwError, Result};

/// Lifecycle phase of the daemon loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonPhase {
    #[default]
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for DaemonPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        })
    }
}

/// Unknown fields are ignored and missing ones default, so an older CLI can
/// read a newer daemon's file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonState {
    pub version: String,
    pub pid: u32,
    pub phase: DaemonPhase,
    pub started_at: String,
    pub last_updated: String,
    pub last_batch_id: Option<i64>,
    pub counters: Counters,
    pub last_error: Option<String>,
    pub memory_rss_bytes: u64,
}

/// Cumulative since daemon start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Counters {
    pub cycles_ok: u64,
    pub cycles_failed: u64,
    pub evictions: u64,
    pub eviction_failures: u64,
    /// Evictions decided while `dry_run` was set; nothing was stopped.
    pub would_evict: u64,
    pub stopped_cleanups: u64,
    pub dropped_log_events: u64,
}

/// Owns the in-memory state and its file.
pub struct StateFile {
    path: PathBuf,
    state: DaemonState,
}

impl StateFile {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        let now = utc_now();
        Self {
            path,
            state: DaemonState {
                version: env!("CARGO_PKG_VERSION").to_string(),
                pid: std::process::id(),
                started_at: now.clone(),
                last_updated: now,
                ..DaemonState::default()
            },
        }
    }

    #[must_use]
    pub const fn state(&self) -> &DaemonState {
        &self.state
    }

    pub fn set_phase(&mut self, phase: DaemonPhase) {
        self.state.phase = phase;
        self.flush();
    }

    pub fn record_cycle_ok(&mut self, batch_id: i64) {
        self.state.counters.cycles_ok += 1;
        self.state.last_batch_id = Some(batch_id);
    }

    pub fn record_cycle_failed(&mut self, err: &CwError) {
        self.state.counters.cycles_failed += 1;
        self.state.last_error = Some(err.to_string());
    }

    pub fn record_error(&mut self, err: &CwError) {
        self.state.last_error = Some(err.to_string());
    }

    pub fn record_evictions(&mut self, ok: u64, failed: u64) {
        self.state.counters.evictions += ok;
        self.state.counters.eviction_failures += failed;
    }

    pub fn record_would_evict(&mut self, count: u64) {
        self.state.counters.would_evict += count;
    }

    pub fn record_stopped_cleanups(&mut self, count: u64) {
        self.state.counters.stopped_cleanups += count;
    }

    pub fn set_dropped_log_events(&mut self, dropped: u64) {
        self.state.counters.dropped_log_events = dropped;
    }

    /// Refresh timestamps and persist. Failures are reported, never fatal.
    pub fn flush(&mut self) {
        self.state.last_updated = utc_now();
        self.state.memory_rss_bytes = read_rss_bytes();
        if let Err(err) = write_state_atomic(&self.path, &self.state) {
            eprintln!(
                "[CW-STATE] failed to write {}: {err}",
                self.path.display()
            );
        }
    }
}

/// Read a state file written by a running (or crashed) daemon.
pub fn read_state(path: &Path) -> Result<DaemonState> {
    let raw = fs::read_to_string(path).map_err(|source| CwError::io(path, source))?;
    serde_json::from_str(&raw).map_err(|err| CwError::Parse {
        context: "state file",
        details: err.to_string(),
    })
}

fn utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn write_state_atomic(path: &Path, state: &DaemonState) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| CwError::io(parent, source))?;
    }
    let json = serde_json::to_vec_pretty(state)?;
    let tmp_path = path.with_extension("json.tmp");

    let written = (|| -> std::io::Result<()> {
        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            opts.mode(0o644);
        }
        let mut file = opts.open(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    written.map_err(|source| {
        let _ = fs::remove_file(&tmp_path);
        CwError::io(path, source)
    })
}

/// Resident set size of this process; 0 when unavailable.
fn read_rss_bytes() -> u64 {
    fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok())
        })
        .map_or(0, |kb| kb * 1024)
}
