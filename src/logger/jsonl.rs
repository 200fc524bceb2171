//! Append-only JSONL activity log.
//!
//! One self-contained JSON object per line, written with a single `write_all`
//! on an `O_APPEND` descriptor so a concurrent `tail -f` never sees a torn
//! line. When the file grows past `max_size_bytes` it is rotated to
//! `activity.jsonl.1`, `.2`, ... keeping `max_rotated_files` generations.
//!
//! The writer degrades instead of failing: file → stderr (`[CW-JSONL]`
//! prefix) → discard. The daemon never stops because logging broke.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{CwError, Result};
use crate::monitor::host::HostSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Activity record kinds, serialized as snake_case `event` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    DaemonStart,
    DaemonStop,
    ModuleLoad,
    ModuleUnload,
    ScheduleInstall,
    ScheduleRemove,
    BatchRecorded,
    HostSummary,
    CycleFailed,
    ContainerEvicted,
    EvictionFailed,
    StoppedCleanup,
    Error,
}

/// One JSONL line. Only `ts`, `event` and `severity` are always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub ts: String,
    pub event: EventKind,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ActivityRecord {
    /// Record stamped with the current UTC time in millisecond precision.
    #[must_use]
    pub fn now(event: EventKind, severity: Severity) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            event,
            severity,
            container_id: None,
            image: None,
            category: None,
            score: None,
            module: None,
            path: None,
            batch_id: None,
            processes: None,
            containers: None,
            host: None,
            ok: None,
            error_code: None,
            error_message: None,
            details: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JsonlConfig {
    pub path: PathBuf,
    /// Rotate once the live file would exceed this size. Default 16 MiB.
    pub max_size_bytes: u64,
    /// Rotated generations kept next to the live file. Default 3.
    pub max_rotated_files: u32,
}

impl JsonlConfig {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_size_bytes: 16 * 1024 * 1024,
            max_rotated_files: 3,
        }
    }
}

enum Sink {
    File { file: File, size: u64 },
    Stderr,
    Discard,
}

/// JSONL writer with size rotation and file → stderr → discard degradation.
pub struct JsonlWriter {
    config: JsonlConfig,
    sink: Sink,
}

impl JsonlWriter {
    /// Open (creating parent directories). Falls to stderr when the file cannot be opened.
    #[must_use]
    pub fn open(config: JsonlConfig) -> Self {
        let sink = match open_append(&config.path) {
            Ok((file, size)) => Sink::File { file, size },
            Err(err) => {
                eprintln!("[CW-JSONL] cannot open activity log, writing to stderr: {err}");
                Sink::Stderr
            }
        };
        Self { config, sink }
    }

    pub fn write(&mut self, record: &ActivityRecord) {
        match serde_json::to_string(record) {
            Ok(json) => self.write_line(&format!("{json}\n")),
            Err(err) => eprintln!("[CW-JSONL] serialize error: {err}"),
        }
    }

    /// `file`, `stderr` or `discard`.
    #[must_use]
    pub const fn sink_name(&self) -> &'static str {
        match self.sink {
            Sink::File { .. } => "file",
            Sink::Stderr => "stderr",
            Sink::Discard => "discard",
        }
    }

    pub fn sync(&mut self) {
        if let Sink::File { file, .. } = &mut self.sink {
            let _ = file.sync_data();
        }
    }

    fn write_line(&mut self, line: &str) {
        let len = line.len() as u64;
        if let Sink::File { size, .. } = &self.sink {
            if *size > 0 && size + len > self.config.max_size_bytes {
                self.rotate();
            }
        }
        match &mut self.sink {
            Sink::File { file, size } => {
                if file.write_all(line.as_bytes()).is_ok() {
                    *size += len;
                } else {
                    eprintln!("[CW-JSONL] write failed, degrading to stderr");
                    self.sink = Sink::Stderr;
                    self.write_line(line);
                }
            }
            Sink::Stderr => {
                if write!(io::stderr(), "[CW-JSONL] {line}").is_err() {
                    self.sink = Sink::Discard;
                }
            }
            Sink::Discard => {}
        }
    }

    fn rotate(&mut self) {
        self.sink = Sink::Discard;
        let base = &self.config.path;
        let keep = self.config.max_rotated_files;
        if keep == 0 {
            let _ = fs::remove_file(base);
        } else {
            let _ = fs::remove_file(rotated_name(base, keep));
            for index in (1..keep).rev() {
                let _ = fs::rename(rotated_name(base, index), rotated_name(base, index + 1));
            }
            let _ = fs::rename(base, rotated_name(base, 1));
        }
        self.sink = match open_append(base) {
            Ok((file, size)) => Sink::File { file, size },
            Err(err) => {
                eprintln!("[CW-JSONL] reopen after rotation failed, writing to stderr: {err}");
                Sink::Stderr
            }
        };
    }
}

fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| CwError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| CwError::io(path, source))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((file, size))
}

/// `activity.jsonl` → `activity.jsonl.2`.
#[must_use]
pub fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}
