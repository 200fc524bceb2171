//! Kernel-exported telemetry documents (process table and container table).
//!
//! Both are single JSON objects read from procfs entries created by the
//! warden's kernel modules. Field names follow the module's output verbatim.

#![allow(missing_docs)]

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::errors::{CwError, Result};

/// Host memory and process table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SysInfo {
    /// Total RAM in KB.
    #[serde(rename = "Totalram")]
    pub total_ram_kb: u64,
    /// Free RAM in KB.
    #[serde(rename = "Freeram")]
    pub free_ram_kb: u64,
    #[serde(rename = "Procs")]
    pub procs: u64,
    #[serde(rename = "Processes", default)]
    pub processes: Vec<ProcessRecord>,
}

/// One process row from the process table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    #[serde(rename = "PID")]
    pub pid: i64,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Cmdline", default)]
    pub cmdline: String,
    #[serde(rename = "vsz", default)]
    pub vsz_kb: u64,
    #[serde(rename = "rss", default)]
    pub rss_kb: u64,
    #[serde(rename = "Memory_Usage", default)]
    pub memory_percent: f64,
    #[serde(rename = "CPU_Usage", default)]
    pub cpu_percent: f64,
    #[serde(rename = "utime", default)]
    pub utime_ticks: u64,
    #[serde(rename = "stime", default)]
    pub stime_ticks: u64,
}

/// Per-cgroup container accounting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContInfo {
    #[serde(rename = "Count", default)]
    pub count: u64,
    #[serde(rename = "Containers", default)]
    pub containers: Vec<ContainerRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    #[serde(rename = "CgroupPath", default)]
    pub cgroup_path: String,
    #[serde(rename = "RSS_KB", default)]
    pub rss_kb: u64,
    #[serde(rename = "CPU_Jiffies", default)]
    pub cpu_jiffies: u64,
    #[serde(rename = "Procs", default)]
    pub procs: u64,
}

pub fn read_sysinfo(path: &Path) -> Result<SysInfo> {
    read_document(path, "sysinfo")
}

pub fn read_continfo(path: &Path) -> Result<ContInfo> {
    read_document(path, "continfo")
}

/// Parse a telemetry document, tolerating the trailing NULs and whitespace
/// procfs readers sometimes return.
pub fn parse_document<T: for<'de> Deserialize<'de>>(raw: &str, context: &'static str) -> Result<T> {
    let clean = raw.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    serde_json::from_str(clean).map_err(|err| CwError::Parse {
        context,
        details: format!("{err} (starts with {:?})", snippet(clean, 80)),
    })
}

fn read_document<T: for<'de> Deserialize<'de>>(path: &Path, context: &'static str) -> Result<T> {
    let raw = fs::read(path).map_err(|err| CwError::TelemetrySource {
        path: path.to_path_buf(),
        details: err.to_string(),
    })?;
    parse_document(&String::from_utf8_lossy(&raw), context)
}

fn snippet(s: &str, max_chars: usize) -> &str {
    s.char_indices().nth(max_chars).map_or(s, |(idx, _)| &s[..idx])
}
