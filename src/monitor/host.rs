//! One-line host summary: memory from the process telemetry plus an aggregate
//! CPU busy percentage sampled from `/proc/stat`.

#![allow(missing_docs)]

use std::fmt;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{CwError, Result};
use crate::monitor::telemetry::SysInfo;

/// Cumulative jiffies from the aggregate `cpu` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    /// idle + iowait
    pub idle: u64,
    pub total: u64,
}

impl CpuTimes {
    /// Busy share of the interval between `earlier` and `self`.
    #[must_use]
    pub fn busy_percent_since(&self, earlier: &Self) -> f64 {
        let total = self.total.saturating_sub(earlier.total);
        if total == 0 {
            return 0.0;
        }
        let idle = self.idle.saturating_sub(earlier.idle).min(total);
        #[allow(clippy::cast_precision_loss)]
        {
            (total - idle) as f64 / total as f64 * 100.0
        }
    }
}

/// Parse the first (aggregate) `cpu` line of `/proc/stat` content.
pub fn parse_proc_stat(content: &str) -> Result<CpuTimes> {
    let parse_err = |details: &str| CwError::Parse {
        context: "/proc/stat",
        details: details.to_string(),
    };
    let line = content
        .lines()
        .find(|line| line.starts_with("cpu "))
        .ok_or_else(|| parse_err("no aggregate cpu line"))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map_while(|field| field.parse().ok())
        .collect();
    if values.len() < 5 {
        return Err(parse_err("fewer than five cpu counters"));
    }
    Ok(CpuTimes {
        idle: values[3] + values[4],
        total: values.iter().sum(),
    })
}

pub fn read_cpu_times(path: &Path) -> Result<CpuTimes> {
    let content = fs::read_to_string(path).map_err(|source| CwError::io(path, source))?;
    parse_proc_stat(&content)
}

/// Blocking busy-percentage sample over `window`.
pub fn sample_cpu_percent(path: &Path, window: Duration) -> Result<f64> {
    let before = read_cpu_times(path)?;
    thread::sleep(window);
    let after = read_cpu_times(path)?;
    Ok(after.busy_percent_since(&before))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSummary {
    pub total_ram_kb: u64,
    pub free_ram_kb: u64,
    pub used_ram_kb: u64,
    pub procs: u64,
    /// `None` when the CPU sample could not be taken.
    pub cpu_percent: Option<f64>,
}

impl HostSummary {
    #[must_use]
    pub fn new(info: &SysInfo, cpu_percent: Option<f64>) -> Self {
        Self {
            total_ram_kb: info.total_ram_kb,
            free_ram_kb: info.free_ram_kb,
            used_ram_kb: info.total_ram_kb.saturating_sub(info.free_ram_kb),
            procs: info.procs,
            cpu_percent,
        }
    }
}

impl fmt::Display for HostSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={}KB free={}KB used={}KB procs={} cpu=",
            self.total_ram_kb, self.free_ram_kb, self.used_ram_kb, self.procs
        )?;
        match self.cpu_percent {
            Some(pct) => write!(f, "{pct:.2}%"),
            None => f.write_str("unknown"),
        }
    }
}
