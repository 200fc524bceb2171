//! Container runtime inspection through the runtime CLI (`docker` by default).
//!
//! Listings use a pipe-separated `--format` template so parsing never depends
//! on column widths. Usage numbers come from `stats --no-stream` and are in
//! human-readable units (`12.5MiB / 1.94GiB`, `3.10%`).

#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::Serialize;

use crate::core::config::PolicyConfig;
use crate::core::errors::{CwError, Result};
use crate::platform::command::CommandRunner;

const LIST_FORMAT: &str = "{{.ID}}|{{.Image}}|{{.Names}}";
const STATS_FORMAT: &str = "{{.Container}}|{{.CPUPerc}}|{{.MemUsage}}";

// ──────────────────── model ────────────────────

/// One runtime unit as seen in the current cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Container {
    pub id: String,
    pub image: String,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

impl Container {
    #[must_use]
    pub fn new(id: impl Into<String>, image: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            name: name.into(),
            cpu_percent: 0.0,
            memory_bytes: 0,
        }
    }

    #[must_use]
    pub fn with_usage(mut self, cpu_percent: f64, memory_bytes: u64) -> Self {
        self.cpu_percent = cpu_percent;
        self.memory_bytes = memory_bytes;
        self
    }
}

/// Live usage sample for one container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

/// Policy-managed resource tiers, derived from the image name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceCategory {
    LowUsage,
    HighCpu,
    HighRam,
}

impl ResourceCategory {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LowUsage => "low_usage",
            Self::HighCpu => "high_cpu",
            Self::HighRam => "high_ram",
        }
    }
}

/// Image-marker classification. Recomputed from the image string every cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryRules {
    low_usage: String,
    high_cpu: String,
    high_ram: String,
    exempt: String,
}

impl CategoryRules {
    #[must_use]
    pub fn from_config(policy: &PolicyConfig) -> Self {
        Self {
            low_usage: policy.low_usage_marker.clone(),
            high_cpu: policy.high_cpu_marker.clone(),
            high_ram: policy.high_ram_marker.clone(),
            exempt: policy.exempt_marker.to_lowercase(),
        }
    }

    /// Category of an image; the low-usage marker is checked first, then CPU, then RAM.
    #[must_use]
    pub fn classify(&self, image: &str) -> Option<ResourceCategory> {
        if image.contains(&self.low_usage) {
            Some(ResourceCategory::LowUsage)
        } else if image.contains(&self.high_cpu) {
            Some(ResourceCategory::HighCpu)
        } else if image.contains(&self.high_ram) {
            Some(ResourceCategory::HighRam)
        } else {
            None
        }
    }

    /// Exempt infrastructure, matched case-insensitively on image or name.
    #[must_use]
    pub fn is_exempt(&self, container: &Container) -> bool {
        container.image.to_lowercase().contains(&self.exempt)
            || container.name.to_lowercase().contains(&self.exempt)
    }

    /// Managed by policy and not exempt.
    #[must_use]
    pub fn is_of_interest(&self, container: &Container) -> bool {
        !self.is_exempt(container) && self.classify(&container.image).is_some()
    }
}

// ──────────────────── inspector ────────────────────

/// Queries and acts on the container runtime via its CLI.
#[derive(Clone)]
pub struct ContainerInspector {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    rules: CategoryRules,
}

impl ContainerInspector {
    pub fn new(runner: Arc<dyn CommandRunner>, binary: impl Into<String>, rules: CategoryRules) -> Self {
        Self {
            runner,
            binary: binary.into(),
            rules,
        }
    }

    #[must_use]
    pub const fn rules(&self) -> &CategoryRules {
        &self.rules
    }

    /// Running containers with zero usage. Empty output is a valid empty fleet.
    pub fn list_running(&self) -> Result<Vec<Container>> {
        let out = self.query(&["ps", "--format", LIST_FORMAT])?;
        Ok(parse_listing(&out))
    }

    /// Containers in `exited` state, any image.
    pub fn list_exited(&self) -> Result<Vec<Container>> {
        let out = self.query(&["ps", "-a", "--filter", "status=exited", "--format", LIST_FORMAT])?;
        Ok(parse_listing(&out))
    }

    /// Exited containers whose image is policy-managed and not exempt.
    pub fn list_stopped_of_interest(&self) -> Result<Vec<Container>> {
        Ok(self
            .list_exited()?
            .into_iter()
            .filter(|c| self.rules.is_of_interest(c))
            .collect())
    }

    /// One-shot usage sample keyed by container id.
    pub fn fetch_usage(&self) -> Result<HashMap<String, ContainerUsage>> {
        let out = self.query(&["stats", "--no-stream", "--format", STATS_FORMAT])?;
        parse_stats(&out)
    }

    /// Running containers with usage merged in. Skips the stats query when
    /// nothing is running.
    pub fn inspect(&self) -> Result<Vec<Container>> {
        let mut containers = self.list_running()?;
        if containers.is_empty() {
            return Ok(containers);
        }
        let usage = self.fetch_usage()?;
        merge_usage(&mut containers, &usage);
        Ok(containers)
    }

    pub fn stop(&self, id: &str) -> Result<()> {
        self.runner.run(&self.binary, &["stop", id]).map(|_| ())
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.runner.run(&self.binary, &["rm", id]).map(|_| ())
    }

    fn query(&self, args: &[&str]) -> Result<String> {
        self.runner
            .run(&self.binary, args)
            .map_err(|err| CwError::RuntimeQuery {
                details: err.to_string(),
            })
    }
}

/// Copy usage onto matching containers. Containers without a stats line keep zero.
pub fn merge_usage(containers: &mut [Container], usage: &HashMap<String, ContainerUsage>) {
    for container in containers {
        if let Some(sample) = usage.get(&container.id) {
            container.cpu_percent = sample.cpu_percent;
            container.memory_bytes = sample.memory_bytes;
        }
    }
}

// ──────────────────── parsing ────────────────────

fn parse_listing(out: &str) -> Vec<Container> {
    out.lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(3, '|');
            let id = parts.next()?.trim();
            let image = parts.next()?.trim();
            let name = parts.next()?.trim();
            (!id.is_empty()).then(|| Container::new(id, image, name))
        })
        .collect()
}

fn parse_stats(out: &str) -> Result<HashMap<String, ContainerUsage>> {
    let mut usage = HashMap::new();
    for line in out.lines() {
        let parts: Vec<&str> = line.trim().split('|').collect();
        let [id, cpu, mem] = parts.as_slice() else {
            continue;
        };
        let sample = ContainerUsage {
            cpu_percent: parse_percent(cpu)?,
            memory_bytes: parse_mem_usage(mem)?,
        };
        usage.insert(id.trim().to_string(), sample);
    }
    Ok(usage)
}

/// `"12.34%"` → `12.34`.
pub fn parse_percent(raw: &str) -> Result<f64> {
    let trimmed = raw.trim();
    let number = trimmed.strip_suffix('%').unwrap_or(trimmed).trim();
    number
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite() && *value >= 0.0)
        .ok_or_else(|| CwError::Parse {
            context: "cpu percent",
            details: format!("unrecognized value {raw:?}"),
        })
}

/// Used half of a `MemUsage` column: `"12.5MiB / 1.944GiB"` → bytes of `12.5MiB`.
pub fn parse_mem_usage(raw: &str) -> Result<u64> {
    let used = raw.split('/').next().unwrap_or(raw);
    parse_human_bytes(used)
}

fn memory_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*([0-9]*\.?[0-9]+)\s*([KMGTP]?i?B)\s*$"))
        .as_ref()
        .map_err(|err| CwError::Parse {
            context: "memory pattern",
            details: err.to_string(),
        })
}

/// Parse a runtime memory string such as `512MiB` or `1.5GB`.
///
/// Decimal-looking suffixes (`KB`, `MB`, ...) use the same binary multiples
/// as their `KiB`/`MiB` counterparts. Unknown suffixes are rejected.
pub fn parse_human_bytes(raw: &str) -> Result<u64> {
    let parse_err = |details: String| CwError::Parse {
        context: "memory usage",
        details,
    };
    let caps = memory_pattern()?
        .captures(raw)
        .ok_or_else(|| parse_err(format!("unrecognized memory string {raw:?}")))?;
    let value: f64 = caps[1]
        .parse()
        .map_err(|err| parse_err(format!("{raw:?}: {err}")))?;
    let multiplier: f64 = match &caps[2] {
        "B" => 1.0,
        "KiB" | "KB" => 1024.0,
        "MiB" | "MB" => 1024.0 * 1024.0,
        "GiB" | "GB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" | "TB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        unit => return Err(parse_err(format!("unsupported unit {unit:?} in {raw:?}"))),
    };
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok((value * multiplier) as u64)
}
