//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{CwError, Result};

/// Full warden configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub policy: PolicyConfig,
    pub runtime: RuntimeConfig,
    pub kernel: KernelConfig,
    pub cron: CronConfig,
    pub telemetry: TelemetryConfig,
    pub paths: PathsConfig,
}

/// Main loop cadence and enforcement switches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Seconds between telemetry + enforcement cycles.
    pub tick_interval_secs: u64,
    /// Compute and log evictions without stopping anything.
    pub dry_run: bool,
    /// Stop and remove managed containers when the daemon shuts down.
    pub cleanup_on_shutdown: bool,
}

/// Eviction quotas and the image markers that classify containers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    /// K: survivors allowed in the low-usage tier.
    pub keep_low_usage: usize,
    /// M: survivors allowed in the combined high-CPU/high-RAM tier.
    pub keep_high_pressure: usize,
    pub low_usage_marker: String,
    pub high_cpu_marker: String,
    pub high_ram_marker: String,
    /// Matched case-insensitively against image and name.
    pub exempt_marker: String,
}

/// Container runtime CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub binary: String,
}

/// One kernel extension the daemon keeps loaded while it runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KernelModuleSpec {
    pub name: String,
    pub image_path: PathBuf,
}

/// Kernel extension loader commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KernelConfig {
    /// Prefix for privileged commands (e.g. `sudo`); empty runs them directly.
    pub privilege_command: String,
    pub lsmod_binary: String,
    pub insmod_binary: String,
    pub rmmod_binary: String,
    /// Loaded in order at startup, unloaded in reverse at shutdown.
    pub modules: Vec<KernelModuleSpec>,
}

/// Periodic container-spawner job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CronConfig {
    pub enabled: bool,
    pub script_path: PathBuf,
    pub log_path: PathBuf,
    pub interval_minutes: u32,
    pub shell: String,
    pub crontab_binary: String,
}

/// Kernel-exported telemetry documents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TelemetryConfig {
    pub process_source: PathBuf,
    pub container_source: PathBuf,
    /// Window for the aggregate CPU sample taken from /proc/stat (0 disables).
    pub cpu_sample_ms: u64,
}

/// Filesystem paths used by the warden.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub sqlite_db: PathBuf,
    pub jsonl_log: PathBuf,
    pub state_file: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 20,
            dry_run: false,
            cleanup_on_shutdown: true,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            keep_low_usage: 3,
            keep_high_pressure: 2,
            low_usage_marker: "img_low".to_string(),
            high_cpu_marker: "img_cpu".to_string(),
            high_ram_marker: "img_ram".to_string(),
            exempt_marker: "grafana".to_string(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        let base = PathBuf::from("/opt/cwarden/modules");
        Self {
            privilege_command: "sudo".to_string(),
            lsmod_binary: "lsmod".to_string(),
            insmod_binary: "insmod".to_string(),
            rmmod_binary: "rmmod".to_string(),
            modules: vec![
                KernelModuleSpec {
                    name: "sysinfo".to_string(),
                    image_path: base.join("sysinfo.ko"),
                },
                KernelModuleSpec {
                    name: "continfo".to_string(),
                    image_path: base.join("continfo.ko"),
                },
            ],
        }
    }
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            script_path: PathBuf::from("/opt/cwarden/bin/spawn_containers.sh"),
            log_path: PathBuf::from("/var/log/cwarden/spawn_containers.log"),
            interval_minutes: 1,
            shell: "bash".to_string(),
            crontab_binary: "crontab".to_string(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            process_source: PathBuf::from("/proc/sysinfo"),
            container_source: PathBuf::from("/proc/continfo"),
            cpu_sample_ms: 200,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home_dir = env::var_os("HOME").map_or_else(
            || {
                eprintln!("[CW-CONFIG] WARNING: HOME not set, falling back to /tmp for data paths");
                PathBuf::from("/tmp")
            },
            PathBuf::from,
        );
        let cfg = home_dir.join(".config").join("cwarden").join("config.toml");
        let data = home_dir.join(".local").join("share").join("cwarden");
        Self {
            config_file: cfg,
            sqlite_db: data.join("metrics.db"),
            jsonl_log: data.join("activity.jsonl"),
            state_file: data.join("state.json"),
        }
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathsConfig::default().config_file
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| CwError::Io {
                path: path_buf.clone(),
                source,
            })?;
            toml::from_str::<Self>(&raw)?
        } else if is_explicit_path {
            return Err(CwError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        // daemon
        if let Some(raw) = lookup("CW_DAEMON_TICK_INTERVAL_SECS") {
            self.daemon.tick_interval_secs = parse_env("CW_DAEMON_TICK_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = lookup("CW_DAEMON_DRY_RUN") {
            self.daemon.dry_run = parse_env("CW_DAEMON_DRY_RUN", &raw)?;
        }
        if let Some(raw) = lookup("CW_DAEMON_CLEANUP_ON_SHUTDOWN") {
            self.daemon.cleanup_on_shutdown = parse_env("CW_DAEMON_CLEANUP_ON_SHUTDOWN", &raw)?;
        }

        // policy
        if let Some(raw) = lookup("CW_POLICY_KEEP_LOW_USAGE") {
            self.policy.keep_low_usage = parse_env("CW_POLICY_KEEP_LOW_USAGE", &raw)?;
        }
        if let Some(raw) = lookup("CW_POLICY_KEEP_HIGH_PRESSURE") {
            self.policy.keep_high_pressure = parse_env("CW_POLICY_KEEP_HIGH_PRESSURE", &raw)?;
        }
        if let Some(raw) = lookup("CW_POLICY_EXEMPT_MARKER") {
            self.policy.exempt_marker = raw;
        }

        // runtime
        if let Some(raw) = lookup("CW_RUNTIME_BINARY") {
            self.runtime.binary = raw;
        }

        // kernel
        if let Some(raw) = lookup("CW_KERNEL_PRIVILEGE_COMMAND") {
            // "none" clears the prefix since empty env vars are ignored.
            self.kernel.privilege_command = if raw == "none" { String::new() } else { raw };
        }

        // cron
        if let Some(raw) = lookup("CW_CRON_ENABLED") {
            self.cron.enabled = parse_env("CW_CRON_ENABLED", &raw)?;
        }
        if let Some(raw) = lookup("CW_CRON_SCRIPT_PATH") {
            self.cron.script_path = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("CW_CRON_LOG_PATH") {
            self.cron.log_path = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("CW_CRON_INTERVAL_MINUTES") {
            self.cron.interval_minutes = parse_env("CW_CRON_INTERVAL_MINUTES", &raw)?;
        }

        // telemetry
        if let Some(raw) = lookup("CW_TELEMETRY_PROCESS_SOURCE") {
            self.telemetry.process_source = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("CW_TELEMETRY_CONTAINER_SOURCE") {
            self.telemetry.container_source = PathBuf::from(raw);
        }

        // paths
        if let Some(raw) = lookup("CW_PATHS_SQLITE_DB") {
            self.paths.sqlite_db = PathBuf::from(raw);
        }
        if let Some(raw) = lookup("CW_PATHS_STATE_FILE") {
            self.paths.state_file = PathBuf::from(raw);
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.daemon.tick_interval_secs == 0 {
            return Err(CwError::InvalidConfig {
                details: "daemon.tick_interval_secs must be >= 1".to_string(),
            });
        }

        if self.policy.keep_low_usage == 0 || self.policy.keep_high_pressure == 0 {
            return Err(CwError::InvalidConfig {
                details: "policy.keep_low_usage and policy.keep_high_pressure must be >= 1"
                    .to_string(),
            });
        }

        let markers = [
            ("low_usage_marker", &self.policy.low_usage_marker),
            ("high_cpu_marker", &self.policy.high_cpu_marker),
            ("high_ram_marker", &self.policy.high_ram_marker),
            ("exempt_marker", &self.policy.exempt_marker),
        ];
        let mut seen = HashSet::new();
        for (name, marker) in markers {
            if marker.trim().is_empty() {
                return Err(CwError::InvalidConfig {
                    details: format!("policy.{name} must not be empty"),
                });
            }
            if !seen.insert(marker.as_str()) {
                return Err(CwError::InvalidConfig {
                    details: format!("policy.{name} duplicates another marker: {marker:?}"),
                });
            }
        }

        if self.runtime.binary.trim().is_empty() {
            return Err(CwError::InvalidConfig {
                details: "runtime.binary must not be empty".to_string(),
            });
        }

        let mut names = HashSet::new();
        for module in &self.kernel.modules {
            if module.name.trim().is_empty() {
                return Err(CwError::InvalidConfig {
                    details: "kernel.modules entries need a name".to_string(),
                });
            }
            if !names.insert(module.name.as_str()) {
                return Err(CwError::InvalidConfig {
                    details: format!("kernel module {:?} is listed twice", module.name),
                });
            }
        }

        if self.cron.enabled {
            if !(1..=59).contains(&self.cron.interval_minutes) {
                return Err(CwError::InvalidConfig {
                    details: format!(
                        "cron.interval_minutes must be in [1, 59], got {}",
                        self.cron.interval_minutes
                    ),
                });
            }
            if self.cron.script_path.as_os_str().is_empty() {
                return Err(CwError::InvalidConfig {
                    details: "cron.script_path must be set when cron.enabled=true".to_string(),
                });
            }
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}

fn parse_env<T>(name: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|error| CwError::ConfigParse {
            context: "env",
            details: format!("{name}={raw:?}: {error}"),
        })
}

#[cfg(test)]
mod tests {
    use super::{Config, CwError};
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.policy.keep_low_usage, 3);
        assert_eq!(cfg.policy.keep_high_pressure, 2);
        assert_eq!(cfg.daemon.tick_interval_secs, 20);
    }

    #[test]
    fn zero_quota_rejected() {
        let mut cfg = Config::default();
        cfg.policy.keep_high_pressure = 0;
        let err = cfg.validate().expect_err("expected quota error");
        assert!(err.to_string().contains("keep_high_pressure"));
    }

    #[test]
    fn duplicate_markers_rejected() {
        let mut cfg = Config::default();
        cfg.policy.high_ram_marker = cfg.policy.high_cpu_marker.clone();
        let err = cfg.validate().expect_err("expected marker error");
        match err {
            CwError::InvalidConfig { details } => assert!(details.contains("high_ram_marker")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn duplicate_module_names_rejected() {
        let mut cfg = Config::default();
        let first = cfg.kernel.modules[0].clone();
        cfg.kernel.modules.push(first);
        let err = cfg.validate().expect_err("expected module error");
        assert!(err.to_string().contains("listed twice"));
    }

    #[test]
    fn cron_interval_bounds_enforced_only_when_enabled() {
        let mut cfg = Config::default();
        cfg.cron.interval_minutes = 60;
        assert!(cfg.validate().is_err());
        cfg.cron.enabled = false;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_tick_rejected() {
        let mut cfg = Config::default();
        cfg.daemon.tick_interval_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = Config::default();
        let overrides = vars(&[
            ("CW_DAEMON_TICK_INTERVAL_SECS", "5"),
            ("CW_DAEMON_DRY_RUN", "true"),
            ("CW_POLICY_KEEP_LOW_USAGE", "7"),
            ("CW_KERNEL_PRIVILEGE_COMMAND", "none"),
            ("CW_TELEMETRY_PROCESS_SOURCE", "/tmp/sysinfo.json"),
        ]);
        cfg.apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect("overrides should parse");

        assert_eq!(cfg.daemon.tick_interval_secs, 5);
        assert!(cfg.daemon.dry_run);
        assert_eq!(cfg.policy.keep_low_usage, 7);
        assert!(cfg.kernel.privilege_command.is_empty());
        assert_eq!(
            cfg.telemetry.process_source,
            PathBuf::from("/tmp/sysinfo.json")
        );
    }

    #[test]
    fn env_invalid_number_rejected() {
        let mut cfg = Config::default();
        let overrides = vars(&[("CW_POLICY_KEEP_HIGH_PRESSURE", "two")]);
        let err = cfg
            .apply_env_overrides_from(|name| overrides.get(name).cloned())
            .expect_err("invalid number should fail");
        match err {
            CwError::ConfigParse { context, details } => {
                assert_eq!(context, "env");
                assert!(details.contains("CW_POLICY_KEEP_HIGH_PRESSURE"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn toml_sections_parse_with_defaults_for_missing_fields() {
        let raw = r#"
            [policy]
            keep_low_usage = 4
            exempt_marker = "prometheus"

            [[kernel.modules]]
            name = "sysinfo"
            image_path = "/srv/ko/sysinfo.ko"
        "#;
        let cfg: Config = toml::from_str(raw).expect("parse");
        assert_eq!(cfg.policy.keep_low_usage, 4);
        assert_eq!(cfg.policy.keep_high_pressure, 2);
        assert_eq!(cfg.policy.exempt_marker, "prometheus");
        assert_eq!(cfg.kernel.modules.len(), 1);
        assert_eq!(cfg.kernel.privilege_command, "sudo");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_returns_error_for_explicit_missing_path() {
        let result = Config::load(Some(Path::new("/nonexistent/cwarden/config.toml")));
        assert!(matches!(result, Err(CwError::MissingConfig { .. })));
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[daemon]\ntick_interval_secs = 3\n").unwrap();
        let cfg = Config::load(Some(&path)).expect("load");
        assert_eq!(cfg.paths.config_file, path);
        assert!(cfg.daemon.tick_interval_secs >= 1);
    }

    #[test]
    fn stable_hash_tracks_changes() {
        let cfg = Config::default();
        assert_eq!(cfg.stable_hash().unwrap(), cfg.stable_hash().unwrap());
        let mut modified = Config::default();
        modified.policy.keep_low_usage += 1;
        assert_ne!(cfg.stable_hash().unwrap(), modified.stable_hash().unwrap());
    }
}
