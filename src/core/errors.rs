//! CW-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, CwError>;

/// Top-level error type for container warden.
#[derive(Debug, Error)]
pub enum CwError {
    #[error("[CW-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[CW-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[CW-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[CW-2001] telemetry source {path} unavailable: {details}")]
    TelemetrySource { path: PathBuf, details: String },

    #[error("[CW-2002] parse failure in {context}: {details}")]
    Parse {
        context: &'static str,
        details: String,
    },

    #[error("[CW-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[CW-2102] snapshot store failure in {context}: {details}")]
    Store {
        context: &'static str,
        details: String,
    },

    #[error("[CW-2103] snapshot store schema is missing required table `{table}`")]
    MissingSchema { table: String },

    #[error("[CW-3001] command `{program} {}` failed (exit {}): {stderr}", args.join(" "), exit_label(*status))]
    CommandFailed {
        program: String,
        args: Vec<String>,
        status: Option<i32>,
        stderr: String,
    },

    #[error("[CW-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[CW-3003] channel closed in component {component}")]
    ChannelClosed { component: &'static str },

    #[error("[CW-3101] failed to load kernel module {name} from {image}: {details}")]
    ModuleLoad {
        name: String,
        image: PathBuf,
        details: String,
    },

    #[error("[CW-3102] failed to unload kernel module {name}: {details}")]
    ModuleUnload { name: String, details: String },

    #[error("[CW-3103] failed to query loaded kernel modules: {details}")]
    ModuleQuery { details: String },

    #[error("[CW-3201] failed to read schedule table: {details}")]
    ScheduleRead { details: String },

    #[error("[CW-3202] failed to write schedule table: {details}")]
    ScheduleWrite { details: String },

    #[error("[CW-3301] container runtime query failed: {details}")]
    RuntimeQuery { details: String },

    #[error("[CW-3900] runtime failure: {details}")]
    Runtime { details: String },
}

fn exit_label(status: Option<i32>) -> String {
    status.map_or_else(|| "signal".to_string(), |code| code.to_string())
}

impl CwError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "CW-1001",
            Self::MissingConfig { .. } => "CW-1002",
            Self::ConfigParse { .. } => "CW-1003",
            Self::TelemetrySource { .. } => "CW-2001",
            Self::Parse { .. } => "CW-2002",
            Self::Serialization { .. } => "CW-2101",
            Self::Store { .. } => "CW-2102",
            Self::MissingSchema { .. } => "CW-2103",
            Self::CommandFailed { .. } => "CW-3001",
            Self::Io { .. } => "CW-3002",
            Self::ChannelClosed { .. } => "CW-3003",
            Self::ModuleLoad { .. } => "CW-3101",
            Self::ModuleUnload { .. } => "CW-3102",
            Self::ModuleQuery { .. } => "CW-3103",
            Self::ScheduleRead { .. } => "CW-3201",
            Self::ScheduleWrite { .. } => "CW-3202",
            Self::RuntimeQuery { .. } => "CW-3301",
            Self::Runtime { .. } => "CW-3900",
        }
    }

    /// Whether the next daemon tick might succeed where this one failed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TelemetrySource { .. }
                | Self::Parse { .. }
                | Self::Store { .. }
                | Self::CommandFailed { .. }
                | Self::Io { .. }
                | Self::RuntimeQuery { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Captured stderr of a failed external command, if this is one.
    #[must_use]
    pub fn command_stderr(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for CwError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for CwError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for CwError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_variant() -> Vec<CwError> {
        vec![
            CwError::InvalidConfig {
                details: String::new(),
            },
            CwError::MissingConfig {
                path: PathBuf::new(),
            },
            CwError::ConfigParse {
                context: "",
                details: String::new(),
            },
            CwError::TelemetrySource {
                path: PathBuf::new(),
                details: String::new(),
            },
            CwError::Parse {
                context: "",
                details: String::new(),
            },
            CwError::Serialization {
                context: "",
                details: String::new(),
            },
            CwError::Store {
                context: "",
                details: String::new(),
            },
            CwError::MissingSchema {
                table: String::new(),
            },
            CwError::CommandFailed {
                program: String::new(),
                args: Vec::new(),
                status: None,
                stderr: String::new(),
            },
            CwError::Io {
                path: PathBuf::new(),
                source: std::io::Error::other("test"),
            },
            CwError::ChannelClosed { component: "" },
            CwError::ModuleLoad {
                name: String::new(),
                image: PathBuf::new(),
                details: String::new(),
            },
            CwError::ModuleUnload {
                name: String::new(),
                details: String::new(),
            },
            CwError::ModuleQuery {
                details: String::new(),
            },
            CwError::ScheduleRead {
                details: String::new(),
            },
            CwError::ScheduleWrite {
                details: String::new(),
            },
            CwError::RuntimeQuery {
                details: String::new(),
            },
            CwError::Runtime {
                details: String::new(),
            },
        ]
    }

    #[test]
    fn error_codes_are_unique() {
        let errors = every_variant();
        let codes: Vec<&str> = errors.iter().map(CwError::code).collect();
        let unique: std::collections::HashSet<&&str> = codes.iter().collect();
        assert_eq!(
            codes.len(),
            unique.len(),
            "error codes must be unique: {codes:?}"
        );
    }

    #[test]
    fn error_display_includes_code() {
        for err in every_variant() {
            let msg = err.to_string();
            assert!(
                msg.contains(err.code()),
                "display should contain error code {}: {msg}",
                err.code()
            );
        }
    }

    #[test]
    fn command_failure_reports_invocation_and_stderr() {
        let err = CwError::CommandFailed {
            program: "docker".to_string(),
            args: vec!["stop".to_string(), "abc123".to_string()],
            status: Some(1),
            stderr: "No such container: abc123".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("docker stop abc123"), "{msg}");
        assert!(msg.contains("exit 1"), "{msg}");
        assert!(msg.contains("No such container"), "{msg}");
        assert_eq!(err.command_stderr(), Some("No such container: abc123"));
    }

    #[test]
    fn command_killed_by_signal_has_no_exit_code() {
        let err = CwError::CommandFailed {
            program: "lsmod".to_string(),
            args: Vec::new(),
            status: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("exit signal"));
    }

    #[test]
    fn retryable_errors_are_correct() {
        assert!(
            CwError::TelemetrySource {
                path: PathBuf::new(),
                details: String::new(),
            }
            .is_retryable()
        );
        assert!(
            CwError::Store {
                context: "",
                details: String::new(),
            }
            .is_retryable()
        );
        assert!(
            !CwError::MissingSchema {
                table: "batches".to_string(),
            }
            .is_retryable()
        );
        assert!(
            !CwError::ModuleLoad {
                name: String::new(),
                image: PathBuf::new(),
                details: String::new(),
            }
            .is_retryable()
        );
        assert!(
            !CwError::InvalidConfig {
                details: String::new(),
            }
            .is_retryable()
        );
    }

    #[test]
    fn io_convenience_constructor() {
        let err = CwError::io(
            "/proc/sysinfo",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.code(), "CW-3002");
        assert!(err.to_string().contains("/proc/sysinfo"));
    }

    #[test]
    fn from_rusqlite_error() {
        let sql_err =
            rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(1), Some("test".to_string()));
        let err: CwError = sql_err.into();
        assert_eq!(err.code(), "CW-2102");
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: CwError = json_err.into();
        assert_eq!(err.code(), "CW-2101");
    }

    #[test]
    fn from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= invalid").unwrap_err();
        let err: CwError = toml_err.into();
        assert_eq!(err.code(), "CW-1003");
    }
}
