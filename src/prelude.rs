//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use container_warden::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{CwError, Result};

// Platform
pub use crate::platform::Change;
pub use crate::platform::command::{CommandOutput, CommandRunner, SystemCommandRunner};
pub use crate::platform::cron::CronManager;
pub use crate::platform::kmod::ModuleManager;

// Monitor
pub use crate::monitor::containers::{CategoryRules, Container, ContainerInspector, ResourceCategory};
pub use crate::monitor::host::HostSummary;
pub use crate::monitor::telemetry::{ContInfo, ContainerRecord, ProcessRecord, SysInfo};

// Store
pub use crate::store::snapshot::{BatchSummary, SnapshotStore};

// Daemon
#[cfg(feature = "daemon")]
pub use crate::daemon::loop_main::{CycleReport, PolicyDaemon};
pub use crate::daemon::policy::{ContainerPolicyEngine, EvictionPlan, ScoredContainer, usage_score};
