#![forbid(unsafe_code)]

//! Container Warden (cwarden), a single-node daemon that keeps a fleet of local
//! containers within per-category quotas.
//!
//! Each tick the daemon:
//! 1. **Captures telemetry**: kernel-exported process and container documents
//!    are persisted as one timestamped batch in SQLite.
//! 2. **Runs the policy**: running containers are scored (MB + 10 × CPU%) and
//!    the low-usage and high-pressure tiers are trimmed to their quotas.
//! 3. **Enforces**: evicted containers are stopped and removed, best-effort.
//!
//! Around the loop it keeps the telemetry kernel modules loaded and the
//! container spawner scheduled, and undoes both on shutdown.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use container_warden::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use container_warden::core::config::Config;
//! use container_warden::daemon::policy::ContainerPolicyEngine;
//! ```

pub mod prelude;

pub mod core;
pub mod daemon;
pub mod logger;
pub mod monitor;
pub mod platform;
pub mod store;
