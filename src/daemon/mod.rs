//! Daemon subsystem: eviction policy, main loop, signal handling and the
//! state file read by `cwarden status`.

#[cfg(feature = "daemon")]
pub mod loop_main;
pub mod policy;
pub mod self_monitor;
#[cfg(feature = "daemon")]
pub mod signals;
