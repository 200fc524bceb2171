//! Activity logging: JSONL append-only file fed by a dedicated logger thread.

pub mod activity;
pub mod jsonl;
