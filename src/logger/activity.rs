//! Activity logger thread.
//!
//! A dedicated thread owns the [`JsonlWriter`]. Everything else holds a
//! cloneable [`ActivityLoggerHandle`] and sends [`ActivityEvent`]s over a
//! bounded crossbeam channel with `try_send`, so the daemon loop never blocks
//! on logging. Events that do not fit are counted and reported as a warning
//! record once the thread catches up.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

use crate::core::errors::{CwError, Result};
use crate::logger::jsonl::{ActivityRecord, EventKind, JsonlConfig, JsonlWriter, Severity};
use crate::monitor::host::HostSummary;

const CHANNEL_CAPACITY: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub enum ActivityEvent {
    DaemonStarted {
        version: String,
        config_hash: String,
    },
    DaemonStopped {
        reason: String,
        uptime_secs: u64,
    },
    ModuleLoaded {
        name: String,
        image: String,
    },
    ModuleUnloaded {
        name: String,
    },
    ScheduleInstalled {
        script: String,
    },
    ScheduleRemoved {
        script: String,
    },
    BatchRecorded {
        batch_id: i64,
        processes: usize,
        /// `None` when the container source was unavailable.
        containers: Option<usize>,
    },
    HostSampled(HostSummary),
    CycleFailed {
        code: String,
        message: String,
        /// From [`CwError::is_retryable`]; the loop keeps ticking either way.
        retryable: bool,
    },
    ContainerEvicted {
        id: String,
        image: String,
        category: String,
        score: f64,
        dry_run: bool,
    },
    EvictionFailed {
        id: String,
        code: String,
        message: String,
    },
    StoppedContainerRemoved {
        id: String,
        image: String,
    },
    Error {
        code: String,
        message: String,
    },
    /// Ends the logger thread after flushing.
    Shutdown,
}

/// Cheaply cloneable, non-blocking sender.
#[derive(Clone)]
pub struct ActivityLoggerHandle {
    tx: Sender<ActivityEvent>,
    dropped_events: Arc<AtomicU64>,
}

impl ActivityLoggerHandle {
    /// Handle with no logger thread behind it; every event is discarded.
    #[must_use]
    pub fn detached() -> Self {
        let (tx, _rx) = bounded(1);
        Self {
            tx,
            dropped_events: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn send(&self, event: ActivityEvent) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(event) {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Events dropped to back-pressure since the logger last reported them.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Ask the logger thread to flush and exit. Blocks only if the channel is full.
    pub fn shutdown(&self) {
        let _ = self.tx.send(ActivityEvent::Shutdown);
    }
}

/// Spawn the logger thread writing to `config.path`.
pub fn spawn_logger(config: JsonlConfig) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    spawn_logger_with_capacity(config, CHANNEL_CAPACITY)
}

pub fn spawn_logger_with_capacity(
    config: JsonlConfig,
    capacity: usize,
) -> Result<(ActivityLoggerHandle, thread::JoinHandle<()>)> {
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = ActivityLoggerHandle {
        tx,
        dropped_events: Arc::clone(&dropped),
    };
    let join = thread::Builder::new()
        .name("cw-logger".to_string())
        .spawn(move || logger_thread_main(&rx, config, &dropped))
        .map_err(|err| CwError::Runtime {
            details: format!("failed to spawn logger thread: {err}"),
        })?;
    Ok((handle, join))
}

fn logger_thread_main(rx: &Receiver<ActivityEvent>, config: JsonlConfig, dropped: &AtomicU64) {
    let mut writer = JsonlWriter::open(config);
    while let Ok(event) = rx.recv() {
        let lost = dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let mut warn = ActivityRecord::now(EventKind::Error, Severity::Warning);
            warn.details = Some(format!("{lost} activity events dropped due to back-pressure"));
            writer.write(&warn);
        }
        if event == ActivityEvent::Shutdown {
            break;
        }
        writer.write(&to_record(&event));
    }
    writer.sync();
}

/// Map an event onto its JSONL representation.
#[must_use]
pub fn to_record(event: &ActivityEvent) -> ActivityRecord {
    match event {
        ActivityEvent::DaemonStarted {
            version,
            config_hash,
        } => {
            let mut r = ActivityRecord::now(EventKind::DaemonStart, Severity::Info);
            r.details = Some(format!("version={version} config_hash={config_hash}"));
            r.ok = Some(true);
            r
        }
        ActivityEvent::DaemonStopped {
            reason,
            uptime_secs,
        } => {
            let mut r = ActivityRecord::now(EventKind::DaemonStop, Severity::Info);
            r.details = Some(format!("reason={reason} uptime={uptime_secs}s"));
            r
        }
        ActivityEvent::ModuleLoaded { name, image } => {
            let mut r = ActivityRecord::now(EventKind::ModuleLoad, Severity::Info);
            r.module = Some(name.clone());
            r.path = Some(image.clone());
            r.ok = Some(true);
            r
        }
        ActivityEvent::ModuleUnloaded { name } => {
            let mut r = ActivityRecord::now(EventKind::ModuleUnload, Severity::Info);
            r.module = Some(name.clone());
            r.ok = Some(true);
            r
        }
        ActivityEvent::ScheduleInstalled { script } => {
            let mut r = ActivityRecord::now(EventKind::ScheduleInstall, Severity::Info);
            r.path = Some(script.clone());
            r.ok = Some(true);
            r
        }
        ActivityEvent::ScheduleRemoved { script } => {
            let mut r = ActivityRecord::now(EventKind::ScheduleRemove, Severity::Info);
            r.path = Some(script.clone());
            r.ok = Some(true);
            r
        }
        ActivityEvent::BatchRecorded {
            batch_id,
            processes,
            containers,
        } => {
            let mut r = ActivityRecord::now(EventKind::BatchRecorded, Severity::Info);
            r.batch_id = Some(*batch_id);
            r.processes = Some(*processes as u64);
            r.containers = containers.map(|n| n as u64);
            r
        }
        ActivityEvent::HostSampled(summary) => {
            let mut r = ActivityRecord::now(EventKind::HostSummary, Severity::Info);
            r.processes = Some(summary.procs);
            r.host = Some(summary.clone());
            r
        }
        ActivityEvent::CycleFailed {
            code,
            message,
            retryable,
        } => {
            let severity = if *retryable {
                Severity::Warning
            } else {
                Severity::Critical
            };
            let mut r = ActivityRecord::now(EventKind::CycleFailed, severity);
            r.details = Some(format!("retryable={retryable}"));
            r.ok = Some(false);
            r.error_code = Some(code.clone());
            r.error_message = Some(message.clone());
            r
        }
        ActivityEvent::ContainerEvicted {
            id,
            image,
            category,
            score,
            dry_run,
        } => {
            let mut r = ActivityRecord::now(EventKind::ContainerEvicted, Severity::Info);
            r.container_id = Some(id.clone());
            r.image = Some(image.clone());
            r.category = Some(category.clone());
            r.score = Some(*score);
            r.ok = Some(true);
            if *dry_run {
                r.details = Some("dry_run".to_string());
            }
            r
        }
        ActivityEvent::EvictionFailed { id, code, message } => {
            let mut r = ActivityRecord::now(EventKind::EvictionFailed, Severity::Warning);
            r.container_id = Some(id.clone());
            r.ok = Some(false);
            r.error_code = Some(code.clone());
            r.error_message = Some(message.clone());
            r
        }
        ActivityEvent::StoppedContainerRemoved { id, image } => {
            let mut r = ActivityRecord::now(EventKind::StoppedCleanup, Severity::Info);
            r.container_id = Some(id.clone());
            r.image = Some(image.clone());
            r.ok = Some(true);
            r
        }
        ActivityEvent::Error { code, message } => {
            let mut r = ActivityRecord::now(EventKind::Error, Severity::Critical);
            r.ok = Some(false);
            r.error_code = Some(code.clone());
            r.error_message = Some(message.clone());
            r
        }
        ActivityEvent::Shutdown => ActivityRecord::now(EventKind::DaemonStop, Severity::Info),
    }
}
