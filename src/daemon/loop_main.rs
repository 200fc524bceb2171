//! Main daemon loop: Starting → Running → Stopping → Stopped.
//!
//! Startup resets the snapshot store, loads the kernel extensions, installs the
//! spawner schedule and checks that both telemetry sources exist. Any failure
//! there is fatal, and whatever this attempt already applied is undone in
//! reverse order before the error is returned.
//!
//! While running, one control thread waits on two channels: the tick timer and
//! the termination channel fed by [`SignalHandler`]. Each tick runs one fused
//! cycle (telemetry → batch → snapshots → policy → enforcement) to completion.
//! Cycles never overlap and a failed cycle only costs that tick.

#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, tick};

use crate::core::config::Config;
use crate::core::errors::{CwError, Result};
use crate::daemon::policy::ContainerPolicyEngine;
use crate::daemon::self_monitor::{DaemonPhase, StateFile};
use crate::daemon::signals::{ShutdownCoordinator, ShutdownTrigger, SignalHandler, StopReason};
use crate::logger::activity::{ActivityEvent, ActivityLoggerHandle, spawn_logger};
use crate::logger::jsonl::JsonlConfig;
use crate::monitor::containers::{CategoryRules, ContainerInspector};
use crate::monitor::host::{HostSummary, sample_cpu_percent};
use crate::monitor::telemetry::{read_continfo, read_sysinfo};
use crate::platform::command::{CommandRunner, SystemCommandRunner};
use crate::platform::cron::CronManager;
use crate::platform::kmod::ModuleManager;
use crate::store::snapshot::SnapshotStore;

const PROC_STAT: &str = "/proc/stat";

/// Upper bound for the whole shutdown sequence.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

// ──────────────────── cycle report ────────────────────

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub batch_id: i64,
    pub processes: usize,
    /// `None` when the container telemetry source was unavailable.
    pub containers: Option<usize>,
    pub stopped_removed: usize,
    /// Containers stopped and removed (or only logged under dry-run).
    pub evicted: Vec<String>,
    pub eviction_failures: usize,
}

/// Host side effect applied during startup, undone on a failed start.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Applied {
    Module(String),
    Schedule,
}

// ──────────────────── main daemon struct ────────────────────

/// The policy daemon: owns the store, the host managers and the loop.
pub struct PolicyDaemon {
    config: Config,
    store: SnapshotStore,
    modules: ModuleManager,
    cron: CronManager,
    inspector: ContainerInspector,
    engine: ContainerPolicyEngine,
    state: StateFile,
    logger_handle: ActivityLoggerHandle,
    logger_join: Option<thread::JoinHandle<()>>,
    signal_handler: SignalHandler,
    start_time: Instant,
}

impl PolicyDaemon {
    /// Build the daemon against the real host: system commands and OS signals.
    pub fn init(config: Config) -> Result<Self> {
        Self::init_with(config, Arc::new(SystemCommandRunner), SignalHandler::new())
    }

    /// Build the daemon with an explicit command runner and signal source.
    ///
    /// Opens the snapshot store first; a missing database or schema is fatal
    /// and nothing else is touched.
    pub fn init_with(
        config: Config,
        runner: Arc<dyn CommandRunner>,
        signal_handler: SignalHandler,
    ) -> Result<Self> {
        let store = SnapshotStore::open(&config.paths.sqlite_db)?;

        let (logger_handle, logger_join) =
            spawn_logger(JsonlConfig::new(config.paths.jsonl_log.clone()))?;

        let modules = ModuleManager::new(Arc::clone(&runner), &config.kernel);
        let cron = CronManager::new(Arc::clone(&runner), &config.cron);
        let inspector = ContainerInspector::new(
            runner,
            config.runtime.binary.clone(),
            CategoryRules::from_config(&config.policy),
        );
        let engine = ContainerPolicyEngine::from_config(&config.policy);
        let state = StateFile::new(config.paths.state_file.clone());

        Ok(Self {
            config,
            store,
            modules,
            cron,
            inspector,
            engine,
            state,
            logger_handle,
            logger_join: Some(logger_join),
            signal_handler,
            start_time: Instant::now(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn store(&self) -> &SnapshotStore {
        &self.store
    }

    #[must_use]
    pub const fn state(&self) -> &StateFile {
        &self.state
    }

    /// Trigger that stops [`PolicyDaemon::run`] from another thread.
    #[must_use]
    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.signal_handler.trigger()
    }

    /// Run until a termination signal arrives. This is `cwarden daemon`.
    pub fn run(&mut self) -> Result<()> {
        if let Err(err) = self.start() {
            self.close_logger();
            return Err(err);
        }

        let stop_rx = self.signal_handler.receiver().clone();
        let ticker = tick(Duration::from_secs(self.config.daemon.tick_interval_secs));
        eprintln!(
            "[CW-DAEMON] running: tick={}s dry_run={} keep_low={} keep_high={}",
            self.config.daemon.tick_interval_secs,
            self.config.daemon.dry_run,
            self.config.policy.keep_low_usage,
            self.config.policy.keep_high_pressure,
        );

        let reason = loop {
            select! {
                recv(stop_rx) -> msg => break msg.unwrap_or(StopReason::Requested),
                recv(ticker) -> _ => {
                    // A pending stop wins over a tick that became ready at the same time.
                    if let Ok(reason) = stop_rx.try_recv() {
                        break reason;
                    }
                    self.tick();
                }
            }
        };

        self.stop(reason);
        Ok(())
    }

    // ──────────────────── starting ────────────────────

    /// Bring up host side effects. On error everything applied by this call is
    /// undone (last applied first) and the daemon ends in `Stopped`.
    pub fn start(&mut self) -> Result<()> {
        self.state.set_phase(DaemonPhase::Starting);
        warn_if_unprivileged();

        let mut applied = Vec::new();
        if let Err(err) = self.bring_up(&mut applied) {
            eprintln!("[CW-DAEMON] startup failed: {err}");
            self.roll_back(applied);
            self.logger_handle.send(ActivityEvent::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            });
            self.state.record_error(&err);
            self.state.set_phase(DaemonPhase::Stopped);
            return Err(err);
        }

        let config_hash = self.config.stable_hash().unwrap_or_default();
        self.logger_handle.send(ActivityEvent::DaemonStarted {
            version: env!("CARGO_PKG_VERSION").to_string(),
            config_hash,
        });
        self.state.set_phase(DaemonPhase::Running);
        Ok(())
    }

    fn bring_up(&mut self, applied: &mut Vec<Applied>) -> Result<()> {
        self.store.reset()?;
        eprintln!(
            "[CW-DAEMON] snapshot store reset: {}",
            self.store.path().display()
        );

        for module in &self.config.kernel.modules {
            if self.modules.load(&module.image_path, &module.name)?.applied() {
                eprintln!("[CW-DAEMON] loaded kernel module {}", module.name);
                self.logger_handle.send(ActivityEvent::ModuleLoaded {
                    name: module.name.clone(),
                    image: module.image_path.display().to_string(),
                });
                applied.push(Applied::Module(module.name.clone()));
            } else {
                eprintln!("[CW-DAEMON] kernel module {} already loaded", module.name);
            }
        }

        if self.config.cron.enabled {
            if self.cron.install()?.applied() {
                eprintln!("[CW-DAEMON] installed schedule: {}", self.cron.schedule_line());
                self.logger_handle.send(ActivityEvent::ScheduleInstalled {
                    script: self.cron.script_path().display().to_string(),
                });
                applied.push(Applied::Schedule);
            } else {
                eprintln!("[CW-DAEMON] schedule already present");
            }
        }

        require_source(&self.config.telemetry.process_source)?;
        require_source(&self.config.telemetry.container_source)?;
        Ok(())
    }

    fn roll_back(&self, applied: Vec<Applied>) {
        for effect in applied.into_iter().rev() {
            let undone = match &effect {
                Applied::Schedule => self.cron.remove().map(|_| ()),
                Applied::Module(name) => self.modules.unload(name).map(|_| ()),
            };
            match undone {
                Ok(()) => eprintln!("[CW-DAEMON] rolled back {effect:?}"),
                Err(err) => eprintln!("[CW-DAEMON] rollback of {effect:?} failed: {err}"),
            }
        }
    }

    // ──────────────────── running ────────────────────

    /// One tick: run the cycle, then account for it in the state file.
    pub fn tick(&mut self) {
        match self.run_cycle() {
            Ok(report) => {
                self.state.record_cycle_ok(report.batch_id);
                if self.config.daemon.dry_run {
                    self.state.record_would_evict(report.evicted.len() as u64);
                } else {
                    self.state.record_evictions(
                        report.evicted.len() as u64,
                        report.eviction_failures as u64,
                    );
                }
                self.state
                    .record_stopped_cleanups(report.stopped_removed as u64);
            }
            Err(err) => {
                let retryable = err.is_retryable();
                eprintln!("[CW-DAEMON] cycle failed (retryable={retryable}): {err}");
                self.logger_handle.send(ActivityEvent::CycleFailed {
                    code: err.code().to_string(),
                    message: err.to_string(),
                    retryable,
                });
                self.state.record_cycle_failed(&err);
            }
        }
        self.state
            .set_dropped_log_events(self.logger_handle.dropped_events());
        self.state.flush();
    }

    /// Telemetry capture, snapshot persistence and policy enforcement.
    ///
    /// Returns `Err` only when the snapshot could not be taken; enforcement
    /// problems are logged and reported in the [`CycleReport`].
    pub fn run_cycle(&mut self) -> Result<CycleReport> {
        let sysinfo = read_sysinfo(&self.config.telemetry.process_source)?;
        let summary = HostSummary::new(&sysinfo, self.sample_cpu());
        eprintln!("[CW-DAEMON] host: {summary}");
        self.logger_handle.send(ActivityEvent::HostSampled(summary));

        let continfo = match read_continfo(&self.config.telemetry.container_source) {
            Ok(info) => Some(info),
            Err(err) => {
                eprintln!("[CW-DAEMON] WARNING: skipping container snapshot: {err}");
                None
            }
        };

        let batch_id = self.store.create_batch()?;
        let processes = self.store.record_processes(batch_id, &sysinfo.processes)?;
        let containers = match &continfo {
            Some(info) => Some(self.store.record_containers(batch_id, &info.containers)?),
            None => None,
        };
        self.logger_handle.send(ActivityEvent::BatchRecorded {
            batch_id,
            processes,
            containers,
        });

        let mut report = CycleReport {
            batch_id,
            processes,
            containers,
            ..CycleReport::default()
        };
        self.enforce(&mut report);
        Ok(report)
    }

    fn sample_cpu(&self) -> Option<f64> {
        let window = self.config.telemetry.cpu_sample_ms;
        if window == 0 {
            return None;
        }
        match sample_cpu_percent(Path::new(PROC_STAT), Duration::from_millis(window)) {
            Ok(pct) => Some(pct),
            Err(err) => {
                eprintln!("[CW-DAEMON] WARNING: cpu sample unavailable: {err}");
                None
            }
        }
    }

    fn enforce(&self, report: &mut CycleReport) {
        report.stopped_removed = self.remove_stopped_of_interest();

        let fleet = match self.inspector.inspect() {
            Ok(fleet) => fleet,
            Err(err) => {
                self.report_error("container inspection failed", &err);
                return;
            }
        };
        if fleet.is_empty() {
            return;
        }

        let plan = self.engine.plan(&fleet);
        if plan.is_noop() {
            return;
        }

        let dry_run = self.config.daemon.dry_run;
        for scored in plan.evict {
            let id = scored.container.id.clone();
            let outcome = if dry_run {
                Ok(())
            } else {
                self.inspector
                    .stop(&id)
                    .and_then(|()| self.inspector.remove(&id))
            };
            match outcome {
                Ok(()) => {
                    eprintln!(
                        "[CW-DAEMON] {} {} ({}, {}, score={:.1})",
                        if dry_run { "would evict" } else { "evicted" },
                        id,
                        scored.container.image,
                        scored.category.as_str(),
                        scored.score,
                    );
                    self.logger_handle.send(ActivityEvent::ContainerEvicted {
                        id: id.clone(),
                        image: scored.container.image.clone(),
                        category: scored.category.as_str().to_string(),
                        score: scored.score,
                        dry_run,
                    });
                    report.evicted.push(id);
                }
                Err(err) => {
                    eprintln!("[CW-DAEMON] eviction of {id} failed: {err}");
                    self.logger_handle.send(ActivityEvent::EvictionFailed {
                        id,
                        code: err.code().to_string(),
                        message: err.to_string(),
                    });
                    report.eviction_failures += 1;
                }
            }
        }
    }

    /// Remove exited policy-managed containers. Returns how many were removed.
    fn remove_stopped_of_interest(&self) -> usize {
        let stopped = match self.inspector.list_stopped_of_interest() {
            Ok(stopped) => stopped,
            Err(err) => {
                self.report_error("listing exited containers failed", &err);
                return 0;
            }
        };
        let mut removed = 0;
        for container in stopped {
            if self.config.daemon.dry_run {
                eprintln!("[CW-DAEMON] would remove exited {}", container.id);
                continue;
            }
            match self.inspector.remove(&container.id) {
                Ok(()) => {
                    self.logger_handle.send(ActivityEvent::StoppedContainerRemoved {
                        id: container.id,
                        image: container.image,
                    });
                    removed += 1;
                }
                Err(err) => eprintln!(
                    "[CW-DAEMON] removing exited {} failed: {err}",
                    container.id
                ),
            }
        }
        removed
    }

    fn report_error(&self, what: &str, err: &CwError) {
        eprintln!("[CW-DAEMON] {what}: {err}");
        self.logger_handle.send(ActivityEvent::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        });
    }

    // ──────────────────── stopping ────────────────────

    /// Reverse-order cleanup, then `Stopped`. Every step is best-effort.
    pub fn stop(&mut self, reason: StopReason) {
        eprintln!("[CW-DAEMON] stopping ({reason})");
        self.state.set_phase(DaemonPhase::Stopping);

        let cron = &self.cron;
        let modules = &self.modules;
        let inspector = &self.inspector;
        let logger = &self.logger_handle;
        let config = &self.config;
        let mut cleaned = 0_u64;

        let mut remove_schedule = || {
            if !config.cron.enabled {
                return true;
            }
            match cron.remove() {
                Ok(change) => {
                    if change.applied() {
                        logger.send(ActivityEvent::ScheduleRemoved {
                            script: cron.script_path().display().to_string(),
                        });
                    }
                    true
                }
                Err(err) => {
                    eprintln!("[CW-SHUTDOWN] {err}");
                    false
                }
            }
        };
        let mut unload_modules = || {
            let mut ok = true;
            for module in config.kernel.modules.iter().rev() {
                match modules.unload(&module.name) {
                    Ok(change) => {
                        if change.applied() {
                            logger.send(ActivityEvent::ModuleUnloaded {
                                name: module.name.clone(),
                            });
                        }
                    }
                    Err(err) => {
                        eprintln!("[CW-SHUTDOWN] {err}");
                        ok = false;
                    }
                }
            }
            ok
        };
        let mut clean_containers = || {
            if !config.daemon.cleanup_on_shutdown || config.daemon.dry_run {
                return true;
            }
            let (removed, ok) = cleanup_managed_containers(inspector, logger);
            cleaned = removed;
            ok
        };

        let all_ok = ShutdownCoordinator::new(SHUTDOWN_TIMEOUT).execute(&mut [
            ("remove schedule", &mut remove_schedule as &mut dyn FnMut() -> bool),
            ("unload kernel modules", &mut unload_modules as &mut dyn FnMut() -> bool),
            ("clean up containers", &mut clean_containers as &mut dyn FnMut() -> bool),
        ]);
        if !all_ok {
            eprintln!("[CW-DAEMON] shutdown finished with errors");
        }
        self.state.record_stopped_cleanups(cleaned);

        let uptime_secs = self.start_time.elapsed().as_secs();
        self.logger_handle.send(ActivityEvent::DaemonStopped {
            reason: reason.to_string(),
            uptime_secs,
        });
        self.state
            .set_dropped_log_events(self.logger_handle.dropped_events());
        self.state.set_phase(DaemonPhase::Stopped);
        self.close_logger();

        eprintln!("[CW-DAEMON] shutdown complete (uptime={uptime_secs}s)");
    }

    fn close_logger(&mut self) {
        self.logger_handle.shutdown();
        let Some(join) = self.logger_join.take() else {
            return;
        };
        if join.join().is_err() {
            let err = CwError::ChannelClosed {
                component: "activity logger",
            };
            eprintln!("[CW-DAEMON] {err}");
            self.state.record_error(&err);
            self.state.flush();
        }
    }
}

/// Stop and remove running managed containers, then remove exited ones.
fn cleanup_managed_containers(
    inspector: &ContainerInspector,
    logger: &ActivityLoggerHandle,
) -> (u64, bool) {
    let mut removed = 0;
    let mut ok = true;

    match inspector.list_running() {
        Ok(running) => {
            for container in running
                .into_iter()
                .filter(|c| inspector.rules().is_of_interest(c))
            {
                match inspector
                    .stop(&container.id)
                    .and_then(|()| inspector.remove(&container.id))
                {
                    Ok(()) => removed += 1,
                    Err(err) => {
                        eprintln!("[CW-SHUTDOWN] {}: {err}", container.id);
                        ok = false;
                    }
                }
            }
        }
        Err(err) => {
            eprintln!("[CW-SHUTDOWN] {err}");
            ok = false;
        }
    }

    match inspector.list_stopped_of_interest() {
        Ok(stopped) => {
            for container in stopped {
                match inspector.remove(&container.id) {
                    Ok(()) => {
                        logger.send(ActivityEvent::StoppedContainerRemoved {
                            id: container.id,
                            image: container.image,
                        });
                        removed += 1;
                    }
                    Err(err) => {
                        eprintln!("[CW-SHUTDOWN] {}: {err}", container.id);
                        ok = false;
                    }
                }
            }
        }
        Err(err) => {
            eprintln!("[CW-SHUTDOWN] {err}");
            ok = false;
        }
    }

    (removed, ok)
}

fn require_source(path: &Path) -> Result<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(CwError::TelemetrySource {
            path: path.to_path_buf(),
            details: "not found; is the kernel module loaded?".to_string(),
        })
    }
}

#[cfg(unix)]
fn warn_if_unprivileged() {
    if !nix::unistd::geteuid().is_root() {
        eprintln!(
            "[CW-DAEMON] WARNING: not running as root; module and runtime commands rely on the privilege prefix"
        );
    }
}

#[cfg(not(unix))]
fn warn_if_unprivileged() {}
