//! Termination handling: SIGINT/SIGTERM forwarded into a channel the daemon
//! loop selects on, plus the ordered shutdown task runner.

#![allow(missing_docs)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};

// ──────────────────── signal handler ────────────────────

/// Why the loop was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Interrupt,
    Terminate,
    Requested,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Requested => "requested",
        })
    }
}

/// Delivers at most one pending [`StopReason`] on a dedicated channel.
///
/// A forwarding thread turns OS signals into channel messages so the daemon
/// can `select!` on termination alongside its tick timer. Registration is
/// best-effort: on failure only [`SignalHandler::request_shutdown`] works.
pub struct SignalHandler {
    tx: Sender<StopReason>,
    rx: Receiver<StopReason>,
    requested: Arc<AtomicBool>,
    hook: Option<Handle>,
}

impl SignalHandler {
    pub fn new() -> Self {
        let mut handler = Self::detached();
        match Signals::new([SIGINT, SIGTERM]) {
            Ok(mut signals) => {
                handler.hook = Some(signals.handle());
                let tx = handler.tx.clone();
                let requested = Arc::clone(&handler.requested);
                let spawned = thread::Builder::new()
                    .name("cw-signals".to_string())
                    .spawn(move || {
                        for signal in signals.forever() {
                            let reason = if signal == SIGINT {
                                StopReason::Interrupt
                            } else {
                                StopReason::Terminate
                            };
                            requested.store(true, Ordering::SeqCst);
                            // A full channel already holds a pending stop.
                            let _ = tx.try_send(reason);
                        }
                    });
                if let Err(err) = spawned {
                    eprintln!("[CW-SIGNAL] failed to spawn signal thread: {err}");
                }
            }
            Err(err) => eprintln!("[CW-SIGNAL] failed to register SIGINT/SIGTERM: {err}"),
        }
        handler
    }

    /// Handler with no OS registration, for tests and embedding.
    #[must_use]
    pub fn detached() -> Self {
        let (tx, rx) = bounded(1);
        Self {
            tx,
            rx,
            requested: Arc::new(AtomicBool::new(false)),
            hook: None,
        }
    }

    /// Channel that yields once a stop is pending.
    #[must_use]
    pub fn receiver(&self) -> &Receiver<StopReason> {
        &self.rx
    }

    pub fn should_shutdown(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let _ = self.tx.try_send(StopReason::Requested);
    }

    /// Cloneable trigger usable from other threads.
    #[must_use]
    pub fn trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger {
            tx: self.tx.clone(),
            requested: Arc::clone(&self.requested),
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        if let Some(hook) = self.hook.take() {
            hook.close();
        }
    }
}

#[derive(Clone)]
pub struct ShutdownTrigger {
    tx: Sender<StopReason>,
    requested: Arc<AtomicBool>,
}

impl ShutdownTrigger {
    pub fn fire(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let _ = self.tx.try_send(StopReason::Requested);
    }
}

// ──────────────────── shutdown coordinator ────────────────────

/// Runs named cleanup tasks in order, each best-effort, under a deadline.
pub struct ShutdownCoordinator {
    pub timeout: Duration,
}

impl ShutdownCoordinator {
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Returns `true` when every task ran and reported success in time.
    pub fn execute(&self, tasks: &mut [(&str, &mut dyn FnMut() -> bool)]) -> bool {
        let start = Instant::now();
        let mut all_ok = true;
        for (name, task) in tasks.iter_mut() {
            if start.elapsed() > self.timeout {
                eprintln!("[CW-SHUTDOWN] timeout reached, skipping {name} and later tasks");
                return false;
            }
            if task() {
                eprintln!("[CW-SHUTDOWN] {name}: ok");
            } else {
                eprintln!("[CW-SHUTDOWN] {name}: failed");
                all_ok = false;
            }
        }
        all_ok
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}
