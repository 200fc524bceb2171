//! Host side effects: external command execution, kernel module lifecycle,
//! and the periodic spawner job in the user's crontab.

pub mod command;
pub mod cron;
pub mod kmod;
#[cfg(test)]
pub(crate) mod testing;

/// Outcome of an idempotent host operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// The operation modified host state.
    Applied,
    /// Host state already matched; nothing was run.
    Unchanged,
}

impl Change {
    #[must_use]
    pub const fn applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}
