//! Crontab entry for the container spawner script.
//!
//! The table is edited read-modify-write through composed shell pipelines
//! because `crontab` only accepts whole-table replacement. An absent table
//! (`crontab -l` exiting non-zero with "no crontab for user") is an empty
//! starting state, not an error.
//!
//! Duplicate detection is a plain substring match on the script path, so an
//! unrelated line that mentions the same path (a comment, or a longer path
//! sharing the prefix) also counts as installed. The path is matched both raw
//! and in the shell-quoted form the schedule line carries; the two differ once
//! the path contains a single quote.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::config::CronConfig;
use crate::core::errors::{CwError, Result};
use crate::platform::Change;
use crate::platform::command::CommandRunner;

/// Installs and removes one fixed-interval crontab line.
#[derive(Clone)]
pub struct CronManager {
    runner: Arc<dyn CommandRunner>,
    shell: String,
    crontab: String,
    script_path: PathBuf,
    log_path: PathBuf,
    interval_minutes: u32,
}

impl CronManager {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &CronConfig) -> Self {
        Self {
            runner,
            shell: config.shell.clone(),
            crontab: config.crontab_binary.clone(),
            script_path: config.script_path.clone(),
            log_path: config.log_path.clone(),
            interval_minutes: config.interval_minutes,
        }
    }

    #[must_use]
    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// The crontab line this manager owns.
    #[must_use]
    pub fn schedule_line(&self) -> String {
        let minute = if self.interval_minutes <= 1 {
            "*".to_string()
        } else {
            format!("*/{}", self.interval_minutes)
        };
        format!(
            "{minute} * * * * /bin/bash {} >> {} 2>&1",
            shell_quote(&self.script_path.to_string_lossy()),
            shell_quote(&self.log_path.to_string_lossy()),
        )
    }

    /// Current crontab contents; empty when the user has none.
    pub fn current_table(&self) -> Result<String> {
        let script = format!("{} -l 2>/dev/null || true", shell_quote(&self.crontab));
        self.runner
            .run(&self.shell, &["-c", &script])
            .map_err(|err| CwError::ScheduleRead {
                details: err.to_string(),
            })
    }

    /// Substrings identifying our entry in the table.
    fn markers(&self) -> Vec<String> {
        let raw = self.script_path.to_string_lossy().into_owned();
        let quoted = shell_quote(&raw);
        if quoted.contains(&raw) {
            vec![raw]
        } else {
            vec![raw, quoted]
        }
    }

    pub fn is_installed(&self) -> Result<bool> {
        let table = self.current_table()?;
        Ok(self.markers().iter().any(|m| table.contains(m.as_str())))
    }

    /// Append the schedule line unless the script path already appears.
    pub fn install(&self) -> Result<Change> {
        if self.is_installed()? {
            return Ok(Change::Unchanged);
        }
        let crontab = shell_quote(&self.crontab);
        let script = format!(
            "({crontab} -l 2>/dev/null; echo {}) | {crontab} -",
            shell_quote(&self.schedule_line())
        );
        self.write_table(&script)?;
        Ok(Change::Applied)
    }

    /// Drop every line mentioning the script path.
    pub fn remove(&self) -> Result<Change> {
        if !self.is_installed()? {
            return Ok(Change::Unchanged);
        }
        let crontab = shell_quote(&self.crontab);
        let patterns: Vec<String> = self
            .markers()
            .iter()
            .map(|m| format!("-e {}", shell_quote(m)))
            .collect();
        let script = format!(
            "{crontab} -l 2>/dev/null | grep -vF {} | {crontab} -",
            patterns.join(" ")
        );
        self.write_table(&script)?;
        Ok(Change::Applied)
    }

    fn write_table(&self, script: &str) -> Result<()> {
        self.runner
            .run(&self.shell, &["-c", script])
            .map(|_| ())
            .map_err(|err| CwError::ScheduleWrite {
                details: err.to_string(),
            })
    }
}

/// Single-quote `raw` for a POSIX shell unless it is made of safe characters.
#[must_use]
pub fn shell_quote(raw: &str) -> String {
    let safe = !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@%".contains(c));
    if safe {
        raw.to_string()
    } else {
        format!("'{}'", raw.replace('\'', r"'\''"))
    }
}
