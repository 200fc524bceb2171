//! Idempotent kernel module lifecycle (`lsmod` / `insmod` / `rmmod`).
//!
//! The daemon may be restarted without a clean shutdown, so both directions
//! consult the live module list first and treat "already there" / "already
//! gone" as success. A failing list query is never read as "not loaded".

use std::path::Path;
use std::sync::Arc;

use crate::core::config::KernelConfig;
use crate::core::errors::{CwError, Result};
use crate::platform::Change;
use crate::platform::command::{CommandRunner, with_privilege};

/// Loads and unloads named kernel modules through the configured binaries.
#[derive(Clone)]
pub struct ModuleManager {
    runner: Arc<dyn CommandRunner>,
    privilege_command: String,
    lsmod: String,
    insmod: String,
    rmmod: String,
}

impl ModuleManager {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &KernelConfig) -> Self {
        Self {
            runner,
            privilege_command: config.privilege_command.clone(),
            lsmod: config.lsmod_binary.clone(),
            insmod: config.insmod_binary.clone(),
            rmmod: config.rmmod_binary.clone(),
        }
    }

    /// Whether `name` appears as an exact module name in the live list.
    pub fn is_loaded(&self, name: &str) -> Result<bool> {
        let listing = self
            .runner
            .run(&self.lsmod, &[])
            .map_err(|err| CwError::ModuleQuery {
                details: err.to_string(),
            })?;
        Ok(listing_contains(&listing, name))
    }

    /// Load the module image unless `name` is already active.
    pub fn load(&self, image_path: &Path, name: &str) -> Result<Change> {
        if self.is_loaded(name)? {
            return Ok(Change::Unchanged);
        }
        let image = image_path.to_string_lossy();
        let (program, args) = with_privilege(&self.privilege_command, &self.insmod, &[&image]);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner
            .run(&program, &args)
            .map_err(|err| CwError::ModuleLoad {
                name: name.to_string(),
                image: image_path.to_path_buf(),
                details: err.to_string(),
            })?;
        Ok(Change::Applied)
    }

    /// Unload `name` unless it is already inactive.
    pub fn unload(&self, name: &str) -> Result<Change> {
        if !self.is_loaded(name)? {
            return Ok(Change::Unchanged);
        }
        let (program, args) = with_privilege(&self.privilege_command, &self.rmmod, &[name]);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner
            .run(&program, &args)
            .map_err(|err| CwError::ModuleUnload {
                name: name.to_string(),
                details: err.to_string(),
            })?;
        Ok(Change::Applied)
    }
}

/// `lsmod` prints a `Module Size Used by` header followed by one module per line.
fn listing_contains(listing: &str, name: &str) -> bool {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|first| first == name)
}
