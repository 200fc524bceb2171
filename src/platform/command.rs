//! External command execution with captured output.
//!
//! Every host side effect (container runtime, kernel module loader, crontab)
//! goes through [`CommandRunner`] so the parsing and policy code can be driven
//! by a scripted runner in tests.

use std::path::PathBuf;
use std::process::Command;

use crate::core::errors::{CwError, Result};

/// Captured result of one external process invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful exit with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed exit with the given code and stderr.
    #[must_use]
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout followed by stderr, for diagnostics.
    #[must_use]
    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", err) => err.to_string(),
            (out, "") => out.to_string(),
            (out, err) => format!("{out}\n{err}"),
        }
    }
}

/// Runs external programs. Implementations must not interpret output.
pub trait CommandRunner: Send + Sync {
    /// Spawn `program args...`, wait for it, and capture both streams.
    ///
    /// Only a failure to spawn is an error here; a non-zero exit is reported
    /// through [`CommandOutput::status`].
    fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run and return trimmed stdout, or [`CwError::CommandFailed`] carrying
    /// the invocation and captured stderr on non-zero exit.
    fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let output = self.output(program, args)?;
        if output.success() {
            return Ok(output.stdout.trim().to_string());
        }
        let stderr = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        Err(CwError::CommandFailed {
            program: program.to_string(),
            args: args.iter().map(|arg| (*arg).to_string()).collect(),
            status: output.status,
            stderr,
        })
    }
}

/// [`CommandRunner`] backed by `std::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn output(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| CwError::Io {
                path: PathBuf::from(program),
                source,
            })?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Split a configured privilege prefix (e.g. `sudo` or `sudo -n`) in front of
/// a command line. An empty prefix runs the program directly.
#[must_use]
pub fn with_privilege(prefix: &str, program: &str, args: &[&str]) -> (String, Vec<String>) {
    let mut words = prefix.split_whitespace();
    let Some(head) = words.next() else {
        return (
            program.to_string(),
            args.iter().map(|arg| (*arg).to_string()).collect(),
        );
    };
    let mut full_args: Vec<String> = words.map(str::to_string).collect();
    full_args.push(program.to_string());
    full_args.extend(args.iter().map(|arg| (*arg).to_string()));
    (head.to_string(), full_args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_returns_trimmed_stdout() {
        let out = SystemCommandRunner
            .run("sh", &["-c", "printf '  hello \\n'"])
            .expect("sh should run");
        assert_eq!(out, "hello");
    }

    #[test]
    fn run_reports_stderr_on_failure() {
        let err = SystemCommandRunner
            .run("sh", &["-c", "echo boom >&2; exit 3"])
            .expect_err("non-zero exit must fail");
        match err {
            CwError::CommandFailed {
                program,
                args,
                status,
                stderr,
            } => {
                assert_eq!(program, "sh");
                assert_eq!(args.len(), 2);
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_program_is_io_error() {
        let err = SystemCommandRunner
            .output("cwarden-definitely-not-a-binary", &[])
            .expect_err("spawn must fail");
        assert_eq!(err.code(), "CW-3002");
    }

    #[test]
    fn combined_joins_streams() {
        let out = CommandOutput {
            status: Some(1),
            stdout: "out\n".to_string(),
            stderr: "err\n".to_string(),
        };
        assert_eq!(out.combined(), "out\nerr");
        assert_eq!(CommandOutput::failed(1, "only err").combined(), "only err");
    }

    #[test]
    fn privilege_prefix_is_split() {
        let (program, args) = with_privilege("sudo -n", "insmod", &["/tmp/a.ko"]);
        assert_eq!(program, "sudo");
        assert_eq!(args, vec!["-n", "insmod", "/tmp/a.ko"]);

        let (program, args) = with_privilege("  ", "rmmod", &["sysinfo"]);
        assert_eq!(program, "rmmod");
        assert_eq!(args, vec!["sysinfo"]);
    }
}
