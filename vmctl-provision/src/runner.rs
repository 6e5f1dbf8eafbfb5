//! External command execution.
//!
//! Every control-plane and disk-tool invocation goes through a
//! [`CommandRunner`]. The production runner spawns the process with tokio,
//! captures stdout and stderr separately, and enforces a deadline. Retries are
//! left to callers that know whether a command is idempotent.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};

/// Default deadline for a single external command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs external commands and returns their stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`.
    ///
    /// Fails with [`Error::ExternalCommand`] on spawn failure or non-zero exit,
    /// and with [`Error::Timeout`] when the deadline passes.
    async fn run(&self, program: &str, args: &[String]) -> Result<String>;
}

/// Runner backed by real processes.
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    #[instrument(skip(self, args), fields(command = %describe_command(program, args)))]
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let command = describe_command(program, args);
        debug!(arg_count = args.len(), "Running external command");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        // Dropping the future on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(result) => result.map_err(|e| Error::ExternalCommand {
                command: command.clone(),
                status: None,
                stderr: format!("failed to spawn: {}", e),
            })?,
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "External command timed out");
                return Err(Error::Timeout {
                    operation: command,
                    after: self.timeout,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            warn!(status = ?output.status.code(), stderr = %stderr.trim(), "External command failed");
            return Err(Error::ExternalCommand {
                command,
                status: output.status.code(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Short label for a command: the program and its first positional argument.
///
/// Full argument lists can carry guest credentials, so they never end up in
/// errors or logs.
pub fn describe_command(program: &str, args: &[String]) -> String {
    match subcommand(args) {
        Some(sub) => format!("{} {}", program, sub),
        None => program.to_string(),
    }
}

/// First positional argument, skipping `--connect <uri>`.
pub fn subcommand(args: &[String]) -> Option<&str> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--connect" || arg == "-c" {
            iter.next();
            continue;
        }
        if !arg.starts_with('-') {
            return Some(arg);
        }
    }
    None
}
