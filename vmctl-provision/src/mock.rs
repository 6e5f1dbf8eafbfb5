//! Scripted doubles for testing and development.
//!
//! [`MockRunner`] stands in for `virsh`, `qemu-img` and `genisoimage`: it
//! records every invocation and answers from a list of rules. [`MockFetcher`]
//! serves template bodies from memory and counts downloads.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::cache::Fetcher;
use crate::error::{Error, Result};
use crate::runner::{describe_command, subcommand, CommandRunner};

/// Canned answer for a mocked command.
#[derive(Debug, Clone)]
pub enum MockResponse {
    /// Exit 0 with this stdout.
    Output(String),
    /// Non-zero exit.
    Failure { status: i32, stderr: String },
    /// Deadline exceeded.
    Timeout,
}

impl MockResponse {
    pub fn output(stdout: impl Into<String>) -> Self {
        MockResponse::Output(stdout.into())
    }

    pub fn failure(stderr: impl Into<String>) -> Self {
        MockResponse::Failure {
            status: 1,
            stderr: stderr.into(),
        }
    }
}

/// A recorded command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// First positional argument, e.g. `define` for `virsh define x.xml`.
    pub fn subcommand(&self) -> Option<&str> {
        subcommand(&self.args)
    }

    /// Whether any argument contains `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a.contains(needle))
    }
}

struct Rule {
    program: String,
    subcommand: String,
    needle: Option<String>,
    once: bool,
    response: MockResponse,
}

impl Rule {
    fn matches(&self, invocation: &Invocation) -> bool {
        self.program == invocation.program
            && invocation.subcommand() == Some(self.subcommand.as_str())
            && self.needle.as_deref().map_or(true, |n| invocation.mentions(n))
    }
}

/// Command runner that answers from rules instead of spawning processes.
///
/// Rules added later take precedence. Unmatched commands succeed with empty
/// output.
#[derive(Default)]
pub struct MockRunner {
    rules: Mutex<Vec<Rule>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, rule: Rule) {
        self.rules.lock().unwrap_or_else(|e| e.into_inner()).push(rule);
    }

    /// Answer every `program subcommand …` call with `response`.
    pub fn respond(&self, program: &str, subcommand: &str, response: MockResponse) {
        self.push(Rule {
            program: program.to_string(),
            subcommand: subcommand.to_string(),
            needle: None,
            once: false,
            response,
        });
    }

    /// Like [`respond`](Self::respond), restricted to calls with an argument
    /// containing `needle`.
    pub fn respond_matching(
        &self,
        program: &str,
        subcommand: &str,
        needle: &str,
        response: MockResponse,
    ) {
        self.push(Rule {
            program: program.to_string(),
            subcommand: subcommand.to_string(),
            needle: Some(needle.to_string()),
            once: false,
            response,
        });
    }

    /// A matching rule that is consumed by its first use.
    pub fn respond_once(
        &self,
        program: &str,
        subcommand: &str,
        needle: &str,
        response: MockResponse,
    ) {
        self.push(Rule {
            program: program.to_string(),
            subcommand: subcommand.to_string(),
            needle: Some(needle.to_string()),
            once: true,
            response,
        });
    }

    /// Every command run so far, in order.
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Subcommands issued to `program`, in order.
    pub fn subcommands(&self, program: &str) -> Vec<String> {
        self.invocations()
            .iter()
            .filter(|i| i.program == program)
            .filter_map(|i| i.subcommand().map(str::to_string))
            .collect()
    }

    /// Calls to `program subcommand`.
    pub fn calls_to(&self, program: &str, subcommand: &str) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|i| i.program == program && i.subcommand() == Some(subcommand))
            .collect()
    }

    fn answer(&self, invocation: &Invocation) -> MockResponse {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        let hit = rules.iter().rposition(|r| r.matches(invocation));
        match hit {
            Some(index) if rules[index].once => rules.remove(index).response,
            Some(index) => rules[index].response.clone(),
            None => MockResponse::Output(String::new()),
        }
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let invocation = Invocation {
            program: program.to_string(),
            args: args.to_vec(),
        };
        debug!(command = %describe_command(program, args), "Mock command");

        let response = self.answer(&invocation);
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(invocation);

        match response {
            MockResponse::Output(stdout) => Ok(stdout),
            MockResponse::Failure { status, stderr } => Err(Error::ExternalCommand {
                command: describe_command(program, args),
                status: Some(status),
                stderr,
            }),
            MockResponse::Timeout => Err(Error::Timeout {
                operation: describe_command(program, args),
                after: Duration::ZERO,
            }),
        }
    }
}

/// In-memory template source.
#[derive(Default)]
pub struct MockFetcher {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every fetch for `delay` before writing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Serve `body` for `locator`, replacing any earlier body.
    pub fn serve(&self, locator: &str, body: Vec<u8>) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(locator);
        self.bodies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(locator.to_string(), body);
    }

    /// Make fetches of `locator` fail midway.
    pub fn fail(&self, locator: &str) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(locator.to_string());
    }

    /// Number of fetches attempted.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, locator: &str, destination: &Path) -> Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failing = self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(locator);
        if failing {
            // Leave a truncated file behind, like a dropped connection would.
            let _ = tokio::fs::write(destination, b"partial").await;
            return Err(Error::DownloadFailed {
                locator: locator.to_string(),
                reason: "connection reset".to_string(),
            });
        }

        let body = self
            .bodies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(locator)
            .cloned();
        let body = body.ok_or_else(|| Error::DownloadFailed {
            locator: locator.to_string(),
            reason: "server returned 404 Not Found".to_string(),
        })?;

        tokio::fs::write(destination, &body)
            .await
            .map_err(|e| Error::io(format!("Failed to write '{}'", destination.display()), e))?;
        Ok(body.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_later_rules_win_and_once_rules_are_consumed() {
        let runner = MockRunner::new();
        runner.respond("virsh", "dominfo", MockResponse::output("State: running"));
        runner.respond_once("virsh", "dominfo", "vm-1", MockResponse::output("State: paused"));

        let call = args(&["dominfo", "vm-1"]);
        assert_eq!(runner.run("virsh", &call).await.unwrap(), "State: paused");
        assert_eq!(runner.run("virsh", &call).await.unwrap(), "State: running");
        assert_eq!(runner.subcommands("virsh"), vec!["dominfo", "dominfo"]);
    }

    #[tokio::test]
    async fn test_failure_response() {
        let runner = MockRunner::new();
        runner.respond("virsh", "undefine", MockResponse::failure("domain not found"));

        let err = runner
            .run("virsh", &args(&["--connect", "qemu:///system", "undefine", "vm-1"]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExternalCommand { status: Some(1), .. }));
        assert_eq!(runner.calls_to("virsh", "undefine").len(), 1);
    }
}
