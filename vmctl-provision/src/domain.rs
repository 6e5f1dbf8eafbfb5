//! Hypervisor control through `virsh`.
//!
//! [`DomainControl`] is built once at startup and shared behind an `Arc`.
//! When a connection URI is configured every call carries `--connect <uri>`.
//!
//! Each operation has a fixed failure policy (see [`ControlOp::failure_policy`]):
//! registry changes and snapshots are fatal, power transitions are
//! best-effort and only logged when they fail.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::guest::{
    self, ExecRequest, ExecStarted, ExecStatus, FileSystemInfo, GuestExecOutput, GuestInfo,
    GuestUser, HostName, NetworkInterface, OsInfo,
};
use crate::runner::CommandRunner;

/// Default deadline for a captured guest command.
pub const DEFAULT_GUEST_EXEC_TIMEOUT: Duration = Duration::from_secs(60);

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// What to do when an operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Propagate the error.
    Fatal,
    /// Log at warn and report success.
    BestEffort,
}

/// Hypervisor operations issued through `virsh`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Define,
    Undefine,
    Start,
    Shutdown,
    Destroy,
    Reboot,
    Reset,
    Suspend,
    Resume,
    SnapshotCreate,
    SnapshotRevert,
    SnapshotDelete,
}

impl ControlOp {
    /// The `virsh` subcommand for this operation.
    pub fn command(&self) -> &'static str {
        match self {
            ControlOp::Define => "define",
            ControlOp::Undefine => "undefine",
            ControlOp::Start => "start",
            ControlOp::Shutdown => "shutdown",
            ControlOp::Destroy => "destroy",
            ControlOp::Reboot => "reboot",
            ControlOp::Reset => "reset",
            ControlOp::Suspend => "suspend",
            ControlOp::Resume => "resume",
            ControlOp::SnapshotCreate => "snapshot-create-as",
            ControlOp::SnapshotRevert => "snapshot-revert",
            ControlOp::SnapshotDelete => "snapshot-delete",
        }
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        match self {
            ControlOp::Define
            | ControlOp::Undefine
            | ControlOp::SnapshotCreate
            | ControlOp::SnapshotRevert
            | ControlOp::SnapshotDelete => FailurePolicy::Fatal,
            ControlOp::Start
            | ControlOp::Shutdown
            | ControlOp::Destroy
            | ControlOp::Reboot
            | ControlOp::Reset
            | ControlOp::Suspend
            | ControlOp::Resume => FailurePolicy::BestEffort,
        }
    }
}

impl fmt::Display for ControlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

/// Domain state as reported by `virsh dominfo`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    Running,
    Idle,
    Paused,
    InShutdown,
    ShutOff,
    Crashed,
    PmSuspended,
    Other(String),
}

impl DomainState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "running" => DomainState::Running,
            "idle" | "blocked" => DomainState::Idle,
            "paused" => DomainState::Paused,
            "in shutdown" => DomainState::InShutdown,
            "shut off" => DomainState::ShutOff,
            "crashed" => DomainState::Crashed,
            "pmsuspended" => DomainState::PmSuspended,
            other => DomainState::Other(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, DomainState::Running | DomainState::Idle)
    }
}

/// Parsed status of a domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainStatus {
    /// The trimmed `State:` value.
    pub raw: String,
    pub state: DomainState,
}

/// Extract the `State:` line from `virsh dominfo` output.
pub fn parse_domain_status(vm_id: &str, output: &str) -> Result<DomainStatus> {
    output
        .lines()
        .find_map(|line| line.trim_start().strip_prefix("State:"))
        .map(|value| {
            let raw = value.trim().to_string();
            DomainStatus {
                state: DomainState::parse(&raw),
                raw,
            }
        })
        .ok_or_else(|| Error::StatusUnparsable(vm_id.to_string()))
}

/// Apply `op`'s failure policy to its result.
pub fn settle(op: ControlOp, vm_id: &str, result: Result<()>) -> Result<()> {
    match (result, op.failure_policy()) {
        (Ok(()), _) => Ok(()),
        (Err(e), FailurePolicy::Fatal) => Err(e),
        (Err(e), FailurePolicy::BestEffort) => {
            warn!(vm_id = %vm_id, operation = %op, error = %e, "Ignoring failed best-effort operation");
            Ok(())
        }
    }
}

/// `virsh` client.
pub struct DomainControl {
    runner: Arc<dyn CommandRunner>,
    program: String,
    connect_uri: Option<String>,
    exec_timeout: Duration,
    poll_interval: Duration,
}

impl DomainControl {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            program: "virsh".to_string(),
            connect_uri: None,
            exec_timeout: DEFAULT_GUEST_EXEC_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Target a specific libvirt connection, e.g. `qemu:///system`.
    pub fn with_connect_uri(mut self, uri: Option<String>) -> Self {
        self.connect_uri = uri.filter(|u| !u.is_empty());
        self
    }

    /// Bound on how long a captured guest command may run.
    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn virsh(&self, subcommand: &str, rest: &[&str]) -> Result<String> {
        let mut args = Vec::with_capacity(rest.len() + 3);
        if let Some(uri) = &self.connect_uri {
            args.push("--connect".to_string());
            args.push(uri.clone());
        }
        args.push(subcommand.to_string());
        args.extend(rest.iter().map(|s| s.to_string()));
        self.runner.run(&self.program, &args).await
    }

    async fn dispatch(&self, op: ControlOp, vm_id: &str, rest: &[&str]) -> Result<()> {
        let mut args = vec![vm_id];
        args.extend_from_slice(rest);
        let result = self.virsh(op.command(), &args).await.map(|_| ());
        settle(op, vm_id, result)
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Register the domain described by the XML document at `path`.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn define(&self, path: &Path) -> Result<()> {
        let path = path.display().to_string();
        let result = self.virsh(ControlOp::Define.command(), &[&path]).await.map(|_| ());
        settle(ControlOp::Define, &path, result)?;
        info!("Domain defined");
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn undefine(&self, vm_id: &str) -> Result<()> {
        self.dispatch(ControlOp::Undefine, vm_id, &[]).await?;
        info!("Domain undefined");
        Ok(())
    }

    // =========================================================================
    // Power
    // =========================================================================

    /// Run a power transition. Failures are logged, never returned.
    #[instrument(skip(self), fields(vm_id = %vm_id, operation = %op))]
    pub async fn power(&self, op: ControlOp, vm_id: &str) -> Result<()> {
        self.dispatch(op, vm_id, &[]).await?;
        debug!("Power operation dispatched");
        Ok(())
    }

    pub async fn start(&self, vm_id: &str) -> Result<()> {
        self.power(ControlOp::Start, vm_id).await
    }

    /// Graceful ACPI shutdown.
    pub async fn shutdown(&self, vm_id: &str) -> Result<()> {
        self.power(ControlOp::Shutdown, vm_id).await
    }

    /// Hard power-off.
    pub async fn destroy(&self, vm_id: &str) -> Result<()> {
        self.power(ControlOp::Destroy, vm_id).await
    }

    pub async fn reboot(&self, vm_id: &str) -> Result<()> {
        self.power(ControlOp::Reboot, vm_id).await
    }

    pub async fn reset(&self, vm_id: &str) -> Result<()> {
        self.power(ControlOp::Reset, vm_id).await
    }

    pub async fn suspend(&self, vm_id: &str) -> Result<()> {
        self.power(ControlOp::Suspend, vm_id).await
    }

    pub async fn resume(&self, vm_id: &str) -> Result<()> {
        self.power(ControlOp::Resume, vm_id).await
    }

    // =========================================================================
    // Status
    // =========================================================================

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn status(&self, vm_id: &str) -> Result<DomainStatus> {
        let output = self.virsh("dominfo", &[vm_id]).await?;
        parse_domain_status(vm_id, &output)
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn snapshot_create(&self, vm_id: &str, name: &str, quiesce: bool) -> Result<()> {
        let mut rest = vec![name];
        if quiesce {
            rest.push("--quiesce");
        }
        self.dispatch(ControlOp::SnapshotCreate, vm_id, &rest).await?;
        info!(snapshot = %name, "Snapshot created");
        Ok(())
    }

    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn snapshot_revert(&self, vm_id: &str, name: &str) -> Result<()> {
        self.dispatch(ControlOp::SnapshotRevert, vm_id, &[name]).await?;
        info!(snapshot = %name, "Reverted to snapshot");
        Ok(())
    }

    /// Drop a snapshot's metadata, keeping disk changes made since.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn snapshot_delete(&self, vm_id: &str, name: &str) -> Result<()> {
        self.dispatch(ControlOp::SnapshotDelete, vm_id, &[name, "--metadata"])
            .await?;
        info!(snapshot = %name, "Snapshot deleted");
        Ok(())
    }

    // =========================================================================
    // Guest agent
    // =========================================================================

    async fn agent(&self, vm_id: &str, execute: &str, arguments: Option<Value>) -> Result<String> {
        let envelope = guest::envelope(execute, arguments)?;
        self.virsh("qemu-agent-command", &[vm_id, &envelope]).await
    }

    /// Check that the guest agent answers.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn guest_ping(&self, vm_id: &str) -> Result<()> {
        self.agent(vm_id, "guest-ping", None).await?;
        Ok(())
    }

    /// Run `request` in the guest.
    ///
    /// Without output capture this returns as soon as the process is
    /// spawned. With capture it polls `guest-exec-status` until the process
    /// exits or the exec timeout passes.
    #[instrument(skip(self, request), fields(vm_id = %vm_id, path = %request.path))]
    pub async fn guest_exec(&self, vm_id: &str, request: &ExecRequest) -> Result<GuestExecOutput> {
        let arguments = serde_json::to_value(request)?;
        let reply = self.agent(vm_id, "guest-exec", Some(arguments)).await?;
        let started: ExecStarted = guest::parse_return(&reply)?;
        debug!(pid = started.pid, "Guest process started");

        if !request.capture_output {
            return Ok(GuestExecOutput {
                pid: started.pid,
                ..Default::default()
            });
        }

        let status = tokio::time::timeout(self.exec_timeout, self.wait_for_exit(vm_id, started.pid))
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("guest command '{}'", request.path),
                after: self.exec_timeout,
            })??;

        if status.out_truncated || status.err_truncated {
            warn!(pid = started.pid, "Guest command output was truncated");
        }
        GuestExecOutput::from_status(started.pid, status)
    }

    async fn wait_for_exit(&self, vm_id: &str, pid: i64) -> Result<ExecStatus> {
        loop {
            let reply = self
                .agent(vm_id, "guest-exec-status", Some(json!({ "pid": pid })))
                .await?;
            let status: ExecStatus = guest::parse_return(&reply)?;
            if status.exited {
                return Ok(status);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn guest_hostname(&self, vm_id: &str) -> Result<String> {
        let reply = self.agent(vm_id, "guest-get-host-name", None).await?;
        let name: HostName = guest::parse_return(&reply)?;
        Ok(name.host_name)
    }

    pub async fn guest_os_info(&self, vm_id: &str) -> Result<OsInfo> {
        let reply = self.agent(vm_id, "guest-get-osinfo", None).await?;
        guest::parse_return(&reply)
    }

    pub async fn guest_filesystems(&self, vm_id: &str) -> Result<Vec<FileSystemInfo>> {
        let reply = self.agent(vm_id, "guest-get-fsinfo", None).await?;
        guest::parse_return(&reply)
    }

    pub async fn guest_interfaces(&self, vm_id: &str) -> Result<Vec<NetworkInterface>> {
        let reply = self.agent(vm_id, "guest-network-get-interfaces", None).await?;
        guest::parse_return(&reply)
    }

    pub async fn guest_time(&self, vm_id: &str) -> Result<chrono::DateTime<chrono::Utc>> {
        let reply = self.agent(vm_id, "guest-get-time", None).await?;
        let nanos: i64 = guest::parse_return(&reply)?;
        Ok(guest::guest_time(nanos))
    }

    pub async fn guest_users(&self, vm_id: &str) -> Result<Vec<GuestUser>> {
        let reply = self.agent(vm_id, "guest-get-users", None).await?;
        guest::parse_return(&reply)
    }

    /// Collect every introspection field, leaving out the ones that fail.
    #[instrument(skip(self), fields(vm_id = %vm_id))]
    pub async fn guest_info(&self, vm_id: &str) -> GuestInfo {
        fn keep<T>(field: &str, result: Result<T>) -> Option<T> {
            match result {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!(field, error = %e, "Guest field unavailable");
                    None
                }
            }
        }

        let (hostname, os, filesystems, interfaces, time, users) = tokio::join!(
            self.guest_hostname(vm_id),
            self.guest_os_info(vm_id),
            self.guest_filesystems(vm_id),
            self.guest_interfaces(vm_id),
            self.guest_time(vm_id),
            self.guest_users(vm_id),
        );

        GuestInfo {
            hostname: keep("hostname", hostname),
            os: keep("os", os),
            filesystems: keep("filesystems", filesystems),
            interfaces: keep("interfaces", interfaces),
            time: keep("time", time),
            users: keep("users", users),
        }
    }
}
