//! Lifecycle event notification.
//!
//! The pipeline reports every completed operation to an [`EventSink`].
//! Delivery is fire-and-forget: sinks must not block and cannot fail the
//! operation that produced the event.

use std::sync::Mutex;

use serde::Serialize;
use serde_json::{Map, Value};

/// Operation an event reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    Started,
    Stopped,
    PoweredOff,
    Rebooted,
    Reset,
    Paused,
    Resumed,
    CustomizationUpdated,
    GuestCommand,
    PasswordReset,
    DiskCreated,
    SnapshotCreated,
    SnapshotReverted,
    SnapshotDeleted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "vm.created",
            EventKind::Updated => "vm.updated",
            EventKind::Deleted => "vm.deleted",
            EventKind::Started => "vm.started",
            EventKind::Stopped => "vm.stopped",
            EventKind::PoweredOff => "vm.powered_off",
            EventKind::Rebooted => "vm.rebooted",
            EventKind::Reset => "vm.reset",
            EventKind::Paused => "vm.paused",
            EventKind::Resumed => "vm.resumed",
            EventKind::CustomizationUpdated => "vm.cloud_init_updated",
            EventKind::GuestCommand => "vm.guest_command",
            EventKind::PasswordReset => "vm.password_reset",
            EventKind::DiskCreated => "disk.created",
            EventKind::SnapshotCreated => "snapshot.created",
            EventKind::SnapshotReverted => "snapshot.reverted",
            EventKind::SnapshotDeleted => "snapshot.deleted",
        }
    }
}

/// A completed operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    /// VM ID, or the disk image path for standalone disks.
    pub id: String,
    pub kind: EventKind,
    pub success: bool,
    pub message: String,
    pub data: Map<String, Value>,
}

impl LifecycleEvent {
    pub fn succeeded(id: impl Into<String>, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            success: true,
            message: message.into(),
            data: Map::new(),
        }
    }

    pub fn failed(id: impl Into<String>, kind: EventKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::succeeded(id, kind, message)
        }
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Wire name, e.g. `vm.created` or `vm.created.failed`.
    pub fn event_type(&self) -> String {
        if self.success {
            self.kind.as_str().to_string()
        } else {
            format!("{}.failed", self.kind.as_str())
        }
    }
}

/// Receives lifecycle events.
pub trait EventSink: Send + Sync {
    fn notify(&self, event: LifecycleEvent);
}

/// Discards events.
#[derive(Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn notify(&self, _event: LifecycleEvent) {}
}

/// Keeps events in memory, for tests.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn types(&self) -> Vec<String> {
        self.events().iter().map(LifecycleEvent::event_type).collect()
    }
}

impl EventSink for RecordingSink {
    fn notify(&self, event: LifecycleEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        let ok = LifecycleEvent::succeeded("vm-1", EventKind::Created, "VM created");
        assert_eq!(ok.event_type(), "vm.created");

        let failed = LifecycleEvent::failed("vm-1", EventKind::Deleted, "undefine failed")
            .with_data("step", "undefine domain");
        assert_eq!(failed.event_type(), "vm.deleted.failed");
        assert_eq!(failed.data["step"], "undefine domain");
    }

    #[test]
    fn test_recording_sink() {
        let sink = RecordingSink::new();
        sink.notify(LifecycleEvent::succeeded("vm-1", EventKind::Started, "started"));
        sink.notify(LifecycleEvent::succeeded("vm-1", EventKind::Stopped, "stopped"));
        assert_eq!(sink.types(), vec!["vm.started", "vm.stopped"]);
    }
}
