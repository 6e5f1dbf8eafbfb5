//! Error types for the provisioning layer.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while provisioning or controlling a VM.
#[derive(Error, Debug)]
pub enum Error {
    /// A required input field is missing or malformed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A filesystem path exists but is not of the expected type.
    #[error("Path '{}' exists but is not a directory", .0.display())]
    PathConflict(PathBuf),

    /// An expected directory, file or domain is absent.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Template image could not be fetched.
    #[error("Failed to download '{locator}': {reason}")]
    DownloadFailed { locator: String, reason: String },

    /// File permissions could not be applied.
    #[error("Failed to set permissions on '{}': {source}", .path.display())]
    PermissionError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An external command could not be spawned or exited unsuccessfully.
    #[error("Command `{command}` failed ({}): {}", describe_exit(.status), .stderr.trim())]
    ExternalCommand {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// Domain status output had no `State:` field.
    #[error("Domain status for '{0}' could not be parsed")]
    StatusUnparsable(String),

    /// A bounded operation exceeded its deadline.
    #[error("{operation} timed out after {}s", .after.as_secs())]
    Timeout { operation: String, after: Duration },

    /// Local I/O failure.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON encoding/decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A pipeline step failed.
    #[error("{step} failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },
}

/// Stable classification of an [`Error`], safe to hand to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    PathConflict,
    NotFound,
    DownloadFailed,
    PermissionError,
    ExternalCommand,
    StatusUnparsable,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::PathConflict => "path_conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::DownloadFailed => "download_failed",
            ErrorKind::PermissionError => "permission_error",
            ErrorKind::ExternalCommand => "external_command_error",
            ErrorKind::StatusUnparsable => "status_unparsable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Build an I/O error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    /// Classify this error, looking through step wrappers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::PathConflict(_) => ErrorKind::PathConflict,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::DownloadFailed { .. } => ErrorKind::DownloadFailed,
            Error::PermissionError { .. } => ErrorKind::PermissionError,
            Error::ExternalCommand { .. } => ErrorKind::ExternalCommand,
            Error::StatusUnparsable(_) => ErrorKind::StatusUnparsable,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Io { .. } | Error::Serialization(_) => ErrorKind::Internal,
            Error::Step { source, .. } => source.kind(),
        }
    }

    /// The innermost error, skipping step wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Step { source, .. } => source.root(),
            other => other,
        }
    }

    /// Message suitable for untrusted callers.
    ///
    /// Captured stderr of external commands is only included when
    /// `expose_command_output` is set.
    pub fn public_message(&self, expose_command_output: bool) -> String {
        match self {
            Error::ExternalCommand { command, status, .. } if !expose_command_output => {
                format!("Command `{}` failed ({})", command, describe_exit(status))
            }
            Error::Step { step, source } => {
                format!("{} failed: {}", step, source.public_message(expose_command_output))
            }
            other => other.to_string(),
        }
    }
}

fn describe_exit(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit code {}", code),
        None => "no exit code".to_string(),
    }
}

/// Attach a pipeline step name to a failure.
pub trait StepExt<T> {
    fn step(self, step: &'static str) -> Result<T>;
}

impl<T> StepExt<T> for Result<T> {
    fn step(self, step: &'static str) -> Result<T> {
        self.map_err(|e| Error::Step {
            step,
            source: Box::new(e),
        })
    }
}

/// Result type alias for provisioning operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn command_failure() -> Error {
        Error::ExternalCommand {
            command: "virsh define".to_string(),
            status: Some(1),
            stderr: "error: secret libvirt detail\n".to_string(),
        }
    }

    #[test]
    fn test_kind_looks_through_steps() {
        let err: Result<()> = Err(Error::NotFound("vm-1".to_string()));
        let err = err.step("define domain").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(matches!(err.root(), Error::NotFound(_)));
        assert_eq!(err.to_string(), "define domain failed: Not found: vm-1");
    }

    #[test]
    fn test_public_message_hides_stderr() {
        let err = command_failure();
        assert!(err.to_string().contains("secret libvirt detail"));

        let public = err.public_message(false);
        assert_eq!(public, "Command `virsh define` failed (exit code 1)");

        let exposed = err.public_message(true);
        assert!(exposed.contains("secret libvirt detail"));
    }

    #[test]
    fn test_public_message_hides_stderr_inside_step() {
        let err: Result<()> = Err(command_failure());
        let err = err.step("define domain").unwrap_err();
        assert!(!err.public_message(false).contains("secret"));
        assert_eq!(err.kind(), ErrorKind::ExternalCommand);
    }

    #[test]
    fn test_kind_strings_are_stable() {
        assert_eq!(ErrorKind::PathConflict.as_str(), "path_conflict");
        assert_eq!(ErrorKind::StatusUnparsable.to_string(), "status_unparsable");
    }
}
