//! Companion error taxonomy.
//!
//! Every failure the core can surface is one variant of [`CompanionError`].
//! Remote failures are classified exactly once, in
//! [`CompanionError::from_status`], so the retry loop dispatches on a tag
//! instead of inspecting message text.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tonic::{Code, Status};
use xctl_common::Platform;

use crate::state::SupervisorState;

/// Result type for companion operations.
pub type CompanionResult<T> = std::result::Result<T, CompanionError>;

/// Remediation steps shown when the companion binary cannot be found.
pub const REMEDIATION: &str = "Install it with `brew install facebook/fb/idb-companion`, \
set IDB_COMPANION_PATH to the binary, or pass an explicit binary path";

#[derive(Debug, Error)]
pub enum CompanionError {
    /// The companion only runs on one OS family.
    #[error("Unsupported platform: companion requires {required}, host is {actual}")]
    UnsupportedPlatform { required: Platform, actual: Platform },

    #[error("Companion binary not found: {reason} (searched: {paths}). {hint}", paths = display_paths(.searched), hint = REMEDIATION)]
    BinaryNotFound {
        reason: String,
        searched: Vec<PathBuf>,
    },

    #[error("Companion already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("Companion supervisor has been disposed")]
    Disposed,

    #[error("No target configured for the companion")]
    MissingTarget,

    #[error("Invalid supervisor transition: {from} -> {to}")]
    InvalidTransition {
        from: SupervisorState,
        to: SupervisorState,
    },

    #[error("Failed to spawn companion '{}': {source}", .path.display())]
    SpawnFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No port announcement arrived in time. The caller may retry.
    #[error("Companion did not announce a port within {timeout:?}; stderr: {stderr}")]
    StartupTimeout { timeout: Duration, stderr: String },

    /// The companion closed its output before announcing a port.
    #[error("Companion exited during startup ({status}); stderr: {stderr}")]
    ExitedDuringStartup { status: String, stderr: String },

    #[error("Invalid companion endpoint: {reason}")]
    InvalidEndpoint { reason: String },

    #[error("{operation} cancelled")]
    Cancelled { operation: String },

    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// The channel is unusable and must be rebuilt.
    #[error("{operation}: transport corrupted after {attempts} attempt(s): {message}")]
    TransportCorruption {
        operation: String,
        attempts: u32,
        message: String,
    },

    /// A stream failed after payload had already been sent.
    #[error("{operation}: stream interrupted after {bytes_sent} bytes: {status}")]
    StreamInterrupted {
        operation: String,
        bytes_sent: u64,
        status: Status,
    },

    /// Any other remote failure, carried unchanged.
    #[error("{operation} failed: {status}")]
    Rpc {
        operation: String,
        #[source]
        status: Status,
    },

    #[error("Companion session or channel is closed")]
    Closed,
}

impl CompanionError {
    pub fn binary_not_found(reason: impl Into<String>, searched: Vec<PathBuf>) -> Self {
        Self::BinaryNotFound {
            reason: reason.into(),
            searched,
        }
    }

    pub fn startup_timeout(timeout: Duration, stderr: impl Into<String>) -> Self {
        Self::StartupTimeout {
            timeout,
            stderr: stderr.into(),
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Classifies a remote status.
    ///
    /// An `Internal` status whose message names an HTTP/2 protocol
    /// violation means the channel is corrupted; everything else is an
    /// ordinary remote error and keeps its original status.
    pub fn from_status(operation: impl Into<String>, status: Status) -> Self {
        let operation = operation.into();
        if is_protocol_violation(&status) {
            Self::TransportCorruption {
                operation,
                attempts: 1,
                message: status.message().to_string(),
            }
        } else {
            Self::Rpc { operation, status }
        }
    }

    pub fn is_transport_corruption(&self) -> bool {
        matches!(self, Self::TransportCorruption { .. })
    }

    /// Startup failures the caller may retry after inspecting diagnostics.
    pub fn is_retryable_startup(&self) -> bool {
        matches!(
            self,
            Self::StartupTimeout { .. } | Self::ExitedDuringStartup { .. }
        )
    }

    /// Records how many attempts a corrupted call consumed.
    pub(crate) fn with_attempts(self, total: u32) -> Self {
        match self {
            Self::TransportCorruption {
                operation, message, ..
            } => Self::TransportCorruption {
                operation,
                attempts: total,
                message,
            },
            other => other,
        }
    }
}

fn is_protocol_violation(status: &Status) -> bool {
    if status.code() != Code::Internal {
        return false;
    }
    let message = status.message().to_ascii_lowercase();
    message.contains("protocol_error") || message.contains("protocol error")
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "nothing".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
