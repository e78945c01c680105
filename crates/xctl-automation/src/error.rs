//! Automation error types.

use std::path::PathBuf;
use thiserror::Error;
use xctl_companion::CompanionError;

pub type AutomationResult<T> = std::result::Result<T, AutomationError>;

#[derive(Debug, Error)]
pub enum AutomationError {
    /// Anything the companion core surfaced, unchanged.
    #[error(transparent)]
    Companion(#[from] CompanionError),

    /// Screenshot retries were exhausted and the out-of-band capture also
    /// failed.
    #[error("Screenshot fallback failed ({fallback}) after: {original}")]
    FallbackFailed {
        original: CompanionError,
        fallback: xctl_common::Error,
    },

    #[error("Failed to read '{}': {source}", .path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Install rejected: {reason}")]
    InstallRejected { reason: String },
}

impl AutomationError {
    pub fn read_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::ReadFile {
            path: path.into(),
            source,
        }
    }

    /// The companion error behind this failure, if any.
    pub fn companion(&self) -> Option<&CompanionError> {
        match self {
            Self::Companion(e) => Some(e),
            Self::FallbackFailed { original, .. } => Some(original),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_companion_errors_pass_through() {
        let err: AutomationError = CompanionError::Closed.into();
        assert_eq!(err.to_string(), CompanionError::Closed.to_string());
        assert!(matches!(err.companion(), Some(CompanionError::Closed)));
    }

    #[test]
    fn test_fallback_failure_keeps_original() {
        let err = AutomationError::FallbackFailed {
            original: CompanionError::from_status(
                "screenshot",
                tonic::Status::internal("protocol error"),
            ),
            fallback: xctl_common::Error::external_tool("xcrun", "exit status 1"),
        };
        assert!(err.companion().unwrap().is_transport_corruption());
        assert!(err.to_string().contains("xcrun"));
    }
}
