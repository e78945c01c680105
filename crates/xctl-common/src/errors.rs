//! Error types shared across xctl.
//!
//! The companion core has its own closed error set (`CompanionError` in
//! `xctl-companion`); this module covers the external tools and raw process
//! control around it.

use thiserror::Error;

/// Result type alias for general xctl operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for xctl operations outside the companion core.
#[derive(Debug, Error)]
pub enum Error {
    /// An external tool (xcrun, simctl) failed.
    #[error("External tool '{tool}' failed: {reason}")]
    ExternalTool { tool: String, reason: String },

    /// I/O error (wraps std::io::Error).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn external_tool(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExternalTool {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}

// ==============================================================================
// Process Errors
// ==============================================================================

/// Low-level process control errors.
#[derive(Error, Debug, Clone)]
pub enum ProcessError {
    #[error("Signal {signal} failed for {pid}: {reason}")]
    SignalFailed {
        pid: u32,
        signal: String,
        reason: String,
    },

    #[error("Process check failed for {pid}: {reason}")]
    CheckFailed { pid: u32, reason: String },

    #[error("Process control unsupported on this platform: {operation}")]
    Unsupported { operation: String },
}

impl ProcessError {
    pub fn signal_failed(pid: u32, signal: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SignalFailed {
            pid,
            signal: signal.into(),
            reason: reason.into(),
        }
    }

    pub fn check_failed(pid: u32, reason: impl Into<String>) -> Self {
        Self::CheckFailed {
            pid,
            reason: reason.into(),
        }
    }
}

/// Result type for process operations.
pub type ProcessResult<T> = std::result::Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "no xcrun").into();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(err.to_string(), "I/O error: no xcrun");
    }

    #[test]
    fn test_external_tool_error() {
        let err = Error::external_tool("xcrun", "exit status 72");
        match err {
            Error::ExternalTool { tool, reason } => {
                assert_eq!(tool, "xcrun");
                assert_eq!(reason, "exit status 72");
            }
            _ => panic!("Wrong error type"),
        }
    }

    #[test]
    fn test_process_error_display() {
        let err = ProcessError::signal_failed(42, "SIGTERM", "EPERM");
        assert_eq!(err.to_string(), "Signal SIGTERM failed for 42: EPERM");
    }
}
