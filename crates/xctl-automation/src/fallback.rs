//! Degraded-mode screenshot capture.
//!
//! When the companion's screenshot call keeps failing with transport
//! corruption, the session asks a separate OS tool for the same image.
//! This substitutes a capability; it is not a retry of the RPC.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use xctl_common::{Error, Result, Udid};

/// Default wall-clock limit for one out-of-band capture.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(30);

/// Produces a screenshot without the companion.
#[async_trait]
pub trait CaptureFallback: Send + Sync {
    /// Short name for logs and errors.
    fn name(&self) -> &str;

    async fn capture(&self, target: &Udid, cancel: &CancellationToken) -> Result<Vec<u8>>;
}

/// `xcrun simctl io <udid> screenshot <file>`.
///
/// Writes into a temporary file, reads it back, and removes the file on
/// every path (success, tool failure, cancellation).
#[derive(Debug, Clone)]
pub struct SimctlScreenshot {
    program: PathBuf,
    timeout: Duration,
}

impl Default for SimctlScreenshot {
    fn default() -> Self {
        Self {
            program: PathBuf::from("xcrun"),
            timeout: DEFAULT_CAPTURE_TIMEOUT,
        }
    }
}

impl SimctlScreenshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the `xcrun` executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl CaptureFallback for SimctlScreenshot {
    fn name(&self) -> &str {
        "simctl"
    }

    async fn capture(&self, target: &Udid, cancel: &CancellationToken) -> Result<Vec<u8>> {
        let file = tempfile::Builder::new()
            .prefix("xctl-screenshot-")
            .suffix(".png")
            .tempfile()?;
        let path = file.path().to_path_buf();
        let tool = self.program.display().to_string();

        info!(udid = %target, tool = %tool, "Capturing screenshot out-of-band");

        let mut cmd = Command::new(&self.program);
        cmd.args(["simctl", "io", target.as_str(), "screenshot"])
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::external_tool(tool, "cancelled"));
            }
            res = tokio::time::timeout(self.timeout, cmd.output()) => match res {
                Ok(output) => output.map_err(|e| Error::external_tool(tool.clone(), e.to_string()))?,
                Err(_) => {
                    return Err(Error::external_tool(
                        tool,
                        format!("timed out after {:?}", self.timeout),
                    ));
                }
            },
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(udid = %target, status = %output.status, stderr = %stderr, "Out-of-band capture failed");
            return Err(Error::external_tool(
                tool,
                format!("{}: {}", output.status, stderr),
            ));
        }

        let data = tokio::fs::read(&path).await?;

        // Removal happens on drop for the early returns above
        if let Err(e) = file.close() {
            debug!(path = %path.display(), error = %e, "Failed to remove screenshot temp file");
        }

        if data.is_empty() {
            return Err(Error::external_tool(tool, "produced an empty image"));
        }
        debug!(udid = %target, bytes = data.len(), "Out-of-band capture complete");
        Ok(data)
    }
}
