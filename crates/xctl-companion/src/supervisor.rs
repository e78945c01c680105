//! Companion process supervisor.
//!
//! Owns exactly one companion subprocess: start, monitor, stop, dispose.
//! The listening port is not known up front; the companion announces it on
//! stdout or stderr, and [`CompanionSupervisor::start`] waits for that
//! announcement before publishing an [`Endpoint`].
//!
//! The supervisor is single-owner by construction (every mutating method
//! takes `&mut self`); parallel sessions against different targets use
//! separate supervisors.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use xctl_common::{Endpoint, Udid};

use crate::config::CompanionOptions;
use crate::connection::CompanionHost;
use crate::discovery::PortSignal;
use crate::error::{CompanionError, CompanionResult};
use crate::locator::BinaryLocator;
use crate::output::{OutputCapture, DEFAULT_CAPTURE_LINES};
use crate::state::{SupervisorState, SupervisorStateMachine};

/// Extra wait after SIGKILL when the graceful stop timed out.
const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// How long stopped readers get to drain what is left in the pipes.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// The supervised subprocess.
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    pid: u32,
    target: Udid,
    endpoint: Option<Endpoint>,
    output: OutputCapture,
    started_at: DateTime<Utc>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn target(&self) -> &Udid {
        &self.target
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

enum StartupWait {
    Announced(u16),
    OutputClosed,
    TimedOut,
    Cancelled,
}

pub struct CompanionSupervisor {
    options: CompanionOptions,
    locator: BinaryLocator,
    state: SupervisorStateMachine,
    process: Option<ProcessHandle>,
    disposed: bool,
}

impl std::fmt::Debug for CompanionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompanionSupervisor")
            .field("state", &self.state.current_state())
            .field("pid", &self.pid())
            .field("endpoint", &self.endpoint())
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl CompanionSupervisor {
    pub fn new(options: CompanionOptions) -> Self {
        let locator = BinaryLocator::from_options(&options);
        Self::with_locator(options, locator)
    }

    pub fn with_locator(options: CompanionOptions, locator: BinaryLocator) -> Self {
        Self {
            options,
            locator,
            state: SupervisorStateMachine::new(),
            process: None,
            disposed: false,
        }
    }

    pub fn options(&self) -> &CompanionOptions {
        &self.options
    }

    pub fn locator(&self) -> &BinaryLocator {
        &self.locator
    }

    pub fn state(&self) -> SupervisorState {
        self.state.current_state()
    }

    pub fn state_machine(&self) -> &SupervisorStateMachine {
        &self.state
    }

    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.pid)
    }

    /// The published endpoint, only while `Running`.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        if self.state.current_state() != SupervisorState::Running {
            return None;
        }
        self.process.as_ref().and_then(|p| p.endpoint.as_ref())
    }

    pub fn target(&self) -> Option<&Udid> {
        self.process.as_ref().map(|p| &p.target)
    }

    pub fn stdout_tail(&self) -> Vec<String> {
        self.process
            .as_ref()
            .map(|p| p.output.stdout().lines())
            .unwrap_or_default()
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.process
            .as_ref()
            .map(|p| p.output.stderr().lines())
            .unwrap_or_default()
    }

    /// `true` while the companion is `Running` and has not exited.
    ///
    /// A companion found dead here moves the supervisor to `Failed` and
    /// drops its endpoint, so the next start spawns a fresh process.
    pub fn is_running(&mut self) -> bool {
        self.refresh();
        self.state.current_state() == SupervisorState::Running && self.process.is_some()
    }

    /// Launches the companion for `target` and waits for its port.
    pub async fn start(
        &mut self,
        target: &Udid,
        cancel: &CancellationToken,
    ) -> CompanionResult<Endpoint> {
        if self.disposed {
            return Err(CompanionError::Disposed);
        }

        self.refresh();
        if let Some(handle) = &self.process {
            return Err(CompanionError::AlreadyRunning { pid: handle.pid });
        }
        if !self.state.current_state().can_start() {
            return Err(CompanionError::InvalidTransition {
                from: self.state.current_state(),
                to: SupervisorState::Starting,
            });
        }

        let binary = self.locator.locate()?;
        let args = build_args(target, self.options.requested_port, self.options.verbose);

        self.state
            .transition_to(SupervisorState::Starting, format!("start requested for {}", target))?;
        info!(
            udid = %target,
            binary = %binary.display(),
            requested_port = self.options.requested_port,
            "Starting companion"
        );

        let mut child = match spawn_companion(&binary, &args) {
            Ok(child) => child,
            Err(source) => {
                error!(binary = %binary.display(), error = %source, "Failed to spawn companion");
                self.state
                    .transition_to(SupervisorState::Failed, "spawn failed")?;
                return Err(CompanionError::SpawnFailed {
                    path: binary,
                    source,
                });
            }
        };

        let pid = child.id().unwrap_or(0);
        let (signal, port_rx) = PortSignal::new();
        let output = OutputCapture::attach(&mut child, signal, DEFAULT_CAPTURE_LINES);

        self.process = Some(ProcessHandle {
            child,
            pid,
            target: target.clone(),
            endpoint: None,
            output,
            started_at: Utc::now(),
        });

        debug!(pid, timeout = ?self.options.startup_timeout, "Waiting for port announcement");
        let startup_timeout = self.options.startup_timeout;
        let wait = tokio::select! {
            biased;
            _ = cancel.cancelled() => StartupWait::Cancelled,
            res = timeout(startup_timeout, port_rx) => match res {
                Ok(Ok(port)) => StartupWait::Announced(port),
                Ok(Err(_)) => StartupWait::OutputClosed,
                Err(_) => StartupWait::TimedOut,
            },
        };

        match wait {
            StartupWait::Announced(port) => {
                let endpoint = match Endpoint::new(self.options.host.clone(), port) {
                    Some(endpoint) => endpoint,
                    None => {
                        self.abort_startup().await;
                        self.state
                            .transition_to(SupervisorState::Failed, "invalid port announced")?;
                        return Err(CompanionError::InvalidEndpoint {
                            reason: format!("port {} announced", port),
                        });
                    }
                };

                if let Some(handle) = self.process.as_mut() {
                    handle.endpoint = Some(endpoint.clone());
                }
                self.state
                    .transition_to(SupervisorState::Running, format!("listening on {}", endpoint))?;
                info!(pid, endpoint = %endpoint, "✅ Companion running");
                Ok(endpoint)
            }
            StartupWait::TimedOut => {
                warn!(pid, timeout = ?startup_timeout, "Companion did not announce a port in time");
                let (stderr, _) = self.abort_startup().await;
                self.state
                    .transition_to(SupervisorState::Failed, "startup timeout")?;
                Err(CompanionError::startup_timeout(startup_timeout, stderr))
            }
            StartupWait::OutputClosed => {
                warn!(pid, "Companion closed its output before announcing a port");
                let (stderr, status) = self.abort_startup().await;
                self.state
                    .transition_to(SupervisorState::Failed, "exited during startup")?;
                Err(CompanionError::ExitedDuringStartup { status, stderr })
            }
            StartupWait::Cancelled => {
                info!(pid, "Companion startup cancelled");
                self.abort_startup().await;
                self.state
                    .transition_to(SupervisorState::Stopped, "startup cancelled")?;
                Err(CompanionError::cancelled("companion start"))
            }
        }
    }

    /// Stops the companion and its descendants.
    ///
    /// Never fails: kill errors are logged. The endpoint and target are
    /// cleared whether or not the kill succeeded.
    pub async fn stop(&mut self) {
        let Some(mut handle) = self.process.take() else {
            debug!("Stop requested but companion is not running");
            return;
        };

        if let Err(e) = self
            .state
            .transition_to(SupervisorState::Stopping, "stop requested")
        {
            warn!(error = %e, "Unexpected state while stopping companion");
        }

        info!(pid = handle.pid, udid = %handle.target, "Stopping companion");
        let status = terminate(&mut handle, self.options.shutdown_timeout).await;
        debug!(pid = handle.pid, status = %status, "Companion stopped");
        drop(handle);

        if let Err(e) = self
            .state
            .transition_to(SupervisorState::Stopped, "stopped")
        {
            warn!(error = %e, "Unexpected state after stopping companion");
        }
    }

    /// Async disposal. Idempotent; never fails.
    pub async fn shutdown(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        if let Some(mut handle) = self.process.take() {
            terminate(&mut handle, self.options.shutdown_timeout).await;
        }
        self.settle_stopped();
    }

    /// Sync disposal. Idempotent; never fails.
    ///
    /// Sends SIGKILL to the process group and leaves reaping to the
    /// runtime, since waiting would block the caller's thread.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        if let Some(mut handle) = self.process.take() {
            #[cfg(unix)]
            {
                if let Err(e) = xctl_process::kill_group(handle.pid) {
                    debug!(pid = handle.pid, error = %e, "Kill during dispose failed");
                }
            }
            if let Err(e) = handle.child.start_kill() {
                debug!(pid = handle.pid, error = %e, "start_kill during dispose failed");
            }
            if let Err(e) = handle.child.try_wait() {
                debug!(pid = handle.pid, error = %e, "try_wait during dispose failed");
            }
            handle.output.abort();
        }
        self.settle_stopped();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Detects a companion that exited while `Running`.
    fn refresh(&mut self) {
        if self.state.current_state() != SupervisorState::Running {
            return;
        }

        let exited = match self.process.as_mut() {
            Some(handle) => match handle.child.try_wait() {
                Ok(Some(status)) => Some(status.to_string()),
                Ok(None) => None,
                Err(e) => Some(format!("unknown ({})", e)),
            },
            None => Some("missing handle".to_string()),
        };

        if let Some(status) = exited {
            if let Some(mut handle) = self.process.take() {
                warn!(
                    pid = handle.pid,
                    status = %status,
                    stderr = %handle.output.stderr().text(),
                    "Companion exited unexpectedly"
                );
                handle.output.abort();
            }
            if let Err(e) = self
                .state
                .transition_to(SupervisorState::Failed, "companion exited")
            {
                warn!(error = %e, "Unexpected state after companion exit");
            }
        }
    }

    /// Tears down a half-started companion. Returns (stderr, exit status).
    async fn abort_startup(&mut self) -> (String, String) {
        match self.process.take() {
            Some(mut handle) => {
                let status = terminate(&mut handle, self.options.shutdown_timeout).await;
                (handle.output.stderr().text(), status)
            }
            None => (String::new(), "unknown".to_string()),
        }
    }

    /// Walks the state machine to `Stopped` after disposal.
    fn settle_stopped(&mut self) {
        use SupervisorState::*;

        let path: &[SupervisorState] = match self.state.current_state() {
            Running => &[Stopping, Stopped],
            Starting | Stopping | Failed => &[Stopped],
            NotStarted | Stopped => &[],
        };
        for next in path {
            if let Err(e) = self.state.transition_to(*next, "disposed") {
                debug!(error = %e, "Transition during disposal skipped");
            }
        }
    }
}

impl Drop for CompanionSupervisor {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[async_trait]
impl CompanionHost for CompanionSupervisor {
    fn is_running(&mut self) -> bool {
        CompanionSupervisor::is_running(self)
    }

    fn endpoint(&self) -> Option<Endpoint> {
        CompanionSupervisor::endpoint(self).cloned()
    }

    async fn start_companion(&mut self, cancel: &CancellationToken) -> CompanionResult<Endpoint> {
        let target = self
            .options
            .target
            .clone()
            .ok_or(CompanionError::MissingTarget)?;
        self.start(&target, cancel).await
    }

    async fn stop_companion(&mut self) {
        self.stop().await;
    }
}

/// `--udid <target> --grpc-port <port> [--log DEBUG]`
pub fn build_args(target: &Udid, requested_port: u16, verbose: bool) -> Vec<String> {
    let mut args = vec![
        "--udid".to_string(),
        target.to_string(),
        "--grpc-port".to_string(),
        requested_port.to_string(),
    ];
    if verbose {
        args.push("--log".to_string());
        args.push("DEBUG".to_string());
    }
    args
}

fn spawn_companion(binary: &Path, args: &[String]) -> std::io::Result<Child> {
    let mut cmd = Command::new(binary);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    // Own process group so the whole tree can be signalled at once
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn()
}

/// Graceful stop, then forced. Returns a printable exit status.
async fn terminate(handle: &mut ProcessHandle, shutdown_timeout: Duration) -> String {
    let pid = handle.pid;

    if let Ok(Some(status)) = handle.child.try_wait() {
        debug!(pid, status = %status, "Companion already exited");
        handle.output.finish(OUTPUT_DRAIN_TIMEOUT).await;
        return status.to_string();
    }

    #[cfg(unix)]
    {
        if let Err(e) = xctl_process::terminate_group(pid) {
            warn!(pid, error = %e, "Failed to send SIGTERM to companion group");
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = handle.child.start_kill() {
            warn!(pid, error = %e, "Failed to kill companion");
        }
    }

    let status = match timeout(shutdown_timeout, handle.child.wait()).await {
        Ok(Ok(status)) => status.to_string(),
        Ok(Err(e)) => {
            warn!(pid, error = %e, "Failed waiting for companion exit");
            format!("unknown ({})", e)
        }
        Err(_) => {
            warn!(pid, timeout = ?shutdown_timeout, "Companion ignored SIGTERM, killing");
            #[cfg(unix)]
            {
                if let Err(e) = xctl_process::kill_group(pid) {
                    warn!(pid, error = %e, "Failed to SIGKILL companion group");
                }
            }
            if let Err(e) = handle.child.start_kill() {
                warn!(pid, error = %e, "Failed to kill companion");
            }
            match timeout(FORCE_KILL_TIMEOUT, handle.child.wait()).await {
                Ok(Ok(status)) => status.to_string(),
                Ok(Err(e)) => format!("unknown ({})", e),
                Err(_) => {
                    error!(pid, "Companion still alive after SIGKILL");
                    "still running".to_string()
                }
            }
        }
    };

    handle.output.finish(OUTPUT_DRAIN_TIMEOUT).await;
    status
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
