//! Automation session.
//!
//! One session drives one target through one executor. Every verb is a
//! thin wrapper that builds the request and hands the stub call to the
//! executor, which owns connection setup and the reconnect loop.
//!
//! # Streaming verbs
//!
//! Upload streams count the payload bytes the transport has pulled. A
//! failure before any payload moved is classified like a unary failure
//! (and may be retried on corruption); after that it becomes
//! [`CompanionError::StreamInterrupted`] and is returned as is.

use futures::Stream;
use prost::Message;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::{Status, Streaming};
use tracing::{debug, info, warn};
use xctl_common::Udid;
use xctl_companion::proto::{
    self, install_request, payload, push_request, HidEvent, InstallRequest, InstallResponse,
    LogResponse, Payload, PushRequest, XctestRunResponse, XctestRunStatus,
};
use xctl_companion::{
    CompanionError, CompanionHost, CompanionOptions, CompanionSupervisor, ResilientExecutor,
};

use crate::error::{AutomationError, AutomationResult};
use crate::fallback::{CaptureFallback, SimctlScreenshot};

/// Payload bytes per streamed message.
pub const TRANSFER_CHUNK_SIZE: usize = 1024 * 1024;

pub use install_request::Destination;

/// What the companion reported after an install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledArtifact {
    pub name: String,
    pub uuid: String,
}

/// An open log stream.
///
/// Dropping it ends the tail. A failure mid-stream is surfaced to the
/// reader and the stream is not reopened.
#[derive(Debug)]
pub struct LogTail {
    stream: Streaming<LogResponse>,
    received: u64,
}

impl LogTail {
    /// The next chunk of log output, or `None` once the companion closes
    /// the stream.
    pub async fn next_chunk(&mut self) -> AutomationResult<Option<Vec<u8>>> {
        match self.stream.message().await {
            Ok(Some(response)) => {
                self.received += response.output.len() as u64;
                Ok(Some(response.output))
            }
            Ok(None) => Ok(None),
            Err(status) => {
                warn!(received = self.received, error = %status, "Log stream failed");
                Err(CompanionError::from_status("log", status).into())
            }
        }
    }

    /// Bytes of log output received so far.
    pub fn received(&self) -> u64 {
        self.received
    }
}

/// A running test execution. Each update carries the results finished
/// since the previous one.
#[derive(Debug)]
pub struct XctestRun {
    stream: Streaming<XctestRunResponse>,
    results: usize,
    failures: usize,
}

impl XctestRun {
    /// The next incremental report, or `None` once the run has ended.
    pub async fn next_update(&mut self) -> AutomationResult<Option<XctestRunResponse>> {
        match self.stream.message().await {
            Ok(Some(update)) => {
                self.results += update.results.len();
                self.failures += update.results.iter().filter(|r| !r.passed).count();
                if update.status() == XctestRunStatus::TerminatedAbnormally {
                    warn!(results = self.results, "Test run terminated abnormally");
                }
                Ok(Some(update))
            }
            Ok(None) => Ok(None),
            Err(status) => Err(CompanionError::from_status("xctest_run", status).into()),
        }
    }

    /// Results reported so far.
    pub fn results(&self) -> usize {
        self.results
    }

    /// Failed or crashed results reported so far.
    pub fn failures(&self) -> usize {
        self.failures
    }
}

pub struct AutomationSession<H: CompanionHost = CompanionSupervisor> {
    executor: ResilientExecutor<H>,
    target: Udid,
    fallback: Option<Arc<dyn CaptureFallback>>,
    closed: bool,
}

impl AutomationSession<CompanionSupervisor> {
    /// Session over a fresh supervisor for `options.target`.
    pub fn new(options: CompanionOptions) -> AutomationResult<Self> {
        let target = options
            .target
            .clone()
            .ok_or(CompanionError::MissingTarget)?;
        Ok(Self::with_executor(
            ResilientExecutor::from_options(options),
            target,
        ))
    }
}

impl<H: CompanionHost> AutomationSession<H> {
    /// Session over an existing executor, with the simctl screenshot
    /// fallback enabled.
    pub fn with_executor(executor: ResilientExecutor<H>, target: Udid) -> Self {
        Self {
            executor,
            target,
            fallback: Some(Arc::new(SimctlScreenshot::new())),
            closed: false,
        }
    }

    pub fn with_fallback(mut self, fallback: impl CaptureFallback + 'static) -> Self {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    pub fn without_fallback(mut self) -> Self {
        self.fallback = None;
        self
    }

    pub fn target(&self) -> &Udid {
        &self.target
    }

    pub fn executor(&self) -> &ResilientExecutor<H> {
        &self.executor
    }

    pub fn executor_mut(&mut self) -> &mut ResilientExecutor<H> {
        &mut self.executor
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> AutomationResult<()> {
        if self.closed {
            return Err(CompanionError::Closed.into());
        }
        Ok(())
    }

    /// Opens the companion session and returns the companion's identity.
    pub async fn connect(
        &mut self,
        cancel: &CancellationToken,
    ) -> AutomationResult<proto::CompanionInfo> {
        self.ensure_open()?;
        let response = self
            .executor
            .invoke("connect", cancel, |mut client| async move {
                client.connect(proto::ConnectRequest::default()).await
            })
            .await?;
        let info = response.companion.unwrap_or_default();
        info!(udid = %info.udid, is_local = info.is_local, "Connected to companion");
        Ok(info)
    }

    pub async fn describe(
        &mut self,
        cancel: &CancellationToken,
    ) -> AutomationResult<proto::TargetDescriptionResponse> {
        self.ensure_open()?;
        let response = self
            .executor
            .invoke("describe", cancel, |mut client| async move {
                client
                    .describe(proto::TargetDescriptionRequest {
                        fetch_diagnostics: false,
                    })
                    .await
            })
            .await?;
        Ok(response)
    }

    pub async fn list_apps(
        &mut self,
        cancel: &CancellationToken,
    ) -> AutomationResult<Vec<proto::InstalledAppInfo>> {
        self.ensure_open()?;
        let response = self
            .executor
            .invoke("list_apps", cancel, |mut client| async move {
                client
                    .list_apps(proto::ListAppsRequest {
                        suppress_process_state: false,
                    })
                    .await
            })
            .await?;
        Ok(response.apps)
    }

    pub async fn terminate(
        &mut self,
        bundle_id: &str,
        cancel: &CancellationToken,
    ) -> AutomationResult<()> {
        self.ensure_open()?;
        let bundle_id = bundle_id.to_string();
        self.executor
            .invoke("terminate", cancel, move |mut client| {
                let request = proto::TerminateRequest {
                    bundle_id: bundle_id.clone(),
                };
                async move { client.terminate(request).await }
            })
            .await?;
        Ok(())
    }

    pub async fn uninstall(
        &mut self,
        bundle_id: &str,
        cancel: &CancellationToken,
    ) -> AutomationResult<()> {
        self.ensure_open()?;
        let bundle_id = bundle_id.to_string();
        self.executor
            .invoke("uninstall", cancel, move |mut client| {
                let request = proto::UninstallRequest {
                    bundle_id: bundle_id.clone(),
                };
                async move { client.uninstall(request).await }
            })
            .await?;
        Ok(())
    }

    /// Launches an installed app and returns its pid.
    pub async fn launch(
        &mut self,
        bundle_id: &str,
        app_args: Vec<String>,
        env: HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> AutomationResult<u64> {
        self.ensure_open()?;
        let request = proto::LaunchRequest {
            bundle_id: bundle_id.to_string(),
            env,
            app_args,
            foreground_if_running: true,
            wait_for_debugger: false,
        };
        let response = self
            .executor
            .invoke("launch", cancel, move |mut client| {
                let request = request.clone();
                async move { client.launch(request).await }
            })
            .await?;
        info!(bundle_id, pid = response.pid, "Launched app");
        Ok(response.pid)
    }

    /// Captures the screen.
    ///
    /// If the companion call exhausts its reconnects on transport
    /// corruption, the configured fallback tool captures instead. Any
    /// other failure is returned unchanged.
    pub async fn screenshot(&mut self, cancel: &CancellationToken) -> AutomationResult<Vec<u8>> {
        self.ensure_open()?;
        let result = self
            .executor
            .invoke("screenshot", cancel, |mut client| async move {
                client.screenshot(proto::ScreenshotRequest {}).await
            })
            .await;

        match result {
            Ok(response) => Ok(response.image_data),
            Err(error) => {
                capture_with_fallback(error, self.fallback.as_deref(), &self.target, cancel).await
            }
        }
    }

    /// Opens a log tail. Only establishing the stream is retried.
    pub async fn tail_logs(
        &mut self,
        arguments: Vec<String>,
        cancel: &CancellationToken,
    ) -> AutomationResult<LogTail> {
        self.ensure_open()?;
        let stream = self
            .executor
            .invoke("log", cancel, move |mut client| {
                let request = proto::LogRequest {
                    arguments: arguments.clone(),
                    source: proto::LogSource::Target as i32,
                };
                async move { client.log(request).await }
            })
            .await?;
        Ok(LogTail {
            stream,
            received: 0,
        })
    }

    /// Pushes a local file into an app container. Returns payload bytes
    /// sent.
    pub async fn push_file(
        &mut self,
        source: &Path,
        bundle_id: &str,
        dst_path: &str,
        cancel: &CancellationToken,
    ) -> AutomationResult<u64> {
        self.ensure_open()?;
        let data = tokio::fs::read(source)
            .await
            .map_err(|e| AutomationError::read_file(source, e))?;
        self.push_bytes(data, bundle_id, dst_path, cancel).await
    }

    pub async fn push_bytes(
        &mut self,
        data: Vec<u8>,
        bundle_id: &str,
        dst_path: &str,
        cancel: &CancellationToken,
    ) -> AutomationResult<u64> {
        self.ensure_open()?;
        let data = Arc::new(data);
        let bundle_id = bundle_id.to_string();
        let dst_path = dst_path.to_string();

        debug!(bytes = data.len(), bundle_id = %bundle_id, dst_path = %dst_path, "Pushing file");
        let sent = self
            .executor
            .call("push", cancel, move |mut client| {
                let sent = Arc::new(AtomicU64::new(0));
                let requests =
                    push_requests(bundle_id.clone(), dst_path.clone(), data.clone(), sent.clone());
                async move {
                    match client.push(requests).await {
                        Ok(_) => Ok(sent.load(Ordering::SeqCst)),
                        Err(status) => {
                            Err(stream_failure("push", status, sent.load(Ordering::SeqCst)))
                        }
                    }
                }
            })
            .await?;
        Ok(sent)
    }

    /// Copies a file out of an app container.
    ///
    /// The download runs inside one attempt. A failure after content has
    /// arrived is [`CompanionError::StreamInterrupted`].
    pub async fn pull_file(
        &mut self,
        bundle_id: &str,
        src_path: &str,
        cancel: &CancellationToken,
    ) -> AutomationResult<Vec<u8>> {
        self.ensure_open()?;
        let request = proto::PullRequest {
            bundle_id: bundle_id.to_string(),
            src_path: src_path.to_string(),
        };
        let data = self
            .executor
            .call("pull", cancel, move |mut client| {
                let request = request.clone();
                async move {
                    let mut chunks = match client.pull(request).await {
                        Ok(response) => response.into_inner(),
                        Err(status) => return Err(CompanionError::from_status("pull", status)),
                    };
                    let mut data = Vec::new();
                    loop {
                        match chunks.message().await {
                            Ok(Some(chunk)) => append_payload(&mut data, chunk.payload),
                            Ok(None) => return Ok(data),
                            Err(status) => {
                                return Err(stream_failure("pull", status, data.len() as u64))
                            }
                        }
                    }
                }
            })
            .await?;
        debug!(bytes = data.len(), bundle_id, src_path, "Pulled file");
        Ok(data)
    }

    /// Replays input events in order. Returns the number of events the
    /// transport consumed.
    ///
    /// Once any event has been sent a failure is not retried, so a
    /// sequence is never injected twice.
    pub async fn send_hid_events(
        &mut self,
        events: Vec<HidEvent>,
        cancel: &CancellationToken,
    ) -> AutomationResult<usize> {
        self.ensure_open()?;
        let events = Arc::new(events);
        let count = events.len();
        self.executor
            .call("hid", cancel, move |mut client| {
                let sent = Arc::new(AtomicU64::new(0));
                let requests = hid_requests(events.clone(), sent.clone());
                async move {
                    match client.hid(requests).await {
                        Ok(_) => Ok(()),
                        Err(status) => {
                            Err(stream_failure("hid", status, sent.load(Ordering::SeqCst)))
                        }
                    }
                }
            })
            .await?;
        Ok(count)
    }

    /// Taps the screen at `(x, y)` in points.
    pub async fn tap(&mut self, x: f64, y: f64, cancel: &CancellationToken) -> AutomationResult<()> {
        self.send_hid_events(HidEvent::tap(x, y).to_vec(), cancel)
            .await
            .map(|_| ())
    }

    /// Starts a test run. Only establishing the result stream is retried;
    /// results are read from the returned [`XctestRun`].
    pub async fn run_xctest(
        &mut self,
        request: proto::XctestRunRequest,
        cancel: &CancellationToken,
    ) -> AutomationResult<XctestRun> {
        self.ensure_open()?;
        info!(test_bundle_id = %request.test_bundle_id, "Starting test run");
        let stream = self
            .executor
            .invoke("xctest_run", cancel, move |mut client| {
                let request = request.clone();
                async move { client.xctest_run(request).await }
            })
            .await?;
        Ok(XctestRun {
            stream,
            results: 0,
            failures: 0,
        })
    }

    /// Installs an artifact, reporting companion progress to `progress`.
    ///
    /// The whole transfer runs under one operation deadline.
    pub async fn install<P>(
        &mut self,
        artifact: &Path,
        destination: Destination,
        cancel: &CancellationToken,
        progress: P,
    ) -> AutomationResult<InstalledArtifact>
    where
        P: Fn(f64) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let data = Arc::new(
            tokio::fs::read(artifact)
                .await
                .map_err(|e| AutomationError::read_file(artifact, e))?,
        );
        let name_hint = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let progress = Arc::new(progress);

        info!(artifact = %artifact.display(), bytes = data.len(), ?destination, "Installing");
        let last = self
            .executor
            .call("install", cancel, move |mut client| {
                let sent = Arc::new(AtomicU64::new(0));
                let requests =
                    install_requests(destination, name_hint.clone(), data.clone(), sent.clone());
                let progress = progress.clone();
                async move {
                    let mut responses = match client.install(requests).await {
                        Ok(response) => response.into_inner(),
                        Err(status) => {
                            return Err(stream_failure(
                                "install",
                                status,
                                sent.load(Ordering::SeqCst),
                            ))
                        }
                    };

                    let mut last = InstallResponse::default();
                    loop {
                        match responses.message().await {
                            Ok(Some(message)) => {
                                (*progress)(message.progress);
                                last = message;
                            }
                            Ok(None) => break,
                            Err(status) => {
                                return Err(stream_failure(
                                    "install",
                                    status,
                                    sent.load(Ordering::SeqCst),
                                ))
                            }
                        }
                    }
                    Ok(last)
                }
            })
            .await?;

        installed_artifact(last)
    }

    /// Closes the session: no new calls, then the channel is retired, then
    /// the companion is stopped. Idempotent; never fails.
    pub async fn shutdown(&mut self) {
        self.closed = true;
        let connection = self.executor.connection_mut();
        connection.disconnect();
        connection.host_mut().stop_companion().await;
        debug!(udid = %self.target, "Automation session closed");
    }
}

/// Runs the fallback capture when `error` is exhausted transport
/// corruption; otherwise returns `error`.
pub(crate) async fn capture_with_fallback(
    error: CompanionError,
    fallback: Option<&dyn CaptureFallback>,
    target: &Udid,
    cancel: &CancellationToken,
) -> AutomationResult<Vec<u8>> {
    let fallback = match fallback {
        Some(fallback) if error.is_transport_corruption() => fallback,
        _ => return Err(error.into()),
    };

    warn!(
        udid = %target,
        fallback = fallback.name(),
        error = %error,
        "Screenshot RPC unusable, capturing out-of-band"
    );
    fallback
        .capture(target, cancel)
        .await
        .map_err(|fallback_error| AutomationError::FallbackFailed {
            original: error,
            fallback: fallback_error,
        })
}

/// Classifies a failed transfer stream by how much payload had moved.
pub(crate) fn stream_failure(operation: &str, status: Status, bytes_sent: u64) -> CompanionError {
    if bytes_sent > 0 {
        CompanionError::StreamInterrupted {
            operation: operation.to_string(),
            bytes_sent,
            status,
        }
    } else {
        CompanionError::from_status(operation, status)
    }
}

fn installed_artifact(last: InstallResponse) -> AutomationResult<InstalledArtifact> {
    if last.name.is_empty() {
        return Err(AutomationError::InstallRejected {
            reason: "companion did not report an installed artifact".to_string(),
        });
    }
    Ok(InstalledArtifact {
        name: last.name,
        uuid: last.uuid,
    })
}

/// Splits `data` into payload chunks, counting bytes as they are pulled.
fn payload_chunks(
    data: Arc<Vec<u8>>,
    sent: Arc<AtomicU64>,
) -> impl Iterator<Item = Payload> + Send + 'static {
    let count = data.len().div_ceil(TRANSFER_CHUNK_SIZE);
    (0..count).map(move |i| {
        let start = i * TRANSFER_CHUNK_SIZE;
        let end = (start + TRANSFER_CHUNK_SIZE).min(data.len());
        sent.fetch_add((end - start) as u64, Ordering::SeqCst);
        Payload::data(data[start..end].to_vec())
    })
}

fn append_payload(data: &mut Vec<u8>, chunk: Option<Payload>) {
    if let Some(Payload {
        source: Some(payload::Source::Data(bytes)),
    }) = chunk
    {
        data.extend_from_slice(&bytes);
    }
}

/// Streams `events`, counting encoded bytes as they are pulled.
fn hid_requests(
    events: Arc<Vec<HidEvent>>,
    sent: Arc<AtomicU64>,
) -> impl Stream<Item = HidEvent> + Send + 'static {
    let count = events.len();
    tokio_stream::iter((0..count).map(move |i| {
        let event = events[i].clone();
        sent.fetch_add(event.encoded_len() as u64, Ordering::SeqCst);
        event
    }))
}

fn push_requests(
    bundle_id: String,
    dst_path: String,
    data: Arc<Vec<u8>>,
    sent: Arc<AtomicU64>,
) -> impl Stream<Item = PushRequest> + Send + 'static {
    let header = PushRequest {
        value: Some(push_request::Value::Inner(push_request::Inner {
            bundle_id,
            dst_path,
        })),
    };
    let payload = payload_chunks(data, sent).map(|chunk| PushRequest {
        value: Some(push_request::Value::Payload(chunk)),
    });
    tokio_stream::iter(std::iter::once(header).chain(payload))
}

fn install_requests(
    destination: Destination,
    name_hint: String,
    data: Arc<Vec<u8>>,
    sent: Arc<AtomicU64>,
) -> impl Stream<Item = InstallRequest> + Send + 'static {
    let mut header = vec![InstallRequest {
        value: Some(install_request::Value::Destination(destination as i32)),
    }];
    if !name_hint.is_empty() {
        header.push(InstallRequest {
            value: Some(install_request::Value::NameHint(name_hint)),
        });
    }
    let payload = payload_chunks(data, sent).map(|chunk| InstallRequest {
        value: Some(install_request::Value::Payload(chunk)),
    });
    tokio_stream::iter(header.into_iter().chain(payload))
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
