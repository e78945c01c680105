//! Unit tests for the automation session.

use super::*;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio_stream::StreamExt;
use xctl_common::Endpoint;
use xctl_companion::connection::ChannelHandle;
use xctl_companion::{CompanionResult, ConnectionManager, RetryPolicy};

/// Host that "runs" a companion on a fixed port and records what the
/// channel looked like when it was asked to stop.
#[derive(Default)]
struct ScriptedHost {
    running: bool,
    port: u16,
    stops: u32,
    watched: Option<ChannelHandle>,
    retired_at_stop: Arc<Mutex<Vec<bool>>>,
}

#[async_trait]
impl CompanionHost for ScriptedHost {
    fn is_running(&mut self) -> bool {
        self.running
    }

    fn endpoint(&self) -> Option<Endpoint> {
        self.running
            .then(|| Endpoint::new("127.0.0.1", self.port))
            .flatten()
    }

    async fn start_companion(&mut self, _cancel: &CancellationToken) -> CompanionResult<Endpoint> {
        self.running = true;
        Endpoint::new("127.0.0.1", self.port).ok_or(CompanionError::InvalidEndpoint {
            reason: "port 0".to_string(),
        })
    }

    async fn stop_companion(&mut self) {
        self.stops += 1;
        self.running = false;
        if let Some(handle) = &self.watched {
            self.retired_at_stop
                .lock()
                .unwrap()
                .push(handle.is_retired());
        }
    }
}

/// A local port with nothing listening on it.
fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn session() -> AutomationSession<ScriptedHost> {
    let host = ScriptedHost {
        port: closed_port(),
        ..Default::default()
    };
    let executor = ResilientExecutor::new(
        ConnectionManager::new(host),
        RetryPolicy {
            max_reconnects: 3,
            operation_timeout: Duration::from_secs(10),
        },
    );
    AutomationSession::with_executor(executor, Udid::from("SIM-1")).without_fallback()
}

struct StaticCapture {
    result: std::result::Result<Vec<u8>, String>,
    calls: Arc<Mutex<u32>>,
}

#[async_trait]
impl CaptureFallback for StaticCapture {
    fn name(&self) -> &str {
        "static"
    }

    async fn capture(
        &self,
        _target: &Udid,
        _cancel: &CancellationToken,
    ) -> xctl_common::Result<Vec<u8>> {
        *self.calls.lock().unwrap() += 1;
        self.result
            .clone()
            .map_err(|reason| xctl_common::Error::external_tool("static", reason))
    }
}

fn corruption() -> CompanionError {
    CompanionError::from_status(
        "screenshot",
        Status::internal("h2 protocol error: PROTOCOL_ERROR"),
    )
}

#[tokio::test]
async fn test_unreachable_companion_is_not_retried() {
    let mut session = session();

    let err = session
        .describe(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AutomationError::Companion(CompanionError::Rpc { .. })
    ));
    assert_eq!(session.executor().reconnect_count(), 0);
    assert_eq!(session.executor().connection().generation(), 1);
}

#[tokio::test]
async fn test_calls_after_shutdown_fail_closed() {
    let mut session = session();
    session.shutdown().await;

    assert!(session.is_closed());
    let err = session
        .list_apps(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AutomationError::Companion(CompanionError::Closed)
    ));
    let err = session
        .terminate("com.example.app", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AutomationError::Companion(CompanionError::Closed)
    ));
    // No companion was started for the rejected calls
    assert_eq!(session.executor().connection().generation(), 0);
}

#[tokio::test]
async fn test_shutdown_retires_channel_before_stopping() {
    let mut session = session();
    let cancel = CancellationToken::new();

    let handle = session
        .executor_mut()
        .connection_mut()
        .ensure_connected(&cancel)
        .await
        .unwrap()
        .handle();
    let observed = {
        let host = session.executor_mut().connection_mut().host_mut();
        host.watched = Some(handle.clone());
        host.retired_at_stop.clone()
    };

    session.shutdown().await;
    session.shutdown().await;

    assert!(handle.is_retired());
    assert_eq!(*observed.lock().unwrap(), vec![true, true]);
    assert_eq!(session.executor().connection().host().stops, 2);
}

#[tokio::test]
async fn test_fallback_used_for_exhausted_corruption() {
    let calls = Arc::new(Mutex::new(0));
    let fallback = StaticCapture {
        result: Ok(b"PNG".to_vec()),
        calls: calls.clone(),
    };

    let data = capture_with_fallback(
        corruption(),
        Some(&fallback),
        &Udid::from("SIM-1"),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(data, b"PNG");
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_fallback_skipped_for_other_errors() {
    let calls = Arc::new(Mutex::new(0));
    let fallback = StaticCapture {
        result: Ok(b"PNG".to_vec()),
        calls: calls.clone(),
    };

    let err = capture_with_fallback(
        CompanionError::from_status("screenshot", Status::unavailable("device locked")),
        Some(&fallback),
        &Udid::from("SIM-1"),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    match err {
        AutomationError::Companion(CompanionError::Rpc { status, .. }) => {
            assert_eq!(status.message(), "device locked");
        }
        other => panic!("Expected Rpc, got {:?}", other),
    }
    assert_eq!(*calls.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_fallback_failure_keeps_original_error() {
    let fallback = StaticCapture {
        result: Err("simctl unavailable".to_string()),
        calls: Arc::new(Mutex::new(0)),
    };

    let err = capture_with_fallback(
        corruption(),
        Some(&fallback),
        &Udid::from("SIM-1"),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    match err {
        AutomationError::FallbackFailed { original, fallback } => {
            assert!(original.is_transport_corruption());
            assert!(fallback.to_string().contains("simctl unavailable"));
        }
        other => panic!("Expected FallbackFailed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_no_fallback_configured() {
    let err = capture_with_fallback(
        corruption(),
        None,
        &Udid::from("SIM-1"),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(err.companion().unwrap().is_transport_corruption());
}

#[test]
fn test_stream_failure_classification() {
    let status = || Status::internal("stream error received: PROTOCOL_ERROR");

    assert!(stream_failure("push", status(), 0).is_transport_corruption());
    match stream_failure("push", status(), 2048) {
        CompanionError::StreamInterrupted { bytes_sent, .. } => assert_eq!(bytes_sent, 2048),
        other => panic!("Expected StreamInterrupted, got {:?}", other),
    }
    assert!(matches!(
        stream_failure("push", Status::permission_denied("sandbox"), 0),
        CompanionError::Rpc { .. }
    ));
}

#[tokio::test]
async fn test_push_stream_counts_pulled_bytes() {
    let data = Arc::new(vec![7u8; TRANSFER_CHUNK_SIZE + 10]);
    let sent = Arc::new(AtomicU64::new(0));
    let stream = push_requests(
        "com.example.app".to_string(),
        "Documents/blob".to_string(),
        data,
        sent.clone(),
    );
    assert_eq!(sent.load(Ordering::SeqCst), 0);

    let requests: Vec<PushRequest> = stream.collect().await;
    assert_eq!(requests.len(), 3);
    match &requests[0].value {
        Some(push_request::Value::Inner(inner)) => {
            assert_eq!(inner.bundle_id, "com.example.app");
            assert_eq!(inner.dst_path, "Documents/blob");
        }
        other => panic!("Expected header, got {:?}", other),
    }
    assert!(matches!(
        requests[2].value,
        Some(push_request::Value::Payload(_))
    ));
    assert_eq!(sent.load(Ordering::SeqCst), (TRANSFER_CHUNK_SIZE + 10) as u64);
}

#[tokio::test]
async fn test_install_stream_layout() {
    let sent = Arc::new(AtomicU64::new(0));
    let stream = install_requests(
        Destination::App,
        "Example.ipa".to_string(),
        Arc::new(b"zip".to_vec()),
        sent.clone(),
    );

    let requests: Vec<InstallRequest> = stream.collect().await;
    assert_eq!(requests.len(), 3);
    assert_eq!(
        requests[0].value,
        Some(install_request::Value::Destination(Destination::App as i32))
    );
    assert_eq!(
        requests[1].value,
        Some(install_request::Value::NameHint("Example.ipa".to_string()))
    );
    assert_eq!(
        requests[2].value,
        Some(install_request::Value::Payload(Payload::data(b"zip".to_vec())))
    );
    assert_eq!(sent.load(Ordering::SeqCst), 3);
}

#[test]
fn test_install_requires_reported_artifact() {
    let err = installed_artifact(InstallResponse {
        progress: 100.0,
        ..Default::default()
    })
    .unwrap_err();
    assert!(matches!(err, AutomationError::InstallRejected { .. }));

    let artifact = installed_artifact(InstallResponse {
        progress: 100.0,
        name: "com.example.app".to_string(),
        uuid: "1234".to_string(),
    })
    .unwrap();
    assert_eq!(artifact.name, "com.example.app");
}

#[tokio::test]
async fn test_push_missing_file() {
    let mut session = session();
    let dir = tempfile::tempdir().unwrap();

    let err = session
        .push_file(
            &dir.path().join("missing.bin"),
            "com.example.app",
            "Documents",
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AutomationError::ReadFile { .. }));
}

#[tokio::test]
async fn test_result_stream_established_once_after_reconnect() {
    let mut session = session();
    let attempts = Arc::new(Mutex::new(0u32));

    let counter = attempts.clone();
    let updates = session
        .executor_mut()
        .call("xctest_run", &CancellationToken::new(), move |_client| {
            let counter = counter.clone();
            async move {
                let attempt = {
                    let mut attempts = counter.lock().unwrap();
                    *attempts += 1;
                    *attempts
                };
                if attempt == 1 {
                    return Err(CompanionError::from_status(
                        "xctest_run",
                        Status::internal("h2 protocol error: PROTOCOL_ERROR"),
                    ));
                }
                let updates = vec![
                    XctestRunResponse {
                        status: XctestRunStatus::Running as i32,
                        ..Default::default()
                    },
                    XctestRunResponse {
                        status: XctestRunStatus::TerminatedNormally as i32,
                        ..Default::default()
                    },
                ];
                Ok(tokio_stream::iter(updates))
            }
        })
        .await
        .unwrap();

    // Results are read after the retry loop has returned
    let statuses: Vec<XctestRunStatus> = updates.map(|u| u.status()).collect().await;
    assert_eq!(
        statuses,
        vec![XctestRunStatus::Running, XctestRunStatus::TerminatedNormally]
    );
    assert_eq!(*attempts.lock().unwrap(), 2);
    assert_eq!(session.executor().reconnect_count(), 1);
    assert_eq!(session.executor().connection().generation(), 2);
}

#[tokio::test]
async fn test_xctest_run_on_unreachable_companion() {
    let mut session = session();

    let err = session
        .run_xctest(
            proto::XctestRunRequest {
                test_bundle_id: "com.example.tests".to_string(),
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

    match err {
        AutomationError::Companion(CompanionError::Rpc { operation, .. }) => {
            assert_eq!(operation, "xctest_run");
        }
        other => panic!("Expected Rpc, got {:?}", other),
    }
    assert_eq!(session.executor().reconnect_count(), 0);
}

#[tokio::test]
async fn test_pull_before_content_is_not_interrupted() {
    let mut session = session();

    let err = session
        .pull_file("com.example.app", "Documents/log.txt", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AutomationError::Companion(CompanionError::Rpc { .. })
    ));
}

#[tokio::test]
async fn test_hid_stream_counts_encoded_bytes() {
    let events: Vec<HidEvent> = HidEvent::tap(100.0, 200.0).to_vec();
    let expected: u64 = events.iter().map(|e| e.encoded_len() as u64).sum();
    let sent = Arc::new(AtomicU64::new(0));

    let pulled: Vec<HidEvent> = hid_requests(Arc::new(events.clone()), sent.clone())
        .collect()
        .await;

    assert_eq!(pulled, events);
    assert!(expected > 0);
    assert_eq!(sent.load(Ordering::SeqCst), expected);
}

#[test]
fn test_pulled_payload_keeps_only_data() {
    let mut data = b"ab".to_vec();
    append_payload(&mut data, Some(Payload::data(b"cd".to_vec())));
    append_payload(
        &mut data,
        Some(Payload {
            source: Some(payload::Source::FilePath("/tmp/x".to_string())),
        }),
    );
    append_payload(&mut data, None);
    assert_eq!(data, b"abcd");
}

#[tokio::test]
async fn test_calls_after_shutdown_include_new_verbs() {
    let mut session = session();
    session.shutdown().await;

    let err = session
        .tap(1.0, 1.0, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AutomationError::Companion(CompanionError::Closed)
    ));
    let err = session
        .launch(
            "com.example.app",
            Vec::new(),
            HashMap::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AutomationError::Companion(CompanionError::Closed)
    ));
}
