//! End-to-end lifecycle tests: a shell script stands in for the
//! companion, announces a port with nothing behind it, and the executor
//! drives it through start, failed calls, restart and shutdown.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use xctl_common::Platform;
use xctl_companion::proto::TargetDescriptionRequest;
use xctl_companion::{
    BinaryLocator, CompanionError, CompanionOptions, CompanionSupervisor, ConnectionManager,
    ResilientExecutor, RetryPolicy, SupervisorState,
};

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn write_companion(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("idb_companion");
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn executor_for(script: &Path) -> ResilientExecutor {
    let options = CompanionOptions::new("E2E-UDID")
        .with_binary_path(script)
        .with_startup_timeout(Duration::from_secs(5))
        .with_shutdown_timeout(Duration::from_secs(2));
    let policy = RetryPolicy {
        max_reconnects: 3,
        operation_timeout: Duration::from_secs(10),
    };
    let locator = BinaryLocator::empty()
        .with_explicit_path(script)
        .with_host_platform(Platform::MacOs);
    let supervisor = CompanionSupervisor::with_locator(options, locator);
    ResilientExecutor::new(ConnectionManager::new(supervisor), policy)
}

async fn describe(executor: &mut ResilientExecutor) -> Result<(), CompanionError> {
    executor
        .invoke("describe", &CancellationToken::new(), |mut client| async move {
            client.describe(TargetDescriptionRequest::default()).await
        })
        .await
        .map(|_| ())
}

#[tokio::test]
async fn test_unreachable_companion_is_not_retried_and_is_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("pid");
    let script = write_companion(
        dir.path(),
        &format!(
            "echo $$ > {}\necho '{{\"grpc_port\":{}}}'\nexec sleep 30",
            pid_file.display(),
            closed_port()
        ),
    );
    let mut executor = executor_for(&script);

    let err = describe(&mut executor).await.unwrap_err();
    assert!(matches!(err, CompanionError::Rpc { .. }), "got {:?}", err);
    assert_eq!(executor.reconnect_count(), 0);
    assert_eq!(executor.connection().generation(), 1);
    assert_eq!(executor.connection().host().state(), SupervisorState::Running);

    let pid: u32 = fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
    executor.shutdown().await;

    assert_eq!(executor.connection().host().state(), SupervisorState::Stopped);
    assert!(executor.connection().current().is_none());
    assert!(!xctl_process::process_exists(pid).unwrap());
}

#[tokio::test]
async fn test_crashed_companion_is_restarted_on_next_call() {
    let dir = tempfile::tempdir().unwrap();
    let spawns = dir.path().join("spawns");
    let script = write_companion(
        dir.path(),
        &format!(
            "echo x >> {}\necho '{{\"port\":{}}}'\nsleep 0.3\nexit 0",
            spawns.display(),
            closed_port()
        ),
    );
    let mut executor = executor_for(&script);

    let _ = describe(&mut executor).await;
    let first = executor.connection().current().unwrap().handle();

    let deadline = Instant::now() + Duration::from_secs(5);
    while executor.connection_mut().host_mut().is_running() {
        assert!(Instant::now() < deadline, "companion never exited");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(executor.connection().host().state(), SupervisorState::Failed);

    let _ = describe(&mut executor).await;

    assert!(first.is_retired());
    assert_eq!(executor.connection().generation(), 2);
    assert_eq!(fs::read_to_string(&spawns).unwrap().lines().count(), 2);

    executor.shutdown().await;
}

#[tokio::test]
async fn test_missing_binary_surfaces_remediation() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = executor_for(&dir.path().join("idb_companion"));

    let err = describe(&mut executor).await.unwrap_err();
    assert!(matches!(err, CompanionError::BinaryNotFound { .. }));
    assert!(err.to_string().contains("IDB_COMPANION_PATH"));
    assert_eq!(executor.connection().generation(), 0);
}
