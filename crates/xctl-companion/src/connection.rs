//! Connection manager.
//!
//! Owns the single RPC channel to the companion and the host that keeps
//! the companion alive. All channel mutation goes through
//! [`ConnectionManager::ensure_connected`], [`ConnectionManager::reconnect`]
//! and [`ConnectionManager::disconnect`]; nothing else replaces it.
//!
//! # Rust Learning Note
//!
//! The manager is generic over [`CompanionHost`] with the real supervisor
//! as the default type parameter. Production code writes
//! `ConnectionManager::new(supervisor)` and never names the parameter;
//! tests plug in a fake host that needs no subprocess.

use async_trait::async_trait;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::body::BoxBody;
use tonic::codegen::{http, BoxFuture, Service, StdError};
use tonic::transport::Channel;
use tonic::Status;
use tracing::{debug, info};
use xctl_common::Endpoint;

use crate::error::{CompanionError, CompanionResult};
use crate::proto::{CompanionClient, CompanionServiceClient};
use crate::supervisor::CompanionSupervisor;

/// Largest request or response message (screenshots, file chunks).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Something that can keep a companion running and report where it
/// listens.
#[async_trait]
pub trait CompanionHost: Send {
    /// `true` while the companion is up. May refresh internal state.
    fn is_running(&mut self) -> bool;

    /// The published endpoint while running.
    fn endpoint(&self) -> Option<Endpoint>;

    /// Starts the companion. Errors are surfaced unchanged.
    async fn start_companion(&mut self, cancel: &CancellationToken) -> CompanionResult<Endpoint>;

    /// Stops the companion. Never fails.
    async fn stop_companion(&mut self);
}

/// A tonic channel that refuses every request once its generation has
/// been retired.
///
/// Clients cloned before retirement share the token, so they fail too
/// instead of opening a second connection next to the new channel.
#[derive(Debug, Clone)]
pub struct GuardedChannel {
    inner: Channel,
    retired: CancellationToken,
}

impl GuardedChannel {
    fn retired_error() -> StdError {
        Box::new(Status::unavailable("companion channel retired"))
    }
}

impl Service<http::Request<BoxBody>> for GuardedChannel {
    type Response = <Channel as Service<http::Request<BoxBody>>>::Response;
    type Error = StdError;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.retired.is_cancelled() {
            return Poll::Ready(Err(Self::retired_error()));
        }
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, request: http::Request<BoxBody>) -> Self::Future {
        if self.retired.is_cancelled() {
            return Box::pin(async { Err(Self::retired_error()) });
        }
        let response = self.inner.call(request);
        Box::pin(async move { response.await.map_err(Into::into) })
    }
}

/// The active channel plus its identity.
#[derive(Debug, Clone)]
pub struct LiveChannel {
    channel: Channel,
    endpoint: Endpoint,
    generation: u64,
    retired: CancellationToken,
}

impl LiveChannel {
    /// A client stub bound to this channel, with the message size policy
    /// applied. Fails with [`CompanionError::Closed`] once retired.
    pub fn client(&self) -> CompanionResult<CompanionClient> {
        if self.is_retired() {
            return Err(CompanionError::Closed);
        }
        let guarded = GuardedChannel {
            inner: self.channel.clone(),
            retired: self.retired.clone(),
        };
        Ok(CompanionServiceClient::new(guarded)
            .max_decoding_message_size(MAX_MESSAGE_SIZE)
            .max_encoding_message_size(MAX_MESSAGE_SIZE))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            generation: self.generation,
            retired: self.retired.clone(),
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired.is_cancelled()
    }
}

/// Observer for one channel generation.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    generation: u64,
    retired: CancellationToken,
}

impl ChannelHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_retired(&self) -> bool {
        self.retired.is_cancelled()
    }

    /// Resolves once the channel has been retired.
    pub async fn retired(&self) {
        self.retired.cancelled().await
    }
}

pub struct ConnectionManager<H: CompanionHost = CompanionSupervisor> {
    host: H,
    channel: Option<LiveChannel>,
    generation: u64,
}

impl<H: CompanionHost> std::fmt::Debug for ConnectionManager<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.channel.as_ref().map(|c| c.endpoint.clone()))
            .field("generation", &self.generation)
            .finish()
    }
}

impl<H: CompanionHost> ConnectionManager<H> {
    pub fn new(host: H) -> Self {
        Self {
            host,
            channel: None,
            generation: 0,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    /// Number of channels built so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current(&self) -> Option<&LiveChannel> {
        self.channel.as_ref()
    }

    /// Returns the live channel, starting the companion and building a
    /// channel first if needed.
    ///
    /// With a channel present and the host running this does no I/O.
    pub async fn ensure_connected(
        &mut self,
        cancel: &CancellationToken,
    ) -> CompanionResult<LiveChannel> {
        let running = self.host.is_running();
        if running {
            if let Some(live) = &self.channel {
                return Ok(live.clone());
            }
        }

        if self.channel.is_some() {
            self.retire_current("companion no longer running");
        }

        let endpoint = match (running, self.host.endpoint()) {
            (true, Some(endpoint)) => endpoint,
            _ => self.host.start_companion(cancel).await?,
        };

        let channel = build_channel(&endpoint)?;
        self.generation += 1;
        let live = LiveChannel {
            channel,
            endpoint,
            generation: self.generation,
            retired: CancellationToken::new(),
        };
        info!(
            endpoint = %live.endpoint,
            generation = live.generation,
            "🔌 Companion channel ready"
        );
        self.channel = Some(live.clone());
        Ok(live)
    }

    /// Retires the current channel, then builds a new one.
    ///
    /// The old channel is retired before the new one exists, so no caller
    /// ever sees two live channels.
    pub async fn reconnect(&mut self, cancel: &CancellationToken) -> CompanionResult<LiveChannel> {
        self.retire_current("reconnect requested");
        self.ensure_connected(cancel).await
    }

    /// Retires the channel without touching the companion.
    pub fn disconnect(&mut self) {
        self.retire_current("disconnect requested");
    }

    /// Retires the channel, then stops the companion. Never fails.
    pub async fn shutdown(&mut self) {
        self.retire_current("shutdown");
        self.host.stop_companion().await;
    }

    fn retire_current(&mut self, reason: &str) {
        if let Some(live) = self.channel.take() {
            live.retired.cancel();
            debug!(
                endpoint = %live.endpoint,
                generation = live.generation,
                reason,
                "Retired companion channel"
            );
        }
    }
}

/// Builds a lazily connecting channel to `endpoint`.
///
/// Plaintext HTTP/2 with keepalive pings while idle; tonic multiplexes
/// concurrent streams over the one connection.
pub fn build_channel(endpoint: &Endpoint) -> CompanionResult<Channel> {
    let uri = endpoint.uri();
    let channel = tonic::transport::Endpoint::from_shared(uri.clone())
        .map_err(|e| CompanionError::InvalidEndpoint {
            reason: format!("{}: {}", uri, e),
        })?
        .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
        .keep_alive_timeout(KEEPALIVE_TIMEOUT)
        .keep_alive_while_idle(true)
        .http2_adaptive_window(true)
        .tcp_nodelay(true)
        .connect_timeout(CONNECT_TIMEOUT)
        .connect_lazy();
    Ok(channel)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Scripted host: "starts" instantly on a fixed port.
    #[derive(Debug, Default)]
    pub struct FakeHost {
        pub running: bool,
        pub port: u16,
        pub starts: u32,
        pub stops: u32,
        pub start_error: Option<fn() -> CompanionError>,
    }

    impl FakeHost {
        pub fn new(port: u16) -> Self {
            Self {
                port,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl CompanionHost for FakeHost {
        fn is_running(&mut self) -> bool {
            self.running
        }

        fn endpoint(&self) -> Option<Endpoint> {
            if self.running {
                Endpoint::new("127.0.0.1", self.port)
            } else {
                None
            }
        }

        async fn start_companion(
            &mut self,
            _cancel: &CancellationToken,
        ) -> CompanionResult<Endpoint> {
            if let Some(make_error) = self.start_error {
                return Err(make_error());
            }
            self.starts += 1;
            self.running = true;
            Endpoint::new("127.0.0.1", self.port).ok_or(CompanionError::InvalidEndpoint {
                reason: "port 0".to_string(),
            })
        }

        async fn stop_companion(&mut self) {
            self.stops += 1;
            self.running = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeHost;
    use super::*;
    use crate::proto::TargetDescriptionRequest;

    #[tokio::test]
    async fn test_ensure_connected_starts_host_once() {
        let mut manager = ConnectionManager::new(FakeHost::new(50051));
        let cancel = CancellationToken::new();

        let first = manager.ensure_connected(&cancel).await.unwrap();
        let second = manager.ensure_connected(&cancel).await.unwrap();

        assert_eq!(manager.host().starts, 1);
        assert_eq!(first.generation(), 1);
        assert_eq!(second.generation(), 1);
        assert_eq!(first.endpoint().port(), 50051);
        assert!(!first.is_retired());
    }

    #[tokio::test]
    async fn test_reconnect_retires_previous_channel() {
        let mut manager = ConnectionManager::new(FakeHost::new(50051));
        let cancel = CancellationToken::new();

        let first = manager.ensure_connected(&cancel).await.unwrap();
        let old = first.handle();

        let second = manager.reconnect(&cancel).await.unwrap();

        assert!(old.is_retired());
        assert!(first.is_retired());
        assert!(!second.is_retired());
        assert_eq!(second.generation(), 2);
        assert_eq!(manager.current().map(|c| c.generation()), Some(2));
        // The companion itself was left alone
        assert_eq!(manager.host().starts, 1);
    }

    #[tokio::test]
    async fn test_retired_channel_rejects_calls() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut manager = ConnectionManager::new(FakeHost::new(port));
        let cancel = CancellationToken::new();

        let first = manager.ensure_connected(&cancel).await.unwrap();
        let mut stale = first.client().unwrap();
        let second = manager.reconnect(&cancel).await.unwrap();

        assert!(first.is_retired());
        assert!(matches!(first.client(), Err(CompanionError::Closed)));
        assert!(second.client().is_ok());

        let status = stale
            .describe(TargetDescriptionRequest::default())
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert!(status.message().contains("retired"), "got {:?}", status);

        // The stale client never dialed the companion
        let accepted = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(accepted.is_err(), "retired channel opened a connection");
    }

    #[tokio::test]
    async fn test_dead_host_is_restarted() {
        let mut manager = ConnectionManager::new(FakeHost::new(50051));
        let cancel = CancellationToken::new();

        let first = manager.ensure_connected(&cancel).await.unwrap();
        manager.host_mut().running = false;

        let second = manager.ensure_connected(&cancel).await.unwrap();
        assert!(first.is_retired());
        assert_eq!(second.generation(), 2);
        assert_eq!(manager.host().starts, 2);
    }

    #[tokio::test]
    async fn test_start_error_propagates_unchanged() {
        let mut host = FakeHost::new(50051);
        host.start_error = Some(|| CompanionError::startup_timeout(Duration::from_secs(30), "no port"));
        let mut manager = ConnectionManager::new(host);

        let err = manager
            .ensure_connected(&CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            CompanionError::StartupTimeout { stderr, .. } => assert_eq!(stderr, "no port"),
            other => panic!("Expected StartupTimeout, got {:?}", other),
        }
        assert!(manager.current().is_none());
        assert_eq!(manager.generation(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_retires_then_stops() {
        let mut manager = ConnectionManager::new(FakeHost::new(50051));
        let cancel = CancellationToken::new();
        let handle = manager.ensure_connected(&cancel).await.unwrap().handle();

        manager.shutdown().await;
        assert!(handle.is_retired());
        assert!(manager.current().is_none());
        assert_eq!(manager.host().stops, 1);

        manager.shutdown().await;
        assert_eq!(manager.host().stops, 2);
    }

    #[tokio::test]
    async fn test_retired_handle_resolves() {
        let mut manager = ConnectionManager::new(FakeHost::new(50051));
        let handle = manager
            .ensure_connected(&CancellationToken::new())
            .await
            .unwrap()
            .handle();

        manager.disconnect();
        tokio::time::timeout(Duration::from_secs(1), handle.retired())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_build_channel_for_ipv6_host() {
        let endpoint = Endpoint::new("::1", 10882).unwrap();
        assert!(build_channel(&endpoint).is_ok());
    }
}
