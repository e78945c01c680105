//! Companion RPC contract.
//!
//! Message definitions and a client stub for the subset of the
//! `idb.CompanionService` surface the automation layer drives. The stub
//! is written out by hand (no build-time protoc step) and mirrors what
//! `tonic-build` would generate: one method per RPC, each waiting for the
//! channel to be ready and then dispatching through [`tonic::client::Grpc`]
//! with the prost codec.
//!
//! The core treats every method here as opaque. Connection establishment
//! and retry live in [`crate::connection`] and [`crate::executor`].

use std::collections::HashMap;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::codegen::{Body, Bytes, StdError};
use tonic::{IntoRequest, IntoStreamingRequest, Response, Status, Streaming};

use crate::connection::GuardedChannel;

/// Fully qualified service name.
pub const SERVICE_NAME: &str = "idb.CompanionService";

// ----------------------------------------------------------------------------
// Session / target metadata
// ----------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectRequest {
    #[prost(map = "string, string", tag = "1")]
    pub metadata: HashMap<String, String>,
    #[prost(bool, tag = "2")]
    pub local_file_paths: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectResponse {
    #[prost(message, optional, tag = "1")]
    pub companion: Option<CompanionInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompanionInfo {
    #[prost(string, tag = "1")]
    pub udid: String,
    #[prost(bool, tag = "2")]
    pub is_local: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TargetDescriptionRequest {
    #[prost(bool, tag = "1")]
    pub fetch_diagnostics: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TargetDescriptionResponse {
    #[prost(message, optional, tag = "1")]
    pub target_description: Option<TargetDescription>,
    #[prost(message, optional, tag = "2")]
    pub companion: Option<CompanionInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TargetDescription {
    #[prost(string, tag = "1")]
    pub udid: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub state: String,
    #[prost(string, tag = "4")]
    pub target_type: String,
    #[prost(string, tag = "5")]
    pub os_version: String,
    #[prost(string, tag = "6")]
    pub architecture: String,
}

// ----------------------------------------------------------------------------
// App lifecycle
// ----------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListAppsRequest {
    #[prost(bool, tag = "1")]
    pub suppress_process_state: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListAppsResponse {
    #[prost(message, repeated, tag = "1")]
    pub apps: Vec<InstalledAppInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstalledAppInfo {
    #[prost(string, tag = "1")]
    pub bundle_id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, repeated, tag = "3")]
    pub architectures: Vec<String>,
    #[prost(string, tag = "4")]
    pub install_type: String,
    #[prost(enumeration = "AppProcessState", tag = "5")]
    pub process_state: i32,
    #[prost(bool, tag = "6")]
    pub debuggable: bool,
    #[prost(uint64, tag = "7")]
    pub process_identifier: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum AppProcessState {
    Unknown = 0,
    NotRunning = 1,
    Running = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TerminateRequest {
    #[prost(string, tag = "1")]
    pub bundle_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TerminateResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UninstallRequest {
    #[prost(string, tag = "1")]
    pub bundle_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UninstallResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LaunchRequest {
    #[prost(string, tag = "1")]
    pub bundle_id: String,
    #[prost(map = "string, string", tag = "2")]
    pub env: HashMap<String, String>,
    #[prost(string, repeated, tag = "3")]
    pub app_args: Vec<String>,
    #[prost(bool, tag = "4")]
    pub foreground_if_running: bool,
    #[prost(bool, tag = "5")]
    pub wait_for_debugger: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LaunchResponse {
    #[prost(uint64, tag = "1")]
    pub pid: u64,
}

// ----------------------------------------------------------------------------
// Capture and logs
// ----------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScreenshotRequest {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ScreenshotResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub image_data: Vec<u8>,
    #[prost(string, tag = "2")]
    pub image_format: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogRequest {
    #[prost(string, repeated, tag = "1")]
    pub arguments: Vec<String>,
    #[prost(enumeration = "LogSource", tag = "2")]
    pub source: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum LogSource {
    Target = 0,
    Companion = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub output: Vec<u8>,
}

// ----------------------------------------------------------------------------
// File transfer
// ----------------------------------------------------------------------------

/// A chunk of transferred content.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Payload {
    #[prost(oneof = "payload::Source", tags = "1, 2")]
    pub source: Option<payload::Source>,
}

pub mod payload {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Source {
        #[prost(bytes, tag = "1")]
        Data(Vec<u8>),
        /// Path on the companion host, for companions sharing a filesystem.
        #[prost(string, tag = "2")]
        FilePath(String),
    }
}

impl Payload {
    pub fn data(data: Vec<u8>) -> Self {
        Self {
            source: Some(payload::Source::Data(data)),
        }
    }
}

/// First message of a push stream names the destination; every later one
/// carries payload.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushRequest {
    #[prost(oneof = "push_request::Value", tags = "1, 2")]
    pub value: Option<push_request::Value>,
}

pub mod push_request {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Inner {
        #[prost(string, tag = "1")]
        pub bundle_id: String,
        #[prost(string, tag = "2")]
        pub dst_path: String,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(message, tag = "1")]
        Inner(Inner),
        #[prost(message, tag = "2")]
        Payload(super::Payload),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PushResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PullRequest {
    #[prost(string, tag = "1")]
    pub bundle_id: String,
    #[prost(string, tag = "2")]
    pub src_path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PullResponse {
    #[prost(message, optional, tag = "1")]
    pub payload: Option<Payload>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstallRequest {
    #[prost(oneof = "install_request::Value", tags = "1, 2, 3, 4")]
    pub value: Option<install_request::Value>,
}

pub mod install_request {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Destination {
        App = 0,
        Xctest = 1,
        Dylib = 2,
        Dsym = 3,
        Framework = 4,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(enumeration = "Destination", tag = "1")]
        Destination(i32),
        #[prost(message, tag = "2")]
        Payload(super::Payload),
        #[prost(string, tag = "3")]
        NameHint(String),
        #[prost(bool, tag = "4")]
        MakeDebuggable(bool),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InstallResponse {
    #[prost(double, tag = "1")]
    pub progress: f64,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub uuid: String,
}

// ----------------------------------------------------------------------------
// Input injection
// ----------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Point {
    #[prost(double, tag = "1")]
    pub x: f64,
    #[prost(double, tag = "2")]
    pub y: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum HidDirection {
    Down = 0,
    Up = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum HidButton {
    ApplePay = 0,
    Home = 1,
    Lock = 2,
    SideButton = 3,
    Siri = 4,
}

/// One input event. A stream of these is replayed in order.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HidEvent {
    #[prost(oneof = "hid_event::Event", tags = "1, 2, 3")]
    pub event: Option<hid_event::Event>,
}

pub mod hid_event {
    use super::Point;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Press {
        #[prost(oneof = "Action", tags = "1, 2, 3")]
        pub action: Option<Action>,
        #[prost(enumeration = "super::HidDirection", tag = "4")]
        pub direction: i32,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Action {
        #[prost(message, tag = "1")]
        Touch(Point),
        #[prost(enumeration = "super::HidButton", tag = "2")]
        Button(i32),
        #[prost(uint64, tag = "3")]
        Key(u64),
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Swipe {
        #[prost(message, optional, tag = "1")]
        pub start: Option<Point>,
        #[prost(message, optional, tag = "2")]
        pub end: Option<Point>,
        #[prost(double, tag = "3")]
        pub delta: f64,
        #[prost(double, tag = "4")]
        pub duration: f64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Delay {
        #[prost(double, tag = "1")]
        pub duration: f64,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Event {
        #[prost(message, tag = "1")]
        Press(Press),
        #[prost(message, tag = "2")]
        Swipe(Swipe),
        #[prost(message, tag = "3")]
        Delay(Delay),
    }
}

impl HidEvent {
    pub fn press(action: hid_event::Action, direction: HidDirection) -> Self {
        Self {
            event: Some(hid_event::Event::Press(hid_event::Press {
                action: Some(action),
                direction: direction as i32,
            })),
        }
    }

    /// Touch down then up at one point.
    pub fn tap(x: f64, y: f64) -> [Self; 2] {
        let touch = || hid_event::Action::Touch(Point { x, y });
        [
            Self::press(touch(), HidDirection::Down),
            Self::press(touch(), HidDirection::Up),
        ]
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HidResponse {}

// ----------------------------------------------------------------------------
// Test execution
// ----------------------------------------------------------------------------

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct XctestRunRequest {
    #[prost(oneof = "xctest_run_request::Mode", tags = "1, 2, 3")]
    pub mode: Option<xctest_run_request::Mode>,
    #[prost(string, tag = "4")]
    pub test_bundle_id: String,
    #[prost(string, repeated, tag = "5")]
    pub tests_to_run: Vec<String>,
    #[prost(string, repeated, tag = "6")]
    pub tests_to_skip: Vec<String>,
    /// Seconds; zero means the companion default.
    #[prost(uint64, tag = "7")]
    pub timeout: u64,
}

pub mod xctest_run_request {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Logic {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Application {
        #[prost(string, tag = "1")]
        pub app_bundle_id: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Ui {
        #[prost(string, tag = "1")]
        pub app_bundle_id: String,
        #[prost(string, tag = "2")]
        pub test_host_app_bundle_id: String,
    }

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Mode {
        #[prost(message, tag = "1")]
        Logic(Logic),
        #[prost(message, tag = "2")]
        Application(Application),
        #[prost(message, tag = "3")]
        Ui(Ui),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum XctestRunStatus {
    Running = 0,
    TerminatedNormally = 1,
    TerminatedAbnormally = 2,
}

/// Incremental report: results finished since the previous message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct XctestRunResponse {
    #[prost(enumeration = "XctestRunStatus", tag = "1")]
    pub status: i32,
    #[prost(message, repeated, tag = "2")]
    pub results: Vec<TestRunInfo>,
    #[prost(string, repeated, tag = "3")]
    pub log_output: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TestRunInfo {
    #[prost(string, tag = "1")]
    pub bundle_name: String,
    #[prost(string, tag = "2")]
    pub class_name: String,
    #[prost(string, tag = "3")]
    pub method_name: String,
    #[prost(bool, tag = "4")]
    pub passed: bool,
    #[prost(bool, tag = "5")]
    pub crashed: bool,
    #[prost(double, tag = "6")]
    pub duration: f64,
    #[prost(message, optional, tag = "7")]
    pub failure_info: Option<TestFailureInfo>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TestFailureInfo {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(string, tag = "2")]
    pub file: String,
    #[prost(uint64, tag = "3")]
    pub line: u64,
}

// ----------------------------------------------------------------------------
// Client stub
// ----------------------------------------------------------------------------

/// Client for `idb.CompanionService` over any gRPC transport.
#[derive(Debug, Clone)]
pub struct CompanionServiceClient<T> {
    inner: tonic::client::Grpc<T>,
}

/// The client type handed to every call the executor runs.
pub type CompanionClient = CompanionServiceClient<GuardedChannel>;

impl<T> CompanionServiceClient<T>
where
    T: tonic::client::GrpcService<tonic::body::BoxBody>,
    T::Error: Into<StdError>,
    T::ResponseBody: Body<Data = Bytes> + Send + 'static,
    <T::ResponseBody as Body>::Error: Into<StdError> + Send,
{
    pub fn new(inner: T) -> Self {
        Self {
            inner: tonic::client::Grpc::new(inner),
        }
    }

    /// Limits the size of a decoded response message.
    #[must_use]
    pub fn max_decoding_message_size(mut self, limit: usize) -> Self {
        self.inner = self.inner.max_decoding_message_size(limit);
        self
    }

    /// Limits the size of an encoded request message.
    #[must_use]
    pub fn max_encoding_message_size(mut self, limit: usize) -> Self {
        self.inner = self.inner.max_encoding_message_size(limit);
        self
    }

    /// A transport refusing requests surfaces its own status when it
    /// carries one.
    async fn ready(&mut self) -> Result<(), Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::from_error(e.into()))
    }

    pub async fn connect(
        &mut self,
        request: impl IntoRequest<ConnectRequest>,
    ) -> Result<Response<ConnectResponse>, Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/idb.CompanionService/connect");
        self.inner.unary(request.into_request(), path, codec).await
    }

    pub async fn describe(
        &mut self,
        request: impl IntoRequest<TargetDescriptionRequest>,
    ) -> Result<Response<TargetDescriptionResponse>, Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/idb.CompanionService/describe");
        self.inner.unary(request.into_request(), path, codec).await
    }

    pub async fn list_apps(
        &mut self,
        request: impl IntoRequest<ListAppsRequest>,
    ) -> Result<Response<ListAppsResponse>, Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/idb.CompanionService/list_apps");
        self.inner.unary(request.into_request(), path, codec).await
    }

    pub async fn terminate(
        &mut self,
        request: impl IntoRequest<TerminateRequest>,
    ) -> Result<Response<TerminateResponse>, Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/idb.CompanionService/terminate");
        self.inner.unary(request.into_request(), path, codec).await
    }

    pub async fn uninstall(
        &mut self,
        request: impl IntoRequest<UninstallRequest>,
    ) -> Result<Response<UninstallResponse>, Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/idb.CompanionService/uninstall");
        self.inner.unary(request.into_request(), path, codec).await
    }

    pub async fn launch(
        &mut self,
        request: impl IntoRequest<LaunchRequest>,
    ) -> Result<Response<LaunchResponse>, Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/idb.CompanionService/launch");
        self.inner.unary(request.into_request(), path, codec).await
    }

    pub async fn screenshot(
        &mut self,
        request: impl IntoRequest<ScreenshotRequest>,
    ) -> Result<Response<ScreenshotResponse>, Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/idb.CompanionService/screenshot");
        self.inner.unary(request.into_request(), path, codec).await
    }

    /// Server streaming: log output until the caller drops the stream.
    pub async fn log(
        &mut self,
        request: impl IntoRequest<LogRequest>,
    ) -> Result<Response<Streaming<LogResponse>>, Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/idb.CompanionService/log");
        self.inner
            .server_streaming(request.into_request(), path, codec)
            .await
    }

    /// Server streaming: file content as payload chunks.
    pub async fn pull(
        &mut self,
        request: impl IntoRequest<PullRequest>,
    ) -> Result<Response<Streaming<PullResponse>>, Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/idb.CompanionService/pull");
        self.inner
            .server_streaming(request.into_request(), path, codec)
            .await
    }

    /// Client streaming: input events, replayed in order.
    pub async fn hid(
        &mut self,
        request: impl IntoStreamingRequest<Message = HidEvent>,
    ) -> Result<Response<HidResponse>, Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/idb.CompanionService/hid");
        self.inner
            .client_streaming(request.into_streaming_request(), path, codec)
            .await
    }

    /// Server streaming: incremental test results until the run ends.
    pub async fn xctest_run(
        &mut self,
        request: impl IntoRequest<XctestRunRequest>,
    ) -> Result<Response<Streaming<XctestRunResponse>>, Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/idb.CompanionService/xctest_run");
        self.inner
            .server_streaming(request.into_request(), path, codec)
            .await
    }

    /// Client streaming: destination header followed by payload chunks.
    pub async fn push(
        &mut self,
        request: impl IntoStreamingRequest<Message = PushRequest>,
    ) -> Result<Response<PushResponse>, Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/idb.CompanionService/push");
        self.inner
            .client_streaming(request.into_streaming_request(), path, codec)
            .await
    }

    /// Bidirectional streaming: artifact chunks up, progress down.
    pub async fn install(
        &mut self,
        request: impl IntoStreamingRequest<Message = InstallRequest>,
    ) -> Result<Response<Streaming<InstallResponse>>, Status> {
        self.ready().await?;
        let codec = tonic::codec::ProstCodec::default();
        let path = PathAndQuery::from_static("/idb.CompanionService/install");
        self.inner
            .streaming(request.into_streaming_request(), path, codec)
            .await
    }
}
