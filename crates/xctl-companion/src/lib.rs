//! # xctl Companion
//!
//! Supervises the `idb_companion` process and keeps a resilient gRPC
//! channel to it.
//!
//! The layers, bottom-up:
//!
//! - [`locator`] - find the companion binary (explicit path, environment
//!   override, bundled layout, package-manager paths)
//! - [`supervisor`] - spawn it, discover its port from its output, stop it
//! - [`connection`] - own the channel, rebuild it on demand
//! - [`executor`] - bounded reconnect-on-corruption around each call
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use xctl_companion::{CompanionOptions, ResilientExecutor, proto};
//!
//! # async fn example() -> xctl_companion::CompanionResult<()> {
//! let options = CompanionOptions::new("5A1B7C2E-0D3F-4E8A-9B6C-1D2E3F4A5B6C");
//! let mut executor = ResilientExecutor::from_options(options);
//! let cancel = CancellationToken::new();
//!
//! let description = executor
//!     .invoke("describe", &cancel, |mut client| async move {
//!         client.describe(proto::TargetDescriptionRequest::default()).await
//!     })
//!     .await?;
//! println!("{:?}", description.target_description);
//!
//! executor.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod locator;
pub mod output;
pub mod proto;
pub mod state;
pub mod supervisor;

pub use config::{CompanionConfig, CompanionOptions, BINARY_ENV_VAR};
pub use connection::{ChannelHandle, CompanionHost, ConnectionManager, GuardedChannel, LiveChannel};
pub use error::{CompanionError, CompanionResult};
pub use executor::{with_deadline, ResilientExecutor, RetryPolicy};
pub use locator::BinaryLocator;
pub use proto::CompanionClient;
pub use state::{SupervisorState, SupervisorStateMachine};
pub use supervisor::CompanionSupervisor;
