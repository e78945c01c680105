//! Resilient call executor.
//!
//! Wraps one logical RPC in a bounded reconnect loop:
//!
//! 1. ensure a live channel (starting the companion if needed);
//! 2. run the call under the operation deadline, with the caller's
//!    cancellation taking priority;
//! 3. on [`CompanionError::TransportCorruption`] with budget left,
//!    reconnect and go to 2;
//! 4. anything else is returned unchanged.
//!
//! For streaming calls the loop covers establishment only. A stream that
//! already moved payload reports its failure as
//! [`CompanionError::StreamInterrupted`], which is never retried.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::{Response, Status};
use tracing::{debug, warn};

use crate::config::CompanionOptions;
use crate::connection::{CompanionHost, ConnectionManager};
use crate::error::{CompanionError, CompanionResult};
use crate::proto::CompanionClient;
use crate::supervisor::CompanionSupervisor;

/// Retry and deadline policy for each logical call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Channel rebuilds allowed per call.
    pub max_reconnects: u32,
    /// Deadline for a single attempt.
    pub operation_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_options(&CompanionOptions::default())
    }
}

impl RetryPolicy {
    pub fn from_options(options: &CompanionOptions) -> Self {
        Self {
            max_reconnects: options.max_reconnects,
            operation_timeout: options.operation_timeout,
        }
    }

    /// Total attempts a call may make.
    pub fn max_attempts(&self) -> u32 {
        self.max_reconnects.saturating_add(1)
    }
}

pub struct ResilientExecutor<H: CompanionHost = CompanionSupervisor> {
    connection: ConnectionManager<H>,
    policy: RetryPolicy,
    reconnects: u64,
}

impl ResilientExecutor<CompanionSupervisor> {
    /// Executor over a fresh supervisor built from `options`.
    pub fn from_options(options: CompanionOptions) -> Self {
        let policy = RetryPolicy::from_options(&options);
        Self::new(
            ConnectionManager::new(CompanionSupervisor::new(options)),
            policy,
        )
    }
}

impl<H: CompanionHost> ResilientExecutor<H> {
    pub fn new(connection: ConnectionManager<H>, policy: RetryPolicy) -> Self {
        Self {
            connection,
            policy,
            reconnects: 0,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn connection(&self) -> &ConnectionManager<H> {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut ConnectionManager<H> {
        &mut self.connection
    }

    /// Reconnects performed over this executor's lifetime.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects
    }

    /// Runs `call` with reconnect-on-corruption.
    ///
    /// `call` is invoked once per attempt with a fresh client bound to the
    /// current channel; it must classify its own failures (see
    /// [`CompanionError::from_status`]).
    pub async fn call<T, F, Fut>(
        &mut self,
        operation: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> CompanionResult<T>
    where
        F: FnMut(CompanionClient) -> Fut,
        Fut: Future<Output = CompanionResult<T>>,
    {
        let mut live = self.connection.ensure_connected(cancel).await?;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            debug!(operation, attempt, generation = live.generation(), "Invoking companion call");

            let result = with_deadline(
                cancel,
                self.policy.operation_timeout,
                operation,
                call(live.client()?),
            )
            .await;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transport_corruption() && attempt <= self.policy.max_reconnects => {
                    warn!(
                        operation,
                        attempt,
                        max_reconnects = self.policy.max_reconnects,
                        error = %e,
                        "Transport corrupted, rebuilding channel"
                    );
                    self.reconnects += 1;
                    live = self.connection.reconnect(cancel).await?;
                }
                Err(e) => {
                    if e.is_transport_corruption() {
                        warn!(operation, attempts = attempt, "Reconnect budget exhausted");
                    }
                    return Err(e.with_attempts(attempt));
                }
            }
        }
    }

    /// [`call`](Self::call) for a plain stub method returning a tonic
    /// response; the status is classified here.
    pub async fn invoke<T, F, Fut>(
        &mut self,
        operation: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> CompanionResult<T>
    where
        F: FnMut(CompanionClient) -> Fut,
        Fut: Future<Output = Result<Response<T>, Status>>,
    {
        let op = operation.to_string();
        self.call(operation, cancel, move |client| {
            let fut = call(client);
            let op = op.clone();
            async move {
                fut.await
                    .map(Response::into_inner)
                    .map_err(|status| CompanionError::from_status(op, status))
            }
        })
        .await
    }

    /// Retires the channel and stops the companion. Never fails.
    pub async fn shutdown(&mut self) {
        self.connection.shutdown().await;
    }
}

/// Runs `fut` under `limit`, aborting early if `cancel` fires.
///
/// Cancellation is checked first, so a cancelled caller never sees a
/// `Timeout` instead.
pub async fn with_deadline<T, Fut>(
    cancel: &CancellationToken,
    limit: Duration,
    operation: &str,
    fut: Fut,
) -> CompanionResult<T>
where
    Fut: Future<Output = CompanionResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CompanionError::cancelled(operation)),
        res = tokio::time::timeout(limit, fut) => match res {
            Ok(result) => result,
            Err(_) => Err(CompanionError::timeout(operation, limit)),
        },
    }
}
