//! Thin helpers over the async runtime: task spawning, timeouts, worker lifetime tracking, and
//! the TCP/TLS stream abstraction.

mod acknowledged_message;
mod join_handle;
mod stream;
#[cfg(feature = "rustls-tls")]
mod tls_rustls;
mod worker_handle;

use std::{future::Future, time::Duration};

pub(crate) use self::{
    acknowledged_message::{AcknowledgedMessage, AcknowledgmentReceiver, AcknowledgmentSender},
    join_handle::AsyncJoinHandle,
    stream::{AsyncStream, StreamOptions},
    worker_handle::{WorkerHandle, WorkerHandleListener},
};
#[cfg(feature = "rustls-tls")]
pub(crate) use tls_rustls::TlsConfig;

use crate::error::{Error, Result};

/// Spawn a task in the background to run a future.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::new(tokio::task::spawn(fut))
}

/// Await a future for up to `timeout`, converting elapse into a network timeout error.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::network_timeout())
}

/// Delay for the given duration.
pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}

/// A ticking interval that skips missed ticks rather than bursting to catch up.
pub(crate) fn interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval
}

/// Whether this process appears to be running in a function-as-a-service environment, detected
/// through the environment variables the major providers set. Streaming monitors are avoided in
/// such environments because execution can be suspended between invocations.
pub(crate) fn is_faas() -> bool {
    const VARS: &[&str] = &[
        "AWS_LAMBDA_RUNTIME_API",
        "FUNCTIONS_WORKER_RUNTIME",
        "K_SERVICE",
        "VERCEL",
    ];
    VARS.iter().any(|var| std::env::var_os(var).is_some())
        || std::env::var("AWS_EXECUTION_ENV")
            .map(|v| v.starts_with("AWS_Lambda_"))
            .unwrap_or(false)
}
