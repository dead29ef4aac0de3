//! Timeout wrapper for async operations.

use conveyor_core::ConveyorError;
use std::future::Future;
use std::time::Duration;

/// Returned when an operation outlives its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed {
    /// The deadline that was exceeded.
    pub after: Duration,
}

impl std::fmt::Display for Elapsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation timed out after {:?}", self.after)
    }
}

impl std::error::Error for Elapsed {}

impl From<Elapsed> for ConveyorError {
    fn from(err: Elapsed) -> Self {
        ConveyorError::Timeout(err.to_string())
    }
}

/// Runs a future under a deadline, dropping (cancelling) it when the deadline passes.
pub async fn run_with_timeout<Fut>(duration: Duration, fut: Fut) -> Result<Fut::Output, Elapsed>
where
    Fut: Future,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| Elapsed { after: duration })
}

/// Wraps a fallible async operation with a timeout.
pub async fn with_timeout<F, Fut, T>(duration: Duration, f: F) -> Result<T, ConveyorError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ConveyorError>>,
{
    run_with_timeout(duration, f()).await?
}
