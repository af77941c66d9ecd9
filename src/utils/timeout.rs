//! Async timeout wrappers and default durations.

use crate::error::{DbusError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Default timeout for connect, auth and Hello
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `disconnect()` waits for the writer to flush
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Run a fallible `fut` with a deadline, flattening the result.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(DbusError::Timeout),
    }
}

/// Like [`with_timeout_error`], waiting indefinitely when `duration` is `None`.
pub async fn maybe_timeout<F, T>(fut: F, duration: Option<Duration>) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match duration {
        Some(duration) => with_timeout_error(fut, duration).await,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn elapsed_deadline_is_a_timeout() {
        let result = with_timeout_error(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(DbusError::Timeout)));
    }

    #[tokio::test]
    async fn inner_error_passes_through() {
        let result: Result<()> = with_timeout_error(
            async { Err(DbusError::Client("nope".into())) },
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(DbusError::Client(_))));
    }

    #[tokio::test]
    async fn no_deadline_waits() {
        let result = maybe_timeout(
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(7)
            },
            None,
        )
        .await;
        assert_eq!(result.unwrap(), 7);
    }
}
