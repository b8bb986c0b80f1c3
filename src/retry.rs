// batch_ingestor/src/retry.rs
// Transport-level retries for single calls, built on the backoff crate.

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::ExponentialBackoffBuilder;
use backoff::future::retry;
use tracing::warn;

use crate::error::{BatchError, Result};

/// Backoff that starts at `initial`, never sleeps longer than `max` and never gives up on its own.
/// Callers bound the total time with a deadline.
pub fn unbounded_backoff(initial: Duration, max: Duration,) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial,)
        .with_max_interval(max.max(initial,),)
        .with_max_elapsed_time(None,)
        .build()
}

pub async fn execute_with_retry<F, Fut, T,>(backoff: ExponentialBackoff, operation: F,) -> Result<T,>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, backoff::Error<BatchError,>,>,>,
{
    retry(backoff, operation,).await
}

pub fn transient_error(err: BatchError,) -> backoff::Error<BatchError,> {
    warn!("Transient error encountered, retrying: {}", err);
    backoff::Error::transient(err,)
}

pub fn permanent_error(err: BatchError,) -> backoff::Error<BatchError,> {
    backoff::Error::permanent(err,)
}

pub fn wrap_error(err: BatchError,) -> backoff::Error<BatchError,> {
    if err.is_transient() {
        transient_error(err,)
    } else {
        permanent_error(err,)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let calls = AtomicUsize::new(0);
        let backoff = unbounded_backoff(Duration::from_millis(10), Duration::from_millis(40));

        let value = execute_with_retry(backoff, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 3 {
                Err(wrap_error(BatchError::TransientTransport("reset".into())))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_stop_immediately() {
        let calls = AtomicUsize::new(0);
        let backoff = unbounded_backoff(Duration::from_millis(10), Duration::from_millis(40));

        let res: Result<()> = execute_with_retry(backoff, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(wrap_error(BatchError::PermanentServer {
                status:  404,
                message: "no such collection".into(),
            }))
        })
        .await;

        assert!(matches!(res, Err(BatchError::PermanentServer { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
