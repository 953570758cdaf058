use std::{future::Future, time::Duration};

use futures_retry::{ErrorHandler, FutureRetry, RetryPolicy};
use rand::Rng;
use tracing::warn;

use crate::{config::BackoffConfig, error::RpcError};

/// Exponential backoff with jitter. With no attempt limit the operation is
/// retried until it succeeds, which is what the hand-back paths need.
pub(crate) struct Backoff {
    operation: &'static str,
    base: Duration,
    max: Duration,
    max_attempts: Option<usize>,
}

impl Backoff {
    pub(crate) fn forever(operation: &'static str, config: &BackoffConfig) -> Self {
        Self {
            operation,
            base: config.base,
            max: config.max,
            max_attempts: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn limited(
        operation: &'static str,
        config: &BackoffConfig,
        max_attempts: usize,
    ) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::forever(operation, config)
        }
    }

    fn delay_for(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        let delay = self
            .base
            .checked_mul(1 << exponent)
            .unwrap_or(self.max)
            .min(self.max);
        let jitter_ms = (delay.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl ErrorHandler<RpcError> for Backoff {
    type OutError = RpcError;

    fn handle(&mut self, attempt: usize, e: RpcError) -> RetryPolicy<RpcError> {
        if let Some(max_attempts) = self.max_attempts {
            if attempt >= max_attempts {
                return RetryPolicy::ForwardError(e);
            }
        }

        let delay = self.delay_for(attempt);
        warn!(
            operation = self.operation,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %e,
            "call failed, retrying"
        );
        RetryPolicy::WaitRetry(delay)
    }
}

/// Runs `op` under `backoff` and strips the attempt counters from the outcome.
pub(crate) async fn with_backoff<T, F, Fut>(backoff: Backoff, op: F) -> Result<T, RpcError>
where
    F: FnMut() -> Fut + Unpin,
    Fut: Future<Output = Result<T, RpcError>>,
{
    FutureRetry::new(op, backoff)
        .await
        .map(|(value, _)| value)
        .map_err(|(e, _)| e)
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    fn fast() -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
        }
    }

    #[test]
    fn delay_is_capped() {
        let backoff = Backoff::forever("test", &fast());
        for attempt in 1..40 {
            assert!(backoff.delay_for(attempt) <= Duration::from_millis(5));
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = with_backoff(Backoff::forever("test", &fast()), move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(RpcError::Transport("down".to_string()))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn limited_backoff_gives_up() {
        let result: Result<(), RpcError> =
            with_backoff(Backoff::limited("test", &fast(), 2), || async {
                Err(RpcError::Transport("down".to_string()))
            })
            .await;
        assert!(matches!(result, Err(RpcError::Transport(_))));
    }
}
