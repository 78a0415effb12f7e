//! Retry with exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;

use log::{debug, info, warn};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::errors::{Result, VaultError};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(30);

/// Run `op` until it succeeds, it fails with a non-retryable error, all
/// attempts are spent, or `cancel` fires. Retryable failures sleep an
/// exponentially growing delay (capped, optionally jittered by up to 10%)
/// between attempts.
pub async fn retry<T, F, Fut>(cancel: &CancellationToken, config: &RetryConfig, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = config.initial_delay;
    let mut last_err: Option<VaultError> = None;

    for attempt in 1..=config.max_attempts {
        if cancel.is_cancelled() {
            return Err(VaultError::timeout("operation cancelled"));
        }

        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("operation succeeded after {attempt} attempts");
                }
                return Ok(value);
            }
            Err(e) => {
                if !e.is_retryable() {
                    debug!("error is not retryable: {e}");
                    return Err(e);
                }
                last_err = Some(e);
            }
        }

        if attempt == config.max_attempts {
            break;
        }

        warn!(
            "attempt {attempt}/{} failed: {}, retrying in {delay:?}",
            config.max_attempts,
            last_err.as_ref().unwrap()
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {
                return Err(VaultError::timeout("operation cancelled"));
            }
        }

        delay = delay.mul_f64(config.multiplier).min(config.max_delay);
        if config.jitter {
            let jitter = delay.mul_f64(rand::thread_rng().gen_range(0.0..0.1));
            delay += jitter;
        }
    }

    let err = last_err.unwrap_or_else(|| VaultError::internal("retry exhausted without an error"));
    warn!("operation failed after {} attempts: {err}", config.max_attempts);
    Err(err)
}

/// Retry bounded by an overall deadline.
pub async fn retry_with_timeout<T, F, Fut>(
    timeout: Duration,
    config: &RetryConfig,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let cancel = CancellationToken::new();
    match tokio::time::timeout(timeout, retry(&cancel, config, op)).await {
        Ok(result) => result,
        Err(_) => Err(VaultError::timeout("operation timed out")),
    }
}

/// Retry with the default configuration and a 30-second deadline.
pub async fn retry_simple<T, F, Fut>(op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_timeout(DEFAULT_RETRY_TIMEOUT, &RetryConfig::default(), op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result = retry(&CancellationToken::new(), &fast_config(5), move || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(VaultError::network("peer unreachable"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_fails_after_one_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<()> = retry(&CancellationToken::new(), &fast_config(5), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(VaultError::validation("bad input"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_last_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<()> = retry(&CancellationToken::new(), &fast_config(3), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(VaultError::connection("refused"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Connection);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_the_backoff_sleep() {
        let cancel = CancellationToken::new();
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_secs(60),
            ..RetryConfig::default()
        };

        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<()> = retry(&cancel, &config, || async {
            Err(VaultError::network("down"))
        })
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn timeout_bounds_the_whole_operation() {
        let result: Result<()> = retry_with_timeout(
            Duration::from_millis(30),
            &RetryConfig {
                max_attempts: 100,
                initial_delay: Duration::from_millis(20),
                jitter: false,
                ..RetryConfig::default()
            },
            || async { Err(VaultError::network("down")) },
        )
        .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn immediate_success_makes_one_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        retry_simple(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
