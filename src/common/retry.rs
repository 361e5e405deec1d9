use std::{future::Future, time::Duration};

use rand::Rng;
use tokio::time;
use tracing::warn;

#[derive(Clone, Copy, Debug)]
pub struct RetryOpts {
    pub max_attempts: u64,
    /// The first retry is immediately after the first failure (plus jitter).
    /// The next retry after that will wait this long.
    pub min_nonzero_wait: Duration,
    pub max_wait: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryOpts {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_nonzero_wait: Duration::from_millis(500),
            max_wait: Duration::from_secs(5),
            max_jitter: Duration::from_millis(250),
        }
    }
}

/// Runs a fallible async operation with exponential backoff and jitter,
/// returning the last error once the attempts are exhausted.
pub async fn with_retries<Func, Fut, Out, Err>(
    description: &str,
    func: Func,
    opts: RetryOpts,
) -> Result<Out, Err>
where
    Func: Fn() -> Fut,
    Fut: Future<Output = Result<Out, Err>>,
{
    let mut next_wait = Duration::ZERO;
    let mut last_error: Option<Err> = None;
    for attempt_number in 1..=opts.max_attempts {
        match func().await {
            Ok(out) => return Ok(out),
            Err(error) => {
                last_error = Some(error);
                warn!("Failed to {description} (attempt {attempt_number})");
            }
        }
        if attempt_number == opts.max_attempts {
            break;
        }
        // Grab a new rng each iteration because we can't hold it across awaits.
        let jitter = rand::thread_rng().gen_range(Duration::ZERO..opts.max_jitter);
        time::sleep(next_wait + jitter).await;
        next_wait = (2 * next_wait).clamp(opts.min_nonzero_wait, opts.max_wait);
    }
    Err(last_error.unwrap())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;

    fn fast_opts() -> RetryOpts {
        RetryOpts {
            max_attempts: 3,
            min_nonzero_wait: Duration::from_millis(1),
            max_wait: Duration::from_millis(2),
            max_jitter: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn succeeds_after_failures() {
        let attempts = AtomicU64::new(0);
        let result = with_retries(
            "flaky operation",
            || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("not yet")
                } else {
                    Ok(42)
                }
            },
            fast_opts(),
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_last_error() {
        let attempts = AtomicU64::new(0);
        let result: Result<(), _> = with_retries(
            "doomed operation",
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("always")
            },
            fast_opts(),
        )
        .await;
        assert_eq!(result, Err("always"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
