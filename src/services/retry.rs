use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Fixed-delay retry budget used when (re)establishing connections.
///
/// One initial attempt is made, followed by at most `max_retries` retries
/// separated by `retry_delay`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a transient error; holds the last one.
    Exhausted { attempts: u32, last: E },
    /// A non-transient error stopped the loop early.
    Fatal(E),
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }

    /// Total number of attempts this policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget runs out.
    pub async fn run<T, E, F, Fut>(
        &self,
        target: &str,
        mut is_transient: impl FnMut(&E) -> bool,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(target_service = target, attempt, "Connected after retrying");
                    }
                    return Ok(value);
                }
                Err(e) if !is_transient(&e) => {
                    tracing::error!(target_service = target, error = %e, "Non-retryable connection failure");
                    return Err(RetryError::Fatal(e));
                }
                Err(e) if attempt >= max_attempts => {
                    tracing::error!(
                        target_service = target,
                        attempts = attempt,
                        error = %e,
                        "Exceeded maximum retries"
                    );
                    return Err(RetryError::Exhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    tracing::warn!(
                        target_service = target,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Connection attempt failed, retrying"
                    );
                    sleep(self.retry_delay).await;
                }
            }
        }
    }
}

/// Run `op` on a handle from `acquire(false)`. If it fails with an error
/// `is_disconnect` accepts, `acquire(true)` must drop the stale handle and
/// hand out a fresh one, and `op` runs exactly once more. Other errors and
/// the second failure are returned through `wrap`.
pub async fn rerun_once<H, T, E, A, Acq, AcqFut, Op, OpFut>(
    backend: &str,
    acquire: Acq,
    op: Op,
    is_disconnect: impl Fn(&E) -> bool,
    wrap: impl Fn(E) -> A,
) -> Result<T, A>
where
    Acq: Fn(bool) -> AcqFut,
    AcqFut: Future<Output = Result<H, A>>,
    Op: Fn(H) -> OpFut,
    OpFut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let handle = acquire(false).await?;
    match op(handle).await {
        Ok(value) => Ok(value),
        Err(e) if is_disconnect(&e) => {
            tracing::warn!(target_service = backend, error = %e, "Connection lost during command, reconnecting");
            let handle = acquire(true).await?;
            op(handle).await.map_err(wrap)
        }
        Err(e) => Err(wrap(e)),
    }
}
