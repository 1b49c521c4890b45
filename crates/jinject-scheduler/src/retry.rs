use std::{fmt, future::Future, time::Duration};

use crate::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("cancelled")]
    Cancelled,
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: E },
}

/// Runs `op` up to `attempts` times (at least once), sleeping `delay` between
/// failed attempts. `op` receives the 1-based attempt number.
///
/// Cancellation is checked before every attempt and during every delay; once
/// observed no further attempt is made. `op` must clean up after itself on
/// failure, since a failed attempt is simply repeated.
pub async fn retry<T, E, F, Fut>(
    cancel: &CancellationToken,
    attempts: u32,
    delay: Duration,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = op(attempt) => result,
        };
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if attempt >= attempts {
            return Err(RetryError::Exhausted {
                attempts,
                last: err,
            });
        }
        tracing::debug!(
            target: "jinject.scheduler",
            attempt,
            attempts,
            error = %err,
            "attempt failed; retrying"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
