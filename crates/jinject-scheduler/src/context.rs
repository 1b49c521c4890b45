use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{CancellationToken, Cancelled};

/// Per-invocation context: a cancellation token plus an optional deadline.
///
/// Small and `Clone` so it can be passed into spawned work. Cancellation is
/// cooperative via [`CancellationToken`].
#[derive(Clone, Debug)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    deadline_task_started: Arc<AtomicBool>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

impl RequestContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
            deadline_task_started: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A context that ignores every other context's cancellation and expires
    /// after `timeout`. Used for cleanup that must run even when the work it
    /// cleans up after was cancelled.
    pub fn detached(timeout: Duration) -> Self {
        let ctx = Self::new(CancellationToken::new()).with_timeout(timeout);
        ctx.ensure_deadline_timer();
        ctx
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Drives `fut` until it completes, the token is cancelled, or the deadline
    /// passes, whichever comes first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Cancelled>
    where
        F: Future<Output = T>,
    {
        let deadline = async {
            match self.deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Cancelled),
            _ = deadline => Err(Cancelled),
            value = fut => Ok(value),
        }
    }

    /// Ensure that the context's cancellation token is automatically cancelled once the deadline
    /// is reached, so work that only watches the token still stops in time.
    ///
    /// This is idempotent: calling it multiple times will only spawn a single timer task. Outside
    /// a tokio runtime it does nothing.
    pub fn ensure_deadline_timer(&self) {
        let Some(deadline) = self.deadline else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        if self
            .deadline_task_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let token = self.cancel.clone();
        handle.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    token.cancel()
                }
                _ = token.cancelled() => {}
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_timer_cancels_the_token() {
        let ctx = RequestContext::default().with_timeout(Duration::from_millis(20));
        ctx.ensure_deadline_timer();
        ctx.ensure_deadline_timer();

        tokio::time::timeout(Duration::from_secs(1), ctx.token().cancelled())
            .await
            .expect("deadline timer cancels the token");
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn without_a_deadline_the_token_stays_live() {
        let ctx = RequestContext::default();
        ctx.ensure_deadline_timer();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn detached_ignores_parent_cancellation() {
        let parent = RequestContext::default();
        parent.cancel();

        let cleanup = RequestContext::detached(Duration::from_secs(5));
        assert!(!cleanup.is_cancelled());
        assert_eq!(cleanup.run(async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn detached_expires_at_its_deadline() {
        let cleanup = RequestContext::detached(Duration::from_millis(20));
        let result = cleanup
            .run(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert_eq!(result, Err(Cancelled));

        tokio::time::timeout(Duration::from_secs(1), cleanup.token().cancelled())
            .await
            .expect("deadline timer cancels the token");
    }

    #[tokio::test]
    async fn run_returns_cancelled_promptly() {
        let ctx = RequestContext::default();
        let token = ctx.token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let started = Instant::now();
        let result = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(result, Err(Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
