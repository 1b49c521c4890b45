use std::future::Future;

use crate::{CancellationToken, TaskError};

/// Spawns `fut` on the current runtime. The task is aborted when `token` is
/// cancelled while someone is joining it.
pub fn spawn<F, T>(token: CancellationToken, fut: F) -> AsyncTask<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(async move { Ok(fut.await) });
    AsyncTask::new(token, handle)
}

pub struct AsyncTask<T> {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<Result<T, TaskError>>,
}

impl<T> AsyncTask<T> {
    pub(crate) fn new(
        token: CancellationToken,
        handle: tokio::task::JoinHandle<Result<T, TaskError>>,
    ) -> Self {
        Self { token, handle }
    }

    pub async fn join(mut self) -> Result<T, TaskError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                self.handle.abort();
                Err(TaskError::Cancelled)
            }
            result = &mut self.handle => match result {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Err(TaskError::Cancelled),
                Err(_err) => Err(TaskError::Panicked),
            }
        }
    }
}

impl<T> Drop for AsyncTask<T> {
    fn drop(&mut self) {
        // Detached tasks would otherwise outlive the invocation that spawned them.
        self.handle.abort();
    }
}
