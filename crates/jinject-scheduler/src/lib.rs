//! Cooperative cancellation and task plumbing shared by jinject crates.
//!
//! Everything here is cancellation-first: blocking steps take a
//! [`CancellationToken`] (usually through a [`RequestContext`]) and return
//! promptly once it fires.

mod context;
mod retry;
mod task;

pub use context::RequestContext;
pub use retry::{retry, RetryError};
pub use task::{spawn, AsyncTask};
pub use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("task cancelled")]
    Cancelled,
    #[error("task panicked")]
    Panicked,
}

impl From<Cancelled> for TaskError {
    fn from(_: Cancelled) -> Self {
        TaskError::Cancelled
    }
}
