use std::io;

use thiserror::Error;

/// Why an item was not queued. The item is handed back.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError<T> {
    /// The queue is at capacity (non-blocking push only).
    #[error("queue is full")]
    Full(T),
    /// The queue has been closed.
    #[error("queue is closed")]
    Closed(T),
}

impl<T> QueueError<T> {
    /// Recovers the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            QueueError::Full(item) | QueueError::Closed(item) => item,
        }
    }
}

/// Errors raised when building or using a pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A builder option is out of range.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(&'static str),
    /// The OS refused to start a thread.
    #[error("failed to spawn pool thread: {0}")]
    Spawn(#[from] io::Error),
    /// The pool is shutting down and accepts no more work.
    #[error("pool is shut down")]
    ShutDown,
}
