use std::io;

use sluice::Event;
use sluice_pool::PoolError;
use thiserror::Error;

/// Why an event was not queued. The event is handed back untouched.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The executor has been shut down.
    #[error("executor is shut down")]
    ShutDown(Event),
    /// The destination worker's queue is at capacity (non-blocking submit only).
    #[error("worker queue is full")]
    Full(Event),
}

impl SubmitError {
    /// Recovers the rejected event.
    pub fn into_event(self) -> Event {
        match self {
            SubmitError::ShutDown(event) | SubmitError::Full(event) => event,
        }
    }
}

/// Errors raised while starting an executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A builder option is out of range.
    #[error("invalid executor configuration: {0}")]
    InvalidConfig(&'static str),
    /// The OS refused to start a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
    /// The unordered worker pool could not be started.
    #[error(transparent)]
    Pool(#[from] PoolError),
}
