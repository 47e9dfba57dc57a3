use std::io;

use sluice_pool::PoolError;
use thiserror::Error;

/// Errors raised while starting a server.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Binding or configuring the listening socket failed.
    #[error("listener error: {0}")]
    Io(#[from] io::Error),
    /// The accept pool could not be started.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// No handler was configured.
    #[error("a handler is required")]
    MissingHandler,
}
