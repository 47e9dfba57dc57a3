use std::sync::Arc;

use thiserror::Error;

use crate::event::EventKind;
use crate::session::{SessionId, SessionStatus};

/// Boxed error returned by filters and handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error shared between events; cloning an `ExceptionCaught` event clones this handle.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors reported by the session and filter chain layer.
#[derive(Debug, Error)]
pub enum Error {
    /// A filter with this name is already registered in the chain.
    #[error("filter name \"{0}\" is already registered")]
    DuplicateName(String),

    /// No filter with this name is registered in the chain.
    #[error("no such filter \"{0}\" in chain")]
    UnknownName(String),

    /// The anchor referenced by a `before`/`after` position is absent.
    #[error("anchor filter \"{0}\" is not registered")]
    UnknownAnchor(String),

    /// The name collides with one of the chain sentinels.
    #[error("filter name \"{0}\" is reserved")]
    ReservedName(String),

    /// A lifecycle callback refused the registration or removal.
    #[error("filter \"{name}\" failed in {stage}: {source}")]
    Lifecycle {
        /// Name of the affected filter.
        name: String,
        /// Callback that failed (`on_pre_add`, `on_post_add`, ...).
        stage: &'static str,
        /// Underlying cause.
        #[source]
        source: BoxError,
    },

    /// The session is gone or has reached `Disposed`.
    #[error("session {0} is disposed")]
    SessionDisposed(SessionId),

    /// The session is closing and no longer accepts the event.
    #[error("session {id} rejected {kind:?} while {status:?}")]
    SessionClosing {
        /// The rejecting session.
        id: SessionId,
        /// Kind of event that was rejected.
        kind: EventKind,
        /// Status at the time of rejection.
        status: SessionStatus,
    },

    /// The requested status change is not an edge of the lifecycle graph.
    #[error("session {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        /// Session being transitioned.
        id: SessionId,
        /// Current status.
        from: SessionStatus,
        /// Requested status.
        to: SessionStatus,
    },

    /// A filter or handler returned an error while processing an event.
    #[error("{origin} failed on {kind:?}: {source}")]
    HandlerFault {
        /// Filter name, or `"handler"` for the terminal handler.
        origin: String,
        /// Event being processed when the fault occurred.
        kind: EventKind,
        /// Underlying cause.
        #[source]
        source: BoxError,
    },

    /// A filter or handler panicked while processing an event.
    #[error("{origin} panicked on {kind:?}: {message}")]
    HandlerPanicked {
        /// Filter name, or `"handler"` for the terminal handler.
        origin: String,
        /// Event being processed when the panic occurred.
        kind: EventKind,
        /// Panic payload rendered as text.
        message: String,
    },
}

impl Error {
    pub(crate) fn fault(origin: &str, kind: EventKind, source: BoxError) -> SharedError {
        Arc::new(Error::HandlerFault {
            origin: origin.to_owned(),
            kind,
            source,
        })
    }

    pub(crate) fn panicked(
        origin: &str,
        kind: EventKind,
        payload: Box<dyn std::any::Any + Send>,
    ) -> SharedError {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        Arc::new(Error::HandlerPanicked {
            origin: origin.to_owned(),
            kind,
            message,
        })
    }
}

/// Result alias for chain and session operations.
pub type Result<T> = std::result::Result<T, Error>;
