//! # Handler Trait - Application Logic at the End of the Chain
//!
//! The [`Handler`] is where events land after every filter has seen them. There is
//! exactly one handler per session and it exposes one callback per inbound
//! [`Event`] kind. The [`IoSink`] is the opposite end: the transport that the chain's
//! head hands outbound write and close requests to.
//!
//! ```text
//!   I/O source ──Event──▶ head ─▶ filter 1 ─▶ ... ─▶ filter N ─▶ tail ─▶ Handler
//!   IoSink ◀──write/close── head ◀─ filter 1 ◀─ ... ◀─ filter N ◀─ tail ◀─ Session::write
//! ```
//!
//! ## Example: Echo Handler
//!
//! ```rust
//! use std::sync::Arc;
//! use sluice::{BoxError, Handler, Message, Session};
//!
//! struct EchoHandler;
//!
//! impl Handler for EchoHandler {
//!     fn message_received(&self, session: &Arc<Session>, message: Message) -> Result<(), BoxError> {
//!         session.write(message)?;
//!         Ok(())
//!     }
//! }
//! ```
//!
//! ## Faults
//!
//! A handler callback that fails (returns `Err` or panics) never unwinds into the
//! I/O thread. The failure becomes an `ExceptionCaught` event that re-enters the
//! session's chain at the head, so every filter and then
//! [`Handler::exception_caught`] see it once. If `exception_caught` itself fails
//! the error is logged and dropped.
//!
//! ```text
//!   tail ─▶ Handler::message_received ─✗─▶ head ─▶ filter 1 ─▶ ... ─▶ tail ─▶ Handler::exception_caught
//! ```

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, error, trace, warn};

use crate::error::{BoxError, Error, SharedError};
use crate::event::{Event, EventKind, IdleStatus};
use crate::message::{Message, WriteRequest};
use crate::session::Session;

/// Name reported as the origin of faults raised by the terminal handler.
pub const HANDLER_ORIGIN: &str = "handler";

/// Application callbacks, one per inbound event kind.
///
/// All callbacks default to doing nothing, except [`exception_caught`](Handler::exception_caught)
/// which logs the error.
pub trait Handler: Send + Sync + 'static {
    /// See [`Event::Created`].
    fn session_created(&self, session: &Arc<Session>) -> Result<(), BoxError> {
        let _ = session;
        Ok(())
    }

    /// See [`Event::Opened`].
    fn session_opened(&self, session: &Arc<Session>) -> Result<(), BoxError> {
        let _ = session;
        Ok(())
    }

    /// See [`Event::Closed`].
    fn session_closed(&self, session: &Arc<Session>) -> Result<(), BoxError> {
        let _ = session;
        Ok(())
    }

    /// See [`Event::Idle`].
    fn session_idle(&self, session: &Arc<Session>, status: IdleStatus) -> Result<(), BoxError> {
        let _ = (session, status);
        Ok(())
    }

    /// See [`Event::Received`].
    fn message_received(&self, session: &Arc<Session>, message: Message) -> Result<(), BoxError> {
        let _ = (session, message);
        Ok(())
    }

    /// See [`Event::Sent`].
    fn message_sent(&self, session: &Arc<Session>, message: Message) -> Result<(), BoxError> {
        let _ = (session, message);
        Ok(())
    }

    /// See [`Event::ExceptionCaught`].
    fn exception_caught(&self, session: &Arc<Session>, cause: SharedError) -> Result<(), BoxError> {
        warn!("session {} unhandled exception: {}", session.id(), cause);
        Ok(())
    }
}

/// The transport end of a session: receives write and close requests that have
/// passed through every filter.
pub trait IoSink: Send + Sync + 'static {
    /// Writes the (fully encoded) request to the transport.
    ///
    /// An `Err` is turned into an `ExceptionCaught` event on the session.
    fn write(&self, session: &Arc<Session>, request: WriteRequest) -> io::Result<()>;

    /// Closes the transport. The I/O source is expected to fire `Closed` afterwards.
    fn close(&self, session: &Arc<Session>);
}

/// Delivers `event` straight to its session's [`Handler`], bypassing the chain.
///
/// This is what the chain's tail does, and what an executor worker does for an
/// event that was submitted without a chain continuation. A handler failure on any
/// event other than `ExceptionCaught` is walked through the session's chain from
/// the head as an `ExceptionCaught` event; a failure while handling
/// `ExceptionCaught` is logged.
pub fn deliver(event: Event) {
    let session = Arc::clone(event.session());
    let kind = event.kind();
    let handler = Arc::clone(session.handler());
    trace!("session {} {:?} -> {}", session.id(), kind, HANDLER_ORIGIN);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match event {
        Event::Created(s) => handler.session_created(&s),
        Event::Opened(s) => handler.session_opened(&s),
        Event::Closed(s) => handler.session_closed(&s),
        Event::Idle(s, status) => handler.session_idle(&s, status),
        Event::Received(s, message) => handler.message_received(&s, message),
        Event::Sent(s, message) => handler.message_sent(&s, message),
        Event::ExceptionCaught(s, cause) => handler.exception_caught(&s, cause),
    }));

    if let Some(fault) = into_fault(HANDLER_ORIGIN, kind, outcome) {
        if kind == EventKind::ExceptionCaught {
            error!(
                "session {} {} failed while handling an exception: {}",
                session.id(),
                HANDLER_ORIGIN,
                fault
            );
        } else {
            debug!("session {} {}", session.id(), fault);
            session
                .chain()
                .traverse(Event::ExceptionCaught(Arc::clone(&session), fault));
        }
    }

    if kind == EventKind::Closed {
        session.closed_dispatched();
    }
}

pub(crate) fn into_fault(
    origin: &str,
    kind: EventKind,
    outcome: std::thread::Result<Result<(), BoxError>>,
) -> Option<SharedError> {
    match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(Error::fault(origin, kind, err)),
        Err(payload) => Some(Error::panicked(origin, kind, payload)),
    }
}
