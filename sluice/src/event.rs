use std::fmt;
use std::sync::Arc;

use crate::error::SharedError;
use crate::message::Message;
use crate::session::Session;

/// Which side of a connection has been quiet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdleStatus {
    /// Nothing has been read for the configured idle time.
    ReaderIdle,
    /// Nothing has been written for the configured idle time.
    WriterIdle,
    /// Neither read nor written.
    BothIdle,
}

/// Discriminant of an [`Event`], used for filtering and diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// See [`Event::Created`].
    Created,
    /// See [`Event::Opened`].
    Opened,
    /// See [`Event::Closed`].
    Closed,
    /// See [`Event::Idle`].
    Idle,
    /// See [`Event::Received`].
    Received,
    /// See [`Event::Sent`].
    Sent,
    /// See [`Event::ExceptionCaught`].
    ExceptionCaught,
    /// An outbound write request.
    Write,
    /// An outbound close request.
    Close,
}

impl EventKind {
    /// Every inbound kind, in lifecycle order.
    pub const INBOUND: [EventKind; 7] = [
        EventKind::Created,
        EventKind::Opened,
        EventKind::Closed,
        EventKind::Idle,
        EventKind::Received,
        EventKind::Sent,
        EventKind::ExceptionCaught,
    ];
}

/// An inbound event for one session.
///
/// I/O sources fire `Created` once, `Opened` once, then any number of
/// `Received`/`Idle`/`Sent`, and finally `Closed` exactly once.
#[derive(Clone)]
pub enum Event {
    /// The session object exists; no I/O has been acknowledged yet.
    Created(Arc<Session>),
    /// The connection is open and ready for I/O.
    Opened(Arc<Session>),
    /// The connection is closed. No further events follow.
    Closed(Arc<Session>),
    /// The connection has been idle.
    Idle(Arc<Session>, IdleStatus),
    /// A message was read (and possibly decoded).
    Received(Arc<Session>, Message),
    /// A message was written to the transport.
    Sent(Arc<Session>, Message),
    /// A filter, handler or the transport raised an error.
    ExceptionCaught(Arc<Session>, SharedError),
}

impl Event {
    /// The session this event belongs to.
    pub fn session(&self) -> &Arc<Session> {
        match self {
            Event::Created(s)
            | Event::Opened(s)
            | Event::Closed(s)
            | Event::Idle(s, _)
            | Event::Received(s, _)
            | Event::Sent(s, _)
            | Event::ExceptionCaught(s, _) => s,
        }
    }

    /// The event's kind.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Created(_) => EventKind::Created,
            Event::Opened(_) => EventKind::Opened,
            Event::Closed(_) => EventKind::Closed,
            Event::Idle(..) => EventKind::Idle,
            Event::Received(..) => EventKind::Received,
            Event::Sent(..) => EventKind::Sent,
            Event::ExceptionCaught(..) => EventKind::ExceptionCaught,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.session().id();
        match self {
            Event::Idle(_, status) => write!(f, "Idle({session}, {status:?})"),
            Event::Received(_, msg) => write!(f, "Received({session}, {msg:?})"),
            Event::Sent(_, msg) => write!(f, "Sent({session}, {msg:?})"),
            Event::ExceptionCaught(_, err) => write!(f, "ExceptionCaught({session}, {err})"),
            other => write!(f, "{:?}({session})", other.kind()),
        }
    }
}
