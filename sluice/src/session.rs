//! # Session - Per-Connection State
//!
//! A [`Session`] ties together everything that belongs to one connection: its
//! identity, its lifecycle status, an [`AttributeMap`], its [`FilterChain`], the
//! terminal [`Handler`] and the [`IoSink`] writes end up in.
//!
//! ## Lifecycle
//!
//! ```text
//!   None ─▶ Created ─▶ Active ⇄ Suspended
//!              │          │         │
//!              └──────────┴────┬────┘
//!                              ▼
//!                          Disposing ─▶ Disposed
//! ```
//!
//! - `Opened` moves `Created` to `Active`.
//! - [`Session::suspend`] parks `Received`, `Idle` and `Sent` events in a backlog;
//!   [`Session::resume`] replays them in arrival order.
//! - [`Session::close`] or an inbound `Closed` moves the session to `Disposing`.
//!   From then on new `Received`/`Idle` events are rejected, while the backlog
//!   and everything already queued still drain.
//! - `Disposed` is reached once `Closed` has been dispatched and no
//!   [`InFlight`] guard for the session is alive.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::attribute::AttributeMap;
use crate::chain::FilterChain;
use crate::error::{Error, Result, SharedError};
use crate::event::{Event, EventKind, IdleStatus};
use crate::handler::{Handler, IoSink};
use crate::message::{Message, WriteRequest};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique session identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw identity, used for worker selection.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle status of a [`Session`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    /// Not yet initialized.
    None,
    /// Constructed; no I/O has been acknowledged.
    Created,
    /// Open for I/O.
    Active,
    /// Open, but inbound delivery is paused.
    Suspended,
    /// Closing: no new inbound events, queued ones drain.
    Disposing,
    /// Closed and fully drained.
    Disposed,
}

impl SessionStatus {
    fn can_become(self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, to),
            (None, Created)
                | (Created, Active)
                | (Active, Suspended)
                | (Suspended, Active)
                | (Created | Active | Suspended, Disposing)
                | (Disposing, Disposed)
        )
    }

    fn is_closing(self) -> bool {
        matches!(self, SessionStatus::Disposing | SessionStatus::Disposed)
    }
}

// Backlogged events keep only their payload, so the backlog never holds the
// session it belongs to.
enum Parked {
    Idle(IdleStatus),
    Received(Message),
    Sent(Message),
    Closed,
}

impl Parked {
    fn from_event(event: Event) -> Option<Self> {
        match event {
            Event::Idle(_, status) => Some(Parked::Idle(status)),
            Event::Received(_, message) => Some(Parked::Received(message)),
            Event::Sent(_, message) => Some(Parked::Sent(message)),
            Event::Closed(_) => Some(Parked::Closed),
            _ => None,
        }
    }

    fn into_event(self, session: &Arc<Session>) -> Event {
        let session = Arc::clone(session);
        match self {
            Parked::Idle(status) => Event::Idle(session, status),
            Parked::Received(message) => Event::Received(session, message),
            Parked::Sent(message) => Event::Sent(session, message),
            Parked::Closed => Event::Closed(session),
        }
    }
}

pub(crate) enum Admission {
    Deliver(Event),
    Flush(Vec<Event>),
    Parked,
}

struct State {
    status: SessionStatus,
    backlog: VecDeque<Parked>,
    replaying: bool,
    closed_admitted: bool,
    closed_dispatched: bool,
}

/// Per-connection state shared by the I/O source, the filters and the handler.
pub struct Session {
    id: SessionId,
    state: Mutex<State>,
    disposed: Condvar,
    in_flight: AtomicUsize,
    attributes: AttributeMap,
    chain: FilterChain,
    handler: Arc<dyn Handler>,
    sink: Arc<dyn IoSink>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    created_at: Instant,
}

/// Builds a [`Session`].
pub struct SessionBuilder {
    handler: Arc<dyn Handler>,
    sink: Arc<dyn IoSink>,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
}

impl SessionBuilder {
    /// Records the local address of the connection.
    pub fn local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// Records the peer address of the connection.
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Creates the session in status `Created` with an empty chain.
    pub fn build(self) -> Arc<Session> {
        let id = SessionId::next();
        let session = Arc::new_cyclic(|weak| Session {
            id,
            state: Mutex::new(State {
                status: SessionStatus::None,
                backlog: VecDeque::new(),
                replaying: false,
                closed_admitted: false,
                closed_dispatched: false,
            }),
            disposed: Condvar::new(),
            in_flight: AtomicUsize::new(0),
            attributes: AttributeMap::new(),
            chain: FilterChain::new(id, weak.clone()),
            handler: self.handler,
            sink: self.sink,
            local_addr: self.local_addr,
            remote_addr: self.remote_addr,
            created_at: Instant::now(),
        });
        {
            let mut state = session.lock_state();
            session.set_status(&mut state, SessionStatus::Created);
        }
        session
    }
}

impl Session {
    /// Creates a session delivering to `handler` and writing to `sink`.
    pub fn new(handler: Arc<dyn Handler>, sink: Arc<dyn IoSink>) -> Arc<Session> {
        Self::builder(handler, sink).build()
    }

    /// Starts building a session with addresses or other options.
    pub fn builder(handler: Arc<dyn Handler>, sink: Arc<dyn IoSink>) -> SessionBuilder {
        SessionBuilder {
            handler,
            sink,
            local_addr: None,
            remote_addr: None,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, state: &mut State, to: SessionStatus) {
        debug_assert!(
            state.status.can_become(to),
            "{:?} -> {:?} is not a lifecycle edge",
            state.status,
            to
        );
        debug!("session {} {:?} -> {:?}", self.id, state.status, to);
        state.status = to;
    }

    fn rejected(&self, kind: EventKind, status: SessionStatus) -> Error {
        warn!("session {} rejected {:?} while {:?}", self.id, kind, status);
        Error::SessionClosing {
            id: self.id,
            kind,
            status,
        }
    }

    /// The session's identity.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SessionStatus {
        self.lock_state().status
    }

    /// Returns `true` while the session is `Active` or `Suspended`.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.status(),
            SessionStatus::Active | SessionStatus::Suspended
        )
    }

    /// The session's attribute store.
    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    /// The session's filter chain.
    pub fn chain(&self) -> &FilterChain {
        &self.chain
    }

    /// The terminal handler.
    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// The transport sink.
    pub fn sink(&self) -> &Arc<dyn IoSink> {
        &self.sink
    }

    /// Local address, if the I/O source recorded one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Peer address, if the I/O source recorded one.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// When the session was built.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Decides what to do with an inbound event arriving at the chain entry.
    pub(crate) fn admit(self: &Arc<Self>, event: Event) -> Result<Admission> {
        let kind = event.kind();
        let mut state = self.lock_state();
        let status = state.status;
        if status == SessionStatus::Disposed || state.closed_admitted {
            return Err(self.rejected(kind, status));
        }

        match kind {
            EventKind::Created => {
                if status != SessionStatus::Created {
                    return Err(self.rejected(kind, status));
                }
            }
            EventKind::Opened => {
                if status.is_closing() {
                    return Err(self.rejected(kind, status));
                }
                if status != SessionStatus::Created {
                    return Err(Error::InvalidTransition {
                        id: self.id,
                        from: status,
                        to: SessionStatus::Active,
                    });
                }
                self.set_status(&mut state, SessionStatus::Active);
            }
            EventKind::Received | EventKind::Idle | EventKind::Sent => {
                if status.is_closing() && kind != EventKind::Sent {
                    return Err(self.rejected(kind, status));
                }
                if status == SessionStatus::Suspended
                    || state.replaying
                    || !state.backlog.is_empty()
                {
                    trace!("session {} parked {:?}", self.id, kind);
                    state.backlog.extend(Parked::from_event(event));
                    return Ok(Admission::Parked);
                }
            }
            EventKind::Closed => {
                state.closed_admitted = true;
                if status != SessionStatus::Disposing {
                    self.set_status(&mut state, SessionStatus::Disposing);
                }
                if state.replaying {
                    state.backlog.push_back(Parked::Closed);
                    return Ok(Admission::Parked);
                }
                if !state.backlog.is_empty() {
                    let mut events: Vec<Event> = state
                        .backlog
                        .drain(..)
                        .map(|parked| parked.into_event(self))
                        .collect();
                    events.push(event);
                    return Ok(Admission::Flush(events));
                }
            }
            EventKind::ExceptionCaught | EventKind::Write | EventKind::Close => {}
        }
        Ok(Admission::Deliver(event))
    }

    /// Pauses inbound delivery. `Received`, `Idle` and `Sent` events are
    /// parked until [`resume`](Session::resume).
    pub fn suspend(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.status != SessionStatus::Active {
            return Err(Error::InvalidTransition {
                id: self.id,
                from: state.status,
                to: SessionStatus::Suspended,
            });
        }
        self.set_status(&mut state, SessionStatus::Suspended);
        Ok(())
    }

    /// Resumes inbound delivery, replaying parked events on the calling thread
    /// in the order they arrived.
    pub fn resume(self: &Arc<Self>) -> Result<()> {
        let mut state = self.lock_state();
        if state.status != SessionStatus::Suspended {
            return Err(Error::InvalidTransition {
                id: self.id,
                from: state.status,
                to: SessionStatus::Active,
            });
        }
        self.set_status(&mut state, SessionStatus::Active);
        if state.replaying {
            return Ok(());
        }

        state.replaying = true;
        while state.status != SessionStatus::Suspended {
            let Some(parked) = state.backlog.pop_front() else {
                break;
            };
            drop(state);
            self.chain.traverse(parked.into_event(self));
            state = self.lock_state();
        }
        state.replaying = false;
        Ok(())
    }

    /// Sends `message` through the chain toward the [`IoSink`], starting at
    /// the last filter.
    pub fn write(self: &Arc<Self>, message: Message) -> Result<()> {
        self.chain.dispatch_outbound(WriteRequest::new(message))
    }

    /// Starts closing the session: moves it to `Disposing` and sends a close
    /// request through the chain to the [`IoSink`]. Does nothing if the
    /// session is already closing.
    pub fn close(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            if state.status.is_closing() {
                return;
            }
            self.set_status(&mut state, SessionStatus::Disposing);
        }
        self.chain.dispatch_close(self);
    }

    /// Fires `Created` into the chain.
    pub fn fire_created(self: &Arc<Self>) -> Result<()> {
        self.chain.dispatch_inbound(Event::Created(Arc::clone(self)))
    }

    /// Fires `Opened` into the chain.
    pub fn fire_opened(self: &Arc<Self>) -> Result<()> {
        self.chain.dispatch_inbound(Event::Opened(Arc::clone(self)))
    }

    /// Fires `Closed` into the chain.
    pub fn fire_closed(self: &Arc<Self>) -> Result<()> {
        self.chain.dispatch_inbound(Event::Closed(Arc::clone(self)))
    }

    /// Fires `Idle` into the chain.
    pub fn fire_idle(self: &Arc<Self>, status: IdleStatus) -> Result<()> {
        self.chain
            .dispatch_inbound(Event::Idle(Arc::clone(self), status))
    }

    /// Fires `Received` into the chain.
    pub fn fire_received(self: &Arc<Self>, message: Message) -> Result<()> {
        self.chain
            .dispatch_inbound(Event::Received(Arc::clone(self), message))
    }

    /// Fires `Sent` into the chain.
    pub fn fire_sent(self: &Arc<Self>, message: Message) -> Result<()> {
        self.chain
            .dispatch_inbound(Event::Sent(Arc::clone(self), message))
    }

    /// Fires `ExceptionCaught` into the chain.
    pub fn fire_exception(self: &Arc<Self>, cause: SharedError) -> Result<()> {
        self.chain
            .dispatch_inbound(Event::ExceptionCaught(Arc::clone(self), cause))
    }

    /// Registers one queued or running unit of work for this session.
    ///
    /// The session cannot reach `Disposed` while the returned guard is alive.
    pub fn in_flight(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight {
            session: Arc::clone(self),
        }
    }

    /// Number of live [`InFlight`] guards.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn closed_dispatched(&self) {
        self.lock_state().closed_dispatched = true;
        self.try_dispose();
    }

    fn try_dispose(&self) {
        let mut state = self.lock_state();
        if state.status == SessionStatus::Disposing
            && state.closed_dispatched
            && self.in_flight.load(Ordering::Acquire) == 0
        {
            self.set_status(&mut state, SessionStatus::Disposed);
            state.backlog.clear();
            self.disposed.notify_all();
        }
    }

    /// Blocks until the session is `Disposed` or `timeout` elapses.
    /// Returns `true` if the session is disposed.
    pub fn await_disposed(&self, timeout: Duration) -> bool {
        let state = self.lock_state();
        let (state, _) = self
            .disposed
            .wait_timeout_while(state, timeout, |s| s.status != SessionStatus::Disposed)
            .unwrap_or_else(PoisonError::into_inner);
        state.status == SessionStatus::Disposed
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("in_flight", &self.in_flight_count())
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// Keeps a session out of `Disposed` while an event for it is queued or running.
#[must_use = "the session may be disposed as soon as the guard is dropped"]
pub struct InFlight {
    session: Arc<Session>,
}

impl InFlight {
    /// The guarded session.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.session.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.session.try_dispose();
        }
    }
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InFlight({})", self.session.id)
    }
}
