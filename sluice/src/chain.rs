//! # Filter Chain - Ordered, Mutable Interceptor Registry
//!
//! Each [`Session`] owns one [`FilterChain`]: a doubly linked list of named
//! [`Filter`]s bounded by two sentinels that are always present and never
//! user-visible. The head sentinel hands outbound requests to the session's
//! [`IoSink`](crate::IoSink); the tail sentinel hands inbound events to its
//! [`Handler`](crate::Handler).
//!
//! ```text
//!   inbound   head ─▶ A ─▶ B ─▶ C ─▶ tail ─▶ handler
//!   outbound  sink ◀─ head ◀─ A ◀─ B ◀─ C ◀─ tail ◀─ Session::write
//! ```
//!
//! ## Mutation vs. traversal
//!
//! Registration and removal run under a chain-wide lock. Traversal never takes
//! that lock: each hop only briefly locks the current entry's link. A removed
//! entry keeps its forward link, so an event already past it keeps moving, and
//! an event that has not reached a newly added entry will see it.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use sluice::{Filter, Handler, IoSink, LoggingFilter, Position, Session, WriteRequest};
//!
//! struct App;
//! impl Handler for App {}
//!
//! struct Discard;
//! impl IoSink for Discard {
//!     fn write(&self, _: &Arc<Session>, _: WriteRequest) -> std::io::Result<()> { Ok(()) }
//!     fn close(&self, _: &Arc<Session>) {}
//! }
//!
//! struct Noop;
//! impl Filter for Noop {}
//!
//! let session = Session::new(Arc::new(App), Arc::new(Discard));
//! let chain = session.chain();
//! chain.add_last("logger", Arc::new(LoggingFilter::new())).unwrap();
//! chain.register(Position::Before("logger".into()), "noop", Arc::new(Noop)).unwrap();
//! assert_eq!(chain.names(), vec!["noop", "logger"]);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, error, trace, warn};

use crate::error::{BoxError, Error, Result, SharedError};
use crate::event::{Event, EventKind, IdleStatus};
use crate::filter::{Filter, FilterCategory, NextFilter};
use crate::handler;
use crate::message::{Message, WriteRequest};
use crate::session::{Admission, Session, SessionId, SessionStatus};

/// Name of the head sentinel; cannot be used by filters.
pub const HEAD_NAME: &str = "sluice::head";
/// Name of the tail sentinel; cannot be used by filters.
pub const TAIL_NAME: &str = "sluice::tail";

/// Where to insert a filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Position {
    /// Right after the head: first to see inbound events.
    First,
    /// Right before the tail: last to see inbound events.
    Last,
    /// Immediately before the named filter.
    Before(String),
    /// Immediately after the named filter.
    After(String),
}

pub(crate) enum Outbound {
    Write(WriteRequest),
    Close,
}

impl Outbound {
    pub(crate) fn kind(&self) -> EventKind {
        match self {
            Outbound::Write(_) => EventKind::Write,
            Outbound::Close => EventKind::Close,
        }
    }
}

pub(crate) struct Entry {
    name: String,
    filter: Arc<dyn Filter>,
    prev: Mutex<Weak<Entry>>,
    next: Mutex<Option<Arc<Entry>>>,
}

impl Entry {
    fn new(name: &str, filter: Arc<dyn Filter>) -> Self {
        Self {
            name: name.to_owned(),
            filter,
            prev: Mutex::new(Weak::new()),
            next: Mutex::new(None),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn next(&self) -> Option<Arc<Entry>> {
        self.next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn prev(&self) -> Option<Arc<Entry>> {
        self.prev
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade()
    }

    fn set_next(&self, next: Option<Arc<Entry>>) {
        *self.next.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    fn set_prev(&self, prev: &Arc<Entry>) {
        *self.prev.lock().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(prev);
    }

    /// Runs this entry's inbound callback for `event`.
    pub(crate) fn deliver_inbound(self: &Arc<Self>, event: Event) {
        let session = Arc::clone(event.session());
        let kind = event.kind();
        let next = NextFilter::new(Arc::clone(self));
        let filter = &*self.filter;
        trace!("session {} {:?} -> {}", session.id(), kind, self.name);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match event {
            Event::Created(s) => filter.session_created(&next, &s),
            Event::Opened(s) => filter.session_opened(&next, &s),
            Event::Closed(s) => filter.session_closed(&next, &s),
            Event::Idle(s, status) => filter.session_idle(&next, &s, status),
            Event::Received(s, message) => filter.message_received(&next, &s, message),
            Event::Sent(s, message) => filter.message_sent(&next, &s, message),
            Event::ExceptionCaught(s, cause) => filter.exception_caught(&next, &s, cause),
        }));

        if let Some(fault) = handler::into_fault(&self.name, kind, outcome) {
            if kind == EventKind::ExceptionCaught {
                error!(
                    "session {} \"{}\" failed while handling an exception: {}",
                    session.id(),
                    self.name,
                    fault
                );
            } else {
                debug!("session {} {}", session.id(), fault);
                next.fire_exception_caught(&session, fault);
            }
        }
    }

    /// Runs this entry's outbound callback for `op`.
    pub(crate) fn deliver_outbound(self: &Arc<Self>, session: &Arc<Session>, op: Outbound) {
        let kind = op.kind();
        let next = NextFilter::new(Arc::clone(self));
        let filter = &*self.filter;
        trace!("session {} {:?} -> {}", session.id(), kind, self.name);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match op {
            Outbound::Write(request) => filter.filter_write(&next, session, request),
            Outbound::Close => filter.filter_close(&next, session),
        }));

        if let Some(fault) = handler::into_fault(&self.name, kind, outcome) {
            debug!("session {} {}", session.id(), fault);
            next.fire_exception_caught(session, fault);
        }
    }
}

struct HeadFilter;

impl Filter for HeadFilter {
    fn filter_write(
        &self,
        _next: &NextFilter,
        session: &Arc<Session>,
        request: WriteRequest,
    ) -> std::result::Result<(), BoxError> {
        session.sink().write(session, request)?;
        Ok(())
    }

    fn filter_close(
        &self,
        _next: &NextFilter,
        session: &Arc<Session>,
    ) -> std::result::Result<(), BoxError> {
        session.sink().close(session);
        Ok(())
    }
}

struct TailFilter;

impl Filter for TailFilter {
    fn session_created(
        &self,
        _next: &NextFilter,
        session: &Arc<Session>,
    ) -> std::result::Result<(), BoxError> {
        handler::deliver(Event::Created(Arc::clone(session)));
        Ok(())
    }

    fn session_opened(
        &self,
        _next: &NextFilter,
        session: &Arc<Session>,
    ) -> std::result::Result<(), BoxError> {
        handler::deliver(Event::Opened(Arc::clone(session)));
        Ok(())
    }

    fn session_closed(
        &self,
        _next: &NextFilter,
        session: &Arc<Session>,
    ) -> std::result::Result<(), BoxError> {
        handler::deliver(Event::Closed(Arc::clone(session)));
        Ok(())
    }

    fn session_idle(
        &self,
        _next: &NextFilter,
        session: &Arc<Session>,
        status: IdleStatus,
    ) -> std::result::Result<(), BoxError> {
        handler::deliver(Event::Idle(Arc::clone(session), status));
        Ok(())
    }

    fn message_received(
        &self,
        _next: &NextFilter,
        session: &Arc<Session>,
        message: Message,
    ) -> std::result::Result<(), BoxError> {
        handler::deliver(Event::Received(Arc::clone(session), message));
        Ok(())
    }

    fn message_sent(
        &self,
        _next: &NextFilter,
        session: &Arc<Session>,
        message: Message,
    ) -> std::result::Result<(), BoxError> {
        handler::deliver(Event::Sent(Arc::clone(session), message));
        Ok(())
    }

    fn exception_caught(
        &self,
        _next: &NextFilter,
        session: &Arc<Session>,
        cause: SharedError,
    ) -> std::result::Result<(), BoxError> {
        handler::deliver(Event::ExceptionCaught(Arc::clone(session), cause));
        Ok(())
    }
}

/// The ordered set of filters attached to one [`Session`].
pub struct FilterChain {
    session_id: SessionId,
    session: Weak<Session>,
    head: Arc<Entry>,
    tail: Arc<Entry>,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
}

impl FilterChain {
    pub(crate) fn new(session_id: SessionId, session: Weak<Session>) -> Self {
        let head = Arc::new(Entry::new(HEAD_NAME, Arc::new(HeadFilter)));
        let tail = Arc::new(Entry::new(TAIL_NAME, Arc::new(TailFilter)));
        head.set_next(Some(Arc::clone(&tail)));
        tail.set_prev(&head);
        Self {
            session_id,
            session,
            head,
            tail,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Entry>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The owning session, as long as it has not been disposed.
    fn live_session(&self) -> Result<Arc<Session>> {
        match self.session.upgrade() {
            Some(session) if session.status() != SessionStatus::Disposed => Ok(session),
            _ => Err(Error::SessionDisposed(self.session_id)),
        }
    }

    /// Inserts `filter` under `name` at `position`.
    ///
    /// Fails without touching the chain if `name` is taken or reserved, if the
    /// anchor of a `Before`/`After` position is absent, or if `on_pre_add`
    /// fails. If `on_post_add` fails the filter is unlinked again.
    pub fn register(&self, position: Position, name: &str, filter: Arc<dyn Filter>) -> Result<()> {
        if name == HEAD_NAME || name == TAIL_NAME {
            return Err(Error::ReservedName(name.to_owned()));
        }
        let session = self.live_session()?;
        let mut entries = self.lock();
        if entries.contains_key(name) {
            return Err(Error::DuplicateName(name.to_owned()));
        }

        let (prev, next) = match &position {
            Position::First => (Some(Arc::clone(&self.head)), self.head.next()),
            Position::Last => (self.tail.prev(), Some(Arc::clone(&self.tail))),
            Position::Before(anchor) => {
                let anchor = entries
                    .get(anchor)
                    .ok_or_else(|| Error::UnknownAnchor(anchor.clone()))?;
                (anchor.prev(), Some(Arc::clone(anchor)))
            }
            Position::After(anchor) => {
                let anchor = entries
                    .get(anchor)
                    .ok_or_else(|| Error::UnknownAnchor(anchor.clone()))?;
                (Some(Arc::clone(anchor)), anchor.next())
            }
        };
        let (prev, next) = self.links(prev, next);

        filter
            .on_pre_add(&session, name)
            .map_err(|source| Error::Lifecycle {
                name: name.to_owned(),
                stage: "on_pre_add",
                source,
            })?;

        let entry = Arc::new(Entry::new(name, filter));
        entry.set_prev(&prev);
        entry.set_next(Some(Arc::clone(&next)));
        next.set_prev(&entry);
        prev.set_next(Some(Arc::clone(&entry)));
        entries.insert(name.to_owned(), Arc::clone(&entry));

        if let Err(source) = entry.filter.on_post_add(&session, name) {
            Self::unlink(&entry);
            entries.remove(name);
            return Err(Error::Lifecycle {
                name: name.to_owned(),
                stage: "on_post_add",
                source,
            });
        }

        debug!("session {} added filter \"{}\" at {:?}", self.session_id, name, position);
        Ok(())
    }

    /// Inserts `filter` right after the head.
    pub fn add_first(&self, name: &str, filter: Arc<dyn Filter>) -> Result<()> {
        self.register(Position::First, name, filter)
    }

    /// Inserts `filter` right before the tail.
    pub fn add_last(&self, name: &str, filter: Arc<dyn Filter>) -> Result<()> {
        self.register(Position::Last, name, filter)
    }

    /// Inserts `filter` immediately before `anchor`.
    pub fn add_before(&self, anchor: &str, name: &str, filter: Arc<dyn Filter>) -> Result<()> {
        self.register(Position::Before(anchor.to_owned()), name, filter)
    }

    /// Inserts `filter` immediately after `anchor`.
    pub fn add_after(&self, anchor: &str, name: &str, filter: Arc<dyn Filter>) -> Result<()> {
        self.register(Position::After(anchor.to_owned()), name, filter)
    }

    /// Detaches and returns the filter registered as `name`.
    ///
    /// If `on_pre_remove` fails the filter stays. A failing `on_post_remove`
    /// is logged; the filter is detached regardless.
    pub fn remove(&self, name: &str) -> Result<Arc<dyn Filter>> {
        let session = self.live_session()?;
        let mut entries = self.lock();
        let entry = entries
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownName(name.to_owned()))?;

        entry
            .filter
            .on_pre_remove(&session, name)
            .map_err(|source| Error::Lifecycle {
                name: name.to_owned(),
                stage: "on_pre_remove",
                source,
            })?;

        Self::unlink(&entry);
        entries.remove(name);

        if let Err(err) = entry.filter.on_post_remove(&session, name) {
            warn!(
                "session {} filter \"{}\" failed in on_post_remove: {}",
                self.session_id, name, err
            );
        }

        debug!("session {} removed filter \"{}\"", self.session_id, name);
        Ok(Arc::clone(&entry.filter))
    }

    /// Swaps the filter registered as `name` for `filter`, in place.
    ///
    /// Returns the old filter. The old filter sees `on_pre_remove`/`on_post_remove`,
    /// the new one `on_pre_add`/`on_post_add`. If either pre-callback or the new
    /// filter's `on_post_add` fails, the old filter stays.
    pub fn replace(&self, name: &str, filter: Arc<dyn Filter>) -> Result<Arc<dyn Filter>> {
        let session = self.live_session()?;
        let mut entries = self.lock();
        let old = entries
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownName(name.to_owned()))?;

        let lifecycle = |stage, source| Error::Lifecycle {
            name: name.to_owned(),
            stage,
            source,
        };
        old.filter
            .on_pre_remove(&session, name)
            .map_err(|source| lifecycle("on_pre_remove", source))?;
        filter
            .on_pre_add(&session, name)
            .map_err(|source| lifecycle("on_pre_add", source))?;

        let (prev, next) = self.links(old.prev(), old.next());
        let entry = Arc::new(Entry::new(name, filter));
        entry.set_prev(&prev);
        entry.set_next(Some(Arc::clone(&next)));
        next.set_prev(&entry);
        prev.set_next(Some(Arc::clone(&entry)));
        entries.insert(name.to_owned(), Arc::clone(&entry));

        if let Err(source) = entry.filter.on_post_add(&session, name) {
            next.set_prev(&old);
            prev.set_next(Some(Arc::clone(&old)));
            entries.insert(name.to_owned(), old);
            return Err(lifecycle("on_post_add", source));
        }
        if let Err(err) = old.filter.on_post_remove(&session, name) {
            warn!(
                "session {} filter \"{}\" failed in on_post_remove: {}",
                self.session_id, name, err
            );
        }

        debug!("session {} replaced filter \"{}\"", self.session_id, name);
        Ok(Arc::clone(&old.filter))
    }

    /// Removes every filter, front to back. Stops at the first failure.
    pub fn clear(&self) -> Result<()> {
        for name in self.names() {
            self.remove(&name)?;
        }
        Ok(())
    }

    // Links of registered entries are always populated while the chain lock
    // is held; the sentinels stand in only to avoid unwrapping.
    fn links(&self, prev: Option<Arc<Entry>>, next: Option<Arc<Entry>>) -> (Arc<Entry>, Arc<Entry>) {
        (
            prev.unwrap_or_else(|| Arc::clone(&self.head)),
            next.unwrap_or_else(|| Arc::clone(&self.tail)),
        )
    }

    fn unlink(entry: &Arc<Entry>) {
        if let (Some(prev), Some(next)) = (entry.prev(), entry.next()) {
            next.set_prev(&prev);
            prev.set_next(Some(next));
        }
    }

    /// Returns `true` if a filter is registered as `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// The filter registered as `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Filter>> {
        self.lock().get(name).map(|entry| Arc::clone(&entry.filter))
    }

    /// Names of all filters in inbound order.
    pub fn names(&self) -> Vec<String> {
        let _entries = self.lock();
        self.walk().map(|entry| entry.name.clone()).collect()
    }

    /// Names of the filters in `category`, in inbound order.
    pub fn find_category(&self, category: FilterCategory) -> Vec<String> {
        let _entries = self.lock();
        self.walk()
            .filter(|entry| entry.filter.category() == category)
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Number of registered filters.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no filter is registered.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn walk(&self) -> impl Iterator<Item = Arc<Entry>> + '_ {
        std::iter::successors(self.head.next(), |entry| entry.next())
            .take_while(|entry| !Arc::ptr_eq(entry, &self.tail))
    }

    /// Entry point for I/O sources: admits `event` against the session's
    /// lifecycle and walks it from the head toward the handler.
    ///
    /// Rejected events (for example `Received` after the session started
    /// closing) are reported as [`Error::SessionClosing`]. Events arriving
    /// while the session is suspended are parked and delivered on resume.
    pub fn dispatch_inbound(&self, event: Event) -> Result<()> {
        let session = Arc::clone(event.session());
        debug_assert!(
            Weak::ptr_eq(&self.session, &Arc::downgrade(&session)),
            "event belongs to another session"
        );
        match session.admit(event)? {
            Admission::Deliver(event) => self.traverse(event),
            Admission::Flush(events) => events.into_iter().for_each(|e| self.traverse(e)),
            Admission::Parked => {}
        }
        Ok(())
    }

    /// Walks `event` from the head without lifecycle checks.
    pub(crate) fn traverse(&self, event: Event) {
        let closing = match &event {
            Event::Closed(session) => Some(Arc::clone(session)),
            _ => None,
        };
        NextFilter::new(Arc::clone(&self.head)).fire(event);
        if let Some(session) = closing {
            session.closed_dispatched();
        }
    }

    /// Entry point for outbound writes: walks `request` from the tail toward
    /// the [`IoSink`](crate::IoSink).
    pub fn dispatch_outbound(&self, request: WriteRequest) -> Result<()> {
        let session = self.live_session()?;
        let status = session.status();
        if status == SessionStatus::Disposing {
            return Err(Error::SessionClosing {
                id: self.session_id,
                kind: EventKind::Write,
                status,
            });
        }
        NextFilter::new(Arc::clone(&self.tail)).fire_filter_write(&session, request);
        Ok(())
    }

    pub(crate) fn dispatch_close(&self, session: &Arc<Session>) {
        NextFilter::new(Arc::clone(&self.tail)).fire_filter_close(session);
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("session", &self.session_id)
            .field("filters", &self.names())
            .finish()
    }
}
