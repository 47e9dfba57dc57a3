//! # Filter Trait - Interceptors on a Session's Chain
//!
//! A [`Filter`] sits in a session's [`FilterChain`](crate::FilterChain) and sees every
//! event on its way through:
//!
//! - **Inbound** (`session_*`, `message_*`, `exception_caught`): head → filters in
//!   registration order → terminal [`Handler`](crate::Handler)
//! - **Outbound** (`filter_write`, `filter_close`): session → filters in reverse
//!   order → [`IoSink`](crate::IoSink)
//!
//! Every callback receives a [`NextFilter`], the continuation to the neighbouring
//! entry. Calling `next.fire_*` passes the event on; returning without calling it
//! swallows the event. That is how a filter buffers during a handshake, drops
//! duplicates, or defers writes.
//!
//! ## Example: Counting Filter
//!
//! ```rust
//! use std::sync::Arc;
//! use sluice::{AttributeKey, BoxError, Filter, Message, NextFilter, Session};
//!
//! static RECEIVED: AttributeKey<u64> = AttributeKey::new("counter", "received");
//!
//! struct CountingFilter;
//!
//! impl Filter for CountingFilter {
//!     fn message_received(
//!         &self,
//!         next: &NextFilter,
//!         session: &Arc<Session>,
//!         message: Message,
//!     ) -> Result<(), BoxError> {
//!         session.attributes().get_or_insert_with(&RECEIVED, || 0);
//!         session.attributes().with(&RECEIVED, |n| *n += 1);
//!         next.fire_message_received(session, message);
//!         Ok(())
//!     }
//! }
//! ```
//!
//! ## Faults
//!
//! A callback that returns `Err` (or panics) does not unwind the caller. The chain
//! wraps the error in [`Error::HandlerFault`](crate::Error::HandlerFault) and fires
//! `ExceptionCaught` from the failing entry toward the handler, so filters further
//! down still observe it. Faults raised while handling `ExceptionCaught` itself are
//! logged and dropped.
//!
//! ## Sharing
//!
//! Filters are `Send + Sync` and usually shared by many sessions through an
//! `Arc<dyn Filter>`. Per-connection state belongs in the session's
//! [`AttributeMap`](crate::AttributeMap), keyed by an
//! [`AttributeKey`](crate::AttributeKey) scoped to the filter.

use std::fmt;
use std::sync::Arc;

use log::{trace, warn};

use crate::chain::{Entry, Outbound};
use crate::error::{BoxError, SharedError};
use crate::event::{Event, IdleStatus};
use crate::message::{Message, WriteRequest};
use crate::session::Session;

/// Coarse role of a filter, queried with
/// [`FilterChain::find_category`](crate::FilterChain::find_category).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterCategory {
    /// Encodes or decodes messages.
    Codec,
    /// Hands events over to another thread.
    Executor,
    /// Observes events for diagnostics.
    Logging,
    /// Runs a connection-level negotiation and buffers traffic until it completes.
    Handshake,
    /// Anything else.
    Generic,
}

/// An interceptor for one or more sessions' events.
///
/// Every event callback has a default implementation that forwards to the
/// next entry, so a filter only overrides what it cares about.
pub trait Filter: Send + Sync + 'static {
    /// The filter's role.
    fn category(&self) -> FilterCategory {
        FilterCategory::Generic
    }

    /// Called before the filter is linked into `session`'s chain under `name`.
    ///
    /// Returning `Err` aborts the registration and leaves the chain unchanged.
    /// Runs while the chain's mutation lock is held: do not mutate the same
    /// chain from here.
    fn on_pre_add(&self, session: &Arc<Session>, name: &str) -> Result<(), BoxError> {
        let _ = (session, name);
        Ok(())
    }

    /// Called after the filter has been linked.
    ///
    /// Returning `Err` unlinks the filter again and fails the registration.
    fn on_post_add(&self, session: &Arc<Session>, name: &str) -> Result<(), BoxError> {
        let _ = (session, name);
        Ok(())
    }

    /// Called before the filter is unlinked. Returning `Err` aborts the removal.
    fn on_pre_remove(&self, session: &Arc<Session>, name: &str) -> Result<(), BoxError> {
        let _ = (session, name);
        Ok(())
    }

    /// Called after the filter has been unlinked.
    fn on_post_remove(&self, session: &Arc<Session>, name: &str) -> Result<(), BoxError> {
        let _ = (session, name);
        Ok(())
    }

    /// The session has been created.
    fn session_created(&self, next: &NextFilter, session: &Arc<Session>) -> Result<(), BoxError> {
        next.fire_session_created(session);
        Ok(())
    }

    /// The session's connection is open.
    fn session_opened(&self, next: &NextFilter, session: &Arc<Session>) -> Result<(), BoxError> {
        next.fire_session_opened(session);
        Ok(())
    }

    /// The session's connection has closed.
    fn session_closed(&self, next: &NextFilter, session: &Arc<Session>) -> Result<(), BoxError> {
        next.fire_session_closed(session);
        Ok(())
    }

    /// The session has been idle.
    fn session_idle(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        status: IdleStatus,
    ) -> Result<(), BoxError> {
        next.fire_session_idle(session, status);
        Ok(())
    }

    /// A message arrived.
    fn message_received(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        message: Message,
    ) -> Result<(), BoxError> {
        next.fire_message_received(session, message);
        Ok(())
    }

    /// A message was written to the transport.
    fn message_sent(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        message: Message,
    ) -> Result<(), BoxError> {
        next.fire_message_sent(session, message);
        Ok(())
    }

    /// An error was raised upstream of this filter.
    fn exception_caught(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        cause: SharedError,
    ) -> Result<(), BoxError> {
        next.fire_exception_caught(session, cause);
        Ok(())
    }

    /// A write request is travelling toward the transport.
    fn filter_write(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        request: WriteRequest,
    ) -> Result<(), BoxError> {
        next.fire_filter_write(session, request);
        Ok(())
    }

    /// A close request is travelling toward the transport.
    fn filter_close(&self, next: &NextFilter, session: &Arc<Session>) -> Result<(), BoxError> {
        next.fire_filter_close(session);
        Ok(())
    }
}

/// Continuation handed to each [`Filter`] callback.
///
/// Inbound `fire_*` methods deliver to the entry after the current one,
/// outbound ones to the entry before it. A `NextFilter` is cheap to clone and
/// `'static`, so a filter may keep it and resume the chain later from another
/// thread; that is how [`sluice-executor`](https://docs.rs/sluice-executor)
/// moves the rest of the chain onto its workers.
#[derive(Clone)]
pub struct NextFilter {
    entry: Arc<Entry>,
}

impl NextFilter {
    pub(crate) fn new(entry: Arc<Entry>) -> Self {
        Self { entry }
    }

    /// Name of the entry this continuation belongs to.
    pub fn name(&self) -> &str {
        self.entry.name()
    }

    /// Forwards an inbound event to the next entry.
    pub fn fire(&self, event: Event) {
        match self.entry.next() {
            Some(next) => next.deliver_inbound(event),
            None => warn!(
                "{:?} reached end of chain after \"{}\"",
                event.kind(),
                self.entry.name()
            ),
        }
    }

    /// Forwards `Created`.
    pub fn fire_session_created(&self, session: &Arc<Session>) {
        self.fire(Event::Created(Arc::clone(session)));
    }

    /// Forwards `Opened`.
    pub fn fire_session_opened(&self, session: &Arc<Session>) {
        self.fire(Event::Opened(Arc::clone(session)));
    }

    /// Forwards `Closed`.
    pub fn fire_session_closed(&self, session: &Arc<Session>) {
        self.fire(Event::Closed(Arc::clone(session)));
    }

    /// Forwards `Idle`.
    pub fn fire_session_idle(&self, session: &Arc<Session>, status: IdleStatus) {
        self.fire(Event::Idle(Arc::clone(session), status));
    }

    /// Forwards `Received`.
    pub fn fire_message_received(&self, session: &Arc<Session>, message: Message) {
        self.fire(Event::Received(Arc::clone(session), message));
    }

    /// Forwards `Sent`.
    pub fn fire_message_sent(&self, session: &Arc<Session>, message: Message) {
        self.fire(Event::Sent(Arc::clone(session), message));
    }

    /// Forwards `ExceptionCaught`.
    pub fn fire_exception_caught(&self, session: &Arc<Session>, cause: SharedError) {
        self.fire(Event::ExceptionCaught(Arc::clone(session), cause));
    }

    /// Forwards a write request to the previous entry.
    pub fn fire_filter_write(&self, session: &Arc<Session>, request: WriteRequest) {
        self.fire_outbound(session, Outbound::Write(request));
    }

    /// Forwards a close request to the previous entry.
    pub fn fire_filter_close(&self, session: &Arc<Session>) {
        self.fire_outbound(session, Outbound::Close);
    }

    fn fire_outbound(&self, session: &Arc<Session>, op: Outbound) {
        match self.entry.prev() {
            Some(prev) => prev.deliver_outbound(session, op),
            None => trace!(
                "{:?} reached start of chain before \"{}\"",
                op.kind(),
                self.entry.name()
            ),
        }
    }
}

impl fmt::Debug for NextFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NextFilter")
            .field("entry", &self.entry.name())
            .finish()
    }
}
