use std::sync::Arc;

use log::{Level, log, log_enabled};

use crate::error::{BoxError, SharedError};
use crate::event::{EventKind, IdleStatus};
use crate::filter::{Filter, FilterCategory, NextFilter};
use crate::message::{Message, WriteRequest};
use crate::session::Session;

/// Logs every event passing through it, then forwards it unchanged.
///
/// Each event kind has its own level; `None` silences that kind. Defaults are
/// `Info` for lifecycle events, `Debug` for traffic and `Warn` for exceptions.
///
/// ```rust
/// use log::Level;
/// use sluice::{EventKind, LoggingFilter};
///
/// let filter = LoggingFilter::new()
///     .with_level(EventKind::Received, Some(Level::Trace))
///     .with_level(EventKind::Sent, None);
/// assert_eq!(filter.level(EventKind::Sent), None);
/// ```
#[derive(Clone, Debug)]
pub struct LoggingFilter {
    levels: [Option<Level>; 9],
}

fn slot(kind: EventKind) -> usize {
    match kind {
        EventKind::Created => 0,
        EventKind::Opened => 1,
        EventKind::Closed => 2,
        EventKind::Idle => 3,
        EventKind::Received => 4,
        EventKind::Sent => 5,
        EventKind::ExceptionCaught => 6,
        EventKind::Write => 7,
        EventKind::Close => 8,
    }
}

impl Default for LoggingFilter {
    fn default() -> Self {
        let mut levels = [Some(Level::Debug); 9];
        levels[slot(EventKind::Created)] = Some(Level::Info);
        levels[slot(EventKind::Opened)] = Some(Level::Info);
        levels[slot(EventKind::Closed)] = Some(Level::Info);
        levels[slot(EventKind::Close)] = Some(Level::Info);
        levels[slot(EventKind::ExceptionCaught)] = Some(Level::Warn);
        Self { levels }
    }
}

impl LoggingFilter {
    /// Creates a filter with the default levels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the level for `kind`; `None` disables logging for it.
    pub fn with_level(mut self, kind: EventKind, level: Option<Level>) -> Self {
        self.levels[slot(kind)] = level;
        self
    }

    /// The level used for `kind`.
    pub fn level(&self, kind: EventKind) -> Option<Level> {
        self.levels[slot(kind)]
    }

    fn emit(&self, session: &Session, kind: EventKind, detail: &dyn Fn() -> String) {
        if let Some(level) = self.level(kind) {
            if log_enabled!(level) {
                log!(level, "session {} {:?} {}", session.id(), kind, detail());
            }
        }
    }
}

impl Filter for LoggingFilter {
    fn category(&self) -> FilterCategory {
        FilterCategory::Logging
    }

    fn session_created(&self, next: &NextFilter, session: &Arc<Session>) -> Result<(), BoxError> {
        self.emit(session, EventKind::Created, &|| {
            format!("remote={:?}", session.remote_addr())
        });
        next.fire_session_created(session);
        Ok(())
    }

    fn session_opened(&self, next: &NextFilter, session: &Arc<Session>) -> Result<(), BoxError> {
        self.emit(session, EventKind::Opened, &String::new);
        next.fire_session_opened(session);
        Ok(())
    }

    fn session_closed(&self, next: &NextFilter, session: &Arc<Session>) -> Result<(), BoxError> {
        self.emit(session, EventKind::Closed, &|| {
            format!("after {:?}", session.created_at().elapsed())
        });
        next.fire_session_closed(session);
        Ok(())
    }

    fn session_idle(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        status: IdleStatus,
    ) -> Result<(), BoxError> {
        self.emit(session, EventKind::Idle, &|| format!("{status:?}"));
        next.fire_session_idle(session, status);
        Ok(())
    }

    fn message_received(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        message: Message,
    ) -> Result<(), BoxError> {
        self.emit(session, EventKind::Received, &|| message.type_name().to_owned());
        next.fire_message_received(session, message);
        Ok(())
    }

    fn message_sent(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        message: Message,
    ) -> Result<(), BoxError> {
        self.emit(session, EventKind::Sent, &|| message.type_name().to_owned());
        next.fire_message_sent(session, message);
        Ok(())
    }

    fn exception_caught(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        cause: SharedError,
    ) -> Result<(), BoxError> {
        self.emit(session, EventKind::ExceptionCaught, &|| cause.to_string());
        next.fire_exception_caught(session, cause);
        Ok(())
    }

    fn filter_write(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        request: WriteRequest,
    ) -> Result<(), BoxError> {
        self.emit(session, EventKind::Write, &|| {
            request.message().type_name().to_owned()
        });
        next.fire_filter_write(session, request);
        Ok(())
    }

    fn filter_close(&self, next: &NextFilter, session: &Arc<Session>) -> Result<(), BoxError> {
        self.emit(session, EventKind::Close, &String::new);
        next.fire_filter_close(session);
        Ok(())
    }
}
