use std::collections::HashSet;
use std::sync::Arc;

use log::warn;
use sluice::{
    BoxError, Event, EventKind, Filter, FilterCategory, IdleStatus, Message, NextFilter, Session,
    SharedError,
};

use crate::error::SubmitError;
use crate::executor::DispatchExecutor;

/// Offloads the rest of the chain to a [`DispatchExecutor`].
///
/// Events of an offloaded kind are queued and continue from the filter after
/// this one on a worker thread; other kinds pass through on the calling
/// thread. Outbound traffic is never offloaded. If the executor has been shut
/// down, offloaded events are delivered inline once the executor has drained
/// what was queued before them.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use sluice::Session;
/// use sluice_executor::{ExecutorBuilder, ExecutorFilter};
///
/// # fn setup(session: &Arc<Session>) -> sluice::Result<()> {
/// let executor = Arc::new(ExecutorBuilder::new().worker_count(4).build().unwrap());
/// session
///     .chain()
///     .add_last("executor", Arc::new(ExecutorFilter::new(executor)))?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ExecutorFilter {
    executor: Arc<DispatchExecutor>,
    kinds: HashSet<EventKind>,
}

impl ExecutorFilter {
    /// Offloads every inbound event kind.
    pub fn new(executor: Arc<DispatchExecutor>) -> Self {
        Self::with_kinds(executor, EventKind::INBOUND)
    }

    /// Offloads only the given kinds. Outbound kinds are ignored.
    pub fn with_kinds(
        executor: Arc<DispatchExecutor>,
        kinds: impl IntoIterator<Item = EventKind>,
    ) -> Self {
        let kinds = kinds
            .into_iter()
            .filter(|kind| EventKind::INBOUND.contains(kind))
            .collect();
        Self { executor, kinds }
    }

    /// The executor events are handed to.
    pub fn executor(&self) -> &Arc<DispatchExecutor> {
        &self.executor
    }

    /// Returns `true` if events of `kind` are offloaded.
    pub fn offloads(&self, kind: EventKind) -> bool {
        self.kinds.contains(&kind)
    }

    fn offload(&self, next: &NextFilter, event: Event) {
        if !self.offloads(event.kind()) {
            next.fire(event);
            return;
        }
        match self.executor.submit_from(next.clone(), event) {
            Ok(()) => {}
            Err(SubmitError::ShutDown(event) | SubmitError::Full(event)) => {
                warn!(
                    "executor refused {:?} for {}, delivering inline",
                    event.kind(),
                    event.session().id()
                );
                // Events of this session still being drained go first.
                self.executor.await_termination();
                next.fire(event);
            }
        }
    }
}

impl Filter for ExecutorFilter {
    fn category(&self) -> FilterCategory {
        FilterCategory::Executor
    }

    fn session_created(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
    ) -> Result<(), BoxError> {
        self.offload(next, Event::Created(Arc::clone(session)));
        Ok(())
    }

    fn session_opened(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
    ) -> Result<(), BoxError> {
        self.offload(next, Event::Opened(Arc::clone(session)));
        Ok(())
    }

    fn session_closed(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
    ) -> Result<(), BoxError> {
        self.offload(next, Event::Closed(Arc::clone(session)));
        Ok(())
    }

    fn session_idle(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        status: IdleStatus,
    ) -> Result<(), BoxError> {
        self.offload(next, Event::Idle(Arc::clone(session), status));
        Ok(())
    }

    fn message_received(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        message: Message,
    ) -> Result<(), BoxError> {
        self.offload(next, Event::Received(Arc::clone(session), message));
        Ok(())
    }

    fn message_sent(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        message: Message,
    ) -> Result<(), BoxError> {
        self.offload(next, Event::Sent(Arc::clone(session), message));
        Ok(())
    }

    fn exception_caught(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        cause: SharedError,
    ) -> Result<(), BoxError> {
        self.offload(next, Event::ExceptionCaught(Arc::clone(session), cause));
        Ok(())
    }
}
