use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use core_affinity::{CoreId, set_for_current};
use log::{debug, trace, warn};
use sluice::{Event, InFlight, NextFilter, deliver};
use sluice_pool::{LeaderFollowersPool, PoolBuilder, QueueError, WorkQueue, WorkSource};

use crate::error::{ExecutorError, SubmitError};

static NEXT_EXECUTOR_UID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    // Uid of the executor whose ordered worker runs on this thread.
    static CURRENT_WORKER: Cell<Option<u64>> = const { Cell::new(None) };
}

/// How events are spread over workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Discipline {
    /// Every event of a session goes to the same worker, picked by
    /// `session id % worker_count`, so a session's events are delivered in
    /// submission order.
    Ordered,
    /// Any idle worker takes the next event. Sessions may see their events
    /// out of order.
    Unordered,
}

/// One queued event, plus where its delivery resumes.
///
/// A `Dispatch` holds an [`InFlight`] guard, so its session cannot become
/// `Disposed` while the event is queued or running.
pub struct Dispatch {
    event: Event,
    resume: Option<NextFilter>,
    _guard: InFlight,
}

impl Dispatch {
    fn new(event: Event, resume: Option<NextFilter>) -> Self {
        let guard = event.session().in_flight();
        Self {
            event,
            resume,
            _guard: guard,
        }
    }

    /// The queued event.
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Delivers the event: to the filter after `resume` if the event was
    /// offloaded from a chain, straight to the session's handler otherwise.
    pub fn run(self) {
        let Dispatch {
            event,
            resume,
            _guard,
        } = self;
        trace!("dispatching {:?}", event);
        match resume {
            Some(next) => next.fire(event),
            None => deliver(event),
        }
    }

    fn into_event(self) -> Event {
        self.event
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field("event", &self.event)
            .field("resume", &self.resume)
            .finish()
    }
}

/// The shared queue the unordered workers take turns leading on.
struct DispatchSource {
    queue: WorkQueue<Dispatch>,
}

impl WorkSource for DispatchSource {
    type Work = Dispatch;

    fn next_work(&self) -> Option<Dispatch> {
        self.queue.pop()
    }

    fn run(&self, dispatch: Dispatch) {
        dispatch.run();
    }

    fn interrupt(&self) {
        self.queue.close();
    }
}

struct Spilled {
    after: u64,
    dispatch: Dispatch,
}

/// An ordered worker's inbox.
///
/// Outside submitters block on the bounded queue. Worker threads never block:
/// when the queue is full, or something is spilled already, their events go to
/// the spill list. A spilled event is taken once every event queued ahead of it
/// has been taken, so each submitter's events keep their order.
struct Mailbox {
    queue: WorkQueue<Dispatch>,
    spill: Mutex<VecDeque<Spilled>>,
    taken: AtomicU64,
}

impl Mailbox {
    fn new(capacity: usize) -> Self {
        Self {
            queue: WorkQueue::new(capacity),
            spill: Mutex::new(VecDeque::new()),
            taken: AtomicU64::new(0),
        }
    }

    fn push(&self, dispatch: Dispatch) -> Result<(), QueueError<Dispatch>> {
        self.queue.push(dispatch)
    }

    fn try_push(&self, dispatch: Dispatch) -> Result<(), QueueError<Dispatch>> {
        let spill = lock(&self.spill);
        if !spill.is_empty() {
            return Err(QueueError::Full(dispatch));
        }
        self.queue.try_push(dispatch)
    }

    fn push_or_spill(&self, dispatch: Dispatch) -> Result<(), QueueError<Dispatch>> {
        let mut spill = lock(&self.spill);
        let dispatch = if spill.is_empty() {
            match self.queue.try_push(dispatch) {
                Err(QueueError::Full(dispatch)) => dispatch,
                other => return other,
            }
        } else if self.queue.is_closed() {
            return Err(QueueError::Closed(dispatch));
        } else {
            dispatch
        };
        // Read the length before the count: a take in between only makes
        // `after` larger, and an empty queue releases the entry anyway.
        let queued = self.queue.len() as u64;
        let after = self.taken.load(Ordering::Acquire) + queued + 1;
        trace!(
            "spilled {:?} behind {} queued event(s)",
            dispatch.event().kind(),
            queued
        );
        spill.push_back(Spilled { after, dispatch });
        Ok(())
    }

    fn take_spilled(&self) -> Option<Dispatch> {
        let mut spill = lock(&self.spill);
        let ready = spill.front().is_some_and(|front| {
            self.taken.load(Ordering::Acquire) >= front.after || self.queue.is_empty()
        });
        if ready {
            spill.pop_front().map(|spilled| spilled.dispatch)
        } else {
            None
        }
    }

    /// Next event in submission order, blocking while there is none.
    /// `None` once closed and empty.
    fn next(&self) -> Option<Dispatch> {
        if let Some(dispatch) = self.take_spilled() {
            return Some(dispatch);
        }
        match self.queue.pop() {
            Some(dispatch) => {
                self.taken.fetch_add(1, Ordering::AcqRel);
                Some(dispatch)
            }
            None => lock(&self.spill).pop_front().map(|spilled| spilled.dispatch),
        }
    }

    fn close(&self) {
        self.queue.close();
    }

    fn drain(&self) -> Vec<Dispatch> {
        let mut drained = self.queue.drain();
        drained.extend(lock(&self.spill).drain(..).map(|spilled| spilled.dispatch));
        drained
    }

    fn len(&self) -> usize {
        self.queue.len() + lock(&self.spill).len()
    }
}

struct Worker {
    mailbox: Arc<Mailbox>,
    handle: Option<JoinHandle<()>>,
}

enum Workers {
    Ordered(Mutex<Vec<Worker>>, Vec<Arc<Mailbox>>),
    Unordered(LeaderFollowersPool<DispatchSource>),
}

#[derive(Default)]
struct Termination {
    draining: Option<ThreadId>,
    done: bool,
}

/// A factory that can be used to configure and start a [`DispatchExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutorBuilder {
    name: String,
    worker_count: usize,
    queue_capacity: usize,
    discipline: Discipline,
    keep_alive: Option<Duration>,
    core_ids: Vec<CoreId>,
}

impl Default for ExecutorBuilder {
    fn default() -> Self {
        Self {
            name: String::from("sluice-executor"),
            worker_count: thread::available_parallelism().map_or(4, |n| n.get()),
            queue_capacity: 1024,
            discipline: Discipline::Ordered,
            keep_alive: Some(Duration::from_secs(60)),
            core_ids: Vec::new(),
        }
    }
}

impl ExecutorBuilder {
    /// Creates a new ExecutorBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the worker threads; each is called `{name}-{index}`.
    pub fn name(mut self, name: &str) -> Self {
        self.name = String::from(name);
        self
    }

    /// Number of workers. Under [`Discipline::Unordered`] this is the
    /// maximum size of the worker pool.
    pub fn worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Capacity of each worker queue (of the shared queue when unordered).
    /// A full queue blocks [`submit`](DispatchExecutor::submit).
    pub fn queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Sets the dispatch discipline.
    pub fn discipline(mut self, discipline: Discipline) -> Self {
        self.discipline = discipline;
        self
    }

    /// Idle timeout of unordered workers beyond the first. Ignored when ordered.
    pub fn keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Pins workers to CPU cores, round-robin by worker index.
    pub fn core_id(mut self, core_id: CoreId) -> Self {
        self.core_ids.push(core_id);
        self
    }

    /// Starts the workers.
    pub fn build(self) -> Result<DispatchExecutor, ExecutorError> {
        if self.worker_count == 0 {
            return Err(ExecutorError::InvalidConfig("worker_count must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(ExecutorError::InvalidConfig("queue_capacity must be at least 1"));
        }

        let uid = NEXT_EXECUTOR_UID.fetch_add(1, Ordering::Relaxed);
        let stopping = Arc::new(AtomicBool::new(false));
        let workers = match self.discipline {
            Discipline::Ordered => self.spawn_ordered(uid, &stopping)?,
            Discipline::Unordered => {
                let pool = self
                    .core_ids
                    .iter()
                    .fold(PoolBuilder::new(), |pool, core_id| pool.core_id(*core_id))
                    .name(&self.name)
                    .max_pool_size(self.worker_count)
                    .keep_alive(self.keep_alive)
                    .build(DispatchSource {
                        queue: WorkQueue::new(self.queue_capacity),
                    })?;
                Workers::Unordered(pool)
            }
        };
        debug!(
            "{} started: {} {:?} worker(s)",
            self.name, self.worker_count, self.discipline
        );

        Ok(DispatchExecutor {
            uid,
            name: self.name,
            discipline: self.discipline,
            worker_count: self.worker_count,
            stopping,
            shut_down: AtomicBool::new(false),
            submitting: AtomicUsize::new(0),
            shutdown_lock: Mutex::new(()),
            termination: Mutex::new(Termination::default()),
            terminated: Condvar::new(),
            workers,
        })
    }

    fn spawn_ordered(&self, uid: u64, stopping: &Arc<AtomicBool>) -> Result<Workers, ExecutorError> {
        let mut workers = Vec::with_capacity(self.worker_count);
        for index in 0..self.worker_count {
            let mailbox = Arc::new(Mailbox::new(self.queue_capacity));
            let core_id = match self.core_ids.len() {
                0 => None,
                n => Some(self.core_ids[index % n]),
            };
            let spawned = {
                let mailbox = Arc::clone(&mailbox);
                let stopping = Arc::clone(stopping);
                thread::Builder::new()
                    .name(format!("{}-{}", self.name, index))
                    .spawn(move || {
                        if let Some(core_id) = core_id {
                            set_for_current(core_id);
                        }
                        CURRENT_WORKER.with(|current| current.set(Some(uid)));
                        worker_loop(&mailbox, &stopping);
                    })
            };
            match spawned {
                Ok(handle) => workers.push(Worker {
                    mailbox,
                    handle: Some(handle),
                }),
                Err(err) => {
                    for worker in &mut workers {
                        worker.mailbox.close();
                        if let Some(handle) = worker.handle.take() {
                            let _ = handle.join();
                        }
                    }
                    return Err(err.into());
                }
            }
        }
        let mailboxes = workers.iter().map(|w| Arc::clone(&w.mailbox)).collect();
        Ok(Workers::Ordered(Mutex::new(workers), mailboxes))
    }
}

// Runs until the mailbox is closed and empty, or until stopped. An event taken
// off the mailbox is always delivered.
fn worker_loop(mailbox: &Mailbox, stopping: &AtomicBool) {
    while !stopping.load(Ordering::Acquire) {
        match mailbox.next() {
            Some(dispatch) => dispatch.run(),
            None => break,
        }
    }
    trace!("{} exiting", thread::current().name().unwrap_or("worker"));
}

/// Hands events to worker threads, preserving per-session order under
/// [`Discipline::Ordered`].
///
/// ```rust,no_run
/// use sluice_executor::{Discipline, ExecutorBuilder};
///
/// let executor = ExecutorBuilder::new()
///     .name("dispatch")
///     .worker_count(8)
///     .queue_capacity(256)
///     .discipline(Discipline::Ordered)
///     .build()
///     .unwrap();
///
/// // executor.submit(event) from an I/O thread ...
/// executor.shutdown();
/// ```
pub struct DispatchExecutor {
    uid: u64,
    name: String,
    discipline: Discipline,
    worker_count: usize,
    stopping: Arc<AtomicBool>,
    shut_down: AtomicBool,
    // Submitters between their shutdown check and the end of their push.
    submitting: AtomicUsize,
    shutdown_lock: Mutex<()>,
    termination: Mutex<Termination>,
    terminated: Condvar,
    workers: Workers,
}

impl DispatchExecutor {
    /// Starts building an executor.
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::new()
    }

    /// The dispatch discipline.
    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    /// Configured number of workers.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Index of the worker that delivers `event` under [`Discipline::Ordered`].
    pub fn worker_index(&self, event: &Event) -> usize {
        (event.session().id().as_u64() % self.worker_count as u64) as usize
    }

    /// Returns `true` once shutdown has begun.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Returns `true` once shutdown has delivered (or handed back) every
    /// queued event.
    pub fn is_terminated(&self) -> bool {
        lock(&self.termination).done
    }

    /// Blocks until a shutdown in progress has delivered every queued event.
    ///
    /// Returns at once on this executor's own worker threads and on the thread
    /// running the shutdown, which would otherwise wait for themselves.
    pub fn await_termination(&self) {
        if self.on_worker_thread() {
            return;
        }
        let current = thread::current().id();
        let state = lock(&self.termination);
        let _state = self
            .terminated
            .wait_while(state, |t| !t.done && t.draining != Some(current))
            .unwrap_or_else(PoisonError::into_inner);
    }

    // True on this executor's ordered workers and unordered pool threads.
    fn on_worker_thread(&self) -> bool {
        match &self.workers {
            Workers::Ordered(..) => CURRENT_WORKER.with(|current| current.get()) == Some(self.uid),
            Workers::Unordered(pool) => pool.is_member(),
        }
    }

    /// Events queued but not yet taken by a worker.
    pub fn pending(&self) -> usize {
        match &self.workers {
            Workers::Ordered(_, mailboxes) => mailboxes.iter().map(|m| m.len()).sum(),
            Workers::Unordered(pool) => pool.source().queue.len(),
        }
    }

    /// Queues `event` for delivery to its session's handler, blocking while
    /// the destination queue is full.
    pub fn submit(&self, event: Event) -> Result<(), SubmitError> {
        self.enqueue(Dispatch::new(event, None), true)
    }

    /// Queues `event` to be fired into the chain after the filter `next`
    /// belongs to. Used by filters that offload the rest of the chain.
    pub fn submit_from(&self, next: NextFilter, event: Event) -> Result<(), SubmitError> {
        self.enqueue(Dispatch::new(event, Some(next)), true)
    }

    /// Like [`submit`](DispatchExecutor::submit), but fails with
    /// [`SubmitError::Full`] instead of blocking.
    pub fn try_submit(&self, event: Event) -> Result<(), SubmitError> {
        self.enqueue(Dispatch::new(event, None), false)
    }

    fn enqueue(&self, dispatch: Dispatch, block: bool) -> Result<(), SubmitError> {
        self.submitting.fetch_add(1, Ordering::SeqCst);
        let pushed = if self.shut_down.load(Ordering::SeqCst) {
            Err(QueueError::Closed(dispatch))
        } else {
            self.push(dispatch, block)
        };
        self.submitting.fetch_sub(1, Ordering::SeqCst);

        match pushed {
            Ok(None) => Ok(()),
            Ok(Some(dispatch)) => {
                dispatch.run();
                Ok(())
            }
            Err(QueueError::Full(dispatch)) => Err(SubmitError::Full(dispatch.into_event())),
            Err(QueueError::Closed(dispatch)) => Err(SubmitError::ShutDown(dispatch.into_event())),
        }
    }

    // `Ok(Some(_))` hands the event back for inline delivery. Worker threads
    // never block here: a worker waiting on a queue that a blocked worker
    // drains would never wake up.
    fn push(
        &self,
        dispatch: Dispatch,
        block: bool,
    ) -> Result<Option<Dispatch>, QueueError<Dispatch>> {
        trace!("{} queued {:?}", self.name, dispatch.event());
        match &self.workers {
            Workers::Ordered(_, mailboxes) => {
                let mailbox = &mailboxes[self.worker_index(dispatch.event())];
                if !block {
                    mailbox.try_push(dispatch)?;
                } else if self.on_worker_thread() {
                    mailbox.push_or_spill(dispatch)?;
                } else {
                    mailbox.push(dispatch)?;
                }
                Ok(None)
            }
            Workers::Unordered(pool) => {
                let queue = &pool.source().queue;
                if block && !pool.is_member() {
                    return queue.push(dispatch).map(|()| None);
                }
                match queue.try_push(dispatch) {
                    Ok(()) => Ok(None),
                    Err(QueueError::Full(dispatch)) if block => {
                        warn!(
                            "{} queue full on a pool thread, delivering {:?} inline",
                            self.name,
                            dispatch.event().kind()
                        );
                        Ok(Some(dispatch))
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Stops accepting events, delivers everything already queued and waits
    /// for the workers to exit. A worker calling this does not wait for
    /// itself. Idempotent.
    pub fn shutdown(&self) {
        let Some(_guard) = self.lock_shutdown() else {
            return;
        };
        if self.begin_shutdown() {
            debug!("{} draining {} event(s)", self.name, self.pending());
        }
        let leftovers = match &self.workers {
            Workers::Ordered(_, mailboxes) => {
                mailboxes.iter().for_each(|m| m.close());
                self.await_submitters();
                self.join_workers();
                // The calling worker's mailbox, and pushes that landed after
                // their worker exited.
                mailboxes.iter().flat_map(|m| m.drain()).collect()
            }
            Workers::Unordered(pool) => {
                // Pool threads exit after their current unit; what they left
                // behind is delivered here.
                pool.shutdown();
                self.await_submitters();
                pool.source().queue.drain()
            }
        };
        for dispatch in leftovers {
            dispatch.run();
        }
        self.finish_shutdown();
    }

    /// Stops the workers as soon as their current event is delivered and
    /// returns the events that were still queued, in queue order per worker.
    pub fn shutdown_now(&self) -> Vec<Event> {
        let Some(_guard) = self.lock_shutdown() else {
            return Vec::new();
        };
        self.stopping.store(true, Ordering::Release);
        self.begin_shutdown();
        let undelivered: Vec<Event> = match &self.workers {
            Workers::Ordered(_, mailboxes) => {
                mailboxes.iter().for_each(|m| m.close());
                self.await_submitters();
                self.join_workers();
                mailboxes
                    .iter()
                    .flat_map(|m| m.drain())
                    .map(Dispatch::into_event)
                    .collect()
            }
            Workers::Unordered(pool) => {
                pool.shutdown();
                self.await_submitters();
                pool.source()
                    .queue
                    .drain()
                    .into_iter()
                    .map(Dispatch::into_event)
                    .collect()
            }
        };
        if !undelivered.is_empty() {
            warn!(
                "{} stopped with {} undelivered event(s)",
                self.name,
                undelivered.len()
            );
        }
        self.finish_shutdown();
        undelivered
    }

    // A worker that finds another thread shutting down returns at once; that
    // thread is about to join it.
    fn lock_shutdown(&self) -> Option<MutexGuard<'_, ()>> {
        let guard = if self.on_worker_thread() {
            match self.shutdown_lock.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => return None,
            }
        } else {
            lock(&self.shutdown_lock)
        };
        let mut termination = lock(&self.termination);
        if !termination.done {
            termination.draining = Some(thread::current().id());
        }
        Some(guard)
    }

    fn finish_shutdown(&self) {
        let mut termination = lock(&self.termination);
        termination.draining = None;
        termination.done = true;
        self.terminated.notify_all();
    }

    fn begin_shutdown(&self) -> bool {
        !self.shut_down.swap(true, Ordering::SeqCst)
    }

    // Waits out submitters that passed the shutdown check before it was set,
    // so their events are queued or refused before the final drain. The
    // queues are closed by now, so none of them is blocked.
    fn await_submitters(&self) {
        while self.submitting.load(Ordering::SeqCst) > 0 {
            thread::yield_now();
        }
    }

    fn join_workers(&self) {
        let Workers::Ordered(workers, _) = &self.workers else {
            return;
        };
        let current = thread::current().id();
        let handles: Vec<JoinHandle<()>> = lock(workers)
            .iter_mut()
            .filter_map(|worker| worker.handle.take())
            .collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("{} worker panicked", self.name);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Drop for DispatchExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for DispatchExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchExecutor")
            .field("name", &self.name)
            .field("discipline", &self.discipline)
            .field("worker_count", &self.worker_count)
            .field("pending", &self.pending())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
