use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use core_affinity::{CoreId, set_for_current};
use log::{debug, error, trace, warn};

use crate::error::{PoolError, QueueError};
use crate::ids::IdAllocator;
use crate::queue::WorkQueue;

static NEXT_POOL_UID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_POOL: Cell<Option<u64>> = const { Cell::new(None) };
}

/// A shared source of work that exactly one pool thread (the leader) waits on
/// at a time.
pub trait WorkSource: Send + Sync + 'static {
    /// One unit of work.
    type Work: Send;

    /// Blocks until the next unit is available.
    ///
    /// Returns `None` when the source is exhausted or has been interrupted;
    /// the calling thread then leaves the pool.
    fn next_work(&self) -> Option<Self::Work>;

    /// Processes one unit. Panics are not caught; they end the thread.
    fn run(&self, work: Self::Work);

    /// Wakes a thread blocked in [`next_work`](WorkSource::next_work) so it
    /// returns `None`. Called repeatedly during shutdown.
    fn interrupt(&self);
}

/// Live counters describing a pool.
#[derive(Debug, Default)]
pub struct PoolStats {
    pool_size: AtomicUsize,
    peak_pool_size: AtomicUsize,
    leaders: AtomicUsize,
    peak_leaders: AtomicUsize,
    followers: AtomicUsize,
    processing: AtomicUsize,
    completed: AtomicU64,
    spawned: AtomicU64,
    exhausted: AtomicU64,
}

fn raise(peak: &AtomicUsize, value: usize) {
    peak.fetch_max(value, Ordering::AcqRel);
}

impl PoolStats {
    /// Threads currently alive.
    pub fn pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Acquire)
    }

    /// Most threads ever alive at once.
    pub fn peak_pool_size(&self) -> usize {
        self.peak_pool_size.load(Ordering::Acquire)
    }

    /// Threads currently leading (0 or 1).
    pub fn leaders(&self) -> usize {
        self.leaders.load(Ordering::Acquire)
    }

    /// Most threads ever leading at once.
    pub fn peak_leaders(&self) -> usize {
        self.peak_leaders.load(Ordering::Acquire)
    }

    /// Threads parked on the follower stack.
    pub fn followers(&self) -> usize {
        self.followers.load(Ordering::Acquire)
    }

    /// Threads currently running a unit.
    pub fn processing(&self) -> usize {
        self.processing.load(Ordering::Acquire)
    }

    /// Units run to completion.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Threads started over the pool's lifetime.
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Acquire)
    }

    /// Promotions that found neither an idle follower nor room to grow.
    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Acquire)
    }
}

/// A factory that can be used to configure and start a [`LeaderFollowersPool`].
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    name: String,
    max_pool_size: usize,
    keep_alive: Option<Duration>,
    core_ids: Vec<CoreId>,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self {
            name: String::from("sluice-pool"),
            max_pool_size: 16,
            keep_alive: Some(Duration::from_secs(60)),
            core_ids: Vec::new(),
        }
    }
}

impl PoolBuilder {
    /// Creates a new PoolBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the pool's threads; each thread is called `{name}-{id}`.
    pub fn name(mut self, name: &str) -> Self {
        self.name = String::from(name);
        self
    }

    /// Upper bound on live threads.
    pub fn max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size;
        self
    }

    /// How long an idle follower waits before exiting. `None` or zero keeps
    /// followers forever.
    pub fn keep_alive(mut self, keep_alive: Option<Duration>) -> Self {
        self.keep_alive = keep_alive.filter(|d| !d.is_zero());
        self
    }

    /// Pins threads to CPU cores, round-robin by thread id.
    pub fn core_id(mut self, core_id: CoreId) -> Self {
        self.core_ids.push(core_id);
        self
    }

    /// Starts the pool with a single leader thread waiting on `source`.
    pub fn build<S: WorkSource>(self, source: S) -> Result<LeaderFollowersPool<S>, PoolError> {
        if self.max_pool_size == 0 {
            return Err(PoolError::InvalidConfig("max_pool_size must be at least 1"));
        }
        let shared = Arc::new(Shared {
            uid: NEXT_POOL_UID.fetch_add(1, Ordering::Relaxed),
            source,
            state: Mutex::new(PoolState {
                leader: None,
                followers: Vec::new(),
                pool_size: 0,
                shutting_down: false,
                ids: IdAllocator::new(),
            }),
            all_exited: Condvar::new(),
            stats: PoolStats::default(),
            config: self,
        });

        let id = {
            let mut state = shared.lock();
            let id = shared.admit_thread(&mut state);
            shared.set_leader(&mut state, Some(id));
            id
        };
        if let Err(err) = Shared::spawn(&shared, id) {
            let mut state = shared.lock();
            shared.set_leader(&mut state, None);
            shared.retire_thread(&mut state, id);
            return Err(err.into());
        }
        Ok(LeaderFollowersPool { shared })
    }
}

struct FollowerSlot {
    id: usize,
    wakeup: Condvar,
}

struct PoolState {
    leader: Option<usize>,
    followers: Vec<Arc<FollowerSlot>>,
    pool_size: usize,
    shutting_down: bool,
    ids: IdAllocator,
}

struct Shared<S: WorkSource> {
    uid: u64,
    source: S,
    state: Mutex<PoolState>,
    all_exited: Condvar,
    stats: PoolStats,
    config: PoolBuilder,
}

enum Exit {
    Exhausted,
    Expired,
    Shutdown,
}

impl<S: WorkSource> Shared<S> {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit_thread(&self, state: &mut PoolState) -> usize {
        state.pool_size += 1;
        self.stats.pool_size.store(state.pool_size, Ordering::Release);
        raise(&self.stats.peak_pool_size, state.pool_size);
        state.ids.acquire()
    }

    fn retire_thread(&self, state: &mut PoolState, id: usize) {
        state.pool_size -= 1;
        self.stats.pool_size.store(state.pool_size, Ordering::Release);
        state.ids.release(id);
        self.all_exited.notify_all();
    }

    fn set_leader(&self, state: &mut PoolState, leader: Option<usize>) {
        match (state.leader.is_some(), leader.is_some()) {
            (false, true) => {
                let now = self.stats.leaders.fetch_add(1, Ordering::AcqRel) + 1;
                raise(&self.stats.peak_leaders, now);
            }
            (true, false) => {
                self.stats.leaders.fetch_sub(1, Ordering::AcqRel);
            }
            _ => {}
        }
        state.leader = leader;
    }

    fn spawn(shared: &Arc<Self>, id: usize) -> std::io::Result<()> {
        let core_id = match shared.config.core_ids.len() {
            0 => None,
            n => Some(shared.config.core_ids[id % n]),
        };
        let name = format!("{}-{}", shared.config.name, id);
        let pool = Arc::clone(shared);
        thread::Builder::new().name(name).spawn(move || {
            if let Some(core_id) = core_id {
                set_for_current(core_id);
            }
            Shared::thread_main(pool, id);
        })?;
        shared.stats.spawned.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn thread_main(shared: Arc<Self>, id: usize) {
        CURRENT_POOL.with(|current| current.set(Some(shared.uid)));
        let mut guard = ExitGuard {
            shared: &shared,
            id,
            exit: Exit::Exhausted,
            processing: false,
        };
        debug!("{}-{} started", shared.config.name, id);

        loop {
            trace!("{}-{} leading", shared.config.name, id);
            let Some(work) = shared.source.next_work() else {
                guard.exit = if shared.lock().shutting_down {
                    Exit::Shutdown
                } else {
                    Exit::Exhausted
                };
                return;
            };

            shared.promote_successor(id);

            guard.processing = true;
            shared.stats.processing.fetch_add(1, Ordering::AcqRel);
            shared.source.run(work);
            shared.stats.processing.fetch_sub(1, Ordering::AcqRel);
            guard.processing = false;
            shared.stats.completed.fetch_add(1, Ordering::AcqRel);

            if let Err(exit) = shared.follow(id) {
                guard.exit = exit;
                return;
            }
        }
    }

    /// Hands leadership to exactly one other thread before the caller starts
    /// processing: an idle follower if any, else a new thread if below the
    /// maximum, else nobody (the next thread to finish takes over).
    fn promote_successor(self: &Arc<Self>, id: usize) {
        let mut state = self.lock();
        debug_assert_eq!(state.leader, Some(id));
        self.set_leader(&mut state, None);
        if state.shutting_down {
            return;
        }

        if let Some(follower) = state.followers.pop() {
            self.stats.followers.fetch_sub(1, Ordering::AcqRel);
            self.set_leader(&mut state, Some(follower.id));
            follower.wakeup.notify_one();
            trace!("{}-{} promoted follower {}", self.config.name, id, follower.id);
        } else if state.pool_size < self.config.max_pool_size {
            let new_id = self.admit_thread(&mut state);
            self.set_leader(&mut state, Some(new_id));
            drop(state);
            if let Err(err) = Shared::spawn(self, new_id) {
                warn!("{} could not grow: {}", self.config.name, err);
                let mut state = self.lock();
                if state.leader == Some(new_id) {
                    self.set_leader(&mut state, None);
                }
                self.retire_thread(&mut state, new_id);
            }
        } else {
            self.stats.exhausted.fetch_add(1, Ordering::AcqRel);
            trace!("{} exhausted, leadership vacant", self.config.name);
        }
    }

    /// After processing: take over a vacant leadership, or park on the
    /// follower stack until promoted. Re-validates everything under the one
    /// state lock.
    fn follow(&self, id: usize) -> Result<(), Exit> {
        let mut state = self.lock();
        if state.shutting_down {
            return Err(Exit::Shutdown);
        }
        if state.leader.is_none() {
            self.set_leader(&mut state, Some(id));
            return Ok(());
        }

        let slot = Arc::new(FollowerSlot {
            id,
            wakeup: Condvar::new(),
        });
        state.followers.push(Arc::clone(&slot));
        self.stats.followers.fetch_add(1, Ordering::AcqRel);
        trace!("{}-{} following", self.config.name, id);

        let deadline = self.config.keep_alive.map(|ka| Instant::now() + ka);
        loop {
            if state.leader == Some(id) {
                return Ok(());
            }
            if state.shutting_down {
                self.unpark(&mut state, &slot);
                return Err(Exit::Shutdown);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        // Expiry only counts if nobody promoted us meanwhile.
                        if self.unpark(&mut state, &slot) {
                            return Err(Exit::Expired);
                        }
                        state = slot
                            .wakeup
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                        continue;
                    }
                    state = slot
                        .wakeup
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
                None => {
                    state = slot
                        .wakeup
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    fn unpark(&self, state: &mut PoolState, slot: &Arc<FollowerSlot>) -> bool {
        match state.followers.iter().position(|f| Arc::ptr_eq(f, slot)) {
            Some(pos) => {
                state.followers.remove(pos);
                self.stats.followers.fetch_sub(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    fn shutdown(&self) {
        let mut state = self.lock();
        if !state.shutting_down {
            state.shutting_down = true;
            debug!(
                "{} shutting down {} thread(s)",
                self.config.name, state.pool_size
            );
            for follower in &state.followers {
                follower.wakeup.notify_one();
            }
        }

        let caller_is_member = CURRENT_POOL.with(|current| current.get()) == Some(self.uid);
        let survivors = usize::from(caller_is_member);
        while state.pool_size > survivors {
            drop(state);
            self.source.interrupt();
            state = self.lock();
            if state.pool_size <= survivors {
                break;
            }
            state = self
                .all_exited
                .wait_timeout(state, Duration::from_millis(10))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

struct ExitGuard<'a, S: WorkSource> {
    shared: &'a Arc<Shared<S>>,
    id: usize,
    exit: Exit,
    processing: bool,
}

impl<S: WorkSource> Drop for ExitGuard<'_, S> {
    fn drop(&mut self) {
        let shared = self.shared;
        let panicked = thread::panicking();
        let mut state = shared.lock();
        if self.processing {
            shared.stats.processing.fetch_sub(1, Ordering::AcqRel);
        }
        if panicked {
            error!("{}-{} panicked", shared.config.name, self.id);
        } else {
            let reason = match self.exit {
                Exit::Exhausted => "source exhausted",
                Exit::Expired => "keep-alive expired",
                Exit::Shutdown => "shutdown",
            };
            debug!("{}-{} exiting: {}", shared.config.name, self.id, reason);
        }

        let was_leader = state.leader == Some(self.id);
        if was_leader {
            shared.set_leader(&mut state, None);
        }
        shared.retire_thread(&mut state, self.id);

        if state.shutting_down || state.leader.is_some() || !(was_leader || panicked) {
            return;
        }
        // Leadership is vacant: hand it to an idle follower. Only a panic may
        // replace the thread; an exhausted source would just exit again.
        if let Some(follower) = state.followers.pop() {
            shared.stats.followers.fetch_sub(1, Ordering::AcqRel);
            shared.set_leader(&mut state, Some(follower.id));
            follower.wakeup.notify_one();
        } else if panicked && state.pool_size < shared.config.max_pool_size {
            let new_id = shared.admit_thread(&mut state);
            shared.set_leader(&mut state, Some(new_id));
            drop(state);
            if let Err(err) = Shared::spawn(shared, new_id) {
                error!("{} could not replace panicked leader: {}", shared.config.name, err);
                let mut state = shared.lock();
                if state.leader == Some(new_id) {
                    shared.set_leader(&mut state, None);
                }
                shared.retire_thread(&mut state, new_id);
            }
        }
    }
}

/// A self-balancing pool where exactly one thread at a time waits on a shared
/// [`WorkSource`].
///
/// On receiving a unit, the leader promotes a successor *before* processing,
/// so the source is never left unattended while a thread is available. The
/// pool grows lazily up to its maximum and shrinks as idle followers time out.
///
/// ```rust
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use sluice_pool::{PoolBuilder, TaskQueue};
///
/// let pool = PoolBuilder::new()
///     .name("docs")
///     .max_pool_size(4)
///     .build(TaskQueue::new(16))
///     .unwrap();
///
/// let done = Arc::new(AtomicUsize::new(0));
/// for _ in 0..8 {
///     let done = Arc::clone(&done);
///     pool.execute(move || {
///         done.fetch_add(1, Ordering::SeqCst);
///     })
///     .unwrap();
/// }
/// while done.load(Ordering::SeqCst) < 8 {
///     std::thread::yield_now();
/// }
/// pool.shutdown();
/// assert!(pool.stats().peak_pool_size() <= 4);
/// ```
pub struct LeaderFollowersPool<S: WorkSource> {
    shared: Arc<Shared<S>>,
}

impl<S: WorkSource> LeaderFollowersPool<S> {
    /// The work source threads wait on.
    pub fn source(&self) -> &S {
        &self.shared.source
    }

    /// Live counters.
    pub fn stats(&self) -> &PoolStats {
        &self.shared.stats
    }

    /// Configured upper bound on threads.
    pub fn max_pool_size(&self) -> usize {
        self.shared.config.max_pool_size
    }

    /// Returns `true` once [`shutdown`](LeaderFollowersPool::shutdown) has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.lock().shutting_down
    }

    /// Returns `true` if the calling thread belongs to this pool.
    pub fn is_member(&self) -> bool {
        CURRENT_POOL.with(|current| current.get()) == Some(self.shared.uid)
    }

    /// Stops the pool: wakes every follower and interrupts the source until
    /// every thread has exited. A pool thread calling this does not wait for
    /// itself. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

impl<S: WorkSource> Drop for LeaderFollowersPool<S> {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

impl<S: WorkSource> fmt::Debug for LeaderFollowersPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaderFollowersPool")
            .field("name", &self.shared.config.name)
            .field("stats", &self.shared.stats)
            .finish()
    }
}

/// A boxed closure run by a [`TaskQueue`] pool.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A [`WorkSource`] of closures backed by a [`WorkQueue`].
#[derive(Debug)]
pub struct TaskQueue {
    queue: WorkQueue<Task>,
}

impl TaskQueue {
    /// Creates a source holding at most `capacity` pending closures.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: WorkQueue::new(capacity),
        }
    }

    /// The underlying queue.
    pub fn queue(&self) -> &WorkQueue<Task> {
        &self.queue
    }
}

impl WorkSource for TaskQueue {
    type Work = Task;

    fn next_work(&self) -> Option<Task> {
        self.queue.pop()
    }

    fn run(&self, task: Task) {
        task();
    }

    fn interrupt(&self) {
        self.queue.close();
    }
}

impl LeaderFollowersPool<TaskQueue> {
    /// Queues `f`, blocking while the queue is full.
    pub fn execute<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.shared.source.queue.push(Box::new(f)) {
            Ok(()) => Ok(()),
            Err(QueueError::Closed(_) | QueueError::Full(_)) => Err(PoolError::ShutDown),
        }
    }
}
