use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{
    Receiver, RecvTimeoutError, Select, Sender, TrySendError, bounded, select,
};
use log::{debug, trace};

use crate::error::QueueError;

/// A blocking, capacity-bounded multi-producer multi-consumer queue.
///
/// `push` blocks while the queue is full; `pop` blocks while it is empty.
/// [`close`](WorkQueue::close) wakes every blocked producer (who get their item
/// back) and consumer. Consumers keep receiving what is already queued after
/// close, then see `None`.
///
/// ```rust
/// use sluice_pool::WorkQueue;
///
/// let queue = WorkQueue::new(2);
/// queue.push(1).unwrap();
/// queue.push(2).unwrap();
/// assert!(queue.try_push(3).is_err());
///
/// queue.close();
/// assert_eq!(queue.pop(), Some(1));
/// assert_eq!(queue.pop(), Some(2));
/// assert_eq!(queue.pop(), None);
/// ```
pub struct WorkQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    closed: AtomicBool,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    /// Creates a queue holding at most `capacity` items. A capacity of zero is
    /// raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        let (close_tx, close_rx) = bounded(0);
        Self {
            tx,
            rx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            closed: AtomicBool::new(false),
            capacity,
        }
    }

    /// Appends `item`, blocking while the queue is full.
    ///
    /// Fails with [`QueueError::Closed`] if the queue is or becomes closed
    /// before the item is accepted.
    pub fn push(&self, item: T) -> Result<(), QueueError<T>> {
        if self.is_closed() {
            return Err(QueueError::Closed(item));
        }
        let item = match self.tx.try_send(item) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(item)) => item,
            Err(TrySendError::Disconnected(item)) => return Err(QueueError::Closed(item)),
        };

        trace!("queue full ({}), blocking producer", self.capacity);
        let mut sel = Select::new();
        let send = sel.send(&self.tx);
        let close = sel.recv(&self.close_rx);
        let op = sel.select();
        match op.index() {
            i if i == send => op
                .send(&self.tx, item)
                .map_err(|err| QueueError::Closed(err.into_inner())),
            i => {
                debug_assert_eq!(i, close);
                let _ = op.recv(&self.close_rx);
                Err(QueueError::Closed(item))
            }
        }
    }

    /// Appends `item` without blocking.
    pub fn try_push(&self, item: T) -> Result<(), QueueError<T>> {
        if self.is_closed() {
            return Err(QueueError::Closed(item));
        }
        self.tx.try_send(item).map_err(|err| match err {
            TrySendError::Full(item) => QueueError::Full(item),
            TrySendError::Disconnected(item) => QueueError::Closed(item),
        })
    }

    /// Takes the oldest item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub fn pop(&self) -> Option<T> {
        select! {
            recv(self.rx) -> item => item.ok(),
            recv(self.close_rx) -> _ => self.rx.try_recv().ok(),
        }
    }

    /// Like [`pop`](WorkQueue::pop), but gives up after `timeout`.
    ///
    /// `Err(Disconnected)` means closed and empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        select! {
            recv(self.rx) -> item => item.map_err(|_| RecvTimeoutError::Disconnected),
            recv(self.close_rx) -> _ => self.rx.try_recv().map_err(|_| RecvTimeoutError::Disconnected),
            default(timeout) => Err(RecvTimeoutError::Timeout),
        }
    }

    /// Takes the oldest item if there is one.
    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Rejects further pushes and wakes every blocked producer and consumer.
    /// Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            debug!("queue closed with {} item(s) pending", self.len());
        }
    }

    /// Removes and returns everything currently queued.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    /// Returns `true` once [`close`](WorkQueue::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Maximum number of queued items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn full_queue_blocks_until_popped() {
        let queue = Arc::new(WorkQueue::new(1));
        queue.push(1).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(2))
        };

        assert_eq!(queue.pop(), Some(1));
        producer.join().unwrap().unwrap();
        assert_eq!(queue.pop(), Some(2));
    }

    #[test]
    fn close_wakes_blocked_producer_with_its_item() {
        let queue = Arc::new(WorkQueue::new(1));
        queue.push("kept").unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push("returned"))
        };
        // Whether the producer is already blocked or not, it gets its item back.
        thread::sleep(Duration::from_millis(20));
        queue.close();

        let err = producer.join().unwrap().unwrap_err();
        assert_eq!(err.into_inner(), "returned");
        assert_eq!(queue.drain(), vec!["kept"]);
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let queue: Arc<WorkQueue<u32>> = Arc::new(WorkQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn pop_timeout_distinguishes_timeout_from_close() {
        let queue: WorkQueue<u32> = WorkQueue::new(1);
        assert_eq!(
            queue.pop_timeout(Duration::from_millis(5)),
            Err(RecvTimeoutError::Timeout)
        );
        queue.push(7).unwrap();
        queue.close();
        assert_eq!(queue.pop_timeout(Duration::from_millis(5)), Ok(7));
        assert_eq!(
            queue.pop_timeout(Duration::from_millis(5)),
            Err(RecvTimeoutError::Disconnected)
        );
    }

    #[test]
    fn zero_capacity_is_raised() {
        let queue = WorkQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.try_push(()).unwrap();
        assert!(matches!(queue.try_push(()), Err(QueueError::Full(()))));
    }
}
