use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use rstest::rstest;
use sluice::{
    BoxError, Event, Handler, IoSink, Message, Session, SessionId, SessionStatus, SharedError,
    WriteRequest,
};
use sluice_executor::{
    Discipline, DispatchExecutor, ExecutorBuilder, ExecutorFilter, SubmitError,
};

const TIMEOUT: Duration = Duration::from_secs(10);

struct NullSink;

impl IoSink for NullSink {
    fn write(&self, _: &Arc<Session>, _: WriteRequest) -> io::Result<()> {
        Ok(())
    }

    fn close(&self, _: &Arc<Session>) {}
}

/// Records, per session, the order callbacks arrived in.
#[derive(Default)]
struct SequenceHandler {
    seen: Mutex<HashMap<SessionId, Vec<String>>>,
    exceptions: AtomicUsize,
    fail_received: bool,
}

impl SequenceHandler {
    fn failing() -> Self {
        Self {
            fail_received: true,
            ..Self::default()
        }
    }

    fn record(&self, session: &Arc<Session>, entry: String) {
        self.seen
            .lock()
            .unwrap()
            .entry(session.id())
            .or_default()
            .push(entry);
    }

    fn sequence(&self, id: SessionId) -> Vec<String> {
        self.seen.lock().unwrap().get(&id).cloned().unwrap_or_default()
    }
}

impl Handler for SequenceHandler {
    fn session_created(&self, session: &Arc<Session>) -> Result<(), BoxError> {
        self.record(session, "created".into());
        Ok(())
    }

    fn session_opened(&self, session: &Arc<Session>) -> Result<(), BoxError> {
        self.record(session, "opened".into());
        Ok(())
    }

    fn session_closed(&self, session: &Arc<Session>) -> Result<(), BoxError> {
        self.record(session, "closed".into());
        Ok(())
    }

    fn message_received(&self, session: &Arc<Session>, message: Message) -> Result<(), BoxError> {
        let n = message.downcast_ref::<usize>().copied().unwrap_or(usize::MAX);
        self.record(session, format!("r{n}"));
        if self.fail_received {
            return Err(format!("cannot handle r{n}").into());
        }
        Ok(())
    }

    fn exception_caught(&self, session: &Arc<Session>, cause: SharedError) -> Result<(), BoxError> {
        self.exceptions.fetch_add(1, Ordering::SeqCst);
        self.record(session, format!("exception:{cause}"));
        Ok(())
    }
}

/// Blocks in `message_received` until released, after announcing it started.
struct GateHandler {
    started: Sender<()>,
    gate: Receiver<()>,
    delivered: AtomicUsize,
    received: Mutex<Vec<usize>>,
}

impl GateHandler {
    fn new() -> (Arc<Self>, Receiver<()>, Sender<()>) {
        let (started_tx, started_rx) = unbounded();
        let (release, gate) = unbounded();
        let handler = Arc::new(Self {
            started: started_tx,
            gate,
            delivered: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        });
        (handler, started_rx, release)
    }
}

impl Handler for GateHandler {
    fn message_received(&self, _: &Arc<Session>, message: Message) -> Result<(), BoxError> {
        if let Some(n) = message.downcast_ref::<usize>() {
            self.received.lock().unwrap().push(*n);
        }
        if self.delivered.fetch_add(1, Ordering::SeqCst) == 0 {
            let _ = self.started.send(());
            let _ = self.gate.recv();
        }
        Ok(())
    }
}

/// On its first message, waits for its peer handler to get there too, then
/// submits `1..=burst` to `target` from the worker thread.
struct RelayHandler {
    executor: Arc<DispatchExecutor>,
    barrier: Arc<Barrier>,
    target: Mutex<Option<Arc<Session>>>,
    burst: usize,
    received: Mutex<Vec<usize>>,
    relayed: Sender<()>,
}

impl RelayHandler {
    fn new(
        executor: &Arc<DispatchExecutor>,
        barrier: &Arc<Barrier>,
        burst: usize,
        relayed: &Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            executor: Arc::clone(executor),
            barrier: Arc::clone(barrier),
            target: Mutex::new(None),
            burst,
            received: Mutex::new(Vec::new()),
            relayed: relayed.clone(),
        })
    }

    fn received(&self) -> Vec<usize> {
        self.received.lock().unwrap().clone()
    }
}

impl Handler for RelayHandler {
    fn message_received(&self, _: &Arc<Session>, message: Message) -> Result<(), BoxError> {
        let n = *message.downcast_ref::<usize>().ok_or("expected a number")?;
        self.received.lock().unwrap().push(n);
        if n == 0 {
            self.barrier.wait();
            let target = self.target.lock().unwrap().clone().ok_or("no target")?;
            for k in 1..=self.burst {
                self.executor
                    .submit(Event::Received(target.clone(), Message::new(k)))
                    .map_err(|err| err.to_string())?;
            }
            let _ = self.relayed.send(());
        }
        Ok(())
    }
}

fn executor(discipline: Discipline, workers: usize) -> Arc<DispatchExecutor> {
    executor_with_capacity(discipline, workers, 64)
}

fn executor_with_capacity(
    discipline: Discipline,
    workers: usize,
    capacity: usize,
) -> Arc<DispatchExecutor> {
    Arc::new(
        ExecutorBuilder::new()
            .name("test-dispatch")
            .worker_count(workers)
            .queue_capacity(capacity)
            .discipline(discipline)
            .build()
            .unwrap(),
    )
}

fn offloading_session(handler: Arc<dyn Handler>, executor: &Arc<DispatchExecutor>) -> Arc<Session> {
    let session = Session::new(handler, Arc::new(NullSink));
    session
        .chain()
        .add_last("executor", Arc::new(ExecutorFilter::new(Arc::clone(executor))))
        .unwrap();
    session
}

fn run_session(session: &Arc<Session>, messages: usize) {
    session.fire_created().unwrap();
    session.fire_opened().unwrap();
    for n in 0..messages {
        session.fire_received(Message::new(n)).unwrap();
    }
    session.fire_closed().unwrap();
}

#[rstest]
#[case(8, 128)]
#[case(16, 256)]
fn ordered_dispatch_keeps_per_session_order(#[case] workers: usize, #[case] sessions: usize) {
    const PRODUCERS: usize = 4;
    const MESSAGES: usize = 40;

    let executor = executor(Discipline::Ordered, workers);
    let handler = Arc::new(SequenceHandler::default());
    let all: Vec<Arc<Session>> = (0..sessions)
        .map(|_| offloading_session(handler.clone(), &executor))
        .collect();

    let start = Arc::new(Barrier::new(PRODUCERS));
    let producers: Vec<_> = all
        .chunks(sessions / PRODUCERS)
        .map(|chunk| {
            let chunk = chunk.to_vec();
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                for session in &chunk {
                    session.fire_created().unwrap();
                    session.fire_opened().unwrap();
                }
                for n in 0..MESSAGES {
                    for session in &chunk {
                        session.fire_received(Message::new(n)).unwrap();
                    }
                }
                for session in &chunk {
                    session.fire_closed().unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let mut expected = vec!["created".to_string(), "opened".to_string()];
    expected.extend((0..MESSAGES).map(|n| format!("r{n}")));
    expected.push("closed".to_string());

    for session in &all {
        assert!(session.await_disposed(TIMEOUT), "{:?} not disposed", session);
        assert_eq!(handler.sequence(session.id()), expected);
    }
    executor.shutdown();
}

#[rstest]
#[case(Discipline::Ordered)]
#[case(Discipline::Unordered)]
fn every_event_is_delivered_once(#[case] discipline: Discipline) {
    let executor = executor(discipline, 4);
    let handler = Arc::new(SequenceHandler::default());
    let sessions: Vec<Arc<Session>> = (0..32)
        .map(|_| offloading_session(handler.clone(), &executor))
        .collect();

    for session in &sessions {
        run_session(session, 10);
    }
    for session in &sessions {
        assert!(session.await_disposed(TIMEOUT));
        let mut seen = handler.sequence(session.id());
        seen.sort();
        let mut expected: Vec<String> = (0..10).map(|n| format!("r{n}")).collect();
        expected.extend(["closed", "created", "opened"].map(String::from));
        expected.sort();
        assert_eq!(seen, expected);
    }
}

#[rstest]
#[case(Discipline::Ordered)]
#[case(Discipline::Unordered)]
fn faulting_handler_still_reaches_disposed(#[case] discipline: Discipline) {
    let executor = executor(discipline, 4);
    let handler = Arc::new(SequenceHandler::failing());
    let session = offloading_session(handler.clone(), &executor);

    run_session(&session, 5);

    assert!(session.await_disposed(TIMEOUT));
    assert_eq!(session.status(), SessionStatus::Disposed);
    assert_eq!(handler.exceptions.load(Ordering::SeqCst), 5);
    let seen = handler.sequence(session.id());
    for n in 0..5 {
        let cause = format!("exception:handler failed on Received: cannot handle r{n}");
        assert_eq!(seen.iter().filter(|e| **e == cause).count(), 1, "{seen:?}");
    }
}

#[test]
fn disposal_waits_for_queued_events() {
    let executor = executor(Discipline::Ordered, 1);
    let (handler, started, release) = GateHandler::new();
    let session = offloading_session(handler.clone(), &executor);

    session.fire_created().unwrap();
    session.fire_opened().unwrap();
    session.fire_received(Message::new(0usize)).unwrap();
    session.fire_received(Message::new(1usize)).unwrap();
    started.recv_timeout(TIMEOUT).unwrap();
    session.fire_closed().unwrap();

    assert_eq!(session.status(), SessionStatus::Disposing);
    assert!(session.in_flight_count() >= 2);
    assert!(!session.await_disposed(Duration::from_millis(20)));

    drop(release);
    assert!(session.await_disposed(TIMEOUT));
    assert_eq!(handler.delivered.load(Ordering::SeqCst), 2);
}

#[rstest]
#[case(Discipline::Ordered)]
#[case(Discipline::Unordered)]
fn shutdown_delivers_everything_queued(#[case] discipline: Discipline) {
    let executor = executor(discipline, 1);
    let (handler, started, release) = GateHandler::new();
    let session = Session::new(handler.clone(), Arc::new(NullSink));

    executor
        .submit(Event::Received(session.clone(), Message::new(0usize)))
        .unwrap();
    started.recv_timeout(TIMEOUT).unwrap();
    for n in 1..=10usize {
        executor
            .submit(Event::Received(session.clone(), Message::new(n)))
            .unwrap();
    }

    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        drop(release);
    });
    executor.shutdown();
    releaser.join().unwrap();

    assert_eq!(handler.delivered.load(Ordering::SeqCst), 11);
    assert_eq!(executor.pending(), 0);
    assert_eq!(session.in_flight_count(), 0);
}

#[test]
fn shutdown_now_returns_undelivered_events() {
    let executor = executor(Discipline::Ordered, 1);
    let (handler, started, release) = GateHandler::new();
    let session = Session::new(handler.clone(), Arc::new(NullSink));

    executor
        .submit(Event::Received(session.clone(), Message::new(0usize)))
        .unwrap();
    started.recv_timeout(TIMEOUT).unwrap();
    for n in 1..=5usize {
        executor
            .submit(Event::Received(session.clone(), Message::new(n)))
            .unwrap();
    }

    let releaser = {
        let executor = Arc::clone(&executor);
        thread::spawn(move || {
            while !executor.is_shut_down() {
                thread::yield_now();
            }
            drop(release);
        })
    };
    let undelivered = executor.shutdown_now();
    releaser.join().unwrap();

    assert_eq!(handler.delivered.load(Ordering::SeqCst), 1);
    let numbers: Vec<usize> = undelivered
        .iter()
        .map(|event| match event {
            Event::Received(_, message) => *message.downcast_ref::<usize>().unwrap(),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    assert_eq!(session.in_flight_count(), 0);
}

#[test]
fn submit_after_shutdown_hands_the_event_back() {
    let executor = executor(Discipline::Ordered, 2);
    let session = Session::new(Arc::new(SequenceHandler::default()), Arc::new(NullSink));
    executor.shutdown();

    let err = executor
        .submit(Event::Received(session.clone(), Message::new(7usize)))
        .unwrap_err();
    assert!(matches!(err, SubmitError::ShutDown(_)));
    let event = err.into_event();
    assert_eq!(event.session().id(), session.id());
    assert_eq!(session.in_flight_count(), 0);
}

#[test]
fn filter_delivers_inline_once_executor_is_shut_down() {
    let executor = executor(Discipline::Ordered, 2);
    let handler = Arc::new(SequenceHandler::default());
    let session = offloading_session(handler.clone(), &executor);
    executor.shutdown();

    session.fire_created().unwrap();
    session.fire_opened().unwrap();
    session.fire_received(Message::new(3usize)).unwrap();

    assert_eq!(handler.sequence(session.id()), vec!["created", "opened", "r3"]);
}

#[test]
fn ordered_worker_is_picked_by_session_id() {
    let executor = executor(Discipline::Ordered, 8);
    let session = Session::new(Arc::new(SequenceHandler::default()), Arc::new(NullSink));
    let event = Event::Created(session.clone());
    assert_eq!(
        executor.worker_index(&event),
        (session.id().as_u64() % 8) as usize
    );
}

#[test]
fn workers_submitting_to_each_other_never_block() {
    const BURST: usize = 3;

    let executor = executor_with_capacity(Discipline::Ordered, 2, 1);
    let barrier = Arc::new(Barrier::new(2));
    let (relayed_tx, relayed) = unbounded();

    let left = RelayHandler::new(&executor, &barrier, BURST, &relayed_tx);
    let right = RelayHandler::new(&executor, &barrier, BURST, &relayed_tx);
    let left_session = Session::new(left.clone(), Arc::new(NullSink));
    let right_session = loop {
        let session = Session::new(right.clone(), Arc::new(NullSink));
        if executor.worker_index(&Event::Created(session.clone()))
            != executor.worker_index(&Event::Created(left_session.clone()))
        {
            break session;
        }
    };
    *left.target.lock().unwrap() = Some(right_session.clone());
    *right.target.lock().unwrap() = Some(left_session.clone());

    executor
        .submit(Event::Received(left_session.clone(), Message::new(0usize)))
        .unwrap();
    executor
        .submit(Event::Received(right_session.clone(), Message::new(0usize)))
        .unwrap();
    relayed.recv_timeout(TIMEOUT).expect("left worker stuck");
    relayed.recv_timeout(TIMEOUT).expect("right worker stuck");

    executor.shutdown();
    assert_eq!(left.received(), vec![0, 1, 2, 3]);
    assert_eq!(right.received(), vec![0, 1, 2, 3]);
    assert_eq!(left_session.in_flight_count(), 0);
    assert_eq!(right_session.in_flight_count(), 0);

    left.target.lock().unwrap().take();
    right.target.lock().unwrap().take();
}

#[test]
fn worker_resubmitting_past_a_full_queue_keeps_order() {
    const BURST: usize = 6;

    let executor = executor_with_capacity(Discipline::Ordered, 1, 1);
    let barrier = Arc::new(Barrier::new(1));
    let (relayed_tx, relayed) = unbounded();
    let handler = RelayHandler::new(&executor, &barrier, BURST, &relayed_tx);
    let session = Session::new(handler.clone(), Arc::new(NullSink));
    *handler.target.lock().unwrap() = Some(session.clone());

    executor
        .submit(Event::Received(session.clone(), Message::new(0usize)))
        .unwrap();
    relayed.recv_timeout(TIMEOUT).expect("worker stuck");

    executor.shutdown();
    assert_eq!(handler.received(), (0..=BURST).collect::<Vec<_>>());
    assert_eq!(session.in_flight_count(), 0);
    handler.target.lock().unwrap().take();
}

#[rstest]
#[case(Discipline::Ordered)]
#[case(Discipline::Unordered)]
fn submits_racing_shutdown_are_delivered_or_refused(#[case] discipline: Discipline) {
    const SUBMITTERS: usize = 4;

    let executor = executor(discipline, 2);
    let handler = Arc::new(SequenceHandler::default());
    let sessions: Vec<Arc<Session>> = (0..SUBMITTERS)
        .map(|_| Session::new(handler.clone(), Arc::new(NullSink)))
        .collect();

    let start = Arc::new(Barrier::new(SUBMITTERS + 1));
    let submitters: Vec<_> = sessions
        .iter()
        .cloned()
        .map(|session| {
            let executor = Arc::clone(&executor);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let mut accepted = 0usize;
                loop {
                    let event = Event::Received(session.clone(), Message::new(accepted));
                    match executor.submit(event) {
                        Ok(()) => accepted += 1,
                        Err(SubmitError::ShutDown(_)) => return accepted,
                        Err(err) => panic!("unexpected {err}"),
                    }
                }
            })
        })
        .collect();

    start.wait();
    thread::sleep(Duration::from_millis(5));
    executor.shutdown();
    let accepted: Vec<usize> = submitters.into_iter().map(|s| s.join().unwrap()).collect();

    assert!(executor.is_terminated());
    assert_eq!(executor.pending(), 0);
    for (session, accepted) in sessions.iter().zip(accepted) {
        assert_eq!(handler.sequence(session.id()).len(), accepted);
        assert_eq!(session.in_flight_count(), 0);
    }
}

#[test]
fn filter_waits_for_the_drain_before_delivering_inline() {
    let executor = executor(Discipline::Ordered, 1);
    let (handler, started, release) = GateHandler::new();
    let session = offloading_session(handler.clone(), &executor);

    session.fire_created().unwrap();
    session.fire_opened().unwrap();
    for n in 0..4usize {
        session.fire_received(Message::new(n)).unwrap();
    }
    started.recv_timeout(TIMEOUT).unwrap();

    let shutdown = {
        let executor = Arc::clone(&executor);
        thread::spawn(move || executor.shutdown())
    };
    while !executor.is_shut_down() {
        thread::yield_now();
    }
    let releaser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        drop(release);
    });

    session.fire_received(Message::new(4usize)).unwrap();
    assert!(executor.is_terminated());
    shutdown.join().unwrap();
    releaser.join().unwrap();

    assert_eq!(*handler.received.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(session.in_flight_count(), 0);
}
