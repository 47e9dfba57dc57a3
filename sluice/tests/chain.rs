mod common;

use std::sync::Arc;

use common::{RecordingHandler, RecordingSink, Trace, Tracing, open_session, text};
use rstest::rstest;
use sluice::{
    BoxError, Error, Filter, FilterCategory, LoggingFilter, Message, NextFilter, Position,
    Session, SharedError,
};

struct Faulty {
    panic: bool,
    fail_exceptions: bool,
}

impl Filter for Faulty {
    fn message_received(
        &self,
        _: &NextFilter,
        _: &Arc<Session>,
        _: Message,
    ) -> Result<(), BoxError> {
        if self.panic {
            panic!("boom");
        }
        Err("boom".into())
    }

    fn exception_caught(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        cause: SharedError,
    ) -> Result<(), BoxError> {
        if self.fail_exceptions {
            return Err("again".into());
        }
        next.fire_exception_caught(session, cause);
        Ok(())
    }
}

struct Swallow;

impl Filter for Swallow {
    fn message_received(&self, _: &NextFilter, _: &Arc<Session>, _: Message) -> Result<(), BoxError> {
        Ok(())
    }
}

struct Refuse {
    at_pre: bool,
}

impl Filter for Refuse {
    fn on_pre_add(&self, _: &Arc<Session>, _: &str) -> Result<(), BoxError> {
        if self.at_pre { Err("not here".into()) } else { Ok(()) }
    }

    fn on_post_add(&self, _: &Arc<Session>, _: &str) -> Result<(), BoxError> {
        if self.at_pre { Ok(()) } else { Err("changed my mind".into()) }
    }
}

struct OneShot {
    trace: Trace,
}

impl Filter for OneShot {
    fn message_received(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        message: Message,
    ) -> Result<(), BoxError> {
        self.trace.push("oneshot");
        session.chain().remove(next.name())?;
        next.fire_message_received(session, message);
        Ok(())
    }
}

fn setup(trace: &Trace) -> Arc<Session> {
    open_session(RecordingHandler::echoing(trace), RecordingSink::new(trace))
}

#[test]
fn three_filters_added_last_run_in_order_and_reverse() {
    let trace = Trace::default();
    let session = setup(&trace);
    for name in ["A", "B", "C"] {
        session
            .chain()
            .add_last(name, Tracing::new(name, &trace))
            .unwrap();
    }
    trace.take();

    session.fire_received(text("x")).unwrap();

    assert_eq!(
        trace.take(),
        vec!["A", "B", "C", "handler:received:x", "C", "B", "A", "socket:x"]
    );
}

#[rstest]
#[case(vec![(Position::Last, "A"), (Position::Last, "B"), (Position::Last, "C")], vec!["A", "B", "C"])]
#[case(vec![(Position::First, "A"), (Position::First, "B"), (Position::First, "C")], vec!["C", "B", "A"])]
#[case(vec![(Position::Last, "A"), (Position::Last, "C"), (Position::Before("C".into()), "B")], vec!["A", "B", "C"])]
#[case(vec![(Position::Last, "B"), (Position::Before("B".into()), "A"), (Position::After("B".into()), "C")], vec!["A", "B", "C"])]
#[case(vec![(Position::Last, "A"), (Position::After("A".into()), "C"), (Position::After("A".into()), "B")], vec!["A", "B", "C"])]
#[case(vec![(Position::Last, "D"), (Position::First, "A"), (Position::Before("D".into()), "C"), (Position::After("A".into()), "B")], vec!["A", "B", "C", "D"])]
fn insertion_sequences(
    #[case] ops: Vec<(Position, &'static str)>,
    #[case] expected: Vec<&'static str>,
) {
    let trace = Trace::default();
    let session = setup(&trace);
    for (position, name) in ops {
        session
            .chain()
            .register(position, name, Tracing::new(name, &trace))
            .unwrap();
    }
    assert_eq!(session.chain().names(), expected);
    trace.take();

    session.write(text("y")).unwrap();

    let mut outbound: Vec<String> = expected.iter().rev().map(|s| s.to_string()).collect();
    outbound.push("socket:y".to_owned());
    assert_eq!(trace.take(), outbound);
}

#[test]
fn duplicate_name_leaves_chain_unchanged() {
    let trace = Trace::default();
    let session = setup(&trace);
    let chain = session.chain();
    chain.add_last("A", Tracing::new("A", &trace)).unwrap();
    chain.add_last("B", Tracing::new("B", &trace)).unwrap();
    trace.take();

    let err = chain.add_first("A", Tracing::new("A2", &trace)).unwrap_err();

    assert!(matches!(err, Error::DuplicateName(ref n) if n == "A"));
    assert_eq!(chain.names(), vec!["A", "B"]);
    assert!(trace.take().is_empty(), "no lifecycle callback may run");
}

#[test]
fn missing_names_are_reported() {
    let trace = Trace::default();
    let session = setup(&trace);
    let chain = session.chain();

    assert!(matches!(
        chain.add_before("nope", "A", Tracing::new("A", &trace)),
        Err(Error::UnknownAnchor(_))
    ));
    assert!(matches!(chain.remove("nope"), Err(Error::UnknownName(_))));
    assert!(matches!(
        chain.add_last(sluice::TAIL_NAME, Tracing::new("A", &trace)),
        Err(Error::ReservedName(_))
    ));
    assert!(chain.is_empty());
}

#[test]
fn lifecycle_callbacks_fire_once() {
    let trace = Trace::default();
    let session = setup(&trace);
    trace.take();

    session.chain().add_last("A", Tracing::new("A", &trace)).unwrap();
    let removed = session.chain().remove("A").unwrap();

    assert_eq!(
        trace.take(),
        vec!["A:pre_add", "A:post_add", "A:pre_remove", "A:post_remove"]
    );
    assert_eq!(removed.category(), FilterCategory::Generic);
    assert!(!session.chain().contains("A"));
}

#[rstest]
#[case::pre_add(true, "on_pre_add")]
#[case::post_add(false, "on_post_add")]
fn refused_registration_is_rolled_back(#[case] at_pre: bool, #[case] expected_stage: &str) {
    let trace = Trace::default();
    let session = setup(&trace);

    let err = session
        .chain()
        .add_last("R", Arc::new(Refuse { at_pre }))
        .unwrap_err();

    match err {
        Error::Lifecycle { name, stage, .. } => {
            assert_eq!(name, "R");
            assert_eq!(stage, expected_stage);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(session.chain().is_empty());
    assert!(session.chain().names().is_empty());
}

#[test]
fn filter_can_swallow_events() {
    let trace = Trace::default();
    let session = setup(&trace);
    session.chain().add_last("A", Tracing::new("A", &trace)).unwrap();
    session.chain().add_last("swallow", Arc::new(Swallow)).unwrap();
    trace.take();

    session.fire_received(text("x")).unwrap();

    assert_eq!(trace.take(), vec!["A"]);
}

#[rstest]
#[case::error(false, "B failed on Received: boom")]
#[case::panic(true, "B panicked on Received: boom")]
fn filter_fault_is_delivered_downstream_once(#[case] panic: bool, #[case] cause: &str) {
    let trace = Trace::default();
    let session = setup(&trace);
    let chain = session.chain();
    chain.add_last("A", Tracing::new("A", &trace)).unwrap();
    chain
        .add_last(
            "B",
            Arc::new(Faulty {
                panic,
                fail_exceptions: false,
            }),
        )
        .unwrap();
    chain.add_last("C", Tracing::new("C", &trace)).unwrap();
    trace.take();

    session.fire_received(text("x")).unwrap();

    assert_eq!(
        trace.take(),
        vec![
            "A".to_owned(),
            "C:exception".to_owned(),
            "handler:exception".to_owned(),
            format!("cause:{cause}"),
        ]
    );
}

#[test]
fn fault_while_handling_exception_is_not_redelivered() {
    let trace = Trace::default();
    let session = setup(&trace);
    let chain = session.chain();
    chain.add_last("A", Tracing::new("A", &trace)).unwrap();
    chain
        .add_last(
            "B",
            Arc::new(Faulty {
                panic: false,
                fail_exceptions: true,
            }),
        )
        .unwrap();
    chain.add_last("C", Tracing::new("C", &trace)).unwrap();
    trace.take();

    session.fire_received(text("x")).unwrap();

    // B's Received fault goes downstream; A never sees it.
    assert_eq!(trace.count("C:exception"), 1);
    assert_eq!(trace.count("handler:exception"), 1);
    trace.take();

    session
        .fire_exception(Arc::new(std::io::Error::other("transport")))
        .unwrap();

    assert_eq!(trace.take(), vec!["A:exception"]);
}

#[test]
fn handler_fault_reaches_exception_caught_exactly_once() {
    let trace = Trace::default();
    let session = open_session(RecordingHandler::failing(&trace), RecordingSink::new(&trace));
    trace.take();

    session.fire_received(text("x")).unwrap();
    session.fire_received(text("y")).unwrap();

    assert_eq!(
        trace.take(),
        vec![
            "handler:received:x",
            "handler:exception",
            "cause:handler failed on Received: cannot handle x",
            "handler:received:y",
            "handler:exception",
            "cause:handler failed on Received: cannot handle y",
        ]
    );
}

#[test]
fn handler_fault_walks_the_chain_from_the_head() {
    let trace = Trace::default();
    let session = open_session(RecordingHandler::failing(&trace), RecordingSink::new(&trace));
    let chain = session.chain();
    chain.add_last("monitor", Tracing::new("monitor", &trace)).unwrap();
    chain.add_last("audit", Tracing::new("audit", &trace)).unwrap();
    trace.take();

    session.fire_received(text("x")).unwrap();

    assert_eq!(
        trace.take(),
        vec![
            "monitor",
            "audit",
            "handler:received:x",
            "monitor:exception",
            "audit:exception",
            "handler:exception",
            "cause:handler failed on Received: cannot handle x",
        ]
    );
}

#[test]
fn handler_fault_while_handling_exception_is_only_logged() {
    struct AlwaysFails(Trace);

    impl sluice::Handler for AlwaysFails {
        fn message_received(&self, _: &Arc<Session>, _: Message) -> Result<(), BoxError> {
            self.0.push("handler:received");
            Err("received".into())
        }

        fn exception_caught(&self, _: &Arc<Session>, _: SharedError) -> Result<(), BoxError> {
            self.0.push("handler:exception");
            Err("exception".into())
        }
    }

    let trace = Trace::default();
    let session = open_session(Arc::new(AlwaysFails(trace.clone())), RecordingSink::new(&trace));
    session.chain().add_last("monitor", Tracing::new("monitor", &trace)).unwrap();
    trace.take();

    session.fire_received(text("x")).unwrap();

    assert_eq!(
        trace.take(),
        vec!["monitor", "handler:received", "monitor:exception", "handler:exception"]
    );
}

#[test]
fn sink_failure_becomes_exception() {
    let trace = Trace::default();
    let session = open_session(RecordingHandler::echoing(&trace), RecordingSink::failing(&trace));
    session.chain().add_last("A", Tracing::new("A", &trace)).unwrap();
    trace.take();

    session.fire_received(text("x")).unwrap();

    assert_eq!(
        trace.take(),
        vec![
            "A".to_owned(),
            "handler:received:x".to_owned(),
            "A".to_owned(),
            "A:exception".to_owned(),
            "handler:exception".to_owned(),
            format!("cause:{} failed on Write: peer went away", sluice::HEAD_NAME),
        ]
    );
}

#[test]
fn filter_removing_itself_mid_event_still_forwards() {
    let trace = Trace::default();
    let session = setup(&trace);
    session
        .chain()
        .add_last("oneshot", Arc::new(OneShot { trace: trace.clone() }))
        .unwrap();
    trace.take();

    session.fire_received(text("1")).unwrap();
    session.fire_received(text("2")).unwrap();

    assert_eq!(
        trace.take(),
        vec![
            "oneshot",
            "handler:received:1",
            "socket:1",
            "handler:received:2",
            "socket:2"
        ]
    );
    assert!(session.chain().is_empty());
}

#[test]
fn replace_keeps_position_and_clear_empties() {
    let trace = Trace::default();
    let session = setup(&trace);
    let chain = session.chain();
    chain.add_last("A", Tracing::new("A", &trace)).unwrap();
    chain.add_last("B", Tracing::new("B", &trace)).unwrap();
    chain.add_last("C", Tracing::new("C", &trace)).unwrap();
    chain.add_first("log", Arc::new(LoggingFilter::new())).unwrap();
    trace.take();

    chain.replace("B", Tracing::new("B2", &trace)).unwrap();
    assert_eq!(
        trace.take(),
        vec!["B:pre_remove", "B2:pre_add", "B2:post_add", "B:post_remove"]
    );

    session.fire_received(text("x")).unwrap();
    assert_eq!(
        trace.take(),
        vec!["A", "B2", "C", "handler:received:x", "C", "B2", "A", "socket:x"]
    );

    assert_eq!(chain.find_category(FilterCategory::Logging), vec!["log"]);
    assert_eq!(chain.names(), vec!["log", "A", "B", "C"]);

    chain.clear().unwrap();
    assert!(chain.is_empty());
    assert_eq!(chain.len(), 0);
}

#[test]
fn disposed_session_rejects_mutation_and_events() {
    let trace = Trace::default();
    let session = setup(&trace);
    session.chain().add_last("A", Tracing::new("A", &trace)).unwrap();
    session.fire_closed().unwrap();
    assert!(session.await_disposed(std::time::Duration::from_secs(1)));

    assert!(matches!(
        session.chain().add_last("B", Tracing::new("B", &trace)),
        Err(Error::SessionDisposed(id)) if id == session.id()
    ));
    assert!(matches!(
        session.chain().remove("A"),
        Err(Error::SessionDisposed(_))
    ));
    assert!(matches!(
        session.fire_received(text("late")),
        Err(Error::SessionClosing { .. })
    ));
}
