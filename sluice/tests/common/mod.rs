#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};

use sluice::{
    BoxError, Filter, Handler, IdleStatus, IoSink, Message, NextFilter, Session, SharedError,
    WriteRequest,
};

/// Shared, ordered record of who saw what.
#[derive(Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == entry).count()
    }
}

/// Records inbound `Received`/`ExceptionCaught` and outbound writes, then forwards.
pub struct Tracing {
    pub name: &'static str,
    pub trace: Trace,
}

impl Tracing {
    pub fn new(name: &'static str, trace: &Trace) -> Arc<Self> {
        Arc::new(Self {
            name,
            trace: trace.clone(),
        })
    }
}

impl Filter for Tracing {
    fn on_pre_add(&self, _: &Arc<Session>, _: &str) -> Result<(), BoxError> {
        self.trace.push(format!("{}:pre_add", self.name));
        Ok(())
    }

    fn on_post_add(&self, _: &Arc<Session>, _: &str) -> Result<(), BoxError> {
        self.trace.push(format!("{}:post_add", self.name));
        Ok(())
    }

    fn on_pre_remove(&self, _: &Arc<Session>, _: &str) -> Result<(), BoxError> {
        self.trace.push(format!("{}:pre_remove", self.name));
        Ok(())
    }

    fn on_post_remove(&self, _: &Arc<Session>, _: &str) -> Result<(), BoxError> {
        self.trace.push(format!("{}:post_remove", self.name));
        Ok(())
    }

    fn message_received(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        message: Message,
    ) -> Result<(), BoxError> {
        self.trace.push(self.name);
        next.fire_message_received(session, message);
        Ok(())
    }

    fn exception_caught(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        cause: SharedError,
    ) -> Result<(), BoxError> {
        self.trace.push(format!("{}:exception", self.name));
        next.fire_exception_caught(session, cause);
        Ok(())
    }

    fn filter_write(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        request: WriteRequest,
    ) -> Result<(), BoxError> {
        self.trace.push(self.name);
        next.fire_filter_write(session, request);
        Ok(())
    }
}

/// Handler that records every callback; optionally echoes or fails on `Received`.
pub struct RecordingHandler {
    pub trace: Trace,
    pub echo: bool,
    pub fail_received: bool,
}

impl RecordingHandler {
    pub fn new(trace: &Trace) -> Arc<Self> {
        Arc::new(Self {
            trace: trace.clone(),
            echo: false,
            fail_received: false,
        })
    }

    pub fn echoing(trace: &Trace) -> Arc<Self> {
        Arc::new(Self {
            trace: trace.clone(),
            echo: true,
            fail_received: false,
        })
    }

    pub fn failing(trace: &Trace) -> Arc<Self> {
        Arc::new(Self {
            trace: trace.clone(),
            echo: false,
            fail_received: true,
        })
    }
}

impl Handler for RecordingHandler {
    fn session_created(&self, _: &Arc<Session>) -> Result<(), BoxError> {
        self.trace.push("handler:created");
        Ok(())
    }

    fn session_opened(&self, _: &Arc<Session>) -> Result<(), BoxError> {
        self.trace.push("handler:opened");
        Ok(())
    }

    fn session_closed(&self, _: &Arc<Session>) -> Result<(), BoxError> {
        self.trace.push("handler:closed");
        Ok(())
    }

    fn session_idle(&self, _: &Arc<Session>, status: IdleStatus) -> Result<(), BoxError> {
        self.trace.push(format!("handler:idle:{status:?}"));
        Ok(())
    }

    fn message_received(&self, session: &Arc<Session>, message: Message) -> Result<(), BoxError> {
        let text = message
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        self.trace.push(format!("handler:received:{text}"));
        if self.fail_received {
            return Err(format!("cannot handle {text}").into());
        }
        if self.echo {
            session.write(message)?;
        }
        Ok(())
    }

    fn message_sent(&self, _: &Arc<Session>, _: Message) -> Result<(), BoxError> {
        self.trace.push("handler:sent");
        Ok(())
    }

    fn exception_caught(&self, _: &Arc<Session>, cause: SharedError) -> Result<(), BoxError> {
        self.trace.push("handler:exception");
        self.trace.push(format!("cause:{cause}"));
        Ok(())
    }
}

/// Sink that records writes and closes; optionally fails every write.
#[derive(Default)]
pub struct RecordingSink {
    pub trace: Trace,
    pub fail: bool,
    pub closed: Mutex<usize>,
}

impl RecordingSink {
    pub fn new(trace: &Trace) -> Arc<Self> {
        Arc::new(Self {
            trace: trace.clone(),
            ..Default::default()
        })
    }

    pub fn failing(trace: &Trace) -> Arc<Self> {
        Arc::new(Self {
            trace: trace.clone(),
            fail: true,
            ..Default::default()
        })
    }
}

impl IoSink for RecordingSink {
    fn write(&self, _: &Arc<Session>, request: WriteRequest) -> io::Result<()> {
        if self.fail {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"));
        }
        let text = request
            .message()
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        self.trace.push(format!("socket:{text}"));
        Ok(())
    }

    fn close(&self, _: &Arc<Session>) {
        *self.closed.lock().unwrap() += 1;
    }
}

/// Opens a session on a fresh recording handler/sink pair.
pub fn open_session(handler: Arc<dyn Handler>, sink: Arc<dyn IoSink>) -> Arc<Session> {
    let session = Session::new(handler, sink);
    session.fire_created().unwrap();
    session.fire_opened().unwrap();
    session
}

pub fn text(s: &str) -> Message {
    Message::new(s.to_owned())
}
