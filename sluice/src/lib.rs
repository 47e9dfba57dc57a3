//! # Sluice - Filter Chains for Thread-Based Network Services
//!
//! `sluice` is the core of a network-application substrate: every connection gets a
//! [`Session`] with its own [`FilterChain`], an ordered, dynamically mutable sequence of
//! interceptors that sees each inbound and outbound event before the application does.
//!
//! Inspired by [Apache MINA](https://mina.apache.org) and [Netty](https://netty.io),
//! `sluice` keeps protocol stages (codecs, handshakes, reliability layers) out of the
//! application and out of the socket loop.
//!
//! ## Core Concepts
//!
//! ### Session
//!
//! A [`Session`] is per-connection state: a process-unique [`SessionId`], a lifecycle
//! [`SessionStatus`], a typed [`AttributeMap`], the chain, one terminal [`Handler`] and one
//! [`IoSink`]. Sessions are always handled through `Arc<Session>`.
//!
//! ### Filter
//!
//! A [`Filter`] intercepts events. Inbound callbacks receive a [`NextFilter`] continuation;
//! calling it forwards the event, not calling it swallows it. Filters declare a
//! [`FilterCategory`] so others can find, for example, the codec in a chain.
//!
//! ### Event
//!
//! [`Event`] is a closed sum type: `Created`, `Opened`, `Closed`, `Idle`, `Received`, `Sent`
//! and `ExceptionCaught`, each carrying its session.
//!
//! ## Event Flow
//!
//! ```text
//!                                                       | Session::write()
//!   +---------------------------------------------------+---------------+
//!   |                          FilterChain              |               |
//!   |                                                  \|/              |
//!   |    +----------+----------+------------+-----------+----------+    |
//!   |    |                   tail  ──▶  Handler                    |    |
//!   |    +----------+----------+------------+-----------+----------+    |
//!   |              /|\                                  |               |
//!   |               |                                  \|/              |
//!   |    +----------+----------+------------+-----------+----------+    |
//!   |    |                       Filter  N                         |    |
//!   |    +----------+----------+------------+-----------+----------+    |
//!   |              /|\                                  |               |
//!   |               |                                   |               |
//!   |               |                   NextFilter::fire_filter_write() |
//!   |               |                                   |               |
//!   |   NextFilter::fire_message_received()             |               |
//!   |               |                                  \|/              |
//!   |    +----------+----------+------------+-----------+----------+    |
//!   |    |                       Filter  1                         |    |
//!   |    +----------+----------+------------+-----------+----------+    |
//!   |              /|\                                  |               |
//!   |               |                                  \|/              |
//!   |    +----------+----------+------------+-----------+----------+    |
//!   |    |                   head  ──▶  IoSink                     |    |
//!   |    +----------+----------+------------+-----------+----------+    |
//!   +---------------+-----------------------------------+---------------+
//!                   | Session::fire_received()          | IoSink::write()
//!                   |                                  \|/
//!   +---------------+-----------------------------------+---------------+
//!   |               |                                   |               |
//!   |            I/O Threads (sluice-bootstrap, or your own loop)       |
//!   +-------------------------------------------------------------------+
//! ```
//!
//! ## Example
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use sluice::{BoxError, Handler, IoSink, LoggingFilter, Message, Session, WriteRequest};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn message_received(&self, session: &Arc<Session>, message: Message) -> Result<(), BoxError> {
//!         session.write(message)?;
//!         Ok(())
//!     }
//! }
//!
//! #[derive(Default)]
//! struct Recorder(Mutex<Vec<String>>);
//!
//! impl IoSink for Recorder {
//!     fn write(&self, _: &Arc<Session>, request: WriteRequest) -> std::io::Result<()> {
//!         if let Some(s) = request.message().downcast_ref::<String>() {
//!             self.0.lock().unwrap().push(s.clone());
//!         }
//!         Ok(())
//!     }
//!     fn close(&self, _: &Arc<Session>) {}
//! }
//!
//! let sink = Arc::new(Recorder::default());
//! let session = Session::new(Arc::new(Echo), sink.clone());
//! session.chain().add_last("log", Arc::new(LoggingFilter::new())).unwrap();
//!
//! session.fire_created().unwrap();
//! session.fire_opened().unwrap();
//! session.fire_received(Message::new(String::from("ping"))).unwrap();
//! session.close();
//! session.fire_closed().unwrap();
//!
//! assert_eq!(*sink.0.lock().unwrap(), vec!["ping".to_owned()]);
//! assert!(session.await_disposed(std::time::Duration::from_secs(1)));
//! ```
//!
//! ## Threading
//!
//! Everything here is synchronous and `Send + Sync`. The chain runs on whichever thread
//! fires the event. To keep slow handlers off the I/O threads, add the `ExecutorFilter`
//! from `sluice-executor`; worker threads come from `sluice-pool`.

#![doc(
    html_logo_url = "https://raw.githubusercontent.com/webrtc-rs/sluice/master/doc/sluice-white.png"
)]
#![warn(rust_2018_idioms)]
#![allow(dead_code)]
#![warn(missing_docs)]

// ========================================
// Module Declarations
// ========================================

/// Typed, filter-scoped session attributes
pub(crate) mod attribute;

/// Filter chain and its sentinels
pub(crate) mod chain;

/// Error types
pub(crate) mod error;

/// Event model
pub(crate) mod event;

/// Filter trait and continuation
pub(crate) mod filter;

/// Terminal handler and I/O sink contracts
pub(crate) mod handler;

/// Per-event logging filter
pub(crate) mod logging;

/// Type-erased payloads
pub(crate) mod message;

/// Per-connection state
pub(crate) mod session;

// ========================================
// Public Exports
// ========================================

/// Session attribute store
pub use attribute::{AttributeKey, AttributeMap};

/// Chain registry and insertion positions
pub use chain::{FilterChain, HEAD_NAME, Position, TAIL_NAME};

/// Error types
pub use error::{BoxError, Error, Result, SharedError};

/// Events
pub use event::{Event, EventKind, IdleStatus};

/// Filters
pub use filter::{Filter, FilterCategory, NextFilter};

/// Terminal handler, I/O sink and direct handler delivery
pub use handler::{HANDLER_ORIGIN, Handler, IoSink, deliver};

/// Logging filter
pub use logging::LoggingFilter;

/// Messages
pub use message::{Message, WriteRequest};

/// Sessions
pub use session::{InFlight, Session, SessionBuilder, SessionId, SessionStatus};
