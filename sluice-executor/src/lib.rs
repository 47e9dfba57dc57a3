//! # Sluice Executor - Per-Session Ordered Event Dispatch
//!
//! `sluice-executor` moves event delivery off the I/O thread onto a set of worker
//! threads, so a slow handler never stalls the socket loop.
//!
//! ## Features
//!
//! - **Ordered dispatch**: every event of a session runs on the same worker
//!   (`session id % worker_count`), in submission order
//! - **Unordered dispatch**: any idle worker takes the next event, backed by a
//!   [`sluice_pool::LeaderFollowersPool`]
//! - **Backpressure**: a full worker queue blocks outside submitters; events are never
//!   dropped. The executor's own workers never block on it
//! - **Disposal tracking**: queued events hold an [`InFlight`](sluice::InFlight) guard,
//!   so a session is not `Disposed` until all its events are delivered
//! - **CPU Pinning**: pin worker threads to specific CPU cores
//! - **Thread Naming**: workers are named `{name}-{index}`
//!
//! ## Where It Sits
//!
//! ```text
//!  I/O thread                                  worker thread
//!  ──────────                                  ─────────────
//!  Head ─▶ Codec ─▶ ExecutorFilter ──queue──▶ (next filter) ─▶ ... ─▶ Tail ─▶ Handler
//! ```
//!
//! Filters before the [`ExecutorFilter`] run on the thread that fired the event,
//! filters after it on a worker.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sluice_executor::{Discipline, ExecutorBuilder, ExecutorFilter};
//! use core_affinity::CoreId;
//!
//! let executor = Arc::new(
//!     ExecutorBuilder::new()
//!         .name("dispatch")
//!         .worker_count(8)
//!         .discipline(Discipline::Ordered)
//!         .core_id(CoreId { id: 0 })
//!         .build()
//!         .unwrap(),
//! );
//!
//! // Per session: session.chain().add_last("executor", Arc::new(ExecutorFilter::new(executor.clone())))
//! let filter = ExecutorFilter::new(Arc::clone(&executor));
//! # drop(filter);
//!
//! executor.shutdown();
//! ```
//!
//! ## Shutting Down
//!
//! [`DispatchExecutor::shutdown`] stops accepting events and delivers every queued
//! one before returning. [`DispatchExecutor::shutdown_now`] stops after each worker's
//! current event and hands the rest back to the caller. Once shut down, an
//! [`ExecutorFilter`] waits for the drain to finish and then delivers inline.

#![doc(
    html_logo_url = "https://raw.githubusercontent.com/webrtc-rs/sluice/master/doc/sluice-white.png"
)]
#![warn(rust_2018_idioms)]
#![allow(dead_code)]
#![warn(missing_docs)]

mod error;
mod executor;
mod filter;

pub use error::{ExecutorError, SubmitError};
pub use executor::{Discipline, Dispatch, DispatchExecutor, ExecutorBuilder};
pub use filter::ExecutorFilter;
