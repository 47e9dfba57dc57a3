//! # Sluice Pool - Leader/Followers Threads and Bounded Work Queues
//!
//! `sluice-pool` provides the two concurrency primitives under the sluice workspace:
//!
//! - [`WorkQueue`]: a blocking, capacity-bounded MPMC queue with a close signal
//! - [`LeaderFollowersPool`]: a self-balancing set of OS threads where exactly one thread
//!   (the leader) waits on a shared [`WorkSource`] at a time
//!
//! ## Features
//!
//! - **Leader rotation**: the leader promotes a successor *before* processing a unit
//! - **Lazy growth**: new threads are spawned only when no idle follower can be promoted,
//!   never beyond `max_pool_size`
//! - **Idle shrink**: followers exit after `keep_alive` without promotion
//! - **CPU Pinning**: pin pool threads to specific CPU cores
//! - **Thread Naming**: threads are named `{name}-{id}`, ids recycled per pool
//! - **Instrumentation**: [`PoolStats`] counters for size, leaders, followers and throughput
//!
//! ## Thread States
//!
//! ```text
//!              next_work()                 run(work)
//!   Leading ──────────────▶ (promote) ──▶ Processing
//!      ▲                                     │
//!      │     leadership vacant               │
//!      ├─────────────────────────────────────┤
//!      │                                     ▼
//!      └────────── promoted ─────────── Following ──── keep-alive expired ──▶ Dead
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sluice_pool::{PoolBuilder, TaskQueue};
//! use core_affinity::CoreId;
//! use std::time::Duration;
//!
//! let pool = PoolBuilder::new()
//!     .name("worker")
//!     .max_pool_size(8)
//!     .keep_alive(Some(Duration::from_secs(30)))
//!     .core_id(CoreId { id: 0 })
//!     .build(TaskQueue::new(1024))
//!     .unwrap();
//!
//! pool.execute(|| println!("Running on a pool thread!")).unwrap();
//! pool.shutdown();
//! ```
//!
//! ## Custom Work Sources
//!
//! Anything a single thread can block on makes a [`WorkSource`]: a queue, a listening
//! socket's `accept`, a selector. `interrupt` must make a blocked `next_work` return `None`.

#![doc(
    html_logo_url = "https://raw.githubusercontent.com/webrtc-rs/sluice/master/doc/sluice-white.png"
)]
#![warn(rust_2018_idioms)]
#![allow(dead_code)]
#![warn(missing_docs)]

mod error;
mod ids;
mod pool;
mod queue;

pub use error::{PoolError, QueueError};
pub use ids::IdAllocator;
pub use pool::{LeaderFollowersPool, PoolBuilder, PoolStats, Task, TaskQueue, WorkSource};
pub use queue::WorkQueue;

pub use crossbeam_channel::RecvTimeoutError;
