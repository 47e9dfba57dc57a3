//! # Sluice Bootstrap - Blocking TCP Servers on Leader/Followers Threads
//!
//! The helpful bootstrap APIs which turn a listening socket, a chain initializer and a
//! [`Handler`](sluice::Handler) into a running server.
//!
//! ## How Connections Are Served
//!
//! ```text
//!   leader ── accept() ──▶ promote successor ──▶ serve connection ──▶ follow
//!                                                     │
//!              Created, Opened, Received*/Idle*, Closed
//!                                                     ▼
//!                                            session filter chain
//! ```
//!
//! One thread of a [`LeaderFollowersPool`](sluice_pool::LeaderFollowersPool) waits in
//! `accept`. When a peer connects, that thread hands the listener to a successor and
//! serves the connection with plain blocking reads until the peer goes away, so
//! `max_pool_size` bounds the number of connections served at once. Writes go
//! through a [`TcpSink`] and fire `Sent` after they hit the socket.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sluice::{BoxError, Handler, Message, Session};
//! use sluice_bootstrap::TcpServerBuilder;
//! use sluice_codec::LineCodecFilter;
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
//! let server = TcpServerBuilder::new()
//!     .max_pool_size(32)
//!     .chain(|session| session.chain().add_last("codec", Arc::new(LineCodecFilter::default())))
//!     .handler(Arc::new(Echo))
//!     .bind("127.0.0.1:8080")
//!     .unwrap();
//!
//! println!("listening on {}", server.local_addr());
//! server.stop();
//! ```

#![doc(
    html_logo_url = "https://raw.githubusercontent.com/webrtc-rs/sluice/master/doc/sluice-white.png"
)]
#![warn(rust_2018_idioms)]
#![allow(dead_code)]
#![warn(missing_docs)]

mod error;
mod tcp;

pub use error::BootstrapError;
pub use tcp::{ChainInitializer, TcpServer, TcpServerBuilder, TcpSink};
