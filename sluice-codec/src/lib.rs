//! # Sluice Codec - Reusable Codec Filters
//!
//! `sluice-codec` provides codec [`Filter`](sluice::Filter)s for the sluice ecosystem.
//!
//! ## Features
//!
//! - **Line Decoding**: splits byte streams on `\n`, `\r\n` or both into `String` messages
//! - **Line Encoding**: turns outbound `String`s into terminated [`bytes::Bytes`]
//! - **Per-Session State**: decode buffers live in the session's attribute store, so
//!   one filter instance can serve any number of sessions
//!
//! ## Building a Chain with Codecs
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sluice::{LoggingFilter, Session};
//! use sluice_codec::{LineCodecFilter, Terminator};
//!
//! # fn setup(session: &Arc<Session>) -> sluice::Result<()> {
//! let chain = session.chain();
//! chain.add_last("codec", Arc::new(LineCodecFilter::new(8192, true, Terminator::Both)))?;
//! chain.add_last("logging", Arc::new(LoggingFilter::new()))?;
//! # Ok(())
//! # }
//! ```
//!
//! Filters after the codec see `String` messages; the handler writes `String`s and
//! the codec encodes them on their way to the socket.

#![doc(
    html_logo_url = "https://raw.githubusercontent.com/webrtc-rs/sluice/master/doc/sluice-white.png"
)]
#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

/// Line-based frame decoding and string encoding
pub mod line;

pub use line::{CodecError, LineCodecFilter, Terminator};
