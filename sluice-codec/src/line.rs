use std::string::FromUtf8Error;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, trace, warn};
use sluice::{
    AttributeKey, BoxError, Filter, FilterCategory, Message, NextFilter, Session, WriteRequest,
};
use thiserror::Error;

static DECODE_BUFFER: AttributeKey<LineBuffer> = AttributeKey::new("sluice-codec", "line-buffer");

/// Errors raised by [`LineCodecFilter`]. They reach the rest of the chain as
/// `ExceptionCaught` events; decoding carries on with the next line.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A line exceeded the configured maximum length and was discarded.
    #[error("line of {length} bytes exceeds the maximum of {max}")]
    LineTooLong {
        /// Bytes seen before the line was dropped.
        length: usize,
        /// Configured maximum.
        max: usize,
    },
    /// A line was not valid UTF-8 and was discarded.
    #[error("line is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),
}

/// Which byte sequences end a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// `\n` only. A preceding `\r` stays part of the line.
    Newline,
    /// `\r\n` only.
    CarriageNewline,
    /// `\n` or `\r\n`.
    Both,
}

impl Terminator {
    /// Finds the first line end in `buf`: where the delimiter starts and how
    /// long it is.
    fn find(self, buf: &[u8]) -> Option<(usize, usize)> {
        let crlf = |i: usize| i > 0 && buf[i - 1] == b'\r';
        buf.iter()
            .enumerate()
            .filter(|(_, b)| **b == b'\n')
            .find_map(|(i, _)| match self {
                Terminator::Newline => Some((i, 1)),
                Terminator::CarriageNewline => crlf(i).then(|| (i - 1, 2)),
                Terminator::Both if crlf(i) => Some((i - 1, 2)),
                Terminator::Both => Some((i, 1)),
            })
    }

    fn encoded(self) -> &'static [u8] {
        match self {
            Terminator::Newline => b"\n",
            Terminator::CarriageNewline | Terminator::Both => b"\r\n",
        }
    }
}

#[derive(Debug, Default)]
struct LineBuffer {
    buf: BytesMut,
    discarding: bool,
}

/// Splits inbound byte streams into `String` lines and encodes outbound
/// `String`s back into terminated bytes.
///
/// Inbound messages holding [`Bytes`], [`BytesMut`] or `Vec<u8>` are
/// decoded; anything else passes through untouched. Outbound `String` and
/// `&'static str` messages are encoded to [`Bytes`] with the terminator
/// appended (`\r\n` unless the terminator is [`Terminator::Newline`]).
///
/// Each session gets its own decode buffer, allocated when the filter is added
/// and released when it is removed or the session closes.
#[derive(Debug, Clone)]
pub struct LineCodecFilter {
    max_length: usize,
    strip_delimiter: bool,
    terminator: Terminator,
}

impl Default for LineCodecFilter {
    fn default() -> Self {
        Self::new(8192, true, Terminator::Both)
    }
}

impl LineCodecFilter {
    /// Creates a codec accepting lines of at most `max_length` bytes, not
    /// counting the terminator.
    pub fn new(max_length: usize, strip_delimiter: bool, terminator: Terminator) -> Self {
        Self {
            max_length,
            strip_delimiter,
            terminator,
        }
    }

    fn decode(&self, state: &mut LineBuffer, data: &[u8]) -> Vec<Result<String, CodecError>> {
        state.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            let Some((end, delimiter)) = self.terminator.find(&state.buf) else {
                if state.buf.len() > self.max_length {
                    let length = state.buf.len();
                    state.buf.clear();
                    if !state.discarding {
                        state.discarding = true;
                        frames.push(Err(CodecError::LineTooLong {
                            length,
                            max: self.max_length,
                        }));
                    }
                }
                break;
            };

            if state.discarding {
                state.buf.advance(end + delimiter);
                state.discarding = false;
                continue;
            }
            let frame = state.buf.split_to(end + delimiter);
            if end > self.max_length {
                frames.push(Err(CodecError::LineTooLong {
                    length: end,
                    max: self.max_length,
                }));
                continue;
            }
            let line = if self.strip_delimiter {
                &frame[..end]
            } else {
                &frame[..]
            };
            frames.push(String::from_utf8(line.to_vec()).map_err(CodecError::from));
        }
        frames
    }

    fn release(&self, session: &Arc<Session>) {
        if let Some(state) = session.attributes().remove(&DECODE_BUFFER) {
            if !state.buf.is_empty() {
                debug!(
                    "session {} dropped {} bytes of an unterminated line",
                    session.id(),
                    state.buf.len()
                );
            }
        }
    }
}

fn as_bytes(message: &Message) -> Option<&[u8]> {
    if let Some(bytes) = message.downcast_ref::<Bytes>() {
        Some(&bytes[..])
    } else if let Some(bytes) = message.downcast_ref::<BytesMut>() {
        Some(&bytes[..])
    } else {
        message.downcast_ref::<Vec<u8>>().map(Vec::as_slice)
    }
}

fn as_str(message: &Message) -> Option<&str> {
    match message.downcast_ref::<String>() {
        Some(s) => Some(s.as_str()),
        None => message.downcast_ref::<&'static str>().copied(),
    }
}

impl Filter for LineCodecFilter {
    fn category(&self) -> FilterCategory {
        FilterCategory::Codec
    }

    fn on_post_add(&self, session: &Arc<Session>, _name: &str) -> Result<(), BoxError> {
        session
            .attributes()
            .insert(&DECODE_BUFFER, LineBuffer::default());
        Ok(())
    }

    fn on_pre_remove(&self, session: &Arc<Session>, _name: &str) -> Result<(), BoxError> {
        self.release(session);
        Ok(())
    }

    fn session_closed(&self, next: &NextFilter, session: &Arc<Session>) -> Result<(), BoxError> {
        self.release(session);
        next.fire_session_closed(session);
        Ok(())
    }

    fn message_received(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        message: Message,
    ) -> Result<(), BoxError> {
        let Some(data) = as_bytes(&message) else {
            next.fire_message_received(session, message);
            return Ok(());
        };
        trace!("session {} decoding {} bytes", session.id(), data.len());

        let attributes = session.attributes();
        let frames = attributes
            .with(&DECODE_BUFFER, |state| self.decode(state, data))
            .unwrap_or_else(|| {
                let mut state = LineBuffer::default();
                let frames = self.decode(&mut state, data);
                attributes.insert(&DECODE_BUFFER, state);
                frames
            });

        let mut first_error = None;
        for frame in frames {
            match frame {
                Ok(line) => next.fire_message_received(session, Message::new(line)),
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(err) => warn!("session {} {}", session.id(), err),
            }
        }
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    fn filter_write(
        &self,
        next: &NextFilter,
        session: &Arc<Session>,
        request: WriteRequest,
    ) -> Result<(), BoxError> {
        let Some(text) = as_str(request.message()) else {
            next.fire_filter_write(session, request);
            return Ok(());
        };
        let delimiter = self.terminator.encoded();
        let mut buf = BytesMut::with_capacity(text.len() + delimiter.len());
        buf.extend_from_slice(text.as_bytes());
        buf.extend_from_slice(delimiter);
        let request = request.encoded(Message::new(buf.freeze()));
        next.fire_filter_write(session, request);
        Ok(())
    }
}
