use std::any::{Any, type_name};
use std::fmt;
use std::sync::Arc;

/// A type-erased, cheaply cloneable payload travelling through a filter chain.
///
/// Codecs change the concrete type as a message moves between filters
/// (bytes in, frames out), so the chain itself cannot be generic over one
/// payload type. Each filter downcasts to what it expects and passes anything
/// else through untouched.
///
/// ```rust
/// use sluice::Message;
///
/// let msg = Message::new(String::from("hello"));
/// assert_eq!(msg.downcast_ref::<String>().map(String::as_str), Some("hello"));
/// assert!(msg.downcast_ref::<Vec<u8>>().is_none());
/// ```
#[derive(Clone)]
pub struct Message {
    payload: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Message {
    /// Wraps a value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            payload: Arc::new(value),
            type_name: type_name::<T>(),
        }
    }

    /// Returns `true` if the payload is a `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.payload.is::<T>()
    }

    /// Borrows the payload as a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Converts into a shared `T`, handing the message back if the type does not match.
    pub fn downcast<T: Any + Send + Sync>(self) -> Result<Arc<T>, Message> {
        let type_name = self.type_name;
        self.payload
            .downcast::<T>()
            .map_err(|payload| Message { payload, type_name })
    }

    /// Name of the payload's concrete type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.type_name)
            .finish()
    }
}

/// A message on its way out through the chain toward the I/O sink.
#[derive(Clone, Debug)]
pub struct WriteRequest {
    message: Message,
    original: Option<Message>,
}

impl WriteRequest {
    /// Creates a write request for `message`.
    pub fn new(message: Message) -> Self {
        Self {
            message,
            original: None,
        }
    }

    /// The message as it currently stands (possibly encoded by a filter).
    pub fn message(&self) -> &Message {
        &self.message
    }

    /// The message as the application wrote it, before any encoding.
    pub fn original_message(&self) -> &Message {
        self.original.as_ref().unwrap_or(&self.message)
    }

    /// Replaces the payload, keeping track of the application's original message.
    ///
    /// Encoders call this so that a later `Sent` event can still report what
    /// the application wrote.
    pub fn encoded(self, message: Message) -> Self {
        let original = self.original.unwrap_or(self.message);
        Self {
            message,
            original: Some(original),
        }
    }

    /// Consumes the request, returning the current payload.
    pub fn into_message(self) -> Message {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_returns_message_on_mismatch() {
        let msg = Message::new(42u32);
        let msg = msg.downcast::<String>().unwrap_err();
        assert_eq!(*msg.downcast::<u32>().unwrap(), 42);
    }

    #[test]
    fn encoded_request_keeps_original() {
        let req = WriteRequest::new(Message::new("hi".to_owned()));
        let req = req.encoded(Message::new(b"hi\r\n".to_vec()));
        let req = req.encoded(Message::new(vec![0u8]));
        assert!(req.message().is::<Vec<u8>>());
        assert_eq!(
            req.original_message().downcast_ref::<String>().map(String::as_str),
            Some("hi")
        );
    }
}
