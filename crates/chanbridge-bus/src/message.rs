//! Bus message and delivery types

use bytes::Bytes;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;

use crate::Result;

/// A message as read from (or written to) the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Subject the message was published on
    pub subject: String,
    /// Opaque payload, never interpreted by the bus
    pub payload: Bytes,
    /// Header/metadata map
    pub headers: HashMap<String, String>,
    /// Bus-assigned sequence marker
    pub sequence: u64,
    /// Whether the bus already tried to deliver this message before
    pub redelivered: bool,
}

impl BusMessage {
    /// Create a new message with no headers
    #[must_use]
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: HashMap::new(),
            sequence: 0,
            redelivered: false,
        }
    }

    /// Attach headers
    #[must_use]
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

type AckFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A message handed to a consumer together with its acknowledgment.
///
/// Dropping a delivery without calling [`Delivery::ack`] leaves the message
/// pending on the bus, which will redeliver it to the same durable consumer.
pub struct Delivery {
    /// The delivered message
    pub message: BusMessage,
    ack: AckFn,
}

impl Delivery {
    /// Wrap a message with the closure that acknowledges it
    pub fn new<F>(message: BusMessage, ack: F) -> Self
    where
        F: FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        Self {
            message,
            ack: Box::new(ack),
        }
    }

    /// Acknowledge consumption to the bus.
    pub async fn ack(self) -> Result<()> {
        (self.ack)().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
