//! Chanbridge Bus - Message Bus Connection
//!
//! This crate provides the capability interface the dispatcher uses to talk
//! to a durable publish/subscribe bus:
//! - Durable-subject subscribe/unsubscribe with per-message acknowledgment
//! - Publish (used by upstream producers)
//! - Connection-state transitions (connected, disconnected, reconnecting)
//! - Bus-level operational counters
//!
//! Implementations:
//! - [`InMemoryBus`]: in-process bus for tests and local development
//! - `NatsBus` (feature `nats`): NATS JetStream via `async-nats`

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod error;
pub mod memory;
pub mod message;
#[cfg(feature = "nats")]
pub mod nats;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::watch;
use uuid::Uuid;

pub use connection::{BusStats, ConnectionState};
pub use error::{Error, Result};
pub use memory::InMemoryBus;
pub use message::{BusMessage, Delivery};
#[cfg(feature = "nats")]
pub use nats::{NatsBus, NatsConfig};

/// Identifies one durable subscription issued by a bus connection.
///
/// Handles are only valid for the connection that issued them; after a
/// connection loss they must be discarded, not unsubscribed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    /// Connection-local handle id
    pub id: Uuid,
    /// Subject the subscription consumes
    pub subject: String,
    /// Durable consumer name
    pub durable_name: String,
}

impl SubscriptionHandle {
    /// Create a handle with a fresh id
    #[must_use]
    pub fn new(subject: impl Into<String>, durable_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            durable_name: durable_name.into(),
        }
    }
}

/// An open durable subscription: its handle and its message stream.
pub struct Subscription {
    /// Handle used to unsubscribe later
    pub handle: SubscriptionHandle,
    /// Messages in bus delivery order; ends when the subscription or the
    /// connection goes away
    pub messages: BoxStream<'static, Delivery>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Durable publish/subscribe bus capability.
///
/// Implementations must be safe for concurrent use: the reconciler, the
/// workers and producers all share one connection.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Open (or resume) the durable consumer `durable_name` on `subject`.
    async fn subscribe(&self, subject: &str, durable_name: &str) -> Result<Subscription>;

    /// Remove the durable consumer behind `handle`.
    ///
    /// Unknown handles are treated as already released.
    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()>;

    /// Publish a message on `subject`.
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: HashMap<String, String>,
    ) -> Result<()>;

    /// Watch connection-state transitions.
    fn connection_state(&self) -> watch::Receiver<ConnectionState>;

    /// Current operational counters.
    fn stats(&self) -> BusStats;

    /// Release the connection. Durable consumers are kept on the server.
    async fn close(&self);
}

impl fmt::Debug for dyn Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bus")
    }
}

/// Check that `subject` is a concrete (wildcard-free) bus subject.
pub fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty() {
        return Err(Error::InvalidSubject("subject is empty".to_string()));
    }
    for token in subject.split('.') {
        if token.is_empty() {
            return Err(Error::InvalidSubject(format!(
                "{}: empty token",
                subject
            )));
        }
        if token == "*" || token == ">" || token.chars().any(char::is_whitespace) {
            return Err(Error::InvalidSubject(format!(
                "{}: wildcard or whitespace in token '{}'",
                subject, token
            )));
        }
    }
    Ok(())
}
