//! Error types for chanbridge-bus

use thiserror::Error;

/// Bus error type
#[derive(Debug, Error)]
pub enum Error {
    /// Could not establish or keep the connection
    #[error("connection error: {0}")]
    Connection(String),

    /// Durable subscription could not be created
    #[error("subscribe error on {subject}: {message}")]
    Subscribe {
        /// Subject that was being subscribed
        subject: String,
        /// Detailed message
        message: String,
    },

    /// Durable subscription could not be removed
    #[error("unsubscribe error for {durable_name}: {message}")]
    Unsubscribe {
        /// Durable consumer name
        durable_name: String,
        /// Detailed message
        message: String,
    },

    /// Message could not be published
    #[error("publish error: {0}")]
    Publish(String),

    /// Consumption could not be acknowledged
    #[error("ack error: {0}")]
    Ack(String),

    /// Subject is empty or contains forbidden tokens
    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    /// The connection is not usable right now
    #[error("bus is not connected")]
    NotConnected,

    /// The connection was closed for good
    #[error("bus connection closed")]
    Closed,
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
