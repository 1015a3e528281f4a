//! Error types for chanbridge-core

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Bus connection or subscription failure
    #[error("bus error: {0}")]
    Bus(#[from] chanbridge_bus::Error),

    /// A desired-state entry is malformed; the whole snapshot is rejected
    #[error("invalid desired state for channel {channel}: {message}")]
    InvalidDesiredState {
        /// Channel the entry belongs to
        channel: String,
        /// Detailed message
        message: String,
    },

    /// Channel identifier could not be parsed
    #[error("invalid channel id '{0}': expected namespace/name")]
    InvalidChannelId(String),

    /// Some (channel, subscription) pairs could not be converged
    #[error("reconciliation incomplete: {failed} operation(s) failed, first: {first}")]
    Reconcile {
        /// Number of failed operations
        failed: usize,
        /// First failure, for the log line
        first: String,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// HTTP client could not be built
    #[error("http client error: {0}")]
    HttpClient(String),

    /// Dispatcher lifecycle misuse
    #[error("dispatcher is {0}")]
    Lifecycle(&'static str),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
