//! Connection state and operational counters shared by bus implementations.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Observable state of the bus connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Connected and usable
    Connected,
    /// Connection lost; every previously issued handle is invalid
    Disconnected,
    /// Client is trying to re-establish the connection
    Reconnecting,
    /// Connection released for good
    Closed,
}

impl ConnectionState {
    /// Get the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        }
    }

    /// Whether operations can be issued
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of bus-level counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Current connection state
    pub state: ConnectionState,
    /// Number of transitions back into `Connected`
    pub reconnects: u64,
    /// Subscriptions currently open on this connection
    pub active_subscriptions: u64,
    /// Total subscribe calls
    pub subscribe_calls: u64,
    /// Total unsubscribe calls
    pub unsubscribe_calls: u64,
    /// Messages published through this connection
    pub published: u64,
    /// Messages handed to consumers
    pub delivered: u64,
    /// Messages acknowledged by consumers
    pub acked: u64,
}

/// Monotonic counters backing [`BusStats`].
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub reconnects: AtomicU64,
    pub subscribe_calls: AtomicU64,
    pub unsubscribe_calls: AtomicU64,
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub acked: AtomicU64,
}

impl StatsCounters {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, state: ConnectionState, active_subscriptions: u64) -> BusStats {
        BusStats {
            state,
            reconnects: self.reconnects.load(Ordering::Relaxed),
            active_subscriptions,
            subscribe_calls: self.subscribe_calls.load(Ordering::Relaxed),
            unsubscribe_calls: self.unsubscribe_calls.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
        }
    }
}
