//! Dispatch counters
//!
//! Lightweight atomic counters shared by the workers and the reconciler,
//! exported in Prometheus text format together with the bus statistics.

use chanbridge_bus::BusStats;
use serde::Serialize;
use std::fmt::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// A thread-safe counter metric
#[derive(Debug, Default, Clone)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    /// Increment the counter by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A thread-safe gauge metric (can go up and down)
#[derive(Debug, Default, Clone)]
pub struct Gauge {
    value: Arc<AtomicI64>,
}

impl Gauge {
    /// Set the gauge value
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Get the current value
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters for the dispatch pipeline and reconciliation.
#[derive(Debug, Default, Clone)]
pub struct DispatchMetrics {
    /// Messages consumed from the bus
    pub messages_received: Counter,
    /// HTTP attempts against subscriber endpoints
    pub delivery_attempts: Counter,
    /// Messages accepted by their subscriber
    pub delivered: Counter,
    /// Messages forwarded to a dead-letter sink
    pub dead_lettered: Counter,
    /// Dead-letter forwards that failed
    pub dead_letter_failures: Counter,
    /// Messages dropped after failed delivery
    pub dropped: Counter,
    /// Deliveries abandoned because the worker stopped
    pub abandoned: Counter,
    /// Subscriber responses forwarded to a reply sink
    pub replies_forwarded: Counter,
    /// Reply forwards that failed
    pub reply_failures: Counter,
    /// Bus acknowledgments that failed
    pub ack_failures: Counter,
    /// Completed reconciliation passes
    pub reconciliations: Counter,
    /// Bus subscribe failures during reconciliation
    pub subscribe_failures: Counter,
    /// Bus unsubscribe failures during reconciliation
    pub unsubscribe_failures: Counter,
    /// Subscriptions currently live
    pub live_subscriptions: Gauge,
}

/// Serializable snapshot of [`DispatchMetrics`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Messages consumed from the bus
    pub messages_received: u64,
    /// Subscriber HTTP attempts
    pub delivery_attempts: u64,
    /// Delivered messages
    pub delivered: u64,
    /// Dead-lettered messages
    pub dead_lettered: u64,
    /// Dropped messages
    pub dropped: u64,
    /// Abandoned deliveries
    pub abandoned: u64,
    /// Forwarded replies
    pub replies_forwarded: u64,
    /// Live subscriptions
    pub live_subscriptions: i64,
}

impl DispatchMetrics {
    /// Create a fresh set of counters
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Current values
    #[must_use]
    pub fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            messages_received: self.messages_received.get(),
            delivery_attempts: self.delivery_attempts.get(),
            delivered: self.delivered.get(),
            dead_lettered: self.dead_lettered.get(),
            dropped: self.dropped.get(),
            abandoned: self.abandoned.get(),
            replies_forwarded: self.replies_forwarded.get(),
            live_subscriptions: self.live_subscriptions.get(),
        }
    }

    /// Export dispatch and bus counters in Prometheus format
    #[must_use]
    pub fn export_prometheus(&self, bus: &BusStats) -> String {
        let mut output = String::new();

        let counters = [
            ("chanbridge_messages_received_total", &self.messages_received),
            ("chanbridge_delivery_attempts_total", &self.delivery_attempts),
            ("chanbridge_delivered_total", &self.delivered),
            ("chanbridge_dead_lettered_total", &self.dead_lettered),
            ("chanbridge_dead_letter_failures_total", &self.dead_letter_failures),
            ("chanbridge_dropped_total", &self.dropped),
            ("chanbridge_abandoned_total", &self.abandoned),
            ("chanbridge_replies_forwarded_total", &self.replies_forwarded),
            ("chanbridge_reply_failures_total", &self.reply_failures),
            ("chanbridge_ack_failures_total", &self.ack_failures),
            ("chanbridge_reconciliations_total", &self.reconciliations),
            ("chanbridge_subscribe_failures_total", &self.subscribe_failures),
            ("chanbridge_unsubscribe_failures_total", &self.unsubscribe_failures),
        ];
        for (name, counter) in counters {
            let _ = write!(output, "# TYPE {} counter\n{} {}\n", name, name, counter.get());
        }
        let _ = write!(
            output,
            "# TYPE chanbridge_live_subscriptions gauge\nchanbridge_live_subscriptions {}\n",
            self.live_subscriptions.get()
        );

        let bus_counters = [
            ("chanbridge_bus_reconnects_total", bus.reconnects),
            ("chanbridge_bus_subscribe_calls_total", bus.subscribe_calls),
            ("chanbridge_bus_unsubscribe_calls_total", bus.unsubscribe_calls),
            ("chanbridge_bus_published_total", bus.published),
            ("chanbridge_bus_delivered_total", bus.delivered),
            ("chanbridge_bus_acked_total", bus.acked),
        ];
        for (name, value) in bus_counters {
            let _ = write!(output, "# TYPE {} counter\n{} {}\n", name, name, value);
        }
        let _ = write!(
            output,
            "# TYPE chanbridge_bus_active_subscriptions gauge\nchanbridge_bus_active_subscriptions {}\n",
            bus.active_subscriptions
        );
        let _ = write!(
            output,
            "# TYPE chanbridge_bus_connected gauge\nchanbridge_bus_connected{{state=\"{}\"}} {}\n",
            bus.state,
            u8::from(bus.state.is_connected())
        );

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanbridge_bus::ConnectionState;

    fn bus_stats() -> BusStats {
        BusStats {
            state: ConnectionState::Connected,
            reconnects: 1,
            active_subscriptions: 2,
            subscribe_calls: 3,
            unsubscribe_calls: 1,
            published: 10,
            delivered: 20,
            acked: 19,
        }
    }

    #[test]
    fn test_counter_and_gauge() {
        let counter = Counter::default();
        counter.inc();
        counter.inc_by(4);
        assert_eq!(counter.get(), 5);

        let gauge = Gauge::default();
        gauge.set(3);
        assert_eq!(gauge.get(), 3);
    }

    #[test]
    fn test_clones_share_value() {
        let metrics = DispatchMetrics::new();
        let delivered = metrics.delivered.clone();
        delivered.inc();
        assert_eq!(metrics.snapshot().delivered, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = DispatchMetrics::new();
        metrics.delivered.inc_by(7);
        metrics.live_subscriptions.set(2);

        let output = metrics.export_prometheus(&bus_stats());

        assert!(output.contains("chanbridge_delivered_total 7"));
        assert!(output.contains("chanbridge_live_subscriptions 2"));
        assert!(output.contains("chanbridge_bus_acked_total 19"));
        assert!(output.contains("chanbridge_bus_connected{state=\"connected\"} 1"));
    }
}
