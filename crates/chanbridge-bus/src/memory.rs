//! In-process bus
//!
//! Routes every message published on a subject to every durable consumer
//! of that exact subject, in publish order. Unacknowledged messages stay
//! pending on their durable consumer and are replayed (marked
//! `redelivered`) when the consumer is resumed after a connection loss.
//!
//! Connection loss is simulated with [`InMemoryBus::disconnect`] and
//! [`InMemoryBus::reconnect`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{FutureExt, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use crate::connection::{BusStats, ConnectionState, StatsCounters};
use crate::message::{BusMessage, Delivery};
use crate::{validate_subject, Bus, Error, Result, Subscription, SubscriptionHandle};

/// Most recent acknowledgments kept for inspection.
pub const ACK_LOG_CAPACITY: usize = 1024;

/// A durable consumer and the messages it has not acknowledged yet.
struct Durable {
    subject: String,
    active: Option<(Uuid, mpsc::UnboundedSender<Delivery>)>,
    pending: BTreeMap<u64, BusMessage>,
}

#[derive(Default)]
struct State {
    durables: HashMap<String, Durable>,
    handles: HashMap<Uuid, String>,
    next_sequence: u64,
    failing_subjects: HashSet<String>,
    acks: VecDeque<(String, u64)>,
}

impl State {
    fn record_ack(&mut self, durable_name: String, sequence: u64) {
        if self.acks.len() == ACK_LOG_CAPACITY {
            self.acks.pop_front();
        }
        self.acks.push_back((durable_name, sequence));
    }
}

struct Inner {
    state: Mutex<State>,
    connection: watch::Sender<ConnectionState>,
    counters: StatsCounters,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_connected(&self) -> Result<()> {
        match *self.connection.borrow() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Closed => Err(Error::Closed),
            _ => Err(Error::NotConnected),
        }
    }
}

/// In-process implementation of [`Bus`].
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

impl InMemoryBus {
    /// Create a connected bus
    #[must_use]
    pub fn new() -> Self {
        let (connection, _) = watch::channel(ConnectionState::Connected);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                connection,
                counters: StatsCounters::default(),
            }),
        }
    }

    /// Simulate connection loss: every open stream ends and every issued
    /// handle becomes invalid. Durable positions survive.
    pub fn disconnect(&self) {
        {
            let mut state = self.inner.lock();
            for durable in state.durables.values_mut() {
                durable.active = None;
            }
            state.handles.clear();
        }
        self.inner
            .connection
            .send_replace(ConnectionState::Disconnected);
        info!("In-memory bus disconnected");
    }

    /// Simulate the connection coming back.
    ///
    /// The reconnect counter is bumped before watchers see `Connected`.
    pub fn reconnect(&self) {
        let counters = &self.inner.counters;
        let changed = self.inner.connection.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                return false;
            }
            StatsCounters::inc(&counters.reconnects);
            *state = ConnectionState::Connected;
            true
        });
        if changed {
            info!("In-memory bus reconnected");
        }
    }

    /// Make every subscribe on `subject` fail until cleared.
    pub fn fail_subscriptions(&self, subject: &str, fail: bool) {
        let mut state = self.inner.lock();
        if fail {
            state.failing_subjects.insert(subject.to_string());
        } else {
            state.failing_subjects.remove(subject);
        }
    }

    /// Sequences acknowledged on `durable_name`, in ack order. Only the last
    /// [`ACK_LOG_CAPACITY`] acknowledgments across all durables are kept.
    #[must_use]
    pub fn acked(&self, durable_name: &str) -> Vec<u64> {
        self.inner
            .lock()
            .acks
            .iter()
            .filter(|(name, _)| name == durable_name)
            .map(|(_, seq)| *seq)
            .collect()
    }

    /// Number of unacknowledged messages held for `durable_name`.
    #[must_use]
    pub fn pending(&self, durable_name: &str) -> usize {
        self.inner
            .lock()
            .durables
            .get(durable_name)
            .map_or(0, |d| d.pending.len())
    }

    /// Names of the durable consumers that currently exist.
    #[must_use]
    pub fn durable_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().durables.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    fn delivery(&self, durable_name: &str, message: BusMessage) -> Delivery {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let durable_name = durable_name.to_string();
        let sequence = message.sequence;
        StatsCounters::inc(&self.inner.counters.delivered);
        Delivery::new(message, move || {
            async move {
                let Some(inner) = weak.upgrade() else {
                    return Err(Error::Closed);
                };
                let mut state = inner.lock();
                if let Some(durable) = state.durables.get_mut(&durable_name) {
                    durable.pending.remove(&sequence);
                }
                state.record_ack(durable_name, sequence);
                StatsCounters::inc(&inner.counters.acked);
                Ok(())
            }
            .boxed()
        })
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn subscribe(&self, subject: &str, durable_name: &str) -> Result<Subscription> {
        StatsCounters::inc(&self.inner.counters.subscribe_calls);
        self.inner.ensure_connected()?;
        validate_subject(subject)?;

        let (tx, rx) = mpsc::unbounded();
        let handle = SubscriptionHandle::new(subject, durable_name);

        let replay = {
            let mut state = self.inner.lock();
            if state.failing_subjects.contains(subject) {
                return Err(Error::Subscribe {
                    subject: subject.to_string(),
                    message: "subscription rejected".to_string(),
                });
            }

            let durable = state
                .durables
                .entry(durable_name.to_string())
                .or_insert_with(|| Durable {
                    subject: subject.to_string(),
                    active: None,
                    pending: BTreeMap::new(),
                });
            if durable.subject != subject {
                return Err(Error::Subscribe {
                    subject: subject.to_string(),
                    message: format!(
                        "durable {} is bound to {}",
                        durable_name, durable.subject
                    ),
                });
            }
            if durable.active.as_ref().is_some_and(|(_, tx)| !tx.is_closed()) {
                return Err(Error::Subscribe {
                    subject: subject.to_string(),
                    message: format!("durable {} already has a consumer", durable_name),
                });
            }
            // consumer dropped its stream without unsubscribing
            let abandoned = durable
                .active
                .replace((handle.id, tx.clone()))
                .map(|(id, _)| id);
            let replay: Vec<BusMessage> = durable
                .pending
                .values()
                .cloned()
                .map(|mut message| {
                    message.redelivered = true;
                    message
                })
                .collect();
            if let Some(id) = abandoned {
                state.handles.remove(&id);
            }
            state.handles.insert(handle.id, durable_name.to_string());
            replay
        };

        if !replay.is_empty() {
            debug!(
                durable = %durable_name,
                count = replay.len(),
                "Replaying unacknowledged messages"
            );
        }
        for message in replay {
            let _ = tx.unbounded_send(self.delivery(durable_name, message));
        }

        Ok(Subscription {
            handle,
            messages: rx.boxed(),
        })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        StatsCounters::inc(&self.inner.counters.unsubscribe_calls);
        self.inner.ensure_connected()?;

        let mut state = self.inner.lock();
        if let Some(durable_name) = state.handles.remove(&handle.id) {
            state.durables.remove(&durable_name);
            debug!(durable = %durable_name, "Durable consumer removed");
        }
        Ok(())
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: HashMap<String, String>,
    ) -> Result<()> {
        self.inner.ensure_connected()?;
        validate_subject(subject)?;

        let outgoing = {
            let mut state = self.inner.lock();
            state.next_sequence += 1;
            let mut message = BusMessage::new(subject, payload).with_headers(headers);
            message.sequence = state.next_sequence;

            let mut outgoing = Vec::new();
            for (name, durable) in state.durables.iter_mut() {
                if durable.subject != subject {
                    continue;
                }
                durable.pending.insert(message.sequence, message.clone());
                if let Some((_, tx)) = &durable.active {
                    outgoing.push((name.clone(), tx.clone()));
                }
            }
            StatsCounters::inc(&self.inner.counters.published);
            (message, outgoing)
        };

        let (message, targets) = outgoing;
        for (durable_name, tx) in targets {
            let _ = tx.unbounded_send(self.delivery(&durable_name, message.clone()));
        }
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.subscribe()
    }

    fn stats(&self) -> BusStats {
        let active = self.inner.lock().handles.len() as u64;
        self.inner
            .counters
            .snapshot(*self.inner.connection.borrow(), active)
    }

    async fn close(&self) {
        {
            let mut state = self.inner.lock();
            for durable in state.durables.values_mut() {
                durable.active = None;
            }
            state.handles.clear();
        }
        self.inner.connection.send_replace(ConnectionState::Closed);
        info!("In-memory bus closed");
    }
}

#[cfg(test)]
mod tests;
