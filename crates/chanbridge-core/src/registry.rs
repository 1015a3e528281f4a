//! Subscription registry
//!
//! The in-memory record of what is currently live: for every channel, the
//! subscriptions that have a bus consumer and a running worker. Only the
//! reconciler mutates it; everything else reads value copies.

use chanbridge_bus::SubscriptionHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::model::{ChannelId, DesiredState, SubscriptionSpec};
use crate::worker::{WorkerHandle, WorkerState};

/// A subscription with its bus consumer and delivery worker.
#[derive(Debug, Clone)]
pub struct LiveSubscription {
    /// Bus consumer handle, released exactly once
    pub handle: SubscriptionHandle,
    /// Delivery worker
    pub worker: WorkerHandle,
    /// When the subscription went live
    pub created_at: DateTime<Utc>,
}

impl LiveSubscription {
    /// Record a freshly started subscription
    #[must_use]
    pub fn new(handle: SubscriptionHandle, worker: WorkerHandle) -> Self {
        Self {
            handle,
            worker,
            created_at: Utc::now(),
        }
    }
}

type ChannelState = HashMap<SubscriptionSpec, LiveSubscription>;

/// One row of a [`RegistrySnapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionEntry {
    /// Channel (`namespace/name`)
    pub channel: ChannelId,
    /// Subscription URIs
    #[serde(flatten)]
    pub spec: SubscriptionSpec,
    /// Durable consumer name
    pub durable_name: String,
    /// Worker lifecycle state
    pub worker: WorkerState,
    /// When the subscription went live
    pub created_at: DateTime<Utc>,
}

/// Point-in-time copy of the registry for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistrySnapshot {
    /// Live subscriptions ordered by channel then subscriber
    pub subscriptions: Vec<SubscriptionEntry>,
}

impl RegistrySnapshot {
    /// Number of live subscriptions
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    /// Whether nothing is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

/// Channel to live-subscription map behind a single lock.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    channels: Mutex<HashMap<ChannelId, ChannelState>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelId, ChannelState>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live subscription specs of `channel`
    #[must_use]
    pub fn list(&self, channel: &ChannelId) -> HashSet<SubscriptionSpec> {
        self.lock()
            .get(channel)
            .map(|subs| subs.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Specs of `channel` whose worker has already exited. Their consumer
    /// stream is gone, so they no longer count as live.
    #[must_use]
    pub fn stopped(&self, channel: &ChannelId) -> HashSet<SubscriptionSpec> {
        self.lock()
            .get(channel)
            .map(|subs| {
                subs.iter()
                    .filter(|(_, live)| live.worker.state().exit().is_some())
                    .map(|(spec, _)| spec.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live record of one pair
    #[must_use]
    pub fn get(&self, channel: &ChannelId, spec: &SubscriptionSpec) -> Option<LiveSubscription> {
        self.lock().get(channel).and_then(|subs| subs.get(spec)).cloned()
    }

    /// Record a live pair. Returns the entry it displaced, if any, so the
    /// caller can release it.
    pub fn add(
        &self,
        channel: ChannelId,
        spec: SubscriptionSpec,
        live: LiveSubscription,
    ) -> Option<LiveSubscription> {
        self.lock().entry(channel).or_default().insert(spec, live)
    }

    /// Forget a pair. Removing an absent pair is a no-op.
    pub fn remove(&self, channel: &ChannelId, spec: &SubscriptionSpec) -> Option<LiveSubscription> {
        let mut channels = self.lock();
        let subs = channels.get_mut(channel)?;
        let removed = subs.remove(spec);
        if subs.is_empty() {
            channels.remove(channel);
        }
        removed
    }

    /// Channels that currently have at least one live subscription
    #[must_use]
    pub fn channels(&self) -> Vec<ChannelId> {
        self.lock().keys().cloned().collect()
    }

    /// Value copy for diagnostics
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut subscriptions: Vec<SubscriptionEntry> = self
            .lock()
            .iter()
            .flat_map(|(channel, subs)| {
                subs.iter().map(move |(spec, live)| SubscriptionEntry {
                    channel: channel.clone(),
                    spec: spec.clone(),
                    durable_name: live.handle.durable_name.clone(),
                    worker: live.worker.state(),
                    created_at: live.created_at,
                })
            })
            .collect();
        subscriptions.sort_by(|a, b| {
            a.channel
                .cmp(&b.channel)
                .then_with(|| a.spec.subscriber_uri.as_str().cmp(b.spec.subscriber_uri.as_str()))
        });
        RegistrySnapshot { subscriptions }
    }

    /// The live set shaped like a desired state
    #[must_use]
    pub fn live_state(&self) -> DesiredState {
        let channels = self
            .lock()
            .iter()
            .map(|(channel, subs)| (channel.clone(), subs.keys().cloned().collect()))
            .collect();
        DesiredState { channels }
    }

    /// Empty the registry, returning everything that was live
    pub fn drain(&self) -> Vec<(ChannelId, SubscriptionSpec, LiveSubscription)> {
        self.lock()
            .drain()
            .flat_map(|(channel, subs)| {
                subs.into_iter()
                    .map(move |(spec, live)| (channel.clone(), spec, live))
            })
            .collect()
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    /// Number of channels with live subscriptions
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
