//! Reconciler
//!
//! Converges the live subscription set onto a desired-state snapshot. Each
//! pass diffs every channel in `desired ∪ live`, removes what is no longer
//! wanted, then subscribes what is missing. Channels are reconciled
//! concurrently; passes are serialized.

use chanbridge_bus::Bus;
use futures::future::join_all;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::DispatcherConfig;
use crate::error::{Error, Result};
use crate::model::{durable_name, ChannelId, DesiredState, SubscriptionSpec};
use crate::registry::{LiveSubscription, SubscriptionRegistry};
use crate::worker::{DispatchWorker, WorkerContext};

/// Bus operation that failed for one pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Opening the durable consumer
    Subscribe,
    /// Deleting the durable consumer
    Unsubscribe,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribe => write!(f, "subscribe"),
            Self::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

/// One (channel, subscription) pair that did not converge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileFailure {
    /// Channel of the pair
    pub channel: ChannelId,
    /// Subscriber of the pair
    pub subscriber: Url,
    /// What was attempted
    pub operation: Operation,
    /// Bus error message
    pub error: String,
}

impl fmt::Display for ReconcileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}: {}",
            self.operation, self.channel, self.subscriber, self.error
        )
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Pairs that went live
    pub added: usize,
    /// Pairs taken down
    pub removed: usize,
    /// Pairs already live and still wanted
    pub unchanged: usize,
    /// Pairs that failed; retried on the next pass
    pub failures: Vec<ReconcileFailure>,
}

impl ReconcileReport {
    /// Whether every pair converged
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turn recorded failures into an error
    pub fn into_result(self) -> Result<Self> {
        match self.failures.first() {
            None => Ok(self),
            Some(first) => Err(Error::Reconcile {
                failed: self.failures.len(),
                first: first.to_string(),
            }),
        }
    }

    fn merge(&mut self, other: Self) {
        self.added += other.added;
        self.removed += other.removed;
        self.unchanged += other.unchanged;
        self.failures.extend(other.failures);
    }
}

/// Drives the registry toward the desired state
pub struct Reconciler {
    bus: Arc<dyn Bus>,
    registry: Arc<SubscriptionRegistry>,
    ctx: WorkerContext,
    subject_prefix: String,
    drain_grace: Duration,
    /// Serializes passes and remembers the last applied snapshot
    last_applied: Mutex<DesiredState>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("subject_prefix", &self.subject_prefix)
            .field("drain_grace", &self.drain_grace)
            .field("live", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Create a reconciler over `bus` and `registry`
    #[must_use]
    pub fn new(
        bus: Arc<dyn Bus>,
        registry: Arc<SubscriptionRegistry>,
        ctx: WorkerContext,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            bus,
            registry,
            ctx,
            subject_prefix: config.bus.subject_prefix.clone(),
            drain_grace: config.worker.drain_grace(),
            last_applied: Mutex::new(DesiredState::default()),
        }
    }

    /// Converge onto `desired`.
    ///
    /// An invalid snapshot is rejected before anything is touched. Bus
    /// failures are collected in the report; the other pairs still converge.
    pub async fn apply(&self, desired: DesiredState) -> Result<ReconcileReport> {
        desired.validate()?;
        let mut last_applied = self.last_applied.lock().await;
        let desired = desired.normalized();
        let report = self.reconcile(&desired).await;
        *last_applied = desired;
        Ok(report)
    }

    /// Re-apply the last applied snapshot
    pub async fn resync(&self) -> ReconcileReport {
        let last_applied = self.last_applied.lock().await;
        info!(
            subscriptions = last_applied.subscription_count(),
            "Resyncing subscriptions"
        );
        self.reconcile(&last_applied).await
    }

    /// Stop every worker and forget every live pair without calling the bus.
    ///
    /// Used when the connection is gone (handles are already dead) and on
    /// shutdown (durable consumers must survive). Returns the number of
    /// pairs dropped.
    pub async fn invalidate(&self) -> usize {
        let _guard = self.last_applied.lock().await;
        let drained = self.registry.drain();
        let count = drained.len();
        join_all(
            drained
                .iter()
                .map(|(_, _, live)| live.worker.stop(self.drain_grace)),
        )
        .await;
        self.ctx.metrics.live_subscriptions.set(0);
        if count > 0 {
            info!(count, "Live subscriptions invalidated");
        }
        count
    }

    /// The last applied snapshot
    pub async fn last_applied(&self) -> DesiredState {
        self.last_applied.lock().await.clone()
    }

    async fn reconcile(&self, desired: &DesiredState) -> ReconcileReport {
        let mut channels: HashSet<ChannelId> = desired.channels.keys().cloned().collect();
        channels.extend(self.registry.channels());

        let empty = HashSet::new();
        let passes = channels.into_iter().map(|channel| {
            let wanted = desired.subscriptions(&channel).unwrap_or(&empty);
            let live = self.registry.list(&channel);
            // a worker whose stream ended is not live, whatever the registry says
            let stopped = self.registry.stopped(&channel);
            let running: HashSet<SubscriptionSpec> = live.difference(&stopped).cloned().collect();

            let to_remove: Vec<SubscriptionSpec> = live.difference(wanted).cloned().collect();
            let to_restart: Vec<SubscriptionSpec> = stopped.intersection(wanted).cloned().collect();
            let to_add: Vec<SubscriptionSpec> = wanted.difference(&running).cloned().collect();
            let unchanged = running.intersection(wanted).count();
            async move {
                self.retire_stopped(&channel, &to_restart);
                let mut report = self.reconcile_channel(&channel, to_remove, to_add).await;
                report.unchanged += unchanged;
                report
            }
        });

        let mut report = ReconcileReport::default();
        for channel_report in join_all(passes).await {
            report.merge(channel_report);
        }

        self.ctx.metrics.reconciliations.inc();
        self.ctx
            .metrics
            .live_subscriptions
            .set(self.registry.len() as i64);

        if report.is_complete() {
            info!(
                added = report.added,
                removed = report.removed,
                unchanged = report.unchanged,
                "Reconciliation complete"
            );
        } else {
            warn!(
                added = report.added,
                removed = report.removed,
                unchanged = report.unchanged,
                failed = report.failures.len(),
                "Reconciliation incomplete"
            );
        }
        report
    }

    async fn reconcile_channel(
        &self,
        channel: &ChannelId,
        to_remove: Vec<SubscriptionSpec>,
        to_add: Vec<SubscriptionSpec>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for spec in to_remove {
            if let Err(e) = self.remove_subscription(channel, &spec).await {
                self.ctx.metrics.unsubscribe_failures.inc();
                warn!(channel = %channel, subscriber = %spec, error = %e, "Unsubscribe failed");
                report.failures.push(ReconcileFailure {
                    channel: channel.clone(),
                    subscriber: spec.subscriber_uri.clone(),
                    operation: Operation::Unsubscribe,
                    error: e.to_string(),
                });
            }
            report.removed += 1;
        }

        for spec in to_add {
            match self.add_subscription(channel, &spec).await {
                Ok(()) => report.added += 1,
                Err(e) => {
                    self.ctx.metrics.subscribe_failures.inc();
                    warn!(channel = %channel, subscriber = %spec, error = %e, "Subscribe failed");
                    report.failures.push(ReconcileFailure {
                        channel: channel.clone(),
                        subscriber: spec.subscriber_uri.clone(),
                        operation: Operation::Subscribe,
                        error: e.to_string(),
                    });
                }
            }
        }

        report
    }

    /// Stop the worker, delete the durable consumer, forget the pair. The
    /// pair is forgotten even when the bus call fails.
    async fn remove_subscription(&self, channel: &ChannelId, spec: &SubscriptionSpec) -> Result<()> {
        let Some(live) = self.registry.get(channel, spec) else {
            return Ok(());
        };
        let exit = live.worker.stop(self.drain_grace).await;
        debug!(channel = %channel, subscriber = %spec, exit = ?exit, "Worker stopped");

        let result = self.bus.unsubscribe(&live.handle).await;
        self.registry.remove(channel, spec);
        result?;

        info!(
            channel = %channel,
            subscriber = %spec,
            durable = %live.handle.durable_name,
            "Subscription removed"
        );
        Ok(())
    }

    /// Forget pairs whose worker exited on its own. The durable consumer is
    /// kept so the replacement worker picks up whatever is still pending.
    fn retire_stopped(&self, channel: &ChannelId, specs: &[SubscriptionSpec]) {
        for spec in specs {
            if let Some(stale) = self.registry.remove(channel, spec) {
                warn!(
                    channel = %channel,
                    subscriber = %spec,
                    worker = %stale.worker.state(),
                    "Worker no longer running, resubscribing"
                );
            }
        }
    }

    async fn add_subscription(&self, channel: &ChannelId, spec: &SubscriptionSpec) -> Result<()> {
        let subject = channel.subject(&self.subject_prefix);
        let durable = durable_name(channel, spec);
        let subscription = self.bus.subscribe(&subject, &durable).await?;

        let worker = DispatchWorker::new(channel.clone(), spec, durable.clone(), self.ctx.clone())
            .spawn(subscription.messages);
        let live = LiveSubscription::new(subscription.handle, worker);

        if let Some(displaced) = self.registry.add(channel.clone(), spec.clone(), live) {
            warn!(channel = %channel, subscriber = %spec, "Replaced an existing live subscription");
            displaced.worker.cancel();
        }

        info!(
            channel = %channel,
            subscriber = %spec,
            subject = %subject,
            durable = %durable,
            "Subscription added"
        );
        Ok(())
    }
}
