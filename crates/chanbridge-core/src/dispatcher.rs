//! Dispatcher façade
//!
//! Composes the bus connection, the registry, the reconciler and the
//! workers behind a small lifecycle API:
//!
//! - [`Dispatcher::apply_desired_state`] is the only mutation entry point
//! - [`Dispatcher::start`] watches the bus connection until cancelled,
//!   invalidating live subscriptions on connection loss and resyncing them
//!   when the connection returns
//! - [`Dispatcher::stop`] drains every worker, then closes the bus

use chanbridge_bus::{Bus, BusStats, ConnectionState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DispatcherConfig;
use crate::delivery::{Forwarder, HttpForwarder};
use crate::error::{Error, Result};
use crate::metrics::DispatchMetrics;
use crate::model::DesiredState;
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::registry::{RegistrySnapshot, SubscriptionRegistry};
use crate::worker::WorkerContext;

/// Channel dispatcher
pub struct Dispatcher {
    bus: Arc<dyn Bus>,
    registry: Arc<SubscriptionRegistry>,
    reconciler: Reconciler,
    metrics: Arc<DispatchMetrics>,
    shutdown: CancellationToken,
    running: AtomicBool,
    drained: watch::Sender<bool>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("live", &self.registry.len())
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Build a dispatcher over an existing bus connection
    pub fn new(
        config: &DispatcherConfig,
        bus: Arc<dyn Bus>,
        forwarder: Arc<dyn Forwarder>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = DispatchMetrics::new();
        let registry = Arc::new(SubscriptionRegistry::new());
        let ctx = WorkerContext {
            forwarder,
            retry: config.delivery.retry.clone(),
            dead_letter_retry: config.delivery.dead_letter_retry.clone(),
            metrics: Arc::clone(&metrics),
        };
        let reconciler = Reconciler::new(Arc::clone(&bus), Arc::clone(&registry), ctx, config);
        let (drained, _) = watch::channel(false);

        Ok(Self {
            bus,
            registry,
            reconciler,
            metrics,
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            drained,
        })
    }

    /// Build a dispatcher that delivers over HTTP
    pub fn with_http(config: &DispatcherConfig, bus: Arc<dyn Bus>) -> Result<Self> {
        let forwarder = HttpForwarder::new(&config.delivery)?;
        Self::new(config, bus, Arc::new(forwarder))
    }

    /// Connect to NATS JetStream and build an HTTP-delivering dispatcher.
    ///
    /// An unreachable bus is a startup error.
    #[cfg(feature = "nats")]
    pub async fn connect(config: &DispatcherConfig) -> Result<Self> {
        config.validate()?;
        let bus = chanbridge_bus::NatsBus::connect(config.bus.nats()).await?;
        Self::with_http(config, Arc::new(bus))
    }

    /// Converge the live subscriptions onto `desired`.
    ///
    /// Returns the pass report; pairs that failed stay absent until the next
    /// apply or resync.
    pub async fn apply_desired_state(&self, desired: DesiredState) -> Result<ReconcileReport> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Lifecycle("stopped"));
        }
        info!(
            channels = desired.channels.len(),
            subscriptions = desired.subscription_count(),
            "Applying desired state"
        );
        self.reconciler.apply(desired).await
    }

    /// Re-apply the last desired state
    pub async fn resync(&self) -> Result<ReconcileReport> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Lifecycle("stopped"));
        }
        Ok(self.reconciler.resync().await)
    }

    /// The last applied desired state
    pub async fn desired_state(&self) -> DesiredState {
        self.reconciler.last_applied().await
    }

    /// Run until `cancel` fires, `stop` is called or the bus closes, then
    /// drain.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Lifecycle("stopped"));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Lifecycle("already running"));
        }

        let mut connection = self.bus.connection_state();
        let mut connected = connection.borrow_and_update().is_connected();
        let mut seen_reconnects = self.bus.stats().reconnects;
        info!(connected, "Dispatcher started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Dispatcher cancelled");
                    break;
                }
                () = self.shutdown.cancelled() => {
                    info!("Dispatcher stop requested");
                    break;
                }
                changed = connection.changed() => {
                    if changed.is_err() {
                        warn!("Bus connection state channel closed");
                        break;
                    }
                    let state = *connection.borrow_and_update();
                    match state {
                        ConnectionState::Connected => {
                            let reconnects = self.bus.stats().reconnects;
                            if connected && reconnects == seen_reconnects {
                                continue;
                            }
                            if connected {
                                debug!("Missed a disconnect, invalidating before resync");
                            }
                            self.reconciler.invalidate().await;
                            connected = true;
                            seen_reconnects = reconnects;
                            info!(reconnects, "Bus connection restored, resyncing");
                            let report = self.reconciler.resync().await;
                            if !report.is_complete() {
                                warn!(failed = report.failures.len(), "Resync incomplete");
                            }
                        }
                        ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                            if connected {
                                connected = false;
                                warn!(state = %state, "Bus connection lost, invalidating live subscriptions");
                                self.reconciler.invalidate().await;
                            }
                        }
                        ConnectionState::Closed => {
                            info!("Bus connection closed");
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown.cancel();
        self.drain().await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Stop: drain every worker, then close the bus. Durable consumers are
    /// kept so delivery resumes where it stopped on the next start.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if self.running.load(Ordering::SeqCst) {
            let mut drained = self.drained.subscribe();
            let _ = drained.wait_for(|drained| *drained).await;
        } else {
            self.drain().await;
        }
    }

    async fn drain(&self) {
        if *self.drained.borrow() {
            return;
        }
        let stopped = self.reconciler.invalidate().await;
        self.bus.close().await;
        self.drained.send_replace(true);
        info!(workers = stopped, "Dispatcher drained");
    }

    /// Whether `stop` was requested or the dispatcher has exited
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Copy of the live subscription registry
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        self.registry.snapshot()
    }

    /// Dispatch counters
    #[must_use]
    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Bus counters
    #[must_use]
    pub fn bus_stats(&self) -> BusStats {
        self.bus.stats()
    }

    /// Dispatch and bus counters in Prometheus text format
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        self.metrics.export_prometheus(&self.bus.stats())
    }

    /// Current bus connection state
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.bus.connection_state().borrow()
    }
}
