//! Chanbridge Core - Dispatch and Reconciliation Engine
//!
//! This crate provides the channel dispatcher that bridges a durable
//! publish/subscribe bus to HTTP subscribers, including:
//! - Model: channel identity, subscription specs and desired state
//! - Registry: the live (channel, subscription) set
//! - Reconciler: converging the live set onto a desired-state snapshot
//! - Worker: per-subscription delivery with retry, reply and dead-letter
//! - Dispatcher: lifecycle and connection-loss handling
//! - Metrics: dispatch counters in Prometheus format

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod delivery;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod model;
pub mod reconciler;
pub mod registry;
pub mod retry;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{BusConfig, DeliveryConfig, DispatcherConfig, WorkerConfig};
pub use delivery::{
    DeliveryError, DeliveryResponse, DeliveryTarget, Forwarder, HttpForwarder, Outbound, Targets,
    ERROR_CODE_HEADER, ERROR_DEST_HEADER,
};
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use metrics::{DispatchMetrics, DispatchStats};
pub use model::{durable_name, ChannelId, DesiredState, Message, SubscriptionSpec};
pub use reconciler::{Operation, ReconcileFailure, ReconcileReport, Reconciler};
pub use registry::{LiveSubscription, RegistrySnapshot, SubscriptionEntry, SubscriptionRegistry};
pub use retry::RetryConfig;
pub use worker::{
    DispatchWorker, MessageOutcome, WorkerContext, WorkerExit, WorkerHandle, WorkerState,
};
