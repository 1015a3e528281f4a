//! Dispatcher configuration
//!
//! Every operational parameter (bus endpoint, retry budget, backoff curve,
//! drain grace period) lives here with an explicit default. Bus endpoint
//! defaults are taken from the environment when present.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::RetryConfig;

/// Default bus URL when `NATS_URL` is not set
pub const DEFAULT_BUS_URL: &str = "nats://nats-streaming.natss.svc.cluster.local:4222";

/// Default cluster id when `NATS_CLUSTER_ID` is not set
pub const DEFAULT_CLUSTER_ID: &str = "knative-nats-streaming";

/// Complete dispatcher configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Bus endpoint
    #[serde(default)]
    pub bus: BusConfig,
    /// Subscriber delivery policy
    #[serde(default)]
    pub delivery: DeliveryConfig,
    /// Worker lifecycle
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl DispatcherConfig {
    /// Reject settings that cannot work at runtime
    pub fn validate(&self) -> Result<()> {
        if self.bus.url.trim().is_empty() {
            return Err(Error::Configuration("bus.url is empty".to_string()));
        }
        if self.bus.subject_prefix.is_empty()
            || self
                .bus
                .subject_prefix
                .split('.')
                .any(|token| token.is_empty() || token == "*" || token == ">")
        {
            return Err(Error::Configuration(format!(
                "bus.subject_prefix '{}' is not a valid subject prefix",
                self.bus.subject_prefix
            )));
        }
        if self.delivery.retry.backoff_multiplier < 1.0 {
            return Err(Error::Configuration(
                "delivery.retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.delivery.request_timeout_ms == 0 {
            return Err(Error::Configuration(
                "delivery.request_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Bus endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus server URL
    #[serde(default = "default_bus_url")]
    pub url: String,
    /// Cluster identifier
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,
    /// Stream holding every channel subject
    #[serde(default = "default_stream_name")]
    pub stream_name: String,
    /// Prefix of every channel subject
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
    /// Seconds the bus waits for an ack before redelivering
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,
}

fn default_bus_url() -> String {
    std::env::var("NATS_URL").unwrap_or_else(|_| DEFAULT_BUS_URL.to_string())
}

fn default_cluster_id() -> String {
    std::env::var("NATS_CLUSTER_ID").unwrap_or_else(|_| DEFAULT_CLUSTER_ID.to_string())
}

fn default_stream_name() -> String {
    "CHANNELS".to_string()
}

fn default_subject_prefix() -> String {
    "channels".to_string()
}

fn default_ack_wait_secs() -> u64 {
    60
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: default_bus_url(),
            cluster_id: default_cluster_id(),
            stream_name: default_stream_name(),
            subject_prefix: default_subject_prefix(),
            ack_wait_secs: default_ack_wait_secs(),
        }
    }
}

impl BusConfig {
    /// Ack wait as a duration
    #[must_use]
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }

    /// Settings for the NATS JetStream client
    #[cfg(feature = "nats")]
    #[must_use]
    pub fn nats(&self) -> chanbridge_bus::NatsConfig {
        chanbridge_bus::NatsConfig {
            url: self.url.clone(),
            cluster_id: self.cluster_id.clone(),
            stream_name: self.stream_name.clone(),
            subject_prefix: self.subject_prefix.clone(),
            ack_wait: self.ack_wait(),
        }
    }
}

/// HTTP delivery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Retry policy for subscriber and reply delivery
    #[serde(default)]
    pub retry: RetryConfig,
    /// Retry policy for dead-letter forwarding
    #[serde(default = "RetryConfig::single_attempt")]
    pub dead_letter_retry: RetryConfig,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            dead_letter_retry: RetryConfig::single_attempt(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl DeliveryConfig {
    /// Per-request timeout
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Connect timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Worker lifecycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// How long a stopping worker may take to finish its current delivery
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

fn default_drain_grace_ms() -> u64 {
    10_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

impl WorkerConfig {
    /// Drain grace period
    #[must_use]
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }
}
