//! Process configuration types
//!
//! Wraps the dispatcher configuration with the settings only the process
//! shell needs: the metrics endpoint and the desired-state file source.

use chanbridge_core::DispatcherConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub desired_state: DesiredStateConfig,
}

/// Metrics and health endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_metrics_host() -> String {
    "127.0.0.1".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

/// File-backed desired-state source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DesiredStateConfig {
    /// TOML or JSON file; no source when unset
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for DesiredStateConfig {
    fn default() -> Self {
        Self {
            path: None,
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl DesiredStateConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}
