//! File-backed desired-state source
//!
//! Stands in for the control plane: reads a TOML or JSON desired-state file
//! at startup and re-applies it whenever its contents change. A snapshot
//! that fails to parse or validate is rejected and the previous one stays
//! live. When a pass leaves pairs unconverged, the next tick resyncs.

use anyhow::{Context, Result};
use chanbridge_core::{DesiredState, Dispatcher, ReconcileReport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Parse a desired-state document; `.json` files are JSON, anything else
/// is TOML.
pub fn parse(path: &Path, raw: &str) -> Result<DesiredState> {
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let desired: DesiredState = if is_json {
        serde_json::from_str(raw).context("Invalid desired-state JSON")?
    } else {
        toml::from_str(raw).context("Invalid desired-state TOML")?
    };
    desired.validate().context("Desired state rejected")?;
    Ok(desired)
}

/// Polls one file and feeds it to the dispatcher
pub struct FileSource {
    path: PathBuf,
    interval: Duration,
    last_contents: Option<String>,
    needs_resync: bool,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
            last_contents: None,
            needs_resync: false,
        }
    }

    /// Apply the file if it changed since the last successful apply, or
    /// resync if the last pass was incomplete. Returns `None` when nothing
    /// was done.
    pub async fn poll_once(&mut self, dispatcher: &Dispatcher) -> Result<Option<ReconcileReport>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;

        let report = if self.last_contents.as_deref() != Some(raw.as_str()) {
            let desired = parse(&self.path, &raw)?;
            info!(path = %self.path.display(), "Desired state changed");
            let report = dispatcher.apply_desired_state(desired).await?;
            self.last_contents = Some(raw);
            report
        } else if self.needs_resync {
            debug!("Retrying unconverged subscriptions");
            dispatcher.resync().await?
        } else {
            return Ok(None);
        };

        self.needs_resync = !report.is_complete();
        Ok(Some(report))
    }

    /// Poll until `shutdown` fires
    pub async fn run(mut self, dispatcher: Arc<Dispatcher>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            path = %self.path.display(),
            interval_secs = self.interval.as_secs(),
            "Desired-state file source started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once(&dispatcher).await {
                        Ok(Some(report)) if !report.is_complete() => {
                            warn!(failed = report.failures.len(), "Desired state partially applied");
                        }
                        Ok(_) => {}
                        Err(e) => error!("Desired state not applied: {:#}", e),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Desired-state file source shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanbridge_bus::InMemoryBus;
    use chanbridge_core::DispatcherConfig;

    const ORDERS: &str = r#"
        [channels]
        "default/orders" = [{ subscriber = "http://billing.local/" }]
    "#;

    fn dispatcher(bus: &InMemoryBus) -> Dispatcher {
        Dispatcher::with_http(&DispatcherConfig::default(), Arc::new(bus.clone())).unwrap()
    }

    #[test]
    fn test_parse_json_and_toml() {
        let toml = parse(Path::new("channels.toml"), ORDERS).unwrap();
        let json = parse(
            Path::new("channels.json"),
            r#"{"channels": {"default/orders": [{"subscriber": "http://billing.local/"}]}}"#,
        )
        .unwrap();
        assert_eq!(toml, json);
        assert_eq!(toml.subscription_count(), 1);
    }

    #[test]
    fn test_parse_rejects_invalid_entries() {
        let raw = r#"
            [channels]
            "default/orders" = [{ subscriber = "ftp://billing.local/" }]
        "#;
        assert!(parse(Path::new("channels.toml"), raw).is_err());
        assert!(parse(Path::new("channels.toml"), "[channels]\n\"bad\" = []").is_err());
    }

    #[tokio::test]
    async fn test_poll_applies_only_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.toml");
        std::fs::write(&path, ORDERS).unwrap();

        let bus = InMemoryBus::new();
        let dispatcher = dispatcher(&bus);
        let mut source = FileSource::new(&path, Duration::from_secs(1));

        let report = source.poll_once(&dispatcher).await.unwrap().unwrap();
        assert_eq!(report.added, 1);
        assert!(source.poll_once(&dispatcher).await.unwrap().is_none());

        std::fs::write(&path, "[channels]\n").unwrap();
        let report = source.poll_once(&dispatcher).await.unwrap().unwrap();
        assert_eq!(report.removed, 1);
        assert!(dispatcher.snapshot().is_empty());

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_file_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.toml");
        std::fs::write(&path, ORDERS).unwrap();

        let bus = InMemoryBus::new();
        let dispatcher = dispatcher(&bus);
        let mut source = FileSource::new(&path, Duration::from_secs(1));
        source.poll_once(&dispatcher).await.unwrap();

        std::fs::write(&path, "channels = 42").unwrap();
        assert!(source.poll_once(&dispatcher).await.is_err());
        assert_eq!(dispatcher.snapshot().len(), 1);

        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_incomplete_apply_is_resynced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.toml");
        std::fs::write(&path, ORDERS).unwrap();

        let bus = InMemoryBus::new();
        bus.fail_subscriptions("channels.default.orders", true);
        let dispatcher = dispatcher(&bus);
        let mut source = FileSource::new(&path, Duration::from_secs(1));

        let report = source.poll_once(&dispatcher).await.unwrap().unwrap();
        assert_eq!(report.failures.len(), 1);

        bus.fail_subscriptions("channels.default.orders", false);
        let report = source.poll_once(&dispatcher).await.unwrap().unwrap();
        assert_eq!(report.added, 1);
        assert!(source.poll_once(&dispatcher).await.unwrap().is_none());

        dispatcher.stop().await;
    }
}
