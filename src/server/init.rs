//! Process startup and main run loop
//!
//! Contains the `run()` function that wires the dispatcher, the metrics
//! endpoint and the desired-state source together.

use super::config::AppConfig;
use super::desired_state::FileSource;
use super::{metrics, shutdown};
use anyhow::{Context, Result};
use chanbridge_core::Dispatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long auxiliary tasks get to finish after the dispatcher drained
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(feature = "nats")]
async fn connect(config: &AppConfig) -> Result<Dispatcher> {
    Dispatcher::connect(&config.dispatcher)
        .await
        .with_context(|| format!("Failed to connect to bus at {}", config.dispatcher.bus.url))
}

#[cfg(not(feature = "nats"))]
async fn connect(config: &AppConfig) -> Result<Dispatcher> {
    warn!("Built without the `nats` feature; using the in-process bus");
    let bus = Arc::new(chanbridge_bus::InMemoryBus::new());
    Ok(Dispatcher::with_http(&config.dispatcher, bus)?)
}

/// Run the dispatcher until a termination signal arrives
pub async fn run(config: AppConfig) -> Result<()> {
    config
        .dispatcher
        .validate()
        .context("Invalid dispatcher configuration")?;

    info!(
        bus = %config.dispatcher.bus.url,
        cluster_id = %config.dispatcher.bus.cluster_id,
        subject_prefix = %config.dispatcher.bus.subject_prefix,
        "Connecting to bus"
    );
    let dispatcher = Arc::new(connect(&config).await?);
    info!("Bus connected");

    let shutdown = CancellationToken::new();
    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    if config.metrics.enabled {
        let listener = metrics::bind(&config.metrics).await?;
        let dispatcher = Arc::clone(&dispatcher);
        let token = shutdown.clone();
        tasks.push((
            "metrics",
            tokio::spawn(async move {
                if let Err(e) = metrics::serve(listener, dispatcher, token).await {
                    error!("{:#}", e);
                }
            }),
        ));
    } else {
        info!("Metrics endpoint disabled");
    }

    match &config.desired_state.path {
        Some(path) => {
            let mut source = FileSource::new(path, config.desired_state.poll_interval());
            // The first snapshot must be readable and valid; later ones are
            // only logged when rejected.
            let report = source
                .poll_once(&dispatcher)
                .await
                .with_context(|| format!("Failed to apply initial desired state from {}", path))?;
            if let Some(report) = report {
                info!(
                    added = report.added,
                    failed = report.failures.len(),
                    "Initial desired state applied"
                );
            }
            tasks.push((
                "desired-state",
                tokio::spawn(source.run(Arc::clone(&dispatcher), shutdown.clone())),
            ));
        }
        None => warn!("No desired_state.path configured; no subscriptions will be created"),
    }

    shutdown::cancel_on_signal(shutdown.clone());

    let result = dispatcher.start(shutdown.clone()).await;

    // The dispatcher can also return on its own, so release everything else
    shutdown.cancel();
    for (name, task) in tasks {
        match tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{} task failed: {}", name, e),
            Err(_) => warn!("{} task did not stop in time", name),
        }
    }

    result.context("Dispatcher stopped with an error")?;
    info!("chanbridge shutdown complete");
    Ok(())
}
