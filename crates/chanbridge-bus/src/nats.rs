//! NATS JetStream bus
//!
//! One stream captures `<subject_prefix>.>`; every subscription is a durable
//! pull consumer with explicit acknowledgment, filtered to one channel
//! subject. New consumers start at new messages; a resumed durable consumer
//! continues from its stored position.

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, DeliverPolicy},
    stream,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{BusStats, ConnectionState, StatsCounters};
use crate::message::{BusMessage, Delivery};
use crate::{validate_subject, Bus, Error, Result, Subscription, SubscriptionHandle};

/// NATS connection settings
#[derive(Debug, Clone, Serialize)]
pub struct NatsConfig {
    /// Server URL, e.g. `nats://localhost:4222`
    pub url: String,
    /// Cluster identifier, used as the client connection name
    pub cluster_id: String,
    /// JetStream stream holding every channel subject
    pub stream_name: String,
    /// Subject prefix shared by every channel
    pub subject_prefix: String,
    /// How long the server waits for an ack before redelivering
    pub ack_wait: Duration,
}

/// [`Bus`] backed by NATS JetStream.
pub struct NatsBus {
    client: async_nats::Client,
    context: jetstream::Context,
    stream: stream::Stream,
    ack_wait: Duration,
    connection: Arc<watch::Sender<ConnectionState>>,
    counters: Arc<StatsCounters>,
    handles: Arc<Mutex<HashMap<Uuid, String>>>,
}

impl NatsBus {
    /// Connect to the server and make sure the channel stream exists.
    ///
    /// Fails if the server is unreachable; later connection loss is reported
    /// through [`Bus::connection_state`] instead.
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let (connection, _) = watch::channel(ConnectionState::Reconnecting);
        let connection = Arc::new(connection);
        let counters = Arc::new(StatsCounters::default());
        let handles = Arc::new(Mutex::new(HashMap::new()));

        let events_connection = connection.clone();
        let events_counters = counters.clone();
        let events_handles = handles.clone();
        let client = async_nats::ConnectOptions::new()
            .name(config.cluster_id.clone())
            .event_callback(move |event| {
                let connection = events_connection.clone();
                let counters = events_counters.clone();
                let handles = events_handles.clone();
                async move {
                    on_client_event(&event, &connection, &counters, &handles);
                }
            })
            .connect(config.url.as_str())
            .await
            .map_err(|e| Error::Connection(format!("{}: {}", config.url, e)))?;
        connection.send_replace(ConnectionState::Connected);

        let context = jetstream::new(client.clone());
        let stream = context
            .get_or_create_stream(stream::Config {
                name: config.stream_name.clone(),
                subjects: vec![format!("{}.>", config.subject_prefix)],
                ..Default::default()
            })
            .await
            .map_err(|e| Error::Connection(format!("stream {}: {}", config.stream_name, e)))?;

        info!(
            url = %config.url,
            cluster_id = %config.cluster_id,
            stream = %config.stream_name,
            "Connected to NATS JetStream"
        );

        Ok(Self {
            client,
            context,
            stream,
            ack_wait: config.ack_wait,
            connection,
            counters,
            handles,
        })
    }

    fn active_count(&self) -> u64 {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).len() as u64
    }
}

/// Track connection state from client events. Handles die with the
/// connection; the reconnect counter moves before watchers see `Connected`.
fn on_client_event(
    event: &async_nats::Event,
    connection: &watch::Sender<ConnectionState>,
    counters: &StatsCounters,
    handles: &Mutex<HashMap<Uuid, String>>,
) {
    match event {
        async_nats::Event::Connected => {
            let mut reconnected = false;
            connection.send_if_modified(|state| {
                let previous = *state;
                if previous == ConnectionState::Disconnected {
                    StatsCounters::inc(&counters.reconnects);
                    reconnected = true;
                }
                *state = ConnectionState::Connected;
                previous != ConnectionState::Connected
            });
            if reconnected {
                info!("NATS connection re-established");
            }
        }
        async_nats::Event::Disconnected => {
            let dropped = {
                let mut handles = handles.lock().unwrap_or_else(|e| e.into_inner());
                let dropped = handles.len();
                handles.clear();
                dropped
            };
            connection.send_replace(ConnectionState::Disconnected);
            warn!(handles = dropped, "NATS connection lost");
        }
        other => debug!(event = ?other, "NATS client event"),
    }
}

fn header_map(headers: &async_nats::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, values)| {
            values
                .first()
                .map(|value| (name.to_string(), value.as_str().to_string()))
        })
        .collect()
}

fn into_delivery(message: jetstream::Message, counters: Arc<StatsCounters>) -> Delivery {
    let (sequence, redelivered) = message
        .info()
        .map(|info| (info.stream_sequence, info.delivered > 1))
        .unwrap_or((0, false));
    let bus_message = BusMessage {
        subject: message.subject.to_string(),
        payload: message.payload.clone(),
        headers: message.headers.as_ref().map(header_map).unwrap_or_default(),
        sequence,
        redelivered,
    };
    StatsCounters::inc(&counters.delivered);

    Delivery::new(bus_message, move || {
        async move {
            match message.ack().await {
                Ok(()) => {
                    StatsCounters::inc(&counters.acked);
                    Ok(())
                }
                Err(e) => Err(Error::Ack(e.to_string())),
            }
        }
        .boxed()
    })
}

#[async_trait]
impl Bus for NatsBus {
    async fn subscribe(&self, subject: &str, durable_name: &str) -> Result<Subscription> {
        StatsCounters::inc(&self.counters.subscribe_calls);
        validate_subject(subject)?;

        let subscribe_error = |e: String| Error::Subscribe {
            subject: subject.to_string(),
            message: e,
        };

        let consumer: jetstream::consumer::PullConsumer = self
            .stream
            .get_or_create_consumer(
                durable_name,
                pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    deliver_policy: DeliverPolicy::New,
                    ack_wait: self.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| subscribe_error(e.to_string()))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| subscribe_error(e.to_string()))?;

        let handle = SubscriptionHandle::new(subject, durable_name);
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.id, durable_name.to_string());

        let counters = self.counters.clone();
        let durable = durable_name.to_string();
        let messages = messages
            .filter_map(move |item| {
                let counters = counters.clone();
                let durable = durable.clone();
                async move {
                    match item {
                        Ok(message) => Some(into_delivery(message, counters)),
                        Err(e) => {
                            warn!(durable = %durable, error = %e, "JetStream consumer error");
                            None
                        }
                    }
                }
            })
            .boxed();

        debug!(subject = %subject, durable = %durable_name, "Durable consumer opened");
        Ok(Subscription { handle, messages })
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        StatsCounters::inc(&self.counters.unsubscribe_calls);
        let known = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.id)
            .is_some();
        if !known {
            debug!(durable = %handle.durable_name, "Unsubscribe for unknown handle ignored");
            return Ok(());
        }

        self.stream
            .delete_consumer(&handle.durable_name)
            .await
            .map_err(|e| Error::Unsubscribe {
                durable_name: handle.durable_name.clone(),
                message: e.to_string(),
            })?;
        debug!(durable = %handle.durable_name, "Durable consumer deleted");
        Ok(())
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: HashMap<String, String>,
    ) -> Result<()> {
        validate_subject(subject)?;

        let mut header_map = async_nats::HeaderMap::new();
        for (name, value) in &headers {
            header_map.insert(name.as_str(), value.as_str());
        }

        let ack = self
            .context
            .publish_with_headers(subject.to_string(), header_map, payload)
            .await
            .map_err(|e| Error::Publish(e.to_string()))?;
        ack.await.map_err(|e| Error::Publish(e.to_string()))?;

        StatsCounters::inc(&self.counters.published);
        Ok(())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    fn stats(&self) -> BusStats {
        self.counters
            .snapshot(*self.connection.borrow(), self.active_count())
    }

    async fn close(&self) {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush NATS connection on close");
        }
        self.connection.send_replace(ConnectionState::Closed);
        info!("NATS connection released");
    }
}
