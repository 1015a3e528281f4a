//! End-to-end dispatch over the in-process bus and real HTTP subscribers.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::Router;
use chanbridge_bus::{Bus, InMemoryBus};
use chanbridge_core::{
    durable_name, ChannelId, DesiredState, Dispatcher, DispatcherConfig, SubscriptionSpec,
    ERROR_CODE_HEADER, ERROR_DEST_HEADER,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
struct Recorded {
    path: String,
    headers: HeaderMap,
    body: Bytes,
}

#[derive(Clone)]
struct Reply {
    status: u16,
    body: &'static str,
    headers: Vec<(&'static str, &'static str)>,
}

impl Reply {
    fn status(status: u16) -> Self {
        Self {
            status,
            body: "",
            headers: Vec::new(),
        }
    }
}

/// HTTP endpoint that records every request and answers from a per-path
/// script (200 once the script runs out).
#[derive(Default)]
struct Recorder {
    requests: Mutex<Vec<Recorded>>,
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
}

impl Recorder {
    fn script(&self, path: &str, replies: impl IntoIterator<Item = Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .extend(replies);
    }

    fn requests_to(&self, path: &str) -> Vec<Recorded> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }
}

async fn record(
    State(recorder): State<Arc<Recorder>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, HeaderMap, Bytes) {
    let path = uri.path().to_string();
    recorder.requests.lock().unwrap().push(Recorded {
        path: path.clone(),
        headers,
        body,
    });

    let reply = recorder
        .scripts
        .lock()
        .unwrap()
        .get_mut(&path)
        .and_then(|queue| queue.pop_front())
        .unwrap_or_else(|| Reply::status(200));

    let mut headers = HeaderMap::new();
    for (name, value) in reply.headers {
        headers.insert(name, value.parse().unwrap());
    }
    (
        StatusCode::from_u16(reply.status).unwrap(),
        headers,
        Bytes::from_static(reply.body.as_bytes()),
    )
}

struct Harness {
    bus: InMemoryBus,
    dispatcher: Dispatcher,
    recorder: Arc<Recorder>,
    base: Url,
}

impl Harness {
    async fn new() -> Self {
        let recorder = Arc::new(Recorder::default());
        let app = Router::new()
            .fallback(record)
            .with_state(Arc::clone(&recorder));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut config = DispatcherConfig::default();
        config.delivery.retry.max_attempts = 4;
        config.delivery.retry.initial_delay = Duration::from_millis(5);
        config.delivery.retry.max_delay = Duration::from_millis(20);
        config.delivery.retry.jitter = false;
        config.delivery.request_timeout_ms = 2_000;

        let bus = InMemoryBus::new();
        let dispatcher = Dispatcher::with_http(&config, Arc::new(bus.clone())).unwrap();

        Self {
            bus,
            dispatcher,
            recorder,
            base: Url::parse(&format!("http://{}/", addr)).unwrap(),
        }
    }

    fn url(&self, path: &str) -> Url {
        self.base.join(path).unwrap()
    }

    async fn publish(&self, channel: &ChannelId, payload: &'static str, headers: &[(&str, &str)]) {
        let headers = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.bus
            .publish(
                &channel.subject("channels"),
                Bytes::from_static(payload.as_bytes()),
                headers,
            )
            .await
            .unwrap();
    }

    async fn wait_acked(&self, channel: &ChannelId, spec: &SubscriptionSpec, count: usize) {
        let durable = durable_name(channel, spec);
        for _ in 0..1000 {
            if self.bus.acked(&durable).len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{} never acked {} messages", durable, count);
    }
}

fn orders() -> ChannelId {
    ChannelId::new("default", "orders").unwrap()
}

#[tokio::test]
async fn test_fan_out_survives_one_failing_subscriber() {
    let h = Harness::new().await;
    let channel = orders();
    let billing = SubscriptionSpec::new(h.url("billing"));
    let audit = SubscriptionSpec::new(h.url("audit"));

    h.recorder.script("/audit", [Reply::status(503)]);

    let desired = DesiredState::new().with_channel(channel.clone(), [billing.clone(), audit.clone()]);
    let report = h.dispatcher.apply_desired_state(desired).await.unwrap();
    assert_eq!(report.added, 2);

    h.publish(&channel, "order-1", &[]).await;
    h.wait_acked(&channel, &billing, 1).await;
    h.wait_acked(&channel, &audit, 1).await;

    assert_eq!(h.recorder.requests_to("/billing").len(), 1);
    // one transient failure, then success
    assert_eq!(h.recorder.requests_to("/audit").len(), 2);
    assert_eq!(h.recorder.requests_to("/audit")[1].body, "order-1");

    let stats = h.dispatcher.metrics().snapshot();
    assert_eq!(stats.delivered, 2);
    assert_eq!(stats.dead_lettered, 0);

    h.dispatcher.stop().await;
}

#[tokio::test]
async fn test_flaky_subscriber_is_retried_until_success() {
    let h = Harness::new().await;
    let channel = orders();
    let spec = SubscriptionSpec::new(h.url("flaky"));

    h.recorder.script(
        "/flaky",
        [Reply::status(500), Reply::status(500), Reply::status(500)],
    );

    h.dispatcher
        .apply_desired_state(DesiredState::new().with_channel(channel.clone(), [spec.clone()]))
        .await
        .unwrap();

    h.publish(&channel, "payload", &[]).await;
    h.wait_acked(&channel, &spec, 1).await;

    assert_eq!(h.recorder.requests_to("/flaky").len(), 4);
    assert_eq!(h.dispatcher.metrics().snapshot().delivery_attempts, 4);

    h.dispatcher.stop().await;
}

#[tokio::test]
async fn test_exhausted_message_is_dead_lettered_once() {
    let h = Harness::new().await;
    let channel = orders();
    let spec = SubscriptionSpec::new(h.url("broken")).with_dead_letter(h.url("dlq"));

    h.recorder.script("/broken", std::iter::repeat(Reply::status(502)).take(4));

    h.dispatcher
        .apply_desired_state(DesiredState::new().with_channel(channel.clone(), [spec.clone()]))
        .await
        .unwrap();

    h.publish(&channel, "lost", &[("ce-id", "42")]).await;
    h.wait_acked(&channel, &spec, 1).await;

    assert_eq!(h.recorder.requests_to("/broken").len(), 4);
    let dead = h.recorder.requests_to("/dlq");
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, "lost");
    assert_eq!(dead[0].headers["ce-id"], "42");
    assert_eq!(dead[0].headers[ERROR_CODE_HEADER], "502");
    assert_eq!(
        dead[0].headers[ERROR_DEST_HEADER].to_str().unwrap(),
        h.url("broken").as_str()
    );
    assert_eq!(h.dispatcher.metrics().snapshot().dead_lettered, 1);

    h.dispatcher.stop().await;
}

#[tokio::test]
async fn test_headers_pass_through_and_reply_is_forwarded() {
    let h = Harness::new().await;
    let channel = orders();
    let spec = SubscriptionSpec::new(h.url("echo")).with_reply(h.url("replies"));

    h.recorder.script(
        "/echo",
        [Reply {
            status: 200,
            body: "pong",
            headers: vec![
                ("content-type", "text/plain"),
                ("ce-type", "order.ack"),
                ("x-internal", "secret"),
            ],
        }],
    );

    h.dispatcher
        .apply_desired_state(DesiredState::new().with_channel(channel.clone(), [spec.clone()]))
        .await
        .unwrap();

    h.publish(
        &channel,
        "ping",
        &[("content-type", "application/json"), ("ce-type", "order.created")],
    )
    .await;
    h.wait_acked(&channel, &spec, 1).await;

    let delivered = h.recorder.requests_to("/echo");
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].body, "ping");
    assert_eq!(delivered[0].headers["content-type"], "application/json");
    assert_eq!(delivered[0].headers["ce-type"], "order.created");

    let replies = h.recorder.requests_to("/replies");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].body, "pong");
    assert_eq!(replies[0].headers["ce-type"], "order.ack");
    assert_eq!(replies[0].headers["content-type"], "text/plain");
    assert!(!replies[0].headers.contains_key("x-internal"));

    h.dispatcher.stop().await;
}

#[tokio::test]
async fn test_removed_subscription_stops_receiving() {
    let h = Harness::new().await;
    let channel = orders();
    let spec = SubscriptionSpec::new(h.url("gone"));

    h.dispatcher
        .apply_desired_state(DesiredState::new().with_channel(channel.clone(), [spec.clone()]))
        .await
        .unwrap();
    h.publish(&channel, "first", &[]).await;
    h.wait_acked(&channel, &spec, 1).await;

    let report = h
        .dispatcher
        .apply_desired_state(DesiredState::new().with_channel(channel.clone(), []))
        .await
        .unwrap();
    assert_eq!(report.removed, 1);
    assert!(h.dispatcher.snapshot().is_empty());

    h.publish(&channel, "second", &[]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.recorder.requests_to("/gone").len(), 1);

    h.dispatcher.stop().await;
}
