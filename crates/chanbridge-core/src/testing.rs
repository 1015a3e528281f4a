//! Shared helpers for unit tests

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;

use crate::delivery::{DeliveryError, DeliveryResponse, DeliveryTarget, Forwarder, Outbound};

pub(crate) fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

/// Poll `check` until it holds, panicking after roughly five seconds.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Forwarder that records every request. Responses are scripted per URI and
/// default to `200` with an empty body.
#[derive(Default)]
pub(crate) struct RecordingForwarder {
    calls: Mutex<Vec<(DeliveryTarget, Outbound)>>,
    scripted: Mutex<HashMap<Url, VecDeque<Result<DeliveryResponse, DeliveryError>>>>,
    delay: Option<Duration>,
}

impl RecordingForwarder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub(crate) fn script(&self, uri: &Url, responses: Vec<Result<DeliveryResponse, DeliveryError>>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(uri.clone())
            .or_default()
            .extend(responses);
    }

    pub(crate) fn calls_to(&self, uri: &Url) -> Vec<Outbound> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(target, _)| target.uri() == uri)
            .map(|(_, outbound)| outbound.clone())
            .collect()
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Forwarder for RecordingForwarder {
    async fn forward(
        &self,
        target: &DeliveryTarget,
        outbound: &Outbound,
    ) -> Result<DeliveryResponse, DeliveryError> {
        self.calls
            .lock()
            .unwrap()
            .push((target.clone(), outbound.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(target.uri())
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| Ok(DeliveryResponse::empty(200)))
    }
}
