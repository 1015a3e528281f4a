//! Delivery targets and the HTTP forwarder
//!
//! A subscription has up to three targets (subscriber, reply, dead-letter).
//! All of them go through one [`Forwarder`] capability; the target tag only
//! changes logging, metrics and which headers are attached.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::config::DeliveryConfig;
use crate::error::Result;
use crate::model::{Message, SubscriptionSpec};
use crate::retry::RetryConfig;

/// Header naming the endpoint that failed, added to dead-lettered messages
pub const ERROR_DEST_HEADER: &str = "x-chanbridge-error-dest";

/// Header carrying the last HTTP status, added to dead-lettered messages
pub const ERROR_CODE_HEADER: &str = "x-chanbridge-error-code";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Where an outbound request goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTarget {
    /// The subscriber endpoint
    Subscriber(Url),
    /// Sink for subscriber responses
    Reply(Url),
    /// Sink for undeliverable messages
    DeadLetter(Url),
}

impl DeliveryTarget {
    /// Endpoint URI
    #[must_use]
    pub fn uri(&self) -> &Url {
        match self {
            Self::Subscriber(uri) | Self::Reply(uri) | Self::DeadLetter(uri) => uri,
        }
    }

    /// Target kind, for logs and metrics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Subscriber(_) => "subscriber",
            Self::Reply(_) => "reply",
            Self::DeadLetter(_) => "dead_letter",
        }
    }
}

impl fmt::Display for DeliveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.uri())
    }
}

/// The targets of one subscription, selected by which URIs are present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Targets {
    /// Always present
    pub subscriber: DeliveryTarget,
    /// Present when the subscription has a reply URI
    pub reply: Option<DeliveryTarget>,
    /// Present when the subscription has a dead-letter URI
    pub dead_letter: Option<DeliveryTarget>,
}

impl From<&SubscriptionSpec> for Targets {
    fn from(spec: &SubscriptionSpec) -> Self {
        Self {
            subscriber: DeliveryTarget::Subscriber(spec.subscriber_uri.clone()),
            reply: spec.reply_uri.clone().map(DeliveryTarget::Reply),
            dead_letter: spec.dead_letter_uri.clone().map(DeliveryTarget::DeadLetter),
        }
    }
}

/// Body and headers of one outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    /// Request body, passed through unmodified
    pub payload: Bytes,
    /// Request headers
    pub headers: HashMap<String, String>,
}

impl Outbound {
    /// The message as sent to its subscriber
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        Self {
            payload: message.payload.clone(),
            headers: message.headers.clone(),
        }
    }

    /// The original message, annotated with why it is being dead-lettered
    #[must_use]
    pub fn dead_letter(message: &Message, failed: &DeliveryTarget, error: &DeliveryError) -> Self {
        let mut outbound = Self::from_message(message);
        outbound
            .headers
            .insert(ERROR_DEST_HEADER.to_string(), failed.uri().to_string());
        if let Some(status) = error.status() {
            outbound
                .headers
                .insert(ERROR_CODE_HEADER.to_string(), status.to_string());
        }
        outbound
    }

    /// A subscriber response, to be forwarded to the reply target.
    ///
    /// Only `content-type` and CloudEvents (`ce-*`) headers are kept.
    #[must_use]
    pub fn reply(response: &DeliveryResponse) -> Self {
        let headers = response
            .headers
            .iter()
            .filter(|(name, _)| {
                let name = name.to_ascii_lowercase();
                name == "content-type" || name.starts_with("ce-")
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Self {
            payload: response.body.clone(),
            headers,
        }
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResponse {
    /// HTTP status
    pub status: u16,
    /// Response body, possibly empty
    pub body: Bytes,
    /// Response headers (names lowercased)
    pub headers: HashMap<String, String>,
}

impl DeliveryResponse {
    /// Response with status only
    #[must_use]
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            body: Bytes::new(),
            headers: HashMap::new(),
        }
    }

    /// Response carrying a body
    #[must_use]
    pub fn with_body(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
            headers: HashMap::new(),
        }
    }
}

/// Why one delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Endpoint unreachable or connection dropped
    #[error("connection failed: {0}")]
    Connect(String),

    /// No response within the request timeout
    #[error("request timed out")]
    Timeout,

    /// Endpoint answered with a non-2xx status
    #[error("endpoint returned status {0}")]
    Status(u16),

    /// Request could not be built
    #[error("invalid request: {0}")]
    Request(String),
}

impl DeliveryError {
    /// HTTP status, if the endpoint answered
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status(status) => Some(*status),
            _ => None,
        }
    }

    /// Whether another attempt may succeed under `policy`.
    #[must_use]
    pub fn is_retryable(&self, policy: &RetryConfig) -> bool {
        match self {
            Self::Connect(_) | Self::Timeout => true,
            Self::Status(status) => policy.is_retryable_status(*status),
            Self::Request(_) => false,
        }
    }
}

/// Sends one outbound request to one target.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Perform a single attempt; retry decisions belong to the caller.
    async fn forward(
        &self,
        target: &DeliveryTarget,
        outbound: &Outbound,
    ) -> std::result::Result<DeliveryResponse, DeliveryError>;
}

/// [`Forwarder`] that POSTs over HTTP(S).
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    /// Build the HTTP client with the configured timeouts
    pub fn new(config: &DeliveryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| crate::Error::HttpClient(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    /// Use an existing client
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn request_headers(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => debug!(header = %name, "Skipping header that is not valid HTTP"),
        }
    }
    if !map.contains_key(CONTENT_TYPE) {
        map.insert(CONTENT_TYPE, HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
    }
    map
}

fn classify(error: reqwest::Error) -> DeliveryError {
    if error.is_timeout() {
        DeliveryError::Timeout
    } else if error.is_builder() {
        DeliveryError::Request(error.to_string())
    } else {
        DeliveryError::Connect(error.to_string())
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        target: &DeliveryTarget,
        outbound: &Outbound,
    ) -> std::result::Result<DeliveryResponse, DeliveryError> {
        let response = self
            .client
            .post(target.uri().clone())
            .headers(request_headers(&outbound.headers))
            .body(outbound.payload.clone())
            .send()
            .await
            .map_err(classify)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        if !response.status().is_success() {
            return Err(DeliveryError::Status(status));
        }

        let body = response.bytes().await.map_err(classify)?;
        Ok(DeliveryResponse {
            status,
            body,
            headers,
        })
    }
}
