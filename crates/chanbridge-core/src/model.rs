//! Data model: channel identity, subscription specs, desired state, messages.

use bytes::Bytes;
use chanbridge_bus::BusMessage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::{Error, Result};

/// Namespace-qualified channel identity, written `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId {
    namespace: String,
    name: String,
}

impl ChannelId {
    /// Create a channel id; both parts become bus subject tokens.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();
        if !valid_token(&namespace) || !valid_token(&name) {
            return Err(Error::InvalidChannelId(format!("{}/{}", namespace, name)));
        }
        Ok(Self { namespace, name })
    }

    /// Channel namespace
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Channel name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bus subject carrying this channel's messages
    #[must_use]
    pub fn subject(&self, prefix: &str) -> String {
        format!("{}.{}.{}", prefix, self.namespace, self.name)
    }
}

fn valid_token(token: &str) -> bool {
    !token.is_empty()
        && !token
            .chars()
            .any(|c| matches!(c, '/' | '.' | '*' | '>') || c.is_whitespace())
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for ChannelId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('/') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Err(Error::InvalidChannelId(s.to_string())),
        }
    }
}

impl TryFrom<String> for ChannelId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.to_string()
    }
}

/// Where one channel's messages must be delivered.
///
/// Equality is structural: two specs with the same URIs are the same
/// subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    /// Subscriber endpoint
    #[serde(rename = "subscriber")]
    pub subscriber_uri: Url,
    /// Where subscriber responses are forwarded
    #[serde(rename = "reply", default, skip_serializing_if = "Option::is_none")]
    pub reply_uri: Option<Url>,
    /// Where undeliverable messages are forwarded
    #[serde(rename = "dead_letter", default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_uri: Option<Url>,
}

impl SubscriptionSpec {
    /// Spec with only a subscriber endpoint
    #[must_use]
    pub fn new(subscriber_uri: Url) -> Self {
        Self {
            subscriber_uri,
            reply_uri: None,
            dead_letter_uri: None,
        }
    }

    /// Set the reply endpoint
    #[must_use]
    pub fn with_reply(mut self, reply_uri: Url) -> Self {
        self.reply_uri = Some(reply_uri);
        self
    }

    /// Set the dead-letter endpoint
    #[must_use]
    pub fn with_dead_letter(mut self, dead_letter_uri: Url) -> Self {
        self.dead_letter_uri = Some(dead_letter_uri);
        self
    }

    /// Reject URIs the HTTP forwarder cannot reach.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let uris = std::iter::once(("subscriber", &self.subscriber_uri))
            .chain(self.reply_uri.iter().map(|u| ("reply", u)))
            .chain(self.dead_letter_uri.iter().map(|u| ("dead_letter", u)));
        for (field, uri) in uris {
            if !matches!(uri.scheme(), "http" | "https") {
                return Err(format!("{} uri {} is not http(s)", field, uri));
            }
            if uri.host_str().is_none() {
                return Err(format!("{} uri {} has no host", field, uri));
            }
        }
        Ok(())
    }
}

impl fmt::Display for SubscriptionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.subscriber_uri)
    }
}

/// Durable consumer name for one (channel, subscription) pair.
///
/// Stable across restarts so the bus can resume delivery where it stopped.
#[must_use]
pub fn durable_name(channel: &ChannelId, spec: &SubscriptionSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(channel.to_string().as_bytes());
    for uri in [
        Some(&spec.subscriber_uri),
        spec.reply_uri.as_ref(),
        spec.dead_letter_uri.as_ref(),
    ] {
        hasher.update(b"\n");
        if let Some(uri) = uri {
            hasher.update(uri.as_str().as_bytes());
        }
    }
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}-{}", channel.namespace, channel.name, &digest[..16])
}

/// Externally declared target: for each channel, the subscriptions that
/// must be live. Superseded wholesale by the next snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    /// Channel to subscription set
    #[serde(default)]
    pub channels: HashMap<ChannelId, HashSet<SubscriptionSpec>>,
}

impl DesiredState {
    /// Empty desired state (no channels)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: declare `channel` with `specs`
    #[must_use]
    pub fn with_channel(
        mut self,
        channel: ChannelId,
        specs: impl IntoIterator<Item = SubscriptionSpec>,
    ) -> Self {
        self.channels
            .entry(channel)
            .or_default()
            .extend(specs);
        self
    }

    /// Subscriptions declared for `channel`
    #[must_use]
    pub fn subscriptions(&self, channel: &ChannelId) -> Option<&HashSet<SubscriptionSpec>> {
        self.channels.get(channel)
    }

    /// Total number of declared subscriptions
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.channels.values().map(HashSet::len).sum()
    }

    /// Channels mapped to an empty set are dropped; they and absent channels
    /// mean the same thing.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.channels.retain(|_, specs| !specs.is_empty());
        self
    }

    /// Check every entry. One bad entry rejects the snapshot.
    pub fn validate(&self) -> Result<()> {
        for (channel, specs) in &self.channels {
            for spec in specs {
                spec.validate()
                    .map_err(|message| Error::InvalidDesiredState {
                        channel: channel.to_string(),
                        message,
                    })?;
            }
        }
        Ok(())
    }
}

/// A message consumed from a channel. Read-only to the dispatch worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel the message was published on
    pub channel: ChannelId,
    /// Opaque payload
    pub payload: Bytes,
    /// Header/metadata map
    pub headers: HashMap<String, String>,
    /// Bus delivery sequence marker
    pub sequence: u64,
    /// Whether the bus already delivered it once
    pub redelivered: bool,
}

impl Message {
    /// Build from a bus message consumed on `channel`
    #[must_use]
    pub fn from_bus(channel: ChannelId, message: BusMessage) -> Self {
        Self {
            channel,
            payload: message.payload,
            headers: message.headers,
            sequence: message.sequence,
            redelivered: message.redelivered,
        }
    }
}
