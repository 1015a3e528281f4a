//! `chanbridge publish`: put one message on a channel subject.
//!
//! Useful for smoke-testing subscriptions without an upstream producer.

use crate::server::config::AppConfig;
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use chanbridge_core::ChannelId;
use clap::Args;
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Channel as `namespace/name`
    pub channel: String,
    /// Inline payload
    pub payload: Option<String>,
    /// Read the payload from a file instead
    #[arg(short, long, conflicts_with = "payload")]
    pub file: Option<PathBuf>,
    /// Message header as `key=value` (repeatable)
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,
}

fn parse_header(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => bail!("Header '{}' is not in key=value form", raw),
    }
}

fn parse_headers(raw: &[String]) -> Result<HashMap<String, String>> {
    raw.iter().map(|h| parse_header(h)).collect()
}

fn read_payload(args: &PublishArgs) -> Result<Bytes> {
    match (&args.payload, &args.file) {
        (_, Some(path)) => {
            let data = std::fs::read(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(Bytes::from(data))
        }
        (Some(inline), None) => Ok(Bytes::from(inline.clone())),
        (None, None) => Ok(Bytes::new()),
    }
}

#[cfg(feature = "nats")]
pub async fn run(config: &AppConfig, args: PublishArgs) -> Result<()> {
    use chanbridge_bus::{Bus, NatsBus};

    let channel: ChannelId = args.channel.parse()?;
    let headers = parse_headers(&args.headers)?;
    let payload = read_payload(&args)?;
    let subject = channel.subject(&config.dispatcher.bus.subject_prefix);

    let bus = NatsBus::connect(config.dispatcher.bus.nats())
        .await
        .with_context(|| format!("Failed to connect to bus at {}", config.dispatcher.bus.url))?;
    let size = payload.len();
    let published = bus.publish(&subject, payload, headers).await;
    bus.close().await;
    published.with_context(|| format!("Failed to publish to {}", subject))?;

    println!("published {} bytes to {} ({})", size, channel, subject);
    Ok(())
}

#[cfg(not(feature = "nats"))]
pub async fn run(_config: &AppConfig, args: PublishArgs) -> Result<()> {
    let _: ChannelId = args.channel.parse()?;
    parse_headers(&args.headers)?;
    read_payload(&args)?;
    bail!("publish needs a bus connection; rebuild with the `nats` feature")
}
