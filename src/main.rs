//! Chanbridge - Channel Dispatcher
//!
//! CLI entry point for the chanbridge dispatcher.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod server;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "chanbridge=info,chanbridge_core=info,chanbridge_bus=info,tower_http=info".into());

    // CHANBRIDGE_LOG_FORMAT=json for log shippers
    let json = std::env::var("CHANBRIDGE_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let cli = cli::Cli::parse();
    cli::run(cli).await
}
