//! CLI module for chanbridge
//!
//! Provides commands:
//! - `run`: Start the dispatcher (default)
//! - `publish`: Publish one message to a channel
//! - `config`: Show or check the effective configuration

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::server::load_config;

pub mod config;
pub mod publish;

/// Bridges channel messages on a durable bus to HTTP subscribers
#[derive(Parser, Debug)]
#[command(name = "chanbridge")]
#[command(about = "Channel dispatcher for HTTP subscribers")]
#[command(version)]
pub struct Cli {
    /// Extra configuration file, layered over config/ and under the
    /// environment
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the dispatcher
    Run {
        /// Desired-state file (overrides desired_state.path)
        #[arg(short, long)]
        desired_state: Option<String>,
    },
    /// Publish one message to a channel
    Publish(publish::PublishArgs),
    /// Inspect the configuration
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

/// Run the CLI command
pub async fn run(cli: Cli) -> Result<()> {
    let extra = cli.config.as_deref();
    match cli.command {
        Some(Commands::Run { desired_state }) => {
            let mut config = load_config(extra).context("Failed to load configuration")?;
            if desired_state.is_some() {
                config.desired_state.path = desired_state;
            }
            crate::server::run(config).await
        }
        Some(Commands::Publish(args)) => {
            let config = load_config(extra).context("Failed to load configuration")?;
            publish::run(&config, args).await
        }
        Some(Commands::Config(cmd)) => config::run(extra, cmd),
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "chanbridge",
            "run",
            "--desired-state",
            "channels.toml",
            "--config",
            "prod.toml",
        ])
        .unwrap();

        assert_eq!(cli.config.as_deref(), Some("prod.toml"));
        match cli.command {
            Some(Commands::Run { desired_state }) => {
                assert_eq!(desired_state.as_deref(), Some("channels.toml"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_publish() {
        let cli = Cli::try_parse_from([
            "chanbridge",
            "publish",
            "default/orders",
            "{}",
            "-H",
            "ce-type=order.created",
        ])
        .unwrap();

        match cli.command {
            Some(Commands::Publish(args)) => {
                assert_eq!(args.channel, "default/orders");
                assert_eq!(args.payload.as_deref(), Some("{}"));
                assert_eq!(args.headers, vec!["ce-type=order.created".to_string()]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        <Cli as clap::CommandFactory>::command().debug_assert();
    }
}
