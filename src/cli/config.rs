//! CLI configuration inspection
//!
//! Provides `chanbridge config {show,check}`.

use crate::server::desired_state;
use crate::server::load_config;
use anyhow::{Context, Result};
use clap::Subcommand;
use std::path::Path;

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the configuration and the desired-state file
    Check {
        /// Desired-state file (overrides desired_state.path)
        #[arg(short, long)]
        desired_state: Option<String>,
    },
}

pub fn run(extra: Option<&str>, cmd: ConfigCommands) -> Result<()> {
    let config = load_config(extra).context("Failed to load configuration")?;
    match cmd {
        ConfigCommands::Show => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{}", rendered);
            Ok(())
        }
        ConfigCommands::Check { desired_state } => {
            config
                .dispatcher
                .validate()
                .context("Invalid dispatcher configuration")?;
            println!("configuration: ok (bus {})", config.dispatcher.bus.url);

            match desired_state.or(config.desired_state.path) {
                Some(path) => {
                    let path = Path::new(&path);
                    let raw = std::fs::read_to_string(path)
                        .with_context(|| format!("Failed to read {}", path.display()))?;
                    let desired = desired_state::parse(path, &raw)?;
                    println!(
                        "desired state: ok ({} subscriptions across {} channels)",
                        desired.subscription_count(),
                        desired.channels.len()
                    );
                }
                None => println!("desired state: not configured"),
            }
            Ok(())
        }
    }
}
