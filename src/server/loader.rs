//! Configuration loading
//!
//! Handles loading configuration from embedded defaults, files, and environment.

use super::config::AppConfig;
use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../../config/default.toml");

/// Load configuration from files and environment, with `extra` (from
/// `--config`) layered above the config directory files.
pub fn load_config(extra: Option<&str>) -> Result<AppConfig> {
    let mut builder = Config::builder()
        // 1. Embedded defaults (always available)
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        // 2. External overrides (optional)
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            File::with_name(&format!(
                "config/{}",
                std::env::var("CHANBRIDGE_ENV").unwrap_or_else(|_| "development".to_string())
            ))
            .required(false),
        )
        .add_source(File::with_name("config/local").required(false));

    if let Some(path) = extra {
        builder = builder.add_source(File::with_name(path).required(true));
    }

    // 3. Environment variables (highest priority), e.g.
    // CHANBRIDGE_DISPATCHER__BUS__URL
    let config = builder
        .add_source(
            Environment::with_prefix("CHANBRIDGE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}
