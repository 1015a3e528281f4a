//! Process shell for chanbridge
//!
//! Everything the dispatcher engine needs to run as a service.
//!
//! # Module Structure
//!
//! - `config`: Process configuration (dispatcher, metrics, desired state)
//! - `loader`: Configuration loading from files and environment
//! - `desired_state`: File-backed desired-state source
//! - `metrics`: Health, metrics and registry endpoints
//! - `shutdown`: Termination signal handling
//! - `init`: Startup and main run loop

pub mod config;
pub mod desired_state;
mod init;
mod loader;
pub mod metrics;
mod shutdown;

// Re-export public API
pub use init::run;
pub use loader::load_config;
