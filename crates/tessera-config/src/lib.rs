//! Configuration system for the Tessera terrain engine.
//!
//! Settings persist to disk as RON files, accept CLI overrides via clap,
//! support hot-reload detection, and tolerate missing or unknown fields.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE_NAME, Config, DebugConfig, MAX_TERRAIN_DEPTH, StreamingConfig, TerrainConfig,
    default_config_dir,
};
pub use error::ConfigError;
