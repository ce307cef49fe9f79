//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Tessera command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "tessera", about = "Streaming terrain quadtree")]
pub struct CliArgs {
    /// Maximum quadtree depth.
    #[arg(long)]
    pub max_depth: Option<u8>,

    /// Maximum acceptable screen-space error in pixels.
    #[arg(long)]
    pub error_threshold: Option<f32>,

    /// Patch store budget in megabytes.
    #[arg(long)]
    pub budget_mb: Option<usize>,

    /// Maximum number of concurrent load jobs.
    #[arg(long)]
    pub max_concurrent_loads: Option<usize>,

    /// Worker thread count (0 = derive from CPU count).
    #[arg(long)]
    pub worker_threads: Option<usize>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Number of frames to simulate.
    #[arg(long, default_value_t = 600)]
    pub frames: u64,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(depth) = args.max_depth {
            self.terrain.max_depth = depth;
        }
        if let Some(threshold) = args.error_threshold {
            self.terrain.error_threshold = threshold;
        }
        if let Some(mb) = args.budget_mb {
            self.streaming.budget_bytes = mb * 1024 * 1024;
        }
        if let Some(loads) = args.max_concurrent_loads {
            self.streaming.max_concurrent_loads = loads;
        }
        if let Some(threads) = args.worker_threads {
            self.streaming.worker_threads = threads;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            max_depth: Some(5),
            budget_mb: Some(64),
            log_level: Some("debug".to_string()),
            ..Default::default()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.terrain.max_depth, 5);
        assert_eq!(config.streaming.budget_bytes, 64 * 1024 * 1024);
        assert_eq!(config.debug.log_level, "debug");
        // Non-overridden fields retain defaults
        assert_eq!(config.streaming.max_concurrent_loads, 16);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from([
            "tessera",
            "--error-threshold",
            "8.5",
            "--max-concurrent-loads",
            "4",
            "--frames",
            "10",
        ]);
        assert_eq!(args.error_threshold, Some(8.5));
        assert_eq!(args.max_concurrent_loads, Some(4));
        assert_eq!(args.frames, 10);
        assert!(args.max_depth.is_none());
    }
}
