//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Deepest level the quadtree can address: node columns and rows at depth
/// `d` span `0..2^d` and must fit in a `u32`.
pub const MAX_TERRAIN_DEPTH: u8 = 32;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Terrain extent and level-of-detail settings.
    pub terrain: TerrainConfig,
    /// Patch streaming and memory budget settings.
    pub streaming: StreamingConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Terrain extent and level-of-detail configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TerrainConfig {
    /// Horizontal `[x, z]` position of the root node's minimum corner.
    pub origin: [f32; 2],
    /// Side length of the square terrain, in world units.
    pub size: f32,
    /// Height range assumed for nodes before their data is resident.
    pub initial_height_range: [f32; 2],
    /// Maximum subdivision depth (root = 0).
    pub max_depth: u8,
    /// Maximum acceptable screen-space error, in pixels.
    pub error_threshold: f32,
    /// Number of grid cells per patch side; blocks hold `(n + 1)²` samples.
    pub patch_resolution: u32,
    /// How many levels a rendered node may lag behind its ideal depth before
    /// it is reported as stale.
    pub max_lag_levels: u8,
    /// Height returned by collision queries where no data is resident.
    pub fallback_height: f32,
    /// Vertical field of view of the viewer, in degrees.
    pub vertical_fov_degrees: f32,
    /// Viewport height in pixels.
    pub viewport_height: u32,
}

/// Patch streaming configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamingConfig {
    /// Ceiling for resident patch data, in bytes.
    pub budget_bytes: usize,
    /// Maximum number of load jobs in flight at once.
    pub max_concurrent_loads: usize,
    /// Worker thread count (0 = derive from the CPU count).
    pub worker_threads: usize,
    /// Retries after the first failed load before a node is permanently degraded.
    pub max_load_retries: u32,
    /// Frames to wait before each retry. The last entry repeats when there are
    /// more retries than entries.
    pub retry_backoff_frames: Vec<u64>,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            origin: [0.0, 0.0],
            size: 4096.0,
            initial_height_range: [0.0, 256.0],
            max_depth: 8,
            error_threshold: 2.0,
            patch_resolution: 32,
            max_lag_levels: 3,
            fallback_height: 0.0,
            vertical_fov_degrees: 60.0,
            viewport_height: 1080,
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 256 * 1024 * 1024, // 256 MB
            max_concurrent_loads: 16,
            worker_threads: 0,
            max_load_retries: 3,
            retry_backoff_frames: vec![4, 16, 64],
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl StreamingConfig {
    /// Backoff before the retry that follows the `attempt`-th failure (1-based).
    pub fn backoff_for_attempt(&self, attempt: u32) -> u64 {
        let index = (attempt.max(1) - 1) as usize;
        self.retry_backoff_frames
            .get(index)
            .or_else(|| self.retry_backoff_frames.last())
            .copied()
            .unwrap_or(0)
    }

    /// Resolved worker thread count: the configured value, or the CPU count
    /// minus headroom for the main and render threads.
    pub fn resolved_worker_threads(&self, cpus: usize) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            cpus.saturating_sub(2).max(1)
        }
    }
}

// --- Validation ---

impl Config {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let terrain = &self.terrain;
        if !(terrain.size.is_finite() && terrain.size > 0.0) {
            return Err(ConfigError::Invalid {
                field: "terrain.size",
                reason: "must be a positive finite number",
            });
        }
        if terrain.initial_height_range[0] > terrain.initial_height_range[1] {
            return Err(ConfigError::Invalid {
                field: "terrain.initial_height_range",
                reason: "minimum must not exceed maximum",
            });
        }
        if terrain.max_depth > MAX_TERRAIN_DEPTH {
            return Err(ConfigError::Invalid {
                field: "terrain.max_depth",
                reason: "must not exceed 32",
            });
        }
        if !(terrain.error_threshold.is_finite() && terrain.error_threshold > 0.0) {
            return Err(ConfigError::Invalid {
                field: "terrain.error_threshold",
                reason: "must be a positive finite number",
            });
        }
        if terrain.patch_resolution == 0 {
            return Err(ConfigError::Invalid {
                field: "terrain.patch_resolution",
                reason: "must be at least 1",
            });
        }
        if !(terrain.vertical_fov_degrees > 0.0 && terrain.vertical_fov_degrees < 180.0) {
            return Err(ConfigError::Invalid {
                field: "terrain.vertical_fov_degrees",
                reason: "must lie in (0, 180)",
            });
        }
        if self.streaming.max_concurrent_loads == 0 {
            return Err(ConfigError::Invalid {
                field: "streaming.max_concurrent_loads",
                reason: "must be at least 1",
            });
        }
        if self.streaming.retry_backoff_frames.is_empty() {
            return Err(ConfigError::Invalid {
                field: "streaming.retry_backoff_frames",
                reason: "must contain at least one entry",
            });
        }
        Ok(())
    }
}

// --- Load / Save / Reload ---

/// Platform configuration directory for the engine.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("tessera"))
}

/// File name of the persisted configuration inside a config directory.
pub const CONFIG_FILE_NAME: &str = "config.ron";

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
    ron::from_str(&contents).map_err(ConfigError::ParseError)
}

impl Config {
    /// Load `config.ron` from `config_dir`, writing the defaults there first
    /// when no file exists yet.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Wrote default terrain config to {}", path.display());
            return Ok(config);
        }

        let config = read_config(&path)?;
        log::info!("Loaded terrain config from {}", path.display());
        Ok(config)
    }

    /// Persist as pretty-printed RON, creating `config_dir` if needed.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .struct_names(false)
            .enumerate_arrays(false);
        let text = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE_NAME), text).map_err(ConfigError::WriteError)
    }

    /// Re-read the file on disk. `Some` carries the new settings when they
    /// differ from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = read_config(&config_dir.join(CONFIG_FILE_NAME))?;
        if fresh == *self {
            return Ok(None);
        }
        log::info!("Terrain config changed on disk");
        Ok(Some(fresh))
    }
}
