use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

const CONFIG_DIR_NAME: &str = "comicat";
const CONFIG_FILE_NAME: &str = "engine.json";

/// Every tunable of the engine. Missing keys fall back to their defaults, so a
/// config file only needs the values it wants to change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub import: ImportConfig,
    pub pools: PoolConfig,
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Decoded pages held by a reading session.
    pub page_capacity: usize,
    /// Import metadata entries held before the oldest quarter is evicted.
    pub metadata_capacity: usize,
    /// Preloaded archive summaries and cover previews, pruned the same way.
    pub preload_capacity: usize,
    /// How many pages on each side of the current one are prefetched.
    pub prefetch_radius: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_capacity: 50,
            metadata_capacity: 100,
            preload_capacity: 100,
            prefetch_radius: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub batch_size: usize,
    /// Pause between batches so decoded buffers can be released.
    pub batch_pause_ms: u64,
    pub enable_caching: bool,
    /// Forces the fast strategy for every file.
    pub prioritize_speed: bool,
    /// Files above this size use the fast strategy.
    pub fast_threshold_bytes: u64,
    /// Files below this size use the thorough strategy.
    pub thorough_threshold_bytes: u64,
    /// Pages sampled by the cover and orientation analysis.
    pub analysis_sample_pages: usize,
    pub enable_preloading: bool,
    /// Longest edge of preloaded cover previews.
    pub preview_edge: u32,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_pause_ms: 100,
            enable_caching: true,
            prioritize_speed: false,
            fast_threshold_bytes: 100 * 1024 * 1024,
            thorough_threshold_bytes: 10 * 1024 * 1024,
            analysis_sample_pages: 8,
            enable_preloading: true,
            preview_edge: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Concurrent archive extractions.
    pub io_workers: usize,
    /// Decode/analysis threads; 0 means one per logical CPU.
    pub cpu_workers: usize,
    pub background_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            io_workers: 4,
            cpu_workers: 0,
            background_workers: 2,
        }
    }
}

impl PoolConfig {
    pub fn resolved_cpu_workers(&self) -> usize {
        if self.cpu_workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.cpu_workers
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub open_ms: u64,
    pub decode_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            open_ms: 30_000,
            decode_ms: 15_000,
        }
    }
}

impl TimeoutConfig {
    pub fn open(&self) -> Duration {
        Duration::from_millis(self.open_ms)
    }

    pub fn decode(&self) -> Duration {
        Duration::from_millis(self.decode_ms)
    }
}

impl EngineConfig {
    /// Load a JSON config file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&json)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `<config dir>/comicat/engine.json`, or the defaults when it does
    /// not exist.
    pub fn load_default() -> Result<Self> {
        match default_config_path() {
            Some(path) if path.exists() => {
                log::info!("Loading engine config from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.page_capacity == 0 {
            return Err(Error::Config("cache.page_capacity must be at least 1".into()));
        }
        if self.cache.metadata_capacity == 0 {
            return Err(Error::Config(
                "cache.metadata_capacity must be at least 1".into(),
            ));
        }
        if self.cache.preload_capacity == 0 {
            return Err(Error::Config("cache.preload_capacity must be at least 1".into()));
        }
        if self.import.preview_edge == 0 {
            return Err(Error::Config("import.preview_edge must be at least 1".into()));
        }
        if self.import.batch_size == 0 {
            return Err(Error::Config("import.batch_size must be at least 1".into()));
        }
        if self.pools.io_workers == 0 || self.pools.background_workers == 0 {
            return Err(Error::Config("worker pools need at least one worker".into()));
        }
        if self.import.thorough_threshold_bytes > self.import.fast_threshold_bytes {
            return Err(Error::Config(
                "import.thorough_threshold_bytes exceeds import.fast_threshold_bytes".into(),
            ));
        }
        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}
