//! # Cache Configuration
//!
//! Sizing and tuning knobs for the cache strategies, plus the factory that
//! turns them into a ready-to-open [`CacheStrategy`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circular::{CircularCache, DEFAULT_SEEK_WAIT_THRESHOLD};
use crate::double::DoubleCache;
use crate::error::{CacheError, CacheResult};
use crate::file_cache::{SimpleFileCache, DEFAULT_SEEK_MARGIN};
use crate::strategy::CacheStrategy;

/// Which strategy a configuration produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    /// Temporary file, unbounded.
    File,
    /// One ring buffer.
    Circular,
    /// Two ring buffers swapped on seeks.
    DoubleCircular,
}

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total memory for one ring buffer in bytes. Zero selects the file cache.
    ///
    /// Default: 20 MiB.
    pub memory_size: usize,

    /// Share of `memory_size` kept as history behind the read cursor.
    ///
    /// Default: 0.25.
    pub back_buffer_ratio: f32,

    /// Wrap the ring buffer in a double cache.
    ///
    /// Default: true.
    pub double_cache: bool,

    /// Bytes requested from the source per read.
    ///
    /// Default: 128 KiB.
    pub chunk_size: usize,

    /// How far past the cached end a ring buffer seek waits for the producer.
    ///
    /// Default: 100 000 bytes.
    pub seek_wait_threshold: u64,

    /// How far past the written data a file cache seek is still attempted.
    ///
    /// Default: 500 000 bytes.
    pub file_seek_margin: u64,

    /// How long a near-forward seek waits for the producer.
    ///
    /// Default: 5 seconds.
    pub seek_wait_timeout: Duration,

    /// How long a read waits for data before reporting a timeout.
    ///
    /// Default: 5 seconds.
    pub read_timeout: Duration,

    /// Directory for the file cache's backing file. Platform temp dir if unset.
    pub temp_dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_size: 20 * 1024 * 1024,
            back_buffer_ratio: 0.25,
            double_cache: true,
            chunk_size: 128 * 1024,
            seek_wait_threshold: DEFAULT_SEEK_WAIT_THRESHOLD,
            file_seek_margin: DEFAULT_SEEK_MARGIN,
            seek_wait_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            temp_dir: None,
        }
    }
}

impl CacheConfig {
    /// Configuration backed by a temporary file instead of memory.
    pub fn low_memory() -> Self {
        Self {
            memory_size: 0,
            double_cache: false,
            ..Default::default()
        }
    }

    /// Default configuration with a ring buffer of `memory_size` bytes.
    pub fn with_memory_size(memory_size: usize) -> Self {
        Self {
            memory_size,
            ..Default::default()
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match (self.memory_size, self.double_cache) {
            (0, _) => StrategyKind::File,
            (_, false) => StrategyKind::Circular,
            (_, true) => StrategyKind::DoubleCircular,
        }
    }

    /// Back buffer size in bytes.
    pub fn back_size(&self) -> usize {
        (self.memory_size as f64 * self.back_buffer_ratio as f64) as usize
    }

    /// Front (read-ahead) buffer size in bytes.
    pub fn front_size(&self) -> usize {
        self.memory_size - self.back_size()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> CacheResult<()> {
        if self.chunk_size == 0 {
            return Err(CacheError::InvalidConfig("chunk_size must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.back_buffer_ratio) {
            return Err(CacheError::InvalidConfig(
                "back_buffer_ratio must be in [0.0, 1.0)".to_string(),
            ));
        }
        if self.memory_size > 0 && self.front_size() == 0 {
            return Err(CacheError::InvalidConfig(format!(
                "memory_size {} leaves no room for a front buffer",
                self.memory_size
            )));
        }
        Ok(())
    }

    /// Build an unopened cache strategy for this configuration.
    pub fn build_strategy(&self) -> CacheResult<Box<dyn CacheStrategy>> {
        self.validate()?;
        let strategy: Box<dyn CacheStrategy> = match self.kind() {
            StrategyKind::File => {
                let cache = SimpleFileCache::new()
                    .with_max_write_size(self.chunk_size)
                    .with_seek_margin(self.file_seek_margin, self.seek_wait_timeout);
                match &self.temp_dir {
                    Some(dir) => Box::new(cache.in_dir(dir.clone())),
                    None => Box::new(cache),
                }
            }
            StrategyKind::Circular => Box::new(self.circular()),
            StrategyKind::DoubleCircular => Box::new(DoubleCache::new(Box::new(self.circular()))),
        };
        Ok(strategy)
    }

    fn circular(&self) -> CircularCache {
        CircularCache::new(self.front_size(), self.back_size())
            .with_seek_wait(self.seek_wait_threshold, self.seek_wait_timeout)
    }
}
