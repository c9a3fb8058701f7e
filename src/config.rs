//! Configuration for shmcache
//!
//! Centralized configuration with sensible defaults.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CacheError, Result};

/// Main configuration for opening a cache segment
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Segment Identity
    // -------------------------------------------------------------------------
    /// Directory holding the named segment objects.
    /// A segment called `name` is backed by `{shm_dir}/{name}`.
    pub shm_dir: PathBuf,

    /// Segment name, unique per `shm_dir`
    pub name: String,

    // -------------------------------------------------------------------------
    // Geometry (only used when the segment is created)
    // -------------------------------------------------------------------------
    /// Total size of the segment in bytes
    pub total_size: u64,

    /// Size class of every block in the pool
    pub block_size: BlockSize,

    // -------------------------------------------------------------------------
    // Guard Configuration
    // -------------------------------------------------------------------------
    /// Upper bound on waiting for the segment lock (milliseconds)
    pub lock_timeout_ms: u64,

    /// Busy-spin rounds before the guard starts yielding and sleeping
    pub lock_spin_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shm_dir: default_shm_dir(),
            name: "shmcache".to_string(),
            total_size: 1024 * 1024, // 1 MB
            block_size: BlockSize::B64,
            lock_timeout_ms: 1000,
            lock_spin_limit: 64,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Path of the backing object for this config's segment
    pub fn segment_path(&self) -> PathBuf {
        self.shm_dir.join(&self.name)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// `/dev/shm` where available (tmpfs, never touches disk), else the temp dir
fn default_shm_dir() -> PathBuf {
    let dev_shm = Path::new("/dev/shm");
    if dev_shm.is_dir() {
        dev_shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the directory holding segment objects
    pub fn shm_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.shm_dir = path.into();
        self
    }

    /// Set the segment name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the total segment size (in bytes)
    pub fn total_size(mut self, size: u64) -> Self {
        self.config.total_size = size;
        self
    }

    /// Set the block size class
    pub fn block_size(mut self, block_size: BlockSize) -> Self {
        self.config.block_size = block_size;
        self
    }

    /// Set the lock acquisition budget (in milliseconds)
    pub fn lock_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lock_timeout_ms = ms;
        self
    }

    /// Set the number of busy-spin rounds before backing off
    pub fn lock_spin_limit(mut self, rounds: u32) -> Self {
        self.config.lock_spin_limit = rounds;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

// =============================================================================
// Block Size Classes
// =============================================================================

/// Supported block sizes, 64 B up to 16 KB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlockSize {
    #[default]
    B64,
    B128,
    B256,
    B512,
    K1,
    K2,
    K4,
    K8,
    K16,
}

impl BlockSize {
    pub const ALL: [BlockSize; 9] = [
        BlockSize::B64,
        BlockSize::B128,
        BlockSize::B256,
        BlockSize::B512,
        BlockSize::K1,
        BlockSize::K2,
        BlockSize::K4,
        BlockSize::K8,
        BlockSize::K16,
    ];

    /// log2 of the block size
    pub const fn shift(self) -> u32 {
        match self {
            BlockSize::B64 => 6,
            BlockSize::B128 => 7,
            BlockSize::B256 => 8,
            BlockSize::B512 => 9,
            BlockSize::K1 => 10,
            BlockSize::K2 => 11,
            BlockSize::K4 => 12,
            BlockSize::K8 => 13,
            BlockSize::K16 => 14,
        }
    }

    pub const fn bytes(self) -> u32 {
        1 << self.shift()
    }

    pub fn from_bytes(bytes: u32) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|b| b.bytes() == bytes)
            .ok_or_else(|| {
                CacheError::invalid(format!(
                    "block size {} is not a power of two between 64 and 16384",
                    bytes
                ))
            })
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.bytes())
    }
}
