//! StratoFS Configuration
//!
//! Cache locations, mount options, chunking and upload tuning. Every
//! field has a default so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main StratoFS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local cache layout
    #[serde(default)]
    pub cache: CacheConfig,

    /// Mount options
    #[serde(default)]
    pub mount: MountConfig,

    /// Chunking of materialized content
    #[serde(default)]
    pub chunks: ChunkConfig,

    /// Remote listing refresh
    #[serde(default)]
    pub refresh: RefreshConfig,

    /// Upload pipeline tuning
    #[serde(default)]
    pub upload: UploadConfig,

    /// Remote store location
    #[serde(default)]
    pub remote: RemoteConfig,
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root of the local cache (staging, chunks and state live below it)
    #[serde(default = "default_cache_location")]
    pub location: PathBuf,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Default mount path
    #[serde(default = "default_mount_path")]
    pub path: PathBuf,

    /// Allow other users to access the mount
    #[serde(default = "default_true")]
    pub allow_other: bool,
}

/// Chunk configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Chunk size in bytes (default 4MB)
    #[serde(default = "default_chunk_size")]
    pub size: u64,
}

/// Refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// Delay between remote listing refreshes in milliseconds (0 = never)
    #[serde(default = "default_refresh_delay_ms")]
    pub delay_ms: u64,
}

/// Upload pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum number of uploads running at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Per-job timeout in seconds
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,

    /// Delay before a failed upload is queued again, in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Delay after mounting before pending uploads are resumed
    #[serde(default = "default_resume_delay_ms")]
    pub resume_delay_ms: u64,
}

/// Remote store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Root directory of the directory-backed object store
    #[serde(default = "default_remote_root")]
    pub root: PathBuf,
}

// Default value functions
fn default_cache_location() -> PathBuf {
    PathBuf::from("/tmp/cache")
}

fn default_mount_path() -> PathBuf {
    PathBuf::from("/tmp/mnt")
}

fn default_true() -> bool {
    true
}

fn default_chunk_size() -> u64 {
    4 * 1024 * 1024 // 4MB
}

fn default_refresh_delay_ms() -> u64 {
    60_000
}

fn default_max_concurrent() -> usize {
    4
}

fn default_upload_timeout_secs() -> u64 {
    2 * 60 * 60
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_resume_delay_ms() -> u64 {
    8000
}

fn default_remote_root() -> PathBuf {
    PathBuf::from("/var/lib/stratofs/remote")
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            location: default_cache_location(),
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            path: default_mount_path(),
            allow_other: default_true(),
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size: default_chunk_size(),
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_refresh_delay_ms(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_upload_timeout_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            resume_delay_ms: default_resume_delay_ms(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            root: default_remote_root(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.chunks.size == 0 {
            return Err(Error::Config("chunks.size must be greater than zero".into()));
        }

        if self.upload.max_concurrent == 0 {
            return Err(Error::Config(
                "upload.max_concurrent must be at least 1".into(),
            ));
        }

        if self.upload.timeout_secs == 0 {
            return Err(Error::Config("upload.timeout_secs cannot be zero".into()));
        }

        Ok(())
    }

    /// Staging area for in-progress writes
    pub fn upload_dir(&self) -> PathBuf {
        self.cache.location.join("upload")
    }

    /// Materialized chunk area
    pub fn download_dir(&self) -> PathBuf {
        self.cache.location.join("download")
    }

    /// Snapshot and ledger directory
    pub fn state_dir(&self) -> PathBuf {
        self.cache.location.join("state")
    }

    /// Create the cache directory layout
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.upload_dir(), self.download_dir(), self.state_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Get the refresh period, if periodic refresh is enabled
    pub fn refresh_interval(&self) -> Option<Duration> {
        match self.refresh.delay_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Get the per-job upload timeout as Duration
    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload.timeout_secs)
    }

    /// Get the retry delay as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.upload.retry_delay_ms)
    }

    /// Get the resume delay as Duration
    pub fn resume_delay(&self) -> Duration {
        Duration::from_millis(self.upload.resume_delay_ms)
    }
}
