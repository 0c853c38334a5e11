//! ALFA Photos Sync - Configuration
//!
//! Persisted as JSON. Missing fields fall back to defaults; a missing file
//! yields the default configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::KdfParams;
use crate::envelope::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::error::{VaultError, VaultResult};
use crate::thumbs::DEFAULT_THUMB_SIZE;
use crate::transport::RetryPolicy;

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Holds `thumbs/`, `originals/` and `db/index.db`
    pub storage_root: PathBuf,
    /// Plaintext bytes per envelope chunk
    pub chunk_size: u32,
    /// Thumbnail edge in pixels
    pub thumb_size: u32,
    /// Concurrent downloads per cycle
    pub max_concurrent_downloads: usize,
    pub retry: RetryPolicy,
    /// Argon2 profile for the server-side password hash
    pub storage_kdf: KdfParams,
    /// Argon2 profile for wrapping the private key
    pub wrap_kdf: KdfParams,
    /// Event channel capacity
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("alfa_photos"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            thumb_size: DEFAULT_THUMB_SIZE,
            max_concurrent_downloads: 4,
            retry: RetryPolicy::default(),
            storage_kdf: KdfParams::interactive(),
            wrap_kdf: KdfParams::moderate(),
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    /// Load from `path`, or defaults when the file does not exist
    pub fn load(path: &Path) -> VaultResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let data = std::fs::read(path).map_err(VaultError::read)?;
        let config: Self = serde_json::from_slice(&data)
            .map_err(|e| VaultError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> VaultResult<()> {
        self.validate()?;
        let data = serde_json::to_vec_pretty(self)?;
        crate::local_files::atomic_write(path, &data)
    }

    pub fn index_path(&self) -> PathBuf {
        self.storage_root.join("db").join("index.db")
    }

    /// Reject values the codec, thumbnailer or KDF cannot honour
    pub fn validate(&self) -> VaultResult<()> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(VaultError::Config(format!(
                "chunk_size must be within 1..={MAX_CHUNK_SIZE}"
            )));
        }
        if !(16..=4096).contains(&self.thumb_size) {
            return Err(VaultError::Config("thumb_size must be within 16..=4096".into()));
        }
        if !(1..=64).contains(&self.max_concurrent_downloads) {
            return Err(VaultError::Config(
                "max_concurrent_downloads must be within 1..=64".into(),
            ));
        }
        if self.retry.max_attempts == 0 || self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(VaultError::Config(
                "retry needs max_attempts >= 1 and base_delay_ms <= max_delay_ms".into(),
            ));
        }
        for (label, kdf) in [("storage_kdf", &self.storage_kdf), ("wrap_kdf", &self.wrap_kdf)] {
            if kdf.time_cost == 0 || kdf.parallelism == 0 || kdf.memory_cost_kib < 8 * kdf.parallelism
            {
                return Err(VaultError::Config(format!("{label} is out of range")));
            }
        }
        if self.event_capacity == 0 {
            return Err(VaultError::Config("event_capacity must be positive".into()));
        }
        Ok(())
    }
}
