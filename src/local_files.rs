//! ALFA Photos Sync - On-Disk Envelope Cache
//!
//! Two areas under the storage root, `thumbs/` and `originals/`, each holding
//! one encrypted envelope per record, named by the record's opaque name.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{PrivateFileError, VaultError, VaultResult};

/// Which resolution of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    Thumb,
    Original,
}

impl Resolution {
    pub fn dir(self) -> &'static str {
        match self {
            Resolution::Thumb => "thumbs",
            Resolution::Original => "originals",
        }
    }

    pub fn is_thumb(self) -> bool {
        self == Resolution::Thumb
    }
}

/// Cache usage summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub thumbs: usize,
    pub originals: usize,
    pub total_bytes: u64,
}

/// Envelope cache rooted at a storage directory
#[derive(Debug, Clone)]
pub struct LocalFiles {
    root: PathBuf,
}

impl LocalFiles {
    /// Create the cache, making both areas if needed
    pub fn new(root: &Path) -> VaultResult<Self> {
        for res in [Resolution::Thumb, Resolution::Original] {
            fs::create_dir_all(root.join(res.dir())).map_err(VaultError::Cache)?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full path for `name`; rejects anything that is not a plain file name
    pub fn path(&self, res: Resolution, name: &str) -> VaultResult<PathBuf> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(['/', '\\', '\0'])
        {
            return Err(PrivateFileError::InvalidPath.into());
        }
        Ok(self.root.join(res.dir()).join(name))
    }

    pub fn write(&self, res: Resolution, name: &str, data: &[u8]) -> VaultResult<()> {
        atomic_write(&self.path(res, name)?, data)
    }

    pub fn read(&self, res: Resolution, name: &str) -> VaultResult<Vec<u8>> {
        let path = self.path(res, name)?;
        if !path.exists() {
            return Err(VaultError::NotFound(format!("{}/{}", res.dir(), name)));
        }
        fs::read(&path).map_err(VaultError::Cache)
    }

    pub fn open(&self, res: Resolution, name: &str) -> VaultResult<File> {
        let path = self.path(res, name)?;
        File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => VaultError::NotFound(format!("{}/{}", res.dir(), name)),
            _ => VaultError::Cache(e),
        })
    }

    pub fn exists(&self, res: Resolution, name: &str) -> bool {
        self.path(res, name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Overwrite with zeros, then unlink. Missing files are not an error.
    pub fn evict(&self, res: Resolution, name: &str) -> VaultResult<bool> {
        let path = self.path(res, name)?;
        if !path.exists() {
            return Ok(false);
        }
        wipe(&path)?;
        debug!(name, area = res.dir(), "Evicted cached envelope");
        Ok(true)
    }

    /// Evict both resolutions
    pub fn evict_all(&self, name: &str) -> VaultResult<()> {
        self.evict(Resolution::Thumb, name)?;
        self.evict(Resolution::Original, name)?;
        Ok(())
    }

    /// File names present in one area
    pub fn list(&self, res: Resolution) -> VaultResult<Vec<String>> {
        let mut names = Vec::new();
        for entry in WalkDir::new(self.root.join(res.dir()))
            .min_depth(1)
            .max_depth(1)
        {
            let entry = entry.map_err(|e| VaultError::Cache(e.into()))?;
            if entry.file_type().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn stats(&self) -> VaultResult<CacheStats> {
        let mut stats = CacheStats::default();
        for res in [Resolution::Thumb, Resolution::Original] {
            for entry in WalkDir::new(self.root.join(res.dir())).min_depth(1) {
                let entry = entry.map_err(|e| VaultError::Cache(e.into()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let len = entry.metadata().map_err(|e| VaultError::Cache(e.into()))?.len();
                stats.total_bytes += len;
                match res {
                    Resolution::Thumb => stats.thumbs += 1,
                    Resolution::Original => stats.originals += 1,
                }
            }
        }
        Ok(stats)
    }
}

/// Temp file in the same directory, fsync, then rename over the target
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> VaultResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(VaultError::Cache)?;
    }

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or(PrivateFileError::InvalidPath)?;
    let temp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .map_err(VaultError::write)?;
    file.write_all(data).map_err(VaultError::write)?;
    file.sync_all().map_err(VaultError::write)?;

    fs::rename(&temp_path, path).map_err(VaultError::write)?;
    Ok(())
}

fn wipe(path: &Path) -> VaultResult<()> {
    let size = fs::metadata(path).map_err(VaultError::Cache)?.len() as usize;
    if size > 0 {
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(VaultError::Cache)?;
        let zeros = vec![0u8; size.min(1024 * 1024)];
        let mut remaining = size;
        while remaining > 0 {
            let n = remaining.min(zeros.len());
            file.write_all(&zeros[..n]).map_err(VaultError::Cache)?;
            remaining -= n;
        }
        file.sync_all().map_err(VaultError::Cache)?;
    }
    fs::remove_file(path).map_err(VaultError::Cache)
}
