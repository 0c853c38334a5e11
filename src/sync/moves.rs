//! User-initiated set changes and cache access
//!
//! Every mutation here is notify-then-apply: the server must accept the
//! change before the local index is touched.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::{now_millis, SyncContext};
use crate::error::{VaultError, VaultResult};
use crate::events::IndexChanges;
use crate::local_files::Resolution;
use crate::model::{FileRecord, FileSet, IndexPath, RecordKind};
use crate::transport::Request;

impl SyncContext {
    /// Move `names` between Gallery and Trash
    #[instrument(skip(self, names, cancel), fields(count = names.len()))]
    pub async fn move_files(
        &self,
        names: &[String],
        from: FileSet,
        to: FileSet,
        cancel: &CancellationToken,
    ) -> VaultResult<Vec<FileRecord>> {
        let unsupported = || VaultError::UnsupportedMove {
            from: from.to_string(),
            to: to.to_string(),
        };
        let from_kind = RecordKind::try_from(from).map_err(|_| unsupported())?;
        let to_kind = RecordKind::try_from(to).map_err(|_| unsupported())?;
        if from_kind == to_kind {
            return Err(unsupported());
        }
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let _cycle = self.cycle.lock().await;
        let token = self.token()?;
        let old_paths = self.paths_in(from_kind, names)?;

        let request = match to_kind {
            RecordKind::Trash => Request::Trash {
                token,
                names: names.to_vec(),
            },
            RecordKind::Gallery => Request::Restore {
                token,
                names: names.to_vec(),
            },
        };
        let call = request.name();
        self.retry
            .run(call, cancel, || self.transport.send(request.clone()))
            .await?
            .into_payload(call)?;

        let moved = self
            .store
            .move_files(names, from_kind, to_kind, &now_millis().to_string())?;
        let new_paths = self.paths_in(to_kind, names)?;

        self.notify(
            from_kind,
            IndexChanges {
                deleted: old_paths,
                ..Default::default()
            },
        );
        self.notify(
            to_kind,
            IndexChanges {
                inserted: new_paths,
                ..Default::default()
            },
        );
        info!(count = moved.len(), from = %from_kind, to = %to_kind, "Moved files");
        Ok(moved)
    }

    /// Permanently delete trashed files
    #[instrument(skip(self, names, cancel), fields(count = names.len()))]
    pub async fn delete_files(
        &self,
        names: &[String],
        cancel: &CancellationToken,
    ) -> VaultResult<usize> {
        if names.is_empty() {
            return Ok(0);
        }

        let _cycle = self.cycle.lock().await;
        let token = self.token()?;
        let old_paths = self.paths_in(RecordKind::Trash, names)?;

        let request = Request::Delete {
            token,
            names: names.to_vec(),
        };
        self.retry
            .run("delete", cancel, || self.transport.send(request.clone()))
            .await?
            .into_payload("delete")?;

        let removed = self.remove_local(names);
        self.notify(
            RecordKind::Trash,
            IndexChanges {
                deleted: old_paths,
                ..Default::default()
            },
        );
        info!(removed, "Deleted files");
        Ok(removed)
    }

    /// Permanently delete everything in Trash
    #[instrument(skip_all)]
    pub async fn empty_trash(&self, cancel: &CancellationToken) -> VaultResult<usize> {
        let _cycle = self.cycle.lock().await;
        let token = self.token()?;
        let names: Vec<String> = self
            .store
            .list(RecordKind::Trash)?
            .into_iter()
            .map(|r| r.name)
            .collect();
        let old_paths = self.paths_in(RecordKind::Trash, &names)?;

        let request = Request::EmptyTrash {
            token,
            time: now_millis(),
        };
        self.retry
            .run("empty_trash", cancel, || self.transport.send(request.clone()))
            .await?
            .into_payload("empty_trash")?;

        let removed = self.remove_local(&names);
        self.notify(
            RecordKind::Trash,
            IndexChanges {
                deleted: old_paths,
                ..Default::default()
            },
        );
        info!(removed, "Emptied trash");
        Ok(removed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CACHE
    // ═══════════════════════════════════════════════════════════════════════

    /// Download the original of `name` if it is not cached. Returns false
    /// when it is already cached or already being downloaded.
    #[instrument(skip(self, cancel))]
    pub async fn fetch_original(&self, name: &str, cancel: &CancellationToken) -> VaultResult<bool> {
        let token = self.token()?;
        let (kind, _) = self
            .store
            .find(name)?
            .ok_or_else(|| VaultError::NotFound(name.to_string()))?;
        if self.files.exists(Resolution::Original, name) {
            return Ok(false);
        }
        self.downloads
            .fetch(&token, name, kind, Resolution::Original, cancel)
            .await
    }

    /// Whether a download of `name` at `resolution` is running
    pub fn is_downloading(&self, name: &str, resolution: Resolution) -> bool {
        self.downloads.is_in_flight(name, resolution)
    }

    /// Decrypted thumbnail from the cache
    pub fn read_thumbnail(&self, name: &str) -> VaultResult<Vec<u8>> {
        self.read_cached(Resolution::Thumb, name)
    }

    /// Decrypted original from the cache
    pub fn read_original(&self, name: &str) -> VaultResult<Vec<u8>> {
        self.read_cached(Resolution::Original, name)
    }

    fn read_cached(&self, res: Resolution, name: &str) -> VaultResult<Vec<u8>> {
        let keypair = self.keys.keypair()?;
        let data = self.files.read(res, name)?;
        let (_, plaintext) = self.codec.decode_bytes(&data, &keypair)?;
        Ok(plaintext)
    }

    /// Evict cache files that no index row refers to
    pub fn prune_orphans(&self) -> VaultResult<usize> {
        let known = self.store.names()?;
        let mut evicted = 0;
        for res in [Resolution::Thumb, Resolution::Original] {
            for name in self.files.list(res)? {
                // In-progress temp files
                if name.starts_with('.') || known.contains(&name) {
                    continue;
                }
                if self.files.evict(res, &name)? {
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            info!(evicted, "Pruned orphaned cache files");
        }
        Ok(evicted)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // HELPERS
    // ═══════════════════════════════════════════════════════════════════════

    /// Index paths of `names` in `kind`; every name must be there
    fn paths_in(&self, kind: RecordKind, names: &[String]) -> VaultResult<Vec<IndexPath>> {
        names
            .iter()
            .map(|name| {
                self.store
                    .index_path(kind, name)?
                    .ok_or_else(|| VaultError::NotFound(name.clone()))
            })
            .collect()
    }

    /// Drop rows and cached bytes after the server confirmed a deletion
    fn remove_local(&self, names: &[String]) -> usize {
        let mut removed = 0;
        for name in names {
            match self.store.delete(name) {
                Ok(Some(_)) => removed += 1,
                Ok(None) => debug!(name = %name, "Already gone locally"),
                Err(e) => warn!(name = %name, error = %e, "Could not remove index row"),
            }
            if let Err(e) = self.files.evict_all(name) {
                warn!(name = %name, error = %e, "Cache eviction failed");
            }
        }
        removed
    }
}
