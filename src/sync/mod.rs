//! ALFA Photos Sync - Sync Reconciler
//!
//! `SyncContext` is constructed once per signed-in client and carries every
//! collaborator explicitly: store, transport, key manager, event sink and the
//! on-disk cache. Reconciliation cycles and set moves are serialized by one
//! async mutex, so two deltas can never interleave their store mutations.

mod download;
pub mod import;
pub mod moves;
pub mod reconcile;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::SyncConfig;
use crate::envelope::EnvelopeCodec;
use crate::error::{VaultError, VaultResult};
use crate::events::{EventSink, IndexChanges, SyncEvent};
use crate::key_manager::KeyManager;
use crate::local_files::LocalFiles;
use crate::model::RecordKind;
use crate::store::Store;
use crate::thumbs::ThumbnailEngine;
use crate::transport::{RetryPolicy, Transport};

pub use download::DownloadKey;
pub use import::ImportRequest;

use download::Downloader;

/// Signed-in user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub token: String,
    pub user_id: String,
    pub email: String,
    pub home_folder: String,
    pub is_key_backed_up: bool,
}

/// Counters and per-item failures of one operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub inserted: usize,
    pub updated: usize,
    pub trashed: usize,
    pub restored: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub downloads_scheduled: usize,
    pub downloads_completed: usize,
    pub downloads_failed: usize,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty() && self.downloads_failed == 0
    }

    fn fail(&mut self, name: &str, error: &VaultError) {
        self.errors.push(format!("{name}: {error}"));
    }
}

/// Everything a reconciliation needs, passed explicitly
pub struct SyncContext {
    codec: EnvelopeCodec,
    keys: Arc<KeyManager>,
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    events: Arc<dyn EventSink>,
    files: LocalFiles,
    thumbs: ThumbnailEngine,
    retry: RetryPolicy,
    downloads: Downloader,
    session: RwLock<Option<Session>>,
    cycle: Mutex<()>,
}

impl SyncContext {
    pub fn new(
        config: &SyncConfig,
        keys: Arc<KeyManager>,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        events: Arc<dyn EventSink>,
    ) -> VaultResult<Self> {
        config.validate()?;
        let files = LocalFiles::new(&config.storage_root)?;
        let codec = EnvelopeCodec::new(Arc::new(crate::crypto::StandardSuite), config.chunk_size)?;
        let downloads = Downloader::new(
            Arc::clone(&transport),
            files.clone(),
            config.retry,
            config.max_concurrent_downloads,
        );

        Ok(Self {
            codec,
            keys,
            store,
            transport,
            events,
            files,
            thumbs: ThumbnailEngine::new(config.thumb_size),
            retry: config.retry,
            downloads,
            session: RwLock::new(None),
            cycle: Mutex::new(()),
        })
    }

    /// Swap the codec, e.g. for a different primitive suite
    pub fn with_codec(mut self, codec: EnvelopeCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn codec(&self) -> &EnvelopeCodec {
        &self.codec
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn files(&self) -> &LocalFiles {
        &self.files
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SESSION
    // ═══════════════════════════════════════════════════════════════════════

    /// Current session, or `NoActiveSession`
    pub fn session(&self) -> VaultResult<Session> {
        self.session.read().clone().ok_or(VaultError::NoActiveSession)
    }

    pub fn is_signed_in(&self) -> bool {
        self.session.read().is_some()
    }

    /// Install a session restored by the caller; key material must already
    /// be loaded into the key manager
    pub fn resume_session(&self, session: Session) -> VaultResult<()> {
        if !self.keys.is_loaded() {
            return Err(VaultError::KeysNotLoaded);
        }
        *self.session.write() = Some(session);
        Ok(())
    }

    fn token(&self) -> VaultResult<String> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.token.clone())
            .ok_or(VaultError::NoActiveSession)
    }

    fn clear_session(&self) {
        *self.session.write() = None;
        self.keys.clear();
    }

    // ═══════════════════════════════════════════════════════════════════════
    // HELPERS
    // ═══════════════════════════════════════════════════════════════════════

    fn notify(&self, kind: RecordKind, changes: IndexChanges) {
        if !changes.is_empty() {
            self.events.dispatch(SyncEvent::index(kind, changes));
        }
    }
}

/// Run CPU-heavy work (Argon2, bulk encryption) off the async workers
pub(crate) async fn run_blocking<T, F>(f: F) -> VaultResult<T>
where
    F: FnOnce() -> VaultResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => Err(VaultError::Cancelled),
    }
}

pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
