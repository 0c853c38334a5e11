//! Deduplicated, bounded envelope downloads
//!
//! Every download is keyed by `(name, resolution)`. A key that is already in
//! flight is not scheduled again; the key is released when its task ends,
//! however it ends.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::envelope::header::parse_prefix;
use crate::error::{VaultError, VaultResult};
use crate::local_files::{LocalFiles, Resolution};
use crate::model::RecordKind;
use crate::transport::{DownloadRequest, RetryPolicy, Transport};

/// Identity of one download
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DownloadKey {
    pub name: String,
    pub resolution: Resolution,
}

/// Outcome of one finished download
#[derive(Debug)]
pub(crate) struct Finished {
    pub key: DownloadKey,
    pub kind: RecordKind,
    pub result: VaultResult<()>,
}

type InFlight = Arc<Mutex<HashSet<DownloadKey>>>;

/// Releases its key when dropped
struct InFlightGuard {
    set: InFlight,
    key: DownloadKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

/// Downloads started during one operation
#[derive(Default)]
pub(crate) struct DownloadBatch {
    tasks: JoinSet<Finished>,
}

impl DownloadBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Next finished download, `None` once all are done
    pub async fn next(&mut self) -> Option<Finished> {
        loop {
            match self.tasks.join_next().await? {
                Ok(finished) => return Some(finished),
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                // Aborted tasks already released their key
                Err(_) => continue,
            }
        }
    }

    pub fn abort(&mut self) {
        self.tasks.abort_all();
    }
}

/// Shared download machinery of a sync context
#[derive(Clone)]
pub(crate) struct Downloader {
    transport: Arc<dyn Transport>,
    files: LocalFiles,
    retry: RetryPolicy,
    in_flight: InFlight,
    limit: Arc<Semaphore>,
}

impl Downloader {
    pub fn new(
        transport: Arc<dyn Transport>,
        files: LocalFiles,
        retry: RetryPolicy,
        max_concurrent: usize,
    ) -> Self {
        Self {
            transport,
            files,
            retry,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn is_in_flight(&self, name: &str, resolution: Resolution) -> bool {
        self.in_flight.lock().contains(&DownloadKey {
            name: name.to_string(),
            resolution,
        })
    }

    fn claim(&self, name: &str, resolution: Resolution) -> Option<InFlightGuard> {
        let key = DownloadKey {
            name: name.to_string(),
            resolution,
        };
        if !self.in_flight.lock().insert(key.clone()) {
            return None;
        }
        Some(InFlightGuard {
            set: Arc::clone(&self.in_flight),
            key,
        })
    }

    /// Start a download in `batch`; false when the key is already in flight
    pub fn schedule(
        &self,
        batch: &mut DownloadBatch,
        token: &str,
        name: &str,
        kind: RecordKind,
        resolution: Resolution,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(guard) = self.claim(name, resolution) else {
            debug!(name, ?resolution, "Download already in flight");
            return false;
        };

        let this = self.clone();
        let request = DownloadRequest {
            token: token.to_string(),
            name: name.to_string(),
            is_thumb: resolution.is_thumb(),
            folder: kind.folder(),
        };
        let cancel = cancel.clone();

        batch.tasks.spawn(async move {
            let result = this.run(request, resolution, &cancel).await;
            Finished {
                key: guard.key.clone(),
                kind,
                result,
            }
        });
        true
    }

    /// Download in the caller's task; false when already in flight
    pub async fn fetch(
        &self,
        token: &str,
        name: &str,
        kind: RecordKind,
        resolution: Resolution,
        cancel: &CancellationToken,
    ) -> VaultResult<bool> {
        let Some(_guard) = self.claim(name, resolution) else {
            return Ok(false);
        };
        let request = DownloadRequest {
            token: token.to_string(),
            name: name.to_string(),
            is_thumb: resolution.is_thumb(),
            folder: kind.folder(),
        };
        self.run(request, resolution, cancel).await?;
        Ok(true)
    }

    async fn run(
        &self,
        request: DownloadRequest,
        resolution: Resolution,
        cancel: &CancellationToken,
    ) -> VaultResult<()> {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(VaultError::Cancelled),
            permit = self.limit.acquire() => permit.map_err(|_| VaultError::Cancelled)?,
        };

        let bytes = self
            .retry
            .run("download", cancel, || self.transport.download(request.clone()))
            .await?;

        // Refuse to cache something that is not an envelope
        if let Err(e) = parse_prefix(&bytes) {
            warn!(name = %request.name, ?resolution, error = %e, "Downloaded file is not a valid envelope");
            return Err(e);
        }

        self.files.write(resolution, &request.name, &bytes)?;
        debug!(name = %request.name, ?resolution, bytes = bytes.len(), "Download complete");
        Ok(())
    }
}
