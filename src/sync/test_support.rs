//! Scripted collaborators for sync tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use secrecy::SecretString;
use tempfile::TempDir;
use tokio::sync::Notify;

use super::reconcile::HEADER_B64;
use super::{Session, SyncContext};
use crate::config::SyncConfig;
use crate::crypto::{KdfParams, StandardSuite};
use crate::envelope::{EnvelopeCodec, EnvelopeMeta};
use crate::error::{VaultError, VaultResult};
use crate::events::{EventSink, SyncEvent};
use crate::key_manager::KeyManager;
use crate::model::{AppInfo, DeleteEvent, DeletedFile, Delta, FileRecord, FileType, SpaceUsage};
use crate::store::SqliteStore;
use crate::transport::{
    DownloadRequest, Payload, Request, Response, RetryPolicy, Transport, UploadRequest,
};

pub(crate) const TOKEN: &str = "tok-1";
pub(crate) const PASSWORD: &str = "correct horse";

pub(crate) fn pw(s: &str) -> SecretString {
    SecretString::new(s.to_string())
}

/// Computes a reply from the request log; `None` falls back to the queue
pub(crate) type Responder = Box<dyn Fn(&[Request]) -> Option<Response> + Send + Sync>;

/// Transport answering from a queue and logging every call
#[derive(Default)]
pub(crate) struct MockTransport {
    responses: Mutex<VecDeque<VaultResult<Response>>>,
    pub responder: Mutex<Option<Responder>>,
    pub requests: Mutex<Vec<Request>>,
    pub blob: Mutex<Vec<u8>>,
    pub downloads: Mutex<Vec<DownloadRequest>>,
    pub uploads: Mutex<Vec<UploadRequest>>,
    pub space: Mutex<SpaceUsage>,
    pub fail_uploads: AtomicBool,
    pub fail_downloads: AtomicBool,
    pub hold_downloads: AtomicBool,
    pub release: Notify,
}

impl MockTransport {
    pub fn push(&self, response: Response) {
        self.responses.lock().push_back(Ok(response));
    }

    pub fn push_err(&self, error: VaultError) {
        self.responses.lock().push_back(Err(error));
    }

    pub fn push_delta(&self, delta: Delta) {
        self.push(Response::ok(Payload::Update(delta)));
    }

    pub fn sent(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.lock().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: Request) -> VaultResult<Response> {
        let scripted = {
            let mut log = self.requests.lock();
            log.push(request);
            self.responder.lock().as_ref().and_then(|respond| respond(log.as_slice()))
        };
        if let Some(response) = scripted {
            return Ok(response);
        }
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(Response::rejected("unscripted")))
    }

    async fn download(&self, request: DownloadRequest) -> VaultResult<Vec<u8>> {
        self.downloads.lock().push(request);
        if self.hold_downloads.load(Ordering::SeqCst) {
            self.release.notified().await;
        }
        if self.fail_downloads.load(Ordering::SeqCst) {
            return Err(VaultError::RemoteRejected {
                request: "download",
                status: "missing".into(),
            });
        }
        Ok(self.blob.lock().clone())
    }

    async fn upload(&self, request: UploadRequest) -> VaultResult<SpaceUsage> {
        self.uploads.lock().push(request);
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(VaultError::RemoteRejected {
                request: "upload",
                status: "quota".into(),
            });
        }
        Ok(*self.space.lock())
    }
}

/// Sink that keeps every event
#[derive(Default)]
pub(crate) struct RecordingEvents {
    events: Mutex<Vec<SyncEvent>>,
}

impl RecordingEvents {
    pub fn take(&self) -> Vec<SyncEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for RecordingEvents {
    fn dispatch(&self, event: SyncEvent) {
        self.events.lock().push(event);
    }
}

/// Signed-in context over an in-memory index and a temp cache
pub(crate) struct Harness {
    pub ctx: SyncContext,
    pub transport: Arc<MockTransport>,
    pub events: Arc<RecordingEvents>,
    pub store: Arc<SqliteStore>,
    pub _dir: TempDir,
}

pub(crate) fn config(dir: &TempDir) -> SyncConfig {
    SyncConfig {
        storage_root: dir.path().join("vault"),
        chunk_size: 64,
        thumb_size: 32,
        max_concurrent_downloads: 2,
        retry: RetryPolicy {
            max_attempts: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
        },
        storage_kdf: KdfParams::fast(),
        wrap_kdf: KdfParams::fast(),
        event_capacity: 16,
    }
}

pub(crate) fn key_manager() -> Arc<KeyManager> {
    Arc::new(KeyManager::new(
        Arc::new(StandardSuite),
        KdfParams::fast(),
        KdfParams::fast(),
    ))
}

/// Context with keys generated but no session
pub(crate) fn signed_out() -> Harness {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(MockTransport::default());
    let events = Arc::new(RecordingEvents::default());
    let store = Arc::new(SqliteStore::in_memory().unwrap());
    let keys = key_manager();

    let ctx = SyncContext::new(
        &config(&dir),
        keys,
        store.clone(),
        transport.clone(),
        events.clone(),
    )
    .unwrap();

    Harness {
        ctx,
        transport,
        events,
        store,
        _dir: dir,
    }
}

/// Context with keys loaded and an active session
pub(crate) fn harness() -> Harness {
    let h = signed_out();
    h.ctx.keys().generate_keypair(&pw(PASSWORD)).unwrap();
    h.ctx
        .resume_session(Session {
            token: TOKEN.into(),
            user_id: "u1".into(),
            email: "a@example.com".into(),
            home_folder: "home".into(),
            is_key_backed_up: true,
        })
        .unwrap();
    *h.transport.blob.lock() = h.envelope(b"remote bytes", 0);
    h
}

impl Harness {
    /// Envelope of `data` sealed to the session key
    pub fn envelope(&self, data: &[u8], duration: u32) -> Vec<u8> {
        let public = self.ctx.keys().public_key().unwrap();
        let meta = EnvelopeMeta {
            file_id: EnvelopeCodec::new_file_id().unwrap().to_vec(),
            filename: "IMG_0001.jpg".into(),
            file_type: FileType::Video,
            data_size: data.len() as u64,
            video_duration: duration,
        };
        self.ctx.codec().encode_bytes(data, &meta, &public).unwrap()
    }

    /// `headers` value carrying one envelope header with `duration`
    pub fn headers(&self, duration: u32) -> String {
        let blob = self.envelope(b"x", duration);
        let header = self.ctx.codec().read_header_bytes(blob.as_slice()).unwrap();
        HEADER_B64.encode(header)
    }

    pub fn app_info(&self) -> AppInfo {
        use crate::store::Store;
        self.store.app_info().unwrap()
    }
}

pub(crate) fn record(name: &str, version: u64, modified: u64) -> FileRecord {
    FileRecord {
        name: name.into(),
        file_type: FileType::Photo,
        version,
        date_created: "1".into(),
        date_modified: modified.to_string(),
        headers: String::new(),
        is_remote: true,
        duration: None,
    }
}

pub(crate) fn deleted(name: &str, event: DeleteEvent, date: u64) -> DeletedFile {
    DeletedFile {
        name: name.into(),
        event,
        date,
    }
}
