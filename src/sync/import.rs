//! Local import: encrypt, index, upload

use base64::Engine;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::reconcile::HEADER_B64;
use super::{now_millis, run_blocking, SyncContext};
use crate::crypto::{random_array, PublicKey};
use crate::envelope::{EnvelopeCodec, EnvelopeMeta};
use crate::error::{VaultError, VaultResult};
use crate::events::{IndexChanges, SyncEvent};
use crate::local_files::Resolution;
use crate::model::{FileRecord, FileType, RecordKind};
use crate::thumbs::ThumbnailEngine;
use crate::transport::UploadRequest;

/// Random bytes behind an opaque file name
const NAME_ENTROPY: usize = 32;
const NAME_SUFFIX: &str = ".sp";

/// A file to add to the gallery
#[derive(Debug, Clone)]
pub struct ImportRequest {
    /// Original filename; only stored inside the sealed header
    pub filename: String,
    pub file_type: FileType,
    pub data: Vec<u8>,
    /// Pre-rendered thumbnail; generated from `data` for photos when absent
    pub thumbnail: Option<Vec<u8>>,
    /// Seconds; zero for stills
    pub video_duration: u32,
}

/// Both envelopes of one imported file
struct Sealed {
    original: Vec<u8>,
    thumb: Vec<u8>,
    headers: String,
}

impl SyncContext {
    /// Encrypt and upload a new file. The record is indexed before upload
    /// and stays not-remote if the upload fails.
    #[instrument(skip_all, fields(file_type = ?request.file_type, bytes = request.data.len()))]
    pub async fn import_image(
        &self,
        request: ImportRequest,
        cancel: &CancellationToken,
    ) -> VaultResult<FileRecord> {
        let token = self.token()?;
        let public = self.keys.public_key()?;
        let name = new_file_name()?;
        let file_type = request.file_type;
        let duration = (file_type == FileType::Video).then_some(request.video_duration);

        let codec = self.codec.clone();
        let thumbs = self.thumbs;
        let sealed = run_blocking(move || seal(&codec, thumbs, request, &public)).await?;

        let now = now_millis().to_string();
        let record = FileRecord {
            name: name.clone(),
            file_type,
            version: 1,
            date_created: now.clone(),
            date_modified: now,
            headers: sealed.headers.clone(),
            is_remote: false,
            duration,
        };

        {
            let _cycle = self.cycle.lock().await;
            if let Err(e) = self.persist(&record, &sealed, cancel) {
                self.discard(&name);
                return Err(e);
            }
            self.notify(
                RecordKind::Gallery,
                IndexChanges {
                    inserted: self.store.index_path(RecordKind::Gallery, &name)?.into_iter().collect(),
                    ..Default::default()
                },
            );
        }
        debug!(name = %name, "Imported locally, uploading");

        let upload = UploadRequest {
            token,
            name: name.clone(),
            folder: RecordKind::Gallery.folder(),
            thumb: sealed.thumb,
            original: sealed.original,
            headers: record.headers.clone(),
            version: record.version,
            date_created: record.date_created.clone(),
            date_modified: record.date_modified.clone(),
        };
        let space = match self
            .retry
            .run("upload", cancel, || self.transport.upload(upload.clone()))
            .await
        {
            Ok(space) => space,
            Err(e) => {
                warn!(name = %name, error = %e, "Upload failed, file kept locally");
                return Err(e);
            }
        };

        {
            let _cycle = self.cycle.lock().await;
            self.store.mark_remote(&name)?;
            let mut info = self.store.app_info()?;
            info.space_used = space.used;
            info.space_quota = space.quota;
            self.store.update_app_info(&info)?;
            self.events.dispatch(SyncEvent::AppInfo(info));
            self.notify(
                RecordKind::Gallery,
                IndexChanges {
                    updated: self.store.index_path(RecordKind::Gallery, &name)?.into_iter().collect(),
                    ..Default::default()
                },
            );
        }

        info!(name = %name, used = space.used, "Imported and uploaded");
        Ok(FileRecord {
            is_remote: true,
            ..record
        })
    }

    /// Cache both envelopes and index the record
    fn persist(
        &self,
        record: &FileRecord,
        sealed: &Sealed,
        cancel: &CancellationToken,
    ) -> VaultResult<()> {
        self.files.write(Resolution::Original, &record.name, &sealed.original)?;
        self.files.write(Resolution::Thumb, &record.name, &sealed.thumb)?;
        if cancel.is_cancelled() {
            return Err(VaultError::Cancelled);
        }
        self.store.add(RecordKind::Gallery, std::slice::from_ref(record))
    }

    fn discard(&self, name: &str) {
        if let Err(e) = self.files.evict_all(name) {
            warn!(name, error = %e, "Could not remove partial import");
        }
    }
}

fn new_file_name() -> VaultResult<String> {
    let bytes = random_array::<NAME_ENTROPY>()?;
    Ok(format!("{}{}", HEADER_B64.encode(bytes), NAME_SUFFIX))
}

/// Encrypt original and thumbnail under one file id
fn seal(
    codec: &EnvelopeCodec,
    thumbs: ThumbnailEngine,
    request: ImportRequest,
    recipient: &PublicKey,
) -> VaultResult<Sealed> {
    let thumb_plain = match request.thumbnail {
        Some(t) => t,
        None if request.file_type == FileType::Photo => thumbs.generate(&request.data)?,
        None => {
            return Err(VaultError::Image(
                "a thumbnail is required for non-photo files".into(),
            ))
        }
    };

    let file_id = EnvelopeCodec::new_file_id()?.to_vec();
    let meta = |len: usize| EnvelopeMeta {
        file_id: file_id.clone(),
        filename: request.filename.clone(),
        file_type: request.file_type,
        data_size: len as u64,
        video_duration: request.video_duration,
    };

    let original = codec.encode_bytes(&request.data, &meta(request.data.len()), recipient)?;
    let thumb = codec.encode_bytes(&thumb_plain, &meta(thumb_plain.len()), recipient)?;

    let headers = format!(
        "{}*{}",
        HEADER_B64.encode(codec.read_header_bytes(original.as_slice())?),
        HEADER_B64.encode(codec.read_header_bytes(thumb.as_slice())?),
    );
    Ok(Sealed {
        original,
        thumb,
        headers,
    })
}
