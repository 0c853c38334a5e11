//! Delta reconciliation
//!
//! Per name, the state machine over Gallery / Trash / Deleted:
//!
//! | current | event   | new     |
//! |---------|---------|---------|
//! | Gallery | trash   | Trash   |
//! | Trash   | restore | Gallery |
//! | Trash   | delete  | Deleted (row removed, cache evicted) |
//! | Gallery | delete  | Deleted |
//! | absent  | any     | no-op   |
//!
//! A cycle applies deletes, then gallery files, then trash files. Each entry
//! is applied completely or not at all; cancellation is checked between
//! entries and leaves the high-water marks untouched so the next cycle
//! replays what was missed.

use std::collections::HashSet;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::download::DownloadBatch;
use super::{SyncContext, SyncReport};
use crate::crypto::KeyPair;
use crate::error::{VaultError, VaultResult};
use crate::events::{IndexChanges, SyncEvent};
use crate::local_files::Resolution;
use crate::model::{AppInfo, DeleteEvent, DeletedFile, Delta, FileRecord, RecordKind};
use crate::transport::{Payload, Request};

/// base64url as written into the `headers` field; padding optional
pub(crate) const HEADER_B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// State carried through one cycle
struct Cycle<'a> {
    token: String,
    keypair: Option<KeyPair>,
    cancel: &'a CancellationToken,
    batch: DownloadBatch,
    report: SyncReport,
    /// Names permanently deleted earlier in this cycle
    deleted: HashSet<String>,
}

impl SyncContext {
    /// Fetch the delta since the stored high-water marks and apply it
    #[instrument(skip_all)]
    pub async fn update(&self, cancel: &CancellationToken) -> VaultResult<SyncReport> {
        let _cycle = self.cycle.lock().await;
        let token = self.token()?;
        let mut info = self.store.app_info()?;

        let request = Request::GetUpdate {
            token: token.clone(),
            last_seen: info.last_seen,
            last_del_seen: info.last_del_seen,
        };
        let delta = match self
            .retry
            .run("get_update", cancel, || self.transport.send(request.clone()))
            .await?
            .into_payload("get_update")?
        {
            Payload::Update(delta) => delta,
            _ => return Err(VaultError::UnexpectedResponse("get_update")),
        };

        info!(
            files = delta.files.len(),
            trash = delta.trash.len(),
            deletes = delta.deletes.len(),
            "Applying delta"
        );

        let keypair = self.keys.keypair().ok();
        if keypair.is_none() {
            warn!("Key material not loaded, durations will not be extracted");
        }
        let mut cycle = Cycle {
            token,
            keypair,
            cancel,
            batch: DownloadBatch::new(),
            report: SyncReport::default(),
            deleted: HashSet::new(),
        };

        if let Err(e) = self.apply_delta(&mut cycle, &delta) {
            cycle.batch.abort();
            return Err(e);
        }

        advance_marks(&mut info, &delta.files, &delta.trash, &delta.deletes);
        if let Some(used) = delta.space_used {
            info.space_used = used;
        }
        if let Some(quota) = delta.space_quota {
            info.space_quota = quota;
        }
        self.store.update_app_info(&info)?;
        self.events.dispatch(SyncEvent::AppInfo(info));

        cycle.report.downloads_scheduled = cycle.batch.len();
        self.drain(&mut cycle).await;

        let report = cycle.report;
        info!(
            inserted = report.inserted,
            updated = report.updated,
            trashed = report.trashed,
            restored = report.restored,
            deleted = report.deleted,
            skipped = report.skipped,
            downloads = report.downloads_completed,
            failures = report.errors.len(),
            "Sync cycle complete"
        );
        Ok(report)
    }

    fn apply_delta(&self, cycle: &mut Cycle<'_>, delta: &Delta) -> VaultResult<()> {
        self.process_deletes(cycle, &delta.deletes)?;
        self.process_files(cycle, RecordKind::Gallery, &delta.files)?;
        self.process_files(cycle, RecordKind::Trash, &delta.trash)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DELETE EVENTS
    // ═══════════════════════════════════════════════════════════════════════

    fn process_deletes(&self, cycle: &mut Cycle<'_>, deletes: &[DeletedFile]) -> VaultResult<()> {
        let mut gallery = IndexChanges::default();
        let mut trash = IndexChanges::default();

        for entry in deletes {
            if cycle.cancel.is_cancelled() {
                return Err(VaultError::Cancelled);
            }
            if let Err(e) = self.apply_delete(cycle, entry, &mut gallery, &mut trash) {
                warn!(name = %entry.name, event = ?entry.event, error = %e, "Delete event failed");
                cycle.report.fail(&entry.name, &e);
            }
        }

        self.notify(RecordKind::Gallery, gallery);
        self.notify(RecordKind::Trash, trash);
        Ok(())
    }

    fn apply_delete(
        &self,
        cycle: &mut Cycle<'_>,
        entry: &DeletedFile,
        gallery: &mut IndexChanges,
        trash: &mut IndexChanges,
    ) -> VaultResult<()> {
        let Some((kind, record)) = self.store.find(&entry.name)? else {
            debug!(name = %entry.name, event = ?entry.event, "Delete event for unknown file");
            cycle.report.skipped += 1;
            return Ok(());
        };

        match (kind, entry.event) {
            (RecordKind::Gallery, DeleteEvent::Trash) | (RecordKind::Trash, DeleteEvent::Restore) => {
                let to = other_kind(kind);
                let old_path = self.store.index_path(kind, &entry.name)?;
                self.store.move_files(
                    std::slice::from_ref(&entry.name),
                    kind,
                    to,
                    &record.date_modified,
                )?;
                let new_path = self.store.index_path(to, &entry.name)?;

                let (from_changes, to_changes) = match kind {
                    RecordKind::Gallery => (&mut *gallery, &mut *trash),
                    RecordKind::Trash => (&mut *trash, &mut *gallery),
                };
                from_changes.deleted.extend(old_path);
                to_changes.inserted.extend(new_path);

                if to == RecordKind::Trash {
                    cycle.report.trashed += 1;
                } else {
                    cycle.report.restored += 1;
                }
                debug!(name = %entry.name, from = %kind, to = %to, "Moved by delete event");
            }
            (_, DeleteEvent::Delete) => {
                let old_path = self.store.index_path(kind, &entry.name)?;
                self.store.delete(&entry.name)?;
                cycle.deleted.insert(entry.name.clone());
                cycle.report.deleted += 1;
                match kind {
                    RecordKind::Gallery => gallery.deleted.extend(old_path),
                    RecordKind::Trash => trash.deleted.extend(old_path),
                }

                // The row is gone either way; a stale cache file is pruned later
                if let Err(e) = self.files.evict_all(&entry.name) {
                    warn!(name = %entry.name, error = %e, "Cache eviction failed");
                    cycle.report.fail(&entry.name, &e);
                }
                debug!(name = %entry.name, "Permanently deleted");
            }
            _ => {
                debug!(name = %entry.name, event = ?entry.event, set = %kind, "Already in target set");
                cycle.report.skipped += 1;
            }
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // FILE ENTRIES
    // ═══════════════════════════════════════════════════════════════════════

    fn process_files(
        &self,
        cycle: &mut Cycle<'_>,
        kind: RecordKind,
        records: &[FileRecord],
    ) -> VaultResult<()> {
        let mut here = IndexChanges::default();
        let mut other = IndexChanges::default();

        for record in records {
            if cycle.cancel.is_cancelled() {
                return Err(VaultError::Cancelled);
            }
            if cycle.deleted.contains(&record.name) {
                debug!(name = %record.name, "Skipping entry deleted earlier in this cycle");
                cycle.report.skipped += 1;
                continue;
            }
            if let Err(e) = self.apply_file(cycle, kind, record, &mut here, &mut other) {
                warn!(name = %record.name, set = %kind, error = %e, "File entry failed");
                cycle.report.fail(&record.name, &e);
            }
        }

        self.notify(kind, here);
        self.notify(other_kind(kind), other);
        Ok(())
    }

    fn apply_file(
        &self,
        cycle: &mut Cycle<'_>,
        kind: RecordKind,
        incoming: &FileRecord,
        here: &mut IndexChanges,
        other: &mut IndexChanges,
    ) -> VaultResult<()> {
        let Some((stored_kind, stored)) = self.store.find(&incoming.name)? else {
            let mut record = incoming.clone();
            record.duration = self.extract_duration(cycle.keypair.as_ref(), &record);
            self.store.add(kind, std::slice::from_ref(&record))?;
            here.inserted.extend(self.store.index_path(kind, &record.name)?);
            cycle.report.inserted += 1;

            self.schedule_thumb(cycle, kind, &record.name);
            debug!(name = %record.name, set = %kind, version = record.version, "Inserted");
            return Ok(());
        };

        let newer = incoming.date_modified_millis() > stored.date_modified_millis();
        let version_up = incoming.version > stored.version;

        // Listed in the other set: a higher version or a strictly newer
        // date moves it
        if stored_kind != kind {
            if !version_up && !newer {
                debug!(name = %incoming.name, listed = %kind, stored = %stored_kind, "Stale cross-set entry");
                cycle.report.skipped += 1;
                return Ok(());
            }
            other.deleted.extend(self.store.index_path(stored_kind, &incoming.name)?);
            self.store.move_files(
                std::slice::from_ref(&incoming.name),
                stored_kind,
                kind,
                &incoming.date_modified,
            )?;
            match kind {
                RecordKind::Trash => cycle.report.trashed += 1,
                RecordKind::Gallery => cycle.report.restored += 1,
            }
        }

        if !version_up {
            if newer || !incoming.is_remote {
                debug!(
                    name = %incoming.name,
                    stored = stored.version,
                    incoming = incoming.version,
                    "Update without version increase ignored"
                );
            }
            if stored_kind != kind {
                here.inserted.extend(self.store.index_path(kind, &incoming.name)?);
            } else {
                cycle.report.skipped += 1;
            }
            return Ok(());
        }

        let mut record = incoming.clone();
        record.duration = self
            .extract_duration(cycle.keypair.as_ref(), &record)
            .or(stored.duration);
        self.store.update_file(kind, &record)?;
        cycle.report.updated += 1;

        let path = self.store.index_path(kind, &record.name)?;
        if stored_kind != kind {
            here.inserted.extend(path);
        } else {
            here.updated.extend(path);
        }

        // New bytes on the server: the cached original is stale and is
        // fetched again only when requested
        if let Err(e) = self.files.evict(Resolution::Original, &record.name) {
            warn!(name = %record.name, error = %e, "Could not evict stale original");
        }
        self.schedule_thumb(cycle, kind, &record.name);
        debug!(
            name = %record.name,
            from = stored.version,
            to = record.version,
            "Version increased"
        );
        Ok(())
    }

    fn schedule_thumb(&self, cycle: &mut Cycle<'_>, kind: RecordKind, name: &str) {
        self.downloads.schedule(
            &mut cycle.batch,
            &cycle.token,
            name,
            kind,
            Resolution::Thumb,
            cycle.cancel,
        );
    }

    /// Duration from the envelope headers; each segment decoded on its own
    pub(crate) fn extract_duration(
        &self,
        keypair: Option<&KeyPair>,
        record: &FileRecord,
    ) -> Option<u32> {
        let keypair = keypair?;
        let mut duration = None;
        for segment in record.header_segments() {
            let decoded = HEADER_B64
                .decode(segment)
                .map_err(VaultError::from)
                .and_then(|bytes| self.codec.decode_header(bytes.as_slice(), keypair));
            match decoded {
                Ok(header) => duration = Some(header.video_duration),
                Err(e) => {
                    warn!(name = %record.name, error = %e, "Skipping undecodable header segment")
                }
            }
        }
        duration
    }

    /// Wait for the cycle's downloads, announcing each finished thumbnail
    async fn drain(&self, cycle: &mut Cycle<'_>) {
        while let Some(done) = cycle.batch.next().await {
            match done.result {
                Ok(()) => {
                    cycle.report.downloads_completed += 1;
                    if done.key.resolution == Resolution::Thumb {
                        if let Ok(Some(path)) = self.store.index_path(done.kind, &done.key.name) {
                            self.notify(
                                done.kind,
                                IndexChanges {
                                    updated: vec![path],
                                    ..Default::default()
                                },
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(name = %done.key.name, error = %e, "Download failed");
                    cycle.report.downloads_failed += 1;
                    cycle.report.fail(&done.key.name, &e);
                }
            }
        }
    }
}

fn other_kind(kind: RecordKind) -> RecordKind {
    match kind {
        RecordKind::Gallery => RecordKind::Trash,
        RecordKind::Trash => RecordKind::Gallery,
    }
}

/// High-water marks only move forward
fn advance_marks(
    info: &mut AppInfo,
    files: &[FileRecord],
    trash: &[FileRecord],
    deletes: &[DeletedFile],
) {
    let seen = files
        .iter()
        .chain(trash)
        .map(FileRecord::date_modified_millis)
        .max()
        .unwrap_or(0);
    let del_seen = deletes.iter().map(|d| d.date).max().unwrap_or(0);
    info.last_seen = info.last_seen.max(seen);
    info.last_del_seen = info.last_del_seen.max(del_seen);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::model::{FileSet, IndexPath};
    use crate::store::Store;
    use crate::sync::test_support::{deleted, harness, record, signed_out};
    use crate::transport::Response;

    fn files(records: Vec<FileRecord>) -> Delta {
        Delta {
            files: records,
            ..Default::default()
        }
    }

    fn deletes(entries: Vec<DeletedFile>) -> Delta {
        Delta {
            deletes: entries,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_new_file_inserted_and_thumb_downloaded() {
        let h = harness();
        h.transport.push_delta(files(vec![record("a.img", 1, 100)]));

        let report = h.ctx.update(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.downloads_scheduled, 1);
        assert_eq!(report.downloads_completed, 1);
        assert!(report.success());

        let (kind, rec) = h.store.find("a.img").unwrap().unwrap();
        assert_eq!(kind, RecordKind::Gallery);
        assert_eq!(rec.version, 1);
        assert!(h.ctx.files().exists(Resolution::Thumb, "a.img"));

        let downloads = h.transport.downloads.lock().clone();
        assert_eq!(downloads.len(), 1);
        assert!(downloads[0].is_thumb);
        assert_eq!(downloads[0].folder, 0);

        let events = h.events.take();
        let inserted = IndexPath { section: 0, row: 0 };
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::Gallery(c) if c.inserted == vec![inserted])));
        assert!(events.iter().any(|e| matches!(e, SyncEvent::AppInfo(_))));
    }

    #[tokio::test]
    async fn test_version_bump_refreshes_thumb_only() {
        let h = harness();
        h.transport.push_delta(files(vec![record("a.img", 1, 100)]));
        h.ctx.update(&CancellationToken::new()).await.unwrap();

        let blob = h.transport.blob.lock().clone();
        h.ctx.files().write(Resolution::Original, "a.img", &blob).unwrap();

        h.transport.push_delta(files(vec![record("a.img", 2, 200)]));
        let report = h.ctx.update(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(report.downloads_scheduled, 1);

        let (_, rec) = h.store.find("a.img").unwrap().unwrap();
        assert_eq!(rec.version, 2);
        assert!(!h.ctx.files().exists(Resolution::Original, "a.img"));

        let downloads = h.transport.downloads.lock().clone();
        assert_eq!(downloads.len(), 2);
        assert!(downloads.iter().all(|d| d.is_thumb));
    }

    #[tokio::test]
    async fn test_trash_event_moves_record() {
        let h = harness();
        h.store.add(RecordKind::Gallery, &[record("a.img", 1, 100)]).unwrap();
        h.transport
            .push_delta(deletes(vec![deleted("a.img", DeleteEvent::Trash, 300)]));

        let report = h.ctx.update(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.trashed, 1);
        assert_eq!(h.store.find("a.img").unwrap().unwrap().0, RecordKind::Trash);
        assert!(h.store.list(RecordKind::Gallery).unwrap().is_empty());
        assert_eq!(h.transport.download_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_event_removes_and_evicts() {
        let h = harness();
        h.store.add(RecordKind::Trash, &[record("a.img", 1, 100)]).unwrap();
        let blob = h.transport.blob.lock().clone();
        h.ctx.files().write(Resolution::Thumb, "a.img", &blob).unwrap();
        h.ctx.files().write(Resolution::Original, "a.img", &blob).unwrap();

        h.transport
            .push_delta(deletes(vec![deleted("a.img", DeleteEvent::Delete, 300)]));
        let report = h.ctx.update(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.deleted, 1);
        assert!(h.store.find("a.img").unwrap().is_none());
        assert!(!h.ctx.files().exists(Resolution::Thumb, "a.img"));
        assert!(!h.ctx.files().exists(Resolution::Original, "a.img"));
    }

    #[tokio::test]
    async fn test_trash_restore_delete_ends_deleted() {
        let h = harness();
        h.store.add(RecordKind::Gallery, &[record("a.img", 1, 100)]).unwrap();
        h.transport.push_delta(deletes(vec![
            deleted("a.img", DeleteEvent::Trash, 1),
            deleted("a.img", DeleteEvent::Restore, 2),
            deleted("a.img", DeleteEvent::Delete, 3),
        ]));

        let report = h.ctx.update(&CancellationToken::new()).await.unwrap();
        assert_eq!((report.trashed, report.restored, report.deleted), (1, 1, 1));
        assert!(h.store.find("a.img").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_events_for_target_set_are_noops() {
        let h = harness();
        h.store.add(RecordKind::Gallery, &[record("g.img", 1, 100)]).unwrap();
        h.store.add(RecordKind::Trash, &[record("t.img", 1, 100)]).unwrap();
        h.transport.push_delta(deletes(vec![
            deleted("g.img", DeleteEvent::Restore, 1),
            deleted("t.img", DeleteEvent::Trash, 2),
            deleted("missing.img", DeleteEvent::Delete, 3),
        ]));

        let report = h.ctx.update(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.skipped, 3);
        assert_eq!(h.store.find("g.img").unwrap().unwrap().0, RecordKind::Gallery);
        assert_eq!(h.store.find("t.img").unwrap().unwrap().0, RecordKind::Trash);
    }

    #[tokio::test]
    async fn test_same_delta_twice_is_idempotent() {
        let h = harness();
        let delta = files(vec![record("a.img", 1, 100), record("b.img", 1, 110)]);
        h.transport.push_delta(delta.clone());
        h.transport.push_delta(delta);

        let first = h.ctx.update(&CancellationToken::new()).await.unwrap();
        let snapshot = h.store.list(RecordKind::Gallery).unwrap();
        let second = h.ctx.update(&CancellationToken::new()).await.unwrap();

        assert_eq!(first.inserted, 2);
        assert_eq!(second.inserted + second.updated, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(h.store.list(RecordKind::Gallery).unwrap(), snapshot);
        assert_eq!(h.transport.download_count(), 2);
    }

    #[tokio::test]
    async fn test_lower_or_equal_version_never_overwrites() {
        let h = harness();
        h.store.add(RecordKind::Gallery, &[record("a.img", 5, 100)]).unwrap();
        h.transport
            .push_delta(files(vec![record("a.img", 3, 900), record("a.img", 5, 901)]));

        let report = h.ctx.update(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.updated, 0);
        let (_, rec) = h.store.find("a.img").unwrap().unwrap();
        assert_eq!(rec.version, 5);
        assert_eq!(rec.date_modified, "100");
        assert_eq!(h.transport.download_count(), 0);
    }

    #[tokio::test]
    async fn test_deleted_name_not_resurrected_by_file_entry() {
        let h = harness();
        h.store.add(RecordKind::Gallery, &[record("a.img", 1, 100)]).unwrap();
        h.transport.push_delta(Delta {
            files: vec![record("a.img", 2, 50)],
            deletes: vec![deleted("a.img", DeleteEvent::Delete, 60)],
            ..Default::default()
        });

        let report = h.ctx.update(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.inserted, 0);
        assert!(h.store.find("a.img").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_newer_cross_set_entry_moves_record() {
        let h = harness();
        h.store.add(RecordKind::Gallery, &[record("new.img", 1, 100)]).unwrap();
        h.store.add(RecordKind::Gallery, &[record("old.img", 1, 100)]).unwrap();
        h.transport.push_delta(Delta {
            trash: vec![record("new.img", 1, 200), record("old.img", 1, 50)],
            ..Default::default()
        });

        let report = h.ctx.update(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.trashed, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(h.store.find("new.img").unwrap().unwrap().0, RecordKind::Trash);
        assert_eq!(h.store.find("old.img").unwrap().unwrap().0, RecordKind::Gallery);
    }

    #[tokio::test]
    async fn test_cross_set_version_bump_applied_without_newer_date() {
        let h = harness();
        h.store.add(RecordKind::Gallery, &[record("a.img", 1, 100)]).unwrap();
        h.transport.push_delta(Delta {
            trash: vec![record("a.img", 2, 100)],
            ..Default::default()
        });

        let report = h.ctx.update(&CancellationToken::new()).await.unwrap();
        assert_eq!((report.updated, report.trashed, report.skipped), (1, 1, 0));
        assert_eq!(report.downloads_scheduled, 1);

        let (kind, rec) = h.store.find("a.img").unwrap().unwrap();
        assert_eq!(kind, RecordKind::Trash);
        assert_eq!(rec.version, 2);
        let downloads = h.transport.downloads.lock().clone();
        assert!(downloads[0].is_thumb);
        assert_eq!(downloads[0].folder, 1);
    }

    #[tokio::test]
    async fn test_record_visible_before_thumb_arrives() {
        let h = harness();
        h.transport.hold_downloads.store(true, Ordering::SeqCst);
        h.transport.push_delta(files(vec![record("a.img", 1, 100)]));
        let cancel = CancellationToken::new();

        let (report, seen) = tokio::join!(h.ctx.update(&cancel), async {
            while h.transport.download_count() == 0 {
                tokio::task::yield_now().await;
            }
            let seen = h.store.find("a.img").unwrap();
            assert!(!h.ctx.files().exists(Resolution::Thumb, "a.img"));
            h.transport.release.notify_one();
            seen
        });

        assert_eq!(seen.unwrap().0, RecordKind::Gallery);
        assert_eq!(report.unwrap().downloads_completed, 1);
        assert!(h.ctx.files().exists(Resolution::Thumb, "a.img"));
    }

    #[tokio::test]
    async fn test_move_waits_for_running_cycle() {
        let h = harness();
        h.transport.hold_downloads.store(true, Ordering::SeqCst);
        h.transport.push_delta(files(vec![record("a.img", 1, 100)]));
        h.transport.push(Response::ok(Payload::Empty));
        let cancel = CancellationToken::new();
        let names = vec!["a.img".to_string()];

        let (report, moved) = tokio::join!(h.ctx.update(&cancel), async {
            while h.transport.download_count() == 0 {
                tokio::task::yield_now().await;
            }
            let blocked = tokio::time::timeout(
                Duration::from_millis(20),
                h.ctx.move_files(&names, FileSet::Gallery, FileSet::Trash, &cancel),
            )
            .await;
            assert!(blocked.is_err());
            assert_eq!(h.transport.sent().len(), 1);

            h.transport.release.notify_one();
            h.ctx
                .move_files(&names, FileSet::Gallery, FileSet::Trash, &cancel)
                .await
        });

        assert_eq!(report.unwrap().inserted, 1);
        assert_eq!(moved.unwrap().len(), 1);
        let sent = h.transport.sent();
        assert!(matches!(sent[1], Request::Trash { .. }));
        assert_eq!(h.store.find("a.img").unwrap().unwrap().0, RecordKind::Trash);
    }

    #[tokio::test]
    async fn test_high_water_marks_sent_and_advanced() {
        let h = harness();
        h.store
            .update_app_info(&AppInfo {
                last_seen: 50,
                last_del_seen: 60,
                ..Default::default()
            })
            .unwrap();
        h.transport.push_delta(Delta {
            files: vec![record("a.img", 1, 100)],
            deletes: vec![deleted("zzz.img", DeleteEvent::Delete, 70)],
            space_used: Some(10),
            space_quota: Some(1_000),
            ..Default::default()
        });
        h.transport.push_delta(Delta::default());

        h.ctx.update(&CancellationToken::new()).await.unwrap();
        h.ctx.update(&CancellationToken::new()).await.unwrap();

        let sent = h.transport.sent();
        assert!(matches!(
            sent[0],
            Request::GetUpdate { last_seen: 50, last_del_seen: 60, .. }
        ));
        assert!(matches!(
            sent[1],
            Request::GetUpdate { last_seen: 100, last_del_seen: 70, .. }
        ));
        let info = h.app_info();
        assert_eq!((info.space_used, info.space_quota), (10, 1_000));
    }

    #[tokio::test]
    async fn test_marks_never_move_backwards() {
        let h = harness();
        h.store
            .update_app_info(&AppInfo {
                last_seen: 500,
                last_del_seen: 500,
                ..Default::default()
            })
            .unwrap();
        h.transport.push_delta(files(vec![record("a.img", 1, 100)]));
        h.ctx.update(&CancellationToken::new()).await.unwrap();
        assert_eq!(h.app_info().last_seen, 500);
    }

    #[tokio::test]
    async fn test_duration_read_from_headers() {
        let h = harness();
        let mut rec = record("v.mp4", 1, 100);
        rec.headers = format!("{}*!!not-base64", h.headers(42));
        h.transport.push_delta(files(vec![rec]));

        let report = h.ctx.update(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.inserted, 1);
        let (_, stored) = h.store.find("v.mp4").unwrap().unwrap();
        assert_eq!(stored.duration, Some(42));
    }

    #[tokio::test]
    async fn test_failed_download_reported_record_kept() {
        let h = harness();
        h.transport.fail_downloads.store(true, std::sync::atomic::Ordering::SeqCst);
        h.transport.push_delta(files(vec![record("a.img", 1, 100)]));

        let report = h.ctx.update(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.downloads_failed, 1);
        assert!(!report.success());
        assert!(h.store.find("a.img").unwrap().is_some());
        assert!(!h.ctx.files().exists(Resolution::Thumb, "a.img"));
    }

    #[tokio::test]
    async fn test_rejected_fetch_mutates_nothing() {
        let h = harness();
        h.transport.push(Response::rejected("nok"));

        let err = h.ctx.update(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, VaultError::RemoteRejected { request: "get_update", .. }));
        assert_eq!(h.app_info(), AppInfo::default());
    }

    #[tokio::test]
    async fn test_wrong_payload_is_unexpected() {
        let h = harness();
        h.transport.push(Response::ok(Payload::Empty));
        let err = h.ctx.update(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, VaultError::UnexpectedResponse("get_update")));
    }

    #[tokio::test]
    async fn test_cancelled_cycle_leaves_marks() {
        let h = harness();
        h.transport.push_delta(files(vec![record("a.img", 1, 100)]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.ctx.update(&cancel).await.unwrap_err();
        assert!(matches!(err, VaultError::Cancelled));
        assert_eq!(h.app_info(), AppInfo::default());
        assert!(h.store.find("a.img").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_requires_session() {
        let h = signed_out();
        let err = h.ctx.update(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, VaultError::NoActiveSession));
        assert!(h.transport.sent().is_empty());
    }
}
