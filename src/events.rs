//! ALFA Photos Sync - Change Notifications
//!
//! Observers learn which index positions changed after each reconciliation
//! step. Dispatch is fire-and-forget.

use tokio::sync::broadcast;
use tracing::trace;

use crate::model::{AppInfo, IndexPath, RecordKind};

/// Index positions touched by one step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexChanges {
    pub inserted: Vec<IndexPath>,
    pub updated: Vec<IndexPath>,
    pub deleted: Vec<IndexPath>,
}

impl IndexChanges {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Event delivered to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Gallery(IndexChanges),
    Trash(IndexChanges),
    AppInfo(AppInfo),
}

impl SyncEvent {
    pub fn index(kind: RecordKind, changes: IndexChanges) -> Self {
        match kind {
            RecordKind::Gallery => SyncEvent::Gallery(changes),
            RecordKind::Trash => SyncEvent::Trash(changes),
        }
    }
}

/// Notification collaborator
pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: SyncEvent);
}

/// Fan-out over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastEvents {
    tx: broadcast::Sender<SyncEvent>,
}

impl BroadcastEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEvents {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventSink for BroadcastEvents {
    fn dispatch(&self, event: SyncEvent) {
        // No subscribers is fine
        if self.tx.send(event).is_err() {
            trace!("Event dropped, no subscribers");
        }
    }
}
