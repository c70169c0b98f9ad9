//! Change plumbing on both sides of the synchronizer: local optimistic
//! events feeding in, notifications fanning out once the cache is current.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::ledger::{EventKind, FileId, GroupId, Subject};

/// A change observed locally at command time, mirroring the ledger event
/// the command will eventually produce. Carries no sequence number; the
/// synchronizer always lets local changes through.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalChange {
    pub kind: EventKind,
    pub subject: Option<Subject>,
}

/// Producer handle for optimistic changes. Clones feed the same channel.
#[derive(Debug, Clone)]
pub struct LocalEvents {
    tx: mpsc::UnboundedSender<LocalChange>,
}

impl LocalEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<LocalChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, kind: EventKind, subject: Option<Subject>) {
        let _ = self.tx.send(LocalChange { kind, subject });
    }

    pub fn file_changed(&self, id: FileId) {
        self.emit(EventKind::FileChange, Some(Subject::File(id)));
    }

    pub fn permissions_changed(&self, id: FileId) {
        self.emit(EventKind::PermissionChange, Some(Subject::File(id)));
    }

    pub fn group_changed(&self, id: GroupId) {
        self.emit(EventKind::PermissionChange, Some(Subject::Group(id)));
    }

    pub fn settings_changed(&self) {
        self.emit(EventKind::SettingsChange, None);
    }
}

/// What observers receive after the synchronizer has brought the cache up
/// to date for a change (or failed to).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Notification {
    FileChanged { id: FileId },
    PermissionsChanged { id: FileId },
    GroupChanged { id: GroupId },
    SettingsChanged,
    SyncFailed {
        id: Option<FileId>,
        fatal: bool,
        message: String,
    },
}

impl Notification {
    /// The file a notification is about, when it is about one.
    pub fn file_id(&self) -> Option<FileId> {
        match self {
            Notification::FileChanged { id } | Notification::PermissionsChanged { id } => Some(*id),
            Notification::SyncFailed { id, .. } => *id,
            _ => None,
        }
    }
}

/// Broadcast fan-out of notifications. A lagging subscriber loses the
/// oldest entries rather than blocking the synchronizer.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn publish(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}
