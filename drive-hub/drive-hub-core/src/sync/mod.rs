//! The event synchronizer: drains the ledger feed, merges in local
//! optimistic changes, and drives cache refreshes.
//!
//! Lifecycle is `Unsubscribed -> Initializing -> Active -> Unsubscribed`.
//! [`Synchronizer::start`] records the ledger's current sequence as the
//! high-water mark, opens the subscription, then builds the initial cache
//! from a full scan; events landing during the build queue in the
//! subscription and replay once the run loop is active. A remote event at
//! or below the mark is dropped as already seen; above it, the mark
//! advances. Local changes carry no sequence and always pass.
//!
//! Refreshes are debounced per file id: a newer event inside the window
//! aborts and replaces the pending refresh, so a burst of events for one
//! file costs exactly one fetch, applied through the cache's single-writer
//! queue.

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{FileTree, TreeCache};
use crate::error::{Error, Result};
use crate::events::{LocalChange, LocalEvents, Notification, NotificationBus};
use crate::ledger::{EventKind, FileId, Ledger, LedgerEvent, SequenceNumber, Subject};


/// Where the synchronizer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsubscribed,
    Initializing,
    Active,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Coalescing window for events naming the same file.
    pub debounce: Duration,
    /// How long `stop` waits for in-flight refreshes before aborting them.
    pub shutdown_grace: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Handle over the running synchronizer task.
///
/// Dropping it without [`Synchronizer::stop`] also stops the task (the
/// shutdown channel closes), but without the drain grace period.
#[derive(Debug)]
pub struct Synchronizer {
    cache: TreeCache,
    notifications: NotificationBus,
    local: LocalEvents,
    state: Arc<RwLock<SyncState>>,
    shutdown: watch::Sender<bool>,
    grace: Duration,
    task: Option<JoinHandle<()>>,
}

impl Synchronizer {
    /// Bring the cache current and go live on the feed.
    ///
    /// Fails with `FatalSync` when the sequence head cannot be established
    /// or the initial scan fails; nothing is spawned in that case and the
    /// caller decides whether to retry.
    pub async fn start(ledger: Arc<dyn Ledger>, options: SyncOptions) -> Result<Self> {
        let state = Arc::new(RwLock::new(SyncState::Initializing));

        let head = ledger
            .current_sequence()
            .await
            .map_err(|err| Error::FatalSync(err.to_string()))?;
        // Subscribe before the scan so nothing falls between feed start and
        // the snapshot the scan takes.
        let remote = ledger
            .subscribe(head)
            .await
            .map_err(|err| Error::FatalSync(err.to_string()))?;
        let tree = initial_scan(ledger.as_ref())
            .await
            .map_err(|err| Error::FatalSync(err.to_string()))?;

        let cache = TreeCache::from_tree(tree);
        let notifications = NotificationBus::new();
        let (local, local_rx) = LocalEvents::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        *state.write() = SyncState::Active;
        info!(high_water = head, files = cache.len(), "synchronizer active");

        let worker = Worker {
            ledger,
            cache: cache.clone(),
            notifications: notifications.clone(),
            state: state.clone(),
            pending: Arc::new(AsyncMutex::new(HashMap::new())),
            debounce: options.debounce,
            high_water: head,
        };
        let task = tokio::spawn(worker.run(remote, local_rx, shutdown_rx));

        Ok(Self {
            cache,
            notifications,
            local,
            state,
            shutdown: shutdown_tx,
            grace: options.shutdown_grace,
            task: Some(task),
        })
    }

    pub fn cache(&self) -> TreeCache {
        self.cache.clone()
    }

    pub fn notifications(&self) -> NotificationBus {
        self.notifications.clone()
    }

    /// Handle for emitting optimistic changes at command time.
    pub fn local_events(&self) -> LocalEvents {
        self.local.clone()
    }

    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Leave the feed: signal the run loop, wait out the grace period for
    /// in-flight refreshes, then abort whatever is left.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(self.grace, task).await.is_err() {
                warn!("synchronizer did not drain within the grace period");
                abort.abort();
            }
        }
        *self.state.write() = SyncState::Unsubscribed;
    }
}

async fn initial_scan(ledger: &dyn Ledger) -> Result<FileTree> {
    let last = ledger.last_file_id().await?;
    let mut records = Vec::new();
    for raw in 0..=last.0 {
        if let Some(record) = ledger.file(FileId(raw)).await? {
            records.push(record);
        }
    }
    Ok(FileTree::build(records))
}

struct Worker {
    ledger: Arc<dyn Ledger>,
    cache: TreeCache,
    notifications: NotificationBus,
    state: Arc<RwLock<SyncState>>,
    /// Pending refresh per file id; a newer event aborts and replaces the
    /// stored task.
    pending: Arc<AsyncMutex<HashMap<FileId, JoinHandle<()>>>>,
    debounce: Duration,
    high_water: SequenceNumber,
}

impl Worker {
    async fn run(
        mut self,
        mut remote: BoxStream<'static, LedgerEvent>,
        mut local_rx: mpsc::UnboundedReceiver<LocalChange>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = remote.next() => match event {
                    Some(event) => self.on_remote(event).await,
                    None => {
                        warn!("ledger event feed closed");
                        self.notifications.publish(Notification::SyncFailed {
                            id: None,
                            fatal: true,
                            message: "ledger event feed closed".into(),
                        });
                        break;
                    }
                },
                change = local_rx.recv() => match change {
                    Some(change) => self.on_change(change.kind, change.subject).await,
                    None => break,
                },
            }
        }
        self.drain_pending().await;
        *self.state.write() = SyncState::Unsubscribed;
    }

    async fn on_remote(&mut self, event: LedgerEvent) {
        // Dedup rule: events at or below the mark are dropped.
        if event.sequence <= self.high_water {
            return;
        }
        self.high_water = event.sequence;
        self.on_change(event.kind, event.subject).await;
    }

    async fn on_change(&self, kind: EventKind, subject: Option<Subject>) {
        match (kind, subject) {
            (EventKind::SettingsChange, _) => {
                self.notifications.publish(Notification::SettingsChanged);
            }
            (kind, Some(Subject::File(id))) => self.schedule_refresh(kind, id).await,
            (_, Some(Subject::Group(id))) => {
                self.notifications.publish(Notification::GroupChanged { id });
            }
            (_, None) => {}
        }
    }

    async fn schedule_refresh(&self, kind: EventKind, id: FileId) {
        let mut pending = self.pending.lock().await;
        if let Some(handle) = pending.remove(&id) {
            handle.abort();
        }
        let ledger = self.ledger.clone();
        let cache = self.cache.clone();
        let notifications = self.notifications.clone();
        let debounce = self.debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let outcome = cache
                .lock_and_update(id, async { ledger.file(id).await })
                .await;
            match outcome {
                Ok(_) => notifications.publish(match kind {
                    EventKind::PermissionChange => Notification::PermissionsChanged { id },
                    _ => Notification::FileChanged { id },
                }),
                Err(err) => notifications.publish(Notification::SyncFailed {
                    id: Some(id),
                    fatal: false,
                    message: err.to_string(),
                }),
            }
        });
        pending.insert(id, handle);
    }

    async fn drain_pending(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut pending = self.pending.lock().await;
            pending.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}
