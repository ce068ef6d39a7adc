//! Change-journal monitoring and incremental index sync.
//!
//! The platform poll loops (win/journal.rs) publish parsed `ChangeRecord`s
//! into an unbounded channel, per-volume FIFO. The `SyncAdapter` here is
//! platform-neutral: it batches changes, pairs rename halves, deduplicates
//! and applies each batch to the index as one step, emitting `FileChanged`
//! events for subscribers. Tests drive it with synthetic streams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::cancel::CancellationToken;
use crate::error::{FastFindError, Result};
use crate::index::FileIndex;
use crate::record::{CompactRecord, FileAttributes, FileRef};
use crate::stats::{FileChangeEvent, FileChangeKind};
use crate::usn::ChangeReason;

/// A batch is applied when it reaches this many changes...
pub const SYNC_BATCH_MAX: usize = 100;
/// ...or when this much time passed since the batch opened.
pub const SYNC_BATCH_WINDOW: Duration = Duration::from_millis(500);

/// An OLD_NAME half with no NEW_NAME partner within this window degrades
/// to a delete (the file left the indexed scope).
const RENAME_PAIR_TIMEOUT: Duration = Duration::from_millis(500);

/// One parsed journal entry, per-volume FIFO ordered.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    /// Volume label the record came from (e.g. `C:`).
    pub volume: String,
    pub usn: i64,
    pub file_ref: FileRef,
    pub parent_ref: FileRef,
    pub reason: ChangeReason,
    pub raw_reason: u32,
    pub attributes: FileAttributes,
    pub name: String,
    pub timestamp_ticks: u64,
}

/// Journal position, persisted by callers that want resume-on-restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct JournalCursor {
    pub usn: i64,
    pub journal_id: u64,
}

/// Per-volume monitor lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorState {
    NotOpened,
    Querying,
    Creating,
    Running,
    Error(String),
}

/// Out-of-band monitor conditions the engine reacts to.
#[derive(Debug, Clone)]
pub enum MonitorNotice {
    /// The journal dropped entries we had not consumed; the volume needs a
    /// full re-enumeration starting from `to`.
    Rewound { volume: String, from: i64, to: i64 },
    VolumeError { volume: String, message: String },
}

/// Fan-out of `FileChangeEvent`s to any number of subscribers. Dead
/// receivers are pruned on publish.
#[derive(Default)]
pub struct ChangeBus {
    senders: Mutex<Vec<Sender<FileChangeEvent>>>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<FileChangeEvent> {
        let (tx, rx) = unbounded();
        self.senders.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: FileChangeEvent) {
        self.senders.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().len()
    }
}

/// Monitors the change journals of a set of volumes and keeps the shared
/// channel of ChangeRecords flowing. The platform loop is Windows-only;
/// elsewhere `start` reports `NotPermitted` and the engine stays on the
/// polling provider monitor.
pub struct UsnMonitor {
    poll_interval: Mutex<Duration>,
    running: Arc<AtomicBool>,
    cancel: Mutex<CancellationToken>,
    states: Arc<Mutex<HashMap<String, MonitorState>>>,
    cursors: Arc<Mutex<HashMap<String, JournalCursor>>>,
    changes_tx: Sender<ChangeRecord>,
    changes_rx: Mutex<Option<Receiver<ChangeRecord>>>,
    notices_tx: Sender<MonitorNotice>,
    notices_rx: Mutex<Option<Receiver<MonitorNotice>>>,
}

impl UsnMonitor {
    pub fn new(poll_interval: Duration) -> Self {
        let (changes_tx, changes_rx) = unbounded();
        let (notices_tx, notices_rx) = unbounded();
        UsnMonitor {
            poll_interval: Mutex::new(poll_interval),
            running: Arc::new(AtomicBool::new(false)),
            cancel: Mutex::new(CancellationToken::new()),
            states: Arc::new(Mutex::new(HashMap::new())),
            cursors: Arc::new(Mutex::new(HashMap::new())),
            changes_tx,
            changes_rx: Mutex::new(Some(changes_rx)),
            notices_tx,
            notices_rx: Mutex::new(Some(notices_rx)),
        }
    }

    /// The shared change stream. Single consumer; the first caller takes it.
    pub fn changes(&self) -> Option<Receiver<ChangeRecord>> {
        self.changes_rx.lock().take()
    }

    /// Adjust the poll cadence; loops started afterwards pick it up.
    pub fn set_poll_interval(&self, interval: Duration) {
        *self.poll_interval.lock() = interval;
    }

    pub fn notices(&self) -> Option<Receiver<MonitorNotice>> {
        self.notices_rx.lock().take()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn state(&self, volume: &str) -> MonitorState {
        self.states
            .lock()
            .get(volume)
            .cloned()
            .unwrap_or(MonitorState::NotOpened)
    }

    pub fn current_usn(&self, volume: &str) -> Option<i64> {
        self.cursors.lock().get(volume).map(|c| c.usn)
    }

    pub fn cursor(&self, volume: &str) -> Option<JournalCursor> {
        self.cursors.lock().get(volume).copied()
    }

    /// Start one poll loop per volume, reading from the journal's current
    /// position.
    pub fn start(&self, volumes: &[String]) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();

        #[cfg(target_os = "windows")]
        {
            for volume in volumes {
                self.spawn_volume_loop(volume.clone(), None, cancel.clone());
            }
            info!("usn monitor started for {} volume(s)", volumes.len());
            Ok(())
        }
        #[cfg(not(target_os = "windows"))]
        {
            let _ = (volumes, cancel);
            self.running.store(false, Ordering::Release);
            Err(FastFindError::NotPermitted)
        }
    }

    /// Start a volume from a stored cursor, validating that the journal
    /// still covers it. `JournalRewound` means replay is impossible and
    /// the caller should re-enumerate.
    pub fn start_from(&self, volume: &str, cursor: JournalCursor) -> Result<()> {
        #[cfg(target_os = "windows")]
        {
            let journal = crate::win::journal::validate_cursor(volume, cursor)?;
            let _ = journal;
            self.running.store(true, Ordering::Release);
            let cancel = self.cancel.lock().clone();
            self.spawn_volume_loop(volume.to_string(), Some(cursor), cancel);
            Ok(())
        }
        #[cfg(not(target_os = "windows"))]
        {
            let _ = (volume, cursor);
            Err(FastFindError::NotPermitted)
        }
    }

    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.cancel.lock().cancel();
            info!("usn monitor stopped");
        }
    }

    /// Replay journal entries from `from_usn` to the present. On journal
    /// wrap, surfaces `JournalRewound{from, to}` so the caller can restart
    /// from the lowest valid position after re-enumerating.
    pub fn read_history(&self, volume: &str, from_usn: i64) -> Result<Vec<ChangeRecord>> {
        #[cfg(target_os = "windows")]
        {
            crate::win::journal::read_history(volume, from_usn, *self.poll_interval.lock())
        }
        #[cfg(not(target_os = "windows"))]
        {
            let _ = (volume, from_usn);
            Err(FastFindError::NotPermitted)
        }
    }

    #[cfg(target_os = "windows")]
    fn spawn_volume_loop(
        &self,
        volume: String,
        cursor: Option<JournalCursor>,
        cancel: CancellationToken,
    ) {
        let states = Arc::clone(&self.states);
        let cursors = Arc::clone(&self.cursors);
        let tx = self.changes_tx.clone();
        let notices = self.notices_tx.clone();
        let poll_interval = *self.poll_interval.lock();
        std::thread::spawn(move || {
            crate::win::journal::poll_volume(
                &volume,
                cursor,
                poll_interval,
                &cancel,
                &tx,
                &notices,
                &states,
                &cursors,
            );
        });
    }
}

impl Default for UsnMonitor {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

// ── index sync adapter ────────────────────────────────────────────────────

/// A rename OLD_NAME half waiting for its NEW_NAME partner.
struct RenamePending {
    record: ChangeRecord,
    seen_at: Instant,
}

/// What one batched change does to the index.
enum SyncOp {
    Upsert(ChangeRecord),
    Delete(ChangeRecord),
    Rename {
        old: ChangeRecord,
        new: ChangeRecord,
    },
}

impl SyncOp {
    fn key(&self) -> u64 {
        match self {
            SyncOp::Upsert(r) | SyncOp::Delete(r) => r.file_ref.record_number(),
            SyncOp::Rename { new, .. } => new.file_ref.record_number(),
        }
    }
}

/// Applies the change stream to the index. `run` blocks until the stream
/// closes or the token cancels; the engine gives it a thread.
pub struct SyncAdapter {
    index: Arc<FileIndex>,
    bus: Arc<ChangeBus>,
    batch_max: usize,
    batch_window: Duration,
}

#[derive(Debug, Default, Clone, Copy, serde::Serialize)]
pub struct SyncCounters {
    pub batches: u64,
    pub created: u64,
    pub updated: u64,
    pub deleted: u64,
    pub renamed: u64,
    pub unresolved: u64,
}

impl SyncAdapter {
    pub fn new(index: Arc<FileIndex>, bus: Arc<ChangeBus>) -> Self {
        SyncAdapter {
            index,
            bus,
            batch_max: SYNC_BATCH_MAX,
            batch_window: SYNC_BATCH_WINDOW,
        }
    }

    #[cfg(test)]
    fn with_window(mut self, window: Duration) -> Self {
        self.batch_window = window;
        self
    }

    pub fn run(&self, rx: Receiver<ChangeRecord>, cancel: &CancellationToken) -> SyncCounters {
        let mut counters = SyncCounters::default();
        let mut batch: Vec<SyncOp> = Vec::new();
        let mut renames: HashMap<u64, RenamePending> = HashMap::new();
        let mut window_opened = Instant::now();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let timeout = self
                .batch_window
                .saturating_sub(window_opened.elapsed())
                .max(Duration::from_millis(1));
            match rx.recv_timeout(timeout) {
                Ok(change) => {
                    self.stage(change, &mut batch, &mut renames);
                    if batch.len() >= self.batch_max {
                        self.apply_batch(&mut batch, &mut counters);
                        window_opened = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    Self::expire_renames(&mut renames, &mut batch);
                    if !batch.is_empty() {
                        self.apply_batch(&mut batch, &mut counters);
                    }
                    window_opened = Instant::now();
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Stream over: flush whatever is staged, renames degrade to deletes.
        for (_, pending) in renames.drain() {
            batch.push(SyncOp::Delete(pending.record));
        }
        if !batch.is_empty() {
            self.apply_batch(&mut batch, &mut counters);
        }
        counters
    }

    /// Route one change into the staging batch, pairing rename halves.
    fn stage(
        &self,
        change: ChangeRecord,
        batch: &mut Vec<SyncOp>,
        renames: &mut HashMap<u64, RenamePending>,
    ) {
        Self::expire_renames(renames, batch);
        match change.reason {
            ChangeReason::RenamedOld => {
                renames.insert(
                    change.file_ref.record_number(),
                    RenamePending {
                        record: change,
                        seen_at: Instant::now(),
                    },
                );
            }
            ChangeReason::RenamedNew => {
                match renames.remove(&change.file_ref.record_number()) {
                    Some(pending) => batch.push(SyncOp::Rename {
                        old: pending.record,
                        new: change,
                    }),
                    // Old half never seen (outside scope before): a create.
                    None => batch.push(SyncOp::Upsert(change)),
                }
            }
            ChangeReason::Deleted => batch.push(SyncOp::Delete(change)),
            ChangeReason::Created
            | ChangeReason::DataModified
            | ChangeReason::AttrsChanged
            | ChangeReason::Closed => batch.push(SyncOp::Upsert(change)),
        }
    }

    fn expire_renames(renames: &mut HashMap<u64, RenamePending>, batch: &mut Vec<SyncOp>) {
        if renames.is_empty() {
            return;
        }
        let expired: Vec<u64> = renames
            .iter()
            .filter(|(_, p)| p.seen_at.elapsed() >= RENAME_PAIR_TIMEOUT)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            if let Some(pending) = renames.remove(&key) {
                debug!("rename pair expired for {:?}", pending.record.file_ref);
                batch.push(SyncOp::Delete(pending.record));
            }
        }
    }

    /// Deduplicate to the last op per record and apply as one step.
    fn apply_batch(&self, batch: &mut Vec<SyncOp>, counters: &mut SyncCounters) {
        let staged = std::mem::take(batch);
        let mut order: Vec<u64> = Vec::with_capacity(staged.len());
        let mut last: HashMap<u64, SyncOp> = HashMap::with_capacity(staged.len());
        for op in staged {
            let key = op.key();
            if last.insert(key, op).is_none() {
                order.push(key);
            }
        }

        counters.batches += 1;
        for key in order {
            let Some(op) = last.remove(&key) else {
                continue;
            };
            match op {
                SyncOp::Upsert(change) => self.apply_upsert(change, counters),
                SyncOp::Delete(change) => self.apply_delete(change, counters),
                SyncOp::Rename { old, new } => self.apply_rename(old, new, counters),
            }
        }
    }

    fn compact_from_change(&self, change: &ChangeRecord) -> CompactRecord {
        // Size is not carried by journal records; keep the previous value
        // on updates, zero on fresh inserts.
        let size = self
            .index
            .get(change.file_ref)
            .map(|existing| existing.size())
            .unwrap_or(0);
        CompactRecord {
            file_ref: change.file_ref,
            parent_ref: change.parent_ref,
            name_id: self.index.pool().intern_name(&change.name),
            attributes: change.attributes,
            size,
            modified_ticks: change.timestamp_ticks,
        }
    }

    fn apply_upsert(&self, change: ChangeRecord, counters: &mut SyncCounters) {
        let existed = self.index.contains(change.file_ref);
        let rec = self.compact_from_change(&change);
        if !self.index.insert(rec) {
            counters.unresolved += 1;
            warn!(
                "sync: parent chain unresolved for {:?} ({})",
                change.file_ref, change.name
            );
            return;
        }
        let path = self
            .index
            .get(change.file_ref)
            .and_then(|r| self.index.full_path(&r).ok())
            .unwrap_or_else(|| change.name.clone());
        if existed {
            counters.updated += 1;
            self.bus.publish(FileChangeEvent {
                kind: FileChangeKind::Modified,
                old_path: None,
                path,
                timestamp_ticks: change.timestamp_ticks,
            });
        } else {
            counters.created += 1;
            self.bus.publish(FileChangeEvent {
                kind: FileChangeKind::Created,
                old_path: None,
                path,
                timestamp_ticks: change.timestamp_ticks,
            });
        }
    }

    fn apply_delete(&self, change: ChangeRecord, counters: &mut SyncCounters) {
        // The index itself is the FRN → path map the journal lacks: the
        // path is resolved from the stored record before removal.
        match self.index.remove(change.file_ref) {
            Some((_, path)) => {
                counters.deleted += 1;
                self.bus.publish(FileChangeEvent {
                    kind: FileChangeKind::Deleted,
                    old_path: None,
                    path,
                    timestamp_ticks: change.timestamp_ticks,
                });
            }
            None => {
                debug!("sync: delete for unknown {:?}", change.file_ref);
            }
        }
    }

    fn apply_rename(&self, old: ChangeRecord, new: ChangeRecord, counters: &mut SyncCounters) {
        let old_path = self
            .index
            .remove(old.file_ref)
            .map(|(_, path)| path)
            .filter(|p| !p.is_empty());
        let rec = self.compact_from_change(&new);
        if !self.index.insert(rec) {
            counters.unresolved += 1;
            return;
        }
        let new_path = self
            .index
            .get(new.file_ref)
            .and_then(|r| self.index.full_path(&r).ok())
            .unwrap_or_else(|| new.name.clone());
        counters.renamed += 1;
        self.bus.publish(FileChangeEvent {
            kind: FileChangeKind::Renamed,
            old_path,
            path: new_path,
            timestamp_ticks: new.timestamp_ticks,
        });
    }
}
