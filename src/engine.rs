//! Public engine facade: owns the index, the ingest pipeline, the change
//! monitor and the statistics, and hands out streaming search results.
//! The engine is a thin handle over an `Arc` core so background workers
//! (build, monitor, sync) share state without lifetime gymnastics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use log::{info, warn};
use parking_lot::Mutex;

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::index::FileIndex;
use crate::monitor::{ChangeBus, SyncAdapter, UsnMonitor};
use crate::options::IndexingOptions;
use crate::persist::IndexPersistence;
use crate::pipeline::{IndexingPipeline, IngestSource};
use crate::provider::{FileSystemProvider, WalkProvider};
use crate::query::SearchQuery;
use crate::record::{CompactRecord, FileRef, FullRecord};
use crate::search::{self, SearchResult};
use crate::stats::{FileChangeEvent, FileChangeKind, IndexingStats, LocationStatus, SearchStats};
use crate::strings::StringPool;

/// Which ingest backend the engine should prefer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Platform {
    /// Raw MFT when privileged and on NTFS, filesystem walk otherwise.
    #[default]
    Auto,
    RawMft,
    FilesystemWalk,
}

/// Synthetic refs minted for records discovered by the provider monitor,
/// kept far away from the walk provider's per-enumeration ordinals.
const MONITOR_REF_BASE: u64 = 1 << 40;

struct EngineInner {
    index: Arc<FileIndex>,
    provider: Arc<dyn FileSystemProvider>,
    persistence: Option<Arc<dyn IndexPersistence>>,
    monitor: Arc<UsnMonitor>,
    bus: Arc<ChangeBus>,
    platform: Platform,

    search_stats: Mutex<SearchStats>,
    locations: Mutex<HashMap<String, LocationStatus>>,
    progress: Mutex<(u64, u64, u64)>, // scanned, indexed, elapsed_ms
    records_per_second: AtomicU64,
    indexing: AtomicBool,
    monitoring: AtomicBool,
    session_cancel: Mutex<CancellationToken>,
    monitor_ref_counter: AtomicU64,
}

pub struct SearchEngine {
    inner: Arc<EngineInner>,
}

/// Build an engine with the default walk provider and no persistence.
pub fn create_engine(platform: Platform) -> SearchEngine {
    SearchEngine::new(platform, Arc::new(WalkProvider::new()), None)
}

impl SearchEngine {
    pub fn new(
        platform: Platform,
        provider: Arc<dyn FileSystemProvider>,
        persistence: Option<Arc<dyn IndexPersistence>>,
    ) -> Self {
        // Windows volumes are case-insensitive unless opted out; the path
        // pool follows that default. The size index is always allocated;
        // it stays empty unless sizes are actually collected.
        let pool = Arc::new(StringPool::new(true));
        SearchEngine {
            inner: Arc::new(EngineInner {
                index: Arc::new(FileIndex::new(pool, true)),
                provider,
                persistence,
                monitor: Arc::new(UsnMonitor::default()),
                bus: Arc::new(ChangeBus::new()),
                platform,
                search_stats: Mutex::new(SearchStats::default()),
                locations: Mutex::new(HashMap::new()),
                progress: Mutex::new((0, 0, 0)),
                records_per_second: AtomicU64::new(0),
                indexing: AtomicBool::new(false),
                monitoring: AtomicBool::new(false),
                session_cancel: Mutex::new(CancellationToken::new()),
                monitor_ref_counter: AtomicU64::new(MONITOR_REF_BASE),
            }),
        }
    }

    pub fn index(&self) -> &Arc<FileIndex> {
        &self.inner.index
    }

    pub fn platform(&self) -> Platform {
        self.inner.platform
    }

    /// Kick off the initial build on a background thread; monitoring
    /// follows when the options ask for it. A second call while a build
    /// runs is a no-op.
    pub fn start_indexing(&self, options: IndexingOptions) -> Result<()> {
        if self.inner.indexing.swap(true, Ordering::AcqRel) {
            info!("start_indexing skipped: build already active");
            return Ok(());
        }
        let cancel = CancellationToken::new();
        *self.inner.session_cancel.lock() = cancel.clone();

        {
            let mut locations = self.inner.locations.lock();
            for location in options
                .specific_directories
                .iter()
                .chain(&options.mount_points)
            {
                locations.insert(location.clone(), LocationStatus::Indexing);
            }
        }

        let inner = Arc::clone(&self.inner);
        std::thread::spawn(move || {
            inner.run_build(options, cancel);
        });
        Ok(())
    }

    /// Block until the current build finishes. Test and CLI convenience;
    /// returns false on timeout.
    pub fn wait_indexing(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.inner.indexing.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    pub fn stop_indexing(&self) {
        self.inner.session_cancel.lock().cancel();
        self.inner.monitor.stop();
        self.inner.monitoring.store(false, Ordering::Release);
    }

    pub fn is_indexing(&self) -> bool {
        self.inner.indexing.load(Ordering::Acquire)
    }

    /// Streaming search. Invalid queries come back as a failed result,
    /// not an Err, so the stream surface stays uniform.
    pub fn search(&self, query: SearchQuery) -> SearchResult {
        let started = Instant::now();
        let text = query.text.clone();
        let result = search::execute(
            Arc::clone(&self.inner.index),
            Some(Arc::clone(&self.inner.provider)),
            query,
            CancellationToken::new(),
        );
        self.inner
            .search_stats
            .lock()
            .record(&text, started.elapsed(), result.is_failed());
        result
    }

    /// Point lookup by full path: index first, live filesystem second.
    pub fn get_file(&self, path: &str) -> Option<FullRecord> {
        if let Some(rec) = self.inner.index.find_by_path(path) {
            if let Ok(full) = self.inner.index.to_full(&rec) {
                return Some(full);
            }
        }
        self.inner.provider.get_file_info(path)
    }

    pub fn indexing_stats(&self) -> IndexingStats {
        let (scanned, indexed, elapsed_ms) = *self.inner.progress.lock();
        IndexingStats {
            counts: self.inner.index.counts(),
            pool: Some(self.inner.index.pool().stats()),
            locations: self.inner.locations.lock().clone(),
            scanned,
            indexed,
            skipped: 0,
            parse_errors: 0,
            records_per_second: self.inner.records_per_second.load(Ordering::Relaxed),
            build_elapsed_ms: elapsed_ms,
            monitoring: self.inner.monitoring.load(Ordering::Acquire),
        }
    }

    pub fn search_stats(&self) -> SearchStats {
        self.inner.search_stats.lock().clone()
    }

    pub fn subscribe_changes(&self) -> Receiver<FileChangeEvent> {
        self.inner.bus.subscribe()
    }

    pub fn monitor(&self) -> &Arc<UsnMonitor> {
        &self.inner.monitor
    }
}

impl Drop for SearchEngine {
    fn drop(&mut self) {
        self.stop_indexing();
    }
}

impl EngineInner {
    fn run_build(self: Arc<Self>, options: IndexingOptions, cancel: CancellationToken) {
        let preferred = match self.platform {
            Platform::Auto => None,
            Platform::RawMft => Some(IngestSource::RawMft),
            Platform::FilesystemWalk => Some(IngestSource::FilesystemWalk),
        };
        let pipeline = IndexingPipeline::new(
            Arc::clone(&self.index),
            Arc::clone(&self.provider),
            self.persistence.clone(),
            options.clone(),
        )
        .prefer(preferred);
        let progress_share = Arc::clone(&self);
        let progress_sink = move |p: crate::stats::IndexingProgress| {
            *progress_share.progress.lock() = (p.scanned, p.indexed, p.elapsed_ms);
        };

        match pipeline.build(&progress_sink, &cancel) {
            Ok(report) => {
                self.records_per_second
                    .store(report.records_per_second, Ordering::Relaxed);
                {
                    let mut locations = self.locations.lock();
                    for (location, status) in &report.locations {
                        locations.insert(location.clone(), status.clone());
                    }
                }
                if report.complete {
                    self.start_auto_save(&options, cancel.clone());
                    if options.enable_monitoring {
                        self.start_monitoring(&options, report.source, cancel);
                    }
                }
            }
            Err(e) => {
                warn!("index build failed: {e}");
                let mut locations = self.locations.lock();
                for location in options
                    .specific_directories
                    .iter()
                    .chain(&options.mount_points)
                {
                    locations.insert(location.clone(), LocationStatus::Error(e.to_string()));
                }
            }
        }
        self.indexing.store(false, Ordering::Release);
    }

    /// Periodic persistence flush, when a sink is wired and the options
    /// ask for it.
    fn start_auto_save(&self, options: &IndexingOptions, cancel: CancellationToken) {
        let (Some(sink), Some(secs)) = (self.persistence.clone(), options.auto_save_interval_secs)
        else {
            return;
        };
        std::thread::spawn(move || {
            let interval = Duration::from_secs(secs.max(1));
            while !cancel.is_cancelled() {
                std::thread::sleep(interval);
                if cancel.is_cancelled() {
                    break;
                }
                if let Err(e) = sink.optimize() {
                    warn!("periodic index save failed: {e}");
                }
            }
        });
    }

    fn start_monitoring(
        self: &Arc<Self>,
        options: &IndexingOptions,
        source: IngestSource,
        cancel: CancellationToken,
    ) {
        self.monitor
            .set_poll_interval(Duration::from_millis(options.poll_interval_ms.max(1)));
        match source {
            IngestSource::RawMft => {
                let volumes: Vec<String> = if options.mount_points.is_empty() {
                    crate::win::ntfs_volumes()
                } else {
                    options.mount_points.clone()
                };
                match self.monitor.start(&volumes) {
                    Ok(()) => {
                        if let Some(rx) = self.monitor.changes() {
                            let adapter =
                                SyncAdapter::new(Arc::clone(&self.index), Arc::clone(&self.bus));
                            std::thread::spawn(move || {
                                adapter.run(rx, &cancel);
                            });
                        }
                        if let Some(notices) = self.monitor.notices() {
                            self.spawn_notice_listener(notices);
                        }
                        self.monitoring.store(true, Ordering::Release);
                        let mut locations = self.locations.lock();
                        for volume in &volumes {
                            locations.insert(volume.clone(), LocationStatus::Monitoring);
                        }
                    }
                    Err(e) => warn!("usn monitor unavailable: {e}"),
                }
            }
            IngestSource::FilesystemWalk => {
                let locations: Vec<String> = if options.specific_directories.is_empty() {
                    options.mount_points.clone()
                } else {
                    options.specific_directories.clone()
                };
                match self.provider.monitor_changes(&locations, &cancel) {
                    Ok(rx) => {
                        let inner = Arc::clone(self);
                        std::thread::spawn(move || {
                            for event in rx {
                                if cancel.is_cancelled() {
                                    break;
                                }
                                inner.apply_provider_event(&event);
                                inner.bus.publish(event);
                            }
                        });
                        self.monitoring.store(true, Ordering::Release);
                        let mut map = self.locations.lock();
                        for location in &locations {
                            map.insert(location.clone(), LocationStatus::Monitoring);
                        }
                    }
                    Err(e) => warn!("provider monitor unavailable: {e}"),
                }
            }
        }
    }

    /// React to monitor conditions: a rewound journal means the index is
    /// missing changes for that volume until the caller re-enumerates.
    fn spawn_notice_listener(self: &Arc<Self>, notices: Receiver<crate::monitor::MonitorNotice>) {
        let inner = Arc::clone(self);
        std::thread::spawn(move || {
            for notice in notices {
                match notice {
                    crate::monitor::MonitorNotice::Rewound { volume, from, to } => {
                        warn!("journal on {volume} rewound ({from} -> {to}); index outdated");
                        inner
                            .locations
                            .lock()
                            .insert(volume, LocationStatus::Outdated);
                    }
                    crate::monitor::MonitorNotice::VolumeError { volume, message } => {
                        inner
                            .locations
                            .lock()
                            .insert(volume, LocationStatus::Error(message));
                    }
                }
            }
        });
    }

    /// Apply a path-based provider event to the index. The journal path
    /// has its own FRN-based adapter; this one serves the walk fallback.
    fn apply_provider_event(&self, event: &FileChangeEvent) {
        match event.kind {
            FileChangeKind::Created | FileChangeKind::Modified => {
                self.upsert_by_path(&event.path);
            }
            FileChangeKind::Deleted => {
                if let Some(rec) = self.index.find_by_path(&event.path) {
                    self.index.remove(rec.file_ref());
                }
            }
            FileChangeKind::Renamed => {
                if let Some(old_path) = event.old_path.as_deref() {
                    if let Some(rec) = self.index.find_by_path(old_path) {
                        self.index.remove(rec.file_ref());
                    }
                }
                self.upsert_by_path(&event.path);
            }
        }
    }

    fn upsert_by_path(&self, path: &str) {
        let Some(info) = self.provider.get_file_info(path) else {
            return;
        };
        let parent_path = match path.rfind(['/', '\\']) {
            Some(pos) => &path[..pos],
            None => return,
        };
        let Some(parent) = self.index.find_by_path(parent_path) else {
            return;
        };
        let file_ref = match self.index.find_by_path(path) {
            Some(existing) => existing.file_ref(),
            None => FileRef::synthetic(self.monitor_ref_counter.fetch_add(1, Ordering::Relaxed)),
        };
        let rec = CompactRecord {
            file_ref,
            parent_ref: parent.file_ref(),
            name_id: self.index.pool().intern_name(&info.name),
            attributes: info.attributes,
            size: info.size,
            modified_ticks: info.modified_ticks,
        };
        self.index.insert(rec);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn build_tree(root: &std::path::Path) {
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("docs/report.txt"), b"r").unwrap();
        fs::write(root.join("readme.md"), b"m").unwrap();
    }

    fn indexed_engine(root: &std::path::Path) -> SearchEngine {
        let engine = create_engine(Platform::FilesystemWalk);
        engine
            .start_indexing(IndexingOptions {
                specific_directories: vec![root.to_string_lossy().into_owned()],
                enable_monitoring: false,
                ..Default::default()
            })
            .unwrap();
        assert!(engine.wait_indexing(Duration::from_secs(30)));
        engine
    }

    #[test]
    fn engine_builds_and_searches() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let engine = indexed_engine(dir.path());

        let mut result = engine.search(SearchQuery::for_text("report"));
        let hits = result.collect_files();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "report.txt");

        let stats = engine.indexing_stats();
        assert_eq!(stats.counts.files, 2);
        assert!(!stats.monitoring);
        assert_eq!(engine.search_stats().queries, 1);
    }

    #[test]
    fn engine_get_file_prefers_index() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let engine = indexed_engine(dir.path());

        let path = dir.path().join("docs/report.txt");
        let found = engine.get_file(&path.to_string_lossy()).unwrap();
        assert_eq!(found.name, "report.txt");
    }

    #[test]
    fn engine_reports_location_status() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let engine = indexed_engine(dir.path());
        let stats = engine.indexing_stats();
        let status = stats
            .locations
            .get(&dir.path().to_string_lossy().into_owned())
            .unwrap();
        assert_eq!(*status, LocationStatus::Indexed);
    }

    #[test]
    fn failed_search_counts_in_stats() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let engine = indexed_engine(dir.path());
        let result = engine.search(SearchQuery::default());
        assert!(result.is_failed());
        assert_eq!(engine.search_stats().failed_queries, 1);
    }

    #[test]
    fn double_start_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        build_tree(dir.path());
        let engine = create_engine(Platform::FilesystemWalk);
        let options = IndexingOptions {
            specific_directories: vec![dir.path().to_string_lossy().into_owned()],
            enable_monitoring: false,
            ..Default::default()
        };
        engine.start_indexing(options.clone()).unwrap();
        engine.start_indexing(options).unwrap();
        assert!(engine.wait_indexing(Duration::from_secs(30)));
        assert_eq!(engine.indexing_stats().counts.files, 2);
    }
}
