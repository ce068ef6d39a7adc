//! The initial-build orchestrator: one producer per volume (raw MFT when
//! privileged, filesystem walk otherwise) feeding a bounded queue, one
//! consumer applying batches to the index and the persistence sink.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use rayon::prelude::*;

use crate::cancel::CancellationToken;
use crate::error::{FastFindError, Result};
use crate::index::FileIndex;
use crate::options::IndexingOptions;
use crate::persist::IndexPersistence;
use crate::provider::{EnumerationOptions, FileSystemProvider};
use crate::record::{CompactRecord, FullRecord};
use crate::stats::{IndexingProgress, LocationStatus};

/// Records per index/persistence bulk application.
pub const BULK_BATCH_SIZE: usize = 5_000;

/// Capacity of the multi-producer ingest queue. Producers block when the
/// consumer falls behind, bounding memory.
pub const INGEST_QUEUE_CAPACITY: usize = 100_000;

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

pub type ProgressFn = dyn Fn(IndexingProgress) + Send + Sync;

/// Which ingest path fed the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestSource {
    RawMft,
    FilesystemWalk,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub source: IngestSource,
    pub scanned: u64,
    pub indexed: u64,
    pub dropped_orphans: u64,
    pub elapsed: Duration,
    pub records_per_second: u64,
    /// False when the build was cancelled before the sources drained.
    pub complete: bool,
    pub locations: Vec<(String, LocationStatus)>,
}

pub struct IndexingPipeline {
    index: Arc<FileIndex>,
    provider: Arc<dyn FileSystemProvider>,
    persistence: Option<Arc<dyn IndexPersistence>>,
    options: IndexingOptions,
    preferred: Option<IngestSource>,
}

impl IndexingPipeline {
    pub fn new(
        index: Arc<FileIndex>,
        provider: Arc<dyn FileSystemProvider>,
        persistence: Option<Arc<dyn IndexPersistence>>,
        options: IndexingOptions,
    ) -> Self {
        IndexingPipeline {
            index,
            provider,
            persistence,
            options,
            preferred: None,
        }
    }

    /// Override the hybrid source policy (e.g. force the walk for tests
    /// or for explicitly unprivileged deployments).
    pub fn prefer(mut self, source: Option<IngestSource>) -> Self {
        self.preferred = source;
        self
    }

    /// Locations this build covers: explicit directories, explicit mount
    /// points, or whatever the provider can see.
    fn locations(&self) -> Vec<String> {
        if !self.options.specific_directories.is_empty() {
            return self.options.specific_directories.clone();
        }
        if !self.options.mount_points.is_empty() {
            return self.options.mount_points.clone();
        }
        self.provider.available_locations()
    }

    fn pick_source(&self) -> IngestSource {
        match self.preferred {
            Some(IngestSource::FilesystemWalk) => return IngestSource::FilesystemWalk,
            Some(IngestSource::RawMft) if crate::win::is_available() => {
                return IngestSource::RawMft;
            }
            // A raw preference without privileges degrades to the walk.
            Some(IngestSource::RawMft) => return IngestSource::FilesystemWalk,
            None => {}
        }
        // Explicit directories force the walk; the MFT enumerates whole
        // volumes only.
        if self.options.specific_directories.is_empty() && crate::win::is_available() {
            IngestSource::RawMft
        } else {
            IngestSource::FilesystemWalk
        }
    }

    /// Run the full initial build. Blocking; the engine gives it a thread.
    pub fn build(&self, progress: &ProgressFn, cancel: &CancellationToken) -> Result<BuildReport> {
        let started = Instant::now();
        if let Some(sink) = self.persistence.as_deref() {
            sink.initialize()?;
        }

        let source = self.pick_source();
        let locations = self.locations();
        info!(
            "index build starting: source={source:?} locations={}",
            locations.len()
        );

        let (tx, rx) = bounded::<CompactRecord>(INGEST_QUEUE_CAPACITY);
        match source {
            IngestSource::RawMft => self.spawn_mft_producers(&locations, tx, cancel),
            IngestSource::FilesystemWalk => self.spawn_walk_producer(&locations, tx, cancel),
        }

        let consumed = self.consume(rx, progress, cancel, started)?;

        // Late parents: retry the deferred records, then drop true orphans.
        let unresolved = self.index.flush_pending();
        let dropped_orphans = self.index.drain_orphans();
        if unresolved > 0 {
            warn!("{unresolved} record(s) never found a parent; dropped");
        }

        if self.options.collect_file_size && source == IngestSource::RawMft {
            self.collect_sizes(cancel);
        }

        if let Some(sink) = self.persistence.as_deref() {
            sink.optimize()?;
        }

        let elapsed = started.elapsed();
        let complete = !cancel.is_cancelled();
        let secs = elapsed.as_secs_f64();
        let status = if complete {
            LocationStatus::Indexed
        } else {
            LocationStatus::Outdated
        };
        let report = BuildReport {
            source,
            scanned: consumed.scanned,
            indexed: self.index.len() as u64,
            dropped_orphans,
            elapsed,
            records_per_second: if secs > 0.0 {
                (consumed.scanned as f64 / secs) as u64
            } else {
                0
            },
            complete,
            locations: locations
                .into_iter()
                .map(|l| (l, status.clone()))
                .collect(),
        };
        info!(
            "index build done: scanned={} indexed={} orphans={} in {}ms",
            report.scanned,
            report.indexed,
            report.dropped_orphans,
            report.elapsed.as_millis()
        );
        Ok(report)
    }

    fn spawn_walk_producer(
        &self,
        locations: &[String],
        tx: Sender<CompactRecord>,
        cancel: &CancellationToken,
    ) {
        let walk_options = EnumerationOptions {
            include_hidden: self.options.include_hidden,
            include_system: self.options.include_system,
            max_depth: self.options.max_depth,
            follow_symlinks: self.options.follow_symlinks,
            excluded_paths: self.options.excluded_paths.clone(),
            excluded_extensions: self.options.excluded_extensions.clone(),
            max_file_size: self.options.max_file_size,
        };
        let records = self.provider.enumerate(locations, &walk_options, cancel);
        let index = Arc::clone(&self.index);
        let cancel = cancel.clone();
        std::thread::spawn(move || {
            for full in records {
                if cancel.is_cancelled() {
                    break;
                }
                // Self-parented records mark location roots; they are
                // registered, not queued.
                if full.file_ref == full.parent_ref {
                    index.register_root(full.file_ref, &full.path);
                    continue;
                }
                let compact = full.to_compact(index.pool());
                if tx.send(compact).is_err() {
                    break;
                }
            }
        });
    }

    #[cfg(target_os = "windows")]
    fn spawn_mft_producers(
        &self,
        locations: &[String],
        tx: Sender<CompactRecord>,
        cancel: &CancellationToken,
    ) {
        for location in locations {
            let volume = location.trim_end_matches('\\').to_string();
            let tx = tx.clone();
            let index = Arc::clone(&self.index);
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                if let Err(e) = crate::win::mft::drain_volume(&volume, &index, &tx, &cancel) {
                    if e.is_volume_local() {
                        warn!("volume {volume} skipped: {e}");
                    } else {
                        warn!("volume {volume} failed: {e}");
                    }
                }
            });
        }
        drop(tx);
    }

    #[cfg(not(target_os = "windows"))]
    fn spawn_mft_producers(
        &self,
        locations: &[String],
        tx: Sender<CompactRecord>,
        cancel: &CancellationToken,
    ) {
        // Unreachable by construction: pick_source never selects RawMft
        // without platform support. Degrade to the walk.
        self.spawn_walk_producer(locations, tx, cancel)
    }

    fn consume(
        &self,
        rx: Receiver<CompactRecord>,
        progress: &ProgressFn,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<Consumed> {
        let mut scanned: u64 = 0;
        let mut batch: Vec<CompactRecord> = Vec::with_capacity(BULK_BATCH_SIZE);
        let mut last_progress = Instant::now();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match rx.recv_timeout(PROGRESS_INTERVAL) {
                Ok(rec) => {
                    scanned += 1;
                    batch.push(rec);
                    if batch.len() >= BULK_BATCH_SIZE {
                        self.apply_batch(&mut batch)?;
                        self.report(progress, scanned, started);
                        last_progress = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if !batch.is_empty() {
                        self.apply_batch(&mut batch)?;
                    }
                    if last_progress.elapsed() >= PROGRESS_INTERVAL {
                        self.report(progress, scanned, started);
                        last_progress = Instant::now();
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if !batch.is_empty() {
            self.apply_batch(&mut batch)?;
        }
        self.report(progress, scanned, started);
        Ok(Consumed { scanned })
    }

    /// Apply one batch to the index, then hand the resolvable records to
    /// the persistence sink in `batch_size` chunks. A failed sink chunk
    /// is retried once, then the build fails.
    fn apply_batch(&self, batch: &mut Vec<CompactRecord>) -> Result<()> {
        let records = std::mem::take(batch);
        self.index.insert_batch(&records);

        let Some(sink) = self.persistence.as_deref() else {
            return Ok(());
        };
        let full: Vec<FullRecord> = records
            .iter()
            .filter_map(|rec| self.index.to_full(rec).ok())
            .collect();
        for chunk in full.chunks(self.options.batch_size.max(1)) {
            if let Err(first) = sink.add_batch(chunk) {
                warn!("persistence batch failed, retrying once: {first}");
                sink.add_batch(chunk).map_err(|second| {
                    FastFindError::Persistence(format!("batch failed twice: {second}"))
                })?;
            }
        }
        Ok(())
    }

    fn report(&self, progress: &ProgressFn, scanned: u64, started: Instant) {
        progress(IndexingProgress {
            scanned,
            indexed: self.index.len() as u64,
            current_volume: String::new(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }

    /// Opt-in follow-up pass: the MFT carries no sizes, so stat the files
    /// on disk in parallel and backfill the size index.
    fn collect_sizes(&self, cancel: &CancellationToken) {
        let mut targets: Vec<(crate::record::FileRef, String)> = Vec::new();
        self.index.for_each_record(|rec| {
            if !rec.is_directory() {
                if let Ok(path) = self.index.full_path(&rec) {
                    targets.push((rec.file_ref(), path));
                }
            }
            !cancel.is_cancelled()
        });
        debug!("size collection pass over {} file(s)", targets.len());

        let stat_all = || -> Vec<(crate::record::FileRef, u64)> {
            targets
                .par_iter()
                .filter_map(|(file_ref, path)| {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    std::fs::metadata(path).ok().map(|m| (*file_ref, m.len()))
                })
                .collect()
        };
        // Stat on the configured worker count rather than rayon's global
        // default, so callers can keep the pass off the whole machine.
        let sizes = match rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.parallel_threads.max(1))
            .build()
        {
            Ok(pool) => pool.install(stat_all),
            Err(_) => stat_all(),
        };
        for (file_ref, size) in sizes {
            self.index.set_size(file_ref, size);
        }
    }
}

struct Consumed {
    scanned: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryPersistence;
    use crate::provider::WalkProvider;
    use crate::strings::StringPool;
    use std::fs;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn build_tree(root: &std::path::Path) {
        fs::create_dir_all(root.join("SubA")).unwrap();
        fs::create_dir_all(root.join("SubB/Deep")).unwrap();
        fs::write(root.join("test.txt"), b"1").unwrap();
        fs::write(root.join("SubA/test_a1.txt"), b"22").unwrap();
        fs::write(root.join("SubA/test_a2.txt"), b"333").unwrap();
        fs::write(root.join("SubB/test_b1.txt"), b"4444").unwrap();
        fs::write(root.join("SubB/Deep/test_deep.txt"), b"55555").unwrap();
    }

    fn pipeline_for(
        root: &std::path::Path,
        persistence: Option<Arc<dyn IndexPersistence>>,
    ) -> (Arc<FileIndex>, IndexingPipeline) {
        let index = Arc::new(FileIndex::new(Arc::new(StringPool::new(true)), true));
        let options = IndexingOptions {
            specific_directories: vec![root.to_string_lossy().into_owned()],
            enable_monitoring: false,
            ..Default::default()
        };
        let pipeline = IndexingPipeline::new(
            Arc::clone(&index),
            Arc::new(WalkProvider::new()),
            persistence,
            options,
        );
        (index, pipeline)
    }

    #[test]
    fn walk_build_indexes_whole_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Panel1");
        build_tree(&root);

        let (index, pipeline) = pipeline_for(&root, None);
        let report = pipeline
            .build(&|_| {}, &CancellationToken::new())
            .unwrap();

        assert_eq!(report.source, IngestSource::FilesystemWalk);
        assert!(report.complete);
        // 5 files + 3 directories (root itself is registered, not indexed).
        assert_eq!(index.len(), 8);
        assert_eq!(report.dropped_orphans, 0);
        assert_eq!(index.counts().files, 5);
        assert_eq!(index.counts().directories, 3);
        assert!(report
            .locations
            .iter()
            .all(|(_, s)| *s == LocationStatus::Indexed));
    }

    #[test]
    fn build_feeds_persistence_in_batches() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Panel1");
        build_tree(&root);

        let sink = Arc::new(MemoryPersistence::new());
        let (_, pipeline) = pipeline_for(&root, Some(Arc::clone(&sink) as Arc<dyn IndexPersistence>));
        pipeline.build(&|_| {}, &CancellationToken::new()).unwrap();
        assert_eq!(sink.len(), 8);
    }

    #[test]
    fn progress_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Panel1");
        build_tree(&root);

        let (_, pipeline) = pipeline_for(&root, None);
        let calls = Arc::new(AtomicU64::new(0));
        let calls_cb = Arc::clone(&calls);
        pipeline
            .build(
                &move |_| {
                    calls_cb.fetch_add(1, Ordering::Relaxed);
                },
                &CancellationToken::new(),
            )
            .unwrap();
        assert!(calls.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn cancelled_build_reports_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Panel1");
        build_tree(&root);

        let (_, pipeline) = pipeline_for(&root, None);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = pipeline.build(&|_| {}, &cancel).unwrap();
        assert!(!report.complete);
        assert!(report
            .locations
            .iter()
            .all(|(_, s)| *s == LocationStatus::Outdated));
    }

    #[test]
    fn walk_build_collects_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Panel1");
        build_tree(&root);

        let (index, pipeline) = pipeline_for(&root, None);
        pipeline.build(&|_| {}, &CancellationToken::new()).unwrap();
        // Sizes come straight from the walk metadata.
        assert_eq!(index.refs_in_size_range(5, 5).len(), 1);
    }
}
