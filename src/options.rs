use serde::{Deserialize, Serialize};

/// Default cap on indexed file size (100 MiB). Only consulted when sizes
/// are collected; the MFT-only path has no sizes to compare.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Knobs for an index build. Everything has a default so callers write
/// `IndexingOptions { enable_monitoring: false, ..Default::default() }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingOptions {
    /// Explicit directories to index. Empty means whole volumes.
    pub specific_directories: Vec<String>,
    /// Volumes to index by drive letter / mount point. Empty means all
    /// local fixed NTFS volumes.
    pub mount_points: Vec<String>,
    /// Glob patterns; matching paths are pruned during ingest.
    pub excluded_paths: Vec<String>,
    /// Lower-cased extensions (with or without dot) to skip.
    pub excluded_extensions: Vec<String>,
    pub include_hidden: bool,
    pub include_system: bool,
    /// None disables the cap.
    pub max_file_size: Option<u64>,
    pub max_depth: Option<usize>,
    pub follow_symlinks: bool,
    /// Worker threads for enumeration; defaults to the CPU count.
    pub parallel_threads: usize,
    /// Records per persistence batch.
    pub batch_size: usize,
    pub enable_monitoring: bool,
    /// Periodic persistence flush; None disables.
    pub auto_save_interval_secs: Option<u64>,
    pub compress_index: bool,
    /// Sizes are unavailable from the MFT-only path; opting in schedules a
    /// follow-up stat pass and populates the size index.
    pub collect_file_size: bool,
    /// Journal poll interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for IndexingOptions {
    fn default() -> Self {
        IndexingOptions {
            specific_directories: Vec::new(),
            mount_points: Vec::new(),
            excluded_paths: Vec::new(),
            excluded_extensions: Vec::new(),
            include_hidden: true,
            include_system: true,
            max_file_size: Some(DEFAULT_MAX_FILE_SIZE),
            max_depth: None,
            follow_symlinks: false,
            parallel_threads: default_parallelism(),
            batch_size: 1000,
            enable_monitoring: true,
            auto_save_interval_secs: Some(300),
            compress_index: false,
            collect_file_size: false,
            poll_interval_ms: 100,
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl IndexingOptions {
    /// Extension exclusion check, tolerant of a missing leading dot in the
    /// configured list.
    pub fn excludes_extension(&self, ext: &str) -> bool {
        let ext = ext.trim_start_matches('.').to_lowercase();
        self.excluded_extensions
            .iter()
            .any(|e| e.trim_start_matches('.').to_lowercase() == ext)
    }
}
