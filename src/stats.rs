use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::index::IndexCounts;
use crate::strings::PoolStats;

/// Per-location lifecycle, reported through `indexing_stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LocationStatus {
    NotIndexed,
    Indexing,
    Indexed,
    Monitoring,
    Outdated,
    Error(String),
    NotFound,
}

/// What happened to a file, as published to change subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileChangeEvent {
    pub kind: FileChangeKind,
    /// Previous path, set for renames.
    pub old_path: Option<String>,
    pub path: String,
    pub timestamp_ticks: u64,
}

/// Progress snapshot emitted by the pipeline every 500 ms or at each
/// batch boundary.
#[derive(Debug, Clone, Serialize)]
pub struct IndexingProgress {
    pub scanned: u64,
    pub indexed: u64,
    pub current_volume: String,
    pub elapsed_ms: u64,
}

/// Build + steady-state statistics for the whole engine.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexingStats {
    pub counts: IndexCounts,
    pub pool: Option<PoolStats>,
    pub locations: HashMap<String, LocationStatus>,
    pub scanned: u64,
    pub indexed: u64,
    pub skipped: u64,
    pub parse_errors: u64,
    pub records_per_second: u64,
    pub build_elapsed_ms: u64,
    pub monitoring: bool,
}

impl IndexingStats {
    /// Average retained bytes per indexed record, strings included.
    pub fn bytes_per_record(&self) -> u64 {
        if self.counts.records == 0 {
            return 0;
        }
        self.counts.retained_bytes / self.counts.records as u64
    }

    /// Pretty JSON rendering for status endpoints and diagnostics.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

/// Rolling query statistics for `search_stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchStats {
    pub queries: u64,
    pub failed_queries: u64,
    pub total_elapsed_ms: u64,
    pub last_query: Option<String>,
}

impl SearchStats {
    pub fn record(&mut self, query_text: &str, elapsed: Duration, failed: bool) {
        self.queries += 1;
        if failed {
            self.failed_queries += 1;
        }
        self.total_elapsed_ms += elapsed.as_millis() as u64;
        self.last_query = Some(query_text.to_string());
    }

    pub fn average_elapsed_ms(&self) -> u64 {
        if self.queries == 0 {
            0
        } else {
            self.total_elapsed_ms / self.queries
        }
    }
}
