use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::cancel::CancellationToken;
use crate::query::SearchQuery;
use crate::record::FullRecord;

/// Matches are handed to the consumer through a bounded channel; a slow
/// consumer back-pressures the producer instead of buffering the volume.
const RESULT_CHANNEL_CAPACITY: usize = 1024;

/// Counters the producer updates while the stream runs. All monotonic, so
/// a consumer polling mid-flight sees non-decreasing values.
#[derive(Default)]
struct Shared {
    total_matches: AtomicU64,
    scanned: AtomicU64,
    dropped_unresolvable: AtomicU64,
    complete: AtomicBool,
    has_more: AtomicBool,
    finished: AtomicBool,
}

/// Point-in-time view of the stream counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct SearchMetrics {
    pub scanned: u64,
    pub matched: u64,
    pub dropped_unresolvable: u64,
}

/// Head of one search: the query it answers, live counters, and the lazy
/// ordered sequence of matches. Single consumer; finite; cancellable.
pub struct SearchResult {
    query: SearchQuery,
    rx: Option<Receiver<FullRecord>>,
    shared: Arc<Shared>,
    error_message: Option<String>,
    started: Instant,
    cancel: CancellationToken,
}

impl SearchResult {
    /// Open a stream pair: the result for the consumer, the sink for the
    /// producing thread.
    pub(crate) fn open(query: SearchQuery, cancel: CancellationToken) -> (Self, ResultSink) {
        let (tx, rx) = bounded(RESULT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared::default());
        let result = SearchResult {
            query,
            rx: Some(rx),
            shared: Arc::clone(&shared),
            error_message: None,
            started: Instant::now(),
            cancel: cancel.clone(),
        };
        let sink = ResultSink { tx, shared, cancel };
        (result, sink)
    }

    /// A search that failed validation: empty stream, message set.
    pub(crate) fn failed(query: SearchQuery, message: impl Into<String>) -> Self {
        SearchResult {
            query,
            rx: None,
            shared: Arc::new(Shared::default()),
            error_message: Some(message.into()),
            started: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn query(&self) -> &SearchQuery {
        &self.query
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn is_failed(&self) -> bool {
        self.error_message.is_some()
    }

    /// Blocking iterator over the matches, in producer order. Taking it a
    /// second time yields an empty iterator (single consumer).
    pub fn files(&mut self) -> impl Iterator<Item = FullRecord> + '_ {
        self.rx.take().into_iter().flat_map(|rx| rx.into_iter())
    }

    /// Drain the whole stream into a vector.
    pub fn collect_files(&mut self) -> Vec<FullRecord> {
        self.files().collect()
    }

    /// Non-decreasing count of matches produced so far.
    pub fn total_matches(&self) -> u64 {
        self.shared.total_matches.load(Ordering::Acquire)
    }

    /// True once the producer exhausted its source. False while running,
    /// after cancellation, or when the source failed mid-stream.
    pub fn is_complete(&self) -> bool {
        self.shared.complete.load(Ordering::Acquire)
    }

    /// True when `max_results` truncated the stream while matches remained.
    pub fn has_more_results(&self) -> bool {
        self.shared.has_more.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> SearchMetrics {
        SearchMetrics {
            scanned: self.shared.scanned.load(Ordering::Acquire),
            matched: self.shared.total_matches.load(Ordering::Acquire),
            dropped_unresolvable: self.shared.dropped_unresolvable.load(Ordering::Acquire),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Stop the producer; pending work completes the current record.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Producer half of a result stream.
pub(crate) struct ResultSink {
    tx: Sender<FullRecord>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl ResultSink {
    /// Send one match. Returns false when the producer should stop: the
    /// consumer went away or the search was cancelled.
    pub fn push(&self, record: FullRecord) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if self.tx.send(record).is_err() {
            return false;
        }
        self.shared.total_matches.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub fn record_scanned(&self) {
        self.shared.scanned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unresolvable(&self) {
        self.shared.dropped_unresolvable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Mark that matches remained beyond the truncation point.
    pub fn mark_has_more(&self) {
        self.shared.has_more.store(true, Ordering::Release);
    }

    /// Close the stream. `complete` is true only when the source was
    /// exhausted normally.
    pub fn finish(self, complete: bool) {
        self.shared.complete.store(complete, Ordering::Release);
        self.shared.finished.store(true, Ordering::Release);
        // Dropping the sender ends the consumer's iteration.
    }
}
