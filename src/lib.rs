//! # fastfind
//!
//! Instant local file search: an in-memory index of every file and
//! directory on a set of volumes, built by bulk-reading NTFS metadata
//! (MFT + USN change journal) when privileged and by walking the
//! filesystem otherwise, answering name/path/attribute queries with
//! millisecond latency across millions of records.
//!
//! The pieces, leaves first: a string pool and a 40-byte compact record,
//! a raw-volume reader streaming those records, the concurrent index
//! (hash store, path trie, extension buckets, size index), a streaming
//! search engine with a SIMD substring matcher, and a journal monitor
//! keeping the index live. `create_engine` wires them together.
//!
//! ```no_run
//! use fastfind::{create_engine, IndexingOptions, Platform, SearchQuery};
//!
//! let engine = create_engine(Platform::Auto);
//! engine.start_indexing(IndexingOptions::default()).unwrap();
//! let mut result = engine.search(SearchQuery::for_text("report"));
//! for hit in result.files() {
//!     println!("{}", hit.path);
//! }
//! ```

pub mod cancel;
pub mod engine;
pub mod error;
pub mod index;
pub mod monitor;
pub mod options;
pub mod persist;
pub mod pipeline;
pub mod provider;
pub mod query;
pub mod record;
pub mod search;
pub mod stats;
pub mod strings;
pub mod usn;
pub mod win;

pub use cancel::CancellationToken;
pub use engine::{create_engine, Platform, SearchEngine};
pub use error::{FastFindError, Result};
pub use index::{BasePlan, FileIndex, IndexCounts};
pub use monitor::{ChangeRecord, JournalCursor, MonitorState, SyncAdapter, UsnMonitor};
pub use options::IndexingOptions;
pub use persist::{IndexPersistence, MemoryPersistence, PersistenceStats};
pub use pipeline::{BuildReport, IndexingPipeline, IngestSource};
pub use provider::{EnumerationOptions, FileSystemProvider, WalkProvider};
pub use query::{SearchQuery, TextPlan};
pub use record::{CompactRecord, FileAttributes, FileRef, FullRecord};
pub use search::{SearchMetrics, SearchResult};
pub use stats::{
    FileChangeEvent, FileChangeKind, IndexingProgress, IndexingStats, LocationStatus, SearchStats,
};
pub use strings::{StringId, StringPool};
pub use usn::ChangeReason;
pub use win::VolumeInfo;
