//! The aggregate in-memory index: record store, path trie, extension
//! buckets and the optional size index, all sharing one string pool.
//!
//! Writer discipline: one ingest writer per volume during bulk build, the
//! journal sync adapter afterwards. Readers never block writers on the
//! sharded structures; the trie sits behind a read/write lock whose write
//! sections are batch-scoped and whose read sections only collect refs,
//! never materialize strings.

mod buckets;
mod store;
mod trie;

pub use buckets::{ExtensionBuckets, SizeIndex};
pub use store::RecordStore;
pub use trie::{PathTrie, TrieNode};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{FastFindError, Result};
use crate::record::{CompactRecord, FileRef, FullRecord};
use crate::strings::{StringId, StringPool, PATH_SEPARATOR};

/// Longest parent chain the resolver will walk before declaring the chain
/// broken. NTFS paths max out around 2^15 bytes; 4096 components is far
/// beyond anything a live volume produces.
const MAX_PARENT_DEPTH: usize = 4096;

/// Where a base path lands relative to the indexed volumes.
#[derive(Debug, Clone, PartialEq)]
pub enum BasePlan {
    /// Resolved to an existing trie node.
    Segments(Vec<StringId>),
    /// Under an indexed root, but no such directory exists.
    NotFound,
    /// No indexed root covers it; the caller may fall back to walking the
    /// live filesystem.
    Foreign,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct IndexCounts {
    pub records: usize,
    pub files: u64,
    pub directories: u64,
    pub pending: usize,
    pub dropped_orphans: u64,
    pub retained_bytes: u64,
}

pub struct FileIndex {
    pool: Arc<StringPool>,
    store: RecordStore,
    trie: RwLock<PathTrie>,
    extensions: ExtensionBuckets,
    sizes: SizeIndex,
    /// record number of a volume root → path id of its label (e.g. `c:`).
    roots: DashMap<u64, StringId>,
    /// label path id → root file_ref, for absolute base-path resolution.
    root_labels: DashMap<StringId, FileRef>,
    /// Records whose parent was not indexed yet; retried until the ingest
    /// settles, then dropped and counted.
    pending: Mutex<Vec<CompactRecord>>,
    files: AtomicU64,
    directories: AtomicU64,
    dropped_orphans: AtomicU64,
}

impl FileIndex {
    pub fn new(pool: Arc<StringPool>, collect_sizes: bool) -> Self {
        FileIndex {
            pool,
            store: RecordStore::new(),
            trie: RwLock::new(PathTrie::new()),
            extensions: ExtensionBuckets::new(),
            sizes: SizeIndex::new(collect_sizes),
            roots: DashMap::new(),
            root_labels: DashMap::new(),
            pending: Mutex::new(Vec::new()),
            files: AtomicU64::new(0),
            directories: AtomicU64::new(0),
            dropped_orphans: AtomicU64::new(0),
        }
    }

    pub fn pool(&self) -> &Arc<StringPool> {
        &self.pool
    }

    /// Declare a volume (or walk location) root. Records whose parent
    /// chain reaches `root_ref` resolve their paths under `label`.
    pub fn register_root(&self, root_ref: FileRef, label: &str) -> StringId {
        let label_id = self.pool.intern_path(label);
        self.roots.insert(root_ref.record_number(), label_id);
        self.root_labels.insert(label_id, root_ref);
        label_id
    }

    pub fn is_root(&self, file_ref: FileRef) -> bool {
        self.roots.contains_key(&file_ref.record_number())
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    // ── mutation ──────────────────────────────────────────────────────────

    /// Insert or replace one record. Returns false when the parent chain
    /// is not resolvable yet; the record is queued and retried by
    /// `flush_pending`.
    pub fn insert(&self, rec: CompactRecord) -> bool {
        if self.insert_now(rec) {
            return true;
        }
        self.pending.lock().push(rec);
        false
    }

    /// Bulk variant. Returns the number of records linked immediately;
    /// the rest joins the pending queue.
    pub fn insert_batch(&self, recs: &[CompactRecord]) -> usize {
        let mut inserted = 0;
        let mut deferred = Vec::new();
        for &rec in recs {
            if self.insert_now(rec) {
                inserted += 1;
            } else {
                deferred.push(rec);
            }
        }
        if !deferred.is_empty() {
            self.pending.lock().append(&mut deferred);
        }
        inserted
    }

    fn insert_now(&self, rec: CompactRecord) -> bool {
        if self.is_root(rec.file_ref()) {
            // Volume roots are registered, not indexed.
            return true;
        }
        let Some(segments) = self.parent_segments(rec.parent_ref()) else {
            return false;
        };
        if let Some(old) = self.store.get(rec.file_ref()) {
            self.unlink(&old);
        }
        self.store.insert_or_replace(rec);
        self.trie.write().insert(&segments, rec.file_ref());

        let ext_id = self.extension_id_of(&rec);
        self.extensions.add(ext_id, rec.file_ref());
        if rec.is_directory() {
            self.directories.fetch_add(1, Ordering::Relaxed);
        } else {
            self.sizes.add(rec.size(), rec.file_ref());
            self.files.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    fn extension_id_of(&self, rec: &CompactRecord) -> StringId {
        if rec.is_directory() {
            return StringId::EMPTY;
        }
        let name = self.pool.resolve(rec.name_id());
        match CompactRecord::extension_of(&name) {
            Some(ext) => self.pool.intern_extension(&ext),
            None => StringId::EMPTY,
        }
    }

    fn unlink(&self, rec: &CompactRecord) {
        if let Some(segments) = self.parent_segments(rec.parent_ref()) {
            self.trie.write().remove(&segments, rec.file_ref());
        }
        self.extensions.remove(self.extension_id_of(rec), rec.file_ref());
        if rec.is_directory() {
            self.directories.fetch_sub(1, Ordering::Relaxed);
        } else {
            self.sizes.remove(rec.size(), rec.file_ref());
            self.files.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Retry queued orphans until no further progress. Returns how many
    /// are still unresolved (they stay queued; `drain_orphans` discards).
    pub fn flush_pending(&self) -> usize {
        loop {
            let queued = std::mem::take(&mut *self.pending.lock());
            if queued.is_empty() {
                return 0;
            }
            let before = queued.len();
            let mut still = Vec::new();
            for rec in queued {
                if !self.insert_now(rec) {
                    still.push(rec);
                }
            }
            let after = still.len();
            if after > 0 {
                self.pending.lock().append(&mut still);
            }
            if after == 0 {
                return 0;
            }
            if after == before {
                return after;
            }
        }
    }

    /// Drop whatever `flush_pending` could not place and count it.
    pub fn drain_orphans(&self) -> u64 {
        let remaining = std::mem::take(&mut *self.pending.lock());
        let n = remaining.len() as u64;
        self.dropped_orphans.fetch_add(n, Ordering::Relaxed);
        n
    }

    /// Remove a record. Returns the record and its resolved full path
    /// (resolved before removal, while the parent chain is still intact).
    pub fn remove(&self, file_ref: FileRef) -> Option<(CompactRecord, String)> {
        let rec = self.store.get(file_ref)?;
        let path = self.full_path(&rec).unwrap_or_default();
        self.unlink(&rec);
        self.store.remove(file_ref);
        Some((rec, path))
    }

    /// Replace the record's metadata in place. Falls back to insert when
    /// the ref is unknown (journal updates can outrun the initial scan).
    pub fn update(&self, rec: CompactRecord) -> bool {
        self.insert(rec)
    }

    /// Size-only update for the follow-up collection pass: touches the
    /// store and size index, leaves the trie and buckets alone.
    pub fn set_size(&self, file_ref: FileRef, size: u64) {
        let Some(mut rec) = self.store.get(file_ref) else {
            return;
        };
        if rec.is_directory() || rec.size() == size {
            return;
        }
        self.sizes.remove(rec.size(), file_ref);
        rec.size = size;
        self.store.insert_or_replace(rec);
        self.sizes.add(size, file_ref);
    }

    // ── lookup ────────────────────────────────────────────────────────────

    pub fn get(&self, file_ref: FileRef) -> Option<CompactRecord> {
        self.store.get(file_ref)
    }

    pub fn contains(&self, file_ref: FileRef) -> bool {
        self.store.contains(file_ref)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn for_each_record(&self, f: impl FnMut(CompactRecord) -> bool) {
        self.store.for_each(f)
    }

    /// Segment ids of the directory containing records under `parent`:
    /// `[root_label, dir, dir, ...]`. None when the chain is broken.
    fn parent_segments(&self, parent: FileRef) -> Option<Vec<StringId>> {
        let mut segments = Vec::new();
        let mut current = parent;
        for _ in 0..MAX_PARENT_DEPTH {
            if let Some(label) = self.roots.get(&current.record_number()) {
                segments.push(*label);
                segments.reverse();
                return Some(segments);
            }
            let dir = self.store.get(current)?;
            if !dir.is_directory() {
                return None;
            }
            let name = self.pool.resolve(dir.name_id());
            segments.push(self.pool.intern_path(&name));
            current = dir.parent_ref();
        }
        None
    }

    /// Full path of a record: root label + directory chain + name, joined
    /// with the canonical separator.
    pub fn full_path(&self, rec: &CompactRecord) -> Result<String> {
        let segments = self
            .parent_segments(rec.parent_ref())
            .ok_or(FastFindError::PathNotResolvable(rec.file_ref()))?;
        let mut path = String::new();
        for seg in &segments {
            if !path.is_empty() {
                path.push(PATH_SEPARATOR);
            }
            path.push_str(&self.pool.resolve(*seg));
        }
        if !path.is_empty() {
            path.push(PATH_SEPARATOR);
        }
        path.push_str(&self.pool.resolve(rec.name_id()));
        Ok(path)
    }

    /// Materialize the wide record. Created/accessed default to modified;
    /// the compact form does not retain them.
    pub fn to_full(&self, rec: &CompactRecord) -> Result<FullRecord> {
        let path = self.full_path(rec)?;
        Ok(FullRecord {
            file_ref: rec.file_ref(),
            parent_ref: rec.parent_ref(),
            name: self.pool.resolve(rec.name_id()).to_string(),
            path,
            attributes: rec.attributes(),
            size: rec.size(),
            created_ticks: rec.modified_ticks(),
            accessed_ticks: rec.modified_ticks(),
            modified_ticks: rec.modified_ticks(),
        })
    }

    /// Split a query path into trie segments without interning anything:
    /// unknown segments mean the path cannot match.
    fn lookup_segments(&self, normalized: &str) -> Option<Vec<StringId>> {
        let mut segments = Vec::new();
        for part in normalized.split(PATH_SEPARATOR).filter(|s| !s.is_empty()) {
            segments.push(self.pool.try_get_path(part)?);
        }
        Some(segments)
    }

    /// Resolve a query base path. Absolute form first (leading segment is
    /// a root label), then relative to each registered root.
    pub fn base_plan(&self, base_path: &str) -> BasePlan {
        let normalized = self.pool.normalize_path(base_path);
        let trie = self.trie.read();

        if let Some(segments) = self.lookup_segments(&normalized) {
            if let Some(first) = segments.first() {
                if self.root_labels.contains_key(first) {
                    return if trie.node_at(&segments).is_some() {
                        BasePlan::Segments(segments)
                    } else {
                        BasePlan::NotFound
                    };
                }
            }
            // Relative: probe under every root, first hit wins.
            for label in self.root_labels.iter() {
                let mut candidate = Vec::with_capacity(segments.len() + 1);
                candidate.push(*label.key());
                candidate.extend_from_slice(&segments);
                if trie.node_at(&candidate).is_some() {
                    return BasePlan::Segments(candidate);
                }
            }
        }

        // Unresolvable segments under a known root are a miss, not foreign.
        let first = normalized
            .split(PATH_SEPARATOR)
            .find(|s| !s.is_empty())
            .unwrap_or("");
        let looks_like_drive = first.contains(':');
        let known_root = self
            .pool
            .try_get_path(first)
            .map_or(false, |id| self.root_labels.contains_key(&id));
        if self.root_labels.is_empty() || (looks_like_drive && !known_root) {
            BasePlan::Foreign
        } else {
            BasePlan::NotFound
        }
    }

    /// Records under a resolved base, read under one short trie section.
    pub fn collect_under(&self, segments: &[StringId], recursive: bool) -> Vec<FileRef> {
        self.trie.read().collect(segments, recursive)
    }

    pub fn refs_with_extension(&self, ext: &str) -> Vec<FileRef> {
        match self.pool.try_get_extension(ext) {
            Some(id) => self.extensions.refs(id),
            None => Vec::new(),
        }
    }

    pub fn extension_bucket_len(&self, ext: &str) -> usize {
        self.pool
            .try_get_extension(ext)
            .map(|id| self.extensions.bucket_len(id))
            .unwrap_or(0)
    }

    pub fn size_index_enabled(&self) -> bool {
        self.sizes.enabled()
    }

    pub fn refs_in_size_range(&self, min: u64, max: u64) -> Vec<FileRef> {
        self.sizes.range(min, max)
    }

    /// Exact-path lookup for the `get_file` API.
    pub fn find_by_path(&self, path: &str) -> Option<CompactRecord> {
        let normalized = self.pool.normalize_path(path);
        let (dir, leaf) = match normalized.rfind(PATH_SEPARATOR) {
            Some(pos) => (&normalized[..pos], &normalized[pos + 1..]),
            None => ("", normalized.as_str()),
        };
        if leaf.is_empty() {
            return None;
        }
        let plan = self.base_plan(dir);
        let BasePlan::Segments(segments) = plan else {
            return None;
        };
        let refs = self.collect_under(&segments, false);
        let fold = self.pool.fold_path_case();
        refs.into_iter()
            .filter_map(|r| self.store.get(r))
            .find(|rec| {
                let name = self.pool.resolve(rec.name_id());
                if fold {
                    name.eq_ignore_ascii_case(leaf) || name.to_lowercase() == leaf
                } else {
                    &*name == leaf
                }
            })
    }

    pub fn counts(&self) -> IndexCounts {
        IndexCounts {
            records: self.store.len(),
            files: self.files.load(Ordering::Relaxed),
            directories: self.directories.load(Ordering::Relaxed),
            pending: self.pending.lock().len(),
            dropped_orphans: self.dropped_orphans.load(Ordering::Relaxed),
            retained_bytes: self.store.retained_bytes() + self.pool.stats().retained_bytes,
        }
    }
}
