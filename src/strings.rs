use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

/// Canonical path separator. Interned path segments and materialized full
/// paths always use this form; forward slashes are folded on the way in.
pub const PATH_SEPARATOR: char = '\\';

/// Opaque 32-bit handle into the string pool. Id 0 is the reserved empty
/// string. Ids are stable for the lifetime of the process and never freed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[repr(transparent)]
pub struct StringId(pub(crate) u32);

impl StringId {
    pub const EMPTY: StringId = StringId(0);

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Debug for StringId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StringId({})", self.0)
    }
}

/// One forward map: canonical string → id. The id → string table is shared
/// across sub-pools so `resolve` needs no pool discrimination.
struct SubPool {
    map: DashMap<Arc<str>, u32>,
}

impl SubPool {
    fn new() -> Self {
        SubPool { map: DashMap::new() }
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Process-wide string interner with three specialized sub-pools:
/// *paths* (separator-canonicalized, case-folded on case-insensitive
/// volumes), *names* (case preserved) and *extensions* (lower-cased,
/// leading dot). Interning always succeeds; empty input maps to id 0.
///
/// Readers are wait-free through the sharded forward maps; id publication
/// pairs the table write (release) with `resolve`'s read (acquire), so a
/// thread that observes an id can always resolve it.
pub struct StringPool {
    paths: SubPool,
    names: SubPool,
    extensions: SubPool,
    /// id → string. Slot 0 is the empty string.
    table: RwLock<Vec<Arc<str>>>,
    next_id: AtomicU32,
    /// Retained bytes across all interned strings (for memory accounting).
    retained_bytes: AtomicU64,
    /// Paths fold case when the volume says it is case-insensitive.
    fold_path_case: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub path_strings: usize,
    pub name_strings: usize,
    pub extension_strings: usize,
    pub total_ids: u32,
    pub retained_bytes: u64,
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new(true)
    }
}

impl StringPool {
    pub fn new(fold_path_case: bool) -> Self {
        let empty: Arc<str> = Arc::from("");
        StringPool {
            paths: SubPool::new(),
            names: SubPool::new(),
            extensions: SubPool::new(),
            table: RwLock::new(vec![empty]),
            next_id: AtomicU32::new(1),
            retained_bytes: AtomicU64::new(0),
            fold_path_case,
        }
    }

    pub fn fold_path_case(&self) -> bool {
        self.fold_path_case
    }

    /// Resolve an id to its string. Empty for id 0 and for ids this pool
    /// never handed out.
    pub fn resolve(&self, id: StringId) -> Arc<str> {
        let table = self.table.read();
        match table.get(id.0 as usize) {
            Some(s) => Arc::clone(s),
            None => Arc::clone(&table[0]),
        }
    }

    // ── names (case preserved) ────────────────────────────────────────────

    pub fn intern_name(&self, name: &str) -> StringId {
        self.intern_span(&self.names, name)
    }

    pub fn try_get_name(&self, span: &str) -> Option<StringId> {
        Self::try_get(&self.names, span)
    }

    // ── paths (canonical separator, optional case fold) ───────────────────

    /// Normalize a path or path segment: forward slashes become the
    /// canonical separator, case folds on case-insensitive volumes.
    pub fn normalize_path(&self, path: &str) -> String {
        let replaced = path.replace('/', "\\");
        if self.fold_path_case {
            replaced.to_lowercase()
        } else {
            replaced
        }
    }

    pub fn intern_path(&self, path: &str) -> StringId {
        if path.is_empty() {
            return StringId::EMPTY;
        }
        // Fast path: already canonical, intern the span without allocating.
        if !path.contains('/') && (!self.fold_path_case || !path.chars().any(|c| c.is_uppercase()))
        {
            return self.intern_span(&self.paths, path);
        }
        let normalized = self.normalize_path(path);
        self.intern_span(&self.paths, &normalized)
    }

    /// Read-only span lookup against the path pool; the span is normalized
    /// in place only when it is not already canonical.
    pub fn try_get_path(&self, span: &str) -> Option<StringId> {
        if span.is_empty() {
            return Some(StringId::EMPTY);
        }
        if !span.contains('/') && (!self.fold_path_case || !span.chars().any(|c| c.is_uppercase()))
        {
            return Self::try_get(&self.paths, span);
        }
        let normalized = self.normalize_path(span);
        Self::try_get(&self.paths, &normalized)
    }

    // ── extensions (lower-case, leading dot) ──────────────────────────────

    pub fn normalize_extension(ext: &str) -> String {
        let trimmed = ext.trim();
        if trimmed.is_empty() {
            return String::new();
        }
        if trimmed.starts_with('.') {
            trimmed.to_lowercase()
        } else {
            format!(".{}", trimmed.to_lowercase())
        }
    }

    pub fn intern_extension(&self, ext: &str) -> StringId {
        let normalized = Self::normalize_extension(ext);
        if normalized.is_empty() {
            return StringId::EMPTY;
        }
        self.intern_span(&self.extensions, &normalized)
    }

    pub fn try_get_extension(&self, ext: &str) -> Option<StringId> {
        let normalized = Self::normalize_extension(ext);
        if normalized.is_empty() {
            return Some(StringId::EMPTY);
        }
        Self::try_get(&self.extensions, &normalized)
    }

    // ── shared machinery ──────────────────────────────────────────────────

    fn try_get(pool: &SubPool, span: &str) -> Option<StringId> {
        pool.map.get(span).map(|id| StringId(*id))
    }

    /// Intern a canonical span. Allocates only when the string is new.
    /// Concurrent inserters of the same string race on the forward map; the
    /// loser's freshly allocated id stays in the table as a resolvable
    /// tombstone and the winner's id is returned, so equal strings always
    /// observe one id.
    fn intern_span(&self, pool: &SubPool, span: &str) -> StringId {
        if span.is_empty() {
            return StringId::EMPTY;
        }
        if let Some(id) = pool.map.get(span) {
            return StringId(*id);
        }

        let owned: Arc<str> = Arc::from(span);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut table = self.table.write();
            let slot = id as usize;
            if table.len() <= slot {
                table.resize_with(slot + 1, || Arc::from(""));
            }
            table[slot] = Arc::clone(&owned);
        }
        self.retained_bytes
            .fetch_add(span.len() as u64, Ordering::Relaxed);

        match pool.map.entry(owned) {
            dashmap::mapref::entry::Entry::Occupied(existing) => StringId(*existing.get()),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(id);
                StringId(id)
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            path_strings: self.paths.len(),
            name_strings: self.names.len(),
            extension_strings: self.extensions.len(),
            total_ids: self.next_id.load(Ordering::Relaxed),
            retained_bytes: self.retained_bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_maps_to_id_zero() {
        let pool = StringPool::default();
        assert_eq!(pool.intern_name(""), StringId::EMPTY);
        assert_eq!(pool.intern_path(""), StringId::EMPTY);
        assert_eq!(pool.intern_extension(""), StringId::EMPTY);
        assert_eq!(&*pool.resolve(StringId::EMPTY), "");
    }

    #[test]
    fn resolve_round_trips() {
        let pool = StringPool::default();
        let id = pool.intern_name("Report.pdf");
        assert_eq!(&*pool.resolve(id), "Report.pdf");
    }

    #[test]
    fn equal_strings_share_one_id() {
        let pool = StringPool::default();
        let a = pool.intern_name("notes.txt");
        let b = pool.intern_name("notes.txt");
        assert_eq!(a, b);
    }

    #[test]
    fn span_and_owned_agree() {
        let pool = StringPool::default();
        let span_first = pool.intern_name("span-first");
        assert_eq!(pool.intern_name(&String::from("span-first")), span_first);
        assert_eq!(pool.try_get_name("span-first"), Some(span_first));
        assert_eq!(pool.try_get_name("never-interned"), None);
    }

    #[test]
    fn sub_pools_do_not_share_ids() {
        let pool = StringPool::new(false);
        let as_name = pool.intern_name("txt");
        let as_path = pool.intern_path("txt");
        assert_ne!(as_name, as_path);
        assert_eq!(&*pool.resolve(as_name), "txt");
        assert_eq!(&*pool.resolve(as_path), "txt");
    }

    #[test]
    fn path_normalization_folds_separators_and_case() {
        let pool = StringPool::new(true);
        let a = pool.intern_path("Users/Alice");
        let b = pool.intern_path("users\\alice");
        assert_eq!(a, b);
        assert_eq!(&*pool.resolve(a), "users\\alice");
    }

    #[test]
    fn case_sensitive_paths_stay_distinct() {
        let pool = StringPool::new(false);
        assert_ne!(pool.intern_path("Src"), pool.intern_path("src"));
    }

    #[test]
    fn extension_normalization() {
        let pool = StringPool::default();
        let a = pool.intern_extension("CS");
        let b = pool.intern_extension(".cs");
        assert_eq!(a, b);
        assert_eq!(&*pool.resolve(a), ".cs");
    }

    #[test]
    fn unknown_id_resolves_empty() {
        let pool = StringPool::default();
        assert_eq!(&*pool.resolve(StringId(9999)), "");
    }

    #[test]
    fn ids_are_monotonic() {
        let pool = StringPool::default();
        let a = pool.intern_name("a");
        let b = pool.intern_name("b");
        let c = pool.intern_name("c");
        assert!(a.raw() < b.raw() && b.raw() < c.raw());
    }

    #[test]
    fn concurrent_intern_converges() {
        let pool = std::sync::Arc::new(StringPool::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = std::sync::Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                (0..200)
                    .map(|i| pool.intern_name(&format!("file-{}.txt", i % 50)))
                    .collect::<Vec<_>>()
            }));
        }
        let all: Vec<Vec<StringId>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for run in &all[1..] {
            assert_eq!(run, &all[0]);
        }
        assert_eq!(pool.stats().name_strings, 50);
    }
}
