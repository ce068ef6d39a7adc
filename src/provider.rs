//! The OS-agnostic enumeration fallback behind a trait, so the engine can
//! run without raw volume access and tests can substitute fixed trees.
//!
//! Contract detail the pipeline relies on: providers emit each location's
//! root directory first, as a record that is its own parent. The pipeline
//! registers such records as volume roots instead of indexing them.

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, Receiver};
use log::{debug, warn};
use walkdir::WalkDir;

use crate::cancel::CancellationToken;
use crate::error::{FastFindError, Result};
use crate::record::{FileAttributes, FileRef, FullRecord, TICKS_PER_SECOND, UNIX_EPOCH_TICKS};
use crate::search::matcher::{has_wildcards, GlobPattern};
use crate::stats::{FileChangeEvent, FileChangeKind};

/// Capacity of the channel a provider streams records through. Matches
/// the search stream: slow consumers back-pressure the walk.
const ENUMERATION_CHANNEL_CAPACITY: usize = 4096;

/// Rescan cadence of the polling change monitor.
const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub fn system_time_to_ticks(time: SystemTime) -> u64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => UNIX_EPOCH_TICKS + since.as_secs() * TICKS_PER_SECOND,
        Err(_) => 0,
    }
}

/// Subset of IndexingOptions a provider needs for one enumeration.
#[derive(Debug, Clone, Default)]
pub struct EnumerationOptions {
    pub include_hidden: bool,
    pub include_system: bool,
    pub max_depth: Option<usize>,
    pub follow_symlinks: bool,
    pub excluded_paths: Vec<String>,
    pub excluded_extensions: Vec<String>,
    pub max_file_size: Option<u64>,
}

impl EnumerationOptions {
    pub fn permissive() -> Self {
        EnumerationOptions {
            include_hidden: true,
            include_system: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ProviderPerformance {
    pub supports_fast_enumeration: bool,
    pub estimated_records_per_second: u64,
}

/// Capability set of an enumeration backend. The engine depends only on
/// this contract; the MFT reader and the walk fallback both satisfy it.
pub trait FileSystemProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lazily stream every record under the given locations. The walk runs
    /// on its own thread; dropping the receiver or cancelling the token
    /// stops it after the current entry.
    fn enumerate(
        &self,
        locations: &[String],
        options: &EnumerationOptions,
        cancel: &CancellationToken,
    ) -> Receiver<FullRecord>;

    fn get_file_info(&self, path: &str) -> Option<FullRecord>;

    fn available_locations(&self) -> Vec<String>;

    /// Lazy infinite stream of change events for the locations, until the
    /// token is cancelled.
    fn monitor_changes(
        &self,
        locations: &[String],
        cancel: &CancellationToken,
    ) -> Result<Receiver<FileChangeEvent>>;

    fn file_system_type(&self, path: &str) -> String;

    fn performance_info(&self) -> ProviderPerformance;
}

/// Recursive directory-walk provider. The portable fallback when raw
/// volume access is unavailable, and the enumeration source for explicit
/// directory locations.
pub struct WalkProvider;

impl WalkProvider {
    pub fn new() -> Self {
        WalkProvider
    }

    fn full_record(
        path: &Path,
        meta: &std::fs::Metadata,
        file_ref: FileRef,
        parent_ref: FileRef,
    ) -> FullRecord {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let mut attrs = 0u32;
        if meta.is_dir() {
            attrs |= FileAttributes::DIRECTORY;
        }
        if name.starts_with('.') {
            attrs |= FileAttributes::HIDDEN;
        }
        let modified = meta
            .modified()
            .map(system_time_to_ticks)
            .unwrap_or_default();
        let created = meta
            .created()
            .map(system_time_to_ticks)
            .unwrap_or(modified);
        let accessed = meta
            .accessed()
            .map(system_time_to_ticks)
            .unwrap_or(modified);
        FullRecord {
            file_ref,
            parent_ref,
            name,
            path: path.to_string_lossy().into_owned(),
            attributes: FileAttributes(attrs),
            size: if meta.is_dir() { 0 } else { meta.len() },
            created_ticks: created,
            accessed_ticks: accessed,
            modified_ticks: modified,
        }
    }
}

impl Default for WalkProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Compiled exclusion rules: prefix rules for literal paths, globs for
/// wildcard patterns, matched against slash-normalized paths.
pub(crate) struct ExclusionRules {
    prefixes: Vec<String>,
    globs: Vec<GlobPattern>,
}

impl ExclusionRules {
    pub(crate) fn compile(patterns: &[String]) -> Self {
        let mut prefixes = Vec::new();
        let mut globs = Vec::new();
        for pattern in patterns {
            let normalized = pattern.replace('\\', "/").to_lowercase();
            if has_wildcards(&normalized) {
                globs.push(GlobPattern::new(&format!("*{normalized}*"), false));
            } else {
                prefixes.push(normalized);
            }
        }
        ExclusionRules { prefixes, globs }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.prefixes.is_empty() && self.globs.is_empty()
    }

    pub(crate) fn matches(&self, path: &str) -> bool {
        let normalized = path.replace('\\', "/").to_lowercase();
        self.prefixes
            .iter()
            .any(|p| normalized.starts_with(p.as_str()) || normalized.contains(&format!("/{p}")))
            || self.globs.iter().any(|g| g.matches(&normalized))
    }
}

impl FileSystemProvider for WalkProvider {
    fn name(&self) -> &'static str {
        "filesystem-walk"
    }

    fn enumerate(
        &self,
        locations: &[String],
        options: &EnumerationOptions,
        cancel: &CancellationToken,
    ) -> Receiver<FullRecord> {
        let (tx, rx) = bounded(ENUMERATION_CHANNEL_CAPACITY);
        let locations = locations.to_vec();
        let options = options.clone();
        let cancel = cancel.clone();

        std::thread::spawn(move || {
            let excluded = ExclusionRules::compile(&options.excluded_paths);
            // Synthetic refs are per-provider-walk ordinals; parent links
            // are looked up by parent path.
            let mut next_ordinal: u64 = 1;
            let mut refs_by_path: HashMap<String, FileRef> = HashMap::new();

            'locations: for location in &locations {
                let root = Path::new(location);
                let Ok(root_meta) = std::fs::metadata(root) else {
                    warn!("walk location missing: {location}");
                    continue;
                };
                let root_ref = FileRef::synthetic(next_ordinal);
                next_ordinal += 1;
                refs_by_path.insert(location.clone(), root_ref);
                // Self-parented root record marks the location boundary.
                let root_record = WalkProvider::full_record(root, &root_meta, root_ref, root_ref);
                if tx.send(root_record).is_err() {
                    return;
                }

                let mut walker = WalkDir::new(root)
                    .follow_links(options.follow_symlinks)
                    .min_depth(1);
                if let Some(depth) = options.max_depth {
                    walker = walker.max_depth(depth);
                }

                for entry in walker.into_iter().filter_map(|e| e.ok()) {
                    if cancel.is_cancelled() {
                        debug!("walk cancelled at {}", entry.path().display());
                        return;
                    }
                    let path = entry.path();
                    let path_str = path.to_string_lossy();
                    if !excluded.is_empty() && excluded.matches(&path_str) {
                        continue;
                    }
                    let Ok(meta) = entry.metadata() else {
                        continue;
                    };
                    let name = entry.file_name().to_string_lossy();
                    if !options.include_hidden && name.starts_with('.') {
                        continue;
                    }
                    if !meta.is_dir() {
                        if let Some(cap) = options.max_file_size {
                            if meta.len() > cap {
                                continue;
                            }
                        }
                        if !options.excluded_extensions.is_empty() {
                            if let Some(ext) = name.rsplit('.').next().filter(|e| *e != &*name) {
                                let ext = ext.to_lowercase();
                                if options
                                    .excluded_extensions
                                    .iter()
                                    .any(|x| x.trim_start_matches('.').to_lowercase() == ext)
                                {
                                    continue;
                                }
                            }
                        }
                    }

                    let parent_ref = path
                        .parent()
                        .and_then(|p| refs_by_path.get(&p.to_string_lossy().into_owned()))
                        .copied()
                        .unwrap_or(root_ref);
                    let file_ref = FileRef::synthetic(next_ordinal);
                    next_ordinal += 1;
                    if meta.is_dir() {
                        refs_by_path.insert(path_str.into_owned(), file_ref);
                    }

                    let record = WalkProvider::full_record(path, &meta, file_ref, parent_ref);
                    if tx.send(record).is_err() {
                        // Consumer went away; stop every location.
                        break 'locations;
                    }
                }
            }
        });

        rx
    }

    fn get_file_info(&self, path: &str) -> Option<FullRecord> {
        let meta = std::fs::symlink_metadata(path).ok()?;
        let p = Path::new(path);
        Some(Self::full_record(
            p,
            &meta,
            FileRef::synthetic(0),
            FileRef::synthetic(0),
        ))
    }

    fn available_locations(&self) -> Vec<String> {
        #[cfg(target_os = "windows")]
        {
            crate::win::ntfs_volumes()
                .into_iter()
                .map(|v| format!("{v}:\\"))
                .collect()
        }
        #[cfg(not(target_os = "windows"))]
        {
            vec!["/".to_string()]
        }
    }

    /// Polling monitor: rescans the locations and diffs the path set. Good
    /// enough for the non-journal fallback; the USN monitor supersedes it
    /// on NTFS volumes.
    fn monitor_changes(
        &self,
        locations: &[String],
        cancel: &CancellationToken,
    ) -> Result<Receiver<FileChangeEvent>> {
        if locations.is_empty() {
            return Err(FastFindError::InvalidQuery(
                "monitor_changes needs at least one location".into(),
            ));
        }
        let (tx, rx) = bounded(ENUMERATION_CHANNEL_CAPACITY);
        let locations = locations.to_vec();
        let cancel = cancel.clone();

        std::thread::spawn(move || {
            let snapshot = |paths: &mut HashMap<String, u64>| {
                paths.clear();
                for location in &locations {
                    for entry in WalkDir::new(location).into_iter().filter_map(|e| e.ok()) {
                        let ticks = entry
                            .metadata()
                            .ok()
                            .and_then(|m| m.modified().ok())
                            .map(system_time_to_ticks)
                            .unwrap_or_default();
                        paths.insert(entry.path().to_string_lossy().into_owned(), ticks);
                    }
                }
            };

            let mut previous: HashMap<String, u64> = HashMap::new();
            let mut current: HashMap<String, u64> = HashMap::new();
            snapshot(&mut previous);

            while !cancel.is_cancelled() {
                std::thread::sleep(MONITOR_POLL_INTERVAL);
                if cancel.is_cancelled() {
                    break;
                }
                snapshot(&mut current);

                for (path, ticks) in &current {
                    match previous.get(path) {
                        None => {
                            let event = FileChangeEvent {
                                kind: FileChangeKind::Created,
                                old_path: None,
                                path: path.clone(),
                                timestamp_ticks: *ticks,
                            };
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                        Some(old_ticks) if old_ticks != ticks => {
                            let event = FileChangeEvent {
                                kind: FileChangeKind::Modified,
                                old_path: None,
                                path: path.clone(),
                                timestamp_ticks: *ticks,
                            };
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                        _ => {}
                    }
                }
                for path in previous.keys() {
                    if !current.contains_key(path) {
                        let event = FileChangeEvent {
                            kind: FileChangeKind::Deleted,
                            old_path: None,
                            path: path.clone(),
                            timestamp_ticks: 0,
                        };
                        if tx.send(event).is_err() {
                            return;
                        }
                    }
                }
                std::mem::swap(&mut previous, &mut current);
            }
        });

        Ok(rx)
    }

    fn file_system_type(&self, _path: &str) -> String {
        #[cfg(target_os = "windows")]
        {
            "NTFS".to_string()
        }
        #[cfg(not(target_os = "windows"))]
        {
            "unknown".to_string()
        }
    }

    fn performance_info(&self) -> ProviderPerformance {
        ProviderPerformance {
            supports_fast_enumeration: false,
            estimated_records_per_second: 20_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn enumerates_tree_with_root_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("Panel1");
        fs::create_dir_all(root.join("SubA")).unwrap();
        touch(&root.join("test.txt"));
        touch(&root.join("SubA").join("inner.txt"));

        let provider = WalkProvider::new();
        let rx = provider.enumerate(
            &[root.to_string_lossy().into_owned()],
            &EnumerationOptions::permissive(),
            &CancellationToken::new(),
        );
        let records: Vec<FullRecord> = rx.into_iter().collect();
        assert_eq!(records.len(), 4);

        let root_rec = &records[0];
        assert_eq!(root_rec.file_ref, root_rec.parent_ref);
        assert!(root_rec.is_directory());

        // Every non-root record's parent was emitted before it.
        for (i, rec) in records.iter().enumerate().skip(1) {
            assert!(records[..i].iter().any(|r| r.file_ref == rec.parent_ref));
        }
    }

    #[test]
    fn exclusion_rules_prune() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir_all(root.join("node_modules")).unwrap();
        fs::create_dir_all(root.join("src")).unwrap();
        touch(&root.join("node_modules").join("dep.js"));
        touch(&root.join("src").join("main.rs"));

        let provider = WalkProvider::new();
        let options = EnumerationOptions {
            excluded_paths: vec!["node_modules".into()],
            ..EnumerationOptions::permissive()
        };
        let rx = provider.enumerate(
            &[root.to_string_lossy().into_owned()],
            &options,
            &CancellationToken::new(),
        );
        let names: Vec<String> = rx.into_iter().map(|r| r.name).collect();
        assert!(names.iter().any(|n| n == "main.rs"));
        assert!(!names.iter().any(|n| n == "dep.js"));
        assert!(!names.iter().any(|n| n == "node_modules"));
    }

    #[test]
    fn excluded_extensions_and_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        fs::create_dir_all(&root).unwrap();
        touch(&root.join("keep.rs"));
        touch(&root.join("drop.tmp"));
        fs::write(root.join("big.bin"), vec![0u8; 4096]).unwrap();

        let provider = WalkProvider::new();
        let options = EnumerationOptions {
            excluded_extensions: vec![".tmp".into()],
            max_file_size: Some(1024),
            ..EnumerationOptions::permissive()
        };
        let rx = provider.enumerate(
            &[root.to_string_lossy().into_owned()],
            &options,
            &CancellationToken::new(),
        );
        let names: Vec<String> = rx.into_iter().map(|r| r.name).collect();
        assert!(names.iter().any(|n| n == "keep.rs"));
        assert!(!names.iter().any(|n| n == "drop.tmp"));
        assert!(!names.iter().any(|n| n == "big.bin"));
    }

    #[test]
    fn get_file_info_reads_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("probe.txt");
        fs::write(&file, b"hello").unwrap();

        let provider = WalkProvider::new();
        let info = provider
            .get_file_info(&file.to_string_lossy())
            .expect("file exists");
        assert_eq!(info.name, "probe.txt");
        assert_eq!(info.size, 5);
        assert!(!info.is_directory());
        assert!(provider.get_file_info("/definitely/not/here").is_none());
    }
}
