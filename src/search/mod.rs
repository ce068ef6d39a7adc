//! Streaming search over the index: a planner that picks the cheapest
//! candidate source, a short-circuit predicate pipeline, and a producer
//! thread feeding the bounded result stream.

pub mod matcher;
pub mod stream;

pub use stream::{SearchMetrics, SearchResult};

use std::sync::Arc;

use log::debug;
use regex::RegexBuilder;

use crate::cancel::CancellationToken;
use crate::index::{BasePlan, FileIndex};
use crate::provider::{EnumerationOptions, ExclusionRules, FileSystemProvider};
use crate::query::{SearchQuery, TextPlan};
use crate::record::{CompactRecord, FullRecord};
use crate::search::matcher::GlobPattern;
use crate::search::stream::ResultSink;
use crate::strings::StringId;

enum CompiledText {
    None,
    Substring(String),
    Glob(GlobPattern),
    Regex(regex::Regex),
}

impl CompiledText {
    fn matches(&self, haystack: &str, case_sensitive: bool) -> bool {
        match self {
            CompiledText::None => true,
            CompiledText::Substring(needle) => {
                matcher::contains(haystack, needle, case_sensitive)
            }
            CompiledText::Glob(pattern) => pattern.matches(haystack),
            CompiledText::Regex(re) => re.is_match(haystack),
        }
    }
}

struct CompiledQuery {
    query: SearchQuery,
    text: CompiledText,
    /// Normalized extension filter (".cs").
    extension: Option<String>,
    excluded: ExclusionRules,
}

impl CompiledQuery {
    fn compile(query: SearchQuery) -> Result<Self, String> {
        let text = match query.text_plan() {
            TextPlan::None => CompiledText::None,
            TextPlan::Substring => CompiledText::Substring(query.trimmed_text().to_string()),
            TextPlan::Glob => CompiledText::Glob(GlobPattern::new(
                query.trimmed_text(),
                query.case_sensitive,
            )),
            TextPlan::Regex => RegexBuilder::new(query.trimmed_text())
                .case_insensitive(!query.case_sensitive)
                .build()
                .map(CompiledText::Regex)
                .map_err(|e| format!("bad regex: {e}"))?,
        };
        let extension = query
            .extension_filter
            .as_deref()
            .map(crate::strings::StringPool::normalize_extension)
            .filter(|e| !e.is_empty());
        let excluded = ExclusionRules::compile(&query.excluded_paths);
        Ok(CompiledQuery {
            query,
            text,
            extension,
            excluded,
        })
    }
}

/// Candidate source chosen by the planner, in the declared order:
/// extension bucket, trie prefix, (SIMD) scan, full scan. The fallback and
/// empty sources cover the cases the index cannot answer.
enum Source {
    /// Extension-only query: one bucket, no trie. Base containment, when a
    /// base path is also set, is left to the predicate pipeline.
    Extension(String),
    /// Base-path scoped: trie node lists, one entry per resolved location.
    Trie {
        targets: Vec<Vec<StringId>>,
        recursive: bool,
    },
    /// Text or predicate query without scope: iterate the whole store.
    FullScan,
    /// Index cannot answer: walk the live filesystem.
    Fallback(Vec<String>),
    /// Scope resolves to nothing; the empty stream is the full answer.
    Nothing,
}

/// Resolution of the query's base path against the index, shared between
/// the planner and the containment predicate.
enum BaseScope {
    None,
    /// Normalized path prefix (with trailing separator) every match must
    /// start with. Set when a source other than the trie needs the check.
    Prefix(String),
    /// Base path is under an indexed root but does not exist.
    Impossible,
    /// Base path is outside every indexed volume.
    Foreign(String),
}

fn resolve_base(index: &FileIndex, query: &SearchQuery) -> (BaseScope, Option<Vec<StringId>>) {
    let Some(base) = query.base_path.as_deref() else {
        return (BaseScope::None, None);
    };
    match index.base_plan(base) {
        BasePlan::Segments(segments) => {
            let pool = index.pool();
            let mut prefix = String::new();
            for seg in &segments {
                prefix.push_str(&pool.resolve(*seg));
                prefix.push(crate::strings::PATH_SEPARATOR);
            }
            (BaseScope::Prefix(prefix), Some(segments))
        }
        BasePlan::NotFound => (BaseScope::Impossible, None),
        BasePlan::Foreign => (BaseScope::Foreign(base.to_string()), None),
    }
}

fn plan(
    index: &FileIndex,
    cq: &CompiledQuery,
    base: &BaseScope,
    base_segments: Option<Vec<StringId>>,
    have_provider: bool,
) -> Source {
    let query = &cq.query;

    if index.is_empty() && have_provider {
        let mut locations: Vec<String> = Vec::new();
        if let Some(base) = query.base_path.as_deref() {
            locations.push(base.to_string());
        } else {
            locations.extend(query.search_locations.iter().cloned());
        }
        return Source::Fallback(locations);
    }

    match base {
        BaseScope::Impossible => return Source::Nothing,
        BaseScope::Foreign(path) if have_provider => {
            return Source::Fallback(vec![path.clone()]);
        }
        BaseScope::Foreign(_) => return Source::Nothing,
        BaseScope::None | BaseScope::Prefix(_) => {}
    }

    if matches!(cq.text, CompiledText::None) {
        if let Some(ext) = &cq.extension {
            return Source::Extension(ext.clone());
        }
    }

    if let Some(segments) = base_segments {
        return Source::Trie {
            targets: vec![segments],
            recursive: query.include_subdirectories,
        };
    }

    if !query.search_locations.is_empty() {
        let mut targets = Vec::new();
        let mut foreign = Vec::new();
        for location in &query.search_locations {
            match index.base_plan(location) {
                BasePlan::Segments(segments) => targets.push(segments),
                BasePlan::Foreign => foreign.push(location.clone()),
                BasePlan::NotFound => {}
            }
        }
        if targets.is_empty() && !foreign.is_empty() && have_provider {
            return Source::Fallback(foreign);
        }
        if targets.is_empty() {
            return Source::Nothing;
        }
        return Source::Trie {
            targets,
            recursive: query.include_subdirectories,
        };
    }

    Source::FullScan
}

/// Run a query against an index snapshot, streaming matches from a
/// producer thread. The provider, when given, backs the filesystem
/// fallback path.
pub fn execute(
    index: Arc<FileIndex>,
    provider: Option<Arc<dyn FileSystemProvider>>,
    query: SearchQuery,
    cancel: CancellationToken,
) -> SearchResult {
    if let Err(e) = query.validate() {
        return SearchResult::failed(query, e.to_string());
    }
    let cq = match CompiledQuery::compile(query.clone()) {
        Ok(cq) => cq,
        Err(message) => return SearchResult::failed(query, message),
    };

    let (result, sink) = SearchResult::open(query, cancel);
    std::thread::spawn(move || {
        let (base_scope, base_segments) = resolve_base(&index, &cq.query);
        let source = plan(&index, &cq, &base_scope, base_segments, provider.is_some());
        let base_prefix = match &base_scope {
            BaseScope::Prefix(prefix) => Some(prefix.clone()),
            _ => None,
        };
        let mut run = Run {
            index: &index,
            cq: &cq,
            sink,
            base_prefix,
            sent: 0,
            stopped: false,
            truncated: false,
        };
        match source {
            Source::Nothing => {}
            Source::Extension(ext) => {
                debug!("search source: extension bucket {ext}");
                for file_ref in index.refs_with_extension(&ext) {
                    if run.should_stop() {
                        break;
                    }
                    if let Some(rec) = index.get(file_ref) {
                        run.offer_compact(rec, true, false);
                    }
                }
            }
            Source::Trie { targets, recursive } => {
                debug!("search source: trie, {} target(s)", targets.len());
                'targets: for target in targets {
                    for file_ref in index.collect_under(&target, recursive) {
                        if run.should_stop() {
                            break 'targets;
                        }
                        if let Some(rec) = index.get(file_ref) {
                            run.offer_compact(rec, false, true);
                        }
                    }
                }
            }
            Source::FullScan => {
                debug!("search source: full scan");
                index.for_each_record(|rec| {
                    run.offer_compact(rec, false, false);
                    !run.should_stop()
                });
            }
            Source::Fallback(mut locations) => {
                // The planner only picks this source when a provider exists.
                if let Some(provider) = provider.as_ref() {
                    if locations.is_empty() {
                        locations = provider.available_locations();
                    }
                    debug!(
                        "search source: {} fallback over {} location(s)",
                        provider.name(),
                        locations.len()
                    );
                    let walk_cancel = CancellationToken::new();
                    let rx = provider.enumerate(
                        &locations,
                        &EnumerationOptions::permissive(),
                        &walk_cancel,
                    );
                    for full in rx {
                        if run.should_stop() {
                            walk_cancel.cancel();
                            break;
                        }
                        run.offer_full(full, false);
                    }
                }
            }
        }
        run.finish();
    });
    result
}

struct Run<'a> {
    index: &'a FileIndex,
    cq: &'a CompiledQuery,
    sink: ResultSink,
    /// Set when the source does not already guarantee base containment.
    base_prefix: Option<String>,
    sent: usize,
    stopped: bool,
    truncated: bool,
}

impl Run<'_> {
    fn should_stop(&self) -> bool {
        self.stopped || self.sink.is_cancelled()
    }

    /// Close the stream. Truncation by max_results still counts as a
    /// complete source; cancellation and a vanished consumer do not.
    fn finish(self) {
        let complete = !self.sink.is_cancelled() && (!self.stopped || self.truncated);
        self.sink.finish(complete);
    }

    /// Predicate pipeline over a compact record, cheapest checks first.
    /// `ext_satisfied` and `scoped` skip checks the source already
    /// guarantees (extension bucket, trie containment).
    fn offer_compact(&mut self, rec: CompactRecord, ext_satisfied: bool, scoped: bool) {
        self.sink.record_scanned();
        let query = &self.cq.query;

        // Attributes.
        let attrs = rec.attributes();
        if rec.is_directory() && !query.include_directories {
            return;
        }
        if !rec.is_directory() && !query.include_files {
            return;
        }
        if attrs.is_hidden() && !query.include_hidden {
            return;
        }
        if attrs.is_system() && !query.include_system {
            return;
        }

        // Size window.
        if let Some(min) = query.min_size {
            if rec.size() < min {
                return;
            }
        }
        if let Some(max) = query.max_size {
            if rec.size() > max {
                return;
            }
        }

        // Time windows. Created collapses to modified in the compact form.
        let modified = rec.modified_ticks();
        if let Some(min) = query.min_modified {
            if modified < min {
                return;
            }
        }
        if let Some(max) = query.max_modified {
            if modified > max {
                return;
            }
        }
        if let Some(min) = query.min_created {
            if modified < min {
                return;
            }
        }
        if let Some(max) = query.max_created {
            if modified > max {
                return;
            }
        }

        // Extension filter.
        let name = self.index.pool().resolve(rec.name_id());
        if !ext_satisfied {
            if let Some(wanted) = self.cq.extension.as_deref() {
                match CompactRecord::extension_of(&name) {
                    Some(ext) if ext == wanted => {}
                    _ => return,
                }
            }
        }

        // Text match. Filename-only matches before materializing the path.
        if query.search_filename_only {
            if !self.cq.text.matches(&name, query.case_sensitive) {
                return;
            }
        }

        let full = match self.index.to_full(&rec) {
            Ok(full) => full,
            Err(_) => {
                self.sink.record_unresolvable();
                return;
            }
        };

        if !query.search_filename_only
            && !self.cq.text.matches(&full.path, query.case_sensitive)
        {
            return;
        }

        if !scoped {
            if let Some(prefix) = self.base_prefix.as_deref() {
                if !full.path.starts_with(prefix) {
                    return;
                }
            }
        }

        if !self.cq.excluded.is_empty() && self.cq.excluded.matches(&full.path) {
            return;
        }

        self.deliver(full);
    }

    /// Same pipeline over an already-wide record from the fallback walk.
    fn offer_full(&mut self, full: FullRecord, ext_satisfied: bool) {
        self.sink.record_scanned();
        let query = &self.cq.query;

        if full.is_directory() && !query.include_directories {
            return;
        }
        if !full.is_directory() && !query.include_files {
            return;
        }
        if full.attributes.is_hidden() && !query.include_hidden {
            return;
        }
        if full.attributes.is_system() && !query.include_system {
            return;
        }

        if let Some(min) = query.min_size {
            if full.size < min {
                return;
            }
        }
        if let Some(max) = query.max_size {
            if full.size > max {
                return;
            }
        }
        if let Some(min) = query.min_modified {
            if full.modified_ticks < min {
                return;
            }
        }
        if let Some(max) = query.max_modified {
            if full.modified_ticks > max {
                return;
            }
        }
        if let Some(min) = query.min_created {
            if full.created_ticks < min {
                return;
            }
        }
        if let Some(max) = query.max_created {
            if full.created_ticks > max {
                return;
            }
        }

        if !ext_satisfied {
            if let Some(wanted) = self.cq.extension.as_deref() {
                match full.extension() {
                    Some(ext) if ext == wanted => {}
                    _ => return,
                }
            }
        }

        let haystack = if query.search_filename_only {
            &full.name
        } else {
            &full.path
        };
        if !self.cq.text.matches(haystack, query.case_sensitive) {
            return;
        }

        if !self.cq.excluded.is_empty() && self.cq.excluded.matches(&full.path) {
            return;
        }

        self.deliver(full);
    }

    fn deliver(&mut self, full: FullRecord) {
        if let Some(max) = self.cq.query.max_results {
            if self.sent >= max {
                self.sink.mark_has_more();
                self.stopped = true;
                self.truncated = true;
                return;
            }
        }
        if self.sink.push(full) {
            self.sent += 1;
        } else {
            self.stopped = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FileAttributes, FileRef};
    use crate::strings::StringPool;

    fn sample_index() -> Arc<FileIndex> {
        let index = FileIndex::new(Arc::new(StringPool::new(true)), true);
        index.register_root(FileRef::from_parts(5, 5), "C:");
        let mk_dir = |frn: u64, parent: u64, name: &str| CompactRecord {
            file_ref: FileRef::from_parts(frn, 1),
            parent_ref: FileRef::from_parts(parent, 1),
            name_id: index.pool().intern_name(name),
            attributes: FileAttributes(FileAttributes::DIRECTORY),
            size: 0,
            modified_ticks: 100,
        };
        let mk_file = |frn: u64, parent: u64, name: &str, size: u64, attrs: u32| CompactRecord {
            file_ref: FileRef::from_parts(frn, 1),
            parent_ref: FileRef::from_parts(parent, 1),
            name_id: index.pool().intern_name(name),
            attributes: FileAttributes(attrs),
            size,
            modified_ticks: 100 + size,
        };
        index.insert(mk_dir(100, 5, "Projects"));
        index.insert(mk_dir(110, 100, "app"));
        index.insert(mk_file(111, 110, "main.cs", 10, 0));
        index.insert(mk_file(112, 110, "util.cs", 20, 0));
        index.insert(mk_file(113, 110, "readme.md", 30, 0));
        index.insert(mk_file(120, 100, "hidden.log", 40, FileAttributes::HIDDEN));
        index.insert(mk_file(6, 5, "notes.txt", 50, 0));
        Arc::new(index)
    }

    fn run(index: &Arc<FileIndex>, query: SearchQuery) -> Vec<FullRecord> {
        let mut result = execute(Arc::clone(index), None, query, CancellationToken::new());
        assert!(result.error_message().is_none(), "unexpected failure");
        result.collect_files()
    }

    #[test]
    fn substring_search_over_names() {
        let index = sample_index();
        let hits = run(&index, SearchQuery::for_text("main"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "main.cs");
        assert_eq!(hits[0].path, "c:\\projects\\app\\main.cs");
    }

    #[test]
    fn extension_bucket_source() {
        let index = sample_index();
        let hits = run(&index, SearchQuery::for_extension(".cs"));
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.name.ends_with(".cs")));
    }

    #[test]
    fn extension_plus_text_filters_both() {
        let index = sample_index();
        let query = SearchQuery {
            extension_filter: Some("cs".into()),
            ..SearchQuery::for_text("util")
        };
        let hits = run(&index, query);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "util.cs");
    }

    #[test]
    fn base_path_scopes_and_recurses() {
        let index = sample_index();
        let scoped = SearchQuery {
            base_path: Some("C:\\Projects".into()),
            ..SearchQuery::for_text(".")
        };
        let hits = run(&index, scoped);
        assert_eq!(hits.len(), 4);

        let non_recursive = SearchQuery {
            base_path: Some("C:\\Projects".into()),
            include_subdirectories: false,
            ..SearchQuery::for_text(".")
        };
        let hits = run(&index, non_recursive);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "hidden.log");
    }

    #[test]
    fn missing_base_path_is_empty_and_complete() {
        let index = sample_index();
        let query = SearchQuery {
            base_path: Some("C:\\Projects\\nope".into()),
            ..SearchQuery::for_text("main")
        };
        let mut result = execute(Arc::clone(&index), None, query, CancellationToken::new());
        assert!(result.collect_files().is_empty());
        assert!(result.is_complete());
    }

    #[test]
    fn hidden_and_attribute_filters() {
        let index = sample_index();
        let no_hidden = SearchQuery {
            include_hidden: false,
            ..SearchQuery::for_text("hidden")
        };
        assert!(run(&index, no_hidden).is_empty());

        let dirs_only = SearchQuery {
            include_files: false,
            ..SearchQuery::for_text("app")
        };
        let hits = run(&index, dirs_only);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].is_directory());
    }

    #[test]
    fn size_window_filters() {
        let index = sample_index();
        let query = SearchQuery {
            min_size: Some(15),
            max_size: Some(35),
            ..Default::default()
        };
        let hits = run(&index, query);
        let names: Vec<&str> = hits.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"util.cs") && names.contains(&"readme.md"));
    }

    #[test]
    fn glob_and_regex_paths() {
        let index = sample_index();
        let glob = run(&index, SearchQuery::for_text("*.cs"));
        assert_eq!(glob.len(), 2);

        let regex = SearchQuery {
            text: r"^(main|util)\.cs$".into(),
            use_regex: true,
            ..Default::default()
        };
        assert_eq!(run(&index, regex).len(), 2);
    }

    #[test]
    fn full_path_search_hits_directory_segment() {
        let index = sample_index();
        let query = SearchQuery {
            search_filename_only: false,
            ..SearchQuery::for_text("app")
        };
        let hits = run(&index, query);
        // app dir itself plus the three files under it.
        assert_eq!(hits.len(), 4);
    }

    #[test]
    fn max_results_truncates_and_flags() {
        let index = sample_index();
        let query = SearchQuery {
            max_results: Some(1),
            ..SearchQuery::for_extension(".cs")
        };
        let mut result = execute(Arc::clone(&index), None, query, CancellationToken::new());
        let hits = result.collect_files();
        assert_eq!(hits.len(), 1);
        assert!(result.has_more_results());
        assert!(result.is_complete());

        let zero = SearchQuery {
            max_results: Some(0),
            ..SearchQuery::for_extension(".cs")
        };
        let mut result = execute(Arc::clone(&index), None, zero, CancellationToken::new());
        assert!(result.collect_files().is_empty());
        assert!(result.has_more_results());

        let zero_no_match = SearchQuery {
            max_results: Some(0),
            ..SearchQuery::for_extension(".zip")
        };
        let mut result = execute(Arc::clone(&index), None, zero_no_match, CancellationToken::new());
        assert!(result.collect_files().is_empty());
        assert!(!result.has_more_results());
    }

    #[test]
    fn invalid_query_fails_synchronously() {
        let index = sample_index();
        let mut result = execute(
            Arc::clone(&index),
            None,
            SearchQuery::default(),
            CancellationToken::new(),
        );
        assert!(result.is_failed());
        assert!(result.collect_files().is_empty());
    }

    #[test]
    fn excluded_paths_drop_matches() {
        let index = sample_index();
        let query = SearchQuery {
            excluded_paths: vec!["app".into()],
            ..SearchQuery::for_extension(".cs")
        };
        assert!(run(&index, query).is_empty());
    }

    #[test]
    fn search_locations_union() {
        let index = sample_index();
        let query = SearchQuery {
            search_locations: vec!["C:\\Projects\\app".into()],
            ..SearchQuery::for_text("util")
        };
        let hits = run(&index, query);
        assert_eq!(hits.len(), 1);
    }
}
