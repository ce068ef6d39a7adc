//! End-to-end search scenarios over a real directory tree indexed through
//! the filesystem walk, plus the extension-bucket scale check.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fastfind::{
    create_engine, CancellationToken, CompactRecord, FileAttributes, FileIndex, FileRef,
    FullRecord, IndexingOptions, Platform, SearchEngine, SearchQuery, StringPool,
};

fn build_panel_tree(root: &Path) {
    fs::create_dir_all(root.join("Panel1/SubA")).unwrap();
    fs::create_dir_all(root.join("Panel1/SubB/Deep")).unwrap();
    fs::write(root.join("Panel1/test.txt"), b"0").unwrap();
    fs::write(root.join("Panel1/SubA/test_a1.txt"), b"1").unwrap();
    fs::write(root.join("Panel1/SubA/test_a2.txt"), b"2").unwrap();
    fs::write(root.join("Panel1/SubB/test_b1.txt"), b"3").unwrap();
    fs::write(root.join("Panel1/SubB/Deep/test_deep.txt"), b"4").unwrap();
}

fn engine_over(root: &Path) -> SearchEngine {
    let _ = env_logger::builder().is_test(true).try_init();
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

fn names(hits: &[FullRecord]) -> Vec<&str> {
    hits.iter().map(|h| h.name.as_str()).collect()
}

#[test]
fn filename_prefix_with_subdirectories() {
    let dir = tempfile::tempdir().unwrap();
    build_panel_tree(dir.path());
    let engine = engine_over(dir.path());

    let mut result = engine.search(SearchQuery {
        base_path: Some("Panel1".into()),
        include_subdirectories: true,
        search_filename_only: true,
        ..SearchQuery::for_text("test")
    });
    let hits = result.collect_files();

    assert_eq!(hits.len(), 5);
    assert!(hits.iter().all(|h| h.path.to_lowercase().contains("panel1")));
    assert!(names(&hits).contains(&"test_deep.txt"));
    assert!(result.is_complete());
    assert_eq!(result.total_matches(), 5);
}

#[test]
fn filename_root_level_only() {
    let dir = tempfile::tempdir().unwrap();
    build_panel_tree(dir.path());
    let engine = engine_over(dir.path());

    let mut result = engine.search(SearchQuery {
        base_path: Some("Panel1".into()),
        include_subdirectories: false,
        search_filename_only: true,
        ..SearchQuery::for_text("test")
    });
    let hits = result.collect_files();

    assert_eq!(names(&hits), vec!["test.txt"]);
}

#[test]
fn full_path_search_hits_directory_name() {
    let dir = tempfile::tempdir().unwrap();
    build_panel_tree(dir.path());
    let engine = engine_over(dir.path());

    let mut result = engine.search(SearchQuery {
        base_path: Some("Panel1".into()),
        search_filename_only: false,
        include_directories: false,
        ..SearchQuery::for_text("SubA")
    });
    let hits = result.collect_files();

    assert_eq!(hits.len(), 2);
    let mut got = names(&hits);
    got.sort();
    assert_eq!(got, vec!["test_a1.txt", "test_a2.txt"]);
}

#[test]
fn extension_filter_over_mixed_bucket() {
    // Scale check straight against the index; no filesystem needed.
    let index = Arc::new(FileIndex::new(Arc::new(StringPool::new(true)), false));
    index.register_root(FileRef::from_parts(5, 5), "C:");
    let extensions = ["cs", "md", "rs", "txt"];
    let mut expected_cs = 0usize;
    for i in 0..10_000u64 {
        let ext = extensions[(i % 4) as usize];
        if ext == "cs" {
            expected_cs += 1;
        }
        index.insert(CompactRecord {
            file_ref: FileRef::from_parts(100 + i, 1),
            parent_ref: FileRef::from_parts(5, 5),
            name_id: index.pool().intern_name(&format!("file_{i}.{ext}")),
            attributes: FileAttributes(FileAttributes::ARCHIVE),
            size: 0,
            modified_ticks: 0,
        });
    }

    assert_eq!(index.extension_bucket_len(".cs"), expected_cs);

    let mut result = fastfind::search::execute(
        Arc::clone(&index),
        None,
        SearchQuery::for_extension(".cs"),
        CancellationToken::new(),
    );
    let hits = result.collect_files();
    assert_eq!(hits.len(), expected_cs);
    assert!(hits.iter().all(|h| h.name.ends_with(".cs")));
}

#[test]
fn invalid_base_path_is_empty_but_complete() {
    let dir = tempfile::tempdir().unwrap();
    build_panel_tree(dir.path());
    let engine = engine_over(dir.path());

    let mut result = engine.search(SearchQuery {
        base_path: Some("Panel1/NoSuchDir".into()),
        ..SearchQuery::for_text("test")
    });
    let hits = result.collect_files();

    assert!(hits.is_empty());
    assert!(result.is_complete());
    assert!(result.error_message().is_none());
}

#[test]
fn case_insensitive_by_default_case_sensitive_on_request() {
    let dir = tempfile::tempdir().unwrap();
    build_panel_tree(dir.path());
    let engine = engine_over(dir.path());

    let mut insensitive = engine.search(SearchQuery::for_text("TEST_DEEP"));
    assert_eq!(insensitive.collect_files().len(), 1);

    let mut sensitive = engine.search(SearchQuery {
        case_sensitive: true,
        ..SearchQuery::for_text("TEST_DEEP")
    });
    assert!(sensitive.collect_files().is_empty());
}

#[test]
fn glob_and_size_predicates_compose() {
    let dir = tempfile::tempdir().unwrap();
    build_panel_tree(dir.path());
    let engine = engine_over(dir.path());

    let mut glob = engine.search(SearchQuery::for_text("test_?1.txt"));
    let mut got = glob
        .collect_files()
        .into_iter()
        .map(|h| h.name)
        .collect::<Vec<_>>();
    got.sort();
    assert_eq!(got, vec!["test_a1.txt", "test_b1.txt"]);

    // All files in the tree are a single byte.
    let mut sized = engine.search(SearchQuery {
        min_size: Some(2),
        ..Default::default()
    });
    assert!(sized.collect_files().is_empty());
}

#[test]
fn fallback_walks_unindexed_tree() {
    let dir = tempfile::tempdir().unwrap();
    build_panel_tree(dir.path());

    // Engine never indexed anything: the search transparently walks.
    let engine = create_engine(Platform::FilesystemWalk);
    let mut result = engine.search(SearchQuery {
        base_path: Some(dir.path().join("Panel1").to_string_lossy().into_owned()),
        ..SearchQuery::for_text("test_deep")
    });
    let hits = result.collect_files();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name, "test_deep.txt");
}
