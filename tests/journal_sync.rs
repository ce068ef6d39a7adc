//! Journal replay laws: applying a captured change stream reproduces the
//! state a full enumeration of the same snapshot would build, and
//! deletions drop records from every index structure.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::unbounded;
use fastfind::monitor::{ChangeBus, ChangeRecord};
use fastfind::{
    CancellationToken, ChangeReason, CompactRecord, FileAttributes, FileIndex, FileRef,
    SearchQuery, StringPool, SyncAdapter,
};

const DIR: u32 = FileAttributes::DIRECTORY;

fn fresh_index() -> Arc<FileIndex> {
    let index = FileIndex::new(Arc::new(StringPool::new(true)), false);
    index.register_root(FileRef::from_parts(5, 5), "C:");
    Arc::new(index)
}

fn compact(index: &FileIndex, frn: u64, parent: u64, name: &str, attrs: u32) -> CompactRecord {
    CompactRecord {
        file_ref: FileRef::from_parts(frn, 1),
        parent_ref: FileRef::from_parts(parent, 1),
        name_id: index.pool().intern_name(name),
        attributes: FileAttributes(attrs),
        size: 0,
        modified_ticks: 7,
    }
}

fn change(reason: ChangeReason, frn: u64, parent: u64, name: &str, attrs: u32) -> ChangeRecord {
    ChangeRecord {
        volume: "C:".into(),
        usn: frn as i64,
        file_ref: FileRef::from_parts(frn, 1),
        parent_ref: FileRef::from_parts(parent, 1),
        reason,
        raw_reason: 0,
        attributes: FileAttributes(attrs),
        name: name.into(),
        timestamp_ticks: 7,
    }
}

fn apply(index: &Arc<FileIndex>, changes: Vec<ChangeRecord>) {
    let adapter = SyncAdapter::new(Arc::clone(index), Arc::new(ChangeBus::new()));
    let (tx, rx) = unbounded();
    for c in changes {
        tx.send(c).unwrap();
    }
    drop(tx);
    adapter.run(rx, &CancellationToken::new());
}

/// Record-number + full-path fingerprint of an index.
fn fingerprint(index: &Arc<FileIndex>) -> BTreeSet<(u64, String)> {
    let mut out = BTreeSet::new();
    index.for_each_record(|rec| {
        let path = index.full_path(&rec).unwrap();
        out.insert((rec.file_ref().record_number(), path));
        true
    });
    out
}

#[test]
fn replay_matches_full_enumeration() {
    // Snapshot: C:\Work\{a.txt, b.txt}, C:\Work\Sub\c.txt
    let tree: Vec<(u64, u64, &str, u32)> = vec![
        (100, 5, "Work", DIR),
        (101, 100, "a.txt", 0),
        (102, 100, "b.txt", 0),
        (110, 100, "Sub", DIR),
        (111, 110, "c.txt", 0),
    ];

    let enumerated = fresh_index();
    for &(frn, parent, name, attrs) in &tree {
        enumerated.insert(compact(&enumerated, frn, parent, name, attrs));
    }

    let replayed = fresh_index();
    apply(
        &replayed,
        tree.iter()
            .map(|&(frn, parent, name, attrs)| {
                change(ChangeReason::Created, frn, parent, name, attrs)
            })
            .collect(),
    );

    assert_eq!(fingerprint(&enumerated), fingerprint(&replayed));
}

#[test]
fn replay_with_later_changes_converges() {
    // Both indexes start from the same snapshot; one learns the follow-up
    // changes from the journal, the other from a re-enumeration of the
    // final state.
    let replayed = fresh_index();
    apply(
        &replayed,
        vec![
            change(ChangeReason::Created, 100, 5, "Work", DIR),
            change(ChangeReason::Created, 101, 100, "a.txt", 0),
            change(ChangeReason::Created, 102, 100, "tmp.txt", 0),
        ],
    );
    apply(
        &replayed,
        vec![
            change(ChangeReason::Deleted, 102, 100, "tmp.txt", 0),
            change(ChangeReason::RenamedOld, 101, 100, "a.txt", 0),
            change(ChangeReason::RenamedNew, 101, 100, "a2.txt", 0),
            change(ChangeReason::Created, 103, 100, "new.txt", 0),
        ],
    );

    let reenumerated = fresh_index();
    for (frn, parent, name, attrs) in [
        (100u64, 5u64, "Work", DIR),
        (101, 100, "a2.txt", 0),
        (103, 100, "new.txt", 0),
    ] {
        reenumerated.insert(compact(&reenumerated, frn, parent, name, attrs));
    }

    assert_eq!(fingerprint(&replayed), fingerprint(&reenumerated));
}

#[test]
fn usn_deletion_removes_record_everywhere() {
    let index = fresh_index();
    index.insert(compact(&index, 100, 5, "A", DIR));
    index.insert(compact(&index, 101, 100, "b.txt", 0));
    let target = FileRef::from_parts(101, 1);
    assert!(index.contains(target));
    assert_eq!(index.extension_bucket_len(".txt"), 1);

    apply(
        &index,
        vec![change(ChangeReason::Deleted, 101, 100, "b.txt", 0)],
    );

    assert_eq!(index.get(target), None);
    assert_eq!(index.extension_bucket_len(".txt"), 0);

    let mut result = fastfind::search::execute(
        Arc::clone(&index),
        None,
        SearchQuery::for_text("b.txt"),
        CancellationToken::new(),
    );
    assert!(result.collect_files().is_empty());
}

#[test]
fn deleting_directory_then_children_is_order_tolerant() {
    let index = fresh_index();
    index.insert(compact(&index, 100, 5, "Gone", DIR));
    index.insert(compact(&index, 101, 100, "x.txt", 0));

    // Journals emit child deletes before the directory's own delete, but
    // bursts can arrive in either order within a batch window.
    apply(
        &index,
        vec![
            change(ChangeReason::Deleted, 101, 100, "x.txt", 0),
            change(ChangeReason::Deleted, 100, 5, "Gone", DIR),
        ],
    );
    assert_eq!(index.len(), 0);
}

#[test]
fn events_flow_to_subscribers_during_sync() {
    let index = fresh_index();
    let bus = Arc::new(ChangeBus::new());
    let events = bus.subscribe();
    let adapter = SyncAdapter::new(Arc::clone(&index), Arc::clone(&bus));
    let (tx, rx) = unbounded();

    let worker = std::thread::spawn(move || adapter.run(rx, &CancellationToken::new()));
    tx.send(change(ChangeReason::Created, 100, 5, "Live", DIR))
        .unwrap();
    tx.send(change(ChangeReason::Created, 101, 100, "seen.txt", 0))
        .unwrap();
    drop(tx);
    let counters = worker.join().unwrap();

    assert_eq!(counters.created, 2);
    let received: Vec<_> = events
        .recv_timeout(Duration::from_secs(1))
        .into_iter()
        .chain(events.try_iter())
        .collect();
    assert_eq!(received.len(), 2);
    assert!(received.iter().any(|e| e.path.ends_with("seen.txt")));
}
