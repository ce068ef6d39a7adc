use dashmap::DashMap;

use crate::record::{CompactRecord, FileRef};

/// Authoritative file_ref → CompactRecord table. Sharded map so readers
/// stay on the lock-free fast path while the single ingest writer appends.
/// Records are 40-byte Copy values; `get` hands out a copy, never a
/// reference into the map.
///
/// Keys are MFT record numbers (the low 48 bits). Parent references in USN
/// records carry the parent's sequence number at enumeration time, which
/// can lag the parent's current sequence; linking by record number keeps
/// parent-chain walks stable across that skew.
pub struct RecordStore {
    records: DashMap<u64, CompactRecord>,
}

impl RecordStore {
    pub fn new() -> Self {
        RecordStore {
            records: DashMap::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        RecordStore {
            records: DashMap::with_capacity(capacity),
        }
    }

    /// Atomic insert-or-replace. Returns the previous record when one with
    /// the same record number existed.
    pub fn insert_or_replace(&self, rec: CompactRecord) -> Option<CompactRecord> {
        self.records.insert(rec.file_ref().record_number(), rec)
    }

    pub fn get(&self, file_ref: FileRef) -> Option<CompactRecord> {
        self.records.get(&file_ref.record_number()).map(|r| *r)
    }

    pub fn contains(&self, file_ref: FileRef) -> bool {
        self.records.contains_key(&file_ref.record_number())
    }

    pub fn remove(&self, file_ref: FileRef) -> Option<CompactRecord> {
        self.records
            .remove(&file_ref.record_number())
            .map(|(_, rec)| rec)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate all records as copies. The 40-byte values are snapshotted
    /// shard by shard first, so the callback may touch the store (and the
    /// sync writer may make progress) without holding map guards.
    /// Returning false stops the walk early.
    pub fn for_each(&self, mut f: impl FnMut(CompactRecord) -> bool) {
        let snapshot: Vec<CompactRecord> = self.records.iter().map(|e| *e.value()).collect();
        for rec in snapshot {
            if !f(rec) {
                break;
            }
        }
    }

    /// Retained bytes of the table itself (strings are accounted by the
    /// pool). Bucket overhead is approximated at one pointer per entry.
    pub fn retained_bytes(&self) -> u64 {
        let per_entry = std::mem::size_of::<CompactRecord>() + std::mem::size_of::<u64>() * 2;
        (self.records.len() * per_entry) as u64
    }
}

impl Default for RecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FileAttributes;
    use crate::strings::StringId;

    fn rec(frn: u64, parent: u64, size: u64) -> CompactRecord {
        CompactRecord {
            file_ref: FileRef::from_parts(frn, 1),
            parent_ref: FileRef::from_parts(parent, 1),
            name_id: StringId::EMPTY,
            attributes: FileAttributes(0),
            size,
            modified_ticks: 0,
        }
    }

    #[test]
    fn insert_get_remove() {
        let store = RecordStore::new();
        let r = rec(10, 5, 100);
        assert!(store.insert_or_replace(r).is_none());
        assert_eq!(store.get(r.file_ref()), Some(r));
        assert!(store.contains(r.file_ref()));

        let replaced = store.insert_or_replace(rec(10, 5, 200)).unwrap();
        assert_eq!(replaced.size(), 100);
        assert_eq!(store.get(r.file_ref()).unwrap().size(), 200);

        assert_eq!(store.remove(r.file_ref()).unwrap().size(), 200);
        assert_eq!(store.get(r.file_ref()), None);
        assert!(!store.contains(r.file_ref()));
    }

    #[test]
    fn lookup_ignores_sequence_skew() {
        let store = RecordStore::new();
        store.insert_or_replace(rec(10, 5, 100));
        // Same record number, newer sequence: still resolves.
        assert!(store.get(FileRef::from_parts(10, 9)).is_some());
    }

    #[test]
    fn for_each_stops_early() {
        let store = RecordStore::new();
        for i in 0..10 {
            store.insert_or_replace(rec(i, 5, 0));
        }
        let mut seen = 0;
        store.for_each(|_| {
            seen += 1;
            seen < 3
        });
        assert_eq!(seen, 3);
    }
}
