use std::collections::BTreeMap;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::record::FileRef;
use crate::strings::StringId;

/// extension-id → file refs. Id 0 doubles as the "no extension" bucket.
/// Extension-only queries iterate one bucket and never touch the trie.
pub struct ExtensionBuckets {
    buckets: DashMap<StringId, Vec<FileRef>>,
}

impl ExtensionBuckets {
    pub fn new() -> Self {
        ExtensionBuckets {
            buckets: DashMap::new(),
        }
    }

    pub fn add(&self, ext_id: StringId, file_ref: FileRef) {
        self.buckets.entry(ext_id).or_default().push(file_ref);
    }

    pub fn remove(&self, ext_id: StringId, file_ref: FileRef) -> bool {
        let Some(mut bucket) = self.buckets.get_mut(&ext_id) else {
            return false;
        };
        let before = bucket.len();
        bucket.retain(|&r| r != file_ref);
        before != bucket.len()
    }

    /// Copy of the bucket's refs; empty when the extension was never seen.
    pub fn refs(&self, ext_id: StringId) -> Vec<FileRef> {
        self.buckets
            .get(&ext_id)
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    pub fn bucket_len(&self, ext_id: StringId) -> usize {
        self.buckets.get(&ext_id).map(|b| b.len()).unwrap_or(0)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl Default for ExtensionBuckets {
    fn default() -> Self {
        Self::new()
    }
}

/// Size-sorted secondary index. Optional: only populated when the build
/// collects sizes, so the MFT-only path (sizes unknown, all zero) does not
/// pay for a tree of zeros.
pub struct SizeIndex {
    by_size: RwLock<BTreeMap<u64, Vec<FileRef>>>,
    enabled: bool,
}

impl SizeIndex {
    pub fn new(enabled: bool) -> Self {
        SizeIndex {
            by_size: RwLock::new(BTreeMap::new()),
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn add(&self, size: u64, file_ref: FileRef) {
        if !self.enabled {
            return;
        }
        self.by_size.write().entry(size).or_default().push(file_ref);
    }

    pub fn remove(&self, size: u64, file_ref: FileRef) {
        if !self.enabled {
            return;
        }
        let mut map = self.by_size.write();
        if let Some(bucket) = map.get_mut(&size) {
            bucket.retain(|&r| r != file_ref);
            if bucket.is_empty() {
                map.remove(&size);
            }
        }
    }

    /// Refs whose size lies in `[min, max]`, ascending by size.
    pub fn range(&self, min: u64, max: u64) -> Vec<FileRef> {
        let map = self.by_size.read();
        let mut out = Vec::new();
        for (_, bucket) in map.range(min..=max) {
            out.extend_from_slice(bucket);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fr(n: u64) -> FileRef {
        FileRef::from_parts(n, 1)
    }

    #[test]
    fn extension_bucket_membership() {
        let ext = ExtensionBuckets::new();
        let cs = StringId(7);
        ext.add(cs, fr(1));
        ext.add(cs, fr(2));
        ext.add(StringId::EMPTY, fr(3));

        assert_eq!(ext.refs(cs), vec![fr(1), fr(2)]);
        assert_eq!(ext.bucket_len(StringId::EMPTY), 1);
        assert!(ext.remove(cs, fr(1)));
        assert!(!ext.remove(cs, fr(1)));
        assert_eq!(ext.refs(cs), vec![fr(2)]);
        assert!(ext.refs(StringId(99)).is_empty());
    }

    #[test]
    fn size_range_query() {
        let sizes = SizeIndex::new(true);
        sizes.add(100, fr(1));
        sizes.add(200, fr(2));
        sizes.add(200, fr(3));
        sizes.add(5000, fr(4));

        assert_eq!(sizes.range(150, 4000), vec![fr(2), fr(3)]);
        assert_eq!(sizes.range(0, u64::MAX).len(), 4);

        sizes.remove(200, fr(2));
        assert_eq!(sizes.range(150, 4000), vec![fr(3)]);
    }

    #[test]
    fn disabled_size_index_is_inert() {
        let sizes = SizeIndex::new(false);
        sizes.add(100, fr(1));
        assert!(sizes.range(0, u64::MAX).is_empty());
    }
}
