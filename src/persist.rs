//! Contract for the persistence back-end. The core never implements
//! storage itself; it hands batches of records to whatever sink the host
//! wires in (SQLite, flat file, nothing). `MemoryPersistence` exists so
//! the pipeline and its tests have a real sink to talk to.

use parking_lot::Mutex;

use crossbeam_channel::Receiver;

use crate::error::{FastFindError, Result};
use crate::query::SearchQuery;
use crate::record::FullRecord;

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PersistenceStats {
    pub total_records: u64,
    pub total_directories: u64,
    pub storage_bytes: u64,
}

/// Batch-oriented sink the pipeline writes through. Implementations are
/// free to buffer; `optimize` is the flush/compact point.
pub trait IndexPersistence: Send + Sync {
    fn initialize(&self) -> Result<()>;

    fn clear(&self) -> Result<()>;

    fn optimize(&self) -> Result<()>;

    /// Returns the number of records actually inserted.
    fn add_batch(&self, records: &[FullRecord]) -> Result<usize>;

    /// Drain a lazy stream in `buffer_size` chunks, reporting progress
    /// after each chunk.
    fn add_from_stream(
        &self,
        records: Receiver<FullRecord>,
        buffer_size: usize,
        progress: &mut dyn FnMut(usize),
    ) -> Result<usize> {
        let mut buffer = Vec::with_capacity(buffer_size);
        let mut inserted = 0;
        for record in records {
            buffer.push(record);
            if buffer.len() >= buffer_size {
                inserted += self.add_batch(&buffer)?;
                progress(inserted);
                buffer.clear();
            }
        }
        if !buffer.is_empty() {
            inserted += self.add_batch(&buffer)?;
            progress(inserted);
        }
        Ok(inserted)
    }

    fn update(&self, record: &FullRecord) -> Result<()>;

    fn delete(&self, path: &str) -> Result<()>;

    fn get_by_extension(&self, extension: &str) -> Result<Vec<FullRecord>>;

    fn search(&self, query: &SearchQuery) -> Result<Vec<FullRecord>>;

    fn statistics(&self) -> Result<PersistenceStats>;
}

/// In-memory sink: the default when the host wires no storage, and the
/// double the pipeline tests assert against.
#[derive(Default)]
pub struct MemoryPersistence {
    records: Mutex<Vec<FullRecord>>,
    initialized: Mutex<bool>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IndexPersistence for MemoryPersistence {
    fn initialize(&self) -> Result<()> {
        *self.initialized.lock() = true;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.records.lock().clear();
        Ok(())
    }

    fn optimize(&self) -> Result<()> {
        Ok(())
    }

    fn add_batch(&self, records: &[FullRecord]) -> Result<usize> {
        if !*self.initialized.lock() {
            return Err(FastFindError::Persistence(
                "sink used before initialize".into(),
            ));
        }
        let mut store = self.records.lock();
        store.extend_from_slice(records);
        Ok(records.len())
    }

    fn update(&self, record: &FullRecord) -> Result<()> {
        let mut store = self.records.lock();
        match store.iter_mut().find(|r| r.path == record.path) {
            Some(existing) => *existing = record.clone(),
            None => store.push(record.clone()),
        }
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.records.lock().retain(|r| r.path != path);
        Ok(())
    }

    fn get_by_extension(&self, extension: &str) -> Result<Vec<FullRecord>> {
        let wanted = crate::strings::StringPool::normalize_extension(extension);
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| r.extension().as_deref() == Some(wanted.as_str()))
            .cloned()
            .collect())
    }

    fn search(&self, query: &SearchQuery) -> Result<Vec<FullRecord>> {
        let needle = query.trimmed_text();
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| {
                crate::search::matcher::contains(&r.name, needle, query.case_sensitive)
            })
            .cloned()
            .collect())
    }

    fn statistics(&self) -> Result<PersistenceStats> {
        let store = self.records.lock();
        let dirs = store.iter().filter(|r| r.is_directory()).count() as u64;
        let bytes: u64 = store
            .iter()
            .map(|r| (std::mem::size_of::<FullRecord>() + r.name.len() + r.path.len()) as u64)
            .sum();
        Ok(PersistenceStats {
            total_records: store.len() as u64,
            total_directories: dirs,
            storage_bytes: bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FileAttributes, FileRef};

    fn full(name: &str, path: &str) -> FullRecord {
        FullRecord {
            file_ref: FileRef::synthetic(1),
            parent_ref: FileRef::synthetic(0),
            name: name.into(),
            path: path.into(),
            attributes: FileAttributes(0),
            size: 0,
            created_ticks: 0,
            accessed_ticks: 0,
            modified_ticks: 0,
        }
    }

    #[test]
    fn batch_requires_initialize() {
        let sink = MemoryPersistence::new();
        assert!(sink.add_batch(&[full("a.txt", "c:\\a.txt")]).is_err());
        sink.initialize().unwrap();
        assert_eq!(sink.add_batch(&[full("a.txt", "c:\\a.txt")]).unwrap(), 1);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn stream_ingest_reports_progress() {
        let sink = MemoryPersistence::new();
        sink.initialize().unwrap();
        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..25 {
            tx.send(full(&format!("f{i}.txt"), &format!("c:\\f{i}.txt")))
                .unwrap();
        }
        drop(tx);
        let mut reports = Vec::new();
        let inserted = sink
            .add_from_stream(rx, 10, &mut |n| reports.push(n))
            .unwrap();
        assert_eq!(inserted, 25);
        assert_eq!(reports, vec![10, 20, 25]);
    }

    #[test]
    fn update_delete_and_extension_lookup() {
        let sink = MemoryPersistence::new();
        sink.initialize().unwrap();
        sink.add_batch(&[full("a.cs", "c:\\a.cs"), full("b.md", "c:\\b.md")])
            .unwrap();

        assert_eq!(sink.get_by_extension("cs").unwrap().len(), 1);
        sink.delete("c:\\a.cs").unwrap();
        assert!(sink.get_by_extension("cs").unwrap().is_empty());

        sink.update(&full("c.rs", "c:\\c.rs")).unwrap();
        assert_eq!(sink.len(), 2);
        let stats = sink.statistics().unwrap();
        assert_eq!(stats.total_records, 2);
    }
}
