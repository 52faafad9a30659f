use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::instrument;

use super::RecordBackend;
use crate::errors::CacheError;

#[derive(Default)]
struct Records {
    data: BTreeMap<u64, Bytes>,
    complete: BTreeMap<u64, u64>,
}

/// Keeps records in process memory. Nothing survives a restart.
#[derive(Clone, Default)]
pub struct MemoryRecordBackend {
    records: Arc<RwLock<Records>>,
}

impl MemoryRecordBackend {
    /// Stores a record without its completion marker, like a crash halfway
    /// through a write would leave it.
    pub fn insert_incomplete(&self, sequence: u64, record: Bytes) {
        self.records.write().data.insert(sequence, record);
    }
}

#[async_trait]
impl RecordBackend for MemoryRecordBackend {
    async fn complete_sequences(&self) -> Result<Vec<u64>, CacheError> {
        Ok(self.records.read().complete.keys().copied().collect())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, sequence: u64) -> Result<Option<Bytes>, CacheError> {
        let records = self.records.read();
        let Some(len) = records.complete.get(&sequence) else {
            return Ok(None);
        };
        match records.data.get(&sequence) {
            Some(data) if data.len() as u64 == *len => Ok(Some(data.clone())),
            Some(_) => Err(CacheError::Corruption(format!(
                "record {} doesn't match its marker",
                sequence
            ))),
            None => Err(CacheError::Corruption(format!(
                "record {} has a marker, but no data",
                sequence
            ))),
        }
    }

    #[instrument(skip(self, record), fields(record.len = record.len()), err)]
    async fn put(&self, sequence: u64, record: Bytes) -> Result<(), CacheError> {
        let mut records = self.records.write();
        records.complete.insert(sequence, record.len() as u64);
        records.data.insert(sequence, record);
        Ok(())
    }

    async fn delete(&self, sequence: u64) -> Result<(), CacheError> {
        let mut records = self.records.write();
        records.complete.remove(&sequence);
        records.data.remove(&sequence);
        Ok(())
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}
