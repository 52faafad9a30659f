//! Durable storage of [Generation]s, so a mount can serve its last known tree
//! right after a restart, before any network activity.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use crate::errors::CacheError;
use crate::nodes::Generation;

mod from_addr;
mod memory;
mod object_store;
mod record;
mod redb;

#[cfg(test)]
mod tests;

pub use self::from_addr::from_addr;
pub use self::memory::MemoryRecordBackend;
pub use self::object_store::ObjectStoreRecordBackend;
pub use self::record::{decode_header, RecordHeader, FORMAT_VERSION};
pub use self::redb::RedbRecordBackend;

/// Storage for sequence-numbered records.
///
/// A record only counts once it is complete: implementations publish the
/// record and its completion marker atomically, or the marker strictly after
/// the record. Records without a marker are invisible.
#[async_trait]
pub trait RecordBackend: Send + Sync {
    /// Sequences of all complete records, in no particular order.
    async fn complete_sequences(&self) -> Result<Vec<u64>, CacheError>;

    /// Returns the complete record stored under `sequence`, if any.
    async fn get(&self, sequence: u64) -> Result<Option<Bytes>, CacheError>;

    /// Stores and publishes a record.
    async fn put(&self, sequence: u64, record: Bytes) -> Result<(), CacheError>;

    /// Removes a record, including its marker. Removing a missing record is
    /// not an error.
    async fn delete(&self, sequence: u64) -> Result<(), CacheError>;

    /// Identity of the backend, for the status interface.
    fn describe(&self) -> String;
}

#[async_trait]
impl<A> RecordBackend for A
where
    A: AsRef<dyn RecordBackend> + Send + Sync,
{
    async fn complete_sequences(&self) -> Result<Vec<u64>, CacheError> {
        self.as_ref().complete_sequences().await
    }

    async fn get(&self, sequence: u64) -> Result<Option<Bytes>, CacheError> {
        self.as_ref().get(sequence).await
    }

    async fn put(&self, sequence: u64, record: Bytes) -> Result<(), CacheError> {
        self.as_ref().put(sequence, record).await
    }

    async fn delete(&self, sequence: u64) -> Result<(), CacheError> {
        self.as_ref().delete(sequence).await
    }

    fn describe(&self) -> String {
        self.as_ref().describe()
    }
}

/// Append-only store of [Generation]s on top of a [RecordBackend].
pub struct CacheStore {
    backend: Arc<dyn RecordBackend>,
    /// Serializes sequence assignment and writes.
    append: tokio::sync::Mutex<()>,
    keep_records: usize,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn RecordBackend>, keep_records: usize) -> Self {
        Self {
            backend,
            append: tokio::sync::Mutex::new(()),
            keep_records: keep_records.max(1),
        }
    }

    pub fn backend_name(&self) -> String {
        self.backend.describe()
    }

    /// Durably records a generation, returning the sequence it was stored
    /// under. That is the generation's own sequence, unless the store already
    /// holds records at or above it; sequences only ever increase.
    #[instrument(skip_all, fields(generation.sequence = generation.sequence()), err)]
    pub async fn persist(&self, generation: &Generation) -> Result<u64, CacheError> {
        let _guard = self.append.lock().await;

        let mut existing = self.backend.complete_sequences().await?;
        let sequence = existing
            .iter()
            .max()
            .map_or(1, |max| max + 1)
            .max(generation.sequence());

        let data = record::encode(&generation.with_sequence(sequence))?;
        let len = data.len();
        self.backend.put(sequence, data).await?;
        info!(sequence, bytes = len, nodes = generation.node_count(), "persisted generation");

        existing.push(sequence);
        self.prune(existing).await;

        Ok(sequence)
    }

    /// Removes all but the newest `keep_records` records. Failures are only
    /// logged, stale records don't affect correctness.
    async fn prune(&self, mut sequences: Vec<u64>) {
        sequences.sort_unstable_by(|a, b| b.cmp(a));
        for sequence in sequences.into_iter().skip(self.keep_records) {
            match self.backend.delete(sequence).await {
                Ok(()) => debug!(sequence, "pruned record"),
                Err(e) => warn!(err = %e, sequence, "unable to prune record"),
            }
        }
    }

    /// Loads the newest complete and intact generation.
    ///
    /// Corrupt records are discarded, and the next older one is tried.
    /// Records of another format version are skipped, but kept.
    /// Returns [None] if no usable record exists.
    #[instrument(skip_all, err)]
    pub async fn load_latest(&self) -> Result<Option<Generation>, CacheError> {
        let mut sequences = self.backend.complete_sequences().await?;
        sequences.sort_unstable_by(|a, b| b.cmp(a));

        for sequence in sequences {
            let data = match self.backend.get(sequence).await {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e @ CacheError::Corruption(_)) => {
                    self.discard(sequence, &e).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match record::decode(sequence, &data) {
                Ok(generation) => {
                    info!(
                        sequence,
                        nodes = generation.node_count(),
                        created_at = generation.created_at(),
                        "loaded generation from cache"
                    );
                    return Ok(Some(generation));
                }
                // possibly written by a newer binary, which still wants it.
                Err(e @ CacheError::UnsupportedVersion(_)) => {
                    warn!(err = %e, sequence, "skipping cache record");
                }
                Err(e) => self.discard(sequence, &e).await,
            }
        }

        Ok(None)
    }

    async fn discard(&self, sequence: u64, reason: &CacheError) {
        warn!(err = %reason, sequence, "discarding unusable cache record");
        if let Err(e) = self.backend.delete(sequence).await {
            warn!(err = %e, sequence, "unable to delete unusable record");
        }
    }
}
