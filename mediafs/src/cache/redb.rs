use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::{instrument, warn};

use super::RecordBackend;
use crate::errors::CacheError;

/// Record contents, keyed by sequence.
const RECORDS_TABLE: TableDefinition<u64, Vec<u8>> = TableDefinition::new("records");

/// Completion markers, keyed by sequence. The value is the record length.
const COMPLETE_TABLE: TableDefinition<u64, u64> = TableDefinition::new("complete");

/// Keeps records in a [redb] database file. A record and its marker are
/// written in the same transaction.
#[derive(Clone)]
pub struct RedbRecordBackend {
    // We wrap the db in an Arc to be able to move it into spawn_blocking,
    // as discussed in https://github.com/cberner/redb/issues/789
    db: Arc<Database>,
    path: Option<PathBuf>,
}

impl RedbRecordBackend {
    /// Opens (or creates) the database at the given path.
    pub async fn new(path: PathBuf) -> Result<Self, CacheError> {
        if path == PathBuf::from("/") {
            return Err(CacheError::StorageError(
                "cowardly refusing to open / with redb".to_string(),
            ));
        }

        let db = tokio::task::spawn_blocking({
            let path = path.clone();
            move || -> Result<_, redb::Error> {
                let db = redb::Database::create(path)?;
                create_schema(&db)?;
                Ok(db)
            }
        })
        .await??;

        Ok(Self {
            db: Arc::new(db),
            path: Some(path),
        })
    }

    /// Constructs a new instance using the in-memory backend.
    pub fn new_temporary() -> Result<Self, CacheError> {
        let db =
            redb::Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;

        create_schema(&db)?;

        Ok(Self {
            db: Arc::new(db),
            path: None,
        })
    }
}

/// Ensures all tables are present.
fn create_schema(db: &redb::Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    txn.open_table(RECORDS_TABLE)?;
    txn.open_table(COMPLETE_TABLE)?;
    txn.commit()?;

    Ok(())
}

#[async_trait]
impl RecordBackend for RedbRecordBackend {
    #[instrument(skip_all, err)]
    async fn complete_sequences(&self) -> Result<Vec<u64>, CacheError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<_, CacheError> {
            let txn = db.begin_read()?;
            let table = txn.open_table(COMPLETE_TABLE)?;
            let mut sequences = Vec::new();
            for entry in table.iter()? {
                let (key, _) = entry?;
                sequences.push(key.value());
            }
            Ok(sequences)
        })
        .await?
    }

    #[instrument(skip(self), err)]
    async fn get(&self, sequence: u64) -> Result<Option<Bytes>, CacheError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<_, CacheError> {
            let txn = db.begin_read()?;
            let complete = txn.open_table(COMPLETE_TABLE)?;
            let Some(len) = complete.get(sequence)?.map(|v| v.value()) else {
                return Ok(None);
            };

            let records = txn.open_table(RECORDS_TABLE)?;
            let data = records.get(sequence)?.map(|v| v.value()).ok_or_else(|| {
                CacheError::Corruption(format!("record {} has a marker, but no data", sequence))
            })?;
            if data.len() as u64 != len {
                warn!(
                    expected = len,
                    actual = data.len(),
                    "record length doesn't match marker"
                );
                return Err(CacheError::Corruption(format!(
                    "record {} doesn't match its marker",
                    sequence
                )));
            }
            Ok(Some(Bytes::from(data)))
        })
        .await?
    }

    #[instrument(skip(self, record), fields(record.len = record.len()), err)]
    async fn put(&self, sequence: u64, record: Bytes) -> Result<(), CacheError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<_, CacheError> {
            let txn = db.begin_write()?;
            {
                let mut records = txn.open_table(RECORDS_TABLE)?;
                records.insert(sequence, record.to_vec())?;
                let mut complete = txn.open_table(COMPLETE_TABLE)?;
                complete.insert(sequence, record.len() as u64)?;
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, sequence: u64) -> Result<(), CacheError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<_, CacheError> {
            let txn = db.begin_write()?;
            {
                let mut complete = txn.open_table(COMPLETE_TABLE)?;
                complete.remove(sequence)?;
                let mut records = txn.open_table(RECORDS_TABLE)?;
                records.remove(sequence)?;
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }

    fn describe(&self) -> String {
        match &self.path {
            Some(path) => format!("redb://{}", path.display()),
            None => "redb://".to_string(),
        }
    }
}
