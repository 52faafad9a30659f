use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::{path::Path, ObjectStore};
use tracing::{debug, instrument, trace, warn, Level};
use url::Url;

use super::RecordBackend;
use crate::errors::CacheError;

/// Keeps records in any object storage supported by the [object_store] crate.
///
/// # Layout
/// - `${base_path}/records/${sequence}.record`: the record.
/// - `${base_path}/records/${sequence}.complete`: the completion marker,
///   holding the record length in decimal.
/// - `${base_path}/staging/${sequence}-${uuid}.record`: records being uploaded.
///
/// Sequences are zero-padded to 20 digits, so listings sort numerically.
///
/// A record is uploaded to a staging key, renamed into place, and only then
/// the marker is written. An interrupted upload leaves at most an unmarked
/// record behind, which is ignored.
#[derive(Clone)]
pub struct ObjectStoreRecordBackend {
    object_store: Arc<dyn ObjectStore>,
    base_path: Path,
    url: String,
}

impl ObjectStoreRecordBackend {
    /// Constructs a new [ObjectStoreRecordBackend] from a [Url] supported by
    /// [object_store].
    /// Any path suffix becomes the base path of the object store.
    /// additional options, the same as in [object_store::parse_url_opts] can
    /// be passed.
    pub fn parse_url_opts<I, K, V>(url: &Url, options: I) -> Result<Self, object_store::Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let (object_store, path) = object_store::parse_url_opts(url, options)?;

        Ok(Self {
            object_store: Arc::new(object_store),
            base_path: path,
            url: url.to_string(),
        })
    }

    /// Like [Self::parse_url_opts], except without the options.
    pub fn parse_url(url: &Url) -> Result<Self, object_store::Error> {
        Self::parse_url_opts(url, Vec::<(String, String)>::new())
    }
}

#[instrument(level=Level::TRACE, skip_all, fields(base_path=%base_path, record.sequence=sequence), ret(Display))]
fn derive_record_path(base_path: &Path, sequence: u64) -> Path {
    base_path
        .child("records")
        .child(format!("{:020}.record", sequence))
}

#[instrument(level=Level::TRACE, skip_all, fields(base_path=%base_path, record.sequence=sequence), ret(Display))]
fn derive_marker_path(base_path: &Path, sequence: u64) -> Path {
    base_path
        .child("records")
        .child(format!("{:020}.complete", sequence))
}

fn derive_staging_path(base_path: &Path, sequence: u64) -> Path {
    base_path
        .child("staging")
        .child(format!("{:020}-{}.record", sequence, uuid::Uuid::new_v4()))
}

/// Parses the sequence out of a marker's file name.
fn parse_marker_name(name: &str) -> Option<u64> {
    name.strip_suffix(".complete")?.parse().ok()
}

impl ObjectStoreRecordBackend {
    /// Reads an object, mapping a missing one to [None].
    async fn get_opt(&self, path: &Path) -> Result<Option<Bytes>, CacheError> {
        match self.object_store.get(path).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_opt(&self, path: &Path) -> Result<(), CacheError> {
        match self.object_store.delete(path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl RecordBackend for ObjectStoreRecordBackend {
    #[instrument(skip_all, err)]
    async fn complete_sequences(&self) -> Result<Vec<u64>, CacheError> {
        let prefix = self.base_path.child("records");
        let objects: Vec<_> = self
            .object_store
            .list(Some(&prefix))
            .try_collect()
            .await?;

        Ok(objects
            .iter()
            .filter_map(|meta| meta.location.filename().and_then(parse_marker_name))
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, sequence: u64) -> Result<Option<Bytes>, CacheError> {
        let Some(marker) = self
            .get_opt(&derive_marker_path(&self.base_path, sequence))
            .await?
        else {
            return Ok(None);
        };
        let len: u64 = std::str::from_utf8(&marker)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| {
                CacheError::Corruption(format!("marker of record {} is unreadable", sequence))
            })?;

        let data = self
            .get_opt(&derive_record_path(&self.base_path, sequence))
            .await?
            .ok_or_else(|| {
                CacheError::Corruption(format!("record {} has a marker, but no data", sequence))
            })?;

        if data.len() as u64 != len {
            warn!(expected = len, actual = data.len(), "record length doesn't match marker");
            return Err(CacheError::Corruption(format!(
                "record {} doesn't match its marker",
                sequence
            )));
        }
        Ok(Some(data))
    }

    #[instrument(skip(self, record), fields(record.len = record.len()), err)]
    async fn put(&self, sequence: u64, record: Bytes) -> Result<(), CacheError> {
        let staging = derive_staging_path(&self.base_path, sequence);
        let record_path = derive_record_path(&self.base_path, sequence);
        let len = record.len();

        self.object_store.put(&staging, record.into()).await?;
        trace!(staging = %staging, "uploaded record");

        // copy-then-delete on most stores, the marker comes strictly after.
        if let Err(e) = self.object_store.rename(&staging, &record_path).await {
            if let Err(e) = self.delete_opt(&staging).await {
                warn!(err = %e, staging = %staging, "unable to remove staged record");
            }
            return Err(e.into());
        }

        self.object_store
            .put(
                &derive_marker_path(&self.base_path, sequence),
                Bytes::from(len.to_string()).into(),
            )
            .await?;
        debug!(path = %record_path, "published record");
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete(&self, sequence: u64) -> Result<(), CacheError> {
        // marker first, an interrupted delete leaves an ignored record.
        self.delete_opt(&derive_marker_path(&self.base_path, sequence))
            .await?;
        self.delete_opt(&derive_record_path(&self.base_path, sequence))
            .await
    }

    fn describe(&self) -> String {
        format!("objectstore+{}", self.url)
    }
}
