use std::sync::Arc;

use url::Url;

use super::{MemoryRecordBackend, ObjectStoreRecordBackend, RecordBackend, RedbRecordBackend};
use crate::errors::CacheError;

/// Constructs a new [RecordBackend] from an URI.
///
/// The following URIs are supported:
/// - `memory:`
///   Uses a in-memory implementation. Nothing survives a restart.
/// - `redb:`
///   Uses a in-memory redb implementation.
/// - `redb:///absolute/path/to/somewhere`
///   Uses redb, using a path on the disk for persistency. Can be only opened
///   from one process at the same time.
/// - `objectstore+$url`
///   Uses any object storage supported by the [object_store] crate, for
///   example `objectstore+s3://bucket/prefix` or
///   `objectstore+file:///absolute/path`.
pub async fn from_addr(uri: &str) -> Result<Arc<dyn RecordBackend>, CacheError> {
    let url = Url::parse(uri)
        .map_err(|e| CacheError::InvalidRequest(format!("unable to parse url: {}", e)))?;

    let backend: Arc<dyn RecordBackend> = match url.scheme() {
        "memory" => {
            // memory doesn't support host or path in the URL.
            if url.has_host() || !url.path().is_empty() {
                return Err(CacheError::InvalidRequest("invalid url".to_string()));
            }
            Arc::<MemoryRecordBackend>::default()
        }
        "redb" => {
            // redb doesn't support host, and a path can be provided (otherwise
            // it'll live in memory only).
            if url.has_host() {
                return Err(CacheError::InvalidRequest("no host allowed".to_string()));
            }

            if url.path() == "/" {
                return Err(CacheError::InvalidRequest(
                    "cowardly refusing to open / with redb".to_string(),
                ));
            }

            if url.path().is_empty() {
                Arc::new(RedbRecordBackend::new_temporary()?)
            } else {
                Arc::new(RedbRecordBackend::new(url.path().into()).await?)
            }
        }
        scheme if scheme.starts_with("objectstore+") => {
            // We need to convert the URL to string, strip the prefix there, and then
            // parse it back as url, as Url::set_scheme() rejects some of the transitions we want to do.
            let trimmed_url = uri
                .strip_prefix("objectstore+")
                .and_then(|s| Url::parse(s).ok())
                .ok_or_else(|| CacheError::InvalidRequest("invalid url".to_string()))?;
            Arc::new(ObjectStoreRecordBackend::parse_url(&trimmed_url)?)
        }
        _ => {
            return Err(CacheError::InvalidRequest(format!(
                "unknown scheme: {}",
                url.scheme()
            )))
        }
    };

    Ok(backend)
}
