use std::io;

use thiserror::Error;
use tokio::task::JoinError;

/// Errors returned by the fetch layer, classified by how callers should
/// react to them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Timeouts, connection resets, 5xx. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The credentials were rejected. Fatal for all network activity of the mount.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The locator no longer exists on the remote.
    #[error("remote entity not found: {0}")]
    NotFound(String),

    /// The remote is marked as down, calls fail fast until the cool-down passes.
    #[error("remote is reconnecting, not attempting request")]
    Reconnecting,

    /// The remote answered with something we can't interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl FetchError {
    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::Reconnecting)
    }
}

impl From<FetchError> for io::Error {
    fn from(value: FetchError) -> Self {
        match value {
            FetchError::NotFound(_) => io::Error::from_raw_os_error(libc::ENOENT),
            FetchError::Unauthorized(_) => io::Error::from_raw_os_error(libc::EACCES),
            FetchError::Transient(_)
            | FetchError::Reconnecting
            | FetchError::InvalidResponse(_) => io::Error::from_raw_os_error(libc::EIO),
        }
    }
}

/// Errors related to the persistent cache.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// A record exists but can't be decoded or fails its integrity check.
    #[error("cache record corrupt: {0}")]
    Corruption(String),

    /// A record written by a different version of mediafs.
    #[error("cache record has unsupported format version {0}")]
    UnsupportedVersion(u32),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal storage error: {0}")]
    StorageError(String),
}

impl From<JoinError> for CacheError {
    fn from(value: JoinError) -> Self {
        CacheError::StorageError(value.to_string())
    }
}

impl From<redb::Error> for CacheError {
    fn from(value: redb::Error) -> Self {
        CacheError::StorageError(value.to_string())
    }
}

impl From<redb::DatabaseError> for CacheError {
    fn from(value: redb::DatabaseError) -> Self {
        CacheError::StorageError(value.to_string())
    }
}

impl From<redb::TableError> for CacheError {
    fn from(value: redb::TableError) -> Self {
        CacheError::StorageError(value.to_string())
    }
}

impl From<redb::TransactionError> for CacheError {
    fn from(value: redb::TransactionError) -> Self {
        CacheError::StorageError(value.to_string())
    }
}

impl From<redb::StorageError> for CacheError {
    fn from(value: redb::StorageError) -> Self {
        CacheError::StorageError(value.to_string())
    }
}

impl From<redb::CommitError> for CacheError {
    fn from(value: redb::CommitError) -> Self {
        CacheError::StorageError(value.to_string())
    }
}

impl From<object_store::Error> for CacheError {
    fn from(value: object_store::Error) -> Self {
        CacheError::StorageError(value.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::InvalidInput {
            CacheError::InvalidRequest(value.to_string())
        } else {
            CacheError::StorageError(value.to_string())
        }
    }
}

/// Errors ending a scan pass without producing a tree.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// Root enumeration failed; the previous generation stays authoritative.
    #[error("scan aborted: {0}")]
    Aborted(String),

    /// The remote rejected our credentials mid-scan.
    #[error("scan stopped, credentials rejected: {0}")]
    Unauthorized(String),

    /// The path given to a targeted rescan doesn't point to a directory.
    #[error("no directory at {0}")]
    NotADirectory(String),
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("refusing to publish generation {offered}, current is {current}")]
    StalePublish { current: u64, offered: u64 },

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
