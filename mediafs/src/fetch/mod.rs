//! Access to the remote catalog: listing children of a locator, and reading
//! byte ranges of file contents.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, instrument, warn, Span};

use crate::errors::FetchError;
use crate::nodes::{Locator, NodeKind};

mod connection;
mod http;
mod memory;
mod plex;

pub use self::connection::{
    Admission, BackoffPolicy, ConnectionHealth, ConnectionSnapshot, ConnectionTracker,
};
pub use self::http::HttpTransport;
pub use self::memory::MemoryTransport;

/// A half-open byte range `[start, end)`. An `end` of [None] reads until EOF.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    pub fn from_offset(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Number of bytes in the range, if bounded.
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

/// What a listing returns for each child of a locator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildDescriptor {
    pub id: String,
    /// Display name, not yet sanitized or disambiguated.
    pub name: String,
    pub kind: NodeKind,
    pub locator: Locator,
    /// File size in bytes. 0 for directories.
    pub size: u64,
    /// Seconds since the unix epoch.
    pub modified: u64,
    /// Remote update counter, if the catalog exposes one for this entry.
    pub change_marker: Option<u64>,
}

impl ChildDescriptor {
    pub fn directory(
        id: impl Into<String>,
        name: impl Into<String>,
        locator: impl Into<String>,
        change_marker: Option<u64>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: NodeKind::Directory,
            locator: Locator::new(locator),
            size: 0,
            modified: 0,
            change_marker,
        }
    }

    pub fn file(
        id: impl Into<String>,
        name: impl Into<String>,
        locator: impl Into<String>,
        size: u64,
        modified: u64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: NodeKind::File,
            locator: Locator::new(locator),
            size,
            modified,
            change_marker: None,
        }
    }
}

/// A stream of content bytes, as delivered by the remote.
pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

/// The protocol-specific part of talking to a remote. Implementations issue
/// exactly one request per call, retries and connection tracking are done
/// by [FetchClient].
#[async_trait]
pub trait Transport: Send + Sync {
    /// The locator of the catalog root, whose children are the sections.
    fn root(&self) -> Locator;

    /// Lists the children of a directory locator.
    async fn list_children(&self, locator: &Locator) -> Result<Vec<ChildDescriptor>, FetchError>;

    /// Opens a stream of the bytes of a file locator within the given range.
    /// A range starting at or past EOF yields an empty stream.
    async fn fetch(&self, locator: &Locator, range: ByteRange) -> Result<ByteStream, FetchError>;
}

#[async_trait]
impl<A> Transport for A
where
    A: AsRef<dyn Transport> + Send + Sync,
{
    fn root(&self) -> Locator {
        self.as_ref().root()
    }

    async fn list_children(&self, locator: &Locator) -> Result<Vec<ChildDescriptor>, FetchError> {
        self.as_ref().list_children(locator).await
    }

    async fn fetch(&self, locator: &Locator, range: ByteRange) -> Result<ByteStream, FetchError> {
        self.as_ref().fetch(locator, range).await
    }
}

/// Knobs of the [FetchClient].
#[derive(Clone, Debug)]
pub struct FetchConfig {
    pub backoff: BackoffPolicy,
    /// Upper bound for one request, and for the wait on each chunk of a
    /// content stream.
    pub request_timeout: Duration,
    /// Consecutive attempts without progress before a read gives up.
    pub read_attempts: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            request_timeout: Duration::from_secs(60),
            read_attempts: 3,
        }
    }
}

/// Wraps a [Transport] with connection health tracking, backoff and resume.
pub struct FetchClient {
    transport: Arc<dyn Transport>,
    connection: ConnectionTracker,
    request_timeout: Duration,
    read_attempts: u32,
}

impl FetchClient {
    pub fn new(transport: Arc<dyn Transport>, config: FetchConfig) -> Self {
        Self {
            transport,
            connection: ConnectionTracker::new(config.backoff),
            request_timeout: config.request_timeout,
            read_attempts: config.read_attempts.max(1),
        }
    }

    pub fn root(&self) -> Locator {
        self.transport.root()
    }

    pub fn connection(&self) -> ConnectionSnapshot {
        self.connection.snapshot()
    }

    pub fn health(&self) -> ConnectionHealth {
        self.connection.health()
    }

    /// Resumes requests after the remote rejected the credentials.
    pub fn clear_unauthorized(&self) {
        self.connection.clear_unauthorized()
    }

    /// Consults the connection state before an attempt, sleeping for the
    /// backoff delay if degraded.
    async fn admit(&self) -> Result<(), FetchError> {
        match self.connection.admit() {
            Admission::Proceed => Ok(()),
            Admission::Wait(delay) => {
                debug!(delay_ms = delay.as_millis() as u64, "backing off");
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Admission::Reject => Err(FetchError::Reconnecting),
            Admission::Unauthorized => Err(FetchError::Unauthorized(
                "credentials were rejected, waiting for a rescan request".into(),
            )),
        }
    }

    /// Feeds the outcome of an attempt into the connection state.
    /// A "not found" is an answer from a healthy remote.
    fn observe<T>(&self, result: &Result<T, FetchError>) {
        match result {
            Ok(_) | Err(FetchError::NotFound(_)) => self.connection.record_success(),
            Err(FetchError::Reconnecting) => {}
            Err(e) => self.connection.record_failure(e),
        }
    }

    /// Lists the children of a locator. One attempt, bounded by the request
    /// timeout. Retrying is left to the caller.
    #[instrument(skip_all, fields(locator = %locator), err)]
    pub async fn list_children(
        &self,
        locator: &Locator,
    ) -> Result<Vec<ChildDescriptor>, FetchError> {
        self.admit().await?;

        let result = match tokio::time::timeout(
            self.request_timeout,
            self.transport.list_children(locator),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Transient(format!(
                "listing timed out after {:?}",
                self.request_timeout
            ))),
        };

        self.observe(&result);
        result
    }

    /// Reads the given range of a file (the whole file for [None]).
    ///
    /// A dropped connection is resumed by requesting the remainder starting
    /// at the already delivered offset, so the returned bytes are exactly the
    /// same as for an uninterrupted read. Every attempt that makes progress
    /// refills the attempt budget.
    #[instrument(skip_all, fields(locator = %locator, range = ?range, bytes = tracing::field::Empty), err)]
    pub async fn fetch(
        &self,
        locator: &Locator,
        range: Option<ByteRange>,
    ) -> Result<Bytes, FetchError> {
        let range = range.unwrap_or_default();

        if range.is_empty() || range.end.is_some_and(|end| end < range.start) {
            return Ok(Bytes::new());
        }

        let mut buf = BytesMut::with_capacity(
            range.len().map(|l| l.min(16 * 1024 * 1024) as usize).unwrap_or(0),
        );
        let mut attempts_left = self.read_attempts;

        loop {
            let offset = range.start + buf.len() as u64;
            let remaining = ByteRange {
                start: offset,
                end: range.end,
            };
            let delivered_before = buf.len();

            match self.fetch_attempt(locator, remaining, &mut buf).await {
                Ok(()) => break,
                Err(FetchError::Transient(reason)) => {
                    if buf.len() > delivered_before {
                        attempts_left = self.read_attempts;
                    }
                    attempts_left -= 1;
                    if attempts_left == 0 {
                        warn!(err = %reason, offset, "giving up on read");
                        return Err(FetchError::Transient(reason));
                    }
                    debug!(
                        err = %reason,
                        offset = range.start + buf.len() as u64,
                        "resuming read"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        Span::current().record("bytes", buf.len());
        Ok(buf.freeze())
    }

    /// One request, appending everything received to `buf`, even when the
    /// stream breaks halfway.
    async fn fetch_attempt(
        &self,
        locator: &Locator,
        range: ByteRange,
        buf: &mut BytesMut,
    ) -> Result<(), FetchError> {
        self.admit().await?;

        let result = self.stream_into(locator, range, buf).await;
        self.observe(&result);
        result
    }

    async fn stream_into(
        &self,
        locator: &Locator,
        range: ByteRange,
        buf: &mut BytesMut,
    ) -> Result<(), FetchError> {
        let timed_out =
            || FetchError::Transient(format!("no data within {:?}", self.request_timeout));

        let mut stream =
            tokio::time::timeout(self.request_timeout, self.transport.fetch(locator, range))
                .await
                .map_err(|_| timed_out())??;

        let mut wanted = range.len();
        while let Some(chunk) = tokio::time::timeout(self.request_timeout, stream.next())
            .await
            .map_err(|_| timed_out())?
        {
            let mut chunk = chunk?;
            if let Some(w) = wanted.as_mut() {
                // a remote ignoring the range end doesn't get to overfill.
                if chunk.len() as u64 > *w {
                    chunk.truncate(*w as usize);
                }
                *w -= chunk.len() as u64;
            }
            buf.extend_from_slice(&chunk);
            if wanted == Some(0) {
                break;
            }
        }
        Ok(())
    }
}
