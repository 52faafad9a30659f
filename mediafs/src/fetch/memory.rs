use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use tracing::instrument;

use super::{ByteRange, ByteStream, ChildDescriptor, Transport};
use crate::errors::FetchError;
use crate::nodes::Locator;

enum Entry {
    Directory(Vec<ChildDescriptor>),
    File(Bytes),
}

#[derive(Default)]
struct Faults {
    /// Remaining listing failures per locator.
    failing_listings: HashMap<Locator, u32>,
    /// Per locator: bytes to deliver before breaking the stream, and how many
    /// more streams to break.
    dropped_streams: HashMap<Locator, (usize, u32)>,
    list_delay: Option<Duration>,
}

/// A catalog kept in memory, with knobs to inject failures.
///
/// Used by the tests, and handy to mount a fixed tree without any remote.
pub struct MemoryTransport {
    root: Locator,
    entries: RwLock<HashMap<Locator, Entry>>,
    faults: RwLock<Faults>,
    unauthorized: AtomicBool,
    chunk_size: usize,
    list_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
}

impl MemoryTransport {
    pub fn new(root: Locator) -> Self {
        let mut entries = HashMap::new();
        entries.insert(root.clone(), Entry::Directory(vec![]));
        Self {
            root,
            entries: RwLock::new(entries),
            faults: RwLock::new(Faults::default()),
            unauthorized: AtomicBool::new(false),
            chunk_size: 8,
            list_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
        }
    }

    pub fn root_locator(&self) -> Locator {
        self.root.clone()
    }

    /// Sets (or replaces) the listing of a directory locator.
    pub fn insert_directory(&self, locator: &Locator, children: Vec<ChildDescriptor>) {
        self.entries
            .write()
            .insert(locator.clone(), Entry::Directory(children));
    }

    /// Sets (or replaces) the contents of a file locator.
    pub fn insert_file(&self, locator: &Locator, contents: impl Into<Bytes>) {
        self.entries
            .write()
            .insert(locator.clone(), Entry::File(contents.into()));
    }

    /// Removes a locator, later calls for it return [FetchError::NotFound].
    pub fn remove(&self, locator: &Locator) {
        self.entries.write().remove(locator);
    }

    /// Makes the next `times` listings of `locator` fail transiently.
    pub fn fail_listing(&self, locator: &Locator, times: u32) {
        self.faults
            .write()
            .failing_listings
            .insert(locator.clone(), times);
    }

    /// Breaks the next `times` content streams of `locator` after `after`
    /// bytes.
    pub fn drop_stream_after(&self, locator: &Locator, after: usize, times: u32) {
        self.faults
            .write()
            .dropped_streams
            .insert(locator.clone(), (after, times));
    }

    /// Rejects every request with [FetchError::Unauthorized] while set.
    pub fn set_unauthorized(&self, unauthorized: bool) {
        self.unauthorized.store(unauthorized, Ordering::SeqCst);
    }

    /// Delays every listing, to keep scans in flight for a while.
    pub fn set_list_delay(&self, delay: Duration) {
        self.faults.write().list_delay = Some(delay);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn check_authorized(&self) -> Result<(), FetchError> {
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(FetchError::Unauthorized("token rejected".into()));
        }
        Ok(())
    }

    /// Consumes one armed listing failure, if any.
    fn take_listing_fault(&self, locator: &Locator) -> bool {
        let mut faults = self.faults.write();
        match faults.failing_listings.get_mut(locator) {
            Some(remaining) if *remaining > 0 => {
                *remaining = remaining.saturating_sub(1);
                true
            }
            _ => false,
        }
    }

    /// Consumes one armed stream break, returning after how many bytes.
    fn take_stream_fault(&self, locator: &Locator) -> Option<usize> {
        let mut faults = self.faults.write();
        match faults.dropped_streams.get_mut(locator) {
            Some((after, remaining)) if *remaining > 0 => {
                *remaining = remaining.saturating_sub(1);
                Some(*after)
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn root(&self) -> Locator {
        self.root.clone()
    }

    #[instrument(skip_all, fields(locator = %locator))]
    async fn list_children(&self, locator: &Locator) -> Result<Vec<ChildDescriptor>, FetchError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.faults.read().list_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.check_authorized()?;
        if self.take_listing_fault(locator) {
            return Err(FetchError::Transient(format!(
                "injected listing failure for {}",
                locator
            )));
        }

        match self.entries.read().get(locator) {
            Some(Entry::Directory(children)) => Ok(children.clone()),
            Some(Entry::File(_)) => Err(FetchError::InvalidResponse(format!(
                "{} is not a directory",
                locator
            ))),
            None => Err(FetchError::NotFound(locator.to_string())),
        }
    }

    #[instrument(skip_all, fields(locator = %locator, range = ?range))]
    async fn fetch(&self, locator: &Locator, range: ByteRange) -> Result<ByteStream, FetchError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_authorized()?;

        let contents = match self.entries.read().get(locator) {
            Some(Entry::File(contents)) => contents.clone(),
            Some(Entry::Directory(_)) => {
                return Err(FetchError::InvalidResponse(format!(
                    "{} is not a file",
                    locator
                )))
            }
            None => return Err(FetchError::NotFound(locator.to_string())),
        };

        let len = contents.len() as u64;
        let start = range.start.min(len) as usize;
        let end = range.end.map_or(len, |end| end.min(len)).max(start as u64) as usize;
        let mut slice = contents.slice(start..end);

        let mut chunks: Vec<Result<Bytes, FetchError>> = Vec::new();
        let broken_after = self.take_stream_fault(locator);
        if let Some(after) = broken_after {
            slice.truncate(after);
        }
        while !slice.is_empty() {
            let n = self.chunk_size.min(slice.len());
            chunks.push(Ok(slice.split_to(n)));
        }
        if broken_after.is_some() {
            chunks.push(Err(FetchError::Transient("connection reset".into())));
        }

        Ok(futures::stream::iter(chunks).boxed())
    }
}
