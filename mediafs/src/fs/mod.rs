mod file_attr;
mod inode_tracker;

#[cfg(feature = "fuse")]
pub mod fuse;


use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, instrument, warn};

use crate::control::Refresher;
use crate::errors::FetchError;
use crate::fetch::{ByteRange, FetchClient};
use crate::nodes::{Locator, Node};
use crate::status::Status;
use crate::tree::TreeManager;

pub use self::file_attr::FileAttributes;
pub use self::inode_tracker::{InodeTracker, ROOT_ID};

/// What an open handle reads from. The locator is captured at open time, so
/// publishing a new generation doesn't disturb reads in progress.
struct OpenFile {
    path: String,
    locator: Locator,
    size: u64,
}

/// This implements a read-only filesystem over the current generation of
/// the [TreeManager], reading file contents through the [FetchClient].
///
/// The operations are available by path, and, with the `fuse` feature, as a
/// [fuse_backend_rs::api::filesystem::FileSystem] working on inodes.
/// Inodes are allocated per path by the [InodeTracker] when the kernel first
/// sees them in a `lookup` or `readdir`.
///
/// Every mutating operation fails with EROFS.
pub struct MediaFs {
    refresher: Arc<Refresher>,
    status: Arc<Status>,

    /// This keeps track of inodes and the paths they stand for.
    inode_tracker: RwLock<InodeTracker>,

    /// This holds all open file handles
    file_handles: RwLock<HashMap<u64, Arc<Mutex<OpenFile>>>>,

    next_file_handle: AtomicU64,

    #[cfg(feature = "fuse")]
    tokio_handle: tokio::runtime::Handle,
}

fn errno(code: libc::c_int) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// The directory containing `path`.
fn parent_path(path: &str) -> &str {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

impl MediaFs {
    /// Must be called from within a tokio runtime.
    pub fn new(refresher: Arc<Refresher>, status: Arc<Status>) -> Self {
        Self {
            refresher,
            status,
            inode_tracker: RwLock::new(Default::default()),
            file_handles: RwLock::new(Default::default()),
            next_file_handle: AtomicU64::new(1),
            #[cfg(feature = "fuse")]
            tokio_handle: tokio::runtime::Handle::current(),
        }
    }

    fn tree(&self) -> &Arc<TreeManager> {
        self.refresher.tree()
    }

    fn fetch(&self) -> &Arc<FetchClient> {
        self.refresher.scanner().fetch()
    }

    /// Returns the attributes of the node at `path` in the current
    /// generation.
    pub fn attributes(&self, path: &str) -> io::Result<FileAttributes> {
        let generation = self.tree().current();
        let node = generation
            .resolve(path)
            .ok_or_else(|| errno(libc::ENOENT))?;
        Ok(FileAttributes::of(&node, generation.created_at()))
    }

    /// Lists the directory at `path`, ordered by name.
    pub fn list_directory(&self, path: &str) -> io::Result<Vec<(String, FileAttributes)>> {
        let generation = self.tree().current();
        let node = generation
            .resolve(path)
            .ok_or_else(|| errno(libc::ENOENT))?;
        let directory = node.as_directory().ok_or_else(|| errno(libc::ENOTDIR))?;

        Ok(directory
            .children()
            .iter()
            .map(|(name, child)| {
                (
                    name.clone(),
                    FileAttributes::of(child, generation.created_at()),
                )
            })
            .collect())
    }

    /// Opens the file at `path` for reading and returns a handle.
    ///
    /// The first byte is requested from the remote, so a file that vanished
    /// there fails right away with ENOENT, empty files included. In that case the parent directory
    /// is rescanned in the background. If the remote can't be reached, the
    /// file is opened anyway and reads will report the failure.
    #[instrument(skip(self), err)]
    pub async fn open_file(&self, path: &str, flags: i32) -> io::Result<u64> {
        if flags & libc::O_ACCMODE != libc::O_RDONLY || flags & libc::O_TRUNC != 0 {
            return Err(errno(libc::EROFS));
        }

        let node = self
            .tree()
            .resolve(path)
            .ok_or_else(|| errno(libc::ENOENT))?;
        let Node::File(file) = node.as_ref() else {
            return Err(errno(libc::EISDIR));
        };

        // an empty file is asked for all of its (no) bytes, so the remote
        // still gets to say whether it knows the locator.
        let first_byte = match file.size() {
            0 => ByteRange::from_offset(0),
            _ => ByteRange::new(0, 1),
        };
        match self.fetch().fetch(file.locator(), Some(first_byte)).await {
            Ok(_) => {}
            Err(FetchError::NotFound(_)) => {
                warn!(locator = %file.locator(), "stale locator");
                self.spawn_rescan(parent_path(path));
                return Err(errno(libc::ENOENT));
            }
            Err(FetchError::Unauthorized(_)) => return Err(errno(libc::EACCES)),
            Err(e) => debug!(err = %e, "remote unavailable, opening anyway"),
        }

        // get a new file handle
        let fh = self.next_file_handle.fetch_add(1, Ordering::SeqCst);
        debug!("add file handle {}", fh);
        self.file_handles.write().insert(
            fh,
            Arc::new(Mutex::new(OpenFile {
                path: path.to_string(),
                locator: file.locator().clone(),
                size: file.size(),
            })),
        );
        self.status.file_opened();

        Ok(fh)
    }

    /// Reads up to `size` bytes at `offset`. Fewer bytes are returned only at
    /// the end of the file.
    ///
    /// If the remote no longer knows the file, the parent directory is
    /// rescanned and, if the file reappeared under a new locator, the read is
    /// retried once from there.
    #[instrument(skip(self), err)]
    pub async fn read_file(&self, handle: u64, offset: u64, size: u32) -> io::Result<Bytes> {
        let file = match self.file_handles.read().get(&handle) {
            Some(file) => file.clone(),
            None => {
                warn!("file handle {} unknown", handle);
                return Err(errno(libc::EBADF));
            }
        };
        let (path, locator, file_size) = {
            let file = file.lock();
            (file.path.clone(), file.locator.clone(), file.size)
        };

        let data = match self.read_range(&locator, file_size, offset, size).await {
            Err(FetchError::NotFound(_)) => {
                let parent = parent_path(&path);
                if let Err(e) = self.refresher.rescan_subtree(parent).await {
                    warn!(err = %e, path = %parent, "rescan after stale locator failed");
                }

                let replacement = self
                    .tree()
                    .resolve(&path)
                    .and_then(|n| n.as_file().map(|f| (f.locator().clone(), f.size())))
                    .filter(|(l, _)| *l != locator);
                let Some((locator, file_size)) = replacement else {
                    warn!(path = %path, "file is gone");
                    return Err(errno(libc::EIO));
                };
                {
                    let mut file = file.lock();
                    file.locator = locator.clone();
                    file.size = file_size;
                }
                self.read_range(&locator, file_size, offset, size).await
            }
            other => other,
        }
        .map_err(|e| {
            warn!(err = %e, "read failed");
            match e {
                FetchError::Unauthorized(_) => errno(libc::EACCES),
                _ => errno(libc::EIO),
            }
        })?;

        self.status.bytes_streamed(data.len() as u64);
        Ok(data)
    }

    /// Reads `[offset, offset+size)`, clamped to the file size.
    async fn read_range(
        &self,
        locator: &Locator,
        file_size: u64,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, FetchError> {
        if offset >= file_size || size == 0 {
            return Ok(Bytes::new());
        }
        let end = offset.saturating_add(size as u64).min(file_size);
        self.fetch()
            .fetch(locator, Some(ByteRange::new(offset, end)))
            .await
    }

    /// Drops an open handle.
    pub fn release_file(&self, handle: u64) {
        if self.file_handles.write().remove(&handle).is_none() {
            debug!("file_handle {} not found", handle);
        }
    }

    fn spawn_rescan(&self, path: &str) {
        let refresher = self.refresher.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            if let Err(e) = refresher.rescan_subtree(&path).await {
                warn!(err = %e, path = %path, "rescan failed");
            }
        });
    }
}

#[cfg(feature = "fuse")]
mod fuse_impl {
    use std::ffi::CStr;
    use std::io;
    use std::time::Duration;

    use fuse_backend_rs::abi::fuse_abi::{stat64, CreateIn, SetattrValid};
    use fuse_backend_rs::api::filesystem::{
        Context, DirEntry, Entry, FileSystem, FsOptions, OpenOptions, ZeroCopyReader,
        ZeroCopyWriter,
    };
    use tracing::debug;

    use super::{errno, MediaFs};
    use crate::nodes::join_path;

    /// How long the kernel may cache attributes and entries. Kept short, the
    /// tree changes with every published generation.
    const TIMEOUT: Duration = Duration::from_secs(1);

    impl MediaFs {
        fn path_of(&self, inode: u64) -> io::Result<String> {
            self.inode_tracker
                .read()
                .path(inode)
                .map(str::to_string)
                .ok_or_else(|| errno(libc::ENOENT))
        }

        fn entry(&self, path: &str) -> io::Result<Entry> {
            let attr = self.attributes(path)?;
            let inode = self.inode_tracker.write().put(path);
            Ok(Entry {
                inode,
                attr: attr.to_attr(inode).into(),
                attr_timeout: TIMEOUT,
                entry_timeout: TIMEOUT,
                ..Default::default()
            })
        }
    }

    impl FileSystem for MediaFs {
        type Handle = u64;
        type Inode = u64;

        fn init(&self, _capable: FsOptions) -> io::Result<FsOptions> {
            Ok(FsOptions::empty())
        }

        #[tracing::instrument(skip_all, fields(rq.inode = inode))]
        fn getattr(
            &self,
            _ctx: &Context,
            inode: Self::Inode,
            _handle: Option<Self::Handle>,
        ) -> io::Result<(stat64, Duration)> {
            let path = self.path_of(inode)?;
            let attr = self.attributes(&path)?;
            Ok((attr.to_attr(inode).into(), TIMEOUT))
        }

        #[tracing::instrument(skip_all, fields(rq.parent_inode = parent, rq.name = ?name))]
        fn lookup(&self, _ctx: &Context, parent: Self::Inode, name: &CStr) -> io::Result<Entry> {
            let parent = self.path_of(parent)?;
            let name = name.to_str().map_err(|_| errno(libc::ENOENT))?;
            self.entry(&join_path(&parent, name))
        }

        #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset))]
        fn readdir(
            &self,
            _ctx: &Context,
            inode: Self::Inode,
            _handle: Self::Handle,
            _size: u32,
            offset: u64,
            add_entry: &mut dyn FnMut(DirEntry) -> io::Result<usize>,
        ) -> io::Result<()> {
            let path = self.path_of(inode)?;
            let children = self.list_directory(&path)?;

            for (i, (name, attr)) in children.iter().enumerate().skip(offset as usize) {
                let ino = self.inode_tracker.write().put(&join_path(&path, name));
                // the offset field will become the "offset" parameter on the next call.
                let written = add_entry(DirEntry {
                    ino,
                    offset: i as u64 + 1,
                    type_: attr.entry_type(),
                    name: name.as_bytes(),
                })?;
                // If the buffer is full, add_entry will return `Ok(0)`.
                if written == 0 {
                    break;
                }
            }
            Ok(())
        }

        #[tracing::instrument(skip_all, fields(rq.inode = inode))]
        fn open(
            &self,
            _ctx: &Context,
            inode: Self::Inode,
            flags: u32,
            _fuse_flags: u32,
        ) -> io::Result<(Option<Self::Handle>, OpenOptions)> {
            let path = self.path_of(inode)?;
            let fh = self
                .tokio_handle
                .block_on(self.open_file(&path, flags as i32))?;
            Ok((Some(fh), OpenOptions::empty()))
        }

        #[tracing::instrument(skip_all, fields(rq.inode = inode, fh = handle))]
        fn release(
            &self,
            _ctx: &Context,
            inode: Self::Inode,
            _flags: u32,
            handle: Self::Handle,
            _flush: bool,
            _flock_release: bool,
            _lock_owner: Option<u64>,
        ) -> io::Result<()> {
            self.release_file(handle);
            Ok(())
        }

        #[tracing::instrument(skip_all, fields(rq.inode = inode, rq.offset = offset, rq.size = size))]
        fn read(
            &self,
            _ctx: &Context,
            inode: Self::Inode,
            handle: Self::Handle,
            w: &mut dyn ZeroCopyWriter,
            size: u32,
            offset: u64,
            _lock_owner: Option<u64>,
            _flags: u32,
        ) -> io::Result<usize> {
            debug!("read");
            let buf = self
                .tokio_handle
                .block_on(self.read_file(handle, offset, size))?;
            w.write(&buf)
        }

        fn setattr(
            &self,
            _ctx: &Context,
            _inode: Self::Inode,
            _attr: stat64,
            _handle: Option<Self::Handle>,
            _valid: SetattrValid,
        ) -> io::Result<(stat64, Duration)> {
            Err(errno(libc::EROFS))
        }

        fn mknod(
            &self,
            _ctx: &Context,
            _inode: Self::Inode,
            _name: &CStr,
            _mode: u32,
            _rdev: u32,
            _umask: u32,
        ) -> io::Result<Entry> {
            Err(errno(libc::EROFS))
        }

        fn mkdir(
            &self,
            _ctx: &Context,
            _parent: Self::Inode,
            _name: &CStr,
            _mode: u32,
            _umask: u32,
        ) -> io::Result<Entry> {
            Err(errno(libc::EROFS))
        }

        fn unlink(&self, _ctx: &Context, _parent: Self::Inode, _name: &CStr) -> io::Result<()> {
            Err(errno(libc::EROFS))
        }

        fn rmdir(&self, _ctx: &Context, _parent: Self::Inode, _name: &CStr) -> io::Result<()> {
            Err(errno(libc::EROFS))
        }

        fn symlink(
            &self,
            _ctx: &Context,
            _linkname: &CStr,
            _parent: Self::Inode,
            _name: &CStr,
        ) -> io::Result<Entry> {
            Err(errno(libc::EROFS))
        }

        fn rename(
            &self,
            _ctx: &Context,
            _olddir: Self::Inode,
            _oldname: &CStr,
            _newdir: Self::Inode,
            _newname: &CStr,
            _flags: u32,
        ) -> io::Result<()> {
            Err(errno(libc::EROFS))
        }

        fn link(
            &self,
            _ctx: &Context,
            _inode: Self::Inode,
            _newparent: Self::Inode,
            _newname: &CStr,
        ) -> io::Result<Entry> {
            Err(errno(libc::EROFS))
        }

        fn create(
            &self,
            _ctx: &Context,
            _parent: Self::Inode,
            _name: &CStr,
            _args: CreateIn,
        ) -> io::Result<(Entry, Option<Self::Handle>, OpenOptions)> {
            Err(errno(libc::EROFS))
        }

        fn write(
            &self,
            _ctx: &Context,
            _inode: Self::Inode,
            _handle: Self::Handle,
            _r: &mut dyn ZeroCopyReader,
            _size: u32,
            _offset: u64,
            _lock_owner: Option<u64>,
            _delayed_write: bool,
            _flags: u32,
            _fuse_flags: u32,
        ) -> io::Result<usize> {
            Err(errno(libc::EROFS))
        }

        fn setxattr(
            &self,
            _ctx: &Context,
            _inode: Self::Inode,
            _name: &CStr,
            _value: &[u8],
            _flags: u32,
        ) -> io::Result<()> {
            Err(errno(libc::EROFS))
        }

        fn removexattr(&self, _ctx: &Context, _inode: Self::Inode, _name: &CStr) -> io::Result<()> {
            Err(errno(libc::EROFS))
        }

        fn fallocate(
            &self,
            _ctx: &Context,
            _inode: Self::Inode,
            _handle: Self::Handle,
            _mode: u32,
            _offset: u64,
            _length: u64,
        ) -> io::Result<()> {
            Err(errno(libc::EROFS))
        }
    }
}
