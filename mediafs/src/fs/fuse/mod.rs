use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use fuse_backend_rs::api::server::Server;
use fuse_backend_rs::transport::{FuseChannel, FuseSession};
use parking_lot::Mutex;
use threadpool::ThreadPool;
use tracing::{debug, error, info, info_span, instrument};

use super::MediaFs;
use crate::settings::Settings;

#[cfg(target_os = "macos")]
const BADFD: libc::c_int = libc::EBADF;
#[cfg(target_os = "linux")]
const BADFD: libc::c_int = libc::EBADFD;

/// Where and how to mount.
#[derive(Clone, Debug)]
pub struct MountOptions {
    pub mountpoint: PathBuf,
    /// Number of threads handling kernel requests.
    pub threads: usize,
    /// Let users other than the mounting one access the mount.
    pub allow_other: bool,
}

impl From<&Settings> for MountOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            mountpoint: settings.mount_path.clone(),
            threads: settings.fuse_threads,
            allow_other: settings.allow_other,
        }
    }
}

fn session_error(e: fuse_backend_rs::transport::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// Handles requests from one channel until the session goes away.
fn serve(server: &Server<Arc<MediaFs>>, mut channel: FuseChannel, handled: &AtomicU64) {
    loop {
        let (reader, writer) = match channel.get_request() {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                error!(err = %e, "unable to receive fuse request");
                return;
            }
        };

        match server.handle_message(reader, writer.into(), None, None) {
            Ok(_) => {
                handled.fetch_add(1, Ordering::Relaxed);
            }
            // the session has been shut down.
            Err(fuse_backend_rs::Error::EncodeMessage(e)) if e.raw_os_error() == Some(BADFD) => {
                return
            }
            Err(e) => error!(err = ?e, "failed to handle fuse request"),
        }
    }
}

/// Serves a [MediaFs] on a read-only FUSE mount with a fixed number of
/// threads. Dropping it unmounts.
pub struct FuseDaemon {
    session: Mutex<FuseSession>,
    threads: ThreadPool,
    mounted: AtomicBool,
    handled: Arc<AtomicU64>,
}

impl FuseDaemon {
    #[instrument(skip(fs), fields(mountpoint = ?options.mountpoint), err)]
    pub fn mount(fs: Arc<MediaFs>, options: &MountOptions) -> Result<Self, io::Error> {
        let server = Arc::new(Server::new(fs));

        // mounted read-only, the kernel rejects writes before they reach us.
        let mut session =
            FuseSession::new(&options.mountpoint, "mediafs", "", true).map_err(session_error)?;
        #[cfg(target_os = "linux")]
        session.set_allow_other(options.allow_other);
        session.mount().map_err(session_error)?;

        let num_threads = options.threads.max(1);
        let threads = threadpool::Builder::new()
            .num_threads(num_threads)
            .thread_name("fuse_worker".to_string())
            .build();
        let handled = Arc::new(AtomicU64::new(0));

        for worker in 0..num_threads {
            let channel = session.new_channel().map_err(session_error)?;
            let server = server.clone();
            let handled = handled.clone();
            threads.execute(move || {
                let _span = info_span!("fuse_worker", worker).entered();
                serve(&server, channel, &handled);
                debug!("worker stopped");
            });
        }
        info!(threads = num_threads, "mounted");

        Ok(FuseDaemon {
            session: Mutex::new(session),
            threads,
            mounted: AtomicBool::new(true),
            handled,
        })
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Blocks until all workers have stopped, which happens once the
    /// filesystem is unmounted, by us or externally.
    pub fn wait(&self) {
        self.threads.join()
    }

    /// Unmounts, and waits for all workers to stop. Unmounting twice is a
    /// no-op.
    #[instrument(skip_all, err)]
    pub fn unmount(&self) -> Result<(), io::Error> {
        if !self.mounted.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.session.lock().umount().map_err(session_error)?;
        self.wait();

        info!(requests = self.handled.load(Ordering::Relaxed), "unmounted");
        Ok(())
    }
}

impl Drop for FuseDaemon {
    fn drop(&mut self) {
        if let Err(e) = self.unmount() {
            error!(err = %e, "failed to unmount fuse filesystem")
        }
    }
}
