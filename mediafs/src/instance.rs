//! Wires the components of one mount together.
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::cache::{CacheStore, RecordBackend};
use crate::control::{RescanController, Refresher};
use crate::errors::{Error, ScanError};
use crate::fetch::{FetchClient, Transport};
use crate::fs::MediaFs;
use crate::nodes::{now_unix, Generation};
use crate::scanner::{ScanMode, Scanner};
use crate::settings::Settings;
use crate::status::{ScanResult, Status, StatusSnapshot};
use crate::tree::TreeManager;

/// A running instance: the published tree, the control loop keeping it
/// fresh, and the filesystem serving it.
pub struct Instance {
    tree: Arc<TreeManager>,
    fetch: Arc<FetchClient>,
    status: Arc<Status>,
    controller: Arc<RescanController>,
    fs: Arc<MediaFs>,
    cancel: CancellationToken,
    control_loop: JoinHandle<()>,
}

/// Whether a recovered generation is older than `ttl`.
fn is_stale(generation: &Generation, ttl: Duration) -> bool {
    now_unix().saturating_sub(generation.created_at()) > ttl.as_secs()
}

impl Instance {
    /// Recovers the latest generation from the cache and starts the control
    /// loop.
    ///
    /// Without anything recovered, a Full scan is requested and the
    /// filesystem serves an empty tree until it is published. A recovered
    /// generation is served right away; it is rescanned incrementally if it
    /// is older than the cache TTL, or if configured to scan on start.
    #[instrument(skip_all, fields(instance = %settings.instance_name), err)]
    pub async fn start(
        settings: Settings,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn RecordBackend>,
    ) -> Result<Self, Error> {
        settings.validate()?;

        let cache = Arc::new(CacheStore::new(backend, settings.keep_records));
        let status = Arc::new(Status::new(cache.backend_name()));

        let recovered = cache.load_latest().await.unwrap_or_else(|e| {
            warn!(err = %e, "unable to load cached generation, starting empty");
            None
        });

        let initial_scan = match &recovered {
            None => Some(ScanMode::Full),
            Some(generation) if is_stale(generation, settings.cache_ttl) => {
                info!(
                    generation.sequence = generation.sequence(),
                    generation.created_at = generation.created_at(),
                    "recovered generation is stale"
                );
                Some(ScanMode::Incremental)
            }
            Some(_) if settings.scan_on_start => Some(ScanMode::Incremental),
            Some(_) => None,
        };
        if let Some(generation) = &recovered {
            info!(
                generation.sequence = generation.sequence(),
                generation.nodes = generation.node_count(),
                "recovered generation"
            );
        }

        let tree = Arc::new(TreeManager::new(
            recovered.unwrap_or_else(Generation::empty),
        ));
        let fetch = Arc::new(FetchClient::new(transport, settings.fetch_config()));
        let refresher = Arc::new(Refresher::new(
            Scanner::new(fetch.clone(), settings.scan_config()),
            cache,
            tree.clone(),
            status.clone(),
        ));
        let controller = Arc::new(RescanController::new(refresher.clone()));
        let fs = Arc::new(MediaFs::new(refresher, status.clone()));

        if let Some(mode) = initial_scan {
            controller.request_rescan(mode);
        }

        let cancel = CancellationToken::new();
        let control_loop = tokio::spawn({
            let controller = controller.clone();
            let cancel = cancel.clone();
            let refresh_interval = settings.refresh_interval();
            async move { controller.run(refresh_interval, cancel).await }
        });

        Ok(Self {
            tree,
            fetch,
            status,
            controller,
            fs,
            cancel,
            control_loop,
        })
    }

    /// Returns once a generation is being served. Fails if the first pass
    /// couldn't publish anything.
    pub async fn wait_until_ready(&self) -> Result<(), Error> {
        if self.tree.current().sequence() > 0 {
            return Ok(());
        }

        let mut passes = self.controller.completed_passes();
        // the sender lives in the controller, which we hold.
        let _ = passes.wait_for(|n| *n > 0).await;

        if self.tree.current().sequence() > 0 {
            return Ok(());
        }
        Err(match self.status.last_scan().map(|s| s.result) {
            Some(ScanResult::Unauthorized { reason }) => ScanError::Unauthorized(reason),
            Some(ScanResult::Aborted { reason }) => ScanError::Aborted(reason),
            _ => ScanError::Aborted("no generation published".into()),
        }
        .into())
    }

    pub fn tree(&self) -> &Arc<TreeManager> {
        &self.tree
    }

    pub fn filesystem(&self) -> Arc<MediaFs> {
        self.fs.clone()
    }

    /// Asks for a pass. This also retries credentials the remote rejected
    /// before, periodic passes don't.
    pub fn request_rescan(&self, mode: ScanMode) {
        info!(mode = %mode, "rescan requested");
        self.fetch.clear_unauthorized();
        self.controller.request_rescan(mode);
    }

    pub fn status(&self) -> StatusSnapshot {
        let generation = self.tree.current();
        self.status.snapshot(
            generation.sequence(),
            generation.node_count(),
            self.fetch.connection(),
        )
    }

    /// Stops the control loop, after a running pass has finished.
    #[instrument(skip_all)]
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.control_loop.await {
            warn!(err = %e, "control loop failed");
        }
        info!("instance stopped");
    }
}
