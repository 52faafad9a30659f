//! Scan passes, and the loop deciding when to run them.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::CacheStore;
use crate::errors::{Error, ScanError};
use crate::nodes::{now_unix, DirectoryNode, Generation};
use crate::scanner::{ScanMode, ScanOutcome, Scanner};
use crate::status::{ScanReport, ScanResult, Status};
use crate::tree::TreeManager;

/// Runs scan passes: scan, persist, publish, report.
pub struct Refresher {
    scanner: Scanner,
    cache: Arc<CacheStore>,
    tree: Arc<TreeManager>,
    status: Arc<Status>,
    /// Held for the duration of a full or incremental pass.
    pass_lock: tokio::sync::Mutex<()>,
    /// Held while persisting and publishing a generation.
    publish_lock: tokio::sync::Mutex<()>,
}

impl Refresher {
    pub fn new(
        scanner: Scanner,
        cache: Arc<CacheStore>,
        tree: Arc<TreeManager>,
        status: Arc<Status>,
    ) -> Self {
        Self {
            scanner,
            cache,
            tree,
            status,
            pass_lock: tokio::sync::Mutex::new(()),
            publish_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn scanner(&self) -> &Scanner {
        &self.scanner
    }

    pub fn tree(&self) -> &Arc<TreeManager> {
        &self.tree
    }

    /// Scans the catalog and publishes the result. On failure the current
    /// generation stays in place.
    #[instrument(skip(self), err)]
    pub async fn run_pass(&self, mode: ScanMode) -> Result<Arc<Generation>, Error> {
        let _pass = self.pass_lock.lock().await;
        let started_at = now_unix();
        let started = Instant::now();
        self.status.scan_started();

        let current = self.tree.current();
        let result = match self.scanner.scan(&current, mode).await {
            Ok(outcome) => self.commit(outcome).await,
            Err(e) => Err(e.into()),
        };

        self.report(mode, started_at, started, &result);
        result.map(|(generation, _)| generation)
    }

    /// Re-walks the directory at `path` only, and publishes the result.
    ///
    /// Doesn't wait for a running pass. If one publishes while the directory
    /// is listed, the result is grafted onto its generation instead.
    #[instrument(skip(self), err)]
    pub async fn rescan_subtree(&self, path: &str) -> Result<Arc<Generation>, Error> {
        let base = self.tree.current();
        let outcome = self.scanner.rescan_subtree(&base, path).await?;

        let _publish = self.publish_lock.lock().await;
        let latest = self.tree.current();
        let root = if latest.sequence() == base.sequence() {
            outcome.root
        } else {
            debug!(
                base.sequence = base.sequence(),
                latest.sequence = latest.sequence(),
                "moving rescanned directory to newer generation"
            );
            Generation::new(0, 0, outcome.root)
                .resolve(path)
                .and_then(|node| latest.graft(path, node))
                .ok_or_else(|| ScanError::NotADirectory(path.to_string()))?
        };
        self.publish(&latest, root).await
    }

    /// Records the new tree durably, then publishes it.
    async fn commit(&self, outcome: ScanOutcome) -> Result<(Arc<Generation>, ScanResult), Error> {
        let result = ScanResult::from_outcome(&outcome);
        let _publish = self.publish_lock.lock().await;
        let latest = self.tree.current();
        let generation = self.publish(&latest, outcome.root).await?;
        Ok((generation, result))
    }

    /// Persists and publishes `root` as the successor of `latest`. Callers
    /// hold `publish_lock`.
    async fn publish(
        &self,
        latest: &Generation,
        root: DirectoryNode,
    ) -> Result<Arc<Generation>, Error> {
        let generation = Generation::new(latest.sequence() + 1, now_unix(), root);
        let sequence = self.cache.persist(&generation).await?;
        self.tree.publish(generation.with_sequence(sequence))
    }

    fn report(
        &self,
        mode: ScanMode,
        started_at: u64,
        started: Instant,
        result: &Result<(Arc<Generation>, ScanResult), Error>,
    ) {
        let (result, sequence) = match result {
            Ok((generation, result)) => (result.clone(), Some(generation.sequence())),
            Err(Error::Scan(ScanError::Unauthorized(reason))) => (
                ScanResult::Unauthorized {
                    reason: reason.clone(),
                },
                None,
            ),
            Err(e) => (
                ScanResult::Aborted {
                    reason: e.to_string(),
                },
                None,
            ),
        };

        self.status.scan_finished(ScanReport {
            mode,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            result,
            sequence,
        });
    }
}

/// Accepts rescan requests and runs them one at a time.
///
/// Requests arriving while a pass is running collapse into a single pending
/// pass. A pending Full pass absorbs Incremental requests.
pub struct RescanController {
    refresher: Arc<Refresher>,
    pending: Mutex<Option<ScanMode>>,
    wake: Notify,
    passes: watch::Sender<u64>,
    pass_count: AtomicU64,
}

impl RescanController {
    pub fn new(refresher: Arc<Refresher>) -> Self {
        let (passes, _) = watch::channel(0);
        Self {
            refresher,
            pending: Mutex::new(None),
            wake: Notify::new(),
            passes,
            pass_count: AtomicU64::new(0),
        }
    }

    pub fn refresher(&self) -> &Arc<Refresher> {
        &self.refresher
    }

    pub fn request_rescan(&self, mode: ScanMode) {
        {
            let mut pending = self.pending.lock();
            *pending = Some(match (*pending, mode) {
                (Some(ScanMode::Full), _) | (_, ScanMode::Full) => ScanMode::Full,
                _ => ScanMode::Incremental,
            });
        }
        self.wake.notify_one();
    }

    fn take_pending(&self) -> Option<ScanMode> {
        self.pending.lock().take()
    }

    /// Counts finished passes, successful or not.
    pub fn completed_passes(&self) -> watch::Receiver<u64> {
        self.passes.subscribe()
    }

    /// Runs requested passes until `cancel` fires. With a `refresh_interval`,
    /// an Incremental pass is requested on every tick. A running pass is
    /// always finished before returning.
    pub async fn run(&self, refresh_interval: Option<Duration>, cancel: CancellationToken) {
        let mut interval = refresh_interval.filter(|p| !p.is_zero()).map(|period| {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            if let Some(mode) = self.take_pending() {
                match self.refresher.run_pass(mode).await {
                    Ok(generation) => info!(
                        mode = %mode,
                        generation.sequence = generation.sequence(),
                        "pass finished"
                    ),
                    Err(e) => warn!(err = %e, mode = %mode, "pass failed"),
                }
                let count = self.pass_count.fetch_add(1, Ordering::SeqCst) + 1;
                self.passes.send_replace(count);
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tick(&mut interval) => self.request_rescan(ScanMode::Incremental),
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
