//! Turns the remote catalog into a tree of [Node]s.
//!
//! The sections listed at the catalog root are enqueued as [ScanTask]s on a
//! bounded [WorkerPool]. Workers list each directory through the
//! [FetchClient] and spawn follow-up tasks for child directories. Once the
//! queue is drained, the tree is assembled from the collected listings,
//! ordered by name, so the result doesn't depend on the order in which
//! listings arrived.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn, Span};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::errors::{FetchError, ScanError};
use crate::fetch::{ChildDescriptor, FetchClient};
use crate::nodes::{
    disambiguate_name, join_path, sanitize_name, DirectoryNode, FileNode, Generation, Locator,
    Node, NodeKind,
};

mod queue;

pub use self::queue::{Spawner, WorkerPool};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Re-walk every section.
    Full,
    /// Only re-walk sections whose change marker differs from the published
    /// generation, reuse the others.
    Incremental,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Full => f.write_str("full"),
            ScanMode::Incremental => f.write_str("incremental"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ScanConfig {
    /// Number of workers listing directories concurrently.
    pub workers: usize,
    /// Number of tasks the queue holds before the producer waits.
    pub queue_capacity: usize,
    /// How often a failed listing is retried before its subtree counts as
    /// failed.
    pub task_retries: u32,
    /// Pause between retries of a listing. The fetch client backs off on its
    /// own on top of that while the connection is degraded.
    pub retry_delay: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            workers: 25,
            queue_capacity: 100,
            task_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    InFlight,
    Done,
    Failed(String),
}

/// One directory to list.
#[derive(Clone, Debug)]
pub struct ScanTask {
    /// Path of the directory whose children this task populates.
    pub path: String,
    pub locator: Locator,
    pub attempts: u32,
    pub status: TaskStatus,
}

impl ScanTask {
    pub fn new(path: String, locator: Locator) -> Self {
        Self {
            path,
            locator,
            attempts: 0,
            status: TaskStatus::Pending,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub tasks_done: u64,
    pub tasks_failed: u64,
    /// Subtrees taken over unchanged from the previous generation.
    pub reused_subtrees: u64,
    /// Directories whose listing failed, sorted. Their previous contents
    /// were kept.
    pub failed_paths: Vec<String>,
}

/// A freshly built tree, plus what it took to build it.
#[derive(Debug)]
pub struct ScanOutcome {
    pub root: DirectoryNode,
    pub stats: ScanStats,
}

impl ScanOutcome {
    /// Whether some subtrees couldn't be listed and were merged in from the
    /// previous generation.
    pub fn is_partial(&self) -> bool {
        !self.stats.failed_paths.is_empty()
    }
}

/// A directory listing, or why it couldn't be obtained.
type Listing = Result<Vec<ChildDescriptor>, String>;

/// State shared by all workers of one pass.
struct ScanState {
    fetch: Arc<FetchClient>,
    config: ScanConfig,
    listings: Mutex<HashMap<String, Listing>>,
    /// Set once the remote rejected the credentials, stops the pass.
    unauthorized: Mutex<Option<String>>,
    discovered: AtomicU64,
    span: Span,
}

impl ScanState {
    fn discover(&self) {
        let total = self.discovered.fetch_add(1, Ordering::Relaxed) + 1;
        self.span.pb_set_length(total);
    }
}

pub struct Scanner {
    fetch: Arc<FetchClient>,
    config: ScanConfig,
}

impl Scanner {
    pub fn new(fetch: Arc<FetchClient>, config: ScanConfig) -> Self {
        Self { fetch, config }
    }

    pub fn fetch(&self) -> &Arc<FetchClient> {
        &self.fetch
    }

    /// Builds a new tree from the remote catalog.
    ///
    /// Subtrees that can't be listed are taken from `previous`. If the
    /// sections can't be listed at all, or there are none, the pass is
    /// aborted and nothing changes.
    #[instrument(skip_all, fields(mode = %mode, previous.sequence = previous.sequence(), indicatif.pb_show = 1), err)]
    pub async fn scan(
        &self,
        previous: &Generation,
        mode: ScanMode,
    ) -> Result<ScanOutcome, ScanError> {
        let span = Span::current();
        span.pb_set_style(&mediafs_tracing::PB_SCAN_STYLE);
        span.pb_set_message(&format!("{} scan", mode));

        let root_locator = self.fetch.root();
        let mut attempts = 0;
        let sections = match list_with_retries(
            &self.fetch,
            &root_locator,
            &self.config,
            &mut attempts,
        )
        .await
        {
            Ok(sections) => sections,
            Err(FetchError::Unauthorized(reason)) => return Err(ScanError::Unauthorized(reason)),
            Err(e) => {
                return Err(ScanError::Aborted(format!(
                    "unable to list sections: {}",
                    e
                )))
            }
        };
        if sections.is_empty() {
            return Err(ScanError::Aborted("remote lists no sections".into()));
        }

        let previous_root = previous.root_directory();
        let mut reused = HashSet::new();
        let mut tasks = Vec::new();
        for (name, section) in named_children(&sections) {
            if section.kind != NodeKind::Directory {
                continue;
            }
            let path = join_path("/", &name);
            if mode == ScanMode::Incremental && is_unchanged(previous_root.get(&name), section) {
                debug!(path = %path, "section unchanged, reusing");
                reused.insert(path);
                continue;
            }
            tasks.push(ScanTask::new(path, section.locator.clone()));
        }

        let listings = self.walk(tasks, span).await?;

        let mut stats = stats_from(&listings);
        stats.reused_subtrees = reused.len() as u64;

        let (children, _) =
            assemble_children("/", &sections, Some(previous_root), &listings, &reused);
        let root = DirectoryNode::new("", "", root_locator, None, children);

        info!(
            tasks_done = stats.tasks_done,
            tasks_failed = stats.tasks_failed,
            reused = stats.reused_subtrees,
            "scan complete"
        );
        Ok(ScanOutcome { root, stats })
    }

    /// Re-walks the directory at `path` and returns a new root with the
    /// result grafted in. All other subtrees are shared with `generation`.
    #[instrument(skip_all, fields(path = %path, generation.sequence = generation.sequence()), err)]
    pub async fn rescan_subtree(
        &self,
        generation: &Generation,
        path: &str,
    ) -> Result<ScanOutcome, ScanError> {
        let node = generation
            .resolve(path)
            .ok_or_else(|| ScanError::NotADirectory(path.to_string()))?;
        let directory = node
            .as_directory()
            .ok_or_else(|| ScanError::NotADirectory(path.to_string()))?;

        if crate::nodes::path_segments(path).is_empty() {
            return self.scan(generation, ScanMode::Full).await;
        }

        let path = join_segments(path);
        let listings = self
            .walk(
                vec![ScanTask::new(path.clone(), directory.locator().clone())],
                Span::current(),
            )
            .await?;

        let children = match listings.get(&path) {
            Some(Ok(children)) => children,
            Some(Err(reason)) => return Err(ScanError::Aborted(reason.clone())),
            None => return Err(ScanError::Aborted(format!("{} was not listed", path))),
        };

        let stats = stats_from(&listings);
        let (children, degraded) =
            assemble_children(&path, children, Some(directory), &listings, &HashSet::new());
        let rescanned = DirectoryNode::new(
            directory.id(),
            directory.name(),
            directory.locator().clone(),
            if degraded {
                None
            } else {
                directory.change_marker()
            },
            children,
        );

        let root = generation
            .graft(&path, Arc::new(Node::Directory(rescanned)))
            .ok_or_else(|| ScanError::NotADirectory(path.clone()))?;
        Ok(ScanOutcome { root, stats })
    }

    /// Runs the given tasks and everything they spawn to completion, and
    /// returns all collected listings keyed by path.
    async fn walk(
        &self,
        tasks: Vec<ScanTask>,
        span: Span,
    ) -> Result<HashMap<String, Listing>, ScanError> {
        let state = Arc::new(ScanState {
            fetch: self.fetch.clone(),
            config: self.config.clone(),
            listings: Mutex::new(HashMap::new()),
            unauthorized: Mutex::new(None),
            discovered: AtomicU64::new(0),
            span,
        });

        let pool = WorkerPool::start(self.config.workers, self.config.queue_capacity, {
            let state = state.clone();
            move |task, spawner| handle_task(state.clone(), task, spawner)
        });

        for task in tasks {
            state.discover();
            pool.submit(task).await;
        }
        let peak = pool.finish().await;
        debug!(peak_tasks = peak, "walk finished");

        if let Some(reason) = state.unauthorized.lock().take() {
            return Err(ScanError::Unauthorized(reason));
        }
        let listings = std::mem::take(&mut *state.listings.lock());
        Ok(listings)
    }
}

/// Lists one directory, retrying transient failures.
async fn list_with_retries(
    fetch: &FetchClient,
    locator: &Locator,
    config: &ScanConfig,
    attempts: &mut u32,
) -> Result<Vec<ChildDescriptor>, FetchError> {
    loop {
        *attempts += 1;
        match fetch.list_children(locator).await {
            Ok(children) => return Ok(children),
            Err(e) if e.is_retryable() && *attempts <= config.task_retries => {
                debug!(err = %e, attempts = *attempts, locator = %locator, "retrying listing");
                tokio::time::sleep(config.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn handle_task(state: Arc<ScanState>, mut task: ScanTask, spawner: Spawner<ScanTask>) {
    let stopped = state.unauthorized.lock().clone();
    if let Some(reason) = stopped {
        task.status = TaskStatus::Failed(reason);
    } else {
        task.status = TaskStatus::InFlight;
        match list_with_retries(&state.fetch, &task.locator, &state.config, &mut task.attempts)
            .await
        {
            Ok(children) => {
                for (name, child) in named_children(&children) {
                    if child.kind == NodeKind::Directory {
                        state.discover();
                        spawner
                            .spawn(ScanTask::new(
                                join_path(&task.path, &name),
                                child.locator.clone(),
                            ))
                            .await;
                    }
                }
                state.listings.lock().insert(task.path.clone(), Ok(children));
                task.status = TaskStatus::Done;
            }
            Err(e) => {
                if let FetchError::Unauthorized(reason) = &e {
                    state
                        .unauthorized
                        .lock()
                        .get_or_insert_with(|| reason.clone());
                }
                warn!(err = %e, path = %task.path, attempts = task.attempts, "listing failed");
                task.status = TaskStatus::Failed(e.to_string());
            }
        }
    }

    if let TaskStatus::Failed(reason) = &task.status {
        state
            .listings
            .lock()
            .insert(task.path.clone(), Err(reason.clone()));
    }
    state.span.pb_inc(1);
}

/// Whether a section can be taken over from the previous generation: same
/// entity, and the remote reports the same change marker.
fn is_unchanged(previous: Option<&Arc<Node>>, section: &ChildDescriptor) -> bool {
    let Some(Node::Directory(previous)) = previous.map(|p| p.as_ref()) else {
        return false;
    };
    previous.id() == section.id
        && section.change_marker.is_some()
        && previous.change_marker() == section.change_marker
}

/// Assigns every child a name unique among its siblings, sorted by name.
/// The outcome only depends on the set of children, not their order.
fn named_children(children: &[ChildDescriptor]) -> Vec<(String, &ChildDescriptor)> {
    let mut named: Vec<(String, &ChildDescriptor)> = children
        .iter()
        .map(|c| (sanitize_name(&c.name), c))
        .collect();
    named.sort_by(|(a, x), (b, y)| a.cmp(b).then_with(|| x.id.cmp(&y.id)));

    let mut counts: HashMap<String, usize> = HashMap::new();
    for (name, _) in &named {
        *counts.entry(name.clone()).or_default() += 1;
    }

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(named.len());
    for (name, child) in named {
        let name = if counts.get(&name).copied().unwrap_or_default() > 1 {
            sanitize_name(&disambiguate_name(
                &name,
                &child.id,
                child.kind == NodeKind::File,
            ))
        } else {
            name
        };
        if !seen.insert(name.clone()) {
            warn!(name = %name, id = %child.id, "duplicate entry, skipping");
            continue;
        }
        out.push((name, child));
    }
    out.sort_by(|(a, _), (b, _)| a.cmp(b));
    out
}

/// Builds the children of the directory at `path`. Also returns whether
/// any directory below couldn't be listed and was taken from `previous`.
fn assemble_children(
    path: &str,
    children: &[ChildDescriptor],
    previous: Option<&DirectoryNode>,
    listings: &HashMap<String, Listing>,
    reused: &HashSet<String>,
) -> (BTreeMap<String, Arc<Node>>, bool) {
    let mut degraded = false;
    let nodes = named_children(children)
        .into_iter()
        .map(|(name, child)| {
            let child_path = join_path(path, &name);
            let previous = previous.and_then(|p| p.get(&name));
            let node = match child.kind {
                NodeKind::File => Arc::new(Node::File(FileNode::new(
                    child.id.clone(),
                    name.clone(),
                    child.locator.clone(),
                    child.size,
                    child.modified,
                ))),
                NodeKind::Directory => {
                    let (node, child_degraded) =
                        assemble_directory(&child_path, &name, child, previous, listings, reused);
                    degraded |= child_degraded;
                    node
                }
            };
            (name, node)
        })
        .collect();
    (nodes, degraded)
}

fn assemble_directory(
    path: &str,
    name: &str,
    descriptor: &ChildDescriptor,
    previous: Option<&Arc<Node>>,
    listings: &HashMap<String, Listing>,
    reused: &HashSet<String>,
) -> (Arc<Node>, bool) {
    let previous = previous.filter(|p| p.kind() == NodeKind::Directory);

    if reused.contains(path) {
        if let Some(previous) = previous {
            return (previous.clone(), false);
        }
    }

    match listings.get(path) {
        Some(Ok(children)) => {
            let (children, degraded) = assemble_children(
                path,
                children,
                previous.and_then(|p| p.as_directory()),
                listings,
                reused,
            );
            // A marker is only recorded for a completely listed subtree,
            // otherwise the next incremental pass would skip the failed part.
            let change_marker = if degraded {
                None
            } else {
                descriptor.change_marker
            };
            let node = DirectoryNode::new(
                descriptor.id.clone(),
                name,
                descriptor.locator.clone(),
                change_marker,
                children,
            );
            (Arc::new(Node::Directory(node)), degraded)
        }
        // Keep what we had, including its old change marker.
        _ => match previous {
            Some(previous) => (previous.clone(), true),
            None => (
                Arc::new(Node::Directory(DirectoryNode::new(
                    descriptor.id.clone(),
                    name,
                    descriptor.locator.clone(),
                    None,
                    BTreeMap::new(),
                ))),
                true,
            ),
        },
    }
}

fn stats_from(listings: &HashMap<String, Listing>) -> ScanStats {
    let mut failed_paths: Vec<String> = listings
        .iter()
        .filter(|(_, l)| l.is_err())
        .map(|(p, _)| p.clone())
        .collect();
    failed_paths.sort();

    ScanStats {
        tasks_done: (listings.len() - failed_paths.len()) as u64,
        tasks_failed: failed_paths.len() as u64,
        reused_subtrees: 0,
        failed_paths,
    }
}

/// Normalizes a path to `/a/b` form.
fn join_segments(path: &str) -> String {
    crate::nodes::path_segments(path)
        .into_iter()
        .fold(String::new(), |acc, segment| join_path(&acc, segment))
}

#[cfg(test)]
mod tests;
