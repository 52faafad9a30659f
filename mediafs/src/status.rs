//! A read-only view on the state of an instance, for dashboards and the CLI.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;

use crate::fetch::ConnectionSnapshot;
use crate::scanner::{ScanMode, ScanOutcome};

/// How a scan pass ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanResult {
    Complete,
    /// Some subtrees were kept from the previous generation.
    Partial { failed_paths: Vec<String> },
    /// Nothing was published.
    Aborted { reason: String },
    /// The remote rejected the credentials. Needs operator attention.
    Unauthorized { reason: String },
}

impl ScanResult {
    pub fn from_outcome(outcome: &ScanOutcome) -> Self {
        if outcome.is_partial() {
            ScanResult::Partial {
                failed_paths: outcome.stats.failed_paths.clone(),
            }
        } else {
            ScanResult::Complete
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub mode: ScanMode,
    /// Seconds since the unix epoch.
    pub started_at: u64,
    pub duration_ms: u64,
    pub result: ScanResult,
    /// Sequence of the published generation, if any.
    pub sequence: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// No generation has been published yet.
    Starting,
    Serving,
    Scanning,
    /// Serving, but the remote rejected the credentials.
    Unauthorized,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Metrics {
    pub files_opened: u64,
    pub bytes_streamed: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub uptime_secs: u64,
    pub state: InstanceState,
    pub generation_sequence: u64,
    pub node_count: u64,
    pub connection: ConnectionSnapshot,
    pub last_scan: Option<ScanReport>,
    pub cache_backend: String,
    pub metrics: Metrics,
}

/// Counters and last-known facts, updated by the control loop and the
/// filesystem. Reads are snapshots, nothing blocks on them for long.
pub struct Status {
    started: Instant,
    cache_backend: String,
    scanning: RwLock<bool>,
    last_scan: RwLock<Option<ScanReport>>,
    files_opened: AtomicU64,
    bytes_streamed: AtomicU64,
}

impl Status {
    pub fn new(cache_backend: String) -> Self {
        Self {
            started: Instant::now(),
            cache_backend,
            scanning: RwLock::new(false),
            last_scan: RwLock::new(None),
            files_opened: AtomicU64::new(0),
            bytes_streamed: AtomicU64::new(0),
        }
    }

    pub fn scan_started(&self) {
        *self.scanning.write() = true;
    }

    pub fn scan_finished(&self, report: ScanReport) {
        *self.last_scan.write() = Some(report);
        *self.scanning.write() = false;
    }

    pub fn last_scan(&self) -> Option<ScanReport> {
        self.last_scan.read().clone()
    }

    pub fn file_opened(&self) {
        self.files_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_streamed(&self, n: u64) {
        self.bytes_streamed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> Metrics {
        Metrics {
            files_opened: self.files_opened.load(Ordering::Relaxed),
            bytes_streamed: self.bytes_streamed.load(Ordering::Relaxed),
        }
    }

    /// Assembles a snapshot from the given live facts plus what is tracked
    /// here.
    pub fn snapshot(
        &self,
        generation_sequence: u64,
        node_count: u64,
        connection: ConnectionSnapshot,
    ) -> StatusSnapshot {
        let last_scan = self.last_scan();
        let state = if connection.unauthorized {
            InstanceState::Unauthorized
        } else if *self.scanning.read() {
            InstanceState::Scanning
        } else if generation_sequence == 0 {
            InstanceState::Starting
        } else {
            InstanceState::Serving
        };

        StatusSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            state,
            generation_sequence,
            node_count,
            connection,
            last_scan,
            cache_backend: self.cache_backend.clone(),
            metrics: self.metrics(),
        }
    }
}
