//! Concurrent download of a decomposed bounding box.
//!
//! [`FetchOrchestrator::run`] hands sub-tile requests to a bounded set of
//! worker threads. Each worker leases the connection for its request's
//! connection group from a [`ResourcePool`] and streams the tile with a
//! [`StreamFetcher`].
//!
//! A failing tile never stops its siblings: every request reaches a terminal
//! outcome before the run finishes, and tiles already on disk stay there.
//! Failures are reported together, once, in a [`FetchReport`].

use crate::bbox::{BoundingBox, Resolution};
use crate::connection::{Connection, RequestDescriptor};
use crate::error::{FailureKind, FetchFailure};
use crate::fetcher::StreamFetcher;
use crate::pool::{PooledResource, ResourcePool};
use crate::{DemError, Result};
use crossbeam_channel::{Receiver, Sender};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Granularity of cancellable sleeps.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Shared flag used to abort a run, with an optional deadline.
///
/// Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancellationToken {
    /// A token that is cancelled only by calling [`cancel`](Self::cancel).
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that also cancels itself once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested or the deadline has passed.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
            || self.deadline.map_or(false, |d| Instant::now() >= d)
    }

    /// Sleep for `duration` unless cancelled first. Returns `true` if cancelled.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let end = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= end {
                return false;
            }
            thread::sleep((end - now).min(CANCEL_POLL_INTERVAL));
        }
    }
}

/// One sub-box to fetch, with where to put it.
#[derive(Debug, Clone, PartialEq)]
pub struct SubTileRequest {
    bbox: BoundingBox,
    resolution: Resolution,
    sequence_index: usize,
    target_path: PathBuf,
    descriptor: RequestDescriptor,
}

impl SubTileRequest {
    /// Create a request.
    pub fn new(
        bbox: BoundingBox,
        resolution: Resolution,
        sequence_index: usize,
        target_path: impl Into<PathBuf>,
        descriptor: RequestDescriptor,
    ) -> Self {
        Self {
            bbox,
            resolution,
            sequence_index,
            target_path: target_path.into(),
            descriptor,
        }
    }

    /// Area covered by this tile.
    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    /// Output resolution.
    pub fn resolution(&self) -> &Resolution {
        &self.resolution
    }

    /// Position of this tile in the decomposition (row-major).
    pub fn sequence_index(&self) -> usize {
        self.sequence_index
    }

    /// Where the tile is written.
    pub fn target_path(&self) -> &Path {
        &self.target_path
    }

    /// The request executed to fetch the tile.
    pub fn descriptor(&self) -> &RequestDescriptor {
        &self.descriptor
    }
}

/// Terminal result of fetching one tile.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The complete tile is at this path.
    Success(PathBuf),
    /// The tile could not be fetched.
    Failure(FetchFailure),
}

impl FetchOutcome {
    /// Whether the tile was fetched.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// A tile that failed, with enough detail to retry or report it.
#[derive(Debug, Clone, PartialEq)]
pub struct TileFailure {
    /// Sequence index of the tile.
    pub index: usize,
    /// Area of the tile.
    pub bbox: BoundingBox,
    /// Path the tile would have been written to.
    pub target_path: PathBuf,
    /// Why it failed.
    pub failure: FetchFailure,
}

/// Outcome of a run: succeeded tiles in sequence order plus every failure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchReport {
    succeeded: Vec<(usize, PathBuf)>,
    failures: Vec<TileFailure>,
    total: usize,
}

impl FetchReport {
    /// Number of tiles in the run.
    pub fn total(&self) -> usize {
        self.total
    }

    /// `(sequence_index, path)` of every fetched tile, by sequence index.
    pub fn succeeded(&self) -> &[(usize, PathBuf)] {
        &self.succeeded
    }

    /// Paths of every fetched tile, by sequence index.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.succeeded.iter().map(|(_, p)| p.clone()).collect()
    }

    /// Every failed tile, by sequence index.
    pub fn failures(&self) -> &[TileFailure] {
        &self.failures
    }

    /// Whether every tile was fetched.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty() && self.succeeded.len() == self.total
    }

    /// One line per failed tile.
    pub fn describe_failures(&self) -> String {
        describe_tile_failures(&self.failures)
    }

    fn was_cancelled(&self) -> bool {
        self.failures
            .iter()
            .any(|f| f.failure.kind == FailureKind::Cancelled)
    }
}

pub(crate) fn describe_tile_failures(failures: &[TileFailure]) -> String {
    let mut out = String::new();
    for f in failures {
        let _ = writeln!(
            out,
            "  tile {} {} -> {}: {}",
            f.index,
            f.bbox,
            f.target_path.display(),
            f.failure
        );
    }
    out
}

/// Runs sub-tile requests on a bounded pool of worker threads.
pub struct FetchOrchestrator<'a, C: PooledResource> {
    sessions: &'a ResourcePool<String, C>,
    fetcher: StreamFetcher,
}

impl<'a, C> FetchOrchestrator<'a, C>
where
    C: Connection + PooledResource + 'static,
{
    /// Create an orchestrator drawing connections from `sessions`.
    pub fn new(sessions: &'a ResourcePool<String, C>, fetcher: StreamFetcher) -> Self {
        Self { sessions, fetcher }
    }

    /// The fetcher used for each tile.
    pub fn fetcher(&self) -> &StreamFetcher {
        &self.fetcher
    }

    /// Fetch every request with at most `concurrency_limit` tiles in flight.
    ///
    /// # Errors
    ///
    /// - [`DemError::Orchestration`] if the run cannot start: the pool is
    ///   closed or two requests share a target path. Nothing is fetched.
    /// - [`DemError::Cancelled`] if `cancel` fired before every tile settled.
    /// - [`DemError::PartialFailure`] / [`DemError::TotalFailure`] if some or
    ///   all tiles failed. Completed tiles are left on disk either way.
    pub fn run(
        &self,
        requests: Vec<SubTileRequest>,
        concurrency_limit: usize,
        cancel: &CancellationToken,
    ) -> Result<FetchReport> {
        if self.sessions.is_closed() {
            return Err(DemError::Orchestration(format!(
                "resource pool '{}' is closed",
                self.sessions.name()
            )));
        }
        let mut targets = HashSet::new();
        for request in &requests {
            if !targets.insert(request.target_path()) {
                return Err(DemError::Orchestration(format!(
                    "more than one tile targets {}",
                    request.target_path().display()
                )));
            }
        }

        let total = requests.len();
        if total == 0 {
            return Ok(FetchReport::default());
        }
        let workers = concurrency_limit.clamp(1, total);
        info!(tiles = total, workers, "starting tile downloads");

        let (job_tx, job_rx) = crossbeam_channel::unbounded();
        for job in requests.iter().enumerate() {
            // The receiver is alive, so sending cannot fail.
            let _ = job_tx.send(job);
        }
        drop(job_tx);

        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        thread::scope(|s| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let jobs = job_rx.clone();
                    let results = result_tx.clone();
                    s.spawn(move || self.work(worker, jobs, results, cancel))
                })
                .collect();
            drop(result_tx);
            for (worker, handle) in handles.into_iter().enumerate() {
                if handle.join().is_err() {
                    warn!(worker, "fetch worker panicked");
                }
            }
        });

        let mut outcomes: Vec<Option<FetchOutcome>> = vec![None; total];
        for (position, outcome) in result_rx.try_iter() {
            outcomes[position] = Some(outcome);
        }

        let report = build_report(&requests, outcomes);
        info!(
            tiles = total,
            succeeded = report.succeeded().len(),
            failed = report.failures().len(),
            "tile downloads finished"
        );

        if report.was_cancelled() {
            let failed: Vec<TileFailure> = report
                .failures()
                .iter()
                .filter(|f| f.failure.kind != FailureKind::Cancelled)
                .cloned()
                .collect();
            return Err(DemError::Cancelled {
                completed: report.paths(),
                unfinished: total - report.succeeded().len() - failed.len(),
                failed,
            });
        }
        if report.failures().is_empty() {
            Ok(report)
        } else if report.succeeded().is_empty() {
            Err(DemError::TotalFailure(report))
        } else {
            Err(DemError::PartialFailure(report))
        }
    }

    fn work(
        &self,
        worker: usize,
        jobs: Receiver<(usize, &SubTileRequest)>,
        results: Sender<(usize, FetchOutcome)>,
        cancel: &CancellationToken,
    ) {
        for (position, request) in jobs.iter() {
            let outcome = if cancel.is_cancelled() {
                FetchOutcome::Failure(FetchFailure::cancelled())
            } else {
                match self
                    .sessions
                    .get_or_create(&request.descriptor().connection_key())
                {
                    Ok(session) => self.fetcher.fetch(request, &*session, cancel),
                    Err(e) => FetchOutcome::Failure(FetchFailure::permanent(
                        FailureKind::Resource,
                        e.to_string(),
                    )),
                }
            };
            debug!(
                worker,
                index = request.sequence_index(),
                success = outcome.is_success(),
                "tile settled"
            );
            if results.send((position, outcome)).is_err() {
                break;
            }
        }
    }
}

fn build_report(requests: &[SubTileRequest], outcomes: Vec<Option<FetchOutcome>>) -> FetchReport {
    let mut report = FetchReport {
        total: requests.len(),
        ..FetchReport::default()
    };
    for (request, outcome) in requests.iter().zip(outcomes) {
        let outcome = outcome.unwrap_or_else(|| {
            FetchOutcome::Failure(FetchFailure::permanent(
                FailureKind::Worker,
                "worker stopped before reporting this tile",
            ))
        });
        match outcome {
            FetchOutcome::Success(path) => report.succeeded.push((request.sequence_index(), path)),
            FetchOutcome::Failure(failure) => report.failures.push(TileFailure {
                index: request.sequence_index(),
                bbox: *request.bbox(),
                target_path: request.target_path().to_path_buf(),
                failure,
            }),
        }
    }
    report.succeeded.sort_by_key(|(index, _)| *index);
    report.failures.sort_by_key(|f| f.index);
    report
}
