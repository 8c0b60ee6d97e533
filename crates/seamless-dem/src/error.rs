//! Error types for the DEM fetch crate.

use crate::bbox::BoundingBox;
use crate::orchestrator::{describe_tile_failures, FetchReport, TileFailure};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while planning or running a DEM download.
#[derive(Debug, Error)]
pub enum DemError {
    /// Bad geometry, resolution, pixel budget or configuration value.
    ///
    /// Raised before any network activity takes place.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Building a pooled resource for a key failed.
    #[error("Failed to initialize resource {key}: {reason}")]
    ResourceInit {
        /// Debug rendering of the pool key.
        key: String,
        /// Reason reported by the factory.
        reason: String,
    },

    /// A pool was used after `shutdown()`.
    #[error("Resource pool '{pool}' is closed")]
    PoolClosed {
        /// Name of the closed pool.
        pool: String,
    },

    /// The orchestrator could not start at all.
    #[error("Cannot start fetch: {0}")]
    Orchestration(String),

    /// Some tiles failed; the others are on disk.
    #[error("{} of {} tiles failed:\n{}", .0.failures().len(), .0.total(), .0.describe_failures())]
    PartialFailure(FetchReport),

    /// Every tile failed.
    #[error("All {} tiles failed:\n{}", .0.total(), .0.describe_failures())]
    TotalFailure(FetchReport),

    /// The run was cancelled before all tiles settled.
    #[error(
        "Fetch cancelled: {} tiles completed, {} failed, {unfinished} unfinished\n{}",
        .completed.len(),
        .failed.len(),
        describe_tile_failures(.failed)
    )]
    Cancelled {
        /// Files that were fully written before cancellation (left intact).
        completed: Vec<PathBuf>,
        /// Tiles that failed for a reason other than the cancellation.
        failed: Vec<TileFailure>,
        /// Number of tiles that were cancelled or never started.
        unfinished: usize,
    },

    /// The requested bbox is outside the product's coverage.
    #[error("Bounding box {bbox} is outside the coverage {coverage}")]
    OutOfBounds {
        /// Requested area.
        bbox: BoundingBox,
        /// Area served by the product.
        coverage: BoundingBox,
    },

    /// Service metadata could not be interpreted.
    #[error("Invalid service metadata: {0}")]
    Metadata(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error outside of a tile fetch.
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON decoding error.
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML decoding error.
    #[error("YAML decode error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl DemError {
    /// The report attached to a partial or total failure.
    pub fn report(&self) -> Option<&FetchReport> {
        match self {
            Self::PartialFailure(report) | Self::TotalFailure(report) => Some(report),
            _ => None,
        }
    }

    /// Paths that are usable despite the error.
    pub fn usable_paths(&self) -> Vec<PathBuf> {
        match self {
            Self::PartialFailure(report) | Self::TotalFailure(report) => report.paths(),
            Self::Cancelled { completed, .. } => completed.clone(),
            _ => Vec::new(),
        }
    }
}

/// Classification of a single tile failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Could not connect to the server.
    Connect,
    /// The request or a read timed out.
    Timeout,
    /// The server answered with a non-success status.
    Status(u16),
    /// Reading the body failed mid-stream.
    Stream,
    /// Fewer bytes arrived than `Content-Length` announced.
    Truncated,
    /// The server returned an empty body.
    EmptyBody,
    /// The server answered with an error document instead of raster data.
    ContentType,
    /// Local file system error.
    Io,
    /// The run was cancelled while this tile was pending or in flight.
    Cancelled,
    /// The worker thread handling this tile terminated abnormally.
    Worker,
    /// The pooled connection for this tile could not be obtained.
    Resource,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Timeout => write!(f, "timeout"),
            Self::Status(code) => write!(f, "HTTP {}", code),
            Self::Stream => write!(f, "stream"),
            Self::Truncated => write!(f, "truncated"),
            Self::EmptyBody => write!(f, "empty body"),
            Self::ContentType => write!(f, "content type"),
            Self::Io => write!(f, "I/O"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Worker => write!(f, "worker"),
            Self::Resource => write!(f, "resource"),
        }
    }
}

/// A failed attempt (or run of attempts) to fetch one tile.
///
/// `retriable` separates transient failures (connection drops, timeouts,
/// 5xx) from permanent ones (4xx, local I/O).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error: {message}")]
pub struct FetchFailure {
    /// What went wrong.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub message: String,
    /// Whether another attempt could succeed.
    pub retriable: bool,
}

impl FetchFailure {
    /// A failure worth retrying.
    pub fn transient(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retriable: true,
        }
    }

    /// A failure that will not go away by retrying.
    pub fn permanent(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retriable: false,
        }
    }

    /// Classify an HTTP status: 5xx is transient, anything else permanent.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        if (500..600).contains(&status) {
            Self::transient(FailureKind::Status(status), message)
        } else {
            Self::permanent(FailureKind::Status(status), message)
        }
    }

    pub(crate) fn cancelled() -> Self {
        Self::permanent(FailureKind::Cancelled, "operation cancelled")
    }
}
