//! # seamless-dem
//!
//! Budget-aware tiled downloads of USGS 3DEP elevation rasters.
//!
//! The 3DEP ImageServer renders any bounding box as a GeoTIFF, but refuses
//! requests whose output exceeds a fixed number of pixels. This crate splits
//! a large area into a grid of requests that each fit the budget, downloads
//! them concurrently and streams every tile atomically to disk.
//!
//! ## Overview
//!
//! - [`decompose_bbox`] splits a bbox into row-major sub-boxes, each within
//!   the pixel budget, that exactly cover the input
//! - [`ResourcePool`] holds lazily created, keyed resources (HTTP sessions,
//!   service metadata) shared by every fetch
//! - [`StreamFetcher`] downloads one tile with retries, writing through a
//!   temporary file so a target is either complete or absent
//! - [`FetchOrchestrator`] runs the tiles on a bounded set of worker threads
//!   and reports every failure at once
//! - [`DemDownloader`] wires it all to the 3DEP service
//!
//! ## Examples
//!
//! ```no_run
//! use seamless_dem::{BoundingBox, CancellationToken, DemDownloader, DemProduct, FetchConfig};
//! use std::path::Path;
//!
//! let downloader = DemDownloader::new(FetchConfig::default())?;
//! let bbox = BoundingBox::new(-105.70, 39.85, -104.87, 40.30)?;
//!
//! let report = downloader.get(&bbox, Path::new("dem_data"), DemProduct::Meters10, &CancellationToken::new())?;
//! for path in report.paths() {
//!     println!("{}", path.display());
//! }
//! # Ok::<(), seamless_dem::DemError>(())
//! ```
//!
//! A partial failure still leaves the good tiles on disk:
//!
//! ```no_run
//! # use seamless_dem::{BoundingBox, CancellationToken, DemDownloader, DemProduct, FetchConfig};
//! # use std::path::Path;
//! # let downloader = DemDownloader::new(FetchConfig::default())?;
//! # let bbox = BoundingBox::new(-105.70, 39.85, -104.87, 40.30)?;
//! match downloader.get(&bbox, Path::new("dem_data"), DemProduct::Meters30, &CancellationToken::new()) {
//!     Ok(report) => println!("{} tiles", report.total()),
//!     Err(e) => {
//!         eprintln!("{}", e);
//!         let usable = e.usable_paths();
//!         println!("{} tiles usable", usable.len());
//!     }
//! }
//! # Ok::<(), seamless_dem::DemError>(())
//! ```

pub mod bbox;
pub mod catalog;
pub mod config;
pub mod connection;
pub mod decompose;
pub mod downloader;
mod error;
pub mod fetcher;
pub mod orchestrator;
pub mod pool;

pub use bbox::{haversine_distance, BoundingBox, Resolution, GEOGRAPHIC_CRS};
pub use catalog::{
    tile_file_name, DemProduct, ExportImageBuilder, RequestBuilder, ServiceMetadata,
    DEFAULT_SERVICE_URL, MAP_TYPES,
};
pub use config::{FetchConfig, RetryPolicy};
pub use connection::{Connection, HttpSession, RequestDescriptor, ResponseBody};
pub use decompose::{buffer_boxes, decompose_bbox, decompose_grid, TileGrid, MAX_TILES};
pub use downloader::DemDownloader;
pub use error::{DemError, FailureKind, FetchFailure};
pub use fetcher::{DownloadStats, StreamFetcher};
pub use orchestrator::{
    CancellationToken, FetchOrchestrator, FetchOutcome, FetchReport, SubTileRequest, TileFailure,
};
pub use pool::{Pooled, PooledResource, ResourcePool};

/// Result type for DEM operations.
pub type Result<T> = std::result::Result<T, DemError>;
