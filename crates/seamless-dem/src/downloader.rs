//! High-level DEM downloads.
//!
//! [`DemDownloader`] ties the pieces together: it validates and decomposes
//! the bbox, checks it against the product's coverage, names every tile by
//! the hash of its bbox and runs the fetch.
//!
//! It owns two pools:
//! - HTTP sessions, keyed by URL origin
//! - service metadata, keyed by service URL; fetched over a session leased
//!   from the first pool
//!
//! Both are released by [`DemDownloader::shutdown`] or when the downloader
//! is dropped.

use crate::bbox::BoundingBox;
use crate::catalog::{
    tile_file_name, DemProduct, ExportImageBuilder, RequestBuilder, ServiceMetadata,
    DEFAULT_SERVICE_URL,
};
use crate::config::FetchConfig;
use crate::connection::{HttpSession, RequestDescriptor};
use crate::decompose::decompose_grid;
use crate::fetcher::StreamFetcher;
use crate::orchestrator::{CancellationToken, FetchOrchestrator, FetchReport, SubTileRequest};
use crate::pool::{Pooled, ResourcePool};
use crate::Result;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Downloads 3DEP rasters for arbitrary bounding boxes.
pub struct DemDownloader {
    config: FetchConfig,
    service_url: String,
    sessions: Arc<ResourcePool<String, HttpSession>>,
    metadata: ResourcePool<String, ServiceMetadata>,
}

impl std::fmt::Debug for DemDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemDownloader")
            .field("service_url", &self.service_url)
            .field("sessions", &self.sessions.len())
            .field("metadata", &self.metadata.len())
            .finish()
    }
}

impl DemDownloader {
    /// Create a downloader for the USGS 3DEP service.
    pub fn new(config: FetchConfig) -> Result<Self> {
        Self::with_service_url(DEFAULT_SERVICE_URL, config)
    }

    /// Create a downloader for an ImageServer at `service_url`.
    pub fn with_service_url(service_url: &str, config: FetchConfig) -> Result<Self> {
        config.validate()?;
        let service_url = ExportImageBuilder::new(service_url)?
            .service_url()
            .to_string();

        let session_config = config.clone();
        let sessions = Arc::new(ResourcePool::new(
            "http-sessions",
            move |origin: &String| HttpSession::new(origin.clone(), &session_config),
        ));

        let metadata_sessions = Arc::clone(&sessions);
        let metadata = ResourcePool::new("service-metadata", move |url: &String| {
            let origin = RequestDescriptor::parse(url)?.connection_key();
            let session = metadata_sessions.get_or_create(&origin)?;
            let meta = ServiceMetadata::fetch(session.client(), url)?;
            info!(service = %url, coverage = %meta.coverage, "loaded service metadata");
            Ok(meta)
        });

        Ok(Self {
            config,
            service_url,
            sessions,
            metadata,
        })
    }

    /// Settings in use.
    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Base URL of the ImageServer.
    pub fn service_url(&self) -> &str {
        &self.service_url
    }

    /// Service description, fetched on first use and shared by every product.
    pub fn metadata(&self) -> Result<Pooled<ServiceMetadata>> {
        self.metadata.get_or_create(&self.service_url)
    }

    /// Turn `bbox` into the tile requests needed to fetch it.
    ///
    /// Pure planning: nothing is fetched and no directory is created.
    pub fn plan(
        &self,
        bbox: &BoundingBox,
        product: DemProduct,
        builder: &dyn RequestBuilder,
        save_dir: &Path,
    ) -> Result<Vec<SubTileRequest>> {
        let resolution = product.resolution();
        let grid = decompose_grid(bbox, &resolution, self.config.max_pixels)?;
        let prefix = builder.file_prefix();

        grid.boxes()
            .iter()
            .enumerate()
            .map(|(index, sub)| {
                let descriptor = builder.build(sub, &resolution)?;
                let target = save_dir.join(tile_file_name(&prefix, sub));
                Ok(SubTileRequest::new(*sub, resolution.clone(), index, target, descriptor))
            })
            .collect()
    }

    /// Download the DEM covering `bbox` into `save_dir`.
    ///
    /// Returns the report with tile paths in sequence order (see
    /// [`crate::decompose`] for the order).
    pub fn get(
        &self,
        bbox: &BoundingBox,
        save_dir: &Path,
        product: DemProduct,
        cancel: &CancellationToken,
    ) -> Result<FetchReport> {
        let builder = ExportImageBuilder::new(&self.service_url)?;
        self.fetch_with(&builder, bbox, save_dir, product, cancel)
    }

    /// Download a derived map such as `"Slope Degrees"` (see
    /// [`crate::catalog::MAP_TYPES`]) covering `bbox` into `save_dir`.
    pub fn get_map(
        &self,
        map_type: &str,
        bbox: &BoundingBox,
        save_dir: &Path,
        product: DemProduct,
        cancel: &CancellationToken,
    ) -> Result<FetchReport> {
        let builder = ExportImageBuilder::new(&self.service_url)?.with_map_type(map_type)?;
        self.fetch_with(&builder, bbox, save_dir, product, cancel)
    }

    fn fetch_with(
        &self,
        builder: &dyn RequestBuilder,
        bbox: &BoundingBox,
        save_dir: &Path,
        product: DemProduct,
        cancel: &CancellationToken,
    ) -> Result<FetchReport> {
        // Local validation first, so bad input never touches the network
        let requests = self.plan(bbox, product, builder, save_dir)?;
        self.metadata()?.check_bounds(bbox)?;

        fs::create_dir_all(save_dir)?;
        info!(
            %bbox,
            %product,
            tiles = requests.len(),
            dir = %save_dir.display(),
            "fetching DEM"
        );

        let orchestrator =
            FetchOrchestrator::new(&self.sessions, StreamFetcher::from_config(&self.config));
        orchestrator.run(requests, self.config.concurrency, cancel)
    }

    /// Release every pooled session and metadata handle.
    ///
    /// Returns the number of resources released. Later downloads fail.
    pub fn shutdown(&self) -> usize {
        self.metadata.shutdown() + self.sessions.shutdown()
    }
}
