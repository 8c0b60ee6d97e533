//! USGS 3DEP products and request construction.
//!
//! ## Products
//!
//! The seamless 3DEP DEM is served at three ground resolutions:
//! - 1/3 arc-second (~10 meters)
//! - 1 arc-second (~30 meters)
//! - 2 arc-second (~60 meters)
//!
//! Rasters are requested from the 3DEP ImageServer `exportImage` endpoint,
//! which renders any bbox at a requested pixel size. Besides raw elevation the
//! service can apply server-side raster functions ("map types") such as slope
//! or hillshade.

use crate::bbox::{BoundingBox, Resolution};
use crate::connection::RequestDescriptor;
use crate::pool::PooledResource;
use crate::{DemError, Result};
use reqwest::Url;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::f64::consts::PI;
use std::fmt;
use tracing::debug;

/// 3DEP elevation ImageServer.
pub const DEFAULT_SERVICE_URL: &str =
    "https://elevation.nationalmap.gov/arcgis/rest/services/3DEPElevation/ImageServer";

/// Raster functions offered by the 3DEP ImageServer. `"DEM"` is raw elevation.
pub const MAP_TYPES: &[&str] = &[
    "DEM",
    "Hillshade Gray",
    "Aspect Degrees",
    "Aspect Map",
    "GreyHillshade_elevationFill",
    "Hillshade Multidirectional",
    "Slope Map",
    "Slope Degrees",
    "Hillshade Elevation Tinted",
    "Height Ellipsoidal",
    "Contour 25",
    "Contour Smoothed 25",
];

/// Equatorial radius of the WGS84 ellipsoid, used by Web Mercator.
const WEB_MERCATOR_RADIUS: f64 = 6_378_137.0;

/// Seamless DEM product, identified by its ground resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DemProduct {
    /// 1/3 arc-second (~10 m).
    Meters10,
    /// 1 arc-second (~30 m).
    Meters30,
    /// 2 arc-second (~60 m).
    Meters60,
}

impl DemProduct {
    /// All products, finest first.
    pub const ALL: [DemProduct; 3] = [Self::Meters10, Self::Meters30, Self::Meters60];

    /// Look a product up by its resolution in meters (10, 30 or 60).
    pub fn from_meters(meters: u32) -> Result<Self> {
        match meters {
            10 => Ok(Self::Meters10),
            30 => Ok(Self::Meters30),
            60 => Ok(Self::Meters60),
            other => Err(DemError::InvalidInput(format!(
                "resolution must be one of 10, 30 or 60 meters, got {}",
                other
            ))),
        }
    }

    /// Nominal resolution in meters.
    pub fn meters(&self) -> u32 {
        match self {
            Self::Meters10 => 10,
            Self::Meters30 => 30,
            Self::Meters60 => 60,
        }
    }

    /// Output resolution in geographic coordinates.
    pub fn resolution(&self) -> Resolution {
        Resolution::geographic(self.meters() as f64)
    }

    /// Arc-second designation used by USGS.
    pub fn arc_seconds(&self) -> &'static str {
        match self {
            Self::Meters10 => "1/3",
            Self::Meters30 => "1",
            Self::Meters60 => "2",
        }
    }
}

impl fmt::Display for DemProduct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} m ({} arc-second)", self.meters(), self.arc_seconds())
    }
}

/// Builds the request for one sub-box.
pub trait RequestBuilder: Send + Sync {
    /// Request fetching `bbox` at `resolution`.
    fn build(&self, bbox: &BoundingBox, resolution: &Resolution) -> Result<RequestDescriptor>;

    /// Prefix of tile file names produced with this builder.
    fn file_prefix(&self) -> String;
}

/// Request builder for the ImageServer `exportImage` operation.
#[derive(Debug, Clone)]
pub struct ExportImageBuilder {
    service_url: String,
    map_type: Option<String>,
}

impl ExportImageBuilder {
    /// Raw elevation from the service at `service_url`.
    pub fn new(service_url: &str) -> Result<Self> {
        let service_url = service_url.trim_end_matches('/');
        parse_service_url(service_url)?;
        Ok(Self {
            service_url: service_url.to_string(),
            map_type: None,
        })
    }

    /// Apply a server-side raster function from [`MAP_TYPES`].
    pub fn with_map_type(mut self, map_type: &str) -> Result<Self> {
        if !MAP_TYPES.contains(&map_type) {
            return Err(DemError::InvalidInput(format!(
                "unknown map type '{}', expected one of: {}",
                map_type,
                MAP_TYPES.join(", ")
            )));
        }
        self.map_type = (map_type != "DEM").then(|| map_type.to_string());
        Ok(self)
    }

    /// Service base URL.
    pub fn service_url(&self) -> &str {
        &self.service_url
    }

    /// Raster function applied, if any.
    pub fn map_type(&self) -> Option<&str> {
        self.map_type.as_deref()
    }
}

impl Default for ExportImageBuilder {
    fn default() -> Self {
        Self {
            service_url: DEFAULT_SERVICE_URL.to_string(),
            map_type: None,
        }
    }
}

impl RequestBuilder for ExportImageBuilder {
    fn build(&self, bbox: &BoundingBox, resolution: &Resolution) -> Result<RequestDescriptor> {
        let (width, height) = bbox.pixel_dimensions(resolution);
        let mut url = parse_service_url(&self.service_url)?;
        url.path_segments_mut()
            .map_err(|_| {
                DemError::InvalidInput(format!("service URL '{}' cannot be a base", self.service_url))
            })?
            .push("exportImage");
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair(
                    "bbox",
                    &format!(
                        "{},{},{},{}",
                        bbox.west(),
                        bbox.south(),
                        bbox.east(),
                        bbox.north()
                    ),
                )
                .append_pair("bboxSR", "4326")
                .append_pair("imageSR", &resolution.epsg().to_string())
                .append_pair("size", &format!("{},{}", width, height))
                .append_pair("format", "tiff")
                .append_pair("pixelType", "F32")
                .append_pair("noDataInterpretation", "esriNoDataMatchAny")
                .append_pair("interpolation", "RSP_BilinearInterpolation");
            if let Some(map_type) = &self.map_type {
                query.append_pair(
                    "renderingRule",
                    &serde_json::json!({ "rasterFunction": map_type }).to_string(),
                );
            }
            query.append_pair("f", "image");
        }
        Ok(RequestDescriptor::new(url))
    }

    fn file_prefix(&self) -> String {
        match &self.map_type {
            None => "dem".to_string(),
            Some(map_type) => map_type
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
                .collect(),
        }
    }
}

fn parse_service_url(service_url: &str) -> Result<Url> {
    let url = Url::parse(service_url).map_err(|e| {
        DemError::InvalidInput(format!("invalid service URL '{}': {}", service_url, e))
    })?;
    if url.cannot_be_a_base() {
        return Err(DemError::InvalidInput(format!(
            "service URL '{}' cannot be a base",
            service_url
        )));
    }
    Ok(url)
}

/// Content-addressed file name for a tile: `<prefix>_<sha256 of the bbox>.tiff`.
pub fn tile_file_name(prefix: &str, bbox: &BoundingBox) -> String {
    let key = format!(
        "{},{},{},{}",
        bbox.west(),
        bbox.south(),
        bbox.east(),
        bbox.north()
    );
    format!("{}_{}.tiff", prefix, hex::encode(Sha256::digest(key.as_bytes())))
}

/// Description of an ImageServer, as returned by `<service>?f=json`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceMetadata {
    /// Service name.
    pub name: String,
    /// Geographic extent covered by the service.
    pub coverage: BoundingBox,
    /// Native pixel size `(x, y)` in the units of the service's CRS.
    pub pixel_size: (f64, f64),
    /// Value marking missing data, if the service declares one.
    pub nodata: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServiceInfo {
    #[serde(default)]
    name: Option<String>,
    extent: RawExtent,
    #[serde(default)]
    pixel_size_x: Option<f64>,
    #[serde(default)]
    pixel_size_y: Option<f64>,
    #[serde(default)]
    no_data_value: Option<f64>,
    #[serde(default)]
    no_data_values: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExtent {
    xmin: f64,
    ymin: f64,
    xmax: f64,
    ymax: f64,
    spatial_reference: RawSpatialReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSpatialReference {
    #[serde(default)]
    wkid: Option<u32>,
    #[serde(default)]
    latest_wkid: Option<u32>,
}

impl ServiceMetadata {
    /// Fetch and parse the description of the service at `service_url`.
    pub fn fetch(client: &reqwest::blocking::Client, service_url: &str) -> Result<Self> {
        debug!(service = service_url, "fetching service metadata");
        let response = client
            .get(service_url)
            .query(&[("f", "json")])
            .send()?
            .error_for_status()?;
        let body = response.text()?;
        Self::from_json(&body)
    }

    /// Parse an ImageServer JSON description.
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawServiceInfo = serde_json::from_str(json)?;
        let extent = &raw.extent;
        let wkid = extent
            .spatial_reference
            .latest_wkid
            .or(extent.spatial_reference.wkid)
            .ok_or_else(|| DemError::Metadata("extent has no spatial reference".to_string()))?;

        let (west, south, east, north) = match wkid {
            4326 | 4269 => (extent.xmin, extent.ymin, extent.xmax, extent.ymax),
            3857 | 102100 | 102113 => {
                let (west, south) = web_mercator_to_geographic(extent.xmin, extent.ymin);
                let (east, north) = web_mercator_to_geographic(extent.xmax, extent.ymax);
                (west, south, east, north)
            }
            other => {
                return Err(DemError::Metadata(format!(
                    "unsupported extent spatial reference wkid {}",
                    other
                )))
            }
        };
        let coverage = BoundingBox::new(
            west.clamp(-180.0, 180.0),
            south.clamp(-90.0, 90.0),
            east.clamp(-180.0, 180.0),
            north.clamp(-90.0, 90.0),
        )
        .map_err(|e| DemError::Metadata(format!("invalid service extent: {}", e)))?;

        let nodata = raw
            .no_data_value
            .or_else(|| raw.no_data_values.as_ref().and_then(|v| v.first().copied()));

        Ok(Self {
            name: raw.name.unwrap_or_default(),
            coverage,
            pixel_size: (
                raw.pixel_size_x.unwrap_or(f64::NAN),
                raw.pixel_size_y.unwrap_or(f64::NAN),
            ),
            nodata,
        })
    }

    /// Fail with [`DemError::OutOfBounds`] unless `bbox` lies within the coverage.
    pub fn check_bounds(&self, bbox: &BoundingBox) -> Result<()> {
        if self.coverage.contains(bbox) {
            Ok(())
        } else {
            Err(DemError::OutOfBounds {
                bbox: *bbox,
                coverage: self.coverage,
            })
        }
    }
}

impl PooledResource for ServiceMetadata {}

/// Convert EPSG:3857 meters to `(lon, lat)` degrees.
pub fn web_mercator_to_geographic(x: f64, y: f64) -> (f64, f64) {
    let lon = (x / WEB_MERCATOR_RADIUS).to_degrees();
    let lat = (2.0 * (y / WEB_MERCATOR_RADIUS).exp().atan() - PI / 2.0).to_degrees();
    (lon, lat)
}
