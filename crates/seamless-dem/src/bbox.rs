//! Geographic bounding boxes and ground-distance pixel sizing.
//!
//! Boxes are expressed in EPSG:4326 decimal degrees while resolutions are
//! ground sample distances in metres, so pixel counts are derived from
//! great-circle lengths rather than degree spans.

use crate::{DemError, Result};
use std::fmt;

/// Mean Earth radius in metres (IUGG).
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Identifier of the CRS the bbox coordinates are expressed in.
pub const GEOGRAPHIC_CRS: &str = "EPSG:4326";

/// Axis-aligned rectangle in geographic coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    west: f64,
    south: f64,
    east: f64,
    north: f64,
}

impl BoundingBox {
    /// Create a bounding box, validating its geometry.
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self> {
        if ![west, south, east, north].iter().all(|v| v.is_finite()) {
            return Err(DemError::InvalidInput(format!(
                "bbox coordinates must be finite: ({}, {}, {}, {})",
                west, south, east, north
            )));
        }
        if !(-180.0..=180.0).contains(&west) || !(-180.0..=180.0).contains(&east) {
            return Err(DemError::InvalidInput(format!(
                "longitudes must be within [-180, 180]: west={}, east={}",
                west, east
            )));
        }
        if !(-90.0..=90.0).contains(&south) || !(-90.0..=90.0).contains(&north) {
            return Err(DemError::InvalidInput(format!(
                "latitudes must be within [-90, 90]: south={}, north={}",
                south, north
            )));
        }
        if west >= east || south >= north {
            return Err(DemError::InvalidInput(format!(
                "bbox must satisfy west < east and south < north: ({}, {}, {}, {})",
                west, south, east, north
            )));
        }
        Ok(Self {
            west,
            south,
            east,
            north,
        })
    }

    /// West edge (minimum longitude).
    pub fn west(&self) -> f64 {
        self.west
    }

    /// South edge (minimum latitude).
    pub fn south(&self) -> f64 {
        self.south
    }

    /// East edge (maximum longitude).
    pub fn east(&self) -> f64 {
        self.east
    }

    /// North edge (maximum latitude).
    pub fn north(&self) -> f64 {
        self.north
    }

    /// Coordinates as `(west, south, east, north)`.
    pub fn to_tuple(&self) -> (f64, f64, f64, f64) {
        (self.west, self.south, self.east, self.north)
    }

    /// Area in square degrees.
    pub fn area_deg2(&self) -> f64 {
        (self.east - self.west) * (self.north - self.south)
    }

    /// Check whether `other` lies entirely inside this box (edges inclusive).
    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.west <= other.west
            && other.east <= self.east
            && self.south <= other.south
            && other.north <= self.north
    }

    /// Latitude within the box closest to the equator.
    ///
    /// Parallels shrink towards the poles, so this is where an east-west
    /// span is longest on the ground.
    fn widest_latitude(&self) -> f64 {
        if self.south <= 0.0 && self.north >= 0.0 {
            0.0
        } else if self.south > 0.0 {
            self.south
        } else {
            self.north
        }
    }

    /// Ground length in metres of a longitude span along the box's widest
    /// parallel. Linear in the span, so spans past 180° keep growing.
    pub(crate) fn ground_width_of(&self, lon_span: f64) -> f64 {
        EARTH_RADIUS_M * self.widest_latitude().to_radians().cos() * lon_span.to_radians()
    }

    /// Ground length in metres of a latitude span along a meridian.
    pub(crate) fn ground_height_of(&self, lat_span: f64) -> f64 {
        haversine_distance(0.0, 0.0, lat_span, 0.0)
    }

    /// East-west ground extent in metres, measured at the widest parallel.
    pub fn ground_width(&self) -> f64 {
        self.ground_width_of(self.east - self.west)
    }

    /// North-south ground extent in metres.
    pub fn ground_height(&self) -> f64 {
        self.ground_height_of(self.north - self.south)
    }

    /// Pixel dimensions `(width, height)` of this box at a resolution.
    pub fn pixel_dimensions(&self, resolution: &Resolution) -> (u64, u64) {
        (
            pixels_for(self.ground_width(), resolution.meters()),
            pixels_for(self.ground_height(), resolution.meters()),
        )
    }

    /// Total pixel count `width × height` at a resolution.
    pub fn pixel_count(&self, resolution: &Resolution) -> u64 {
        let (width, height) = self.pixel_dimensions(resolution);
        width.saturating_mul(height)
    }
}

impl fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}, {})",
            self.west, self.south, self.east, self.north
        )
    }
}

/// Number of whole pixels needed to cover `distance_m`.
pub(crate) fn pixels_for(distance_m: f64, resolution_m: f64) -> u64 {
    ((distance_m / resolution_m).ceil() as u64).max(1)
}

/// Ground sample distance paired with the CRS the output raster is requested in.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    meters: f64,
    crs: String,
}

impl Resolution {
    /// A resolution in metres with output in geographic coordinates.
    pub fn new(meters: f64) -> Result<Self> {
        Self::with_crs(meters, GEOGRAPHIC_CRS)
    }

    /// A resolution in metres with an explicit output CRS, e.g. `"EPSG:5070"`.
    pub fn with_crs(meters: f64, crs: impl Into<String>) -> Result<Self> {
        if !meters.is_finite() || meters <= 0.0 {
            return Err(DemError::InvalidInput(format!(
                "resolution must be a positive number of metres, got {}",
                meters
            )));
        }
        let crs = crs.into();
        if epsg_code(&crs).is_none() {
            return Err(DemError::InvalidInput(format!(
                "CRS must be of the form 'EPSG:<code>', got '{}'",
                crs
            )));
        }
        Ok(Self { meters, crs })
    }

    /// Geographic-output resolution from a known positive value.
    pub(crate) fn geographic(meters: f64) -> Self {
        Self {
            meters,
            crs: GEOGRAPHIC_CRS.to_string(),
        }
    }

    /// Ground sample distance in metres.
    pub fn meters(&self) -> f64 {
        self.meters
    }

    /// Output CRS identifier.
    pub fn crs(&self) -> &str {
        &self.crs
    }

    /// Numeric EPSG code of the output CRS.
    pub fn epsg(&self) -> u32 {
        epsg_code(&self.crs).unwrap_or(4326)
    }
}

/// Parse the numeric part of an `EPSG:<code>` identifier.
pub(crate) fn epsg_code(crs: &str) -> Option<u32> {
    let (authority, code) = crs.split_once(':')?;
    if !authority.eq_ignore_ascii_case("epsg") {
        return None;
    }
    code.trim().parse().ok()
}

/// Great-circle distance between two points in metres (haversine formula).
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}
