//! Splitting a bounding box into sub-boxes that fit a per-request pixel budget.
//!
//! The remote service refuses requests whose output raster exceeds a fixed
//! number of pixels. [`decompose_bbox`] tiles the area of interest into a
//! regular grid whose cells keep roughly the aspect ratio of the whole box,
//! so the number of requests stays close to the minimum.
//!
//! ## Ordering
//!
//! Boxes are returned row-major: rows run south to north, and within a row
//! boxes run west to east. The box at `index` sits at
//! `row = index / columns`, `col = index % columns`.

use crate::bbox::{pixels_for, BoundingBox, Resolution};
use crate::{DemError, Result};

/// Largest number of sub-boxes a decomposition may produce.
pub const MAX_TILES: usize = 1_000_000;

/// A decomposed bounding box together with its grid shape.
#[derive(Debug, Clone, PartialEq)]
pub struct TileGrid {
    boxes: Vec<BoundingBox>,
    columns: usize,
    rows: usize,
}

impl TileGrid {
    /// Sub-boxes in row-major order (south to north, west to east).
    pub fn boxes(&self) -> &[BoundingBox] {
        &self.boxes
    }

    /// Consume the grid, returning its sub-boxes.
    pub fn into_boxes(self) -> Vec<BoundingBox> {
        self.boxes
    }

    /// Number of columns (west to east).
    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Number of rows (south to north).
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of sub-boxes.
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    /// Whether the grid has no boxes (never true for a successful decomposition).
    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Grid position `(row, col)` of the sub-box at `index`.
    pub fn position(&self, index: usize) -> Option<(usize, usize)> {
        (index < self.boxes.len()).then(|| (index / self.columns, index % self.columns))
    }
}

/// Divide a bounding box into sub-boxes of at most `max_pixels` pixels each.
///
/// See [`decompose_grid`] for the details; this returns only the boxes.
pub fn decompose_bbox(
    bbox: &BoundingBox,
    resolution: &Resolution,
    max_pixels: u64,
) -> Result<Vec<BoundingBox>> {
    decompose_grid(bbox, resolution, max_pixels).map(TileGrid::into_boxes)
}

/// Divide a bounding box into a grid of sub-boxes of at most `max_pixels` pixels.
///
/// If the whole box fits the budget the result is a single cell equal to the
/// input. Otherwise the cells partition the input exactly: neighbours share
/// edge coordinates bit-for-bit and the outer edges are the input's edges.
///
/// # Errors
///
/// [`DemError::InvalidInput`] if `max_pixels` is zero, if the resolution is
/// coarser than the smallest ground dimension of the box, if the box is too
/// small to be split into distinct cells, or if the grid would need more than
/// [`MAX_TILES`] cells.
pub fn decompose_grid(
    bbox: &BoundingBox,
    resolution: &Resolution,
    max_pixels: u64,
) -> Result<TileGrid> {
    if max_pixels < 1 {
        return Err(DemError::InvalidInput(
            "max_pixels must be at least 1".to_string(),
        ));
    }

    let smallest_side = bbox.ground_width().min(bbox.ground_height());
    if resolution.meters() > smallest_side {
        return Err(DemError::InvalidInput(format!(
            "resolution {} m exceeds the smallest bbox dimension ({:.1} m)",
            resolution.meters(),
            smallest_side
        )));
    }

    let (width, height) = bbox.pixel_dimensions(resolution);
    if width.saturating_mul(height) <= max_pixels {
        return Ok(TileGrid {
            boxes: vec![*bbox],
            columns: 1,
            rows: 1,
        });
    }

    let (mut columns, mut rows) = initial_grid(width, height, max_pixels);
    loop {
        check_tile_count(bbox, max_pixels, columns, rows)?;
        let (cell_width, cell_height) = cell_pixels(bbox, resolution, columns, rows);
        if cell_width.saturating_mul(cell_height) <= max_pixels {
            let boxes = build_grid(bbox, columns, rows)?;
            // Rounding at the last edge can make a cell a hair wider than the
            // nominal one, so check what was actually produced.
            let largest = boxes
                .iter()
                .map(|b| b.pixel_dimensions(resolution))
                .max_by_key(|(w, h)| w.saturating_mul(*h));
            match largest {
                Some((w, h)) if w.saturating_mul(h) > max_pixels => {
                    if w >= h {
                        columns += 1;
                    } else {
                        rows += 1;
                    }
                }
                _ => {
                    return Ok(TileGrid {
                        boxes,
                        columns,
                        rows,
                    })
                }
            }
        } else if cell_width >= cell_height {
            columns += 1;
        } else {
            rows += 1;
        }
    }
}

/// Grow each box by `buffer_pixels` pixels on every side.
///
/// For callers that mosaic tiles with a resampling kernel and need some
/// overlap at the seams. The result no longer partitions the input and a
/// buffered box can exceed the pixel budget it was decomposed for. Edges are
/// clamped to the valid coordinate range.
pub fn buffer_boxes(
    boxes: &[BoundingBox],
    resolution: &Resolution,
    buffer_pixels: u32,
) -> Result<Vec<BoundingBox>> {
    boxes
        .iter()
        .map(|b| {
            if buffer_pixels == 0 {
                return Ok(*b);
            }
            let (width, height) = b.pixel_dimensions(resolution);
            let buff_x = (b.east() - b.west()) * f64::from(buffer_pixels) / width as f64;
            let buff_y = (b.north() - b.south()) * f64::from(buffer_pixels) / height as f64;
            BoundingBox::new(
                (b.west() - buff_x).max(-180.0),
                (b.south() - buff_y).max(-90.0),
                (b.east() + buff_x).min(180.0),
                (b.north() + buff_y).min(90.0),
            )
        })
        .collect()
}

fn check_tile_count(bbox: &BoundingBox, max_pixels: u64, columns: usize, rows: usize) -> Result<()> {
    match columns.checked_mul(rows) {
        Some(count) if count <= MAX_TILES => Ok(()),
        _ => Err(DemError::InvalidInput(format!(
            "bbox {} needs a {}x{} grid at {} pixels per tile, more than {} tiles",
            bbox, columns, rows, max_pixels, MAX_TILES
        ))),
    }
}

/// Balanced starting grid: `n` cells split so each keeps the box's aspect ratio.
fn initial_grid(width: u64, height: u64, max_pixels: u64) -> (usize, usize) {
    let n_boxes = (width as f64 * height as f64 / max_pixels as f64).ceil();
    let aspect_ratio = width as f64 / height as f64;
    let columns = ((n_boxes * aspect_ratio).sqrt().ceil() as usize).max(1);
    let rows = ((n_boxes / columns as f64).ceil() as usize).max(1);
    (columns, rows)
}

/// Pixel dimensions of the largest cell in a `columns × rows` grid.
fn cell_pixels(
    bbox: &BoundingBox,
    resolution: &Resolution,
    columns: usize,
    rows: usize,
) -> (u64, u64) {
    let dx = (bbox.east() - bbox.west()) / columns as f64;
    let dy = (bbox.north() - bbox.south()) / rows as f64;
    (
        pixels_for(bbox.ground_width_of(dx), resolution.meters()),
        pixels_for(bbox.ground_height_of(dy), resolution.meters()),
    )
}

/// Grid line coordinates from `lo` to `hi`, with the end points copied exactly.
fn edges(lo: f64, hi: f64, count: usize) -> Vec<f64> {
    (0..=count)
        .map(|i| match i {
            0 => lo,
            i if i == count => hi,
            i => lo + (hi - lo) * i as f64 / count as f64,
        })
        .collect()
}

fn build_grid(bbox: &BoundingBox, columns: usize, rows: usize) -> Result<Vec<BoundingBox>> {
    let xs = edges(bbox.west(), bbox.east(), columns);
    let ys = edges(bbox.south(), bbox.north(), rows);

    let mut boxes = Vec::with_capacity(columns * rows);
    for row in ys.windows(2) {
        for col in xs.windows(2) {
            let cell = BoundingBox::new(col[0], row[0], col[1], row[1]).map_err(|_| {
                DemError::InvalidInput(format!(
                    "bbox {} is too small to split into {}x{} tiles",
                    bbox, columns, rows
                ))
            })?;
            boxes.push(cell);
        }
    }
    Ok(boxes)
}
