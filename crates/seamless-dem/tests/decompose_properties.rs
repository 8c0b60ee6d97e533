//! Property tests for bbox decomposition.

use proptest::prelude::*;
use seamless_dem::{decompose_bbox, decompose_grid, BoundingBox, Resolution};

fn input() -> impl Strategy<Value = (BoundingBox, Resolution, u64)> {
    (
        -125.0f64..-70.0,
        0.01f64..1.5,
        -60.0f64..60.0,
        0.01f64..1.5,
        30.0f64..100.0,
        20_000u64..5_000_000,
    )
        .prop_map(|(west, width, south, height, meters, max_pixels)| {
            (
                BoundingBox::new(west, south, west + width, south + height).unwrap(),
                Resolution::new(meters).unwrap(),
                max_pixels,
            )
        })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every sub-box fits the pixel budget.
    #[test]
    fn prop_every_box_within_budget((bbox, resolution, max_pixels) in input()) {
        let boxes = decompose_bbox(&bbox, &resolution, max_pixels).unwrap();
        prop_assert!(!boxes.is_empty());
        for b in &boxes {
            prop_assert!(b.pixel_count(&resolution) <= max_pixels,
                "{} has {} px, budget {}", b, b.pixel_count(&resolution), max_pixels);
        }
    }

    /// Sub-boxes partition the input: a regular grid of strictly increasing
    /// shared edges whose outer edges are the input's.
    #[test]
    fn prop_boxes_partition_input((bbox, resolution, max_pixels) in input()) {
        let grid = decompose_grid(&bbox, &resolution, max_pixels).unwrap();
        let (columns, rows) = (grid.columns(), grid.rows());
        prop_assert_eq!(grid.len(), columns * rows);

        let boxes = grid.boxes();
        let xs: Vec<f64> = std::iter::once(boxes[0].west())
            .chain(boxes[..columns].iter().map(|b| b.east()))
            .collect();
        let ys: Vec<f64> = std::iter::once(boxes[0].south())
            .chain(boxes.iter().step_by(columns).map(|b| b.north()))
            .collect();

        prop_assert_eq!(xs[0], bbox.west());
        prop_assert_eq!(xs[columns], bbox.east());
        prop_assert_eq!(ys[0], bbox.south());
        prop_assert_eq!(ys[rows], bbox.north());
        prop_assert!(xs.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(ys.windows(2).all(|w| w[0] < w[1]));

        for (index, b) in boxes.iter().enumerate() {
            let (row, col) = grid.position(index).unwrap();
            prop_assert_eq!(b.west(), xs[col]);
            prop_assert_eq!(b.east(), xs[col + 1]);
            prop_assert_eq!(b.south(), ys[row]);
            prop_assert_eq!(b.north(), ys[row + 1]);
        }

        let area: f64 = boxes.iter().map(|b| b.area_deg2()).sum();
        prop_assert!((area - bbox.area_deg2()).abs() <= bbox.area_deg2() * 1e-9);
    }

    /// Same input, bit-identical output.
    #[test]
    fn prop_deterministic((bbox, resolution, max_pixels) in input()) {
        let first = decompose_bbox(&bbox, &resolution, max_pixels).unwrap();
        let second = decompose_bbox(&bbox, &resolution, max_pixels).unwrap();
        prop_assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            prop_assert_eq!(a.west().to_bits(), b.west().to_bits());
            prop_assert_eq!(a.south().to_bits(), b.south().to_bits());
            prop_assert_eq!(a.east().to_bits(), b.east().to_bits());
            prop_assert_eq!(a.north().to_bits(), b.north().to_bits());
        }
    }

    /// A box that already fits comes back unchanged.
    #[test]
    fn prop_small_box_passthrough((bbox, resolution, _max) in input()) {
        let budget = bbox.pixel_count(&resolution);
        prop_assert_eq!(decompose_bbox(&bbox, &resolution, budget).unwrap(), vec![bbox]);
    }
}
