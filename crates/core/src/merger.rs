//! Reassembly of per-tile model outputs into full-resolution score maps.
//!
//! Merge is a placement operation: each tile writes its trimmed core region
//! into the canvas unchanged, nothing is averaged. Along an axis, two
//! neighbouring tiles trim `delta` pixels from their shared edges, capped so
//! their cores meet at the middle of the overlap instead of leaving a gap.
//! Image borders are never trimmed. Where `delta` is smaller than half the
//! overlap the cores still overlap and the later tile in canonical order wins.

use ndarray::{s, Array2, Array3, ArrayD, Axis, Ix3};
use tracing::debug;

use crate::error::{TilingError, TilingResult};
use crate::geometry::TilePlacement;
use crate::job::TilingJob;

/// A model's raw per-class scores for one tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TileOutput {
    pub placement: TilePlacement,
    /// `(classes, height, width)`
    pub scores: Array3<f32>,
}

impl TileOutput {
    pub fn new(placement: TilePlacement, scores: Array3<f32>) -> Self {
        Self { placement, scores }
    }

    /// Accept model output with any number of leading singleton axes, e.g.
    /// `(1, classes, h, w)`.
    pub fn from_raw(placement: TilePlacement, raw: ArrayD<f32>) -> TilingResult<Self> {
        let mut raw = raw;
        while raw.ndim() > 3 && raw.shape()[0] == 1 {
            raw = raw.index_axis_move(Axis(0), 0);
        }
        let scores = raw.into_dimensionality::<Ix3>().map_err(|e| {
            TilingError::DimensionMismatch(format!(
                "tile output must be (classes, height, width): {e}"
            ))
        })?;
        Ok(Self { placement, scores })
    }
}

/// Merged scores for one image of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct MergedOutput {
    pub image_index: usize,
    /// `(classes, image_height, image_width)`
    pub scores: Array3<f32>,
}

impl MergedOutput {
    pub fn num_classes(&self) -> usize {
        self.scores.dim().0
    }

    /// Index of the highest score per pixel; ties go to the lowest class.
    pub fn label_map(&self) -> Array2<u32> {
        let (classes, height, width) = self.scores.dim();
        let mut labels = Array2::<u32>::zeros((height, width));
        for y in 0..height {
            for x in 0..width {
                let mut best = 0usize;
                let mut best_score = self.scores[[0, y, x]];
                for class in 1..classes {
                    let score = self.scores[[class, y, x]];
                    if score > best_score || (best_score.is_nan() && !score.is_nan()) {
                        best = class;
                        best_score = score;
                    }
                }
                labels[[y, x]] = best as u32;
            }
        }
        labels
    }
}

/// Near/far trim for each origin along one axis. `spans` are `(origin, len)`
/// sorted by origin.
fn axis_trims(spans: &[(usize, usize)], delta: usize) -> Vec<(usize, usize)> {
    let overlap = |k: usize| {
        let (a, len_a) = spans[k];
        let (b, _) = spans[k + 1];
        (a + len_a).saturating_sub(b)
    };

    (0..spans.len())
        .map(|k| {
            let near = if k == 0 {
                0
            } else {
                let ov = overlap(k - 1);
                delta.min(ov - ov / 2)
            };
            let far = if k + 1 == spans.len() {
                0
            } else {
                delta.min(overlap(k) / 2)
            };
            (near, far)
        })
        .collect()
}

/// Origins of the row (or column) grid, indexed by the placements' grid index.
fn grid_spans(
    placements: &[TilePlacement],
    index: impl Fn(&TilePlacement) -> usize,
    span: impl Fn(&TilePlacement) -> (usize, usize),
) -> TilingResult<Vec<(usize, usize)>> {
    let count = placements.iter().map(&index).max().map_or(0, |m| m + 1);
    let mut spans: Vec<Option<(usize, usize)>> = vec![None; count];
    for placement in placements {
        let slot = &mut spans[index(placement)];
        match *slot {
            None => *slot = Some(span(placement)),
            Some(existing) if existing == span(placement) => {}
            Some(_) => {
                return Err(TilingError::DimensionMismatch(
                    "placements sharing a grid index disagree on origin or size".to_string(),
                ))
            }
        }
    }
    let spans: Vec<(usize, usize)> = spans
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| {
            TilingError::DimensionMismatch("placement grid has missing rows or columns".to_string())
        })?;
    if spans.windows(2).any(|w| w[0].0 >= w[1].0) {
        return Err(TilingError::DimensionMismatch(
            "placement grid origins are not strictly increasing".to_string(),
        ));
    }
    Ok(spans)
}

/// Merge the tiles of a single image. `outputs[i]` must belong to
/// `placements[i]`.
pub fn merge_tiles(
    placements: &[TilePlacement],
    image_height: usize,
    image_width: usize,
    delta: usize,
    outputs: &[TileOutput],
) -> TilingResult<Array3<f32>> {
    if outputs.len() != placements.len() {
        return Err(TilingError::CardinalityMismatch {
            expected: placements.len(),
            actual: outputs.len(),
        });
    }
    let Some(first) = outputs.first() else {
        return Err(TilingError::CardinalityMismatch {
            expected: 1,
            actual: 0,
        });
    };
    let classes = first.scores.dim().0;

    let row_trims = axis_trims(
        &grid_spans(placements, |p| p.row_index, |p| (p.row_offset, p.height))?,
        delta,
    );
    let col_trims = axis_trims(
        &grid_spans(placements, |p| p.col_index, |p| (p.col_offset, p.width))?,
        delta,
    );

    let mut canvas = Array3::<f32>::zeros((classes, image_height, image_width));
    for (tile_index, (placement, output)) in placements.iter().zip(outputs).enumerate() {
        if output.placement != *placement {
            return Err(TilingError::DimensionMismatch(format!(
                "tile {tile_index} is placed at ({}, {}) but the job expects ({}, {})",
                output.placement.row_offset,
                output.placement.col_offset,
                placement.row_offset,
                placement.col_offset
            )));
        }
        if !placement.fits_within(image_height, image_width) {
            return Err(TilingError::DimensionMismatch(format!(
                "tile {tile_index} exceeds the {image_height}x{image_width} canvas"
            )));
        }
        let (tile_classes, tile_h, tile_w) = output.scores.dim();
        if tile_classes != classes || tile_h != placement.height || tile_w != placement.width {
            return Err(TilingError::DimensionMismatch(format!(
                "tile {tile_index} output is {tile_classes}x{tile_h}x{tile_w}, expected {classes}x{}x{}",
                placement.height, placement.width
            )));
        }

        let (top, bottom) = row_trims[placement.row_index];
        let (left, right) = col_trims[placement.col_index];
        let core = output
            .scores
            .slice(s![.., top..tile_h - bottom, left..tile_w - right]);
        canvas
            .slice_mut(s![
                ..,
                placement.row_offset + top..placement.row_end() - bottom,
                placement.col_offset + left..placement.col_end() - right
            ])
            .assign(&core);
    }

    Ok(canvas)
}

/// Merge every image of a job. Outputs are grouped image-major in runs of
/// `job.tile_placements.len()`.
pub fn merge(job: &TilingJob, outputs: &[TileOutput]) -> TilingResult<Vec<MergedOutput>> {
    let per_image = job.tile_placements.len();
    let expected = job.expected_outputs();
    if per_image == 0 || outputs.len() != expected {
        return Err(TilingError::CardinalityMismatch {
            expected,
            actual: outputs.len(),
        });
    }

    let merged = outputs
        .chunks(per_image)
        .enumerate()
        .map(|(image_index, group)| {
            merge_tiles(
                &job.tile_placements,
                job.image_height,
                job.image_width,
                job.delta,
                group,
            )
            .map(|scores| MergedOutput {
                image_index,
                scores,
            })
        })
        .collect::<TilingResult<Vec<_>>>()?;

    debug!(
        request_id = %job.request_id,
        images = merged.len(),
        tiles = outputs.len(),
        "Merged tile outputs"
    );

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use ndarray::Array4;

    use super::*;
    use crate::geometry::compute_tiles;
    use crate::job::{OutputFormat, SourceMetadataRef};
    use crate::splitter::split;

    fn job(
        image_height: usize,
        image_width: usize,
        placements: Vec<TilePlacement>,
        delta: usize,
        batch_size: usize,
    ) -> TilingJob {
        TilingJob {
            request_id: "merge-test".to_string(),
            tile_placements: placements,
            image_height,
            image_width,
            batch_size,
            delta,
            output_format: OutputFormat::Path,
            source_metadata: SourceMetadataRef::new(()),
            created_at: Utc::now(),
        }
    }

    fn identity_outputs(source: &Array4<f32>, placements: &[TilePlacement]) -> Vec<TileOutput> {
        let (_, _, h, w) = source.dim();
        split(source.view(), placements, h, w)
            .unwrap()
            .into_iter()
            .map(|tile| TileOutput::new(tile.placement, tile.data))
            .collect()
    }

    fn pseudo_random(batch: usize, classes: usize, h: usize, w: usize) -> Array4<f32> {
        Array4::from_shape_fn((batch, classes, h, w), |(b, c, y, x)| {
            let v = (b * 7919 + c * 104_729 + y * 31 + x * 17) % 1013;
            v as f32 / 1013.0
        })
    }

    #[test]
    fn test_all_ones_512_reassembles_to_all_ones() {
        let placements = compute_tiles(512, 512, 256, 256, 192, 192).unwrap();
        let outputs: Vec<TileOutput> = placements
            .iter()
            .map(|p| TileOutput::new(*p, Array3::ones((2, 256, 256))))
            .collect();
        let merged = merge(&job(512, 512, placements, 32, 1), &outputs).unwrap();

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].scores.dim(), (2, 512, 512));
        assert!(merged[0].scores.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_missing_tile_is_cardinality_mismatch() {
        let placements = compute_tiles(512, 512, 256, 256, 192, 192).unwrap();
        let outputs: Vec<TileOutput> = placements[..8]
            .iter()
            .map(|p| TileOutput::new(*p, Array3::ones((2, 256, 256))))
            .collect();
        let err = merge(&job(512, 512, placements, 32, 1), &outputs).unwrap_err();
        assert_eq!(
            err,
            TilingError::CardinalityMismatch {
                expected: 9,
                actual: 8
            }
        );
    }

    #[test]
    fn test_identity_round_trip_over_parameter_grid() {
        for (h, w) in [(17usize, 23usize), (32, 32), (40, 29)] {
            for crop in [8usize, 11] {
                for stride in [crop / 2, crop - 1, crop] {
                    for delta in [0usize, 1, 2, (crop - stride).div_ceil(2), crop] {
                        let placements = compute_tiles(h, w, crop, crop, stride, stride).unwrap();
                        let source = pseudo_random(1, 3, h, w);
                        let outputs = identity_outputs(&source, &placements);
                        let merged =
                            merge(&job(h, w, placements, delta, 1), &outputs).unwrap();
                        assert_eq!(
                            merged[0].scores,
                            source.index_axis(Axis(0), 0),
                            "round trip failed for {h}x{w} crop={crop} stride={stride} delta={delta}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_cores_partition_canvas_when_delta_covers_half_overlap() {
        // Each tile writes its own index; with delta >= overlap/2 on regular
        // seams every pixel must come from the tile whose core owns it.
        let placements = compute_tiles(20, 20, 8, 8, 6, 6).unwrap();
        let outputs: Vec<TileOutput> = placements
            .iter()
            .enumerate()
            .map(|(i, p)| TileOutput::new(*p, Array3::from_elem((1, 8, 8), i as f32)))
            .collect();
        let merged = merge_tiles(&placements, 20, 20, 1, &outputs).unwrap();

        // rows: 0, 6, 12 ; overlap 2 -> seams at 7 and 13
        assert_eq!(merged[[0, 6, 0]], 0.0);
        assert_eq!(merged[[0, 7, 0]], 3.0);
        assert_eq!(merged[[0, 12, 0]], 3.0);
        assert_eq!(merged[[0, 13, 0]], 6.0);
        assert_eq!(merged[[0, 19, 19]], 8.0);
    }

    #[test]
    fn test_small_delta_resolves_overlap_last_write_wins() {
        let placements = compute_tiles(12, 8, 8, 8, 4, 4).unwrap();
        // rows: 0, 4 ; overlap 4 ; delta 0 keeps full tiles
        let outputs: Vec<TileOutput> = placements
            .iter()
            .enumerate()
            .map(|(i, p)| TileOutput::new(*p, Array3::from_elem((1, 8, 8), (i + 1) as f32)))
            .collect();
        let merged = merge_tiles(&placements, 12, 8, 0, &outputs).unwrap();
        assert_eq!(merged[[0, 3, 0]], 1.0);
        assert_eq!(merged[[0, 4, 0]], 2.0);
        assert_eq!(merged[[0, 7, 0]], 2.0);
    }

    #[test]
    fn test_large_delta_never_leaves_gaps() {
        let placements = compute_tiles(30, 30, 10, 10, 7, 7).unwrap();
        let outputs: Vec<TileOutput> = placements
            .iter()
            .map(|p| TileOutput::new(*p, Array3::from_elem((1, 10, 10), 5.0)))
            .collect();
        let merged = merge_tiles(&placements, 30, 30, 100, &outputs).unwrap();
        assert!(merged.iter().all(|&v| v == 5.0));
    }

    #[test]
    fn test_batch_merges_each_image_independently() {
        let placements = compute_tiles(16, 16, 8, 8, 6, 6).unwrap();
        let source = pseudo_random(3, 2, 16, 16);
        let outputs = identity_outputs(&source, &placements);
        let merged = merge(&job(16, 16, placements, 1, 3), &outputs).unwrap();

        assert_eq!(merged.len(), 3);
        for (image_index, output) in merged.iter().enumerate() {
            assert_eq!(output.image_index, image_index);
            assert_eq!(output.scores, source.index_axis(Axis(0), image_index));
        }
    }

    #[test]
    fn test_merge_is_deterministic() {
        let placements = compute_tiles(24, 24, 10, 10, 6, 6).unwrap();
        let outputs: Vec<TileOutput> = placements
            .iter()
            .enumerate()
            .map(|(i, p)| {
                TileOutput::new(
                    *p,
                    Array3::from_shape_fn((2, 10, 10), |(c, y, x)| {
                        (i * 1000 + c * 100 + y * 10 + x) as f32
                    }),
                )
            })
            .collect();
        let first = merge_tiles(&placements, 24, 24, 1, &outputs).unwrap();
        let second = merge_tiles(&placements, 24, 24, 1, &outputs).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_wrong_tile_extent_is_dimension_mismatch() {
        let placements = compute_tiles(16, 16, 8, 8, 8, 8).unwrap();
        let mut outputs: Vec<TileOutput> = placements
            .iter()
            .map(|p| TileOutput::new(*p, Array3::zeros((2, 8, 8))))
            .collect();
        outputs[2].scores = Array3::zeros((2, 8, 7));
        assert!(matches!(
            merge_tiles(&placements, 16, 16, 0, &outputs),
            Err(TilingError::DimensionMismatch(_))
        ));

        outputs[2].scores = Array3::zeros((3, 8, 8));
        assert!(matches!(
            merge_tiles(&placements, 16, 16, 0, &outputs),
            Err(TilingError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_out_of_order_outputs_are_rejected() {
        let placements = compute_tiles(16, 16, 8, 8, 8, 8).unwrap();
        let mut outputs: Vec<TileOutput> = placements
            .iter()
            .map(|p| TileOutput::new(*p, Array3::zeros((1, 8, 8))))
            .collect();
        outputs.swap(0, 1);
        assert!(matches!(
            merge_tiles(&placements, 16, 16, 0, &outputs),
            Err(TilingError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_from_raw_squeezes_leading_batch_axis() {
        let placement = compute_tiles(4, 4, 4, 4, 4, 4).unwrap()[0];
        let raw = ArrayD::<f32>::zeros(vec![1, 1, 3, 4, 4]);
        let output = TileOutput::from_raw(placement, raw).unwrap();
        assert_eq!(output.scores.dim(), (3, 4, 4));

        let bad = ArrayD::<f32>::zeros(vec![2, 3, 4, 4]);
        assert!(matches!(
            TileOutput::from_raw(placement, bad),
            Err(TilingError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_label_map_picks_highest_class_lowest_on_tie() {
        let mut scores = Array3::<f32>::zeros((3, 1, 3));
        scores[[1, 0, 0]] = 0.9;
        scores[[2, 0, 1]] = 0.4;
        scores[[0, 0, 1]] = 0.1;
        // pixel 2: all equal -> class 0
        let merged = MergedOutput {
            image_index: 0,
            scores,
        };
        let labels = merged.label_map();
        assert_eq!(labels[[0, 0]], 1);
        assert_eq!(labels[[0, 1]], 2);
        assert_eq!(labels[[0, 2]], 0);
    }

    #[test]
    fn test_axis_trims_cap_at_half_overlap() {
        // origins 0, 192, 256 with crop 256: overlaps 64 and 192
        let spans = [(0, 256), (192, 256), (256, 256)];
        assert_eq!(axis_trims(&spans, 32), vec![(0, 32), (32, 32), (32, 0)]);
        assert_eq!(axis_trims(&spans, 200), vec![(0, 32), (32, 96), (96, 0)]);
    }
}
