use ndarray::{s, Array3, ArrayView4};

use crate::error::{TilingError, TilingResult};
use crate::geometry::TilePlacement;

/// One crop of one image in a request batch, ready for reshaping.
#[derive(Debug, Clone, PartialEq)]
pub struct TileInput {
    /// Position of the source image within the request batch.
    pub image_index: usize,
    /// Canonical index of `placement` within the image's tile sequence.
    pub tile_index: usize,
    pub placement: TilePlacement,
    /// `(channels, height, width)` slice of the source.
    pub data: Array3<f32>,
}

/// Slice a `(batch, channels, H, W)` source into tiles, image-major and in
/// placement order. `image_height`/`image_width` are the dimensions the
/// placements were computed for.
pub fn split(
    source: ArrayView4<'_, f32>,
    placements: &[TilePlacement],
    image_height: usize,
    image_width: usize,
) -> TilingResult<Vec<TileInput>> {
    let (batch, _channels, src_h, src_w) = source.dim();
    if src_h != image_height || src_w != image_width {
        return Err(TilingError::DimensionMismatch(format!(
            "source tensor is {src_h}x{src_w} but tiles were computed for {image_height}x{image_width}"
        )));
    }
    if let Some(bad) = placements
        .iter()
        .find(|p| !p.fits_within(image_height, image_width))
    {
        return Err(TilingError::DimensionMismatch(format!(
            "placement at ({}, {}) of size {}x{} exceeds {image_height}x{image_width} image",
            bad.row_offset, bad.col_offset, bad.height, bad.width
        )));
    }

    let mut tiles = Vec::with_capacity(batch * placements.len());
    for image_index in 0..batch {
        let image = source.index_axis(ndarray::Axis(0), image_index);
        for (tile_index, placement) in placements.iter().enumerate() {
            let data = image
                .slice(s![
                    ..,
                    placement.row_offset..placement.row_end(),
                    placement.col_offset..placement.col_end()
                ])
                .to_owned();
            tiles.push(TileInput {
                image_index,
                tile_index,
                placement: *placement,
                data,
            });
        }
    }

    Ok(tiles)
}
