//! Partitioning of an image into overlapping, edge-aligned crops.
//!
//! Placement order produced here is canonical: splitting, the request store
//! and merging all refer to a tile by its index in this sequence.

use serde::{Deserialize, Serialize};

use crate::error::{TilingError, TilingResult};

/// A crop window in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TilePlacement {
    pub row_offset: usize,
    pub col_offset: usize,
    pub height: usize,
    pub width: usize,
    /// Position of `row_offset` in the grid of row origins.
    pub row_index: usize,
    /// Position of `col_offset` in the grid of column origins.
    pub col_index: usize,
}

impl TilePlacement {
    pub fn row_end(&self) -> usize {
        self.row_offset + self.height
    }

    pub fn col_end(&self) -> usize {
        self.col_offset + self.width
    }

    pub fn fits_within(&self, image_height: usize, image_width: usize) -> bool {
        self.row_end() <= image_height && self.col_end() <= image_width
    }
}

/// Crop and stride for both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropSpec {
    pub h_crop: usize,
    pub w_crop: usize,
    pub h_stride: usize,
    pub w_stride: usize,
}

/// Origins along one axis: `0, stride, 2*stride, ...` while the crop ends
/// strictly inside the image, followed by the origin that puts the last crop
/// flush against the far edge.
pub fn axis_origins(
    extent: usize,
    crop: usize,
    stride: usize,
    axis: &str,
) -> TilingResult<Vec<usize>> {
    if crop == 0 {
        return Err(TilingError::TileGeometry(format!(
            "{axis} crop must be positive"
        )));
    }
    if stride == 0 {
        return Err(TilingError::TileGeometry(format!(
            "{axis} stride must be positive"
        )));
    }
    if stride > crop {
        return Err(TilingError::TileGeometry(format!(
            "{axis} stride ({stride}) exceeds crop ({crop}); tiles would leave gaps"
        )));
    }
    if extent < crop {
        return Err(TilingError::TileGeometry(format!(
            "image {axis} ({extent}) is smaller than crop ({crop})"
        )));
    }

    let mut origins = Vec::with_capacity(extent / stride + 1);
    let mut origin = 0usize;
    while origin + crop < extent {
        origins.push(origin);
        origin += stride;
    }
    // Every generated origin ends short of the edge, so the flush origin is new.
    origins.push(extent - crop);

    Ok(origins)
}

/// Compute the ordered tile placements covering an `image_height x image_width`
/// image, row-major over the cross product of row and column origins.
pub fn compute_tiles(
    image_height: usize,
    image_width: usize,
    h_crop: usize,
    w_crop: usize,
    h_stride: usize,
    w_stride: usize,
) -> TilingResult<Vec<TilePlacement>> {
    let rows = axis_origins(image_height, h_crop, h_stride, "height")?;
    let cols = axis_origins(image_width, w_crop, w_stride, "width")?;

    let mut placements = Vec::with_capacity(rows.len() * cols.len());
    for (row_index, &row_offset) in rows.iter().enumerate() {
        for (col_index, &col_offset) in cols.iter().enumerate() {
            placements.push(TilePlacement {
                row_offset,
                col_offset,
                height: h_crop,
                width: w_crop,
                row_index,
                col_index,
            });
        }
    }

    Ok(placements)
}

/// [`compute_tiles`] with the crop parameters bundled.
pub fn compute_tiles_for(
    image_height: usize,
    image_width: usize,
    crop: &CropSpec,
) -> TilingResult<Vec<TilePlacement>> {
    compute_tiles(
        image_height,
        image_width,
        crop.h_crop,
        crop.w_crop,
        crop.h_stride,
        crop.w_stride,
    )
}
