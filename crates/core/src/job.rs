use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geometry::TilePlacement;

/// Reserved request id for offline mode, where the caller guarantees at most
/// one outstanding job. Concurrent use of this id is a caller error and is not
/// detected beyond the usual duplicate check.
pub const OFFLINE_REQUEST_ID: &str = "offline";

pub fn resolve_request_id(request_id: Option<&str>) -> String {
    match request_id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => OFFLINE_REQUEST_ID.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Path,
    B64Json,
}

/// Opaque handle to the source raster's metadata. The core never looks inside;
/// it only carries the handle from request start to the raster writer.
#[derive(Clone)]
pub struct SourceMetadataRef(Arc<dyn Any + Send + Sync>);

impl SourceMetadataRef {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for SourceMetadataRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SourceMetadataRef(..)")
    }
}

/// State kept between request start and finalization.
#[derive(Debug, Clone)]
pub struct TilingJob {
    pub request_id: String,
    /// Placements for one image; every image in the batch shares them.
    pub tile_placements: Vec<TilePlacement>,
    pub image_height: usize,
    pub image_width: usize,
    /// Number of images in the request.
    pub batch_size: usize,
    pub delta: usize,
    pub output_format: OutputFormat,
    pub source_metadata: SourceMetadataRef,
    pub created_at: DateTime<Utc>,
}

impl TilingJob {
    /// Tile outputs required before the job can be merged.
    pub fn expected_outputs(&self) -> usize {
        self.tile_placements.len() * self.batch_size
    }
}
