use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::Engine as _;
use serde::Serialize;
use tracing::debug;

use tessera_core::job::OutputFormat;
use tessera_core::orchestrator::{LabelRaster, RasterWriter};

/// Metadata the app threads through a request so the writer can name its
/// output after the source.
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub filename: String,
}

#[derive(Serialize)]
struct LabelRecord<'a> {
    request_id: &'a str,
    image_index: usize,
    height: usize,
    width: usize,
    labels: Vec<Vec<u32>>,
}

/// Writes label maps as JSON documents. `path` requests land in the output
/// directory; `b64_json` requests return the document base64-encoded.
pub struct JsonLabelWriter {
    output_dir: PathBuf,
}

impl JsonLabelWriter {
    pub fn new(output_dir: &Path) -> Result<Self> {
        fs::create_dir_all(output_dir).with_context(|| {
            format!("failed to create output directory: {}", output_dir.display())
        })?;
        Ok(Self {
            output_dir: output_dir.to_path_buf(),
        })
    }

    fn file_stem(raster: &LabelRaster<'_>) -> String {
        let base = raster
            .source_metadata
            .downcast_ref::<SourceDescriptor>()
            .map(|source| source.filename.clone())
            .unwrap_or_else(|| raster.request_id.to_string());
        format!("{base}_{}_prediction", raster.image_index)
    }
}

impl RasterWriter for JsonLabelWriter {
    fn write(&self, raster: &LabelRaster<'_>) -> Result<String> {
        let (height, width) = raster.labels.dim();
        let record = LabelRecord {
            request_id: raster.request_id,
            image_index: raster.image_index,
            height,
            width,
            labels: raster
                .labels
                .rows()
                .into_iter()
                .map(|row| row.to_vec())
                .collect(),
        };
        let encoded = serde_json::to_vec(&record).context("failed to encode label map")?;

        match raster.output_format {
            OutputFormat::Path => {
                let path = self.output_dir.join(format!("{}.json", Self::file_stem(raster)));
                fs::write(&path, &encoded)
                    .with_context(|| format!("failed to write label map: {}", path.display()))?;
                debug!(path = %path.display(), "Wrote label map");
                let resolved = path.canonicalize().unwrap_or(path);
                Ok(resolved.display().to_string())
            }
            OutputFormat::B64Json => {
                Ok(base64::engine::general_purpose::STANDARD.encode(&encoded))
            }
        }
    }
}
