//! Request lifecycle: tile and register on start, merge and hand off on
//! completion.
//!
//! A request moves `Created -> AwaitingResults -> Finalized`. The only
//! suspension point is between [`InferenceOrchestrator::start`] returning a
//! [`WorkOrder`] and the host delivering the matching [`Completion`]; the job
//! state in between lives in the [`RequestStore`], never in captured
//! continuations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use ndarray::{Array2, Array4, ArrayD};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TilingParameters;
use crate::error::{TilingError, TilingResult};
use crate::geometry::compute_tiles_for;
use crate::job::{resolve_request_id, OutputFormat, SourceMetadataRef, TilingJob};
use crate::merger::{merge, MergedOutput, TileOutput};
use crate::reshape::{TilePrompt, TileReshaper};
use crate::splitter::split;
use crate::store::{OutstandingJob, RequestStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Created,
    AwaitingResults,
    /// Checked out of the store while merge and writing run.
    Finalizing,
    Finalized,
}

pub struct StartRequest {
    /// `None` selects the offline sentinel id.
    pub request_id: Option<String>,
    /// `(batch, channels, height, width)`
    pub source: Array4<f32>,
    pub output_format: OutputFormat,
    pub source_metadata: SourceMetadataRef,
}

/// Job-scoped message handed to the inference boundary. Prompts are ordered
/// image-major, then by canonical tile index.
#[derive(Debug)]
pub struct WorkOrder {
    pub request_id: String,
    pub prompts: Vec<TilePrompt>,
}

/// Message from the inference boundary carrying every tile output of one job,
/// in the order of the work order's prompts.
#[derive(Debug)]
pub struct Completion {
    pub request_id: Option<String>,
    pub outputs: Vec<ArrayD<f32>>,
}

/// Label map for one image, handed to the raster writer.
pub struct LabelRaster<'a> {
    pub request_id: &'a str,
    pub image_index: usize,
    pub labels: &'a Array2<u32>,
    pub output_format: OutputFormat,
    pub source_metadata: &'a SourceMetadataRef,
}

/// External collaborator responsible for on-disk format and georeferencing.
/// Returns whatever locates the result for the caller (a path, an encoded
/// payload, ...).
pub trait RasterWriter: Send + Sync {
    fn write(&self, raster: &LabelRaster<'_>) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestOutput {
    pub request_id: String,
    pub data_format: OutputFormat,
    /// One writer result per image in the request.
    pub data: Vec<String>,
}

pub struct InferenceOrchestrator {
    params: TilingParameters,
    store: Arc<RequestStore>,
    reshaper: Arc<dyn TileReshaper>,
    writer: Arc<dyn RasterWriter>,
}

impl InferenceOrchestrator {
    pub fn new(
        params: TilingParameters,
        store: Arc<RequestStore>,
        reshaper: Arc<dyn TileReshaper>,
        writer: Arc<dyn RasterWriter>,
    ) -> TilingResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            store,
            reshaper,
            writer,
        })
    }

    pub fn params(&self) -> &TilingParameters {
        &self.params
    }

    pub fn store(&self) -> &Arc<RequestStore> {
        &self.store
    }

    /// Tile the source, register the job and return the prompts to run.
    /// Nothing is registered if any step before `begin` fails.
    pub fn start(&self, request: StartRequest) -> TilingResult<WorkOrder> {
        let started = Instant::now();
        let request_id = resolve_request_id(request.request_id.as_deref());
        let (batch_size, _channels, image_height, image_width) = request.source.dim();
        if batch_size == 0 {
            return Err(TilingError::DimensionMismatch(
                "source tensor holds no images".to_string(),
            ));
        }

        let placements = compute_tiles_for(image_height, image_width, &self.params.crop_spec())?;
        let tiles = split(request.source.view(), &placements, image_height, image_width)?;
        let prompts = tiles
            .iter()
            .map(|tile| self.reshaper.reshape(tile))
            .collect::<TilingResult<Vec<_>>>()?;

        let tile_count = placements.len();
        let job = TilingJob {
            request_id: request_id.clone(),
            tile_placements: placements,
            image_height,
            image_width,
            batch_size,
            delta: self.params.delta,
            output_format: request.output_format,
            source_metadata: request.source_metadata,
            created_at: Utc::now(),
        };
        debug!(request_id = %request_id, phase = ?JobPhase::Created, "Tiling job created");
        self.store.begin(&request_id, job)?;

        info!(
            request_id = %request_id,
            phase = ?JobPhase::AwaitingResults,
            tiles = tile_count,
            batch_size,
            image_height,
            image_width,
            reshaper = self.reshaper.family(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Dispatched tiles for inference"
        );

        Ok(WorkOrder {
            request_id,
            prompts,
        })
    }

    /// Merge a job's outputs, write one label map per image and release the
    /// job. On any failure, including a panicking writer, the job stays
    /// registered so the call can be retried.
    pub fn finalize(&self, completion: Completion) -> TilingResult<RequestOutput> {
        let started = Instant::now();
        let request_id = resolve_request_id(completion.request_id.as_deref());
        let checked_out = self.store.checkout(&request_id)?;

        match self.finalize_checked_out(checked_out.job(), completion.outputs) {
            Ok(data) => {
                let job = checked_out.commit()?;
                info!(
                    request_id = %request_id,
                    phase = ?JobPhase::Finalized,
                    images = data.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Finalized tiling job"
                );
                Ok(RequestOutput {
                    request_id,
                    data_format: job.output_format,
                    data,
                })
            }
            Err(err) => {
                drop(checked_out);
                warn!(
                    request_id = %request_id,
                    error = %err,
                    "Finalization failed; job kept for retry"
                );
                Err(err)
            }
        }
    }

    fn finalize_checked_out(
        &self,
        job: &TilingJob,
        outputs: Vec<ArrayD<f32>>,
    ) -> TilingResult<Vec<String>> {
        let expected = job.expected_outputs();
        if outputs.len() < expected {
            return Err(TilingError::IncompleteJob {
                request_id: job.request_id.clone(),
                expected,
                delivered: outputs.len(),
            });
        }
        if outputs.len() > expected {
            return Err(TilingError::CardinalityMismatch {
                expected,
                actual: outputs.len(),
            });
        }

        let per_image = job.tile_placements.len();
        let tile_outputs = outputs
            .into_iter()
            .enumerate()
            .map(|(i, raw)| TileOutput::from_raw(job.tile_placements[i % per_image], raw))
            .collect::<TilingResult<Vec<_>>>()?;

        let merged = merge(job, &tile_outputs)?;
        merged
            .iter()
            .map(|image| self.write_labels(job, image))
            .collect()
    }

    fn write_labels(&self, job: &TilingJob, image: &MergedOutput) -> TilingResult<String> {
        let labels = image.label_map();
        let raster = LabelRaster {
            request_id: &job.request_id,
            image_index: image.image_index,
            labels: &labels,
            output_format: job.output_format,
            source_metadata: &job.source_metadata,
        };
        self.writer
            .write(&raster)
            .map_err(|e| TilingError::Writer(format!("{e:#}")))
    }

    pub fn phase(&self, request_id: &str) -> Option<JobPhase> {
        self.store.finalizing(request_id).map(|finalizing| {
            if finalizing {
                JobPhase::Finalizing
            } else {
                JobPhase::AwaitingResults
            }
        })
    }

    pub fn cancel(&self, request_id: Option<&str>) -> TilingResult<()> {
        let request_id = resolve_request_id(request_id);
        self.store.cancel(&request_id).map(|_| ())
    }

    pub fn evict_expired(&self) -> Vec<String> {
        self.store.evict_expired(Utc::now())
    }

    pub fn outstanding(&self) -> Vec<OutstandingJob> {
        self.store.outstanding()
    }

    /// Periodically evict expired jobs until `cancel` fires. A no-op loop
    /// under the manual policy.
    pub fn spawn_reaper(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = store.evict_expired(Utc::now());
                        if !evicted.is_empty() {
                            warn!(
                                count = evicted.len(),
                                remaining = store.len(),
                                "Reaper evicted stale tiling jobs"
                            );
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!("Tiling job reaper stopped");
                        return;
                    }
                }
            }
        })
    }
}
