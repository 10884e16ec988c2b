//! Keyed store of in-flight tiling jobs.
//!
//! Jobs live here between request start and finalization. Distinct request
//! ids never contend on a global lock (the map is sharded); operations on the
//! same id are serialized by the shard lock.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{TilingError, TilingResult};
use crate::job::TilingJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Jobs leave the store only through finalization or `cancel`.
    Manual,
    /// Jobs older than the given age are dropped by `evict_expired`.
    Ttl(Duration),
}

struct JobSlot {
    job: Arc<TilingJob>,
    finalizing: bool,
}

/// Visible record of a job still held by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutstandingJob {
    pub request_id: String,
    pub created_at: DateTime<Utc>,
    pub finalizing: bool,
}

pub struct RequestStore {
    jobs: DashMap<String, JobSlot>,
    policy: EvictionPolicy,
}

fn into_owned(job: Arc<TilingJob>) -> TilingJob {
    Arc::try_unwrap(job).unwrap_or_else(|shared| (*shared).clone())
}

impl RequestStore {
    pub fn new(policy: EvictionPolicy) -> Self {
        Self {
            jobs: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.policy
    }

    /// Register a job. Never overwrites: an id with an outstanding job fails.
    pub fn begin(&self, request_id: &str, job: TilingJob) -> TilingResult<()> {
        match self.jobs.entry(request_id.to_string()) {
            Entry::Occupied(_) => Err(TilingError::DuplicateRequest(request_id.to_string())),
            Entry::Vacant(vacant) => {
                debug!(
                    request_id,
                    tiles = job.tile_placements.len(),
                    batch_size = job.batch_size,
                    "Registered tiling job"
                );
                vacant.insert(JobSlot {
                    job: Arc::new(job),
                    finalizing: false,
                });
                Ok(())
            }
        }
    }

    /// Remove and return the job in one step.
    pub fn take(&self, request_id: &str) -> TilingResult<TilingJob> {
        let job = self.remove_idle(request_id)?;
        debug!(request_id, "Took tiling job");
        Ok(job)
    }

    /// Drop a job whose request was aborted before finalization.
    pub fn cancel(&self, request_id: &str) -> TilingResult<TilingJob> {
        let job = self.remove_idle(request_id)?;
        info!(request_id, "Cancelled tiling job");
        Ok(job)
    }

    fn remove_idle(&self, request_id: &str) -> TilingResult<TilingJob> {
        match self.jobs.entry(request_id.to_string()) {
            Entry::Vacant(_) => Err(TilingError::RequestNotFound(request_id.to_string())),
            Entry::Occupied(occupied) => {
                if occupied.get().finalizing {
                    return Err(TilingError::FinalizationInProgress(request_id.to_string()));
                }
                let (_, slot) = occupied.remove_entry();
                Ok(into_owned(slot.job))
            }
        }
    }

    /// Mark the job as being finalized and hand it out while it stays in the
    /// store. The returned guard removes the job on [`CheckedOut::commit`];
    /// dropping it any other way (an error return or a panic unwinding
    /// through the caller) returns the job to idle so it can be retried,
    /// cancelled or evicted.
    pub fn checkout(&self, request_id: &str) -> TilingResult<CheckedOut<'_>> {
        let mut slot = self
            .jobs
            .get_mut(request_id)
            .ok_or_else(|| TilingError::RequestNotFound(request_id.to_string()))?;
        if slot.finalizing {
            return Err(TilingError::FinalizationInProgress(request_id.to_string()));
        }
        slot.finalizing = true;
        Ok(CheckedOut {
            store: self,
            request_id: request_id.to_string(),
            job: Arc::clone(&slot.job),
            committed: false,
        })
    }

    /// `Some(true)` while checked out, `Some(false)` while idle, `None` if absent.
    pub fn finalizing(&self, request_id: &str) -> Option<bool> {
        self.jobs.get(request_id).map(|slot| slot.finalizing)
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.jobs.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Snapshot of every job still held, oldest first.
    pub fn outstanding(&self) -> Vec<OutstandingJob> {
        let mut jobs: Vec<OutstandingJob> = self
            .jobs
            .iter()
            .map(|entry| OutstandingJob {
                request_id: entry.key().clone(),
                created_at: entry.job.created_at,
                finalizing: entry.finalizing,
            })
            .collect();
        jobs.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.request_id.cmp(&b.request_id))
        });
        jobs
    }

    /// Under a TTL policy, drop idle jobs created more than the TTL before
    /// `now`. Returns the evicted ids. Jobs mid-finalization are kept.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let EvictionPolicy::Ttl(ttl) = self.policy else {
            return Vec::new();
        };

        let mut evicted = Vec::new();
        self.jobs.retain(|request_id, slot| {
            let age = now - slot.job.created_at;
            if slot.finalizing || age <= ttl {
                return true;
            }
            warn!(
                request_id = %request_id,
                age_secs = age.num_seconds(),
                tiles = slot.job.tile_placements.len(),
                "Evicting tiling job that was never finalized"
            );
            evicted.push(request_id.clone());
            false
        });
        evicted.sort();
        evicted
    }
}

impl Default for RequestStore {
    fn default() -> Self {
        Self::new(EvictionPolicy::Manual)
    }
}

/// A job held for finalization. See [`RequestStore::checkout`].
pub struct CheckedOut<'a> {
    store: &'a RequestStore,
    request_id: String,
    job: Arc<TilingJob>,
    committed: bool,
}

impl CheckedOut<'_> {
    pub fn job(&self) -> &TilingJob {
        &self.job
    }

    /// Remove the job from the store for good.
    pub fn commit(mut self) -> TilingResult<Arc<TilingJob>> {
        self.committed = true;
        let (_, slot) = self
            .store
            .jobs
            .remove(&self.request_id)
            .ok_or_else(|| TilingError::RequestNotFound(self.request_id.clone()))?;
        Ok(slot.job)
    }
}

impl Drop for CheckedOut<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(mut slot) = self.store.jobs.get_mut(&self.request_id) {
            slot.finalizing = false;
            debug!(request_id = %self.request_id, "Released tiling job for retry");
        }
    }
}
