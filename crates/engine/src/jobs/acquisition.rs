//! Job acquisition: select due jobs and claim them with a compare-and-swap.
//!
//! Acquirers may run in different processes against the same store, so the
//! version check in [`JobRecordStore::commit`] is what makes a lock exclusive.
//! Losing a race is normal and only means the job is skipped this cycle.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::store::{DueJobFilter, JobRecordStore, StoreError};
use super::types::Job;
use crate::config::to_chrono;

/// Jobs locked by one acquisition cycle.
#[derive(Debug, Default)]
pub struct AcquiredJobs {
    pub jobs: Vec<Job>,
    /// Candidates another acquirer claimed (or changed) first.
    pub lost_races: usize,
}

#[derive(Debug, Clone)]
pub struct JobAcquirer<S> {
    store: S,
    owner: String,
    lock_duration: Duration,
}

impl<S: JobRecordStore> JobAcquirer<S> {
    pub fn new(store: S, owner: impl Into<String>, lock_duration: Duration) -> Self {
        Self {
            store,
            owner: owner.into(),
            lock_duration,
        }
    }

    /// Select up to `limit` due jobs and lock as many as possible.
    pub fn acquire(&self, limit: usize) -> Result<AcquiredJobs, StoreError> {
        let mut acquired = AcquiredJobs::default();
        if limit == 0 {
            return Ok(acquired);
        }

        let now = Utc::now();
        let candidates = self.store.select_due(&DueJobFilter::at(now), limit)?;
        for candidate in candidates {
            match self.try_lock(candidate, now)? {
                Some(job) => acquired.jobs.push(job),
                None => acquired.lost_races += 1,
            }
        }
        Ok(acquired)
    }

    /// Lock a previously selected job. `None` means another acquirer won.
    pub fn try_lock(&self, mut candidate: Job, now: DateTime<Utc>) -> Result<Option<Job>, StoreError> {
        let job_id = candidate.id;
        candidate.lock(self.owner.clone(), now + to_chrono(self.lock_duration));

        match self.store.update_job(&candidate) {
            Ok(locked) => {
                debug!(job_id = %job_id, owner = %self.owner, kind = %locked.kind(), "job locked");
                Ok(Some(locked))
            }
            Err(err) if err.is_conflict() => {
                debug!(job_id = %job_id, owner = %self.owner, "lost acquisition race");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}
