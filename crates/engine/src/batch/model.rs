//! Batch records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use batchflow_core::{BatchId, DomainError, DomainResult, JobId, Versioned};

/// A durable record representing one bulk operation split into many jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    /// Operation discriminator, e.g. `set-external-task-retries`.
    pub batch_type: String,
    /// Number of chunk jobs the batch will create in total.
    pub total_jobs: u32,
    /// Chunk jobs created so far; never exceeds `total_jobs`.
    pub jobs_created: u32,
    pub jobs_per_seed: u32,
    /// Entity ids per chunk job, fixed when the batch is enqueued.
    pub chunk_size: u32,
    /// Operation parameters plus the ids not yet handed out to chunk jobs.
    pub configuration: Value,
    pub seed_job_id: Option<JobId>,
    pub monitor_job_id: Option<JobId>,
    pub suspended: bool,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl Batch {
    pub fn new(
        batch_type: impl Into<String>,
        total_jobs: u32,
        jobs_per_seed: u32,
        chunk_size: u32,
        configuration: Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: BatchId::new(),
            batch_type: batch_type.into(),
            total_jobs,
            jobs_created: 0,
            jobs_per_seed: jobs_per_seed.max(1),
            chunk_size: chunk_size.max(1),
            configuration,
            seed_job_id: None,
            monitor_job_id: None,
            suspended: false,
            created_at: now,
            version: 1,
        }
    }

    /// Chunk jobs still to be created by seed invocations.
    pub fn jobs_to_create(&self) -> u32 {
        self.total_jobs.saturating_sub(self.jobs_created)
    }

    pub fn is_fully_seeded(&self) -> bool {
        self.jobs_created >= self.total_jobs
    }

    /// Account for `count` newly created chunk jobs.
    pub fn record_jobs_created(&mut self, count: u32) -> DomainResult<()> {
        let created = self.jobs_created.saturating_add(count);
        if created > self.total_jobs {
            return Err(DomainError::validation(format!(
                "batch {} would create {created} jobs but only {} are planned",
                self.id, self.total_jobs
            )));
        }
        self.jobs_created = created;
        Ok(())
    }
}

impl Versioned for Batch {
    type Id = BatchId;

    fn id(&self) -> &BatchId {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Number of chunk jobs needed for `entity_count` ids: `ceil(entity_count / chunk_size)`.
pub fn chunk_count(entity_count: usize, chunk_size: u32) -> u32 {
    let chunk_size = chunk_size.max(1) as usize;
    u32::try_from(entity_count.div_ceil(chunk_size)).unwrap_or(u32::MAX)
}

/// Payload of seed and monitor jobs: a reference to their batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJobPayload {
    pub batch_id: BatchId,
}

impl BatchJobPayload {
    pub fn to_value(self) -> Value {
        serde_json::json!({ "batchId": self.batch_id })
    }

    pub fn from_value(payload: &Value) -> Result<Self, serde_json::Error> {
        Self::deserialize(payload)
    }
}

/// Handle returned when a batch is enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchHandle {
    pub id: BatchId,
    pub total_jobs: u32,
}

/// Runtime view of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStatus {
    pub id: BatchId,
    pub batch_type: String,
    pub total_jobs: u32,
    pub jobs_created: u32,
    /// Chunk jobs not yet created plus chunk jobs still in the store.
    pub jobs_remaining: u32,
    /// Chunk jobs whose retries are exhausted.
    pub failed_jobs: u32,
    pub incidents: u32,
    pub suspended: bool,
}

/// History entry written when a batch completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedBatch {
    pub id: BatchId,
    pub batch_type: String,
    pub total_jobs: u32,
    pub created_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl CompletedBatch {
    pub fn from_batch(batch: &Batch, ended_at: DateTime<Utc>) -> Self {
        Self {
            id: batch.id,
            batch_type: batch.batch_type.clone(),
            total_jobs: batch.total_jobs,
            created_at: batch.created_at,
            ended_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(0, 2), 0);
        assert_eq!(chunk_count(3, 2), 2);
        assert_eq!(chunk_count(4, 2), 2);
        assert_eq!(chunk_count(5, 0), 5);
    }

    #[test]
    fn jobs_created_never_exceeds_total() {
        let mut batch = Batch::new("op", 3, 10, 2, serde_json::json!({}), Utc::now());

        batch.record_jobs_created(2).unwrap();
        assert_eq!(batch.jobs_to_create(), 1);

        assert!(batch.record_jobs_created(2).is_err());
        assert_eq!(batch.jobs_created, 2);

        batch.record_jobs_created(1).unwrap();
        assert!(batch.is_fully_seeded());
    }

    #[test]
    fn payload_round_trips() {
        let payload = BatchJobPayload {
            batch_id: BatchId::new(),
        };
        let decoded = BatchJobPayload::from_value(&payload.to_value()).unwrap();
        assert_eq!(decoded, payload);
    }
}
