//! Persistent at-least-once job queue.
//!
//! Jobs live in `campaign_jobs`; a lease claims the oldest eligible row and
//! flips it to `running` in one transaction, so concurrent workers can never
//! double-lease. Eligible means `queued` (fresh or flagged `retry`) with a
//! due `next_execution_at`.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::{CampaignJob, JobStatus, JobType};
use crate::store::jobs::JobFilter;
use crate::store::{CampaignStore, jobs, ts_text};

pub struct JobQueue {
    store: Arc<CampaignStore>,
}

impl JobQueue {
    pub fn new(store: Arc<CampaignStore>) -> Self {
        Self { store }
    }

    /// Enqueue a job. The caller builds it via [`CampaignJob::new`], which
    /// makes it immediately eligible.
    pub fn create(&self, job: &CampaignJob) -> Result<(), StoreError> {
        let conn = self.store.lock()?;
        jobs::insert(&conn, job)?;
        debug!(job_id = %job.id, campaign_id = %job.campaign_id, job_type = %job.job_type, "job enqueued");
        Ok(())
    }

    /// Atomically claim the oldest eligible job for this worker. Attempts
    /// are counted at lease time: a leased job has already consumed one.
    pub fn lease_next(
        &self,
        job_types: Option<&[JobType]>,
        worker_id: &str,
    ) -> Result<Option<CampaignJob>, StoreError> {
        let now = Utc::now();
        self.store.with_tx(|tx| {
            let Some(mut job) = jobs::next_eligible(tx, job_types, &ts_text(now))? else {
                return Ok(None);
            };
            job.status = JobStatus::Running;
            job.attempts += 1;
            job.processing_server_id = Some(worker_id.to_string());
            job.updated_at = now;
            jobs::update(tx, &job)?;
            Ok(Some(job))
        })
    }

    pub fn update(&self, job: &CampaignJob) -> Result<(), StoreError> {
        let conn = self.store.lock()?;
        jobs::update(&conn, job)
    }

    pub fn get(&self, id: Uuid) -> Result<CampaignJob, StoreError> {
        let conn = self.store.lock()?;
        jobs::get(&conn, id)
    }

    pub fn list(&self, filter: &JobFilter) -> Result<Vec<CampaignJob>, StoreError> {
        let conn = self.store.lock()?;
        jobs::list(&conn, filter)
    }

    /// Jobs still queued, retrying, or running for the campaign.
    pub fn count_active_for_campaign(&self, campaign_id: Uuid) -> Result<i64, StoreError> {
        let conn = self.store.lock()?;
        jobs::count_active_for_campaign(&conn, campaign_id)
    }
}
