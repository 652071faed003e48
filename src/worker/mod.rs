//! Polling worker pool.
//!
//! `N` long-running loops lease jobs from the queue and dispatch them to
//! the registered batch processors. Errors are retried with a delay up to
//! the job's attempt budget; exhausting it fails the job and asks the
//! orchestrator to fail the campaign. The worker never talks to the state
//! coordinator directly — only through the small [`Orchestrator`] seam.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::join_all;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerSettings;
use crate::errors::StateError;
use crate::models::{
    Campaign, CampaignJob, CampaignStatus, EventSource, JOB_BUSINESS_RETRY, JobStatus, JobType,
};
use crate::processors::{BatchOutcome, BatchProcessor};
use crate::queue::JobQueue;
use crate::shutdown::Shutdown;
use crate::state::StateCoordinator;

/// The slice of the state coordinator the worker is allowed to touch.
/// Keeping it narrow breaks the worker ⇄ coordinator dependency cycle.
pub trait Orchestrator: Send + Sync {
    fn set_campaign_status(
        &self,
        campaign_id: Uuid,
        to: CampaignStatus,
        actor: &str,
        reason: &str,
    ) -> Result<(), StateError>;

    fn set_campaign_error_status(&self, campaign_id: Uuid, error: &str)
    -> Result<(), StateError>;

    fn campaign_details(&self, campaign_id: Uuid) -> Result<Campaign, StateError>;
}

impl Orchestrator for StateCoordinator {
    fn set_campaign_status(
        &self,
        campaign_id: Uuid,
        to: CampaignStatus,
        actor: &str,
        reason: &str,
    ) -> Result<(), StateError> {
        self.transition(campaign_id, to, EventSource::Orchestrator, actor, reason, None)
            .map(|_| ())
    }

    fn set_campaign_error_status(
        &self,
        campaign_id: Uuid,
        error: &str,
    ) -> Result<(), StateError> {
        self.transition(
            campaign_id,
            CampaignStatus::Failed,
            EventSource::Orchestrator,
            "worker",
            error,
            None,
        )
        .map(|_| ())
    }

    fn campaign_details(&self, campaign_id: Uuid) -> Result<Campaign, StateError> {
        self.campaign(campaign_id)
    }
}

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    orchestrator: Arc<dyn Orchestrator>,
    processors: HashMap<JobType, Arc<dyn BatchProcessor>>,
    settings: WorkerSettings,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<JobQueue>,
        orchestrator: Arc<dyn Orchestrator>,
        processors: Vec<Arc<dyn BatchProcessor>>,
        settings: WorkerSettings,
    ) -> Self {
        let processors = processors
            .into_iter()
            .map(|processor| (processor.job_type(), processor))
            .collect();
        Self {
            queue,
            orchestrator,
            processors,
            settings,
        }
    }

    /// Run `count` polling workers until the shutdown handle fires. Blocks
    /// for the lifetime of the pool.
    pub async fn start_workers(self: Arc<Self>, shutdown: Shutdown, count: usize) {
        let mut handles = Vec::with_capacity(count);
        for index in 0..count.max(1) {
            let pool = Arc::clone(&self);
            let shutdown = shutdown.clone();
            let worker_id = format!("{}-{}", self.settings.pool_id, index);
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, shutdown).await;
            }));
        }
        for result in join_all(handles).await {
            if let Err(join_error) = result {
                error!(error = %join_error, "worker task panicked");
            }
        }
    }

    async fn worker_loop(&self, worker_id: String, shutdown: Shutdown) {
        info!(worker_id = %worker_id, "worker started");
        // Sub-second polling is only reachable through test settings.
        let poll = Duration::from_millis((self.settings.poll_interval_seconds * 1000).max(10));
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(worker_id = %worker_id, "worker stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            let job = match self.queue.lease_next(None, &worker_id) {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "failed to poll job queue");
                    continue;
                }
            };
            debug!(
                worker_id = %worker_id,
                job_id = %job.id,
                campaign_id = %job.campaign_id,
                job_type = %job.job_type,
                attempt = job.attempts,
                "job leased"
            );
            self.process_job(job, &worker_id, &shutdown).await;
        }
    }

    async fn process_job(&self, job: CampaignJob, worker_id: &str, shutdown: &Shutdown) {
        let Some(processor) = self.processors.get(&job.job_type) else {
            self.fail_job(
                job,
                &anyhow!("no processor registered for job type"),
                worker_id,
            );
            return;
        };
        let timeout =
            Duration::from_secs(self.settings.job_processing_timeout_minutes * 60)
                .max(Duration::from_secs(1));
        let outcome =
            match tokio::time::timeout(timeout, processor.run(job.campaign_id, shutdown)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow!(
                    "job processing timed out after {} minutes",
                    self.settings.job_processing_timeout_minutes
                )),
            };
        match outcome {
            Ok(outcome) => self.handle_success(job, outcome, worker_id),
            Err(error) => self.handle_error(job, &error, worker_id),
        }
    }

    fn handle_success(&self, mut job: CampaignJob, outcome: BatchOutcome, worker_id: &str) {
        job.status = JobStatus::Completed;
        job.business_status = None;
        job.last_error = None;
        job.updated_at = Utc::now();

        if !outcome.done {
            let successor = CampaignJob::new(job.campaign_id, job.job_type, job.max_attempts);
            if let Err(e) = self.queue.create(&successor) {
                error!(
                    worker_id,
                    job_id = %job.id,
                    error = %e,
                    "failed to enqueue successor job, returning current job for retry"
                );
                self.requeue_with_retry(job, "failed to enqueue successor job");
                return;
            }
            if let Err(e) = self.queue.update(&job) {
                warn!(worker_id, job_id = %job.id, error = %e, "failed to complete job");
                self.requeue_with_retry(job, "failed to persist completion");
            }
            return;
        }

        if let Err(e) = self.queue.update(&job) {
            warn!(worker_id, job_id = %job.id, error = %e, "failed to complete job");
            self.requeue_with_retry(job, "failed to persist completion");
            return;
        }
        self.maybe_complete_campaign(job.campaign_id, worker_id);
    }

    /// Batch done and no work left anywhere for the campaign: settle it as
    /// completed. Written to be idempotent — a sibling worker may have won
    /// the race.
    fn maybe_complete_campaign(&self, campaign_id: Uuid, worker_id: &str) {
        let active = match self.queue.count_active_for_campaign(campaign_id) {
            Ok(active) => active,
            Err(e) => {
                error!(worker_id, campaign_id = %campaign_id, error = %e, "failed to count active jobs");
                return;
            }
        };
        if active > 0 {
            return;
        }
        let campaign = match self.orchestrator.campaign_details(campaign_id) {
            Ok(campaign) => campaign,
            Err(e) => {
                error!(worker_id, campaign_id = %campaign_id, error = %e, "failed to load campaign");
                return;
            }
        };
        if campaign.status != CampaignStatus::Running {
            return;
        }
        match self.orchestrator.set_campaign_status(
            campaign_id,
            CampaignStatus::Completed,
            worker_id,
            "all jobs complete",
        ) {
            Ok(()) => info!(worker_id, campaign_id = %campaign_id, "campaign completed"),
            Err(StateError::InvalidTransition { .. }) => {
                debug!(campaign_id = %campaign_id, "campaign already settled elsewhere");
            }
            Err(e) => {
                error!(worker_id, campaign_id = %campaign_id, error = %e, "failed to complete campaign");
            }
        }
    }

    fn handle_error(&self, job: CampaignJob, error: &anyhow::Error, worker_id: &str) {
        warn!(
            worker_id,
            job_id = %job.id,
            campaign_id = %job.campaign_id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            error = %format!("{error:#}"),
            "job attempt failed"
        );
        if job.attempts >= job.max_attempts {
            self.fail_job(job, error, worker_id);
        } else {
            self.requeue_with_retry(job, &format!("{error:#}"));
        }
    }

    /// Terminal failure: mark the job failed and move the campaign to
    /// `failed`. A campaign that already left the running state keeps its
    /// status (failure is recorded exactly once).
    fn fail_job(&self, mut job: CampaignJob, error: &anyhow::Error, worker_id: &str) {
        job.status = JobStatus::Failed;
        job.business_status = None;
        job.last_error = Some(format!("{error:#}"));
        job.updated_at = Utc::now();
        if let Err(e) = self.queue.update(&job) {
            error!(
                worker_id,
                job_id = %job.id,
                error = %e,
                "CRITICAL: failed to persist job failure"
            );
        }
        match self
            .orchestrator
            .set_campaign_error_status(job.campaign_id, &format!("{error:#}"))
        {
            Ok(()) => {
                info!(worker_id, campaign_id = %job.campaign_id, "campaign failed");
            }
            Err(StateError::InvalidTransition { .. }) => {
                debug!(
                    campaign_id = %job.campaign_id,
                    "campaign not in a failable state, leaving status as is"
                );
            }
            Err(e) => {
                error!(worker_id, campaign_id = %job.campaign_id, error = %e, "failed to fail campaign");
            }
        }
    }

    fn requeue_with_retry(&self, mut job: CampaignJob, reason: &str) {
        job.status = JobStatus::Queued;
        job.business_status = Some(JOB_BUSINESS_RETRY.to_string());
        job.next_execution_at = Utc::now()
            + ChronoDuration::seconds(self.settings.error_retry_delay_seconds as i64);
        job.last_error = Some(reason.to_string());
        job.updated_at = Utc::now();
        if let Err(e) = self.queue.update(&job) {
            error!(
                job_id = %job.id,
                error = %e,
                "CRITICAL: failed to return job to the queue for retry"
            );
        }
    }
}
