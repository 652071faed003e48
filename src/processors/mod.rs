//! Per-phase batch processors.
//!
//! Each phase implements [`BatchProcessor`]: one invocation runs exactly one
//! batch of work for one campaign and reports whether the phase still has
//! work left. The worker pool owns scheduling; processors own semantics.

mod dns;
mod generation;
mod http_keyword;

pub use dns::DnsProcessor;
pub use generation::GenerationProcessor;
pub use http_keyword::HttpKeywordProcessor;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{StateError, StoreError};
use crate::events::{CampaignEvent, EventPublisher};
use crate::models::{Campaign, CampaignJob, CampaignPhase, CampaignStatus, EventSource, JobType};
use crate::shutdown::Shutdown;
use crate::state::StateCoordinator;
use crate::store::{CampaignStore, campaigns, jobs};

/// Result of one batch invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// `true` when the phase has no work left after this batch.
    pub done: bool,
    /// Items handled by this invocation.
    pub processed: u64,
}

impl BatchOutcome {
    pub fn done(processed: u64) -> Self {
        Self {
            done: true,
            processed,
        }
    }

    pub fn more(processed: u64) -> Self {
        Self {
            done: false,
            processed,
        }
    }
}

#[async_trait]
pub trait BatchProcessor: Send + Sync {
    fn job_type(&self) -> JobType;

    /// Run one batch for the campaign. Errors are retried by the worker up
    /// to the job's attempt budget.
    async fn run(&self, campaign_id: Uuid, shutdown: &Shutdown) -> Result<BatchOutcome>;
}

/// Overall percentage for a within-phase completion ratio, scaled into the
/// phase's band so the number keeps rising across the whole pipeline.
pub fn overall_progress(phase: CampaignPhase, ratio: f64) -> f64 {
    let ratio = ratio.clamp(0.0, 1.0);
    match phase {
        CampaignPhase::DomainGeneration => 33.0 * ratio,
        CampaignPhase::DnsValidation => 33.0 + 33.0 * ratio,
        CampaignPhase::HttpKeywordValidation => 66.0 + 34.0 * ratio,
        CampaignPhase::Analysis => 100.0,
    }
}

/// Floor of a phase's progress band: the overall percentage a campaign
/// carries the moment it enters the phase.
pub fn band_floor(phase: CampaignPhase) -> f64 {
    overall_progress(phase, 0.0)
}

/// Move the campaign into the phase after `completed_phase` and enqueue the
/// next phase's first job, atomically. Entering `analysis` ends the
/// pipeline: there is no job to enqueue and the phase completes on entry.
pub(crate) fn advance_to_next_phase(
    store: &CampaignStore,
    publisher: &EventPublisher,
    campaign_id: Uuid,
    completed_phase: CampaignPhase,
    max_job_attempts: i64,
) -> Result<(), StoreError> {
    let Some(next) = completed_phase.next() else {
        return Ok(());
    };
    store.with_tx(|tx| {
        campaigns::advance_phase(tx, campaign_id, next, band_floor(next))?;
        if let Some(job_type) = JobType::for_phase(next) {
            jobs::insert(tx, &CampaignJob::new(campaign_id, job_type, max_job_attempts))?;
        }
        Ok(())
    })?;
    info!(
        campaign_id = %campaign_id,
        from = %completed_phase,
        to = %next,
        "phase complete, advancing"
    );
    publisher.publish(&CampaignEvent::PhaseCompleted {
        campaign_id,
        phase: completed_phase,
    });
    publisher.publish(&CampaignEvent::PhaseTransition {
        campaign_id,
        previous_phase: completed_phase,
        new_phase: next,
        trigger_reason: format!("{completed_phase} complete"),
    });
    Ok(())
}

/// What the shared runnable-check decided for this batch.
pub(crate) enum Admission {
    /// Proceed with the batch.
    Run(Campaign),
    /// Nothing to do; report the batch as done without a successor.
    Skip,
}

/// Common entry gate for all processors: confirms the campaign is in the
/// expected phase and moves `queued` campaigns to `running`. A pause
/// request (`pausing`) is settled to `paused` here, between batches, and
/// the batch is skipped; terminal or stale campaigns are skipped too.
pub(crate) fn admit_batch(
    coordinator: &StateCoordinator,
    campaign: Campaign,
    expected_phase: CampaignPhase,
    source: EventSource,
    actor: &str,
) -> Result<Admission, StateError> {
    if campaign.current_phase != expected_phase {
        warn!(
            campaign_id = %campaign.id,
            current_phase = %campaign.current_phase,
            expected_phase = %expected_phase,
            "stale job for a phase the campaign already left"
        );
        return Ok(Admission::Skip);
    }
    match campaign.status {
        CampaignStatus::Running => Ok(Admission::Run(campaign)),
        CampaignStatus::Pending | CampaignStatus::Queued => {
            coordinator.transition(
                campaign.id,
                CampaignStatus::Running,
                source,
                actor,
                "batch processing started",
                None,
            )?;
            let mut campaign = campaign;
            campaign.status = CampaignStatus::Running;
            Ok(Admission::Run(campaign))
        }
        CampaignStatus::Pausing => {
            coordinator.transition(
                campaign.id,
                CampaignStatus::Paused,
                source,
                actor,
                "pause observed between batches",
                None,
            )?;
            info!(campaign_id = %campaign.id, "campaign paused, batch skipped");
            Ok(Admission::Skip)
        }
        CampaignStatus::Paused
        | CampaignStatus::Completed
        | CampaignStatus::Failed
        | CampaignStatus::Cancelled
        | CampaignStatus::Archived => {
            info!(
                campaign_id = %campaign.id,
                status = %campaign.status,
                "campaign not runnable, batch skipped"
            );
            Ok(Admission::Skip)
        }
    }
}
