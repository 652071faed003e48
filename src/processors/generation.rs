//! Domain generation batch processor.
//!
//! Each invocation produces one batch of domains for the campaign's
//! generator configuration. The insert, the campaign progress update, and
//! the shared-offset advance commit as one transaction; a concurrent
//! writer on the same fingerprint is detected by re-reading the offset
//! inside the transaction and forces a recompute from a fresh snapshot.

use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Settings;
use crate::errors::StoreError;
use crate::events::{CampaignEvent, EventPublisher};
use crate::genconfig::{AtomicUpdateRequest, ConfigStateManager};
use crate::generator;
use crate::models::{
    CampaignPhase, DomainGenerationParams, EventSource, GeneratedDomain, JobType, PhaseParams,
    PhaseStatus,
};
use crate::shutdown::Shutdown;
use crate::state::StateCoordinator;
use crate::store::{CampaignStore, campaigns, domains};

use super::{Admission, BatchOutcome, BatchProcessor, admit_batch, advance_to_next_phase,
    overall_progress};

/// Attempts to land a batch before giving the job back to the queue. Each
/// retry recomputes from a fresh offset snapshot.
const MAX_OFFSET_RETRIES: u32 = 5;

pub struct GenerationProcessor {
    store: Arc<CampaignStore>,
    coordinator: Arc<StateCoordinator>,
    genconfig: Arc<ConfigStateManager>,
    publisher: EventPublisher,
    batch_size: usize,
    max_job_attempts: i64,
}

impl GenerationProcessor {
    pub fn new(
        store: Arc<CampaignStore>,
        coordinator: Arc<StateCoordinator>,
        genconfig: Arc<ConfigStateManager>,
        publisher: EventPublisher,
        settings: &Settings,
    ) -> Self {
        Self {
            store,
            coordinator,
            genconfig,
            publisher,
            batch_size: settings.batch.generation_batch_size.max(1),
            max_job_attempts: settings.worker.max_job_retries,
        }
    }

    /// One attempt at producing a batch from the given offset snapshot.
    /// Returns `None` when the snapshot went stale under a concurrent
    /// writer.
    fn try_batch(
        &self,
        campaign_id: Uuid,
        params: &DomainGenerationParams,
        config_hash: &str,
        snapshot_offset: i64,
    ) -> Result<Option<usize>> {
        let end_offset = (snapshot_offset + self.batch_size as i64)
            .min(params.num_domains_to_generate);
        let now = Utc::now();
        let batch: Vec<GeneratedDomain> = (snapshot_offset..end_offset)
            .map(|offset| GeneratedDomain {
                id: Uuid::new_v4(),
                campaign_id,
                domain_name: generator::domain_at(params, offset),
                offset_index: offset,
                generated_at: now,
            })
            .collect();
        let details = serde_json::to_value(params)?;

        let mut conn = self.store.lock()?;
        let tx = conn.transaction().map_err(StoreError::from)?;
        let current = ConfigStateManager::read_on(&tx, config_hash)?;
        let (current_offset, current_version) = current
            .as_ref()
            .map(|state| (state.last_offset, state.version))
            .unwrap_or((0, 0));
        if current_offset != snapshot_offset {
            // A sibling campaign on the same fingerprint advanced first;
            // the transaction rolls back on drop and we recompute.
            return Ok(None);
        }

        let inserted = domains::insert_batch(&tx, &batch)?;
        let produced = domains::count(&tx, campaign_id)?;
        let ratio = end_offset as f64 / params.num_domains_to_generate as f64;
        campaigns::update_progress(
            &tx,
            campaign_id,
            produced,
            Some(params.num_domains_to_generate),
            overall_progress(CampaignPhase::DomainGeneration, ratio),
        )?;

        let update = ConfigStateManager::atomic_update_on(
            &tx,
            &AtomicUpdateRequest {
                config_hash: config_hash.to_string(),
                expected_version: current_version,
                new_last_offset: end_offset,
                config_details: details,
            },
        )?;
        if !update.success {
            bail!(
                "config state {config_hash} rejected offset advance to {end_offset}: {}",
                update.error_message.unwrap_or_default()
            );
        }
        tx.commit().map_err(StoreError::from)?;
        drop(conn);

        self.genconfig.invalidate_cache(config_hash);
        debug!(
            campaign_id = %campaign_id,
            from = snapshot_offset,
            to = end_offset,
            inserted,
            "generated domain batch"
        );
        Ok(Some(end_offset as usize))
    }
}

#[async_trait]
impl BatchProcessor for GenerationProcessor {
    fn job_type(&self) -> JobType {
        JobType::DomainGeneration
    }

    async fn run(&self, campaign_id: Uuid, _shutdown: &Shutdown) -> Result<BatchOutcome> {
        let campaign = {
            let conn = self.store.lock()?;
            campaigns::get(&conn, campaign_id)?
        };
        let campaign = match admit_batch(
            &self.coordinator,
            campaign,
            CampaignPhase::DomainGeneration,
            EventSource::DomainGen,
            "domain-generator",
        )? {
            Admission::Run(campaign) => campaign,
            Admission::Skip => return Ok(BatchOutcome::done(0)),
        };

        let params = {
            let conn = self.store.lock()?;
            campaigns::get_phase_params(&conn, campaign_id, CampaignPhase::DomainGeneration)?
        };
        let PhaseParams::DomainGeneration(params) = params else {
            bail!("campaign {campaign_id} has mismatched generation parameters");
        };
        let config_hash = generator::config_hash(&params);

        if campaign.phase_status == PhaseStatus::NotStarted {
            let conn = self.store.lock()?;
            campaigns::update_phase_status(&conn, campaign_id, PhaseStatus::InProgress)?;
            drop(conn);
            self.publisher.publish(&CampaignEvent::PhaseStarted {
                campaign_id,
                phase: CampaignPhase::DomainGeneration,
            });
        }

        for _ in 0..MAX_OFFSET_RETRIES {
            let snapshot_offset = self
                .genconfig
                .get(&config_hash)?
                .map(|state| state.last_offset)
                .unwrap_or(0);

            if snapshot_offset >= params.num_domains_to_generate {
                // The shared offset space is exhausted for this budget;
                // nothing left for this campaign to produce.
                info!(
                    campaign_id = %campaign_id,
                    config_hash = %config_hash,
                    offset = snapshot_offset,
                    "generation phase complete"
                );
                advance_to_next_phase(
                    &self.store,
                    &self.publisher,
                    campaign_id,
                    CampaignPhase::DomainGeneration,
                    self.max_job_attempts,
                )?;
                return Ok(BatchOutcome::done(0));
            }

            let Some(end_offset) =
                self.try_batch(campaign_id, &params, &config_hash, snapshot_offset)?
            else {
                self.genconfig.invalidate_cache(&config_hash);
                continue;
            };

            let processed = end_offset as i64;
            self.publisher.publish(&CampaignEvent::PhaseProgress {
                campaign_id,
                phase: CampaignPhase::DomainGeneration,
                processed_items: processed.min(params.num_domains_to_generate),
                total_items: params.num_domains_to_generate,
                progress_percentage: overall_progress(
                    CampaignPhase::DomainGeneration,
                    processed as f64 / params.num_domains_to_generate as f64,
                ),
            });

            let batch_len = (processed - snapshot_offset) as u64;
            if processed >= params.num_domains_to_generate {
                advance_to_next_phase(
                    &self.store,
                    &self.publisher,
                    campaign_id,
                    CampaignPhase::DomainGeneration,
                    self.max_job_attempts,
                )?;
                return Ok(BatchOutcome::done(batch_len));
            }
            return Ok(BatchOutcome::more(batch_len));
        }

        bail!(
            "offset for {config_hash} kept moving under campaign {campaign_id}; \
             giving the batch back to the queue"
        )
    }
}

