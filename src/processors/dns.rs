//! DNS validation batch processor.
//!
//! One invocation validates one page of generated domains. Personas are
//! grouped by config fingerprint so equal configs share a cached validator;
//! per-domain work fans out under a semaphore and every completed result is
//! streamed as a `dns.validation.result` event.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::events::{CampaignEvent, EventPublisher};
use crate::models::{
    CampaignPhase, DnsResult, DnsStatus, DnsValidationParams, EventSource, GeneratedDomain,
    JobType, PersonaType, PhaseParams, PhaseStatus,
};
use crate::shutdown::Shutdown;
use crate::state::StateCoordinator;
use crate::store::{CampaignStore, campaigns, domains, personas, results};
use crate::validators::dns::{DnsClient, DnsOutcome, DnsPersonaConfig, DnsValidator};
use crate::validators::{ValidatorCache, persona_fingerprint};

use super::{
    Admission, BatchOutcome, BatchProcessor, admit_batch, advance_to_next_phase, overall_progress,
};

const VALIDATOR_CACHE_CAPACITY: usize = 64;

/// One persona attempt slot: the persona's identity plus its group's shared
/// validator.
#[derive(Clone)]
struct PersonaSlot {
    persona_id: Uuid,
    validator: Arc<DnsValidator>,
}

pub struct DnsProcessor {
    store: Arc<CampaignStore>,
    coordinator: Arc<StateCoordinator>,
    publisher: EventPublisher,
    client: Arc<dyn DnsClient>,
    validators: ValidatorCache<DnsValidator>,
    batch_size: usize,
    concurrency: usize,
    max_job_attempts: i64,
}

impl DnsProcessor {
    pub fn new(
        store: Arc<CampaignStore>,
        coordinator: Arc<StateCoordinator>,
        publisher: EventPublisher,
        client: Arc<dyn DnsClient>,
        settings: &Settings,
    ) -> Self {
        Self {
            store,
            coordinator,
            publisher,
            client,
            validators: ValidatorCache::new(VALIDATOR_CACHE_CAPACITY),
            batch_size: settings.batch.dns_batch_size.max(1),
            concurrency: settings.worker.dns_subtask_concurrency.max(1),
            max_job_attempts: settings.worker.max_job_retries,
        }
    }

    /// Build the ordered persona attempt list, sharing one validator per
    /// distinct config fingerprint.
    fn persona_slots(&self, params: &DnsValidationParams) -> Result<Vec<PersonaSlot>> {
        let loaded = {
            let conn = self.store.lock()?;
            personas::personas_by_ids(&conn, &params.persona_ids)?
        };
        let mut slots = Vec::with_capacity(loaded.len());
        for persona in loaded {
            if !persona.is_enabled {
                bail!("persona {} is disabled", persona.id);
            }
            if persona.persona_type != PersonaType::Dns {
                bail!(
                    "persona {} has type {}, expected dns",
                    persona.id,
                    persona.persona_type
                );
            }
            let fingerprint = persona_fingerprint(&persona.config_details);
            let config = DnsPersonaConfig::from_value(&persona.config_details)
                .with_context(|| format!("persona {} has an invalid DNS config", persona.id))?;
            let client = Arc::clone(&self.client);
            let validator = self
                .validators
                .get_or_insert_with(&fingerprint, move || DnsValidator::new(client, config));
            slots.push(PersonaSlot {
                persona_id: persona.id,
                validator,
            });
        }
        Ok(slots)
    }
}

#[async_trait]
impl BatchProcessor for DnsProcessor {
    fn job_type(&self) -> JobType {
        JobType::DnsValidation
    }

    async fn run(&self, campaign_id: Uuid, shutdown: &Shutdown) -> Result<BatchOutcome> {
        let campaign = {
            let conn = self.store.lock()?;
            campaigns::get(&conn, campaign_id)?
        };
        let campaign = match admit_batch(
            &self.coordinator,
            campaign,
            CampaignPhase::DnsValidation,
            EventSource::Dns,
            "dns-validator",
        )? {
            Admission::Run(campaign) => campaign,
            Admission::Skip => return Ok(BatchOutcome::done(0)),
        };

        let params = {
            let conn = self.store.lock()?;
            campaigns::get_phase_params(&conn, campaign_id, CampaignPhase::DnsValidation)?
        };
        let PhaseParams::DnsValidation(params) = params else {
            bail!("campaign {campaign_id} has mismatched DNS validation parameters");
        };
        let slots = Arc::new(self.persona_slots(&params)?);
        if slots.is_empty() {
            bail!("campaign {campaign_id} has no DNS personas configured");
        }
        // Per-domain budget: one full persona pass per allowed attempt.
        let attempt_cap =
            slots.len() as i64 * (1 + i64::from(params.retry_attempts.unwrap_or(2)));

        // Restart of an already-completed phase: keep resolved results,
        // re-validate everything else.
        let total = {
            let conn = self.store.lock()?;
            if campaign.phase_status == PhaseStatus::Completed {
                let dropped = results::delete_unresolved_dns_results(&conn, campaign_id)?;
                info!(
                    campaign_id = %campaign_id,
                    preserved = results::count_resolved_dns_results(&conn, campaign_id)?,
                    dropped,
                    "re-validating completed DNS phase"
                );
            }
            domains::count(&conn, campaign_id)?
        };

        if campaign.phase_status != PhaseStatus::InProgress {
            let conn = self.store.lock()?;
            campaigns::update_phase_status(&conn, campaign_id, PhaseStatus::InProgress)?;
            drop(conn);
            self.publisher.publish(&CampaignEvent::PhaseStarted {
                campaign_id,
                phase: CampaignPhase::DnsValidation,
            });
        }

        let page = {
            let conn = self.store.lock()?;
            domains::unvalidated_page(&conn, campaign_id, attempt_cap, self.batch_size)?
        };

        if page.is_empty() {
            {
                let conn = self.store.lock()?;
                let processed = results::count_dns_results(&conn, campaign_id)?;
                campaigns::update_progress(
                    &conn,
                    campaign_id,
                    processed,
                    Some(total),
                    overall_progress(CampaignPhase::DnsValidation, 1.0),
                )?;
            }
            advance_to_next_phase(
                &self.store,
                &self.publisher,
                campaign_id,
                CampaignPhase::DnsValidation,
                self.max_job_attempts,
            )?;
            return Ok(BatchOutcome::done(0));
        }

        let rotation_seconds = params.rotation_interval_seconds.unwrap_or(0);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(page.len());
        for domain in page {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .context("validation semaphore closed")?;
            let slots = Arc::clone(&slots);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                validate_domain(domain, &slots, rotation_seconds, &shutdown).await
            }));
        }

        let mut batch_results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => batch_results.push(result),
                Err(join_error) => {
                    warn!(campaign_id = %campaign_id, error = %join_error, "domain validation task panicked");
                }
            }
        }

        let processed = {
            let mut conn = self.store.lock()?;
            let tx = conn.transaction().map_err(crate::errors::StoreError::from)?;
            results::upsert_dns_batch(&tx, &batch_results)?;
            let processed = results::count_dns_results(&tx, campaign_id)?;
            let ratio = if total > 0 {
                processed as f64 / total as f64
            } else {
                1.0
            };
            campaigns::update_progress(
                &tx,
                campaign_id,
                processed,
                Some(total),
                overall_progress(CampaignPhase::DnsValidation, ratio),
            )?;
            tx.commit().map_err(crate::errors::StoreError::from)?;
            processed
        };

        // Stream per-domain outcomes after the batch committed. Delivery is
        // best-effort by construction.
        for result in &batch_results {
            self.publisher.publish(&CampaignEvent::DnsValidationResult {
                campaign_id,
                domain_id: result.generated_domain_id,
                domain: result.domain_name.clone(),
                validation_status: result.validation_status,
                dns_records: result.dns_records.clone(),
                attempts: result.attempts,
            });
        }
        self.publisher.publish(&CampaignEvent::PhaseProgress {
            campaign_id,
            phase: CampaignPhase::DnsValidation,
            processed_items: processed,
            total_items: total,
            progress_percentage: overall_progress(
                CampaignPhase::DnsValidation,
                if total > 0 {
                    processed as f64 / total as f64
                } else {
                    1.0
                },
            ),
        });

        if shutdown.is_cancelled() {
            // Partial results are committed; the worker requeues the job.
            bail!("DNS batch for campaign {campaign_id} interrupted by shutdown");
        }

        let remaining = {
            let conn = self.store.lock()?;
            domains::count_unvalidated(&conn, campaign_id, attempt_cap)?
        };
        let batch_len = batch_results.len() as u64;
        if remaining == 0 {
            advance_to_next_phase(
                &self.store,
                &self.publisher,
                campaign_id,
                CampaignPhase::DnsValidation,
                self.max_job_attempts,
            )?;
            return Ok(BatchOutcome::done(batch_len));
        }
        Ok(BatchOutcome::more(batch_len))
    }
}

/// Validate one domain against the persona list in order. The first
/// resolved answer wins; otherwise the last outcome is kept. Cancellation
/// between persona attempts produces an `error` result without trying
/// further personas.
async fn validate_domain(
    domain: GeneratedDomain,
    slots: &[PersonaSlot],
    rotation_seconds: u64,
    shutdown: &Shutdown,
) -> DnsResult {
    let mut attempts = 0;
    let mut last: Option<(DnsOutcome, Uuid)> = None;
    for (index, slot) in slots.iter().enumerate() {
        if shutdown.is_cancelled() {
            return cancelled_result(&domain, attempts);
        }
        attempts += 1;
        let outcome = slot.validator.validate(&domain.domain_name).await;
        let resolved = outcome.status == DnsStatus::Resolved;
        last = Some((outcome, slot.persona_id));
        if resolved {
            break;
        }
        if index + 1 < slots.len() && rotation_seconds > 0 {
            tokio::select! {
                _ = shutdown.cancelled() => return cancelled_result(&domain, attempts),
                _ = tokio::time::sleep(Duration::from_secs(rotation_seconds)) => {}
            }
        }
    }
    match last {
        Some((outcome, persona_id)) => DnsResult {
            id: Uuid::new_v4(),
            campaign_id: domain.campaign_id,
            generated_domain_id: Some(domain.id),
            domain_name: domain.domain_name,
            validation_status: outcome.status,
            dns_records: match outcome.message {
                Some(message) if outcome.status != DnsStatus::Resolved => {
                    json!({"records": outcome.records, "message": message})
                }
                _ => outcome.records,
            },
            validated_by_persona_id: Some(persona_id),
            attempts,
            last_checked_at: Utc::now(),
        },
        None => cancelled_result(&domain, attempts),
    }
}

fn cancelled_result(domain: &GeneratedDomain, attempts: i64) -> DnsResult {
    DnsResult {
        id: Uuid::new_v4(),
        campaign_id: domain.campaign_id,
        generated_domain_id: Some(domain.id),
        domain_name: domain.domain_name.clone(),
        validation_status: DnsStatus::Error,
        dns_records: json!({"message": "Context cancelled before validation completed"}),
        validated_by_persona_id: None,
        attempts,
        last_checked_at: Utc::now(),
    }
}
