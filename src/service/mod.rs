//! Campaign lifecycle service.
//!
//! The front door (HTTP or CLI) hands this service fully-formed requests;
//! it owns business-rule validation, persistence of the campaign and its
//! per-phase parameters, generator fingerprint registration, and the
//! lifecycle operations (pause/resume/cancel/retry) that drive the state
//! coordinator.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::config::Settings;
use crate::errors::{ServiceError, StoreError, ValidationError};
use crate::events::{CampaignEvent, EventPublisher};
use crate::genconfig::{AtomicUpdateRequest, ConfigStateManager};
use crate::generator;
use crate::models::{
    Campaign, CampaignJob, CampaignPhase, CampaignStatus, DnsValidationParams,
    DomainGenerationParams, EventSource, HttpKeywordParams, JobType, PersonaType, PhaseParams,
    StateEvent,
};
use crate::queue::JobQueue;
use crate::state::StateCoordinator;
use crate::store::{CampaignStore, campaigns, domains, personas, results};

/// Everything needed to create a campaign. All three phases are configured
/// up front because completed phases auto-advance into the next one.
#[derive(Debug, Clone, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub metadata: Option<Value>,
    pub domain_generation: DomainGenerationParams,
    pub dns_validation: DnsValidationParams,
    pub http_keyword: HttpKeywordParams,
}

/// Read-model for status displays.
#[derive(Debug, Clone)]
pub struct CampaignDetail {
    pub campaign: Campaign,
    pub generated_domains: i64,
    pub dns_results: i64,
    pub dns_resolved: i64,
    pub http_results: i64,
    pub leads: i64,
    pub recent_events: Vec<StateEvent>,
}

pub struct CampaignService {
    store: Arc<CampaignStore>,
    coordinator: Arc<StateCoordinator>,
    queue: Arc<JobQueue>,
    genconfig: Arc<ConfigStateManager>,
    publisher: EventPublisher,
    max_active_campaigns: i64,
    max_job_attempts: i64,
}

impl CampaignService {
    pub fn new(
        store: Arc<CampaignStore>,
        coordinator: Arc<StateCoordinator>,
        queue: Arc<JobQueue>,
        genconfig: Arc<ConfigStateManager>,
        publisher: EventPublisher,
        settings: &Settings,
    ) -> Self {
        Self {
            store,
            coordinator,
            queue,
            genconfig,
            publisher,
            max_active_campaigns: settings.limits.max_active_campaigns,
            max_job_attempts: settings.worker.max_job_retries,
        }
    }

    /// Validate, persist, register the generator fingerprint, queue the
    /// first job, and announce the campaign.
    pub fn create_campaign(
        &self,
        request: NewCampaign,
        actor: &str,
    ) -> Result<Campaign, ServiceError> {
        if request.name.trim().is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        request.domain_generation.validate()?;
        request.dns_validation.validate()?;
        request.http_keyword.validate()?;
        self.check_personas(&request.dns_validation.persona_ids, PersonaType::Dns)?;
        self.check_personas(&request.http_keyword.persona_ids, PersonaType::Http)?;
        self.check_keyword_sets(&request.http_keyword.keyword_set_ids)?;

        let mut campaign = Campaign::new(request.name.trim(), request.user_id);
        if let Some(metadata) = request.metadata {
            campaign.metadata = metadata;
        }

        let active = {
            let conn = self.store.lock()?;
            campaigns::count_active(&conn, None)?
        };
        if active >= self.max_active_campaigns {
            return Err(ValidationError::CampaignLimitExceeded {
                limit: self.max_active_campaigns,
            }
            .into());
        }

        self.store.with_tx(|tx| {
            campaigns::insert(tx, &campaign)?;
            campaigns::set_phase_params(
                tx,
                campaign.id,
                &PhaseParams::DomainGeneration(request.domain_generation.clone()),
            )?;
            campaigns::set_phase_params(
                tx,
                campaign.id,
                &PhaseParams::DnsValidation(request.dns_validation.clone()),
            )?;
            campaigns::set_phase_params(
                tx,
                campaign.id,
                &PhaseParams::HttpKeywordValidation(request.http_keyword.clone()),
            )?;
            Ok(())
        })?;

        self.coordinator.record_creation(&campaign, actor)?;
        self.register_config(&request.domain_generation)?;
        self.coordinator.transition(
            campaign.id,
            CampaignStatus::Queued,
            EventSource::User,
            actor,
            "campaign queued for processing",
            None,
        )?;
        self.queue.create(&CampaignJob::new(
            campaign.id,
            JobType::DomainGeneration,
            self.max_job_attempts,
        ))?;

        let campaign = {
            let conn = self.store.lock()?;
            campaigns::get(&conn, campaign.id)?
        };
        self.publisher.publish(&CampaignEvent::CampaignCreated {
            campaign: campaign.clone(),
        });
        info!(campaign_id = %campaign.id, name = %campaign.name, "campaign created");
        Ok(campaign)
    }

    /// Request a pause. Workers observe the `pausing` flag between batches
    /// and settle the campaign to `paused`.
    pub fn pause(&self, campaign_id: Uuid, actor: &str) -> Result<(), ServiceError> {
        self.coordinator.transition(
            campaign_id,
            CampaignStatus::Pausing,
            EventSource::User,
            actor,
            "pause requested",
            None,
        )?;
        Ok(())
    }

    /// Resume a paused campaign and make sure its current phase has a job.
    pub fn resume(&self, campaign_id: Uuid, actor: &str) -> Result<(), ServiceError> {
        self.coordinator.transition(
            campaign_id,
            CampaignStatus::Running,
            EventSource::User,
            actor,
            "resumed",
            None,
        )?;
        self.ensure_phase_job(campaign_id)?;
        Ok(())
    }

    pub fn cancel(&self, campaign_id: Uuid, actor: &str) -> Result<(), ServiceError> {
        self.coordinator.transition(
            campaign_id,
            CampaignStatus::Cancelled,
            EventSource::User,
            actor,
            "cancelled by user",
            None,
        )?;
        Ok(())
    }

    /// Put a failed campaign back in the queue and re-arm its current
    /// phase.
    pub fn retry_failed(&self, campaign_id: Uuid, actor: &str) -> Result<(), ServiceError> {
        self.coordinator.transition(
            campaign_id,
            CampaignStatus::Queued,
            EventSource::User,
            actor,
            "retry requested after failure",
            None,
        )?;
        self.ensure_phase_job(campaign_id)?;
        Ok(())
    }

    pub fn campaign_detail(&self, campaign_id: Uuid) -> Result<CampaignDetail, ServiceError> {
        let conn = self.store.lock()?;
        let campaign = campaigns::get(&conn, campaign_id)?;
        let generated_domains = domains::count(&conn, campaign_id)?;
        let dns_results = results::count_dns_results(&conn, campaign_id)?;
        let dns_resolved = results::count_resolved_dns_results(&conn, campaign_id)?;
        let http_results = results::count_http_results(&conn, campaign_id)?;
        let leads = results::count_lead_valid_http_results(&conn, campaign_id)?;
        drop(conn);
        let recent_events = self.coordinator.history(campaign_id, 10, 0)?;
        Ok(CampaignDetail {
            campaign,
            generated_domains,
            dns_results,
            dns_resolved,
            http_results,
            leads,
            recent_events,
        })
    }

    pub fn list_campaigns(
        &self,
        status: Option<CampaignStatus>,
    ) -> Result<Vec<Campaign>, ServiceError> {
        let conn = self.store.lock()?;
        Ok(campaigns::list(&conn, status)?)
    }

    fn ensure_phase_job(&self, campaign_id: Uuid) -> Result<(), ServiceError> {
        let campaign = {
            let conn = self.store.lock()?;
            campaigns::get(&conn, campaign_id)?
        };
        let Some(job_type) = JobType::for_phase(campaign.current_phase) else {
            return Ok(());
        };
        if self.queue.count_active_for_campaign(campaign_id)? > 0 {
            return Ok(());
        }
        self.queue.create(&CampaignJob::new(
            campaign_id,
            job_type,
            self.max_job_attempts,
        ))?;
        Ok(())
    }

    fn check_personas(
        &self,
        persona_ids: &[Uuid],
        expected: PersonaType,
    ) -> Result<(), ServiceError> {
        let conn = self.store.lock()?;
        let loaded = personas::personas_by_ids(&conn, persona_ids)?;
        for persona in loaded {
            if persona.persona_type != expected {
                return Err(ValidationError::PersonaTypeMismatch {
                    id: persona.id,
                    expected,
                    actual: persona.persona_type,
                }
                .into());
            }
            if !persona.is_enabled {
                return Err(ValidationError::PersonaDisabled { id: persona.id }.into());
            }
        }
        Ok(())
    }

    fn check_keyword_sets(&self, set_ids: &[Uuid]) -> Result<(), ServiceError> {
        let conn = self.store.lock()?;
        let sets = personas::keyword_sets_by_ids(&conn, set_ids)?;
        for set in sets {
            if !set.is_enabled {
                return Err(ValidationError::KeywordSetDisabled { id: set.id }.into());
            }
        }
        Ok(())
    }

    /// Make sure the generator fingerprint has a config-state row. Losing
    /// the registration race to a sibling campaign is fine — the row is
    /// there either way.
    fn register_config(&self, params: &DomainGenerationParams) -> Result<(), ServiceError> {
        let config_hash = generator::config_hash(params);
        if self.genconfig.get(&config_hash)?.is_some() {
            return Ok(());
        }
        let outcome = self.genconfig.atomic_update(&AtomicUpdateRequest {
            config_hash: config_hash.clone(),
            expected_version: 0,
            new_last_offset: 0,
            config_details: serde_json::to_value(params).map_err(StoreError::from)?,
        })?;
        if !outcome.success && outcome.conflict_version.is_none() {
            // Regression on a fresh registration cannot happen unless the
            // store is corrupted; surface it loudly.
            return Err(crate::errors::ConfigStateError::OffsetRegression {
                config_hash,
                attempted: 0,
                current: outcome.current_offset.unwrap_or(0),
            }
            .into());
        }
        Ok(())
    }
}
