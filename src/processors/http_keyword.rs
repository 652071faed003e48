//! HTTP + keyword validation batch processor.
//!
//! Consumes the resolved DNS results in domain-name order behind a cursor
//! persisted in the phase parameters, so interrupted runs resume where they
//! left off. Personas are attempted in order per domain with the first
//! successful response winning; successful bodies run through the compiled
//! keyword rules to decide `lead_valid`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::errors::StoreError;
use crate::events::{CampaignEvent, EventPublisher};
use crate::models::{
    CampaignPhase, DnsResult, EventSource, HttpKeywordParams, HttpResult, HttpValidationStatus,
    JobType, PersonaType, PhaseParams, PhaseStatus,
};
use crate::shutdown::Shutdown;
use crate::state::StateCoordinator;
use crate::store::{CampaignStore, campaigns, personas, results};
use crate::validators::http::{
    HttpFetcher, HttpPersonaConfig, ProxyEndpoint, ProxyProvider, extract_snippet, extract_title,
};
use crate::validators::keywords::KeywordScanner;

use super::{
    Admission, BatchOutcome, BatchProcessor, admit_batch, advance_to_next_phase, overall_progress,
};

/// Persona attempt slot for the HTTP phase.
#[derive(Clone)]
struct PersonaSlot {
    persona_id: Uuid,
    config: Arc<HttpPersonaConfig>,
}

pub struct HttpKeywordProcessor {
    store: Arc<CampaignStore>,
    coordinator: Arc<StateCoordinator>,
    publisher: EventPublisher,
    fetcher: Arc<dyn HttpFetcher>,
    proxies: Arc<dyn ProxyProvider>,
    batch_size: usize,
    concurrency: usize,
    max_job_attempts: i64,
}

impl HttpKeywordProcessor {
    pub fn new(
        store: Arc<CampaignStore>,
        coordinator: Arc<StateCoordinator>,
        publisher: EventPublisher,
        fetcher: Arc<dyn HttpFetcher>,
        proxies: Arc<dyn ProxyProvider>,
        settings: &Settings,
    ) -> Self {
        Self {
            store,
            coordinator,
            publisher,
            fetcher,
            proxies,
            batch_size: settings.batch.http_batch_size.max(1),
            concurrency: settings.worker.http_keyword_subtask_concurrency.max(1),
            max_job_attempts: settings.worker.max_job_retries,
        }
    }

    fn persona_slots(&self, params: &HttpKeywordParams) -> Result<Vec<PersonaSlot>> {
        let loaded = {
            let conn = self.store.lock()?;
            personas::personas_by_ids(&conn, &params.persona_ids)?
        };
        let mut slots = Vec::with_capacity(loaded.len());
        for persona in loaded {
            if !persona.is_enabled {
                bail!("persona {} is disabled", persona.id);
            }
            if persona.persona_type != PersonaType::Http {
                bail!(
                    "persona {} has type {}, expected http",
                    persona.id,
                    persona.persona_type
                );
            }
            let config = HttpPersonaConfig::from_value(&persona.config_details)
                .with_context(|| format!("persona {} has an invalid HTTP config", persona.id))?;
            slots.push(PersonaSlot {
                persona_id: persona.id,
                config: Arc::new(config),
            });
        }
        Ok(slots)
    }

    fn keyword_scanner(&self, params: &HttpKeywordParams) -> Result<KeywordScanner> {
        let conn = self.store.lock()?;
        let sets = personas::keyword_sets_by_ids(&conn, &params.keyword_set_ids)?;
        for set in &sets {
            if !set.is_enabled {
                bail!("keyword set {} is disabled", set.id);
            }
        }
        let rules = personas::keyword_rules_by_set_ids(&conn, &params.keyword_set_ids)?;
        drop(conn);
        Ok(KeywordScanner::compile(&rules, &params.ad_hoc_keywords)?)
    }

    async fn select_proxy(&self, params: &HttpKeywordParams) -> Option<ProxyEndpoint> {
        let pool_id = params.proxy_pool_id?;
        match self.proxies.select(pool_id).await {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                warn!(
                    pool_id = %pool_id,
                    error = %e,
                    "proxy selection failed, fetching directly"
                );
                None
            }
        }
    }
}

#[async_trait]
impl BatchProcessor for HttpKeywordProcessor {
    fn job_type(&self) -> JobType {
        JobType::HttpKeywordValidation
    }

    async fn run(&self, campaign_id: Uuid, shutdown: &Shutdown) -> Result<BatchOutcome> {
        let campaign = {
            let conn = self.store.lock()?;
            campaigns::get(&conn, campaign_id)?
        };
        let campaign = match admit_batch(
            &self.coordinator,
            campaign,
            CampaignPhase::HttpKeywordValidation,
            EventSource::HttpKeyword,
            "http-keyword-validator",
        )? {
            Admission::Run(campaign) => campaign,
            Admission::Skip => return Ok(BatchOutcome::done(0)),
        };

        let params = {
            let conn = self.store.lock()?;
            campaigns::get_phase_params(&conn, campaign_id, CampaignPhase::HttpKeywordValidation)?
        };
        let PhaseParams::HttpKeywordValidation(mut params) = params else {
            bail!("campaign {campaign_id} has mismatched HTTP validation parameters");
        };
        let slots = Arc::new(self.persona_slots(&params)?);
        if slots.is_empty() {
            bail!("campaign {campaign_id} has no HTTP personas configured");
        }
        let scanner = Arc::new(self.keyword_scanner(&params)?);

        let total = {
            let conn = self.store.lock()?;
            results::count_resolved_dns_results(&conn, campaign_id)?
        };

        if campaign.phase_status == PhaseStatus::NotStarted {
            let conn = self.store.lock()?;
            campaigns::update_phase_status(&conn, campaign_id, PhaseStatus::InProgress)?;
            drop(conn);
            self.publisher.publish(&CampaignEvent::PhaseStarted {
                campaign_id,
                phase: CampaignPhase::HttpKeywordValidation,
            });
        }

        let page = {
            let conn = self.store.lock()?;
            results::resolved_dns_page_after(
                &conn,
                campaign_id,
                params.last_processed_domain_name.as_deref(),
                self.batch_size,
            )?
        };

        if page.is_empty() {
            let processed = {
                let conn = self.store.lock()?;
                results::count_http_results(&conn, campaign_id)?
            };
            if processed < total {
                // The cursor outran the persisted results (for example a
                // crash between result commit and cursor commit going the
                // other way). Rewind and walk again; upserts make the
                // second pass idempotent.
                warn!(
                    campaign_id = %campaign_id,
                    processed,
                    total,
                    "HTTP cursor exhausted early, rewinding"
                );
                params.last_processed_domain_name = None;
                let conn = self.store.lock()?;
                campaigns::set_phase_params(
                    &conn,
                    campaign_id,
                    &PhaseParams::HttpKeywordValidation(params),
                )?;
                return Ok(BatchOutcome::more(0));
            }
            {
                let conn = self.store.lock()?;
                campaigns::update_progress(
                    &conn,
                    campaign_id,
                    processed,
                    Some(total),
                    overall_progress(CampaignPhase::HttpKeywordValidation, 1.0),
                )?;
            }
            let leads = {
                let conn = self.store.lock()?;
                results::count_lead_valid_http_results(&conn, campaign_id)?
            };
            advance_to_next_phase(
                &self.store,
                &self.publisher,
                campaign_id,
                CampaignPhase::HttpKeywordValidation,
                self.max_job_attempts,
            )?;
            info!(campaign_id = %campaign_id, leads, "HTTP keyword phase complete");
            return Ok(BatchOutcome::done(0));
        }

        let proxy = self.select_proxy(&params).await;
        let ports = Arc::new(params.ports());
        let rotation_seconds = params.rotation_interval_seconds.unwrap_or(0);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(page.len());
        let cursor_end = page.last().map(|result| result.domain_name.clone());
        for dns_result in page {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .context("validation semaphore closed")?;
            let slots = Arc::clone(&slots);
            let scanner = Arc::clone(&scanner);
            let fetcher = Arc::clone(&self.fetcher);
            let ports = Arc::clone(&ports);
            let proxy = proxy.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                validate_domain(
                    dns_result,
                    fetcher.as_ref(),
                    &slots,
                    &scanner,
                    &ports,
                    proxy.as_ref(),
                    rotation_seconds,
                    &shutdown,
                )
                .await
            }));
        }

        let mut batch_results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => batch_results.push(result),
                Err(join_error) => {
                    warn!(campaign_id = %campaign_id, error = %join_error, "HTTP validation task panicked");
                }
            }
        }

        let processed = {
            let mut conn = self.store.lock()?;
            let tx = conn.transaction().map_err(StoreError::from)?;
            results::upsert_http_batch(&tx, &batch_results)?;
            if let Some(cursor) = cursor_end {
                params.last_processed_domain_name = Some(cursor);
                campaigns::set_phase_params(
                    &tx,
                    campaign_id,
                    &PhaseParams::HttpKeywordValidation(params),
                )?;
            }
            let processed = results::count_http_results(&tx, campaign_id)?;
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
                overall_progress(CampaignPhase::HttpKeywordValidation, ratio),
            )?;
            tx.commit().map_err(StoreError::from)?;
            processed
        };

        self.publisher.publish(&CampaignEvent::PhaseProgress {
            campaign_id,
            phase: CampaignPhase::HttpKeywordValidation,
            processed_items: processed,
            total_items: total,
            progress_percentage: overall_progress(
                CampaignPhase::HttpKeywordValidation,
                if total > 0 {
                    processed as f64 / total as f64
                } else {
                    1.0
                },
            ),
        });

        if shutdown.is_cancelled() {
            bail!("HTTP batch for campaign {campaign_id} interrupted by shutdown");
        }

        let batch_len = batch_results.len() as u64;
        if processed >= total {
            advance_to_next_phase(
                &self.store,
                &self.publisher,
                campaign_id,
                CampaignPhase::HttpKeywordValidation,
                self.max_job_attempts,
            )?;
            return Ok(BatchOutcome::done(batch_len));
        }
        Ok(BatchOutcome::more(batch_len))
    }
}

/// Probe one domain: personas in order, ports in order within a persona,
/// first successful response wins. A success with a body runs the keyword
/// scan; everything else maps onto the failure statuses.
#[allow(clippy::too_many_arguments)]
async fn validate_domain(
    dns_result: DnsResult,
    fetcher: &dyn HttpFetcher,
    slots: &[PersonaSlot],
    scanner: &KeywordScanner,
    ports: &[u16],
    proxy: Option<&ProxyEndpoint>,
    rotation_seconds: u64,
    shutdown: &Shutdown,
) -> HttpResult {
    let mut attempts = 0;
    let mut winner: Option<(crate::validators::http::HttpFetchOutcome, Uuid)> = None;
    let mut last: Option<(crate::validators::http::HttpFetchOutcome, Uuid)> = None;

    'personas: for (index, slot) in slots.iter().enumerate() {
        if shutdown.is_cancelled() {
            return build_result(
                &dns_result,
                None,
                HttpValidationStatus::CancelledDuringProcessing,
                scanner,
                proxy,
                attempts,
            );
        }
        for port in ports {
            attempts += 1;
            let url = url_for(&dns_result.domain_name, *port);
            let outcome = fetcher.fetch(&url, &slot.config, proxy).await;
            let succeeded = outcome.is_success;
            last = Some((outcome, slot.persona_id));
            if succeeded {
                winner = last.clone();
                break 'personas;
            }
        }
        if index + 1 < slots.len() && rotation_seconds > 0 {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    return build_result(
                        &dns_result,
                        None,
                        HttpValidationStatus::CancelledDuringProcessing,
                        scanner,
                        proxy,
                        attempts,
                    );
                }
                _ = tokio::time::sleep(Duration::from_secs(rotation_seconds)) => {}
            }
        }
    }

    match winner.or(last) {
        Some((outcome, persona_id)) => {
            let status = classify(&outcome);
            let mut result = build_result(&dns_result, Some(&outcome), status, scanner, proxy, attempts);
            result.validated_by_persona_id = Some(persona_id);
            result
        }
        None => build_result(
            &dns_result,
            None,
            HttpValidationStatus::ProcessingFailedBeforeHttp,
            scanner,
            proxy,
            attempts,
        ),
    }
}

fn classify(outcome: &crate::validators::http::HttpFetchOutcome) -> HttpValidationStatus {
    if outcome.is_success {
        // Keyword decision happens in build_result; placeholder here.
        HttpValidationStatus::HttpValidNoKeywords
    } else if outcome.failed_before_request {
        HttpValidationStatus::ProcessingFailedBeforeHttp
    } else if outcome.status_code.is_some() && outcome.error.is_none() {
        HttpValidationStatus::InvalidHttpCode
    } else {
        HttpValidationStatus::InvalidHttpResponseError
    }
}

fn build_result(
    dns_result: &DnsResult,
    outcome: Option<&crate::validators::http::HttpFetchOutcome>,
    status: HttpValidationStatus,
    scanner: &KeywordScanner,
    proxy: Option<&ProxyEndpoint>,
    attempts: i64,
) -> HttpResult {
    let mut result = HttpResult {
        id: Uuid::new_v4(),
        campaign_id: dns_result.campaign_id,
        dns_result_id: Some(dns_result.id),
        domain_name: dns_result.domain_name.clone(),
        http_status_code: None,
        response_headers: None,
        content_hash: None,
        page_title: None,
        snippet: None,
        found_keywords_from_sets: Vec::new(),
        found_ad_hoc_keywords: Vec::new(),
        validation_status: status,
        validated_by_persona_id: None,
        used_proxy_id: proxy.map(|p| p.id),
        attempts,
        last_checked_at: Utc::now(),
    };
    let Some(outcome) = outcome else {
        return result;
    };
    result.http_status_code = outcome.status_code.map(i64::from);
    result.response_headers = outcome.headers.clone();

    if outcome.is_success {
        match outcome.body.as_deref() {
            Some(body) if !body.is_empty() => {
                result.content_hash = Some(format!("{:x}", Sha256::digest(body.as_bytes())));
                result.page_title = extract_title(body);
                result.snippet = extract_snippet(body);
                let hits = scanner.scan(body);
                result.validation_status = if hits.any() {
                    HttpValidationStatus::LeadValid
                } else {
                    HttpValidationStatus::HttpValidNoKeywords
                };
                result.found_keywords_from_sets = hits.from_sets;
                result.found_ad_hoc_keywords = hits.ad_hoc;
            }
            _ => {
                result.validation_status = HttpValidationStatus::HttpValidNoKeywords;
            }
        }
    }
    result
}

fn url_for(domain: &str, port: u16) -> String {
    match port {
        443 => format!("https://{domain}/"),
        80 => format!("http://{domain}/"),
        other => format!("http://{domain}:{other}/"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validators::http::HttpFetchOutcome;
    use serde_json::json;

    #[test]
    fn url_for_maps_well_known_ports_to_schemes() {
        assert_eq!(url_for("a.com", 443), "https://a.com/");
        assert_eq!(url_for("a.com", 80), "http://a.com/");
        assert_eq!(url_for("a.com", 8080), "http://a.com:8080/");
    }

    #[test]
    fn classify_separates_transport_and_status_failures() {
        assert_eq!(
            classify(&HttpFetchOutcome::http_error(503, json!({}))),
            HttpValidationStatus::InvalidHttpCode
        );
        assert_eq!(
            classify(&HttpFetchOutcome::transport_error("refused".into())),
            HttpValidationStatus::InvalidHttpResponseError
        );
        assert_eq!(
            classify(&HttpFetchOutcome::setup_error("bad url".into())),
            HttpValidationStatus::ProcessingFailedBeforeHttp
        );
    }
}
