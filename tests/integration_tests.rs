//! End-to-end pipeline tests: campaigns run from creation through domain
//! generation, DNS validation, and HTTP/keyword validation against
//! scripted collaborators, driven by the real queue, worker pool, and
//! state coordinator over an in-memory store.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use leadstudio::config::Settings;
use leadstudio::events::EventPublisher;
use leadstudio::genconfig::ConfigStateManager;
use leadstudio::models::{
    CampaignPhase, CampaignStatus, DnsStatus, DnsValidationParams, DomainGenerationParams,
    HttpKeywordParams, HttpValidationStatus, PatternType, Persona, PersonaType, PhaseStatus,
};
use leadstudio::processors::{
    BatchProcessor, DnsProcessor, GenerationProcessor, HttpKeywordProcessor,
};
use leadstudio::queue::JobQueue;
use leadstudio::service::{CampaignService, NewCampaign};
use leadstudio::shutdown::{Shutdown, shutdown_channel};
use leadstudio::state::StateCoordinator;
use leadstudio::store::{CampaignStore, campaigns, domains, personas, results};
use leadstudio::validators::dns::{DnsClient, DnsOutcome, DnsPersonaConfig};
use leadstudio::validators::http::{
    HttpFetchOutcome, HttpFetcher, NoProxyPools, ProxyEndpoint, HttpPersonaConfig,
};
use leadstudio::worker::{Orchestrator, WorkerPool};

/// Resolves exactly the domains in its allow-set.
struct ScriptedDns {
    resolvable: RwLock<HashSet<String>>,
}

impl ScriptedDns {
    fn new<const N: usize>(domains: [&str; N]) -> Self {
        Self {
            resolvable: RwLock::new(domains.iter().map(|d| d.to_string()).collect()),
        }
    }

    fn allow(&self, domain: &str) {
        if let Ok(mut set) = self.resolvable.write() {
            set.insert(domain.to_string());
        }
    }
}

#[async_trait]
impl DnsClient for ScriptedDns {
    async fn resolve(
        &self,
        domain: &str,
        _config: &DnsPersonaConfig,
    ) -> anyhow::Result<DnsOutcome> {
        let hit = self
            .resolvable
            .read()
            .map(|set| set.contains(domain))
            .unwrap_or(false);
        if hit {
            Ok(DnsOutcome::resolved(json!([
                {"type": "A", "value": "192.0.2.10"}
            ])))
        } else {
            Ok(DnsOutcome::unresolved("NXDOMAIN"))
        }
    }
}

/// Serves canned bodies per domain; anything else refuses the connection.
struct ScriptedHttp {
    bodies: HashMap<String, String>,
}

impl ScriptedHttp {
    fn new(bodies: &[(&str, &str)]) -> Self {
        Self {
            bodies: bodies
                .iter()
                .map(|(domain, body)| (domain.to_string(), body.to_string()))
                .collect(),
        }
    }
}

#[async_trait]
impl HttpFetcher for ScriptedHttp {
    async fn fetch(
        &self,
        url: &str,
        _config: &HttpPersonaConfig,
        _proxy: Option<&ProxyEndpoint>,
    ) -> HttpFetchOutcome {
        let domain = url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string();
        match self.bodies.get(&domain) {
            Some(body) => HttpFetchOutcome::success(
                200,
                json!({"content-type": "text/html"}),
                body.clone(),
            ),
            None => HttpFetchOutcome::transport_error("connection refused".to_string()),
        }
    }
}

struct Pipeline {
    store: Arc<CampaignStore>,
    service: CampaignService,
    queue: Arc<JobQueue>,
    coordinator: Arc<StateCoordinator>,
    pool: Arc<WorkerPool>,
    publisher: EventPublisher,
    dns: Arc<ScriptedDns>,
    dns_persona: Uuid,
    http_persona: Uuid,
}

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.worker.poll_interval_seconds = 0;
    settings.worker.error_retry_delay_seconds = 0;
    settings.worker.job_processing_timeout_minutes = 1;
    settings.batch.generation_batch_size = 2;
    settings.batch.dns_batch_size = 2;
    settings.batch.http_batch_size = 2;
    settings
}

fn pipeline(dns: ScriptedDns, http: ScriptedHttp) -> Pipeline {
    let settings = test_settings();
    let store = Arc::new(CampaignStore::open_in_memory().unwrap());
    let publisher = EventPublisher::new(1024);
    let coordinator = Arc::new(StateCoordinator::new(Arc::clone(&store), publisher.clone()));
    let genconfig = Arc::new(ConfigStateManager::new(Arc::clone(&store)));
    let queue = Arc::new(JobQueue::new(Arc::clone(&store)));
    let dns = Arc::new(dns);

    let dns_persona = Uuid::new_v4();
    let http_persona = Uuid::new_v4();
    {
        let conn = store.lock().unwrap();
        personas::insert_persona(
            &conn,
            &Persona {
                id: dns_persona,
                name: "resolver-a".into(),
                persona_type: PersonaType::Dns,
                config_details: json!({"resolvers": ["192.0.2.53:53"]}),
                is_enabled: true,
                created_at: Utc::now(),
            },
        )
        .unwrap();
        personas::insert_persona(
            &conn,
            &Persona {
                id: http_persona,
                name: "browser-a".into(),
                persona_type: PersonaType::Http,
                config_details: json!({"user_agent": "LeadBot/1.0"}),
                is_enabled: true,
                created_at: Utc::now(),
            },
        )
        .unwrap();
    }

    let service = CampaignService::new(
        Arc::clone(&store),
        Arc::clone(&coordinator),
        Arc::clone(&queue),
        Arc::clone(&genconfig),
        publisher.clone(),
        &settings,
    );

    let processors: Vec<Arc<dyn BatchProcessor>> = vec![
        Arc::new(GenerationProcessor::new(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            Arc::clone(&genconfig),
            publisher.clone(),
            &settings,
        )),
        Arc::new(DnsProcessor::new(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            publisher.clone(),
            Arc::clone(&dns) as Arc<dyn DnsClient>,
            &settings,
        )),
        Arc::new(HttpKeywordProcessor::new(
            Arc::clone(&store),
            Arc::clone(&coordinator),
            publisher.clone(),
            Arc::new(http),
            Arc::new(NoProxyPools),
            &settings,
        )),
    ];
    let pool = Arc::new(WorkerPool::new(
        Arc::clone(&queue),
        Arc::clone(&coordinator) as Arc<dyn Orchestrator>,
        processors,
        settings.worker.clone(),
    ));

    Pipeline {
        store,
        service,
        queue,
        coordinator,
        pool,
        publisher,
        dns,
        dns_persona,
        http_persona,
    }
}

fn campaign_request(p: &Pipeline) -> NewCampaign {
    NewCampaign {
        name: "widgets sweep".into(),
        user_id: None,
        metadata: None,
        domain_generation: DomainGenerationParams {
            pattern_type: PatternType::Prefix,
            variable_length: 2,
            character_set: "ab".into(),
            constant_string: "test".into(),
            tld: ".com".into(),
            num_domains_to_generate: 4,
        },
        dns_validation: DnsValidationParams {
            persona_ids: vec![p.dns_persona],
            rotation_interval_seconds: Some(0),
            processing_speed_per_minute: None,
            batch_size: None,
            retry_attempts: Some(0),
        },
        http_keyword: HttpKeywordParams {
            persona_ids: vec![p.http_persona],
            keyword_set_ids: vec![],
            ad_hoc_keywords: vec!["pricing".into()],
            proxy_pool_id: None,
            target_http_ports: vec![443],
            rotation_interval_seconds: Some(0),
            processing_speed_per_minute: None,
            batch_size: None,
            retry_attempts: None,
            last_processed_domain_name: None,
        },
    }
}

async fn wait_for_status(store: &Arc<CampaignStore>, campaign_id: Uuid, status: CampaignStatus) {
    let store = Arc::clone(store);
    tokio::time::timeout(Duration::from_secs(10), async move {
        loop {
            {
                let conn = store.lock().unwrap();
                if campaigns::get(&conn, campaign_id).unwrap().status == status {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("campaign never reached {status}"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_pipeline_produces_leads_from_generated_domains() {
    let p = pipeline(
        ScriptedDns::new(["aatest.com", "abtest.com", "batest.com"]),
        ScriptedHttp::new(&[
            ("aatest.com", "<html><title>Acme</title>Our pricing page</html>"),
            ("abtest.com", "<html><title>Beta</title>Nothing relevant</html>"),
        ]),
    );
    let campaign = p.service.create_campaign(campaign_request(&p), "it").unwrap();

    let (handle, shutdown) = shutdown_channel();
    let pool_task = tokio::spawn(Arc::clone(&p.pool).start_workers(shutdown, 2));
    wait_for_status(&p.store, campaign.id, CampaignStatus::Completed).await;
    handle.trigger();
    pool_task.await.unwrap();

    let conn = p.store.lock().unwrap();

    // Exactly the four domains of the space, offsets 0..4, all distinct.
    let generated = domains::page(&conn, campaign.id, 100, 0).unwrap();
    let names: Vec<&str> = generated.iter().map(|d| d.domain_name.as_str()).collect();
    assert_eq!(
        names,
        vec!["aatest.com", "abtest.com", "batest.com", "bbtest.com"]
    );
    let offsets: Vec<i64> = generated.iter().map(|d| d.offset_index).collect();
    assert_eq!(offsets, vec![0, 1, 2, 3]);

    // Every domain has a DNS verdict; three resolved.
    assert_eq!(results::count_dns_results(&conn, campaign.id).unwrap(), 4);
    assert_eq!(
        results::count_resolved_dns_results(&conn, campaign.id).unwrap(),
        3
    );

    // HTTP ran over the resolved three; the pricing page is the lead.
    assert_eq!(results::count_http_results(&conn, campaign.id).unwrap(), 3);
    let leads = results::http_results(
        &conn,
        campaign.id,
        Some(HttpValidationStatus::LeadValid),
    )
    .unwrap();
    assert_eq!(leads.len(), 1);
    assert_eq!(leads[0].domain_name, "aatest.com");
    assert_eq!(leads[0].found_ad_hoc_keywords, vec!["pricing".to_string()]);
    assert_eq!(leads[0].page_title.as_deref(), Some("Acme"));
    assert!(leads[0].content_hash.is_some());

    // The unreachable resolved domain is recorded as a transport failure.
    let failures = results::http_results(
        &conn,
        campaign.id,
        Some(HttpValidationStatus::InvalidHttpResponseError),
    )
    .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].domain_name, "batest.com");

    // Campaign row settled at the end of the pipeline.
    let done = campaigns::get(&conn, campaign.id).unwrap();
    assert_eq!(done.status, CampaignStatus::Completed);
    assert_eq!(done.current_phase, CampaignPhase::Analysis);
    assert_eq!(done.phase_status, PhaseStatus::Completed);
    assert_eq!(done.progress_percentage, Some(100.0));
    assert!(done.started_at.is_some());
    assert!(done.completed_at.is_some());
    drop(conn);

    // The event log is dense and replays to the final status.
    p.coordinator.validate_event_integrity(campaign.id).unwrap();
    p.coordinator.validate_consistency(campaign.id).unwrap();
    assert_eq!(
        p.coordinator.replay(campaign.id).unwrap(),
        Some(CampaignStatus::Completed)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn progress_is_monotone_and_config_offset_lands_at_the_budget() {
    let p = pipeline(
        ScriptedDns::new(["aatest.com", "abtest.com", "batest.com", "bbtest.com"]),
        ScriptedHttp::new(&[("aatest.com", "plain body")]),
    );
    // Subscribe before any work so every published event is buffered.
    let mut rx = p.publisher.subscribe();
    let campaign = p.service.create_campaign(campaign_request(&p), "it").unwrap();

    let (handle, shutdown) = shutdown_channel();
    let pool_task = tokio::spawn(Arc::clone(&p.pool).start_workers(shutdown, 1));
    wait_for_status(&p.store, campaign.id, CampaignStatus::Completed).await;
    handle.trigger();
    pool_task.await.unwrap();

    let mut raw_events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(raw) => raw_events.push(raw),
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }

    // Progress events never regress.
    let mut last = 0.0_f64;
    let mut progress_count = 0;
    for raw in &raw_events {
        let value: serde_json::Value = serde_json::from_str(raw).unwrap();
        if value["type"] == "phase.progress" {
            let pct = value["data"]["progress_percentage"].as_f64().unwrap();
            assert!(
                pct + 1e-9 >= last,
                "progress regressed from {last} to {pct}"
            );
            last = pct;
            progress_count += 1;
        }
    }
    assert!(progress_count >= 3, "expected progress events per phase");

    // The shared offset landed exactly at the campaign budget.
    let conn = p.store.lock().unwrap();
    let state: (i64, i64) = conn
        .query_row(
            "SELECT last_offset, version FROM domain_generation_config_states",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(state.0, 4);
    assert!(state.1 >= 2, "registration plus at least one advance");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_dns_batch_persists_partials_and_resumes_cleanly() {
    let p = pipeline(
        ScriptedDns::new(["aatest.com", "abtest.com", "batest.com", "bbtest.com"]),
        ScriptedHttp::new(&[]),
    );
    let campaign = p.service.create_campaign(campaign_request(&p), "it").unwrap();

    // Drive generation to completion by hand.
    let generation = GenerationProcessor::new(
        Arc::clone(&p.store),
        Arc::clone(&p.coordinator),
        Arc::new(ConfigStateManager::new(Arc::clone(&p.store))),
        EventPublisher::new(16),
        &test_settings(),
    );
    let shutdown = Shutdown::never();
    loop {
        let outcome = generation.run(campaign.id, &shutdown).await.unwrap();
        if outcome.done {
            break;
        }
    }

    // First DNS batch under an already-cancelled context: partial results
    // are persisted as errors and the batch reports failure.
    let dns = DnsProcessor::new(
        Arc::clone(&p.store),
        Arc::clone(&p.coordinator),
        EventPublisher::new(16),
        Arc::clone(&p.dns) as Arc<dyn DnsClient>,
        &test_settings(),
    );
    let (cancel_handle, cancelled) = shutdown_channel();
    cancel_handle.trigger();
    let err = dns.run(campaign.id, &cancelled).await;
    assert!(err.is_err(), "cancelled batch must report failure");
    {
        let conn = p.store.lock().unwrap();
        let persisted = results::dns_results(&conn, campaign.id, None).unwrap();
        assert_eq!(persisted.len(), 2, "one batch of partial results persisted");
        assert!(
            persisted
                .iter()
                .all(|r| r.validation_status == DnsStatus::Error)
        );
    }

    // Resume with a live context until the phase completes: every domain
    // ends with a verdict and no duplicates exist.
    let live = Shutdown::never();
    loop {
        let outcome = dns.run(campaign.id, &live).await.unwrap();
        if outcome.done {
            break;
        }
    }
    let conn = p.store.lock().unwrap();
    assert_eq!(results::count_dns_results(&conn, campaign.id).unwrap(), 4);
    assert_eq!(
        results::count_resolved_dns_results(&conn, campaign.id).unwrap(),
        4
    );
    let campaign_row = campaigns::get(&conn, campaign.id).unwrap();
    assert_eq!(
        campaign_row.current_phase,
        CampaignPhase::HttpKeywordValidation
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retriggered_dns_phase_preserves_resolved_results() {
    let p = pipeline(
        ScriptedDns::new(["aatest.com", "abtest.com"]),
        ScriptedHttp::new(&[("aatest.com", "pricing inside"), ("abtest.com", "x")]),
    );
    let campaign = p.service.create_campaign(campaign_request(&p), "it").unwrap();

    let (handle, shutdown) = shutdown_channel();
    let pool_task = tokio::spawn(Arc::clone(&p.pool).start_workers(shutdown, 1));
    wait_for_status(&p.store, campaign.id, CampaignStatus::Completed).await;
    handle.trigger();
    pool_task.await.unwrap();

    // Two of four resolved on the first pass.
    let preserved_ids: HashMap<String, Uuid> = {
        let conn = p.store.lock().unwrap();
        assert_eq!(
            results::count_resolved_dns_results(&conn, campaign.id).unwrap(),
            2
        );
        results::dns_results(&conn, campaign.id, Some(DnsStatus::Resolved))
            .unwrap()
            .into_iter()
            .map(|r| (r.domain_name, r.id))
            .collect()
    };

    // The remaining domains become resolvable and the DNS phase is
    // re-triggered on the completed campaign.
    p.dns.allow("batest.com");
    p.dns.allow("bbtest.com");
    {
        let conn = p.store.lock().unwrap();
        conn.execute(
            "UPDATE campaigns SET current_phase = 'dns_validation',
                 phase_status = 'completed', status = 'queued',
                 total_items = NULL, processed_items = 0
             WHERE id = ?1",
            rusqlite::params![campaign.id.to_string()],
        )
        .unwrap();
    }
    p.queue
        .create(&leadstudio::models::CampaignJob::new(
            campaign.id,
            leadstudio::models::JobType::DnsValidation,
            3,
        ))
        .unwrap();

    let (handle, shutdown) = shutdown_channel();
    let pool_task = tokio::spawn(Arc::clone(&p.pool).start_workers(shutdown, 1));
    wait_for_status(&p.store, campaign.id, CampaignStatus::Completed).await;
    handle.trigger();
    pool_task.await.unwrap();

    let conn = p.store.lock().unwrap();
    let resolved = results::dns_results(&conn, campaign.id, Some(DnsStatus::Resolved)).unwrap();
    assert_eq!(resolved.len(), 4, "all four resolved after the re-trigger");
    for result in &resolved {
        if let Some(original) = preserved_ids.get(&result.domain_name) {
            assert_eq!(
                &result.id, original,
                "previously resolved {} must be preserved, not re-validated",
                result.domain_name
            );
        }
    }
}
