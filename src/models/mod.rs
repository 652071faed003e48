//! Persistent entities of the campaign pipeline.
//!
//! Every status enum carries `as_str`/`from_str` mappings used by the store
//! (statuses are persisted as text) and by the event payloads.

mod params;

pub use params::{
    DnsValidationParams, DomainGenerationParams, HttpKeywordParams, PatternType, PhaseParams,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ── Campaign ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Pending,
    Queued,
    Running,
    Pausing,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Archived,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Archived => "archived",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "pausing" => Ok(Self::Pausing),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "archived" => Ok(Self::Archived),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignPhase {
    DomainGeneration,
    DnsValidation,
    HttpKeywordValidation,
    Analysis,
}

impl CampaignPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DomainGeneration => "domain_generation",
            Self::DnsValidation => "dns_validation",
            Self::HttpKeywordValidation => "http_keyword_validation",
            Self::Analysis => "analysis",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "domain_generation" => Ok(Self::DomainGeneration),
            "dns_validation" => Ok(Self::DnsValidation),
            "http_keyword_validation" => Ok(Self::HttpKeywordValidation),
            "analysis" => Ok(Self::Analysis),
            _ => Err(format!("Invalid campaign phase: {}", s)),
        }
    }

    /// The phase that follows this one in the pipeline, if any.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::DomainGeneration => Some(Self::DnsValidation),
            Self::DnsValidation => Some(Self::HttpKeywordValidation),
            Self::HttpKeywordValidation => Some(Self::Analysis),
            Self::Analysis => None,
        }
    }
}

impl std::fmt::Display for CampaignPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    NotStarted,
    InProgress,
    Completed,
    Paused,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Paused => "paused",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "paused" => Ok(Self::Paused),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub name: String,
    pub current_phase: CampaignPhase,
    pub phase_status: PhaseStatus,
    pub status: CampaignStatus,
    pub total_items: Option<i64>,
    pub processed_items: i64,
    pub progress_percentage: Option<f64>,
    pub metadata: Value,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(name: &str, user_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            current_phase: CampaignPhase::DomainGeneration,
            phase_status: PhaseStatus::NotStarted,
            status: CampaignStatus::Pending,
            total_items: None,
            processed_items: 0,
            progress_percentage: None,
            metadata: Value::Object(Default::default()),
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Generated domains ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedDomain {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub domain_name: String,
    pub offset_index: i64,
    pub generated_at: DateTime<Utc>,
}

// ── DNS validation results ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsStatus {
    Resolved,
    Unresolved,
    Timeout,
    Error,
    Pending,
}

impl DnsStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::Unresolved => "unresolved",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Pending => "pending",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "resolved" => Ok(Self::Resolved),
            "unresolved" => Ok(Self::Unresolved),
            "timeout" => Ok(Self::Timeout),
            "error" => Ok(Self::Error),
            "pending" => Ok(Self::Pending),
            _ => Err(format!("Invalid DNS validation status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsResult {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub generated_domain_id: Option<Uuid>,
    pub domain_name: String,
    pub validation_status: DnsStatus,
    /// Resolved record data as returned by the resolver, opaque to the core.
    pub dns_records: Value,
    pub validated_by_persona_id: Option<Uuid>,
    pub attempts: i64,
    pub last_checked_at: DateTime<Utc>,
}

// ── HTTP / keyword results ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpValidationStatus {
    LeadValid,
    HttpValidNoKeywords,
    InvalidHttpResponseError,
    InvalidHttpCode,
    CancelledDuringProcessing,
    ProcessingFailedBeforeHttp,
}

impl HttpValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeadValid => "lead_valid",
            Self::HttpValidNoKeywords => "http_valid_no_keywords",
            Self::InvalidHttpResponseError => "invalid_http_response_error",
            Self::InvalidHttpCode => "invalid_http_code",
            Self::CancelledDuringProcessing => "cancelled_during_processing",
            Self::ProcessingFailedBeforeHttp => "processing_failed_before_http",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "lead_valid" => Ok(Self::LeadValid),
            "http_valid_no_keywords" => Ok(Self::HttpValidNoKeywords),
            "invalid_http_response_error" => Ok(Self::InvalidHttpResponseError),
            "invalid_http_code" => Ok(Self::InvalidHttpCode),
            "cancelled_during_processing" => Ok(Self::CancelledDuringProcessing),
            "processing_failed_before_http" => Ok(Self::ProcessingFailedBeforeHttp),
            _ => Err(format!("Invalid HTTP validation status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResult {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub dns_result_id: Option<Uuid>,
    pub domain_name: String,
    pub http_status_code: Option<i64>,
    pub response_headers: Option<Value>,
    pub content_hash: Option<String>,
    pub page_title: Option<String>,
    pub snippet: Option<String>,
    pub found_keywords_from_sets: Vec<String>,
    pub found_ad_hoc_keywords: Vec<String>,
    pub validation_status: HttpValidationStatus,
    pub validated_by_persona_id: Option<Uuid>,
    pub used_proxy_id: Option<Uuid>,
    pub attempts: i64,
    pub last_checked_at: DateTime<Utc>,
}

// ── Jobs ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Secondary status refining `JobStatus::Queued`. Currently only `retry`.
pub const JOB_BUSINESS_RETRY: &str = "retry";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    DomainGeneration,
    DnsValidation,
    HttpKeywordValidation,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DomainGeneration => "domain_generation",
            Self::DnsValidation => "dns_validation",
            Self::HttpKeywordValidation => "http_keyword_validation",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "domain_generation" => Ok(Self::DomainGeneration),
            "dns_validation" => Ok(Self::DnsValidation),
            "http_keyword_validation" => Ok(Self::HttpKeywordValidation),
            _ => Err(format!("Invalid job type: {}", s)),
        }
    }

    /// The job type that runs batches for the given phase, if the phase has one.
    pub fn for_phase(phase: CampaignPhase) -> Option<Self> {
        match phase {
            CampaignPhase::DomainGeneration => Some(Self::DomainGeneration),
            CampaignPhase::DnsValidation => Some(Self::DnsValidation),
            CampaignPhase::HttpKeywordValidation => Some(Self::HttpKeywordValidation),
            CampaignPhase::Analysis => None,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignJob {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    pub business_status: Option<String>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub scheduled_at: DateTime<Utc>,
    pub next_execution_at: DateTime<Utc>,
    pub processing_server_id: Option<String>,
    pub last_error: Option<String>,
    pub payload: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CampaignJob {
    /// A fresh job, immediately eligible for leasing.
    pub fn new(campaign_id: Uuid, job_type: JobType, max_attempts: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            job_type,
            status: JobStatus::Queued,
            business_status: None,
            attempts: 0,
            max_attempts,
            scheduled_at: now,
            next_execution_at: now,
            processing_server_id: None,
            last_error: None,
            payload: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_retry(&self) -> bool {
        self.business_status.as_deref() == Some(JOB_BUSINESS_RETRY)
    }
}

// ── Generation config state ──────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigState {
    pub config_hash: String,
    pub last_offset: i64,
    pub config_details: Value,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConfigState {
    /// A not-yet-persisted state at version 0. Persisting it through an
    /// atomic update lands as version 1.
    pub fn unregistered(config_hash: &str) -> Self {
        let now = Utc::now();
        Self {
            config_hash: config_hash.to_string(),
            last_offset: 0,
            config_details: Value::Object(Default::default()),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── State events ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Orchestrator,
    DomainGen,
    Dns,
    HttpKeyword,
    System,
    User,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::DomainGen => "domain_gen",
            Self::Dns => "dns",
            Self::HttpKeyword => "http_keyword",
            Self::System => "system",
            Self::User => "user",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "orchestrator" => Ok(Self::Orchestrator),
            "domain_gen" => Ok(Self::DomainGen),
            "dns" => Ok(Self::Dns),
            "http_keyword" => Ok(Self::HttpKeyword),
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            _ => Err(format!("Invalid event source: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEvent {
    pub id: Uuid,
    pub campaign_id: Uuid,
    /// Dense, strictly increasing per campaign, starting at 1.
    pub sequence_number: i64,
    pub previous_state: Option<CampaignStatus>,
    pub new_state: CampaignStatus,
    pub source: EventSource,
    pub actor: String,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
    pub context: Option<Value>,
}

/// Denormalized transition pair for history queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub campaign_id: Uuid,
    pub from_state: Option<CampaignStatus>,
    pub to_state: CampaignStatus,
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub current_state: CampaignStatus,
    pub state_data: Value,
    pub last_event_sequence: i64,
    pub is_valid: bool,
    pub created_at: DateTime<Utc>,
}

// ── Personas & keywords ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaType {
    Dns,
    Http,
}

impl PersonaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::Http => "http",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "dns" => Ok(Self::Dns),
            "http" => Ok(Self::Http),
            _ => Err(format!("Invalid persona type: {}", s)),
        }
    }
}

impl std::fmt::Display for PersonaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, opaque probing configuration. The core only reads the type tag
/// and the enabled flag; `config_details` is interpreted by the validators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: Uuid,
    pub name: String,
    pub persona_type: PersonaType,
    pub config_details: Value,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordSet {
    pub id: Uuid,
    pub name: String,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordRuleType {
    Substring,
    Regex,
}

impl KeywordRuleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Substring => "substring",
            Self::Regex => "regex",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "substring" => Ok(Self::Substring),
            "regex" => Ok(Self::Regex),
            _ => Err(format!("Invalid keyword rule type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRule {
    pub id: Uuid,
    pub keyword_set_id: Uuid,
    pub rule_type: KeywordRuleType,
    pub pattern: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn campaign_status_string_roundtrip() {
        for status in [
            CampaignStatus::Pending,
            CampaignStatus::Queued,
            CampaignStatus::Running,
            CampaignStatus::Pausing,
            CampaignStatus::Paused,
            CampaignStatus::Completed,
            CampaignStatus::Failed,
            CampaignStatus::Cancelled,
            CampaignStatus::Archived,
        ] {
            assert_eq!(CampaignStatus::from_str(status.as_str()), Ok(status));
        }
        assert!(CampaignStatus::from_str("bogus").is_err());
    }

    #[test]
    fn phase_order_is_generation_dns_http_analysis() {
        assert_eq!(
            CampaignPhase::DomainGeneration.next(),
            Some(CampaignPhase::DnsValidation)
        );
        assert_eq!(
            CampaignPhase::DnsValidation.next(),
            Some(CampaignPhase::HttpKeywordValidation)
        );
        assert_eq!(
            CampaignPhase::HttpKeywordValidation.next(),
            Some(CampaignPhase::Analysis)
        );
        assert_eq!(CampaignPhase::Analysis.next(), None);
    }

    #[test]
    fn job_type_maps_to_phase() {
        assert_eq!(
            JobType::for_phase(CampaignPhase::DnsValidation),
            Some(JobType::DnsValidation)
        );
        assert_eq!(JobType::for_phase(CampaignPhase::Analysis), None);
    }

    #[test]
    fn new_campaign_starts_pending_at_generation_phase() {
        let c = Campaign::new("acme leads", None);
        assert_eq!(c.status, CampaignStatus::Pending);
        assert_eq!(c.current_phase, CampaignPhase::DomainGeneration);
        assert_eq!(c.phase_status, PhaseStatus::NotStarted);
        assert_eq!(c.processed_items, 0);
        assert!(c.total_items.is_none());
        assert!(c.progress_percentage.is_none());
    }

    #[test]
    fn new_job_is_immediately_eligible() {
        let job = CampaignJob::new(Uuid::new_v4(), JobType::DomainGeneration, 3);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert!(!job.is_retry());
        assert!(job.next_execution_at <= Utc::now());
    }

    #[test]
    fn unregistered_config_state_is_version_zero() {
        let s = ConfigState::unregistered("deadbeef");
        assert_eq!(s.version, 0);
        assert_eq!(s.last_offset, 0);
    }

    #[test]
    fn campaign_serializes_statuses_as_snake_case() {
        let c = Campaign::new("x", None);
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"status\":\"pending\""));
        assert!(json.contains("\"current_phase\":\"domain_generation\""));
    }
}
