//! Typed campaign events and the broadcast publisher.
//!
//! The core publishes JSON-serialized events onto a `tokio::sync::broadcast`
//! channel; fan-out to clients (WebSocket or otherwise) is wired up outside
//! the core. Publishing never fails the caller: an empty channel or a
//! serialization problem is logged and dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::models::{Campaign, CampaignPhase, CampaignStatus, DnsStatus, EventSource};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CampaignEvent {
    #[serde(rename = "campaign.created")]
    CampaignCreated { campaign: Campaign },

    #[serde(rename = "campaign.status.updated")]
    StatusUpdated {
        campaign_id: Uuid,
        previous_status: Option<CampaignStatus>,
        new_status: CampaignStatus,
        source: EventSource,
        reason: String,
    },

    #[serde(rename = "campaign.phase.transition")]
    PhaseTransition {
        campaign_id: Uuid,
        previous_phase: CampaignPhase,
        new_phase: CampaignPhase,
        trigger_reason: String,
    },

    #[serde(rename = "phase.started")]
    PhaseStarted {
        campaign_id: Uuid,
        phase: CampaignPhase,
    },

    #[serde(rename = "phase.completed")]
    PhaseCompleted {
        campaign_id: Uuid,
        phase: CampaignPhase,
    },

    #[serde(rename = "phase.progress")]
    PhaseProgress {
        campaign_id: Uuid,
        phase: CampaignPhase,
        processed_items: i64,
        total_items: i64,
        progress_percentage: f64,
    },

    #[serde(rename = "dns.validation.result")]
    DnsValidationResult {
        campaign_id: Uuid,
        domain_id: Option<Uuid>,
        domain: String,
        validation_status: DnsStatus,
        dns_records: Value,
        attempts: i64,
    },

    #[serde(rename = "campaign.completed")]
    CampaignCompleted { campaign_id: Uuid },

    #[serde(rename = "campaign.failed")]
    CampaignFailed { campaign_id: Uuid, reason: String },
}

/// Cheap-to-clone sender handle. Every subsystem that streams progress
/// holds one.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<String>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Serialize and broadcast. Returns silently when nobody is listening.
    pub fn publish(&self, event: &CampaignEvent) {
        match serde_json::to_string(event) {
            Ok(json) => {
                let _ = self.tx.send(json);
            }
            Err(e) => {
                warn!(error = %e, "failed to serialize campaign event");
            }
        }
    }
}
