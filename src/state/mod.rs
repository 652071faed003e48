//! Event-sourced campaign state coordinator.
//!
//! Every status change goes through [`StateCoordinator::transition`], which
//! appends to the per-campaign event log (dense sequence numbers starting at
//! 1), writes the denormalized transition row, and updates the campaign row,
//! all in one transaction. Current status is always reproducible as a fold
//! over the log; snapshots bound how much of the log a replay has to read.

pub mod machine;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use serde_json::{Value, json};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{StateError, StoreError};
use crate::events::{CampaignEvent, EventPublisher};
use crate::models::{
    Campaign, CampaignStatus, EventSource, StateEvent, StateSnapshot, StateTransition,
};
use crate::store::{CampaignStore, campaigns, state_events};

/// Hook invoked after a transition commits. Failures are the handler's
/// problem; the coordinator only logs them via the panic boundary of the
/// calling task.
pub type EventHandler = Arc<dyn Fn(&StateEvent) + Send + Sync>;

/// Extra admission check consulted before the edge check. Returning an
/// error message rejects the transition.
pub type StateValidator =
    Arc<dyn Fn(&Campaign, CampaignStatus) -> Result<(), String> + Send + Sync>;

/// Handler registration key: a target status (`as_str` form) or `"*"`.
pub const HANDLE_ALL_EVENTS: &str = "*";

/// Write a snapshot every this many events.
const DEFAULT_SNAPSHOT_INTERVAL: i64 = 20;

pub struct StateCoordinator {
    store: Arc<CampaignStore>,
    publisher: EventPublisher,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    validators: RwLock<Vec<StateValidator>>,
    metrics: Mutex<HashMap<String, i64>>,
    snapshot_interval: i64,
}

impl StateCoordinator {
    pub fn new(store: Arc<CampaignStore>, publisher: EventPublisher) -> Self {
        Self {
            store,
            publisher,
            handlers: RwLock::new(HashMap::new()),
            validators: RwLock::new(Vec::new()),
            metrics: Mutex::new(HashMap::new()),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }

    /// Apply a status transition. The atomic unit covers the edge check,
    /// sequence allocation, event + transition append, and the campaign row
    /// update; handlers and the broadcast happen after commit.
    pub fn transition(
        &self,
        campaign_id: Uuid,
        to: CampaignStatus,
        source: EventSource,
        actor: &str,
        reason: &str,
        context: Option<Value>,
    ) -> Result<StateEvent, StateError> {
        let event = {
            let mut conn = self.store.lock().map_err(StoreError::from)?;
            let tx = conn.transaction().map_err(StoreError::from)?;

            let campaign = campaigns::get(&tx, campaign_id)?;
            let from = campaign.status;
            if !machine::is_allowed(from, to) {
                self.bump("transitions_rejected");
                return Err(StateError::InvalidTransition {
                    campaign_id,
                    from,
                    to,
                });
            }
            if let Ok(validators) = self.validators.read() {
                for validator in validators.iter() {
                    if let Err(reason) = validator(&campaign, to) {
                        self.bump("transitions_rejected");
                        return Err(StateError::RejectedByValidator {
                            campaign_id,
                            reason,
                        });
                    }
                }
            }

            let sequence = state_events::next_sequence(&tx, campaign_id)?;
            let event = StateEvent {
                id: Uuid::new_v4(),
                campaign_id,
                sequence_number: sequence,
                previous_state: Some(from),
                new_state: to,
                source,
                actor: actor.to_string(),
                reason: reason.to_string(),
                occurred_at: Utc::now(),
                context,
            };
            state_events::insert_event(&tx, &event)?;
            state_events::insert_transition(
                &tx,
                &StateTransition {
                    campaign_id,
                    from_state: Some(from),
                    to_state: to,
                    event_id: event.id,
                    occurred_at: event.occurred_at,
                },
            )?;
            campaigns::update_status(&tx, campaign_id, to)?;

            if sequence % self.snapshot_interval == 0 {
                let refreshed = campaigns::get(&tx, campaign_id)?;
                state_events::insert_snapshot(&tx, &snapshot_of(&refreshed, sequence))?;
                self.bump("snapshots_written");
            }

            tx.commit().map_err(StoreError::from)?;
            event
        };

        self.bump("transitions_applied");
        info!(
            campaign_id = %campaign_id,
            from = %event.previous_state.map(|s| s.as_str()).unwrap_or("-"),
            to = %to,
            actor,
            reason,
            "campaign state transition"
        );
        self.run_handlers(&event);
        self.publisher.publish(&CampaignEvent::StatusUpdated {
            campaign_id,
            previous_status: event.previous_state,
            new_status: to,
            source,
            reason: reason.to_string(),
        });
        match to {
            CampaignStatus::Completed => {
                self.publisher
                    .publish(&CampaignEvent::CampaignCompleted { campaign_id });
            }
            CampaignStatus::Failed => {
                self.publisher.publish(&CampaignEvent::CampaignFailed {
                    campaign_id,
                    reason: reason.to_string(),
                });
            }
            _ => {}
        }
        Ok(event)
    }

    /// Record the very first event for a freshly created campaign, seeding
    /// the log at sequence 1 with no previous state.
    pub fn record_creation(
        &self,
        campaign: &Campaign,
        actor: &str,
    ) -> Result<StateEvent, StateError> {
        let event = {
            let mut conn = self.store.lock().map_err(StoreError::from)?;
            let tx = conn.transaction().map_err(StoreError::from)?;
            let sequence = state_events::next_sequence(&tx, campaign.id)?;
            let event = StateEvent {
                id: Uuid::new_v4(),
                campaign_id: campaign.id,
                sequence_number: sequence,
                previous_state: None,
                new_state: campaign.status,
                source: EventSource::User,
                actor: actor.to_string(),
                reason: "campaign created".to_string(),
                occurred_at: Utc::now(),
                context: None,
            };
            state_events::insert_event(&tx, &event)?;
            state_events::insert_transition(
                &tx,
                &StateTransition {
                    campaign_id: campaign.id,
                    from_state: None,
                    to_state: campaign.status,
                    event_id: event.id,
                    occurred_at: event.occurred_at,
                },
            )?;
            tx.commit().map_err(StoreError::from)?;
            event
        };
        self.bump("events_appended");
        self.run_handlers(&event);
        Ok(event)
    }

    pub fn campaign(&self, campaign_id: Uuid) -> Result<Campaign, StateError> {
        let conn = self.store.lock().map_err(StoreError::from)?;
        Ok(campaigns::get(&conn, campaign_id)?)
    }

    pub fn history(
        &self,
        campaign_id: Uuid,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StateEvent>, StateError> {
        let conn = self.store.lock().map_err(StoreError::from)?;
        Ok(state_events::history(&conn, campaign_id, limit, offset)?)
    }

    /// Fold the event log (on top of the latest snapshot) into the current
    /// status. `None` when the campaign has no events at all.
    pub fn replay(&self, campaign_id: Uuid) -> Result<Option<CampaignStatus>, StateError> {
        let conn = self.store.lock().map_err(StoreError::from)?;
        let snapshot = state_events::latest_snapshot(&conn, campaign_id)?;
        let (mut status, after) = match &snapshot {
            Some(s) => (Some(s.current_state), s.last_event_sequence),
            None => (None, 0),
        };
        for event in state_events::events_after(&conn, campaign_id, after)? {
            status = Some(event.new_state);
        }
        Ok(status)
    }

    /// Verify the event log is dense from 1; returns the missing sequence
    /// numbers otherwise.
    pub fn validate_event_integrity(&self, campaign_id: Uuid) -> Result<(), StateError> {
        let sequences = {
            let conn = self.store.lock().map_err(StoreError::from)?;
            state_events::sequence_numbers(&conn, campaign_id)?
        };
        let mut missing = Vec::new();
        let mut expected = 1;
        for seq in &sequences {
            while expected < *seq {
                missing.push(expected);
                expected += 1;
            }
            expected += 1;
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StateError::SequenceGap {
                campaign_id,
                missing,
            })
        }
    }

    /// Cross-check the event log against the campaign row.
    pub fn validate_consistency(&self, campaign_id: Uuid) -> Result<(), StateError> {
        self.validate_event_integrity(campaign_id)?;
        let replayed = self.replay(campaign_id)?;
        let stored = {
            let conn = self.store.lock().map_err(StoreError::from)?;
            campaigns::get(&conn, campaign_id)?.status
        };
        match replayed {
            Some(replayed) if replayed != stored => Err(StateError::Inconsistent {
                campaign_id,
                detail: format!("event log says {replayed}, campaign row says {stored}"),
            }),
            _ => Ok(()),
        }
    }

    /// Re-apply the event log if the campaign row has drifted from it. The
    /// log is authoritative.
    pub fn reconcile(&self, campaign_id: Uuid) -> Result<(), StateError> {
        match self.validate_consistency(campaign_id) {
            Ok(()) => Ok(()),
            Err(StateError::Inconsistent { .. }) => {
                let Some(replayed) = self.replay(campaign_id)? else {
                    return Ok(());
                };
                warn!(
                    campaign_id = %campaign_id,
                    replayed = %replayed,
                    "campaign row drifted from event log, reconciling"
                );
                let conn = self.store.lock().map_err(StoreError::from)?;
                campaigns::force_status(&conn, campaign_id, replayed)?;
                self.bump("reconciliations");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    /// Write a snapshot of the campaign's current state on demand.
    pub fn snapshot(&self, campaign_id: Uuid) -> Result<StateSnapshot, StateError> {
        let conn = self.store.lock().map_err(StoreError::from)?;
        let campaign = campaigns::get(&conn, campaign_id)?;
        let last_sequence = state_events::next_sequence(&conn, campaign_id)? - 1;
        let snapshot = snapshot_of(&campaign, last_sequence);
        state_events::insert_snapshot(&conn, &snapshot)?;
        self.bump("snapshots_written");
        Ok(snapshot)
    }

    pub fn latest_snapshot(
        &self,
        campaign_id: Uuid,
    ) -> Result<Option<StateSnapshot>, StateError> {
        let conn = self.store.lock().map_err(StoreError::from)?;
        Ok(state_events::latest_snapshot(&conn, campaign_id)?)
    }

    /// Register a post-commit hook for transitions into the given status
    /// (`as_str` form), or [`HANDLE_ALL_EVENTS`] for every transition.
    pub fn add_event_handler(&self, event_type: &str, handler: EventHandler) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers
                .entry(event_type.to_string())
                .or_default()
                .push(handler);
        }
    }

    pub fn add_state_validator(&self, validator: StateValidator) {
        if let Ok(mut validators) = self.validators.write() {
            validators.push(validator);
        }
    }

    pub fn metrics(&self) -> HashMap<String, i64> {
        self.metrics
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    fn run_handlers(&self, event: &StateEvent) {
        let Ok(handlers) = self.handlers.read() else {
            return;
        };
        let keys = [event.new_state.as_str(), HANDLE_ALL_EVENTS];
        for key in keys {
            if let Some(list) = handlers.get(key) {
                for handler in list {
                    handler(event);
                }
            }
        }
        debug!(
            campaign_id = %event.campaign_id,
            sequence = event.sequence_number,
            "event handlers dispatched"
        );
    }

    fn bump(&self, key: &str) {
        if let Ok(mut metrics) = self.metrics.lock() {
            *metrics.entry(key.to_string()).or_insert(0) += 1;
        }
    }
}

fn snapshot_of(campaign: &Campaign, last_event_sequence: i64) -> StateSnapshot {
    StateSnapshot {
        id: Uuid::new_v4(),
        campaign_id: campaign.id,
        current_state: campaign.status,
        state_data: json!({
            "current_phase": campaign.current_phase,
            "phase_status": campaign.phase_status,
            "processed_items": campaign.processed_items,
            "total_items": campaign.total_items,
            "progress_percentage": campaign.progress_percentage,
        }),
        last_event_sequence,
        is_valid: true,
        created_at: Utc::now(),
    }
}
