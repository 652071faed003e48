//! Typed error hierarchy for the campaign execution core.
//!
//! Each subsystem gets its own enum:
//! - `StoreError` — datastore access and missing-row conditions
//! - `ConfigStateError` — generation-offset coordination failures
//! - `StateError` — state machine and event-log failures
//! - `ValidationError` — business-rule violations at configure time
//! - `ServiceError` — campaign service composition of the above

use thiserror::Error;
use uuid::Uuid;

use crate::models::{CampaignPhase, CampaignStatus, PersonaType};

/// Errors from the campaign store. Every "row absent" condition maps to a
/// single distinguishable variant so callers can branch on it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Campaign {id} not found")]
    CampaignNotFound { id: Uuid },

    #[error("Job {id} not found")]
    JobNotFound { id: Uuid },

    #[error("Persona {id} not found")]
    PersonaNotFound { id: Uuid },

    #[error("Keyword set {id} not found")]
    KeywordSetNotFound { id: Uuid },

    #[error("No {phase} parameters stored for campaign {campaign_id}")]
    PhaseParamsNotFound {
        campaign_id: Uuid,
        phase: CampaignPhase,
    },

    #[error("Config state {config_hash} not found")]
    ConfigStateNotFound { config_hash: String },

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Stored payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Errors from the generation-offset config manager.
#[derive(Debug, Error)]
pub enum ConfigStateError {
    #[error("Version conflict for {config_hash}: expected {expected}, current {current}")]
    VersionConflict {
        config_hash: String,
        expected: i64,
        current: i64,
    },

    /// The offset invariant was breached: offsets never move backward.
    #[error("Offset regression for {config_hash}: attempted {attempted} < current {current}")]
    OffsetRegression {
        config_hash: String,
        attempted: i64,
        current: i64,
    },

    #[error("Update for {config_hash} still conflicted after {attempts} attempts")]
    RetriesExhausted { config_hash: String, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the state coordinator.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Invalid transition for campaign {campaign_id}: {from} -> {to}")]
    InvalidTransition {
        campaign_id: Uuid,
        from: CampaignStatus,
        to: CampaignStatus,
    },

    #[error("Transition for campaign {campaign_id} rejected by validator: {reason}")]
    RejectedByValidator { campaign_id: Uuid, reason: String },

    #[error("State events for campaign {campaign_id} have gaps: missing sequences {missing:?}")]
    SequenceGap { campaign_id: Uuid, missing: Vec<i64> },

    #[error("Campaign {campaign_id} state is inconsistent: {detail}")]
    Inconsistent { campaign_id: Uuid, detail: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Business-rule violations raised while configuring a campaign.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Campaign name must not be empty")]
    EmptyName,

    #[error("Character set must not be empty")]
    EmptyCharacterSet,

    #[error("Character set contains invalid character {found:?} (allowed: A-Z a-z 0-9 -)")]
    InvalidCharacterSet { found: char },

    #[error("Character set contains duplicate character {found:?}")]
    DuplicateCharacter { found: char },

    #[error("Variable length must be at least 1, got {got}")]
    VariableLengthOutOfRange { got: u32 },

    #[error("Constant string {value:?} is not a valid domain label component")]
    InvalidConstantString { value: String },

    #[error("TLD {value:?} must be at least two ASCII letters")]
    InvalidTld { value: String },

    #[error("Requested {requested} domains but the configuration only spans {available}")]
    DomainCountExceedsSpace { requested: i64, available: i64 },

    #[error("Requested domain count must be positive, got {got}")]
    NonPositiveDomainCount { got: i64 },

    #[error("At least one persona is required for {phase}")]
    NoPersonas { phase: CampaignPhase },

    #[error("Persona {id} is disabled")]
    PersonaDisabled { id: Uuid },

    #[error("Persona {id} has type {actual}, expected {expected}")]
    PersonaTypeMismatch {
        id: Uuid,
        expected: PersonaType,
        actual: PersonaType,
    },

    #[error("Keyword set {id} is disabled")]
    KeywordSetDisabled { id: Uuid },

    #[error("Keyword rule {pattern:?} is not a valid regex: {detail}")]
    InvalidKeywordRule { pattern: String, detail: String },

    #[error("Batch size must be positive")]
    NonPositiveBatchSize,

    #[error("{phase} parameters are required")]
    MissingParams { phase: CampaignPhase },

    #[error("Active campaign limit of {limit} exceeded")]
    CampaignLimitExceeded { limit: i64 },
}

/// Errors surfaced by the campaign service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    ConfigState(#[from] ConfigStateError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_not_found_carries_id() {
        let id = Uuid::new_v4();
        let err = StoreError::CampaignNotFound { id };
        assert!(err.to_string().contains(&id.to_string()));
        assert!(matches!(err, StoreError::CampaignNotFound { .. }));
    }

    #[test]
    fn config_state_error_regression_is_matchable() {
        let err = ConfigStateError::OffsetRegression {
            config_hash: "abc".into(),
            attempted: 3,
            current: 7,
        };
        match &err {
            ConfigStateError::OffsetRegression {
                attempted, current, ..
            } => {
                assert_eq!(*attempted, 3);
                assert_eq!(*current, 7);
            }
            _ => panic!("Expected OffsetRegression"),
        }
    }

    #[test]
    fn state_error_invalid_transition_mentions_both_states() {
        let err = StateError::InvalidTransition {
            campaign_id: Uuid::new_v4(),
            from: CampaignStatus::Pending,
            to: CampaignStatus::Completed,
        };
        let msg = err.to_string();
        assert!(msg.contains("pending"));
        assert!(msg.contains("completed"));
    }

    #[test]
    fn service_error_converts_from_validation_error() {
        let inner = ValidationError::EmptyCharacterSet;
        let err: ServiceError = inner.into();
        assert!(matches!(
            err,
            ServiceError::Validation(ValidationError::EmptyCharacterSet)
        ));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::LockPoisoned);
        assert_std_error(&ConfigStateError::RetriesExhausted {
            config_hash: "x".into(),
            attempts: 3,
        });
        assert_std_error(&StateError::SequenceGap {
            campaign_id: Uuid::new_v4(),
            missing: vec![2],
        });
        assert_std_error(&ValidationError::EmptyName);
    }
}
