//! Campaign rows and per-phase parameter payloads.

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::{
    Campaign, CampaignPhase, CampaignStatus, PhaseParams, PhaseStatus,
};

use super::{
    conv_err, json_field, opt_ts_field, opt_ts_text, opt_uuid_field, ts_field, ts_text, uuid_field,
};

const CAMPAIGN_COLUMNS: &str = "id, user_id, name, current_phase, phase_status, status, \
     total_items, processed_items, progress_percentage, metadata, \
     started_at, completed_at, created_at, updated_at";

fn campaign_from_row(row: &Row<'_>) -> rusqlite::Result<Campaign> {
    let current_phase: String = row.get(3)?;
    let phase_status: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(Campaign {
        id: uuid_field(row, 0)?,
        user_id: opt_uuid_field(row, 1)?,
        name: row.get(2)?,
        current_phase: CampaignPhase::from_str(&current_phase).map_err(|e| conv_err(3, e))?,
        phase_status: PhaseStatus::from_str(&phase_status).map_err(|e| conv_err(4, e))?,
        status: CampaignStatus::from_str(&status).map_err(|e| conv_err(5, e))?,
        total_items: row.get(6)?,
        processed_items: row.get(7)?,
        progress_percentage: row.get(8)?,
        metadata: json_field(row, 9)?,
        started_at: opt_ts_field(row, 10)?,
        completed_at: opt_ts_field(row, 11)?,
        created_at: ts_field(row, 12)?,
        updated_at: ts_field(row, 13)?,
    })
}

pub fn insert(conn: &Connection, campaign: &Campaign) -> Result<(), StoreError> {
    conn.execute(
        &format!("INSERT INTO campaigns ({CAMPAIGN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"),
        params![
            campaign.id.to_string(),
            campaign.user_id.map(|u| u.to_string()),
            campaign.name,
            campaign.current_phase.as_str(),
            campaign.phase_status.as_str(),
            campaign.status.as_str(),
            campaign.total_items,
            campaign.processed_items,
            campaign.progress_percentage,
            campaign.metadata.to_string(),
            opt_ts_text(campaign.started_at),
            opt_ts_text(campaign.completed_at),
            ts_text(campaign.created_at),
            ts_text(campaign.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get(conn: &Connection, id: Uuid) -> Result<Campaign, StoreError> {
    conn.query_row(
        &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
        params![id.to_string()],
        campaign_from_row,
    )
    .optional()?
    .ok_or(StoreError::CampaignNotFound { id })
}

pub fn list(
    conn: &Connection,
    status: Option<CampaignStatus>,
) -> Result<Vec<Campaign>, StoreError> {
    let mut out = Vec::new();
    match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE status = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![status.as_str()], campaign_from_row)?;
            for row in rows {
                out.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CAMPAIGN_COLUMNS} FROM campaigns ORDER BY created_at"
            ))?;
            let rows = stmt.query_map([], campaign_from_row)?;
            for row in rows {
                out.push(row?);
            }
        }
    }
    Ok(out)
}

/// Campaigns still consuming pipeline capacity (not in an absorbing state).
pub fn count_active(conn: &Connection, user_id: Option<Uuid>) -> Result<i64, StoreError> {
    let active = "status NOT IN ('completed', 'failed', 'cancelled', 'archived')";
    let count = match user_id {
        Some(user_id) => conn.query_row(
            &format!("SELECT COUNT(*) FROM campaigns WHERE user_id = ?1 AND {active}"),
            params![user_id.to_string()],
            |row| row.get(0),
        )?,
        None => conn.query_row(
            &format!("SELECT COUNT(*) FROM campaigns WHERE {active}"),
            [],
            |row| row.get(0),
        )?,
    };
    Ok(count)
}

/// Status write used by the state coordinator inside its transition
/// transaction. `started_at` is recorded only once; `completed_at` is set
/// when entering `completed`.
pub fn update_status(
    conn: &Connection,
    id: Uuid,
    status: CampaignStatus,
) -> Result<(), StoreError> {
    let now = ts_text(Utc::now());
    let changed = match status {
        CampaignStatus::Running => conn.execute(
            "UPDATE campaigns SET status = ?1, started_at = COALESCE(started_at, ?2),
                 updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, id.to_string()],
        )?,
        CampaignStatus::Completed => conn.execute(
            "UPDATE campaigns SET status = ?1, completed_at = ?2, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, id.to_string()],
        )?,
        _ => conn.execute(
            "UPDATE campaigns SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now, id.to_string()],
        )?,
    };
    if changed == 0 {
        return Err(StoreError::CampaignNotFound { id });
    }
    Ok(())
}

pub fn update_phase_status(
    conn: &Connection,
    id: Uuid,
    phase_status: PhaseStatus,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE campaigns SET phase_status = ?1, updated_at = ?2 WHERE id = ?3",
        params![phase_status.as_str(), ts_text(Utc::now()), id.to_string()],
    )?;
    if changed == 0 {
        return Err(StoreError::CampaignNotFound { id });
    }
    Ok(())
}

/// Progress write with the monotonicity invariant enforced in SQL:
/// `progress_percentage` never regresses.
pub fn update_progress(
    conn: &Connection,
    id: Uuid,
    processed_items: i64,
    total_items: Option<i64>,
    progress_percentage: f64,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE campaigns SET processed_items = ?1, total_items = ?2,
             progress_percentage = MAX(COALESCE(progress_percentage, 0.0), ?3),
             updated_at = ?4
         WHERE id = ?5",
        params![
            processed_items,
            total_items,
            progress_percentage,
            ts_text(Utc::now()),
            id.to_string()
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::CampaignNotFound { id });
    }
    Ok(())
}

/// Move a campaign into the next phase. Item counters reset for the new
/// phase; the overall percentage is pinned at the band floor so it never
/// moves backward across the boundary.
pub fn advance_phase(
    conn: &Connection,
    id: Uuid,
    next_phase: CampaignPhase,
    band_floor: f64,
) -> Result<(), StoreError> {
    let phase_status = match next_phase {
        // Entering analysis is the end of the pipeline.
        CampaignPhase::Analysis => PhaseStatus::Completed,
        _ => PhaseStatus::NotStarted,
    };
    let changed = conn.execute(
        "UPDATE campaigns SET current_phase = ?1, phase_status = ?2,
             processed_items = 0, total_items = NULL,
             progress_percentage = MAX(COALESCE(progress_percentage, 0.0), ?3),
             updated_at = ?4
         WHERE id = ?5",
        params![
            next_phase.as_str(),
            phase_status.as_str(),
            band_floor,
            ts_text(Utc::now()),
            id.to_string()
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::CampaignNotFound { id });
    }
    Ok(())
}

/// Direct status write bypassing the state machine. Reserved for
/// reconciliation, where the event log is authoritative.
pub fn force_status(
    conn: &Connection,
    id: Uuid,
    status: CampaignStatus,
) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE campaigns SET status = ?1, updated_at = ?2 WHERE id = ?3",
        params![status.as_str(), ts_text(Utc::now()), id.to_string()],
    )?;
    if changed == 0 {
        return Err(StoreError::CampaignNotFound { id });
    }
    Ok(())
}

// ── Phase parameters ─────────────────────────────────────────────────

pub fn set_phase_params(
    conn: &Connection,
    campaign_id: Uuid,
    params_value: &PhaseParams,
) -> Result<(), StoreError> {
    let payload = serde_json::to_string(params_value)?;
    conn.execute(
        "INSERT INTO campaign_phase_params (campaign_id, phase, params, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (campaign_id, phase) DO UPDATE SET params = ?3, updated_at = ?4",
        params![
            campaign_id.to_string(),
            params_value.phase().as_str(),
            payload,
            ts_text(Utc::now())
        ],
    )?;
    Ok(())
}

pub fn get_phase_params(
    conn: &Connection,
    campaign_id: Uuid,
    phase: CampaignPhase,
) -> Result<PhaseParams, StoreError> {
    let payload: Option<String> = conn
        .query_row(
            "SELECT params FROM campaign_phase_params WHERE campaign_id = ?1 AND phase = ?2",
            params![campaign_id.to_string(), phase.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    let payload = payload.ok_or(StoreError::PhaseParamsNotFound { campaign_id, phase })?;
    Ok(serde_json::from_str(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DomainGenerationParams, PatternType};
    use crate::store::CampaignStore;

    fn seeded_store() -> (CampaignStore, Campaign) {
        let store = CampaignStore::open_in_memory().unwrap();
        let campaign = Campaign::new("store test", Some(Uuid::new_v4()));
        {
            let conn = store.lock().unwrap();
            insert(&conn, &campaign).unwrap();
        }
        (store, campaign)
    }

    #[test]
    fn insert_then_get_roundtrips() {
        let (store, campaign) = seeded_store();
        let conn = store.lock().unwrap();
        let loaded = get(&conn, campaign.id).unwrap();
        assert_eq!(loaded.id, campaign.id);
        assert_eq!(loaded.name, "store test");
        assert_eq!(loaded.status, CampaignStatus::Pending);
        assert_eq!(loaded.current_phase, CampaignPhase::DomainGeneration);
        assert_eq!(loaded.user_id, campaign.user_id);
    }

    #[test]
    fn get_missing_campaign_is_not_found() {
        let store = CampaignStore::open_in_memory().unwrap();
        let conn = store.lock().unwrap();
        let id = Uuid::new_v4();
        match get(&conn, id) {
            Err(StoreError::CampaignNotFound { id: missing }) => assert_eq!(missing, id),
            other => panic!("Expected CampaignNotFound, got {:?}", other.map(|c| c.id)),
        }
    }

    #[test]
    fn update_status_records_started_and_completed_once() {
        let (store, campaign) = seeded_store();
        let conn = store.lock().unwrap();

        update_status(&conn, campaign.id, CampaignStatus::Running).unwrap();
        let first = get(&conn, campaign.id).unwrap();
        let started = first.started_at.expect("started_at set on running");

        update_status(&conn, campaign.id, CampaignStatus::Paused).unwrap();
        update_status(&conn, campaign.id, CampaignStatus::Running).unwrap();
        let second = get(&conn, campaign.id).unwrap();
        assert_eq!(second.started_at, Some(started));

        update_status(&conn, campaign.id, CampaignStatus::Completed).unwrap();
        let done = get(&conn, campaign.id).unwrap();
        assert!(done.completed_at.is_some());
    }

    #[test]
    fn progress_percentage_never_regresses() {
        let (store, campaign) = seeded_store();
        let conn = store.lock().unwrap();
        update_progress(&conn, campaign.id, 50, Some(100), 40.0).unwrap();
        update_progress(&conn, campaign.id, 10, Some(100), 5.0).unwrap();
        let loaded = get(&conn, campaign.id).unwrap();
        assert_eq!(loaded.progress_percentage, Some(40.0));
        assert_eq!(loaded.processed_items, 10);
    }

    #[test]
    fn advance_phase_resets_items_and_pins_band_floor() {
        let (store, campaign) = seeded_store();
        let conn = store.lock().unwrap();
        update_progress(&conn, campaign.id, 100, Some(100), 33.0).unwrap();
        advance_phase(&conn, campaign.id, CampaignPhase::DnsValidation, 33.0).unwrap();
        let loaded = get(&conn, campaign.id).unwrap();
        assert_eq!(loaded.current_phase, CampaignPhase::DnsValidation);
        assert_eq!(loaded.phase_status, PhaseStatus::NotStarted);
        assert_eq!(loaded.processed_items, 0);
        assert_eq!(loaded.total_items, None);
        assert_eq!(loaded.progress_percentage, Some(33.0));
    }

    #[test]
    fn phase_params_roundtrip() {
        let (store, campaign) = seeded_store();
        let conn = store.lock().unwrap();
        let params_value = PhaseParams::DomainGeneration(DomainGenerationParams {
            pattern_type: PatternType::Prefix,
            variable_length: 2,
            character_set: "ab".into(),
            constant_string: "test".into(),
            tld: "com".into(),
            num_domains_to_generate: 4,
        });
        set_phase_params(&conn, campaign.id, &params_value).unwrap();
        let loaded = get_phase_params(&conn, campaign.id, CampaignPhase::DomainGeneration).unwrap();
        assert_eq!(loaded, params_value);

        match get_phase_params(&conn, campaign.id, CampaignPhase::DnsValidation) {
            Err(StoreError::PhaseParamsNotFound { phase, .. }) => {
                assert_eq!(phase, CampaignPhase::DnsValidation);
            }
            other => panic!("Expected PhaseParamsNotFound, got {other:?}"),
        }
    }

    #[test]
    fn list_filters_by_status() {
        let (store, _campaign) = seeded_store();
        let conn = store.lock().unwrap();
        let second = Campaign::new("second", None);
        insert(&conn, &second).unwrap();
        update_status(&conn, second.id, CampaignStatus::Queued).unwrap();

        assert_eq!(list(&conn, None).unwrap().len(), 2);
        let queued = list(&conn, Some(CampaignStatus::Queued)).unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, second.id);
        assert_eq!(count_active(&conn, None).unwrap(), 2);
    }
}
