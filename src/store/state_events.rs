//! Append-only state event log, denormalized transitions, and snapshots.
//! The state coordinator is the sole writer.

use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::{
    CampaignStatus, EventSource, StateEvent, StateSnapshot, StateTransition,
};

use super::{conv_err, json_field, opt_json_field, ts_field, ts_text, uuid_field};

const EVENT_COLUMNS: &str = "id, campaign_id, sequence_number, previous_state, new_state, \
     source, actor, reason, occurred_at, context";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<StateEvent> {
    let previous: Option<String> = row.get(3)?;
    let new_state: String = row.get(4)?;
    let source: String = row.get(5)?;
    Ok(StateEvent {
        id: uuid_field(row, 0)?,
        campaign_id: uuid_field(row, 1)?,
        sequence_number: row.get(2)?,
        previous_state: match previous {
            Some(s) => Some(CampaignStatus::from_str(&s).map_err(|e| conv_err(3, e))?),
            None => None,
        },
        new_state: CampaignStatus::from_str(&new_state).map_err(|e| conv_err(4, e))?,
        source: EventSource::from_str(&source).map_err(|e| conv_err(5, e))?,
        actor: row.get(6)?,
        reason: row.get(7)?,
        occurred_at: ts_field(row, 8)?,
        context: opt_json_field(row, 9)?,
    })
}

/// Next dense sequence number for the campaign. Must be called inside the
/// same transaction as the insert that consumes it.
pub fn next_sequence(conn: &Connection, campaign_id: Uuid) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM campaign_state_events
         WHERE campaign_id = ?1",
        params![campaign_id.to_string()],
        |row| row.get(0),
    )?)
}

pub fn insert_event(conn: &Connection, event: &StateEvent) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO campaign_state_events ({EVENT_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
        ),
        params![
            event.id.to_string(),
            event.campaign_id.to_string(),
            event.sequence_number,
            event.previous_state.map(|s| s.as_str()),
            event.new_state.as_str(),
            event.source.as_str(),
            event.actor,
            event.reason,
            ts_text(event.occurred_at),
            event.context.as_ref().map(|v| v.to_string()),
        ],
    )?;
    Ok(())
}

pub fn insert_transition(conn: &Connection, transition: &StateTransition) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO campaign_state_transitions
             (campaign_id, from_state, to_state, event_id, occurred_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            transition.campaign_id.to_string(),
            transition.from_state.map(|s| s.as_str()),
            transition.to_state.as_str(),
            transition.event_id.to_string(),
            ts_text(transition.occurred_at),
        ],
    )?;
    Ok(())
}

/// Event history, most recent first.
pub fn history(
    conn: &Connection,
    campaign_id: Uuid,
    limit: usize,
    offset: usize,
) -> Result<Vec<StateEvent>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM campaign_state_events
         WHERE campaign_id = ?1 ORDER BY sequence_number DESC LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt.query_map(
        params![campaign_id.to_string(), limit as i64, offset as i64],
        event_from_row,
    )?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// All events after the given sequence, oldest first (for replay).
pub fn events_after(
    conn: &Connection,
    campaign_id: Uuid,
    after_sequence: i64,
) -> Result<Vec<StateEvent>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM campaign_state_events
         WHERE campaign_id = ?1 AND sequence_number > ?2 ORDER BY sequence_number"
    ))?;
    let rows = stmt.query_map(
        params![campaign_id.to_string(), after_sequence],
        event_from_row,
    )?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn sequence_numbers(conn: &Connection, campaign_id: Uuid) -> Result<Vec<i64>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT sequence_number FROM campaign_state_events
         WHERE campaign_id = ?1 ORDER BY sequence_number",
    )?;
    let rows = stmt.query_map(params![campaign_id.to_string()], |row| row.get(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// ── Snapshots ────────────────────────────────────────────────────────

pub fn insert_snapshot(conn: &Connection, snapshot: &StateSnapshot) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO campaign_state_snapshots
             (id, campaign_id, current_state, state_data, last_event_sequence, is_valid, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            snapshot.id.to_string(),
            snapshot.campaign_id.to_string(),
            snapshot.current_state.as_str(),
            snapshot.state_data.to_string(),
            snapshot.last_event_sequence,
            snapshot.is_valid,
            ts_text(snapshot.created_at),
        ],
    )?;
    Ok(())
}

pub fn latest_snapshot(
    conn: &Connection,
    campaign_id: Uuid,
) -> Result<Option<StateSnapshot>, StoreError> {
    let snapshot = conn
        .query_row(
            "SELECT id, campaign_id, current_state, state_data, last_event_sequence,
                    is_valid, created_at
             FROM campaign_state_snapshots
             WHERE campaign_id = ?1 AND is_valid = 1
             ORDER BY last_event_sequence DESC LIMIT 1",
            params![campaign_id.to_string()],
            |row| {
                let state: String = row.get(2)?;
                Ok(StateSnapshot {
                    id: uuid_field(row, 0)?,
                    campaign_id: uuid_field(row, 1)?,
                    current_state: CampaignStatus::from_str(&state)
                        .map_err(|e| conv_err(2, e))?,
                    state_data: json_field(row, 3)?,
                    last_event_sequence: row.get(4)?,
                    is_valid: row.get(5)?,
                    created_at: ts_field(row, 6)?,
                })
            },
        )
        .optional()?;
    Ok(snapshot)
}
