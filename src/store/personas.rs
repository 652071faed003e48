//! Personas, keyword sets, and keyword rules, with the batched loaders
//! the batch processors use to avoid per-row lookups.

use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::{KeywordRule, KeywordRuleType, KeywordSet, Persona, PersonaType};

use super::{conv_err, json_field, ts_field, ts_text, uuid_field};

const PERSONA_COLUMNS: &str = "id, name, persona_type, config_details, is_enabled, created_at";

fn persona_from_row(row: &Row<'_>) -> rusqlite::Result<Persona> {
    let persona_type: String = row.get(2)?;
    Ok(Persona {
        id: uuid_field(row, 0)?,
        name: row.get(1)?,
        persona_type: PersonaType::from_str(&persona_type).map_err(|e| conv_err(2, e))?,
        config_details: json_field(row, 3)?,
        is_enabled: row.get(4)?,
        created_at: ts_field(row, 5)?,
    })
}

pub fn insert_persona(conn: &Connection, persona: &Persona) -> Result<(), StoreError> {
    conn.execute(
        &format!("INSERT INTO personas ({PERSONA_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
        params![
            persona.id.to_string(),
            persona.name,
            persona.persona_type.as_str(),
            persona.config_details.to_string(),
            persona.is_enabled,
            ts_text(persona.created_at),
        ],
    )?;
    Ok(())
}

pub fn get_persona(conn: &Connection, id: Uuid) -> Result<Persona, StoreError> {
    conn.query_row(
        &format!("SELECT {PERSONA_COLUMNS} FROM personas WHERE id = ?1"),
        params![id.to_string()],
        persona_from_row,
    )
    .optional()?
    .ok_or(StoreError::PersonaNotFound { id })
}

/// Batched load preserving the requested order. Any missing id is an error:
/// a campaign referencing an unknown persona is misconfigured.
pub fn personas_by_ids(conn: &Connection, ids: &[Uuid]) -> Result<Vec<Persona>, StoreError> {
    let mut out = Vec::with_capacity(ids.len());
    if ids.is_empty() {
        return Ok(out);
    }
    let placeholders = (1..=ids.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("SELECT {PERSONA_COLUMNS} FROM personas WHERE id IN ({placeholders})");
    let mut stmt = conn.prepare(&sql)?;
    let values: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    let refs: Vec<&dyn rusqlite::ToSql> =
        values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
    let rows = stmt.query_map(refs.as_slice(), persona_from_row)?;
    let mut by_id = std::collections::HashMap::new();
    for row in rows {
        let persona = row?;
        by_id.insert(persona.id, persona);
    }
    for id in ids {
        match by_id.remove(id) {
            Some(persona) => out.push(persona),
            None => return Err(StoreError::PersonaNotFound { id: *id }),
        }
    }
    Ok(out)
}

pub fn set_persona_enabled(conn: &Connection, id: Uuid, enabled: bool) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE personas SET is_enabled = ?1 WHERE id = ?2",
        params![enabled, id.to_string()],
    )?;
    if changed == 0 {
        return Err(StoreError::PersonaNotFound { id });
    }
    Ok(())
}

// ── Keyword sets & rules ─────────────────────────────────────────────

fn keyword_set_from_row(row: &Row<'_>) -> rusqlite::Result<KeywordSet> {
    Ok(KeywordSet {
        id: uuid_field(row, 0)?,
        name: row.get(1)?,
        is_enabled: row.get(2)?,
        created_at: ts_field(row, 3)?,
    })
}

pub fn insert_keyword_set(conn: &Connection, set: &KeywordSet) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO keyword_sets (id, name, is_enabled, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            set.id.to_string(),
            set.name,
            set.is_enabled,
            ts_text(set.created_at)
        ],
    )?;
    Ok(())
}

pub fn keyword_sets_by_ids(conn: &Connection, ids: &[Uuid]) -> Result<Vec<KeywordSet>, StoreError> {
    let mut out = Vec::with_capacity(ids.len());
    if ids.is_empty() {
        return Ok(out);
    }
    let placeholders = (1..=ids.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT id, name, is_enabled, created_at FROM keyword_sets WHERE id IN ({placeholders})"
    );
    let mut stmt = conn.prepare(&sql)?;
    let values: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    let refs: Vec<&dyn rusqlite::ToSql> =
        values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
    let rows = stmt.query_map(refs.as_slice(), keyword_set_from_row)?;
    let mut by_id = std::collections::HashMap::new();
    for row in rows {
        let set = row?;
        by_id.insert(set.id, set);
    }
    for id in ids {
        match by_id.remove(id) {
            Some(set) => out.push(set),
            None => return Err(StoreError::KeywordSetNotFound { id: *id }),
        }
    }
    Ok(out)
}

pub fn insert_keyword_rule(conn: &Connection, rule: &KeywordRule) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO keyword_rules (id, keyword_set_id, rule_type, pattern, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            rule.id.to_string(),
            rule.keyword_set_id.to_string(),
            rule.rule_type.as_str(),
            rule.pattern,
            ts_text(rule.created_at),
        ],
    )?;
    Ok(())
}

pub fn keyword_rules_by_set_ids(
    conn: &Connection,
    set_ids: &[Uuid],
) -> Result<Vec<KeywordRule>, StoreError> {
    let mut out = Vec::new();
    if set_ids.is_empty() {
        return Ok(out);
    }
    let placeholders = (1..=set_ids.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT id, keyword_set_id, rule_type, pattern, created_at
         FROM keyword_rules WHERE keyword_set_id IN ({placeholders}) ORDER BY created_at"
    );
    let mut stmt = conn.prepare(&sql)?;
    let values: Vec<String> = set_ids.iter().map(|id| id.to_string()).collect();
    let refs: Vec<&dyn rusqlite::ToSql> =
        values.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
    let rows = stmt.query_map(refs.as_slice(), |row| {
        let rule_type: String = row.get(2)?;
        Ok(KeywordRule {
            id: uuid_field(row, 0)?,
            keyword_set_id: uuid_field(row, 1)?,
            rule_type: KeywordRuleType::from_str(&rule_type).map_err(|e| conv_err(2, e))?,
            pattern: row.get(3)?,
            created_at: ts_field(row, 4)?,
        })
    })?;
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
