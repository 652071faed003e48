//! Generated-domain rows: batch insert and the paging queries used by the
//! generation and DNS batch processors.

use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::GeneratedDomain;

use super::{ts_field, ts_text, uuid_field};

const DOMAIN_COLUMNS: &str = "id, campaign_id, domain_name, offset_index, generated_at";

fn domain_from_row(row: &Row<'_>) -> rusqlite::Result<GeneratedDomain> {
    Ok(GeneratedDomain {
        id: uuid_field(row, 0)?,
        campaign_id: uuid_field(row, 1)?,
        domain_name: row.get(2)?,
        offset_index: row.get(3)?,
        generated_at: ts_field(row, 4)?,
    })
}

/// Batch insert. Re-delivered batches (at-least-once processing) are
/// absorbed by the `(campaign_id, offset_index)` uniqueness: duplicates
/// are skipped rather than erroring.
pub fn insert_batch(conn: &Connection, domains: &[GeneratedDomain]) -> Result<usize, StoreError> {
    let mut stmt = conn.prepare(
        "INSERT INTO generated_domains (id, campaign_id, domain_name, offset_index, generated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (campaign_id, offset_index) DO NOTHING",
    )?;
    let mut inserted = 0;
    for domain in domains {
        inserted += stmt.execute(params![
            domain.id.to_string(),
            domain.campaign_id.to_string(),
            domain.domain_name,
            domain.offset_index,
            ts_text(domain.generated_at),
        ])?;
    }
    Ok(inserted)
}

pub fn page(
    conn: &Connection,
    campaign_id: Uuid,
    limit: usize,
    offset: usize,
) -> Result<Vec<GeneratedDomain>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DOMAIN_COLUMNS} FROM generated_domains
         WHERE campaign_id = ?1 ORDER BY offset_index LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt.query_map(
        params![campaign_id.to_string(), limit as i64, offset as i64],
        domain_from_row,
    )?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn count(conn: &Connection, campaign_id: Uuid) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM generated_domains WHERE campaign_id = ?1",
        params![campaign_id.to_string()],
        |row| row.get(0),
    )?)
}

/// Filter shared by [`unvalidated_page`] and [`count_unvalidated`]: a
/// domain is owed DNS work while it has no result, or its result is
/// transient (error, timeout, pending) with attempts left under the cap.
/// Resolved and unresolved are definitive answers.
const UNVALIDATED_FILTER: &str = "gd.campaign_id = ?1
     AND (dr.id IS NULL
          OR (dr.validation_status IN ('error', 'timeout', 'pending') AND dr.attempts < ?2))";

/// The next page of domains still owed a definitive DNS answer. Domains
/// with no result at all come first; interrupted or errored attempts are
/// re-validated only after the rest of the campaign is covered.
pub fn unvalidated_page(
    conn: &Connection,
    campaign_id: Uuid,
    attempt_cap: i64,
    limit: usize,
) -> Result<Vec<GeneratedDomain>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT gd.id, gd.campaign_id, gd.domain_name, gd.offset_index, gd.generated_at
         FROM generated_domains gd
         LEFT JOIN dns_validation_results dr
             ON dr.campaign_id = gd.campaign_id AND dr.domain_name = gd.domain_name
         WHERE {UNVALIDATED_FILTER}
         ORDER BY CASE WHEN dr.id IS NULL THEN 0 ELSE 1 END, gd.offset_index
         LIMIT ?3"
    ))?;
    let rows = stmt.query_map(
        params![campaign_id.to_string(), attempt_cap, limit as i64],
        domain_from_row,
    )?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// How many domains are still owed DNS work. Zero means the phase is done.
pub fn count_unvalidated(
    conn: &Connection,
    campaign_id: Uuid,
    attempt_cap: i64,
) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM generated_domains gd
             LEFT JOIN dns_validation_results dr
                 ON dr.campaign_id = gd.campaign_id AND dr.domain_name = gd.domain_name
             WHERE {UNVALIDATED_FILTER}"
        ),
        params![campaign_id.to_string(), attempt_cap],
        |row| row.get(0),
    )?)
}
