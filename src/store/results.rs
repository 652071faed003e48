//! DNS and HTTP validation result rows.
//!
//! Inserts are idempotent per `(campaign_id, domain_name)`: re-validating a
//! domain replaces its row, which is what makes at-least-once batch
//! delivery safe.

use rusqlite::{Connection, Row, params};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::{DnsResult, DnsStatus, HttpResult, HttpValidationStatus};

use super::{conv_err, json_field, opt_json_field, opt_uuid_field, ts_field, ts_text, uuid_field};

// ── DNS results ──────────────────────────────────────────────────────

const DNS_COLUMNS: &str = "id, campaign_id, generated_domain_id, domain_name, validation_status, \
     dns_records, validated_by_persona_id, attempts, last_checked_at";

fn dns_from_row(row: &Row<'_>) -> rusqlite::Result<DnsResult> {
    let status: String = row.get(4)?;
    Ok(DnsResult {
        id: uuid_field(row, 0)?,
        campaign_id: uuid_field(row, 1)?,
        generated_domain_id: opt_uuid_field(row, 2)?,
        domain_name: row.get(3)?,
        validation_status: DnsStatus::from_str(&status).map_err(|e| conv_err(4, e))?,
        dns_records: json_field(row, 5)?,
        validated_by_persona_id: opt_uuid_field(row, 6)?,
        attempts: row.get(7)?,
        last_checked_at: ts_field(row, 8)?,
    })
}

/// Idempotent per `(campaign_id, domain_name)`. A re-validation replaces
/// the outcome but `attempts` accumulates across runs, which is what the
/// per-domain retry cap is measured against.
pub fn upsert_dns_batch(conn: &Connection, results: &[DnsResult]) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO dns_validation_results ({DNS_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT (campaign_id, domain_name) DO UPDATE SET
             generated_domain_id = excluded.generated_domain_id,
             validation_status = excluded.validation_status,
             dns_records = excluded.dns_records,
             validated_by_persona_id = excluded.validated_by_persona_id,
             attempts = dns_validation_results.attempts + excluded.attempts,
             last_checked_at = excluded.last_checked_at"
    ))?;
    for result in results {
        stmt.execute(params![
            result.id.to_string(),
            result.campaign_id.to_string(),
            result.generated_domain_id.map(|u| u.to_string()),
            result.domain_name,
            result.validation_status.as_str(),
            result.dns_records.to_string(),
            result.validated_by_persona_id.map(|u| u.to_string()),
            result.attempts,
            ts_text(result.last_checked_at),
        ])?;
    }
    Ok(())
}

pub fn dns_results(
    conn: &Connection,
    campaign_id: Uuid,
    status: Option<DnsStatus>,
) -> Result<Vec<DnsResult>, StoreError> {
    let mut out = Vec::new();
    match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DNS_COLUMNS} FROM dns_validation_results
                 WHERE campaign_id = ?1 AND validation_status = ?2 ORDER BY domain_name"
            ))?;
            let rows = stmt.query_map(
                params![campaign_id.to_string(), status.as_str()],
                dns_from_row,
            )?;
            for row in rows {
                out.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DNS_COLUMNS} FROM dns_validation_results
                 WHERE campaign_id = ?1 ORDER BY domain_name"
            ))?;
            let rows = stmt.query_map(params![campaign_id.to_string()], dns_from_row)?;
            for row in rows {
                out.push(row?);
            }
        }
    }
    Ok(out)
}

pub fn count_dns_results(conn: &Connection, campaign_id: Uuid) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM dns_validation_results WHERE campaign_id = ?1",
        params![campaign_id.to_string()],
        |row| row.get(0),
    )?)
}

pub fn count_resolved_dns_results(conn: &Connection, campaign_id: Uuid) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM dns_validation_results
         WHERE campaign_id = ?1 AND validation_status = 'resolved'",
        params![campaign_id.to_string()],
        |row| row.get(0),
    )?)
}

/// Restart support: drop every non-resolved result so the remainder gets
/// re-validated while resolved results are preserved.
pub fn delete_unresolved_dns_results(
    conn: &Connection,
    campaign_id: Uuid,
) -> Result<usize, StoreError> {
    Ok(conn.execute(
        "DELETE FROM dns_validation_results
         WHERE campaign_id = ?1 AND validation_status != 'resolved'",
        params![campaign_id.to_string()],
    )?)
}

/// The next page of resolved domains after the cursor, in name order. This
/// is the HTTP phase's input feed.
pub fn resolved_dns_page_after(
    conn: &Connection,
    campaign_id: Uuid,
    after_domain_name: Option<&str>,
    limit: usize,
) -> Result<Vec<DnsResult>, StoreError> {
    let cursor = after_domain_name.unwrap_or("");
    let mut stmt = conn.prepare(&format!(
        "SELECT {DNS_COLUMNS} FROM dns_validation_results
         WHERE campaign_id = ?1 AND validation_status = 'resolved' AND domain_name > ?2
         ORDER BY domain_name LIMIT ?3"
    ))?;
    let rows = stmt.query_map(
        params![campaign_id.to_string(), cursor, limit as i64],
        dns_from_row,
    )?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

// ── HTTP / keyword results ───────────────────────────────────────────

const HTTP_COLUMNS: &str = "id, campaign_id, dns_result_id, domain_name, http_status_code, \
     response_headers, content_hash, page_title, snippet, found_keywords_from_sets, \
     found_ad_hoc_keywords, validation_status, validated_by_persona_id, used_proxy_id, \
     attempts, last_checked_at";

fn http_from_row(row: &Row<'_>) -> rusqlite::Result<HttpResult> {
    let status: String = row.get(11)?;
    let from_sets: String = row.get(9)?;
    let ad_hoc: String = row.get(10)?;
    Ok(HttpResult {
        id: uuid_field(row, 0)?,
        campaign_id: uuid_field(row, 1)?,
        dns_result_id: opt_uuid_field(row, 2)?,
        domain_name: row.get(3)?,
        http_status_code: row.get(4)?,
        response_headers: opt_json_field(row, 5)?,
        content_hash: row.get(6)?,
        page_title: row.get(7)?,
        snippet: row.get(8)?,
        found_keywords_from_sets: serde_json::from_str(&from_sets)
            .map_err(|e| conv_err(9, e.to_string()))?,
        found_ad_hoc_keywords: serde_json::from_str(&ad_hoc)
            .map_err(|e| conv_err(10, e.to_string()))?,
        validation_status: HttpValidationStatus::from_str(&status)
            .map_err(|e| conv_err(11, e))?,
        validated_by_persona_id: opt_uuid_field(row, 12)?,
        used_proxy_id: opt_uuid_field(row, 13)?,
        attempts: row.get(14)?,
        last_checked_at: ts_field(row, 15)?,
    })
}

pub fn upsert_http_batch(conn: &Connection, results: &[HttpResult]) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO http_keyword_results ({HTTP_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT (campaign_id, domain_name) DO UPDATE SET
             dns_result_id = excluded.dns_result_id,
             http_status_code = excluded.http_status_code,
             response_headers = excluded.response_headers,
             content_hash = excluded.content_hash,
             page_title = excluded.page_title,
             snippet = excluded.snippet,
             found_keywords_from_sets = excluded.found_keywords_from_sets,
             found_ad_hoc_keywords = excluded.found_ad_hoc_keywords,
             validation_status = excluded.validation_status,
             validated_by_persona_id = excluded.validated_by_persona_id,
             used_proxy_id = excluded.used_proxy_id,
             attempts = excluded.attempts,
             last_checked_at = excluded.last_checked_at"
    ))?;
    for result in results {
        stmt.execute(params![
            result.id.to_string(),
            result.campaign_id.to_string(),
            result.dns_result_id.map(|u| u.to_string()),
            result.domain_name,
            result.http_status_code,
            result.response_headers.as_ref().map(|v| v.to_string()),
            result.content_hash,
            result.page_title,
            result.snippet,
            serde_json::to_string(&result.found_keywords_from_sets)?,
            serde_json::to_string(&result.found_ad_hoc_keywords)?,
            result.validation_status.as_str(),
            result.validated_by_persona_id.map(|u| u.to_string()),
            result.used_proxy_id.map(|u| u.to_string()),
            result.attempts,
            ts_text(result.last_checked_at),
        ])?;
    }
    Ok(())
}

pub fn http_results(
    conn: &Connection,
    campaign_id: Uuid,
    status: Option<HttpValidationStatus>,
) -> Result<Vec<HttpResult>, StoreError> {
    let mut out = Vec::new();
    match status {
        Some(status) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {HTTP_COLUMNS} FROM http_keyword_results
                 WHERE campaign_id = ?1 AND validation_status = ?2 ORDER BY domain_name"
            ))?;
            let rows = stmt.query_map(
                params![campaign_id.to_string(), status.as_str()],
                http_from_row,
            )?;
            for row in rows {
                out.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {HTTP_COLUMNS} FROM http_keyword_results
                 WHERE campaign_id = ?1 ORDER BY domain_name"
            ))?;
            let rows = stmt.query_map(params![campaign_id.to_string()], http_from_row)?;
            for row in rows {
                out.push(row?);
            }
        }
    }
    Ok(out)
}

pub fn count_http_results(conn: &Connection, campaign_id: Uuid) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM http_keyword_results WHERE campaign_id = ?1",
        params![campaign_id.to_string()],
        |row| row.get(0),
    )?)
}

pub fn count_lead_valid_http_results(
    conn: &Connection,
    campaign_id: Uuid,
) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM http_keyword_results
         WHERE campaign_id = ?1 AND validation_status = 'lead_valid'",
        params![campaign_id.to_string()],
        |row| row.get(0),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Campaign;
    use crate::store::{CampaignStore, campaigns};
    use chrono::Utc;
    use serde_json::json;

    fn dns_result(campaign_id: Uuid, name: &str, status: DnsStatus) -> DnsResult {
        DnsResult {
            id: Uuid::new_v4(),
            campaign_id,
            generated_domain_id: None,
            domain_name: name.to_string(),
            validation_status: status,
            dns_records: json!([{"type": "A", "value": "192.0.2.1"}]),
            validated_by_persona_id: None,
            attempts: 1,
            last_checked_at: Utc::now(),
        }
    }

    fn http_result(campaign_id: Uuid, name: &str, status: HttpValidationStatus) -> HttpResult {
        HttpResult {
            id: Uuid::new_v4(),
            campaign_id,
            dns_result_id: None,
            domain_name: name.to_string(),
            http_status_code: Some(200),
            response_headers: Some(json!({"content-type": "text/html"})),
            content_hash: Some("abc".into()),
            page_title: Some("Title".into()),
            snippet: None,
            found_keywords_from_sets: vec!["pricing".into()],
            found_ad_hoc_keywords: vec![],
            validation_status: status,
            validated_by_persona_id: None,
            used_proxy_id: None,
            attempts: 1,
            last_checked_at: Utc::now(),
        }
    }

    fn seeded() -> (CampaignStore, Uuid) {
        let store = CampaignStore::open_in_memory().unwrap();
        let campaign = Campaign::new("results", None);
        let id = campaign.id;
        {
            let conn = store.lock().unwrap();
            campaigns::insert(&conn, &campaign).unwrap();
        }
        (store, id)
    }

    #[test]
    fn dns_upsert_replaces_by_domain_name_and_accumulates_attempts() {
        let (store, campaign_id) = seeded();
        let conn = store.lock().unwrap();
        upsert_dns_batch(&conn, &[dns_result(campaign_id, "a.com", DnsStatus::Error)]).unwrap();
        upsert_dns_batch(&conn, &[dns_result(campaign_id, "a.com", DnsStatus::Resolved)]).unwrap();
        assert_eq!(count_dns_results(&conn, campaign_id).unwrap(), 1);
        let all = dns_results(&conn, campaign_id, None).unwrap();
        assert_eq!(all[0].validation_status, DnsStatus::Resolved);
        assert_eq!(all[0].attempts, 2);
    }

    #[test]
    fn resolved_page_respects_cursor_and_order() {
        let (store, campaign_id) = seeded();
        let conn = store.lock().unwrap();
        upsert_dns_batch(
            &conn,
            &[
                dns_result(campaign_id, "c.com", DnsStatus::Resolved),
                dns_result(campaign_id, "a.com", DnsStatus::Resolved),
                dns_result(campaign_id, "b.com", DnsStatus::Unresolved),
                dns_result(campaign_id, "d.com", DnsStatus::Resolved),
            ],
        )
        .unwrap();
        let first = resolved_dns_page_after(&conn, campaign_id, None, 2).unwrap();
        assert_eq!(
            first.iter().map(|r| r.domain_name.as_str()).collect::<Vec<_>>(),
            vec!["a.com", "c.com"]
        );
        let rest = resolved_dns_page_after(&conn, campaign_id, Some("c.com"), 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].domain_name, "d.com");
    }

    #[test]
    fn delete_unresolved_preserves_resolved_rows() {
        let (store, campaign_id) = seeded();
        let conn = store.lock().unwrap();
        upsert_dns_batch(
            &conn,
            &[
                dns_result(campaign_id, "a.com", DnsStatus::Resolved),
                dns_result(campaign_id, "b.com", DnsStatus::Unresolved),
                dns_result(campaign_id, "c.com", DnsStatus::Timeout),
            ],
        )
        .unwrap();
        assert_eq!(delete_unresolved_dns_results(&conn, campaign_id).unwrap(), 2);
        assert_eq!(count_resolved_dns_results(&conn, campaign_id).unwrap(), 1);
        assert_eq!(count_dns_results(&conn, campaign_id).unwrap(), 1);
    }

    #[test]
    fn http_roundtrip_preserves_keyword_lists() {
        let (store, campaign_id) = seeded();
        let conn = store.lock().unwrap();
        upsert_http_batch(
            &conn,
            &[http_result(campaign_id, "a.com", HttpValidationStatus::LeadValid)],
        )
        .unwrap();
        let all = http_results(&conn, campaign_id, None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].found_keywords_from_sets, vec!["pricing".to_string()]);
        assert_eq!(all[0].validation_status, HttpValidationStatus::LeadValid);
        assert_eq!(count_lead_valid_http_results(&conn, campaign_id).unwrap(), 1);
    }

    #[test]
    fn http_filter_by_status() {
        let (store, campaign_id) = seeded();
        let conn = store.lock().unwrap();
        upsert_http_batch(
            &conn,
            &[
                http_result(campaign_id, "a.com", HttpValidationStatus::LeadValid),
                http_result(campaign_id, "b.com", HttpValidationStatus::InvalidHttpCode),
            ],
        )
        .unwrap();
        let leads =
            http_results(&conn, campaign_id, Some(HttpValidationStatus::LeadValid)).unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].domain_name, "a.com");
    }
}
