//! Campaign job rows. The job queue is the sole writer; these functions
//! are its SQL layer.

use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::{CampaignJob, JobStatus, JobType};

use super::{conv_err, opt_json_field, ts_field, ts_text, uuid_field};

const JOB_COLUMNS: &str = "id, campaign_id, job_type, status, business_status, attempts, \
     max_attempts, scheduled_at, next_execution_at, processing_server_id, last_error, \
     payload, created_at, updated_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<CampaignJob> {
    let job_type: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(CampaignJob {
        id: uuid_field(row, 0)?,
        campaign_id: uuid_field(row, 1)?,
        job_type: JobType::from_str(&job_type).map_err(|e| conv_err(2, e))?,
        status: JobStatus::from_str(&status).map_err(|e| conv_err(3, e))?,
        business_status: row.get(4)?,
        attempts: row.get(5)?,
        max_attempts: row.get(6)?,
        scheduled_at: ts_field(row, 7)?,
        next_execution_at: ts_field(row, 8)?,
        processing_server_id: row.get(9)?,
        last_error: row.get(10)?,
        payload: opt_json_field(row, 11)?,
        created_at: ts_field(row, 12)?,
        updated_at: ts_field(row, 13)?,
    })
}

pub fn insert(conn: &Connection, job: &CampaignJob) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO campaign_jobs ({JOB_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            job.id.to_string(),
            job.campaign_id.to_string(),
            job.job_type.as_str(),
            job.status.as_str(),
            job.business_status,
            job.attempts,
            job.max_attempts,
            ts_text(job.scheduled_at),
            ts_text(job.next_execution_at),
            job.processing_server_id,
            job.last_error,
            job.payload.as_ref().map(|v| v.to_string()),
            ts_text(job.created_at),
            ts_text(job.updated_at),
        ],
    )?;
    Ok(())
}

pub fn update(conn: &Connection, job: &CampaignJob) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE campaign_jobs SET status = ?1, business_status = ?2, attempts = ?3,
             next_execution_at = ?4, processing_server_id = ?5, last_error = ?6,
             payload = ?7, updated_at = ?8
         WHERE id = ?9",
        params![
            job.status.as_str(),
            job.business_status,
            job.attempts,
            ts_text(job.next_execution_at),
            job.processing_server_id,
            job.last_error,
            job.payload.as_ref().map(|v| v.to_string()),
            ts_text(job.updated_at),
            job.id.to_string(),
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::JobNotFound { id: job.id });
    }
    Ok(())
}

pub fn get(conn: &Connection, id: Uuid) -> Result<CampaignJob, StoreError> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM campaign_jobs WHERE id = ?1"),
        params![id.to_string()],
        job_from_row,
    )
    .optional()?
    .ok_or(StoreError::JobNotFound { id })
}

/// The oldest eligible job: `queued` (fresh or retry) with a due
/// `next_execution_at`, optionally restricted by job type.
pub fn next_eligible(
    conn: &Connection,
    job_types: Option<&[JobType]>,
    now_text: &str,
) -> Result<Option<CampaignJob>, StoreError> {
    let job = match job_types {
        Some(types) if !types.is_empty() => {
            let placeholders = (0..types.len())
                .map(|i| format!("?{}", i + 2))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM campaign_jobs
                 WHERE status = 'queued' AND next_execution_at <= ?1
                     AND job_type IN ({placeholders})
                 ORDER BY next_execution_at, created_at LIMIT 1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now_text.to_string())];
            for job_type in types {
                values.push(Box::new(job_type.as_str()));
            }
            let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
            stmt.query_row(refs.as_slice(), job_from_row).optional()?
        }
        _ => conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM campaign_jobs
                     WHERE status = 'queued' AND next_execution_at <= ?1
                     ORDER BY next_execution_at, created_at LIMIT 1"
                ),
                params![now_text],
                job_from_row,
            )
            .optional()?,
    };
    Ok(job)
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub campaign_id: Option<Uuid>,
    pub status: Option<JobStatus>,
}

pub fn list(conn: &Connection, filter: &JobFilter) -> Result<Vec<CampaignJob>, StoreError> {
    let mut clauses = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    if let Some(campaign_id) = filter.campaign_id {
        values.push(Box::new(campaign_id.to_string()));
        clauses.push(format!("campaign_id = ?{}", values.len()));
    }
    if let Some(status) = filter.status {
        values.push(Box::new(status.as_str()));
        clauses.push(format!("status = ?{}", values.len()));
    }
    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM campaign_jobs {where_clause} ORDER BY created_at"
    );
    let mut stmt = conn.prepare(&sql)?;
    let refs: Vec<&dyn rusqlite::ToSql> = values.iter().map(|v| v.as_ref()).collect();
    let rows = stmt.query_map(refs.as_slice(), job_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// Jobs still owed work for a campaign: queued (including retry) or running.
pub fn count_active_for_campaign(conn: &Connection, campaign_id: Uuid) -> Result<i64, StoreError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM campaign_jobs
         WHERE campaign_id = ?1 AND status IN ('queued', 'running', 'pending')",
        params![campaign_id.to_string()],
        |row| row.get(0),
    )?)
}
