//! SQLite-backed campaign store.
//!
//! The store owns the schema and one connection behind a mutex. Row-level
//! operations live in the submodules as free functions taking `&Connection`,
//! so callers can pass either the raw connection or an open `Transaction`
//! and compose multi-table atomic units. The single guarded connection is
//! the datastore-level critical section relied on by the job queue's lease
//! and the config manager's compare-and-swap.

pub mod campaigns;
pub mod domains;
pub mod jobs;
pub mod personas;
pub mod results;
pub mod state_events;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use uuid::Uuid;

use crate::errors::StoreError;

pub struct CampaignStore {
    conn: Mutex<Connection>,
}

impl CampaignStore {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// An in-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        run_migrations(&conn).context("Failed to run migrations")?;
        Ok(())
    }

    /// Exclusive access to the connection. Hold the guard across a
    /// `transaction()` to compose multi-table writes.
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Run `body` inside a transaction, committing on `Ok`.
    pub fn with_tx<T>(
        &self,
        body: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let value = body(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS campaigns (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            name TEXT NOT NULL,
            current_phase TEXT NOT NULL DEFAULT 'domain_generation',
            phase_status TEXT NOT NULL DEFAULT 'not_started',
            status TEXT NOT NULL DEFAULT 'pending',
            total_items INTEGER,
            processed_items INTEGER NOT NULL DEFAULT 0,
            progress_percentage REAL,
            metadata TEXT NOT NULL DEFAULT '{}',
            started_at TEXT,
            completed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS campaign_phase_params (
            campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
            phase TEXT NOT NULL,
            params TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (campaign_id, phase)
        );

        CREATE TABLE IF NOT EXISTS generated_domains (
            id TEXT PRIMARY KEY,
            campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
            domain_name TEXT NOT NULL,
            offset_index INTEGER NOT NULL,
            generated_at TEXT NOT NULL,
            UNIQUE (campaign_id, offset_index)
        );

        CREATE TABLE IF NOT EXISTS dns_validation_results (
            id TEXT PRIMARY KEY,
            campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
            generated_domain_id TEXT,
            domain_name TEXT NOT NULL,
            validation_status TEXT NOT NULL,
            dns_records TEXT NOT NULL DEFAULT '[]',
            validated_by_persona_id TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_checked_at TEXT NOT NULL,
            UNIQUE (campaign_id, domain_name)
        );

        CREATE TABLE IF NOT EXISTS http_keyword_results (
            id TEXT PRIMARY KEY,
            campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
            dns_result_id TEXT,
            domain_name TEXT NOT NULL,
            http_status_code INTEGER,
            response_headers TEXT,
            content_hash TEXT,
            page_title TEXT,
            snippet TEXT,
            found_keywords_from_sets TEXT NOT NULL DEFAULT '[]',
            found_ad_hoc_keywords TEXT NOT NULL DEFAULT '[]',
            validation_status TEXT NOT NULL,
            validated_by_persona_id TEXT,
            used_proxy_id TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            last_checked_at TEXT NOT NULL,
            UNIQUE (campaign_id, domain_name)
        );

        CREATE TABLE IF NOT EXISTS campaign_jobs (
            id TEXT PRIMARY KEY,
            campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
            job_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'queued',
            business_status TEXT,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            scheduled_at TEXT NOT NULL,
            next_execution_at TEXT NOT NULL,
            processing_server_id TEXT,
            last_error TEXT,
            payload TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS campaign_state_events (
            id TEXT PRIMARY KEY,
            campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
            sequence_number INTEGER NOT NULL,
            previous_state TEXT,
            new_state TEXT NOT NULL,
            source TEXT NOT NULL,
            actor TEXT NOT NULL,
            reason TEXT NOT NULL,
            occurred_at TEXT NOT NULL,
            context TEXT,
            UNIQUE (campaign_id, sequence_number)
        );

        CREATE TABLE IF NOT EXISTS campaign_state_transitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
            from_state TEXT,
            to_state TEXT NOT NULL,
            event_id TEXT NOT NULL,
            occurred_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS campaign_state_snapshots (
            id TEXT PRIMARY KEY,
            campaign_id TEXT NOT NULL REFERENCES campaigns(id) ON DELETE CASCADE,
            current_state TEXT NOT NULL,
            state_data TEXT NOT NULL,
            last_event_sequence INTEGER NOT NULL,
            is_valid INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS domain_generation_config_states (
            config_hash TEXT PRIMARY KEY,
            last_offset INTEGER NOT NULL DEFAULT 0,
            config_details TEXT NOT NULL DEFAULT '{}',
            version INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS personas (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            persona_type TEXT NOT NULL,
            config_details TEXT NOT NULL DEFAULT '{}',
            is_enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS keyword_sets (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            is_enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS keyword_rules (
            id TEXT PRIMARY KEY,
            keyword_set_id TEXT NOT NULL REFERENCES keyword_sets(id) ON DELETE CASCADE,
            rule_type TEXT NOT NULL,
            pattern TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_campaigns_status ON campaigns(status);
        CREATE INDEX IF NOT EXISTS idx_generated_domains_campaign
            ON generated_domains(campaign_id, offset_index);
        CREATE INDEX IF NOT EXISTS idx_dns_results_campaign
            ON dns_validation_results(campaign_id, validation_status);
        CREATE INDEX IF NOT EXISTS idx_http_results_campaign
            ON http_keyword_results(campaign_id, validation_status);
        CREATE INDEX IF NOT EXISTS idx_jobs_eligible
            ON campaign_jobs(status, next_execution_at);
        CREATE INDEX IF NOT EXISTS idx_jobs_campaign ON campaign_jobs(campaign_id, status);
        CREATE INDEX IF NOT EXISTS idx_state_events_campaign
            ON campaign_state_events(campaign_id, sequence_number);
        CREATE INDEX IF NOT EXISTS idx_snapshots_campaign
            ON campaign_state_snapshots(campaign_id, last_event_sequence);
        ",
    )
    .context("Failed to create tables")?;
    Ok(())
}

// ── Row conversion helpers ───────────────────────────────────────────

pub(crate) fn conv_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

pub(crate) fn uuid_field(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| conv_err(idx, e.to_string()))
}

pub(crate) fn opt_uuid_field(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => Uuid::parse_str(&s)
            .map(Some)
            .map_err(|e| conv_err(idx, e.to_string())),
        None => Ok(None),
    }
}

pub(crate) fn ts_field(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conv_err(idx, e.to_string()))
}

pub(crate) fn opt_ts_field(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| conv_err(idx, e.to_string())),
        None => Ok(None),
    }
}

pub(crate) fn json_field(row: &Row<'_>, idx: usize) -> rusqlite::Result<serde_json::Value> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conv_err(idx, e.to_string()))
}

pub(crate) fn opt_json_field(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(s) => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| conv_err(idx, e.to_string())),
        None => Ok(None),
    }
}

pub(crate) fn ts_text(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn opt_ts_text(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(ts_text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_runs_migrations() {
        let store = CampaignStore::open_in_memory().unwrap();
        let conn = store.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN (
                    'campaigns', 'campaign_jobs', 'generated_domains',
                    'dns_validation_results', 'http_keyword_results',
                    'campaign_state_events', 'campaign_state_transitions',
                    'campaign_state_snapshots', 'domain_generation_config_states',
                    'personas', 'keyword_sets', 'keyword_rules')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 12);
    }

    #[test]
    fn open_on_disk_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("campaigns.db");
        {
            let _store = CampaignStore::open(&path).unwrap();
        }
        let _store = CampaignStore::open(&path).unwrap();
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        let store = CampaignStore::open_in_memory().unwrap();
        let result: Result<(), StoreError> = store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO keyword_sets (id, name, is_enabled, created_at)
                 VALUES ('ks1', 'x', 1, '2024-01-01T00:00:00Z')",
                [],
            )?;
            Err(StoreError::LockPoisoned)
        });
        assert!(result.is_err());
        let conn = store.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM keyword_sets", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
