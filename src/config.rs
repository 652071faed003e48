//! Runtime settings.
//!
//! Layered the usual way: built-in defaults, then an optional TOML file,
//! then `LEADSTUDIO_*` environment variables. The binary loads `.env` via
//! `dotenvy` before reading settings, so either mechanism works.
//!
//! ```toml
//! database_path = "leadstudio.db"
//!
//! [worker]
//! count = 4
//! poll_interval_seconds = 5
//! error_retry_delay_seconds = 30
//! max_job_retries = 3
//! job_processing_timeout_minutes = 15
//! dns_subtask_concurrency = 75
//! http_keyword_subtask_concurrency = 50
//!
//! [batch]
//! generation_batch_size = 100
//! dns_batch_size = 100
//! http_batch_size = 50
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_path: PathBuf,
    pub worker: WorkerSettings,
    pub batch: BatchSettings,
    pub limits: LimitSettings,
    pub events: EventSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("leadstudio.db"),
            worker: WorkerSettings::default(),
            batch: BatchSettings::default(),
            limits: LimitSettings::default(),
            events: EventSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Prefix for worker identifiers (`<pool_id>-<index>`).
    pub pool_id: String,
    pub count: usize,
    pub poll_interval_seconds: u64,
    pub error_retry_delay_seconds: u64,
    pub max_job_retries: i64,
    pub job_processing_timeout_minutes: u64,
    pub dns_subtask_concurrency: usize,
    pub http_keyword_subtask_concurrency: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            pool_id: "worker".to_string(),
            count: 4,
            poll_interval_seconds: 5,
            error_retry_delay_seconds: 30,
            max_job_retries: 3,
            job_processing_timeout_minutes: 15,
            dns_subtask_concurrency: 75,
            http_keyword_subtask_concurrency: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    pub generation_batch_size: usize,
    pub dns_batch_size: usize,
    pub http_batch_size: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            generation_batch_size: 100,
            dns_batch_size: 100,
            http_batch_size: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub max_active_campaigns: i64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_active_campaigns: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub channel_capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
        }
    }
}

impl Settings {
    /// Load settings: defaults, then the TOML file (if given), then the
    /// environment.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut settings = match config_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("Failed to parse config file {}", path.display()))?
            }
            None => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    fn apply_env(&mut self) {
        env_override("LEADSTUDIO_DATABASE_PATH", &mut self.database_path);
        env_override("LEADSTUDIO_WORKER_POOL_ID", &mut self.worker.pool_id);
        env_override("LEADSTUDIO_WORKER_COUNT", &mut self.worker.count);
        env_override(
            "LEADSTUDIO_WORKER_POLL_INTERVAL_SECONDS",
            &mut self.worker.poll_interval_seconds,
        );
        env_override(
            "LEADSTUDIO_WORKER_ERROR_RETRY_DELAY_SECONDS",
            &mut self.worker.error_retry_delay_seconds,
        );
        env_override(
            "LEADSTUDIO_WORKER_MAX_JOB_RETRIES",
            &mut self.worker.max_job_retries,
        );
        env_override(
            "LEADSTUDIO_WORKER_JOB_PROCESSING_TIMEOUT_MINUTES",
            &mut self.worker.job_processing_timeout_minutes,
        );
        env_override(
            "LEADSTUDIO_WORKER_DNS_SUBTASK_CONCURRENCY",
            &mut self.worker.dns_subtask_concurrency,
        );
        env_override(
            "LEADSTUDIO_WORKER_HTTP_KEYWORD_SUBTASK_CONCURRENCY",
            &mut self.worker.http_keyword_subtask_concurrency,
        );
        env_override(
            "LEADSTUDIO_GENERATION_BATCH_SIZE",
            &mut self.batch.generation_batch_size,
        );
        env_override("LEADSTUDIO_DNS_BATCH_SIZE", &mut self.batch.dns_batch_size);
        env_override(
            "LEADSTUDIO_HTTP_BATCH_SIZE",
            &mut self.batch.http_batch_size,
        );
        env_override(
            "LEADSTUDIO_MAX_ACTIVE_CAMPAIGNS",
            &mut self.limits.max_active_campaigns,
        );
    }
}

fn env_override<T: FromStr>(key: &str, target: &mut T) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *target = value,
        Err(_) => warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.worker.poll_interval_seconds, 5);
        assert_eq!(settings.worker.error_retry_delay_seconds, 30);
        assert_eq!(settings.worker.max_job_retries, 3);
        assert_eq!(settings.worker.job_processing_timeout_minutes, 15);
        assert_eq!(settings.worker.dns_subtask_concurrency, 75);
        assert_eq!(settings.worker.http_keyword_subtask_concurrency, 50);
        assert_eq!(settings.batch.generation_batch_size, 100);
    }

    #[test]
    fn partial_toml_keeps_defaults_for_the_rest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "database_path = \"/tmp/pipeline.db\"\n\n[worker]\ncount = 2\npoll_interval_seconds = 1"
        )
        .unwrap();
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.database_path, PathBuf::from("/tmp/pipeline.db"));
        assert_eq!(settings.worker.count, 2);
        assert_eq!(settings.worker.poll_interval_seconds, 1);
        // Untouched sections keep their defaults.
        assert_eq!(settings.worker.max_job_retries, 3);
        assert_eq!(settings.batch.http_batch_size, 50);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(Settings::load(Some(Path::new("/nonexistent/leadstudio.toml"))).is_err());
    }
}
