//! DNS validation seam.
//!
//! The actual resolver is an external collaborator behind [`DnsClient`];
//! the core wraps it in a [`DnsValidator`] that applies the persona's
//! timeout and retry policy and normalizes every failure mode into a
//! [`DnsOutcome`]. Validators are cached per persona-config fingerprint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::models::DnsStatus;

/// Persona payload understood by the DNS validator. Unknown fields are
/// ignored so persona configs can carry operator metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsPersonaConfig {
    #[serde(default)]
    pub resolvers: Vec<String>,
    #[serde(default = "default_query_timeout")]
    pub query_timeout_seconds: u64,
    #[serde(default = "default_record_types")]
    pub record_types: Vec<String>,
    #[serde(default)]
    pub max_retries: u32,
}

fn default_query_timeout() -> u64 {
    5
}

fn default_record_types() -> Vec<String> {
    vec!["A".to_string()]
}

impl Default for DnsPersonaConfig {
    fn default() -> Self {
        Self {
            resolvers: Vec::new(),
            query_timeout_seconds: default_query_timeout(),
            record_types: default_record_types(),
            max_retries: 0,
        }
    }
}

impl DnsPersonaConfig {
    /// Parse a persona's opaque config payload, falling back to defaults
    /// for anything unspecified.
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

#[derive(Debug, Clone)]
pub struct DnsOutcome {
    pub status: DnsStatus,
    /// Opaque record data, persisted verbatim.
    pub records: Value,
    pub message: Option<String>,
}

impl DnsOutcome {
    pub fn resolved(records: Value) -> Self {
        Self {
            status: DnsStatus::Resolved,
            records,
            message: None,
        }
    }

    pub fn unresolved(message: &str) -> Self {
        Self {
            status: DnsStatus::Unresolved,
            records: json!([]),
            message: Some(message.to_string()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            status: DnsStatus::Error,
            records: json!([]),
            message: Some(message),
        }
    }

    pub fn timeout(message: String) -> Self {
        Self {
            status: DnsStatus::Timeout,
            records: json!([]),
            message: Some(message),
        }
    }
}

/// External resolver boundary.
#[async_trait]
pub trait DnsClient: Send + Sync {
    async fn resolve(&self, domain: &str, config: &DnsPersonaConfig) -> Result<DnsOutcome>;
}

/// A persona-group validator: one shared client plus one parsed config.
pub struct DnsValidator {
    client: Arc<dyn DnsClient>,
    config: DnsPersonaConfig,
}

impl DnsValidator {
    pub fn new(client: Arc<dyn DnsClient>, config: DnsPersonaConfig) -> Self {
        Self { client, config }
    }

    /// Resolve with the persona's timeout and retry budget. Never errors:
    /// client failures become `error` outcomes, deadline misses `timeout`.
    pub async fn validate(&self, domain: &str) -> DnsOutcome {
        let deadline = Duration::from_secs(self.config.query_timeout_seconds.max(1));
        let mut last = DnsOutcome::error("no resolution attempted".to_string());
        for _ in 0..=self.config.max_retries {
            match tokio::time::timeout(deadline, self.client.resolve(domain, &self.config)).await {
                Err(_) => {
                    last = DnsOutcome::timeout(format!(
                        "DNS query for {domain} exceeded {}s",
                        deadline.as_secs()
                    ));
                }
                Ok(Err(e)) => {
                    last = DnsOutcome::error(format!("{e:#}"));
                }
                Ok(Ok(outcome)) => {
                    if outcome.status == DnsStatus::Resolved {
                        return outcome;
                    }
                    last = outcome;
                }
            }
        }
        last
    }
}

/// Default client backed by the operating system resolver. Persona
/// `resolvers` entries are advisory here; a dedicated resolver library can
/// be swapped in behind the same trait.
#[derive(Debug, Default)]
pub struct SystemDnsClient;

#[async_trait]
impl DnsClient for SystemDnsClient {
    async fn resolve(&self, domain: &str, _config: &DnsPersonaConfig) -> Result<DnsOutcome> {
        match tokio::net::lookup_host((domain, 80)).await {
            Ok(addresses) => {
                let records: Vec<Value> = addresses
                    .map(|addr| {
                        let record_type = if addr.is_ipv6() { "AAAA" } else { "A" };
                        json!({"type": record_type, "value": addr.ip().to_string()})
                    })
                    .collect();
                if records.is_empty() {
                    Ok(DnsOutcome::unresolved("no addresses returned"))
                } else {
                    Ok(DnsOutcome::resolved(Value::Array(records)))
                }
            }
            Err(e) => Ok(DnsOutcome::unresolved(&e.to_string())),
        }
    }
}
