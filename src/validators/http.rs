//! HTTP validation seam.
//!
//! Fetching is behind [`HttpFetcher`]; the production implementation keeps
//! one connection-pooled `reqwest` client per persona-config/proxy pair in
//! a bounded cache. Proxy selection is behind [`ProxyProvider`] — the core
//! asks for a proxy and gets one, or degrades to a direct fetch.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use super::{ValidatorCache, persona_fingerprint};

const CLIENT_CACHE_CAPACITY: usize = 32;
const SNIPPET_LENGTH: usize = 200;

/// Persona payload understood by the HTTP fetcher. Unknown fields are
/// ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpPersonaConfig {
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub follow_redirects: bool,
    #[serde(default = "default_max_idle")]
    pub max_idle_per_host: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
}

fn default_request_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_max_idle() -> usize {
    8
}

fn default_idle_timeout() -> u64 {
    90
}

impl Default for HttpPersonaConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            headers: BTreeMap::new(),
            request_timeout_seconds: default_request_timeout(),
            follow_redirects: true,
            max_idle_per_host: default_max_idle(),
            idle_timeout_seconds: default_idle_timeout(),
            verify_tls: true,
        }
    }
}

impl HttpPersonaConfig {
    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

/// A proxy picked by the external proxy manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub id: Uuid,
    pub url: String,
}

#[async_trait]
pub trait ProxyProvider: Send + Sync {
    async fn select(&self, pool_id: Uuid) -> Result<ProxyEndpoint>;
}

/// Provider used when no proxy infrastructure is wired up; every selection
/// fails, which the processors degrade to direct fetches.
#[derive(Debug, Default)]
pub struct NoProxyPools;

#[async_trait]
impl ProxyProvider for NoProxyPools {
    async fn select(&self, pool_id: Uuid) -> Result<ProxyEndpoint> {
        anyhow::bail!("no proxy pool configured (requested pool {pool_id})")
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpFetchOutcome {
    pub is_success: bool,
    pub status_code: Option<u16>,
    pub headers: Option<Value>,
    pub body: Option<String>,
    pub error: Option<String>,
    /// The request never left the process (URL/client setup failure).
    pub failed_before_request: bool,
}

impl HttpFetchOutcome {
    pub fn success(status_code: u16, headers: Value, body: String) -> Self {
        Self {
            is_success: true,
            status_code: Some(status_code),
            headers: Some(headers),
            body: Some(body),
            ..Default::default()
        }
    }

    pub fn http_error(status_code: u16, headers: Value) -> Self {
        Self {
            status_code: Some(status_code),
            headers: Some(headers),
            ..Default::default()
        }
    }

    pub fn transport_error(message: String) -> Self {
        Self {
            error: Some(message),
            ..Default::default()
        }
    }

    pub fn setup_error(message: String) -> Self {
        Self {
            error: Some(message),
            failed_before_request: true,
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        config: &HttpPersonaConfig,
        proxy: Option<&ProxyEndpoint>,
    ) -> HttpFetchOutcome;
}

/// Production fetcher: pooled, kept-alive clients cached per
/// persona-config/proxy pair.
pub struct ReqwestFetcher {
    clients: ValidatorCache<Option<reqwest::Client>>,
}

impl Default for ReqwestFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestFetcher {
    pub fn new() -> Self {
        Self {
            clients: ValidatorCache::new(CLIENT_CACHE_CAPACITY),
        }
    }

    fn build_client(
        config: &HttpPersonaConfig,
        proxy: Option<&ProxyEndpoint>,
    ) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                warn!(header = %name, "skipping invalid persona header name");
                continue;
            };
            let Ok(value) = HeaderValue::from_str(value) else {
                warn!(header = %name, "skipping invalid persona header value");
                continue;
            };
            headers.insert(name, value);
        }

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.request_timeout_seconds.max(1)))
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .redirect(if config.follow_redirects {
                reqwest::redirect::Policy::limited(5)
            } else {
                reqwest::redirect::Policy::none()
            })
            .danger_accept_invalid_certs(!config.verify_tls);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(&proxy.url)?);
        }
        Ok(builder.build()?)
    }

    fn client_for(
        &self,
        config: &HttpPersonaConfig,
        proxy: Option<&ProxyEndpoint>,
    ) -> Option<reqwest::Client> {
        let config_value = match serde_json::to_value(config) {
            Ok(value) => value,
            Err(_) => Value::Null,
        };
        let key = format!(
            "{}|{}",
            persona_fingerprint(&config_value),
            proxy.map(|p| p.url.as_str()).unwrap_or("-")
        );
        let slot = self.clients.get_or_insert_with(&key, || {
            match Self::build_client(config, proxy) {
                Ok(client) => Some(client),
                Err(e) => {
                    warn!(error = %e, "failed to build HTTP client for persona");
                    None
                }
            }
        });
        slot.as_ref().clone()
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn fetch(
        &self,
        url: &str,
        config: &HttpPersonaConfig,
        proxy: Option<&ProxyEndpoint>,
    ) -> HttpFetchOutcome {
        let Some(client) = self.client_for(config, proxy) else {
            return HttpFetchOutcome::setup_error(format!(
                "could not build HTTP client for {url}"
            ));
        };
        let response = match client.get(url).send().await {
            Ok(response) => response,
            Err(e) => return HttpFetchOutcome::transport_error(format!("{e:#}")),
        };
        let status = response.status();
        let headers = headers_to_json(response.headers());
        match response.text().await {
            Ok(body) if status.is_success() => {
                HttpFetchOutcome::success(status.as_u16(), headers, body)
            }
            Ok(_) => HttpFetchOutcome::http_error(status.as_u16(), headers),
            Err(e) => HttpFetchOutcome {
                status_code: Some(status.as_u16()),
                headers: Some(headers),
                error: Some(format!("failed to read body: {e:#}")),
                ..Default::default()
            },
        }
    }
}

fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = Map::new();
    for (name, value) in headers {
        map.insert(
            name.as_str().to_string(),
            Value::String(value.to_str().unwrap_or("<binary>").to_string()),
        );
    }
    Value::Object(map)
}

/// `<title>` contents, if present.
pub fn extract_title(body: &str) -> Option<String> {
    static TITLE: OnceLock<Regex> = OnceLock::new();
    let regex = TITLE.get_or_init(|| {
        Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("title regex is valid")
    });
    regex
        .captures(body)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|title| !title.is_empty())
}

/// First characters of the body with markup stripped and whitespace
/// collapsed, for result listings.
pub fn extract_snippet(body: &str) -> Option<String> {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    let regex =
        TAGS.get_or_init(|| Regex::new(r"<[^>]*>").expect("tag regex is valid"));
    let stripped = regex.replace_all(body, " ");
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(collapsed.chars().take(SNIPPET_LENGTH).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_parses_with_defaults() {
        let config = HttpPersonaConfig::from_value(&json!({
            "user_agent": "LeadBot/1.0",
            "headers": {"accept-language": "en-US"}
        }))
        .unwrap();
        assert_eq!(config.user_agent.as_deref(), Some("LeadBot/1.0"));
        assert_eq!(config.request_timeout_seconds, 30);
        assert!(config.follow_redirects);
        assert!(config.verify_tls);
    }

    #[test]
    fn title_extraction_handles_attributes_and_case() {
        let body = "<html><head><TITLE data-x=\"1\"> Acme Widgets </TITLE></head></html>";
        assert_eq!(extract_title(body).as_deref(), Some("Acme Widgets"));
        assert_eq!(extract_title("<html><body>no title</body></html>"), None);
    }

    #[test]
    fn snippet_strips_markup_and_collapses_whitespace() {
        let body = "<p>Buy   our\n<b>widgets</b></p>";
        assert_eq!(extract_snippet(body).as_deref(), Some("Buy our widgets"));
        assert_eq!(extract_snippet("<br/>"), None);
    }

    #[test]
    fn snippet_is_bounded() {
        let body = "word ".repeat(200);
        let snippet = extract_snippet(&body).unwrap();
        assert!(snippet.chars().count() <= SNIPPET_LENGTH);
    }

    #[tokio::test]
    async fn no_proxy_provider_always_fails_selection() {
        let provider = NoProxyPools;
        assert!(provider.select(Uuid::new_v4()).await.is_err());
    }

    #[test]
    fn outcome_constructors_set_flags() {
        let ok = HttpFetchOutcome::success(200, json!({}), "<html></html>".into());
        assert!(ok.is_success);
        let bad = HttpFetchOutcome::http_error(503, json!({}));
        assert!(!bad.is_success);
        assert_eq!(bad.status_code, Some(503));
        let before = HttpFetchOutcome::setup_error("bad url".into());
        assert!(before.failed_before_request);
    }
}
