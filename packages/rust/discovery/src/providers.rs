//! Search provider clients.
//!
//! Each provider turns a query into an ordered list of [`RawHit`]s and
//! classifies its failures so the aggregator can decide whether to retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventcatalog_shared::{AppConfig, CatalogError, Result, read_secret};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

/// Default timeout for provider requests.
const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Google Custom Search returns at most this many results per request.
const CSE_MAX_NUM: u32 = 10;

/// User-Agent string for provider requests.
const USER_AGENT: &str = concat!("EventCatalog/", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// Trait + types
// ---------------------------------------------------------------------------

/// One provider result before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// Classified provider failure.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Rate limit, server error or timeout; worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Credentials rejected.
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    fn from_status(status: StatusCode, body: &str) -> Self {
        let detail = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Self::Transient(detail)
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Self::Auth(detail)
        } else {
            Self::Other(detail)
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Self::Transient(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

/// A web search backend.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Stable provider name, as used in config.
    fn name(&self) -> &str;

    /// Run one query. Hits come back in provider rank order.
    async fn search(&self, query: &str) -> std::result::Result<Vec<RawHit>, ProviderError>;
}

/// Build a reqwest client for provider calls.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|e| CatalogError::Network(format!("failed to build HTTP client: {e}")))
}

async fn get_json(
    request: reqwest::RequestBuilder,
) -> std::result::Result<Value, ProviderError> {
    let response = request.send().await.map_err(ProviderError::from_reqwest)?;
    let status = response.status();
    let body = response.text().await.map_err(ProviderError::from_reqwest)?;
    if !status.is_success() {
        return Err(ProviderError::from_status(status, &body));
    }
    serde_json::from_str(&body)
        .map_err(|e| ProviderError::Other(format!("invalid JSON response: {e}")))
}

fn str_field<'a>(item: &'a Value, keys: &[&str]) -> &'a str {
    keys.iter()
        .filter_map(|k| item.get(*k).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .unwrap_or("")
}

// ---------------------------------------------------------------------------
// SerpAPI
// ---------------------------------------------------------------------------

/// SerpAPI client (`/search.json`).
pub struct SerpApiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    engine: String,
    num: u32,
}

impl SerpApiProvider {
    pub fn new(
        client: Client,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        engine: impl Into<String>,
        num: u32,
    ) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            engine: engine.into(),
            num,
        }
    }
}

/// Extract hits from a SerpAPI reply: `organic_results`, else `local_results`.
fn parse_serpapi(data: &Value) -> Vec<RawHit> {
    let results = ["organic_results", "local_results"]
        .iter()
        .filter_map(|k| data.get(*k).and_then(Value::as_array))
        .find(|arr| !arr.is_empty());

    let Some(results) = results else {
        return Vec::new();
    };

    results
        .iter()
        .filter_map(|r| {
            let url = str_field(r, &["link", "url", "website"]);
            if url.is_empty() {
                return None;
            }
            Some(RawHit {
                url: url.to_string(),
                title: str_field(r, &["title", "name"]).to_string(),
                snippet: str_field(r, &["snippet", "description"]).to_string(),
            })
        })
        .collect()
}

#[async_trait]
impl SearchProvider for SerpApiProvider {
    fn name(&self) -> &str {
        "serpapi"
    }

    async fn search(&self, query: &str) -> std::result::Result<Vec<RawHit>, ProviderError> {
        let url = format!("{}/search.json", self.base_url);
        let num = self.num.to_string();
        let request = self.client.get(&url).query(&[
            ("engine", self.engine.as_str()),
            ("q", query),
            ("api_key", self.api_key.as_str()),
            ("num", num.as_str()),
        ]);

        let data = get_json(request).await?;
        let mut hits = parse_serpapi(&data);
        hits.truncate(self.num as usize);
        debug!(query, count = hits.len(), "serpapi results");
        Ok(hits)
    }
}

// ---------------------------------------------------------------------------
// Google Custom Search
// ---------------------------------------------------------------------------

/// Google Custom Search JSON API client (`/customsearch/v1`).
pub struct GoogleCseProvider {
    client: Client,
    api_key: String,
    engine_id: String,
    base_url: String,
    num: u32,
}

impl GoogleCseProvider {
    pub fn new(
        client: Client,
        api_key: impl Into<String>,
        engine_id: impl Into<String>,
        base_url: impl Into<String>,
        num: u32,
    ) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            engine_id: engine_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            num: num.clamp(1, CSE_MAX_NUM),
        }
    }
}

fn parse_cse(data: &Value) -> Vec<RawHit> {
    data.get("items")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let url = str_field(item, &["link"]);
                    (!url.is_empty()).then(|| RawHit {
                        url: url.to_string(),
                        title: str_field(item, &["title"]).to_string(),
                        snippet: str_field(item, &["snippet"]).to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl SearchProvider for GoogleCseProvider {
    fn name(&self) -> &str {
        "google_cse"
    }

    async fn search(&self, query: &str) -> std::result::Result<Vec<RawHit>, ProviderError> {
        let url = format!("{}/customsearch/v1", self.base_url);
        let num = self.num.to_string();
        let request = self.client.get(&url).query(&[
            ("key", self.api_key.as_str()),
            ("cx", self.engine_id.as_str()),
            ("q", query),
            ("num", num.as_str()),
        ]);

        let data = get_json(request).await?;
        let hits = parse_cse(&data);
        debug!(query, count = hits.len(), "google cse results");
        Ok(hits)
    }
}

// ---------------------------------------------------------------------------
// Construction from config
// ---------------------------------------------------------------------------

/// Build the configured providers in priority order.
///
/// A provider whose credentials are missing is skipped with a warning; having
/// none left is a config error.
pub fn providers_from_config(config: &AppConfig) -> Result<Vec<Arc<dyn SearchProvider>>> {
    let client = build_client(Duration::from_secs(DEFAULT_TIMEOUT_SECS))?;
    let num = config.search.results_per_query;
    let mut providers: Vec<Arc<dyn SearchProvider>> = Vec::new();

    for name in &config.search.providers {
        match name.as_str() {
            "serpapi" => match read_secret(&config.serpapi.api_key_env, "SerpAPI") {
                Ok(key) => providers.push(Arc::new(SerpApiProvider::new(
                    client.clone(),
                    key,
                    &config.serpapi.base_url,
                    &config.serpapi.engine,
                    num,
                ))),
                Err(e) => warn!(provider = %name, error = %e, "skipping search provider"),
            },
            "google_cse" => {
                let key = read_secret(&config.google_cse.api_key_env, "Google CSE");
                let cx = read_secret(&config.google_cse.engine_id_env, "Google CSE engine id");
                match (key, cx) {
                    (Ok(key), Ok(cx)) => providers.push(Arc::new(GoogleCseProvider::new(
                        client.clone(),
                        key,
                        cx,
                        &config.google_cse.base_url,
                        num,
                    ))),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!(provider = %name, error = %e, "skipping search provider")
                    }
                }
            }
            other => {
                return Err(CatalogError::config(format!(
                    "unknown search provider '{other}' (expected serpapi or google_cse)"
                )));
            }
        }
    }

    if providers.is_empty() {
        return Err(CatalogError::config(
            "no search provider is configured with credentials",
        ));
    }
    Ok(providers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> Client {
        build_client(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn serpapi_parses_organic_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search.json"))
            .and(query_param("q", "charity gala Chicago"))
            .and(query_param("api_key", "k"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "organic_results": [
                    {"title": "Spring Gala", "link": "https://a.org/gala", "snippet": "Join us"},
                    {"title": "No link"},
                    {"title": "Ball", "link": "https://b.org/ball"}
                ]
            })))
            .mount(&server)
            .await;

        let provider = SerpApiProvider::new(client(), "k", server.uri(), "google", 10);
        let hits = provider.search("charity gala Chicago").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://a.org/gala");
        assert_eq!(hits[0].snippet, "Join us");
        assert_eq!(hits[1].snippet, "");
    }

    #[tokio::test]
    async fn serpapi_falls_back_to_local_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/search.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "organic_results": [],
                "local_results": [
                    {"name": "Lakeview Hall", "website": "https://hall.org", "description": "Venue"}
                ]
            })))
            .mount(&server)
            .await;

        let provider = SerpApiProvider::new(client(), "k", server.uri(), "google", 10);
        let hits = provider.search("gala").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Lakeview Hall");
        assert_eq!(hits[0].url, "https://hall.org");
    }

    #[tokio::test]
    async fn status_codes_are_classified() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(query_param("q", "limited"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("q", "denied"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(query_param("q", "broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = SerpApiProvider::new(client(), "k", server.uri(), "google", 10);
        assert!(provider.search("limited").await.unwrap_err().is_transient());
        assert!(matches!(
            provider.search("denied").await.unwrap_err(),
            ProviderError::Auth(_)
        ));
        assert!(provider.search("broken").await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn google_cse_parses_items() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/customsearch/v1"))
            .and(query_param("cx", "engine"))
            .and(query_param("num", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {"title": "Spring Gala", "link": "https://a.org/gala", "snippet": "Tickets"}
                ]
            })))
            .mount(&server)
            .await;

        let provider = GoogleCseProvider::new(client(), "k", "engine", server.uri(), 100);
        let hits = provider.search("gala").await.unwrap();
        assert_eq!(
            hits,
            vec![RawHit {
                url: "https://a.org/gala".into(),
                title: "Spring Gala".into(),
                snippet: "Tickets".into(),
            }]
        );
    }

    #[tokio::test]
    async fn empty_reply_is_no_hits() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .mount(&server)
            .await;

        let provider = GoogleCseProvider::new(client(), "k", "cx", server.uri(), 10);
        assert!(provider.search("gala").await.unwrap().is_empty());
    }

    #[test]
    fn unknown_provider_name_is_config_error() {
        let mut config = AppConfig::default();
        config.search.providers = vec!["bing".into()];
        let err = providers_from_config(&config).err().expect("should fail");
        assert!(err.to_string().contains("unknown search provider"));
    }
}
