//! Application configuration for the event catalog.
//!
//! User config lives at `~/.eventcatalog/eventcatalog.toml`.
//! CLI flags override config file values, which override defaults.
//! API keys are never stored in the file, only the names of the env vars
//! that hold them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "eventcatalog.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".eventcatalog";

/// Chicago fundraising queries used when the config names none.
const DEFAULT_QUERIES: &[&str] = &[
    "auction gala Chicago Illinois",
    "fundraising event Chicago Illinois",
    "charity gala Chicago Illinois",
    "charity fundraiser Chicago 2025",
    "nonprofit gala Chicago 2025",
    "fundraising gala Chicago 2025",
    "charity golf tournament Chicago",
    "charity run Chicago 2025",
    "benefit concert Chicago 2025",
    "charity ball Chicago 2025",
    "annual gala Chicago nonprofit",
    "foundation gala Chicago",
    "philanthropy gala Chicago",
    "black tie gala Chicago",
    "charity dinner Chicago 2025",
    "fundraiser dinner Chicago",
    "nonprofit fundraiser Chicago",
    "gala fundraiser Chicago Illinois 2025",
    "charity auction Chicago",
    "benefit gala Chicago Illinois",
    "charity banquet Chicago",
    "fundraising walk Chicago 2025",
    "foundation fundraising event Chicago",
    "charity festival Chicago 2025",
    "community fundraiser Chicago",
    "corporate philanthropy event Chicago",
    "gala tickets chicago charity",
    "nonprofit events Chicago 2025",
    "charity gala \"Chicago, IL\"",
    "Chicago \"fundraising gala\" site:eventbrite.com",
];

// ---------------------------------------------------------------------------
// Config structs (matching eventcatalog.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub serpapi: SerpApiConfig,

    #[serde(default)]
    pub google_cse: GoogleCseConfig,

    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Providers in priority order; the first listed wins on duplicates.
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,

    #[serde(default = "default_queries")]
    pub queries: Vec<String>,

    /// Appended to queries that do not already mention it.
    #[serde(default = "default_location")]
    pub location: String,

    #[serde(default = "default_results_per_query")]
    pub results_per_query: u32,

    /// Cap on new hits accepted in one run.
    #[serde(default = "default_max_hits_per_run")]
    pub max_hits_per_run: usize,

    /// Attempts per provider call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Pause between consecutive queries.
    #[serde(default = "default_query_pause_ms")]
    pub query_pause_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            queries: default_queries(),
            location: default_location(),
            results_per_query: default_results_per_query(),
            max_hits_per_run: default_max_hits_per_run(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            query_pause_ms: default_query_pause_ms(),
        }
    }
}

fn default_providers() -> Vec<String> {
    vec!["serpapi".into(), "google_cse".into()]
}
fn default_queries() -> Vec<String> {
    DEFAULT_QUERIES.iter().map(|q| (*q).to_string()).collect()
}
fn default_location() -> String {
    "Chicago, IL".into()
}
fn default_results_per_query() -> u32 {
    100
}
fn default_max_hits_per_run() -> usize {
    1000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    500
}
fn default_query_pause_ms() -> u64 {
    1000
}

/// `[serpapi]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerpApiConfig {
    /// Name of the env var holding the API key.
    #[serde(default = "default_serpapi_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_serpapi_base_url")]
    pub base_url: String,

    #[serde(default = "default_serpapi_engine")]
    pub engine: String,
}

impl Default for SerpApiConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_serpapi_key_env(),
            base_url: default_serpapi_base_url(),
            engine: default_serpapi_engine(),
        }
    }
}

fn default_serpapi_key_env() -> String {
    "SERPAPI_KEY".into()
}
fn default_serpapi_base_url() -> String {
    "https://serpapi.com".into()
}
fn default_serpapi_engine() -> String {
    "google".into()
}

/// `[google_cse]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoogleCseConfig {
    #[serde(default = "default_cse_key_env")]
    pub api_key_env: String,

    /// Name of the env var holding the search engine id (`cx`).
    #[serde(default = "default_cse_engine_env")]
    pub engine_id_env: String,

    #[serde(default = "default_cse_base_url")]
    pub base_url: String,
}

impl Default for GoogleCseConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_cse_key_env(),
            engine_id_env: default_cse_engine_env(),
            base_url: default_cse_base_url(),
        }
    }
}

fn default_cse_key_env() -> String {
    "GOOGLE_CSE_API_KEY".into()
}
fn default_cse_engine_env() -> String {
    "GOOGLE_CSE_ID".into()
}
fn default_cse_base_url() -> String {
    "https://www.googleapis.com".into()
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for event and organizer extraction.
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_openrouter_base_url")]
    pub base_url: String,

    /// Attempts per extraction call before the oracle counts as unavailable.
    #[serde(default = "default_oracle_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_oracle_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            model: default_model(),
            base_url: default_openrouter_base_url(),
            max_attempts: default_oracle_attempts(),
            backoff_ms: default_oracle_backoff_ms(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_openrouter_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_oracle_attempts() -> u32 {
    4
}
fn default_oracle_backoff_ms() -> u64 {
    1000
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Units processed concurrently.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Pages visited per event, seed included.
    #[serde(default = "default_max_pages")]
    pub max_pages_per_event: usize,

    /// Link hops followed from the seed page.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_oracle_timeout")]
    pub oracle_timeout_secs: u64,

    /// Characters of page text handed to the oracle.
    #[serde(default = "default_content_chars")]
    pub content_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_pages_per_event: default_max_pages(),
            max_depth: default_max_depth(),
            fetch_timeout_secs: default_fetch_timeout(),
            oracle_timeout_secs: default_oracle_timeout(),
            content_chars: default_content_chars(),
        }
    }
}

fn default_workers() -> usize {
    4
}
fn default_max_pages() -> usize {
    6
}
fn default_max_depth() -> u32 {
    2
}
fn default_fetch_timeout() -> u64 {
    20
}
fn default_oracle_timeout() -> u64 {
    60
}
fn default_content_chars() -> usize {
    4000
}

/// `[resolver]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Delay before the single retry of a failed source.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Identity sources to consult. Order is irrelevant: sources always run
    /// most authoritative first.
    #[serde(default = "default_sources")]
    pub sources: Vec<String>,

    /// Search results inspected per lookup.
    #[serde(default = "default_results_per_lookup")]
    pub results_per_lookup: u32,

    /// Fetch the top result page when titles and snippets carry no EIN.
    #[serde(default = "default_true")]
    pub fetch_result_pages: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            retry_backoff_ms: default_retry_backoff_ms(),
            sources: default_sources(),
            results_per_lookup: default_results_per_lookup(),
            fetch_result_pages: true,
        }
    }
}

fn default_retry_backoff_ms() -> u64 {
    1000
}
fn default_sources() -> Vec<String> {
    [
        "irs_registry",
        "causeiq",
        "charity_navigator",
        "web_search",
        "oracle_profile",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}
fn default_results_per_lookup() -> u32 {
    5
}
fn default_true() -> bool {
    true
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file; a leading `~/` expands to the home directory.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.eventcatalog/catalog.db".into()
}

impl StorageConfig {
    /// Database path with `~/` expanded.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match self.db_path.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir()
                    .ok_or_else(|| CatalogError::config("could not determine home directory"))?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.db_path)),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy (runtime, derived from config sections)
// ---------------------------------------------------------------------------

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never below 1.
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_backoff,
        }
    }

    /// No retries, no waiting.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, ...
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1u32 << exp)
    }
}

impl From<&SearchConfig> for RetryPolicy {
    fn from(config: &SearchConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.backoff_ms))
    }
}

impl From<&OpenRouterConfig> for RetryPolicy {
    fn from(config: &OpenRouterConfig) -> Self {
        Self::new(config.max_attempts, Duration::from_millis(config.backoff_ms))
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.eventcatalog/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| CatalogError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.eventcatalog/eventcatalog.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CatalogError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| CatalogError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CatalogError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CatalogError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CatalogError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read a non-empty secret from the named env var.
pub fn read_secret(var_name: &str, service: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(CatalogError::config(format!(
            "{service} API key not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Check that the OpenRouter API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    read_secret(&config.openrouter.api_key_env, "OpenRouter").map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
        assert!(toml_str.contains("SERPAPI_KEY"));
        assert!(toml_str.contains("Chicago, IL"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.pipeline.max_pages_per_event, 6);
        assert_eq!(parsed.search.max_hits_per_run, 1000);
        assert_eq!(parsed.search.providers, vec!["serpapi", "google_cse"]);
        assert_eq!(parsed.search.queries.len(), DEFAULT_QUERIES.len());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[search]
providers = ["google_cse"]
queries = ["charity gala"]

[pipeline]
workers = 8
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.search.providers, vec!["google_cse"]);
        assert_eq!(config.search.location, "Chicago, IL");
        assert_eq!(config.pipeline.workers, 8);
        assert_eq!(config.pipeline.content_chars, 4000);
        assert_eq!(config.resolver.sources.len(), 5);
    }

    #[test]
    fn retry_policy_backoff_doubles() {
        let policy = RetryPolicy::new(4, Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn storage_path_expands_home() {
        let storage = StorageConfig {
            db_path: "/tmp/catalog.db".into(),
        };
        assert_eq!(storage.resolved_path().unwrap(), PathBuf::from("/tmp/catalog.db"));

        let default = StorageConfig::default().resolved_path().unwrap();
        assert!(default.ends_with(".eventcatalog/catalog.db"));
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.openrouter.api_key_env = "EC_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
