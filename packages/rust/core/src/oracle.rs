//! Extraction oracle: page content in, structured partial record out.
//!
//! The [`ExtractionOracle`] trait is the seam the assembler and the profile
//! identity source call through. [`OpenRouterOracle`] is the production
//! implementation, a chat-completions client that asks the model for a JSON
//! object and parses whatever JSON block the reply carries.

use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use eventcatalog_crawler::PageContent;
use eventcatalog_shared::{
    AppConfig, CatalogError, EventDetails, EventRecord, OrganizerHints, OrganizerStub, Result,
    RetryPolicy, clean_text, normalize_date, normalize_ein, read_secret,
};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

/// Strips Markdown code fences around a JSON reply.
static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^```(?:json)?\s*$|```$").expect("fence regex"));

/// First `{ ... }` block in a reply.
static OBJECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("object regex"));

// ---------------------------------------------------------------------------
// Trait + types
// ---------------------------------------------------------------------------

/// Which record shape the oracle is asked to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaHint {
    /// Event fields plus whatever the page says about the organizer.
    Event,
    /// Organizer profile: legal name, contacts, socials.
    OrganizerProfile,
}

/// Fields the oracle recovered from one page. Every text field is cleaned;
/// dates are normalized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartialExtraction {
    pub name: Option<String>,
    pub date: Option<chrono::NaiveDate>,
    pub location: Option<String>,
    pub description: Option<String>,
    pub details: EventDetails,
    /// Organizer name (legal name for profile extractions).
    pub organizer_name: Option<String>,
    pub hints: OrganizerHints,
    /// Pages the oracle says hold more detail on the same event.
    pub related_urls: Vec<String>,
}

impl PartialExtraction {
    /// Turn an event extraction from `page_url` into a one-page event record.
    pub fn into_event(self, page_url: &str) -> EventRecord {
        let location = self.location.or_else(|| {
            let parts: Vec<&str> = [&self.details.venue_name, &self.details.venue_city]
                .into_iter()
                .filter_map(|p| p.as_deref())
                .collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        });

        let organizer = self.organizer_name.map(|name| OrganizerStub {
            name,
            hints: self.hints,
        });

        let mut record = EventRecord {
            name: self.name,
            date: self.date,
            location,
            description: self.description,
            details: self.details,
            organizer,
            ..Default::default()
        };
        record.source_urls.insert(page_url.to_string());
        record.refresh_canonical_id();
        record
    }
}

/// Oracle verdict for one page.
#[derive(Debug, Clone, PartialEq)]
pub enum OracleOutcome {
    Extracted(PartialExtraction),
    /// The page does not describe an event.
    NoEvent,
}

/// Oracle failure.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// The service cannot be used at all (auth, exhausted retries).
    #[error("oracle unavailable: {0}")]
    Unavailable(String),

    /// Every attempt timed out on this page.
    #[error("oracle timed out: {0}")]
    Timeout(String),

    /// The reply carried no usable JSON.
    #[error("malformed oracle reply: {0}")]
    Malformed(String),

    /// The service refused this request only (oversized page, bad input).
    #[error("oracle rejected request: {0}")]
    Rejected(String),
}

impl From<OracleError> for CatalogError {
    fn from(err: OracleError) -> Self {
        match err {
            OracleError::Unavailable(msg) => CatalogError::OracleUnavailable(msg),
            OracleError::Timeout(msg) => CatalogError::Network(format!("oracle timed out: {msg}")),
            OracleError::Malformed(msg) => CatalogError::parse(msg),
            OracleError::Rejected(msg) => {
                CatalogError::validation(format!("oracle rejected request: {msg}"))
            }
        }
    }
}

/// Structured extraction service.
#[async_trait]
pub trait ExtractionOracle: Send + Sync {
    async fn extract(
        &self,
        page: &PageContent,
        hint: SchemaHint,
    ) -> std::result::Result<OracleOutcome, OracleError>;
}

// ---------------------------------------------------------------------------
// Prompt + reply parsing
// ---------------------------------------------------------------------------

const EVENT_FIELDS: &[&str] = &[
    "is_event",
    "event_name",
    "event_date",
    "event_type",
    "description",
    "location",
    "venue_name",
    "venue_address",
    "venue_city",
    "venue_state",
    "venue_zip",
    "registration_url",
    "sponsorship_url",
    "sponsorship_tiers",
    "dress_code",
    "organizer_name",
    "organizer_ein",
    "organizer_website",
    "organizer_email",
    "organizer_phone",
    "contact_name",
    "contact_title",
    "contact_email",
    "socials",
    "related_urls",
];

const PROFILE_FIELDS: &[&str] = &[
    "legal_name",
    "ein",
    "website",
    "email",
    "phone",
    "contact_name",
    "contact_title",
    "contact_email",
    "socials",
];

/// Build the user prompt for `page`.
pub fn build_prompt(page: &PageContent, hint: SchemaHint) -> String {
    let (task, fields, notes) = match hint {
        SchemaHint::Event => (
            "Extract structured details of the fundraising event described on this web page, \
             and of the nonprofit organizing it.",
            EVENT_FIELDS,
            "Set \"is_event\" to false if the page does not describe a specific event. \
             \"event_date\" is YYYY-MM-DD. \"location\" is the venue and city on one line. \
             \"socials\" maps platform to handle or URL. \
             \"related_urls\" lists links on this page with more detail on the same event \
             (tickets, sponsorship, details).",
        ),
        SchemaHint::OrganizerProfile => (
            "Extract the profile of the nonprofit organization this web page belongs to.",
            PROFILE_FIELDS,
            "\"ein\" is the US tax ID (NN-NNNNNNN). \"socials\" maps platform to handle or URL. \
             \"contact_title\" is the title of the main contact person.",
        ),
    };

    let mut prompt = String::new();
    prompt.push_str(task);
    prompt.push_str("\nIf a field is unknown, use an empty string. Return ONLY a JSON object with these keys:\n");
    prompt.push_str(&fields.join(", "));
    prompt.push('\n');
    prompt.push_str(notes);
    prompt.push_str("\n\nSource URL: ");
    prompt.push_str(&page.url);
    if let Some(title) = &page.title {
        prompt.push_str("\nPage title: ");
        prompt.push_str(title);
    }
    prompt.push_str("\n\nCONTENT:\n");
    prompt.push_str(&page.text);
    prompt
}

/// Parse a reply that may be fenced or wrapped in prose.
pub fn parse_json_reply(reply: &str) -> std::result::Result<Value, OracleError> {
    let cleaned = FENCE_RE.replace_all(reply.trim(), "");
    let cleaned = cleaned.trim();
    if let Ok(value) = serde_json::from_str::<Value>(cleaned) {
        if value.is_object() {
            return Ok(value);
        }
    }
    OBJECT_RE
        .find(cleaned)
        .and_then(|m| serde_json::from_str::<Value>(m.as_str()).ok())
        .filter(Value::is_object)
        .ok_or_else(|| {
            OracleError::Malformed(format!(
                "no JSON object in reply: {}",
                cleaned.chars().take(120).collect::<String>()
            ))
        })
}

/// Interpret a parsed reply for `hint`.
pub fn interpret_reply(value: &Value, hint: SchemaHint) -> OracleOutcome {
    match hint {
        SchemaHint::Event => interpret_event(value),
        SchemaHint::OrganizerProfile => interpret_profile(value),
    }
}

fn interpret_event(value: &Value) -> OracleOutcome {
    if value.get("is_event").and_then(Value::as_bool) == Some(false) {
        return OracleOutcome::NoEvent;
    }

    let partial = PartialExtraction {
        name: text(value, "event_name"),
        date: text(value, "event_date").as_deref().and_then(normalize_date),
        location: text(value, "location"),
        description: text(value, "description"),
        details: EventDetails {
            event_type: text(value, "event_type"),
            venue_name: text(value, "venue_name"),
            venue_address: text(value, "venue_address"),
            venue_city: text(value, "venue_city"),
            venue_state: text(value, "venue_state"),
            venue_zip: text(value, "venue_zip"),
            registration_url: text(value, "registration_url"),
            sponsorship_url: text(value, "sponsorship_url"),
            sponsorship_tiers: text(value, "sponsorship_tiers"),
            dress_code: text(value, "dress_code"),
        },
        organizer_name: text(value, "organizer_name"),
        hints: OrganizerHints {
            ein: text(value, "organizer_ein").as_deref().and_then(normalize_ein),
            website: text(value, "organizer_website"),
            email: text(value, "organizer_email"),
            phone: text(value, "organizer_phone"),
            contact_name: text(value, "contact_name"),
            contact_title: text(value, "contact_title"),
            contact_email: text(value, "contact_email"),
            socials: socials(value),
        },
        related_urls: string_list(value, "related_urls"),
    };

    if partial == PartialExtraction::default() {
        return OracleOutcome::NoEvent;
    }
    OracleOutcome::Extracted(partial)
}

fn interpret_profile(value: &Value) -> OracleOutcome {
    let partial = PartialExtraction {
        organizer_name: text(value, "legal_name"),
        hints: OrganizerHints {
            ein: text(value, "ein").as_deref().and_then(normalize_ein),
            website: text(value, "website"),
            email: text(value, "email"),
            phone: text(value, "phone"),
            contact_name: text(value, "contact_name"),
            contact_title: text(value, "contact_title"),
            contact_email: text(value, "contact_email"),
            socials: socials(value),
        },
        ..Default::default()
    };
    OracleOutcome::Extracted(partial)
}

/// Cleaned string field; numbers are accepted as text.
fn text(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => clean_text(Some(s.as_str())),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => {
            let joined: Vec<String> = items
                .iter()
                .filter_map(|v| v.as_str().and_then(|s| clean_text(Some(s))))
                .collect();
            (!joined.is_empty()).then(|| joined.join("; "))
        }
        _ => None,
    }
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    match value.get(key) {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().and_then(|s| clean_text(Some(s))))
            .collect(),
        Some(Value::String(s)) => s
            .split([',', ' ', '\n'])
            .filter_map(|s| clean_text(Some(s)))
            .collect(),
        _ => Vec::new(),
    }
}

fn socials(value: &Value) -> BTreeMap<String, String> {
    let Some(Value::Object(map)) = value.get("socials") else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(platform, handle)| {
            let handle = clean_text(handle.as_str())?;
            Some((platform.trim().to_lowercase(), handle))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// OpenRouter client
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Failure of a single request, before retry classification.
enum CallError {
    Transient(String),
    Timeout(String),
    /// Client error specific to this request.
    Rejected(String),
    Fatal(String),
}

/// OpenRouter chat-completions oracle.
pub struct OpenRouterOracle {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    retry: RetryPolicy,
}

impl OpenRouterOracle {
    pub fn new(
        client: Client,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            retry,
        }
    }

    /// Build from config; the API key is read from the configured env var.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let api_key = read_secret(&config.openrouter.api_key_env, "OpenRouter")?;
        let client = eventcatalog_discovery::build_client(Duration::from_secs(
            config.pipeline.oracle_timeout_secs,
        ))?;
        Ok(Self::new(
            client,
            api_key,
            &config.openrouter.base_url,
            &config.openrouter.model,
            RetryPolicy::from(&config.openrouter),
        ))
    }

    async fn call(&self, prompt: &str) -> std::result::Result<String, CallError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.0,
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CallError::Timeout(e.to_string())
                } else if e.is_connect() {
                    CallError::Transient(e.to_string())
                } else {
                    CallError::Fatal(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = format!("HTTP {status}: {}", body.chars().take(200).collect::<String>());
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => CallError::Transient(detail),
                StatusCode::UNAUTHORIZED | StatusCode::PAYMENT_REQUIRED | StatusCode::FORBIDDEN => {
                    CallError::Fatal(detail)
                }
                s if s.is_server_error() => CallError::Transient(detail),
                s if s.is_client_error() => CallError::Rejected(detail),
                _ => CallError::Fatal(detail),
            });
        }

        let reply: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                CallError::Timeout(e.to_string())
            } else {
                CallError::Transient(format!("invalid response body: {e}"))
            }
        })?;

        Ok(reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[async_trait]
impl ExtractionOracle for OpenRouterOracle {
    #[instrument(skip_all, fields(url = %page.url, hint = ?hint))]
    async fn extract(
        &self,
        page: &PageContent,
        hint: SchemaHint,
    ) -> std::result::Result<OracleOutcome, OracleError> {
        let prompt = build_prompt(page, hint);

        let mut attempt = 1;
        let content = loop {
            match self.call(&prompt).await {
                Ok(content) => break content,
                Err(CallError::Fatal(msg)) => return Err(OracleError::Unavailable(msg)),
                Err(CallError::Rejected(msg)) => return Err(OracleError::Rejected(msg)),
                Err(CallError::Transient(msg) | CallError::Timeout(msg))
                    if attempt < self.retry.max_attempts =>
                {
                    let delay = self.retry.delay(attempt);
                    warn!(attempt, ?delay, error = %msg, "oracle call failed, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(CallError::Timeout(msg)) => return Err(OracleError::Timeout(msg)),
                Err(CallError::Transient(msg)) => {
                    return Err(OracleError::Unavailable(format!(
                        "gave up after {attempt} attempts: {msg}"
                    )));
                }
            }
        };

        if content.trim().is_empty() {
            debug!("empty oracle reply");
            return Ok(match hint {
                SchemaHint::Event => OracleOutcome::NoEvent,
                SchemaHint::OrganizerProfile => {
                    OracleOutcome::Extracted(PartialExtraction::default())
                }
            });
        }

        let value = parse_json_reply(&content)?;
        Ok(interpret_reply(&value, hint))
    }
}
